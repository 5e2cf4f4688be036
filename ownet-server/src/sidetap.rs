//! Side-tap: copies of every connection's traffic, sent to a monitoring listener.
//!
//! Each copy starts with a [`SideHeader`] naming the connection it was taken from,
//! followed by the request or the response exactly as encoded on the wire. Keep-alives
//! are not copied.
//!
//! The side connection is opened by the first request copy, shared by all connections of
//! the server and dropped when a write fails. Nothing that happens on it reaches clients.
use std::{
    io::{self, Read},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use ownet_protocol::{Request, Response, Version};
use tokio::{io::AsyncWriteExt, net::TcpStream, sync::Mutex, time::timeout};

/// Room for one address in the side header, NUL padded
pub const ADDRESS_LEN: usize = 120;
/// Version word, host address and peer address
pub const SIDE_HEADER_LEN: usize = 4 + 2 * ADDRESS_LEN;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Prefix of every copy.
///
/// The version word has the side-tap flag set and the length of the peer address in the
/// token count bits. Response copies also carry the server-message flag.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SideHeader {
    pub version: Version,
    /// Server end of the tapped connection
    pub host: String,
    /// Client end of the tapped connection
    pub peer: String,
}

fn put_address(out: &mut Vec<u8>, text: &str) {
    let bytes = &text.as_bytes()[..text.len().min(ADDRESS_LEN - 1)];
    out.extend_from_slice(bytes);
    out.resize(out.len() + ADDRESS_LEN - bytes.len(), 0);
}

fn take_address(buf: &[u8]) -> String {
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

impl SideHeader {
    fn new(host: SocketAddr, peer: SocketAddr, response: bool) -> SideHeader {
        let host = host.to_string();
        let peer = peer.to_string();
        let length = peer.len().min(ADDRESS_LEN - 1) as u16;
        let tapped = Version::default().with_sidetap(true);
        let version = if response {
            tapped.with_tokens(length)
        } else {
            Version::from_bits(tapped.bits() | length as u32)
        };
        SideHeader {
            version,
            host,
            peer,
        }
    }

    pub fn is_response(&self) -> bool {
        self.version.is_server_message()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SIDE_HEADER_LEN);
        out.extend_from_slice(&self.version.bits().to_be_bytes());
        put_address(&mut out, &self.host);
        put_address(&mut out, &self.peer);
        out
    }

    /// Reads one header, as a side-tap listener would.
    pub fn read_from(reader: &mut impl Read) -> io::Result<SideHeader> {
        let mut buf = [0u8; SIDE_HEADER_LEN];
        reader.read_exact(&mut buf)?;
        let version = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        Ok(SideHeader {
            version: Version::from_bits(version),
            host: take_address(&buf[4..4 + ADDRESS_LEN]),
            peer: take_address(&buf[4 + ADDRESS_LEN..]),
        })
    }
}

/// The connection to the side-tap listener, shared by the whole server.
#[derive(Debug)]
pub struct SideChannel {
    addr: SocketAddr,
    stream: Mutex<Option<TcpStream>>,
}

impl SideChannel {
    pub fn new(addr: SocketAddr) -> SideChannel {
        SideChannel {
            addr,
            stream: Mutex::new(None),
        }
    }

    /// Writes one copy. Only request copies may open the connection, so a listener never
    /// sees a response without its request.
    async fn deliver(&self, copy: &[u8], connect: bool) {
        let mut stream = self.stream.lock().await;
        if stream.is_none() {
            if !connect {
                return;
            }
            match timeout(CONNECT_TIMEOUT, TcpStream::connect(self.addr)).await {
                Ok(Ok(tcp)) => {
                    log::info!("Side-tap connected to {}", self.addr);
                    *stream = Some(tcp);
                }
                Ok(Err(e)) => {
                    log::debug!("Side-tap {} unreachable: {}", self.addr, e);
                    return;
                }
                Err(_) => {
                    log::debug!("Side-tap {} did not answer", self.addr);
                    return;
                }
            }
        }
        if let Some(tcp) = stream.as_mut() {
            if let Err(e) = tcp.write_all(copy).await {
                log::warn!("Side-tap {} lost: {}", self.addr, e);
                *stream = None;
            }
        }
    }
}

/// The side-tap of one client connection.
#[derive(Clone, Debug)]
pub(crate) struct Tap {
    channel: Arc<SideChannel>,
    host: SocketAddr,
    peer: SocketAddr,
}

impl Tap {
    pub(crate) fn new(channel: Arc<SideChannel>, host: SocketAddr, peer: SocketAddr) -> Tap {
        Tap {
            channel,
            host,
            peer,
        }
    }

    pub(crate) async fn request(&self, request: &Request) {
        let mut copy = SideHeader::new(self.host, self.peer, false).to_bytes();
        copy.extend_from_slice(&request.to_bytes());
        self.channel.deliver(&copy, true).await;
    }

    pub(crate) async fn response(&self, response: &Response) {
        let mut copy = SideHeader::new(self.host, self.peer, true).to_bytes();
        copy.extend_from_slice(&response.to_bytes());
        self.channel.deliver(&copy, false).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ownet_protocol::{ControlFlags, MAX_PAYLOAD_SIZE};
    use std::io::Cursor;
    use tokio::{io::AsyncReadExt, net::TcpListener};

    fn endpoints() -> (SocketAddr, SocketAddr) {
        (
            "127.0.0.1:4304".parse().unwrap(),
            "10.0.0.7:50123".parse().unwrap(),
        )
    }

    #[test]
    fn header_names_both_ends() {
        let (host, peer) = endpoints();
        let header = SideHeader::new(host, peer, false);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), SIDE_HEADER_LEN);
        let parsed = SideHeader::read_from(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.host, "127.0.0.1:4304");
        assert_eq!(parsed.peer, "10.0.0.7:50123");
        assert!(parsed.version.is_sidetap());
        assert!(!parsed.is_response());
        // The peer length sits in the token bits, without the server-message flag
        assert_eq!(parsed.version.bits() & 0xFFFF, "10.0.0.7:50123".len() as u32);

        let response = SideHeader::new(host, peer, true);
        assert!(response.is_response());
        assert_eq!(response.version.token_count(), "10.0.0.7:50123".len());
    }

    #[tokio::test]
    async fn response_copies_never_open_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (host, peer) = endpoints();
        let tap = Tap::new(
            Arc::new(SideChannel::new(listener.local_addr().unwrap())),
            host,
            peer,
        );
        let mut response = Response::new(Version::default(), ControlFlags::default());
        response.ret = 2;
        tap.response(&response).await;
        assert!(tap.channel.stream.lock().await.is_none());

        let request = Request::read("/10.67C6697351FF/temperature", 12, 0);
        tap.request(&request).await;
        tap.response(&response).await;
        let (mut side, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 2 * SIDE_HEADER_LEN + request.to_bytes().len() + 24];
        side.read_exact(&mut buf).await.unwrap();

        let mut cursor = Cursor::new(buf);
        assert!(!SideHeader::read_from(&mut cursor).unwrap().is_response());
        let copied = Request::from_reader(&mut cursor, MAX_PAYLOAD_SIZE).unwrap();
        assert_eq!(copied.path, request.path);
        assert!(SideHeader::read_from(&mut cursor).unwrap().is_response());
        let copied = Response::from_reader(&mut cursor, MAX_PAYLOAD_SIZE).unwrap();
        assert_eq!(copied.ret, 2);
    }

    #[tokio::test]
    async fn unreachable_listener_is_skipped() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let (host, peer) = endpoints();
        let tap = Tap::new(Arc::new(SideChannel::new(addr)), host, peer);
        tap.request(&Request::nop()).await;
        assert!(tap.channel.stream.lock().await.is_none());
    }
}
