/// Read and write implementations for the protocol messages.
/// All header words are transmitted in network byte order.
use std::io::{self, Read, Write};

use crate::{
    error::ReadError,
    protocol::{
        AntiLoopToken, ControlFlags, HEADER_LEN, MessageKind, Request, Response, TOKEN_LEN,
        Version,
    },
};

fn word(buf: &[u8; HEADER_LEN], index: usize) -> u32 {
    let at = index * 4;
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn put_words(out: &mut Vec<u8>, words: [u32; 6]) {
    for w in words {
        out.extend_from_slice(&w.to_be_bytes());
    }
}

/// The fixed part of a request, decoded before the payload is read.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RequestHeader {
    pub version: Version,
    pub payload: i32,
    pub kind: MessageKind,
    pub flags: ControlFlags,
    pub size: i32,
    pub offset: i32,
}

impl RequestHeader {
    pub fn parse(buf: &[u8; HEADER_LEN]) -> RequestHeader {
        RequestHeader {
            version: Version::from_bits(word(buf, 0)),
            payload: word(buf, 1) as i32,
            kind: MessageKind::from_i32(word(buf, 2) as i32),
            flags: ControlFlags::from_bits(word(buf, 3)),
            size: word(buf, 4) as i32,
            offset: word(buf, 5) as i32,
        }
    }

    /// Number of bytes that follow the header: the payload plus any anti-loop tokens.
    /// Fails before anything is allocated if that exceeds `max_payload`.
    pub fn body_len(&self, max_payload: usize) -> Result<usize, ReadError> {
        if self.payload < 0 {
            return Err(ReadError::InvalidFormat(format!(
                "Negative payload length {}",
                self.payload
            )));
        }
        let body = self.payload as usize + self.version.token_count() * TOKEN_LEN;
        if body > max_payload {
            return Err(ReadError::TooManyBytes {
                max: max_payload,
                got: body,
            });
        }
        Ok(body)
    }
}

/// Splits a payload at the path terminator: the path before it, the bytes after it.
fn split_path(bytes: &[u8]) -> Result<(String, &[u8]), ReadError> {
    let end = bytes
        .iter()
        .position(|b| *b == 0)
        .ok_or(ReadError::MissingTerminator)?;
    Ok((std::str::from_utf8(&bytes[..end])?.to_owned(), &bytes[end + 1..]))
}

impl Request {
    /// Builds a request from its header and the `body_len` bytes that followed it.
    ///
    /// For writes everything after the path terminator is kept as data, even if it is
    /// shorter or longer than the announced size. Checking that is up to the server,
    /// which answers with an error code instead of dropping the connection.
    pub fn from_parts(header: RequestHeader, body: &[u8]) -> Result<Request, ReadError> {
        let payload = header.payload as usize;
        if body.len() < payload {
            return Err(ReadError::InvalidFormat(format!(
                "Expected {} payload bytes, got {}",
                payload,
                body.len()
            )));
        }
        let (content, token_bytes) = body.split_at(payload);

        let (path, data) = if payload == 0 {
            (None, Vec::new())
        } else {
            let (path, rest) = split_path(content)?;
            let data = if header.kind == MessageKind::Write {
                rest.to_vec()
            } else {
                Vec::new()
            };
            (Some(path), data)
        };

        let tokens = token_bytes
            .chunks_exact(TOKEN_LEN)
            .map(|chunk| {
                let mut token = [0u8; TOKEN_LEN];
                token.copy_from_slice(chunk);
                AntiLoopToken::new(token)
            })
            .collect();

        Ok(Request {
            version: header.version,
            kind: header.kind,
            flags: header.flags,
            path,
            data,
            size: header.size,
            offset: header.offset,
            tokens,
        })
    }

    pub fn from_reader(reader: &mut impl Read, max_payload: usize) -> Result<Request, ReadError> {
        let mut buf = [0u8; HEADER_LEN];
        reader.read_exact(&mut buf)?;
        let header = RequestHeader::parse(&buf);
        let mut body = vec![0u8; header.body_len(max_payload)?];
        reader.read_exact(&mut body)?;
        Request::from_parts(header, &body)
    }

    /// Serializes header, path, data and tokens into one buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let version = if self.tokens.is_empty() {
            self.version
        } else {
            self.version.with_tokens(self.tokens.len() as u16)
        };
        let mut out =
            Vec::with_capacity(HEADER_LEN + self.payload_len() + self.tokens.len() * TOKEN_LEN);
        put_words(
            &mut out,
            [
                version.bits(),
                self.payload_len() as u32,
                self.kind.as_i32() as u32,
                self.flags.bits(),
                self.size as u32,
                self.offset as u32,
            ],
        );
        if let Some(path) = &self.path {
            out.extend_from_slice(path.as_bytes());
            out.push(0);
        }
        out.extend_from_slice(&self.data);
        for token in &self.tokens {
            out.extend_from_slice(token.as_bytes());
        }
        out
    }

    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_all(&self.to_bytes())
    }
}

impl Response {
    pub fn from_reader(reader: &mut impl Read, max_payload: usize) -> Result<Response, ReadError> {
        let mut buf = [0u8; HEADER_LEN];
        reader.read_exact(&mut buf)?;
        let payload = word(&buf, 1) as i32;
        let mut response = Response {
            version: Version::from_bits(word(&buf, 0)),
            flags: ControlFlags::from_bits(word(&buf, 3)),
            ret: word(&buf, 2) as i32,
            size: word(&buf, 4) as i32,
            offset: word(&buf, 5) as i32,
            data: Vec::new(),
            keepalive: payload < 0,
        };
        if payload > 0 {
            let len = payload as usize;
            if len > max_payload {
                return Err(ReadError::TooManyBytes {
                    max: max_payload,
                    got: len,
                });
            }
            response.data = vec![0u8; len];
            reader.read_exact(&mut response.data)?;
        }
        Ok(response)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.data.len());
        self.encode_into(&mut out);
        out
    }

    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        put_words(
            out,
            [
                self.version.bits(),
                self.payload_len() as u32,
                self.ret as u32,
                self.flags.bits(),
                self.size as u32,
                self.offset as u32,
            ],
        );
        if !self.keepalive {
            out.extend_from_slice(&self.data);
        }
    }

    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_all(&self.to_bytes())
    }
}

#[cfg(test)]
mod test {
    use crate::error::ReadError;
    use crate::protocol::*;
    use std::io::Cursor;

    fn round_trip(request: &Request) -> Request {
        let bytes = request.to_bytes();
        Request::from_reader(&mut Cursor::new(bytes), MAX_PAYLOAD_SIZE).unwrap()
    }

    #[test]
    fn header_is_network_byte_order() {
        let request = Request::read("/10.67C6697351FF/temperature", 12, 0)
            .with_flags(ControlFlags::default().with_persistent(true));
        let bytes = request.to_bytes();
        let path_len = "/10.67C6697351FF/temperature".len() as u32 + 1;
        assert_eq!(&bytes[0..4], &[0, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &path_len.to_be_bytes());
        assert_eq!(&bytes[8..12], &[0, 0, 0, 2]);
        assert_eq!(&bytes[12..16], &[0, 0, 0, 4]);
        assert_eq!(&bytes[16..20], &[0, 0, 0, 12]);
        assert_eq!(*bytes.last().unwrap(), 0);
    }

    #[test]
    fn requests_survive_encoding() {
        let token = AntiLoopToken::new([7; TOKEN_LEN]);
        let requests = [
            Request::nop(),
            Request::read("/10.67C6697351FF/temperature", 12, 0),
            Request::write("/29.ABCDEF012345/PIO", vec![0x01], 0),
            Request::dir("/").with_tokens(vec![token, AntiLoopToken::default()]),
            Request::dir_all("/bus.0", true)
                .with_flags(ControlFlags::default().with_device_format(DeviceFormat::FIC)),
            Request::get("/", 4096, false),
        ];
        for request in &requests {
            assert_eq!(&round_trip(request), request);
        }
    }

    #[test]
    fn write_separates_path_from_data() {
        let request = Request::write("/29.ABCDEF012345/PIO", b"1\0\x02".to_vec(), 3);
        let decoded = round_trip(&request);
        assert_eq!(decoded.path.as_deref(), Some("/29.ABCDEF012345/PIO"));
        assert_eq!(decoded.data, b"1\0\x02");
        assert_eq!(decoded.offset, 3);
    }

    #[test]
    fn oversized_payload_is_rejected_before_reading_it() {
        let mut bytes = Request::read("/x", 1, 0).to_bytes();
        bytes[4..8].copy_from_slice(&(MAX_PAYLOAD_SIZE as u32 + 1).to_be_bytes());
        bytes.truncate(HEADER_LEN);
        match Request::from_reader(&mut Cursor::new(bytes), MAX_PAYLOAD_SIZE) {
            Err(ReadError::TooManyBytes { max, got }) => {
                assert_eq!(max, MAX_PAYLOAD_SIZE);
                assert_eq!(got, MAX_PAYLOAD_SIZE + 1);
            }
            other => panic!("expected TooManyBytes, got {:?}", other),
        }
    }

    #[test]
    fn tokens_count_against_the_maximum() {
        let request = Request::read("/x", 1, 0).with_tokens(vec![AntiLoopToken::default(); 4]);
        let bytes = request.to_bytes();
        match Request::from_reader(&mut Cursor::new(bytes), 3 + 3 * TOKEN_LEN) {
            Err(ReadError::TooManyBytes { got, .. }) => assert_eq!(got, 3 + 4 * TOKEN_LEN),
            other => panic!("expected TooManyBytes, got {:?}", other),
        }
    }

    #[test]
    fn path_without_terminator_is_rejected() {
        let mut bytes = Request::read("/abc", 1, 0).to_bytes();
        let last = bytes.len() - 1;
        bytes[last] = b'd';
        match Request::from_reader(&mut Cursor::new(bytes), MAX_PAYLOAD_SIZE) {
            Err(ReadError::MissingTerminator) => {}
            other => panic!("expected MissingTerminator, got {:?}", other),
        }
    }

    #[test]
    fn write_keeps_short_data_for_the_server_to_judge() {
        let mut bytes = Request::write("/a", vec![1, 2], 0).to_bytes();
        bytes[16..20].copy_from_slice(&10i32.to_be_bytes());
        let decoded = Request::from_reader(&mut Cursor::new(bytes), MAX_PAYLOAD_SIZE).unwrap();
        assert_eq!(decoded.path.as_deref(), Some("/a"));
        assert_eq!(decoded.data, vec![1, 2]);
        assert_eq!(decoded.size, 10);
    }

    #[test]
    fn keepalive_announces_negative_payload() {
        let ping = Response::keepalive(Version::default(), ControlFlags::default());
        let bytes = ping.to_bytes();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(&bytes[4..8], &(-1i32).to_be_bytes());
        let decoded = Response::from_reader(&mut Cursor::new(bytes), MAX_PAYLOAD_SIZE).unwrap();
        assert!(decoded.keepalive);
        assert!(!decoded.is_terminator());
    }

    #[test]
    fn response_carries_negative_result() {
        let mut response = Response::new(Version::default(), ControlFlags::default());
        response.ret = -2;
        response.data = b"/10.67C6697351FF\0".to_vec();
        response.size = 16;
        let decoded =
            Response::from_reader(&mut Cursor::new(response.to_bytes()), MAX_PAYLOAD_SIZE)
                .unwrap();
        assert_eq!(decoded, response);
        assert_eq!(decoded.text(), "/10.67C6697351FF");
    }
}
