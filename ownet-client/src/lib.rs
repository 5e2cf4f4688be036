//! # ownet Client
//!
//! A blocking client for one-wire network servers (`owserver` and compatible).
//!
//! ## Overview
//!
//! [`OwClient`] sends one request at a time and waits for its answer, silently skipping
//! the keep-alive responses a server emits while a slow bus operation is running.
//!
//! If persistence is enabled, the client asks the server to keep the connection open and
//! reuses it for as long as the server agrees. A reused connection the server closed in
//! the meantime is detected, and the request is sent once more on a fresh one.
//!
//! ## Basic Usage
//!
//! ```ignore
//! use ownet_client::OwClient;
//!
//! let mut client = OwClient::new("127.0.0.1:4304")?.persistent(true);
//!
//! for device in client.dir_all("/", false)?.entries {
//!     println!("{}", device);
//! }
//! let temperature = client.read("/10.67C6697351FF/temperature", 12, 0)?;
//! client.write("/29.ABCDEF012345/PIO.0", b"1", 0)?;
//! ```
//!
//! ## Federation
//!
//! A server forwarding queries to another server passes the anti-loop tokens of the
//! original request with [`OwClient::set_tokens`], so that a cycle of servers is detected
//! instead of bouncing a request around forever.
//!
//! ## Related Crates
//!
//! - [`ownet_server`](https://docs.rs/ownet-server/) - Server implementation
//! - [`ownet_protocol`](https://docs.rs/ownet-protocol/) - Protocol encoding/decoding
use std::{
    error::Error,
    fmt::Display,
    io::{self, ErrorKind},
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
};

use nix::errno::Errno;
use ownet_protocol::{
    AntiLoopToken, ControlFlags, MAX_PAYLOAD_SIZE, Request, Response, error::ReadError,
};

/// Errors reported by [`OwClient`].
#[derive(Debug)]
pub enum ClientError {
    Io(io::Error),
    /// The server sent something that is not a valid response
    Protocol(ReadError),
    /// The server answered with a negative result code
    Server(Errno),
}

impl From<io::Error> for ClientError {
    fn from(value: io::Error) -> Self {
        ClientError::Io(value)
    }
}

impl From<ReadError> for ClientError {
    fn from(value: ReadError) -> Self {
        match value {
            ReadError::IoError(error) => ClientError::Io(error),
            other => ClientError::Protocol(other),
        }
    }
}

impl Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Io(error) => write!(f, "{}", error),
            ClientError::Protocol(error) => write!(f, "Protocol error: {}", error),
            ClientError::Server(errno) => write!(f, "Server error: {}", errno.desc()),
        }
    }
}

impl Error for ClientError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ClientError::Io(error) => Some(error),
            ClientError::Protocol(error) => Some(error),
            ClientError::Server(_) => None,
        }
    }
}

/// The elements of a directory and the flags the server reported for it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Listing {
    pub entries: Vec<String>,
    pub flags: u32,
}

fn check(response: &Response) -> Result<(), ClientError> {
    if response.ret < 0 {
        Err(ClientError::Server(Errno::from_raw(-response.ret)))
    } else {
        Ok(())
    }
}

/// Whether an error means the server closed a connection we still considered open.
fn is_stale(error: &ClientError) -> bool {
    match error {
        ClientError::Io(e) => matches!(
            e.kind(),
            ErrorKind::UnexpectedEof
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
        ),
        _ => false,
    }
}

/// Client for one owserver.
///
/// Requests are sent one after the other. The client is not [`Sync`]; share it behind a
/// mutex or open one client per thread.
#[derive(Debug)]
pub struct OwClient {
    addrs: Vec<SocketAddr>,
    flags: ControlFlags,
    persistent: bool,
    tokens: Vec<AntiLoopToken>,
    timeout: Duration,
    max_payload: usize,
    tcp: Option<TcpStream>,
}

impl OwClient {
    /// Creates a client for the server at `addr`. The connection is opened on first use.
    pub fn new(addr: impl ToSocketAddrs) -> io::Result<OwClient> {
        let addrs: Vec<_> = addr.to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "Address resolved to nothing",
            ));
        }
        Ok(OwClient {
            addrs,
            flags: ControlFlags::default(),
            persistent: false,
            tokens: Vec::new(),
            timeout: Duration::from_secs(10),
            max_payload: MAX_PAYLOAD_SIZE,
            tcp: None,
        })
    }

    /// Ask the server to keep the connection open between requests.
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Control flags (temperature scale, device name format, ...) sent with every request
    pub fn with_flags(mut self, flags: ControlFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Longest silence tolerated while waiting for a response.
    /// Keep-alives count as traffic.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn set_flags(&mut self, flags: ControlFlags) {
        self.flags = flags;
    }

    /// Anti-loop tokens attached to every following request
    pub fn set_tokens(&mut self, tokens: Vec<AntiLoopToken>) {
        self.tokens = tokens;
    }

    /// Whether a connection is currently held open.
    pub fn is_connected(&self) -> bool {
        self.tcp.is_some()
    }

    fn connect(&self) -> io::Result<TcpStream> {
        let tcp = TcpStream::connect(&self.addrs[..])?;
        tcp.set_read_timeout(Some(self.timeout))?;
        tcp.set_write_timeout(Some(self.timeout))?;
        tcp.set_nodelay(true)?;
        log::debug!("Connected to {}", tcp.peer_addr()?);
        Ok(tcp)
    }

    fn prepare(&self, request: Request) -> Request {
        let request = request.with_flags(self.flags.with_persistent(self.persistent));
        if self.tokens.is_empty() {
            request
        } else {
            request.with_tokens(self.tokens.clone())
        }
    }

    /// Next response that is not a keep-alive.
    fn receive(&self, tcp: &mut TcpStream) -> Result<Response, ClientError> {
        loop {
            let response = Response::from_reader(tcp, self.max_payload)?;
            if response.keepalive {
                log::trace!("Skipping keep-alive");
                continue;
            }
            log::debug!(
                "Response ret={} size={} offset={} payload={}",
                response.ret,
                response.size,
                response.offset,
                response.payload_len()
            );
            return Ok(response);
        }
    }

    /// Sends `request` and hands every response up to and including the last one to
    /// `accept`, which returns `true` once it got the last one.
    ///
    /// A reused connection that turns out to be closed is replaced once.
    fn exchange(
        &mut self,
        request: Request,
        mut accept: impl FnMut(Response) -> bool,
    ) -> Result<(), ClientError> {
        let request = self.prepare(request);
        let bytes = request.to_bytes();
        log::debug!("Request {} path={:?}", request.kind, request.path);

        let mut reused = self.tcp.is_some();
        loop {
            let mut tcp = match self.tcp.take() {
                Some(tcp) => tcp,
                None => self.connect()?,
            };
            let mut first = true;
            let result = io::Write::write_all(&mut tcp, &bytes)
                .map_err(ClientError::from)
                .and_then(|()| loop {
                    let response = self.receive(&mut tcp)?;
                    first = false;
                    let keep = response.flags.persistent();
                    if accept(response) {
                        break Ok(keep);
                    }
                });
            match result {
                Ok(keep) => {
                    if keep && self.persistent {
                        self.tcp = Some(tcp);
                    }
                    return Ok(());
                }
                Err(e) if reused && first && is_stale(&e) => {
                    log::debug!("Persistent connection went stale, reconnecting");
                    reused = false;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn call(&mut self, request: Request) -> Result<Response, ClientError> {
        let mut last = None;
        self.exchange(request, |response| {
            last = Some(response);
            true
        })?;
        match last {
            Some(response) => {
                check(&response)?;
                Ok(response)
            }
            None => Err(ClientError::Protocol(ReadError::InvalidFormat(
                "No response".to_string(),
            ))),
        }
    }

    /// Probes the server.
    pub fn nop(&mut self) -> Result<(), ClientError> {
        self.call(Request::nop()).map(|_| ())
    }

    /// Whether `path` exists.
    pub fn presence(&mut self, path: &str) -> Result<bool, ClientError> {
        match self.call(Request::presence(path)) {
            Ok(_) => Ok(true),
            Err(ClientError::Server(Errno::ENOENT)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Reads up to `size` bytes of a property.
    pub fn read(&mut self, path: &str, size: usize, offset: usize) -> Result<Vec<u8>, ClientError> {
        let mut response = self.call(Request::read(path, size as i32, offset as i32))?;
        // Never hand out more than was asked for
        response.data.truncate(size);
        Ok(response.data)
    }

    pub fn write(&mut self, path: &str, data: &[u8], offset: usize) -> Result<(), ClientError> {
        self.call(Request::write(path, data, offset as i32))
            .map(|_| ())
    }

    /// Lists a directory one element per response.
    pub fn dir(&mut self, path: &str) -> Result<Listing, ClientError> {
        let mut listing = Listing::default();
        let mut terminator = None;
        self.exchange(Request::dir(path), |response| {
            if response.is_terminator() || response.ret < 0 {
                terminator = Some(response);
                true
            } else {
                listing.entries.push(response.text());
                false
            }
        })?;
        if let Some(terminator) = terminator {
            check(&terminator)?;
            listing.flags = terminator.offset as u32;
        }
        Ok(listing)
    }

    /// Lists a directory in a single response. With `slash`, directories end in `/`.
    ///
    /// Falls back to [`OwClient::dir`] for servers that do not know the request.
    pub fn dir_all(&mut self, path: &str, slash: bool) -> Result<Listing, ClientError> {
        match self.call(Request::dir_all(path, slash)) {
            Ok(response) => Ok(Listing {
                entries: response
                    .text()
                    .split(',')
                    .filter(|entry| !entry.is_empty())
                    .map(str::to_owned)
                    .collect(),
                flags: response.offset as u32,
            }),
            Err(ClientError::Server(Errno::ENOMSG)) => {
                log::debug!("Server does not support dirall, listing element by element");
                self.dir(path)
            }
            Err(e) => Err(e),
        }
    }

    /// The contents of a property, or the comma separated listing of a directory.
    pub fn get(&mut self, path: &str) -> Result<Vec<u8>, ClientError> {
        let mut response = self.call(Request::get(path, self.max_payload as i32, false))?;
        // Listings carry a trailing null that `size` does not count
        response.data.truncate(response.size.max(0) as usize);
        Ok(response.data)
    }
}
