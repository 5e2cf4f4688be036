//! Fixtures for the end-to-end tests: an in-memory device tree and helpers to run a server
//! on an ephemeral port.
use std::{
    collections::{BTreeMap, BTreeSet},
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use nix::errno::Errno;
use ownet_protocol::{MAX_PAYLOAD_SIZE, Request, Response, error::ReadError};
use ownet_server::{
    DeviceTree,
    query::{BusId, Change, DeviceId, DirEntry, Node, QueryContext, QueryResult},
    server::Server,
};
use tokio::net::TcpListener;

/// A device tree made of plain values. Directories are implied by the property paths.
#[derive(Debug, Default)]
pub struct FakeTree {
    values: Mutex<BTreeMap<String, Vec<u8>>>,
    read_only: BTreeSet<String>,
    latency: Duration,
    reads: AtomicUsize,
    writes: AtomicUsize,
    lists: AtomicUsize,
}

impl FakeTree {
    pub fn new() -> FakeTree {
        FakeTree::default()
    }

    pub fn with_property(self, path: &str, value: impl Into<Vec<u8>>) -> Self {
        self.lock().insert(path.to_string(), value.into());
        self
    }

    pub fn with_read_only(mut self, path: &str, value: impl Into<Vec<u8>>) -> Self {
        self.read_only.insert(path.to_string());
        self.with_property(path, value)
    }

    /// Every read, write and listing takes this long
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn value(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().get(path).cloned()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn lists(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pause(&self) {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn prefix(dir: &str) -> String {
    if dir == "/" {
        dir.to_string()
    } else {
        format!("{}/", dir)
    }
}

impl DeviceTree for FakeTree {
    fn resolve(&self, path: &str, _ctx: &QueryContext) -> QueryResult<Node> {
        let path = normalize(path);
        let values = self.lock();
        if values.contains_key(&path) {
            // Lock like a real device property: its bus and the device named by the first element
            let device = path
                .split('/')
                .find(|part| !part.is_empty())
                .and_then(DeviceId::parse);
            let mut node = Node::property(path, Change::Volatile).on_bus(BusId(0));
            if let Some(device) = device {
                node = node.of_device(device);
            }
            return Ok(node);
        }
        let prefix = prefix(&path);
        if path == "/" || values.keys().any(|key| key.starts_with(&prefix)) {
            Ok(Node::directory(path))
        } else {
            Err(Errno::ENOENT)
        }
    }

    fn read(
        &self,
        node: &Node,
        _ctx: &QueryContext,
        offset: usize,
        size: usize,
    ) -> QueryResult<Vec<u8>> {
        self.pause();
        self.reads.fetch_add(1, Ordering::SeqCst);
        let values = self.lock();
        let value = values.get(&node.path).ok_or(Errno::EISDIR)?;
        if offset >= value.len() {
            return Ok(Vec::new());
        }
        let end = (offset + size).min(value.len());
        Ok(value[offset..end].to_vec())
    }

    fn write(
        &self,
        node: &Node,
        _ctx: &QueryContext,
        _offset: usize,
        data: &[u8],
    ) -> QueryResult<()> {
        if self.read_only.contains(&node.path) {
            return Err(Errno::EROFS);
        }
        self.pause();
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.lock().insert(node.path.clone(), data.to_vec());
        Ok(())
    }

    fn list(
        &self,
        node: &Node,
        _ctx: &QueryContext,
        visit: &mut dyn FnMut(DirEntry),
    ) -> QueryResult<u32> {
        self.pause();
        self.lists.fetch_add(1, Ordering::SeqCst);
        let prefix = prefix(&node.path);
        let mut children = BTreeMap::new();
        for key in self.lock().keys() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                let (name, nested) = match rest.split_once('/') {
                    Some((name, _)) => (name, true),
                    None => (rest, false),
                };
                let is_dir = children.get(name).copied().unwrap_or(false) || nested;
                children.insert(name.to_string(), is_dir);
            }
        }
        for (name, is_dir) in children {
            visit(DirEntry::new(format!("{}{}", prefix, name), is_dir));
        }
        Ok(0)
    }
}

/// Serves `server` on an ephemeral loopback port and returns the address.
pub async fn spawn_server<T: DeviceTree>(server: Server<T>) -> io::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move { server.serve(listener).await });
    Ok(addr)
}

/// A raw protocol connection, for tests that need to see every response including
/// keep-alives.
#[derive(Debug)]
pub struct RawConnection {
    tcp: TcpStream,
}

impl RawConnection {
    pub fn connect(addr: SocketAddr) -> io::Result<RawConnection> {
        let tcp = TcpStream::connect(addr)?;
        tcp.set_read_timeout(Some(Duration::from_secs(10)))?;
        Ok(RawConnection { tcp })
    }

    /// The client end of the connection, as the server sees it.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn send(&mut self, request: &Request) -> io::Result<()> {
        request.write_to(&mut self.tcp)?;
        self.tcp.flush()
    }

    pub fn receive(&mut self) -> Result<Response, ReadError> {
        Response::from_reader(&mut self.tcp, MAX_PAYLOAD_SIZE)
    }

    /// Responses up to the first one that is not a keep-alive, which comes last.
    pub fn receive_answer(&mut self) -> Result<Vec<Response>, ReadError> {
        let mut responses = Vec::new();
        loop {
            let response = self.receive()?;
            let done = !response.keepalive;
            responses.push(response);
            if done {
                return Ok(responses);
            }
        }
    }

    /// Whether the server closed the connection.
    pub fn is_closed(&mut self) -> bool {
        let mut buf = [0u8; 1];
        matches!(self.tcp.read(&mut buf), Ok(0))
    }
}
