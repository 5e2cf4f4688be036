//! # Remote Backend
//!
//! Serves the device tree of another owserver, so that several servers can be chained or
//! merged behind one address. Every query is forwarded over a persistent connection.
//!
//! The anti-loop tokens of the incoming request travel along with the forwarded one. If
//! the servers form a cycle, one of them sees its own token and answers `ELOOP` instead of
//! forwarding the request forever.
//!
//! Whether a path is a directory or a property is asked upstream once and then
//! remembered, so a forwarded read normally costs a single upstream request. Listings
//! fill in the kinds of all their entries. Forwarded nodes carry no bus or device, so
//! no local lock is taken: the upstream server does its own locking.
//!
//! ## Example Usage
//!
//! ```ignore
//! use ownet_server_sim::backends::remote::RemoteTree;
//! use ownet_server::server::{Config, Server};
//!
//! let tree = RemoteTree::new("192.168.1.10:4304")?;
//! let server = Server::new(tree, Config::default());
//! server.listen("0.0.0.0:4304").await?;
//! ```
use std::{
    collections::BTreeMap,
    io,
    net::ToSocketAddrs,
    sync::{Mutex, MutexGuard},
};

use nix::errno::Errno;
use ownet_client::{ClientError, OwClient};
use ownet_server::{
    DeviceTree,
    query::{Change, DirEntry, Node, QueryContext, QueryResult},
};

#[derive(Debug)]
pub struct RemoteTree {
    client: Mutex<OwClient>,
    /// Known paths, `true` for directories
    kinds: Mutex<BTreeMap<String, bool>>,
}

fn to_errno(error: ClientError) -> Errno {
    match error {
        ClientError::Server(errno) => errno,
        ClientError::Io(e) => {
            log::warn!("Upstream server unreachable: {}", e);
            Errno::EIO
        }
        ClientError::Protocol(e) => {
            log::warn!("Upstream server misbehaved: {}", e);
            Errno::EPROTO
        }
    }
}

impl RemoteTree {
    pub fn new(upstream: impl ToSocketAddrs) -> io::Result<RemoteTree> {
        Ok(RemoteTree {
            client: Mutex::new(OwClient::new(upstream)?.persistent(true)),
            kinds: Mutex::new(BTreeMap::new()),
        })
    }

    fn kinds(&self) -> MutexGuard<'_, BTreeMap<String, bool>> {
        self.kinds.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remembers the kinds of the entries of a `dirallslash` listing.
    fn learn(&self, entries: &[String]) {
        let mut kinds = self.kinds();
        for entry in entries {
            match entry.strip_suffix('/') {
                Some(dir) => kinds.insert(dir.to_string(), true),
                None => kinds.insert(entry.clone(), false),
            };
        }
    }

    fn node(path: &str, is_dir: bool) -> Node {
        if is_dir {
            Node::directory(path)
        } else {
            Node::property(path, Change::Volatile)
        }
    }

    /// The shared client, configured for one query.
    fn client(&self, ctx: &QueryContext) -> MutexGuard<'_, OwClient> {
        let mut client = self.client.lock().unwrap_or_else(|e| e.into_inner());
        // The persistence bit is negotiated by the client itself
        client.set_flags(ctx.flags.with_persistent(false));
        client.set_tokens(ctx.tokens.clone());
        client
    }
}

impl DeviceTree for RemoteTree {
    fn resolve(&self, path: &str, ctx: &QueryContext) -> QueryResult<Node> {
        let key = path.trim_end_matches('/');
        if key.is_empty() {
            return Ok(Node::directory(path));
        }
        if let Some(is_dir) = self.kinds().get(key).copied() {
            return Ok(RemoteTree::node(path, is_dir));
        }
        // Only directories can be listed, and a missing path fails either way
        let is_dir = match self.client(ctx).dir_all(key, true) {
            Ok(listing) => {
                self.learn(&listing.entries);
                true
            }
            Err(ClientError::Server(Errno::ENOTDIR)) => false,
            Err(e) => return Err(to_errno(e)),
        };
        log::trace!("Upstream {} is a {}", key, if is_dir { "directory" } else { "property" });
        self.kinds().insert(key.to_string(), is_dir);
        Ok(RemoteTree::node(path, is_dir))
    }

    fn read(
        &self,
        node: &Node,
        ctx: &QueryContext,
        offset: usize,
        size: usize,
    ) -> QueryResult<Vec<u8>> {
        self.client(ctx)
            .read(&node.path, size, offset)
            .map_err(to_errno)
    }

    fn write(
        &self,
        node: &Node,
        ctx: &QueryContext,
        offset: usize,
        data: &[u8],
    ) -> QueryResult<()> {
        self.client(ctx)
            .write(&node.path, data, offset)
            .map_err(to_errno)
    }

    fn list(
        &self,
        node: &Node,
        ctx: &QueryContext,
        visit: &mut dyn FnMut(DirEntry),
    ) -> QueryResult<u32> {
        let listing = self
            .client(ctx)
            .dir_all(&node.path, true)
            .map_err(to_errno)?;
        self.learn(&listing.entries);
        for entry in listing.entries {
            match entry.strip_suffix('/') {
                Some(dir) => visit(DirEntry::new(dir, true)),
                None => visit(DirEntry::new(entry, false)),
            }
        }
        Ok(listing.flags)
    }
}
