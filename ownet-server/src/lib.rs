//! # ownet Server Library
//!
//! This crate provides the network front end of a one-wire gateway: an `owserver`
//! compatible TCP server that lets many clients query a slow, shared device bus at once.
//!
//! ## Overview
//!
//! The server speaks the protocol implemented by [`ownet_protocol`]. It does not know how
//! to talk to hardware itself. Instead it is handed a [`DeviceTree`], which resolves paths
//! and reads, writes and lists them. The server takes care of everything around that:
//!
//! - **Persistent connections**: clients may ask to keep their connection open. Grants are
//!   limited by a high-water mark, see [`persistence::PersistenceGate`]
//! - **Keep-alive pulses**: while a query is still running, the client periodically
//!   receives empty "still working" responses so it does not give up
//! - **Locking**: queries that touch a bus or a device's state are serialized through
//!   [`locks::LockRegistry`], bus lock first, device lock second
//! - **Anti-loop tokens**: requests that already passed through this process are refused,
//!   see [`antiloop::TokenSet`]
//! - **Side-tap**: optionally, a copy of all traffic goes to a monitoring listener, see
//!   [`sidetap`]
//!
//! ## Basic Usage
//!
//! ### Implementing a Device Tree
//!
//! ```ignore
//! use ownet_server::{DeviceTree, query::*};
//!
//! struct Thermometers;
//!
//! impl DeviceTree for Thermometers {
//!     fn resolve(&self, path: &str, _ctx: &QueryContext) -> QueryResult<Node> {
//!         // Map the path onto a directory or a property
//!     }
//!
//!     fn read(&self, node: &Node, ctx: &QueryContext, offset: usize, size: usize) -> QueryResult<Vec<u8>> {
//!         // Talk to the bus
//!     }
//!
//!     fn write(&self, node: &Node, ctx: &QueryContext, offset: usize, data: &[u8]) -> QueryResult<()> {
//!         Err(Errno::EROFS)
//!     }
//!
//!     fn list(&self, node: &Node, ctx: &QueryContext, visit: &mut dyn FnMut(DirEntry)) -> QueryResult<u32> {
//!         visit(DirEntry::new("/10.67C6697351FF", true));
//!         Ok(0)
//!     }
//! }
//! ```
//!
//! ### Starting the Server
//!
//! ```ignore
//! use ownet_server::server::Builder;
//! use std::time::Duration;
//!
//! let server = Builder::new()
//!     .max_persistent(50)
//!     .request_timeout(Duration::from_secs(5))
//!     .build(Thermometers);
//! server.listen("0.0.0.0:4304").await?;
//! ```
//!
//! ## Error Handling
//!
//! Failures of the device tree are [`nix::errno::Errno`] values. They are sent to the
//! client as negative result codes and never close the connection. Malformed or oversized
//! requests are answered with an error response, after which the connection is closed.
//! Transport errors close the connection. In every case persistence grants and locks are
//! given back.
//!
//! ## Logging
//!
//! This crate uses the `log` crate. Connections are reported at `info`, request headers,
//! persistence decisions and keep-alives at `debug`, payloads at `trace`.
//!
//! ## Thread Model
//!
//! Every connection runs as its own tokio task, and every request in a further task so
//! that a client hanging up never abandons a query halfway: the query completes and
//! releases its locks. Device tree calls are blocking and run on tokio's blocking pool.
pub mod antiloop;
pub mod context;
mod dispatch;
mod keepalive;
pub mod locks;
pub mod persistence;
pub mod query;
pub mod server;
mod session;
pub mod sidetap;

use query::{DirEntry, Node, QueryContext, QueryResult};

/// The query layer a server exposes: a tree of directories and properties.
///
/// All methods are blocking and may take as long as the bus needs. The server calls them
/// from a blocking thread pool, with the locks the [`Node`] asks for already held.
pub trait DeviceTree: Send + Sync + 'static {
    /// Maps a path onto a node, or fails with `ENOENT` and friends.
    fn resolve(&self, path: &str, ctx: &QueryContext) -> QueryResult<Node>;

    /// Reads up to `size` bytes of a property, starting at `offset`.
    /// Longer results are truncated by the server.
    fn read(&self, node: &Node, ctx: &QueryContext, offset: usize, size: usize)
    -> QueryResult<Vec<u8>>;

    /// Writes `data` into a property, starting at `offset`.
    fn write(&self, node: &Node, ctx: &QueryContext, offset: usize, data: &[u8])
    -> QueryResult<()>;

    /// Calls `visit` once for every element of a directory, in discovery order.
    ///
    /// Returns the directory flags, which are passed on to the client untouched.
    fn list(
        &self,
        node: &Node,
        ctx: &QueryContext,
        visit: &mut dyn FnMut(DirEntry),
    ) -> QueryResult<u32>;
}
