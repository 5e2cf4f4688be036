//! Process-wide state shared by all connections of one server.
use std::{net::SocketAddr, sync::Arc};

use crate::{
    DeviceTree,
    antiloop::TokenSet,
    locks::LockRegistry,
    persistence::PersistenceGate,
    server::Config,
    sidetap::{SideChannel, Tap},
};

#[derive(Debug)]
pub struct ServerContext<T: DeviceTree> {
    tree: Arc<T>,
    config: Config,
    persistence: Arc<PersistenceGate>,
    locks: Arc<LockRegistry>,
    tokens: TokenSet,
    side: Option<Arc<SideChannel>>,
}

impl<T: DeviceTree> ServerContext<T> {
    pub fn new(tree: T, config: Config, tokens: TokenSet) -> ServerContext<T> {
        ServerContext::with_locks(tree, config, tokens, Arc::new(LockRegistry::new()))
    }

    /// Uses a lock registry the caller keeps a handle to, e.g. to report bus usage.
    pub fn with_locks(
        tree: T,
        config: Config,
        tokens: TokenSet,
        locks: Arc<LockRegistry>,
    ) -> ServerContext<T> {
        let persistence = Arc::new(PersistenceGate::new(
            config.persistent_high_water,
            config.persistent_low_water,
        ));
        let side = config.side_tap.map(|addr| Arc::new(SideChannel::new(addr)));
        ServerContext {
            tree: Arc::new(tree),
            side,
            config,
            persistence,
            locks,
            tokens,
        }
    }

    pub fn tree(&self) -> &Arc<T> {
        &self.tree
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn persistence(&self) -> &Arc<PersistenceGate> {
        &self.persistence
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    pub fn tokens(&self) -> &TokenSet {
        &self.tokens
    }

    /// The side-tap of a connection from `peer` to `host`, if one is configured.
    pub(crate) fn tap(&self, host: SocketAddr, peer: SocketAddr) -> Option<Tap> {
        self.side
            .as_ref()
            .map(|side| Tap::new(Arc::clone(side), host, peer))
    }
}
