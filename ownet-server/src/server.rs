use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use ownet_protocol::{AntiLoopToken, MAX_PAYLOAD_SIZE};
use tokio::net::{TcpListener, ToSocketAddrs};

use crate::{
    DeviceTree, antiloop::TokenSet, context::ServerContext, locks::LockRegistry, session,
};

#[derive(Debug, Clone)]
pub struct Config {
    /// Largest accepted request payload (path, data and tokens)
    pub max_payload_size: usize,
    /// How long a fresh connection may take to send its first request
    pub request_timeout: Duration,
    /// No new persistence grants at or above this many persistent connections
    pub persistent_high_water: usize,
    /// Idle persistent connections only linger below this many persistent connections
    pub persistent_low_water: usize,
    /// First wait for the next request on a persistent connection
    pub persistent_short_timeout: Duration,
    /// Second wait, only taken below the low-water mark
    pub persistent_long_timeout: Duration,
    pub no_persistence: bool,
    /// Wait after directory traffic before the next keep-alive is due
    pub keepalive_short: Duration,
    /// Interval between keep-alives while a request is running
    pub keepalive_long: Duration,
    /// Send one keep-alive before any work starts
    pub ping_crazy: bool,
    /// Listener receiving a copy of every request and response
    pub side_tap: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_payload_size: MAX_PAYLOAD_SIZE,
            request_timeout: Duration::from_secs(10),
            persistent_high_water: 20,
            persistent_low_water: 10,
            persistent_short_timeout: Duration::from_secs(600),
            persistent_long_timeout: Duration::from_secs(3600),
            no_persistence: false,
            keepalive_short: Duration::from_millis(500),
            keepalive_long: Duration::from_secs(1),
            ping_crazy: false,
            side_tap: None,
        }
    }
}

/// Serves a [`DeviceTree`] over TCP. Cloning yields another handle to the same server state.
#[derive(Debug)]
pub struct Server<T: DeviceTree> {
    context: Arc<ServerContext<T>>,
}

impl<T: DeviceTree> Clone for Server<T> {
    fn clone(&self) -> Self {
        Server {
            context: Arc::clone(&self.context),
        }
    }
}

/// Builder to create a [Server] instance and modify configuration options
///
/// # Example
///
/// ```ignore
/// use ownet_server::server::Builder;
/// use std::time::Duration;
///
/// let server = Builder::new()
///     .max_persistent(50)
///     .min_persistent(25)
///     .request_timeout(Duration::from_secs(5))
///     .build(my_tree);
/// ```
#[derive(Default)]
pub struct Builder {
    config: Config,
    token: Option<AntiLoopToken>,
    locks: Option<Arc<LockRegistry>>,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Set the largest request payload this server accepts.
    pub fn max_payload_size(mut self, size: usize) -> Self {
        self.config.max_payload_size = size;
        self
    }

    /// Set how long a new connection may stay silent before it is closed
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the high-water mark for persistent connections
    pub fn max_persistent(mut self, clients: usize) -> Self {
        self.config.persistent_high_water = clients;
        self
    }

    /// Set the low-water mark for persistent connections
    pub fn min_persistent(mut self, clients: usize) -> Self {
        self.config.persistent_low_water = clients;
        self
    }

    /// Set both idle timeouts of persistent connections
    pub fn persistent_timeouts(mut self, short: Duration, long: Duration) -> Self {
        self.config.persistent_short_timeout = short;
        self.config.persistent_long_timeout = long;
        self
    }

    pub fn no_persistence(mut self, disabled: bool) -> Self {
        self.config.no_persistence = disabled;
        self
    }

    /// Set the keep-alive tiers
    pub fn keepalive(mut self, short: Duration, long: Duration) -> Self {
        self.config.keepalive_short = short;
        self.config.keepalive_long = long;
        self
    }

    pub fn ping_crazy(mut self, enabled: bool) -> Self {
        self.config.ping_crazy = enabled;
        self
    }

    /// Copy all traffic to the side-tap listener at `addr`
    pub fn side_tap(mut self, addr: SocketAddr) -> Self {
        self.config.side_tap = Some(addr);
        self
    }

    /// Use a fixed anti-loop token instead of a random one
    pub fn token(mut self, token: AntiLoopToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Share a lock registry with the device tree, which can then report bus statistics
    pub fn locks(mut self, locks: Arc<LockRegistry>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Build and return the server
    pub fn build<T: DeviceTree>(self, tree: T) -> Server<T> {
        let tokens = match self.token {
            Some(token) => TokenSet::with_token(token),
            None => TokenSet::generate(),
        };
        let locks = self.locks.unwrap_or_default();
        Server {
            context: Arc::new(ServerContext::with_locks(tree, self.config, tokens, locks)),
        }
    }
}

impl<T: DeviceTree> Server<T> {
    pub fn new(tree: T, config: Config) -> Server<T> {
        let tokens = TokenSet::generate();
        Server {
            context: Arc::new(ServerContext::new(tree, config, tokens)),
        }
    }

    /// Shared state of this server: configuration, persistence counters, locks and tokens.
    pub fn context(&self) -> &ServerContext<T> {
        &self.context
    }

    pub async fn listen(&self, addr: impl ToSocketAddrs) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accepts connections on an already bound listener until accepting fails for good.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        log::info!("Server listening on {}", listener.local_addr()?);
        log::debug!("Configuration: {:?}", self.context.config());

        loop {
            match listener.accept().await {
                Ok((tcp, peer)) => {
                    log::info!("New client connection from {}", peer);
                    if let Err(e) = tcp.set_nodelay(true) {
                        log::debug!("Cannot disable Nagle for {}: {}", peer, e);
                    }
                    let tap = match tcp.local_addr() {
                        Ok(host) => self.context.tap(host, peer),
                        Err(_) => None,
                    };
                    let context = Arc::clone(&self.context);
                    tokio::spawn(async move {
                        let (reader, writer) = tcp.into_split();
                        if let Err(e) = session::serve(context, reader, writer, tap).await {
                            log::error!("Client {} error: {}", peer, e);
                        }
                        log::info!("Client {} disconnected", peer);
                    });
                }
                Err(e) => log::error!("Connection error: {}", e),
            }
        }
    }
}

#[test]
fn builder_overrides_defaults() {
    let config = Builder::new()
        .max_persistent(50)
        .min_persistent(25)
        .no_persistence(true)
        .keepalive(Duration::from_millis(10), Duration::from_millis(20))
        .config;
    assert_eq!(config.persistent_high_water, 50);
    assert_eq!(config.persistent_low_water, 25);
    assert!(config.no_persistence);
    assert_eq!(config.keepalive_long, Duration::from_millis(20));
    assert_eq!(config.max_payload_size, MAX_PAYLOAD_SIZE);
}

#[test]
fn builder_shares_the_lock_registry() {
    use crate::query::{DirEntry, Node, QueryContext, QueryResult};
    use nix::errno::Errno;

    #[derive(Debug)]
    struct Nothing;

    impl DeviceTree for Nothing {
        fn resolve(&self, _: &str, _: &QueryContext) -> QueryResult<Node> {
            Err(Errno::ENOENT)
        }

        fn read(&self, _: &Node, _: &QueryContext, _: usize, _: usize) -> QueryResult<Vec<u8>> {
            Err(Errno::ENOENT)
        }

        fn write(&self, _: &Node, _: &QueryContext, _: usize, _: &[u8]) -> QueryResult<()> {
            Err(Errno::ENOENT)
        }

        fn list(&self, _: &Node, _: &QueryContext, _: &mut dyn FnMut(DirEntry)) -> QueryResult<u32> {
            Err(Errno::ENOENT)
        }
    }

    let locks = Arc::new(LockRegistry::new());
    let server = Builder::new().locks(Arc::clone(&locks)).build(Nothing);
    assert!(std::ptr::eq(server.context().locks(), &*locks));
    let own = Builder::new().build(Nothing);
    assert!(!std::ptr::eq(own.context().locks(), &*locks));
}
