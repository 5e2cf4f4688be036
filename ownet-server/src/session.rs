//! One client connection: read a request, decide on persistence, answer, then either wait
//! for the next request or close.
use std::sync::Arc;

use futures::StreamExt;
use nix::errno::Errno;
use ownet_protocol::{
    ControlFlags, Request, Version, error::ReadError, tokio_codec::ServerCodec,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time::timeout,
};
use tokio_util::codec::FramedRead;

use crate::{
    DeviceTree,
    context::ServerContext,
    dispatch::{Dispatcher, ResponseTemplate},
    keepalive::{Outbound, Pulse, supervise},
    persistence::PersistenceSlot,
    sidetap::Tap,
};

struct Session<T: DeviceTree, R, W> {
    context: Arc<ServerContext<T>>,
    requests: FramedRead<R, ServerCodec>,
    outbound: Outbound<W>,
    dispatcher: Dispatcher<T>,
    /// Held while this connection is granted persistence
    slot: Option<PersistenceSlot>,
    tap: Option<Tap>,
}

/// Serves requests on one connection until it is closed, times out or is not persistent.
pub(crate) async fn serve<T, R, W>(
    context: Arc<ServerContext<T>>,
    reader: R,
    writer: W,
    tap: Option<Tap>,
) -> Result<(), ReadError>
where
    T: DeviceTree,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let session = Session {
        requests: FramedRead::new(
            reader,
            ServerCodec::new(context.config().max_payload_size),
        ),
        outbound: Outbound::with_tap(writer, tap.clone()),
        dispatcher: Dispatcher::new(Arc::clone(&context)),
        context,
        slot: None,
        tap,
    };
    session.run().await
}

impl<T, R, W> Session<T, R, W>
where
    T: DeviceTree,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self) -> Result<(), ReadError> {
        let mut next = self.first_request().await;
        loop {
            let request = match next {
                None => break,
                Some(Ok(request)) => request,
                Some(Err(ReadError::IoError(e))) => return Err(ReadError::IoError(e)),
                Some(Err(e)) => {
                    log::warn!("Rejecting malformed request: {}", e);
                    self.reject(&e).await?;
                    break;
                }
            };
            if !self.handle(request).await? {
                break;
            }
            next = self.next_request().await;
        }
        // Dropping the session gives the persistence slot back
        Ok(())
    }

    async fn first_request(&mut self) -> Option<Result<Request, ReadError>> {
        let wait = self.context.config().request_timeout;
        match timeout(wait, self.requests.next()).await {
            Ok(next) => next,
            Err(_) => {
                log::debug!("No request within {:?}, closing", wait);
                None
            }
        }
    }

    /// Waits for the next request on a persistent connection. After the short timeout
    /// the connection only lingers if the server is not short of persistent slots.
    async fn next_request(&mut self) -> Option<Result<Request, ReadError>> {
        let config = self.context.config();
        if let Ok(next) = timeout(config.persistent_short_timeout, self.requests.next()).await {
            return next;
        }
        if !self.context.persistence().below_low_water() {
            log::debug!("Idle persistent connection closed, server is busy");
            return None;
        }
        match timeout(config.persistent_long_timeout, self.requests.next()).await {
            Ok(next) => next,
            Err(_) => {
                log::debug!("Idle persistent connection timed out");
                None
            }
        }
    }

    /// Answers one request. Returns whether the connection stays open afterwards.
    async fn handle(&mut self, request: Request) -> Result<bool, ReadError> {
        log::debug!(
            "Request {} version={} flags={:#010x} path={:?} size={} offset={} tokens={}",
            request.kind,
            request.version,
            request.flags.bits(),
            request.path,
            request.size,
            request.offset,
            request.tokens.len()
        );
        log::trace!("Request data: {:02x?}", &request.data[..]);
        if let Some(tap) = &self.tap {
            tap.request(&request).await;
        }

        let granted = self.negotiate(request.flags.persistent());
        let reply = ResponseTemplate {
            version: request.version,
            flags: request.flags.with_persistent(granted),
        };

        let dispatcher = self.dispatcher.clone();
        let outbound = self.outbound.clone();
        let work = async move { dispatcher.dispatch(&request, reply, &outbound).await };
        supervise(
            &self.outbound,
            reply,
            Pulse::from_config(self.context.config()),
            work,
        )
        .await?;
        Ok(granted)
    }

    /// Grants or revokes persistence for the coming response.
    fn negotiate(&mut self, requested: bool) -> bool {
        if !requested || self.context.config().no_persistence {
            self.slot = None;
            return false;
        }
        if self.slot.is_none() {
            self.slot = self.context.persistence().try_acquire();
        }
        self.slot.is_some()
    }

    /// Answers a request that could not be decoded. The connection is closed afterwards.
    async fn reject(&mut self, error: &ReadError) -> Result<(), ReadError> {
        let errno = match error {
            ReadError::TooManyBytes { .. } => Errno::EMSGSIZE,
            _ => Errno::EBADMSG,
        };
        // Mirror the client's header if at least that much could be read
        let reply = match self.requests.decoder().last_header() {
            Some(header) => ResponseTemplate {
                version: header.version,
                flags: header.flags.with_persistent(false),
            },
            None => ResponseTemplate {
                version: Version::default(),
                flags: ControlFlags::default(),
            },
        };
        self.outbound.send(reply.error(errno)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::serve;
    use crate::{
        DeviceTree,
        antiloop::TokenSet,
        context::ServerContext,
        query::{DirEntry, Node, QueryContext, QueryResult},
        server::Config,
    };
    use nix::errno::Errno;
    use ownet_protocol::{ControlFlags, MAX_PAYLOAD_SIZE, Request, Response};
    use std::{io::Cursor, sync::Arc, time::Duration};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    #[derive(Debug)]
    struct Empty;

    impl DeviceTree for Empty {
        fn resolve(&self, path: &str, _ctx: &QueryContext) -> QueryResult<Node> {
            Ok(Node::directory(path))
        }

        fn read(&self, _: &Node, _: &QueryContext, _: usize, _: usize) -> QueryResult<Vec<u8>> {
            Err(Errno::EISDIR)
        }

        fn write(&self, _: &Node, _: &QueryContext, _: usize, _: &[u8]) -> QueryResult<()> {
            Err(Errno::EISDIR)
        }

        fn list(
            &self,
            _: &Node,
            _: &QueryContext,
            _: &mut dyn FnMut(DirEntry),
        ) -> QueryResult<u32> {
            Ok(0)
        }
    }

    fn context(config: Config) -> Arc<ServerContext<Empty>> {
        Arc::new(ServerContext::new(Empty, config, TokenSet::generate()))
    }

    fn parse(bytes: Vec<u8>) -> Vec<Response> {
        let mut cursor = Cursor::new(bytes);
        let mut responses = Vec::new();
        while (cursor.position() as usize) < cursor.get_ref().len() {
            responses.push(Response::from_reader(&mut cursor, MAX_PAYLOAD_SIZE).unwrap());
        }
        responses
    }

    fn persistent(request: Request) -> Request {
        request.with_flags(ControlFlags::default().with_persistent(true))
    }

    #[tokio::test]
    async fn closes_after_a_non_persistent_request() {
        let context = context(Config::default());
        let (client, server) = duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let session = tokio::spawn(serve(Arc::clone(&context), server_read, server_write, None));

        client_write.write_all(&Request::nop().to_bytes()).await.unwrap();
        session.await.unwrap().unwrap();
        let mut bytes = Vec::new();
        client_read.read_to_end(&mut bytes).await.unwrap();
        let responses = parse(bytes);
        assert_eq!(responses.len(), 1);
        assert!(!responses[0].flags.persistent());
    }

    #[tokio::test]
    async fn persistent_session_holds_one_slot() {
        let context = context(Config::default());
        let (client, server) = duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let session = tokio::spawn(serve(Arc::clone(&context), server_read, server_write, None));

        for _ in 0..3 {
            client_write
                .write_all(&persistent(Request::nop()).to_bytes())
                .await
                .unwrap();
            let mut header = [0u8; 24];
            client_read.read_exact(&mut header).await.unwrap();
            let response = Response::from_reader(&mut Cursor::new(header), 0).unwrap();
            assert!(response.flags.persistent());
            assert_eq!(context.persistence().current(), 1);
        }
        drop(client_write);
        session.await.unwrap().unwrap();
        assert_eq!(context.persistence().current(), 0);
    }

    #[tokio::test]
    async fn disabled_persistence_is_never_granted() {
        let context = context(Config {
            no_persistence: true,
            ..Config::default()
        });
        let (client, server) = duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let session = tokio::spawn(serve(Arc::clone(&context), server_read, server_write, None));

        client_write
            .write_all(&persistent(Request::nop()).to_bytes())
            .await
            .unwrap();
        session.await.unwrap().unwrap();
        let mut bytes = Vec::new();
        client_read.read_to_end(&mut bytes).await.unwrap();
        assert!(!parse(bytes)[0].flags.persistent());
        assert_eq!(context.persistence().current(), 0);
    }

    #[tokio::test]
    async fn oversized_request_is_answered_then_closed() {
        let context = context(Config {
            max_payload_size: 16,
            ..Config::default()
        });
        let (client, server) = duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let session = tokio::spawn(serve(Arc::clone(&context), server_read, server_write, None));

        let flags = ControlFlags::default()
            .with_persistent(true)
            .with(ControlFlags::BUS_RETURN, true);
        let request = Request::read("/a/path/longer/than/sixteen/bytes", 10, 0).with_flags(flags);
        client_write.write_all(&request.to_bytes()).await.unwrap();
        session.await.unwrap().unwrap();
        let mut bytes = Vec::new();
        client_read.read_to_end(&mut bytes).await.unwrap();
        let responses = parse(bytes);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].ret, -(Errno::EMSGSIZE as i32));
        // The client's header is echoed, minus the persistence grant
        assert!(responses[0].flags.bus_return());
        assert!(!responses[0].flags.persistent());
        assert_eq!(responses[0].version, request.version);
    }

    #[tokio::test]
    async fn silent_client_is_dropped() {
        let context = context(Config {
            request_timeout: Duration::from_millis(20),
            ..Config::default()
        });
        let (_client, server) = duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            serve(context, server_read, server_write, None),
        )
        .await;
        assert!(matches!(result, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn idle_persistent_connection_closes_when_busy() {
        let context = context(Config {
            persistent_high_water: 2,
            persistent_low_water: 1,
            persistent_short_timeout: Duration::from_millis(20),
            persistent_long_timeout: Duration::from_secs(3600),
            ..Config::default()
        });
        let (client, server) = duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let session = tokio::spawn(serve(Arc::clone(&context), server_read, server_write, None));

        client_write
            .write_all(&persistent(Request::nop()).to_bytes())
            .await
            .unwrap();
        // Our own slot puts the server at its low-water mark, so no long wait
        let closed = tokio::time::timeout(Duration::from_secs(2), session).await;
        assert!(closed.is_ok());
        let mut bytes = Vec::new();
        client_read.read_to_end(&mut bytes).await.unwrap();
        assert!(parse(bytes)[0].flags.persistent());
        assert_eq!(context.persistence().current(), 0);
    }
}
