use std::{net::SocketAddr, sync::OnceLock};

use nix::errno::Errno;
use ownet_client::{ClientError, OwClient};
use ownet_protocol::{AntiLoopToken, Request};
use ownet_server::{
    DeviceTree,
    query::{Change, DirEntry, Node, QueryContext, QueryResult},
    server::Builder,
};
use ownet_tests::{FakeTree, RawConnection, spawn_server};
use tokio::net::TcpListener;

/// Forwards reads to whichever server is set as upstream.
#[derive(Debug, Default)]
struct Forward {
    upstream: OnceLock<SocketAddr>,
}

impl Forward {
    fn connect(&self, ctx: &QueryContext) -> QueryResult<OwClient> {
        let addr = self.upstream.get().ok_or(Errno::ENODEV)?;
        let mut client = OwClient::new(*addr).map_err(|_| Errno::EIO)?;
        client.set_tokens(ctx.tokens.clone());
        Ok(client)
    }
}

fn to_errno(error: ClientError) -> Errno {
    match error {
        ClientError::Server(errno) => errno,
        _ => Errno::EIO,
    }
}

impl DeviceTree for Forward {
    fn resolve(&self, path: &str, _ctx: &QueryContext) -> QueryResult<Node> {
        Ok(Node::property(path, Change::Static))
    }

    fn read(
        &self,
        node: &Node,
        ctx: &QueryContext,
        offset: usize,
        size: usize,
    ) -> QueryResult<Vec<u8>> {
        self.connect(ctx)?
            .read(&node.path, size, offset)
            .map_err(to_errno)
    }

    fn write(&self, _: &Node, _: &QueryContext, _: usize, _: &[u8]) -> QueryResult<()> {
        Err(Errno::EROFS)
    }

    fn list(
        &self,
        _: &Node,
        _: &QueryContext,
        _: &mut dyn FnMut(DirEntry),
    ) -> QueryResult<u32> {
        Err(Errno::ENOTDIR)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn own_token_is_refused() {
    let token = AntiLoopToken::new([7; 16]);
    let server = Builder::new()
        .token(token)
        .build(FakeTree::new().with_property("/a", "1"));
    let addr = spawn_server(server).await.unwrap();

    tokio::task::spawn_blocking(move || {
        let mut conn = RawConnection::connect(addr).unwrap();
        let tokens = vec![AntiLoopToken::new([1; 16]), token];
        conn.send(&Request::read("/a", 1, 0).with_tokens(tokens))
            .unwrap();
        let response = conn.receive_answer().unwrap().pop().unwrap();
        assert_eq!(response.ret, -(Errno::ELOOP as i32));

        // Foreign tokens only are fine
        let mut conn = RawConnection::connect(addr).unwrap();
        let tokens = vec![AntiLoopToken::new([1; 16])];
        conn.send(&Request::read("/a", 1, 0).with_tokens(tokens))
            .unwrap();
        let response = conn.receive_answer().unwrap().pop().unwrap();
        assert_eq!(response.ret, 1);
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn chain_reaches_the_device() {
    let tree = FakeTree::new().with_property("/a", "42");
    let device = spawn_server(Builder::new().build(tree)).await.unwrap();
    let forward = Forward::default();
    forward.upstream.set(device).unwrap();
    let front = spawn_server(Builder::new().build(forward))
        .await
        .unwrap();

    let value = tokio::task::spawn_blocking(move || {
        OwClient::new(front).unwrap().read("/a", 2, 0).unwrap()
    })
    .await
    .unwrap();
    assert_eq!(value, b"42");
}

#[tokio::test(flavor = "multi_thread")]
async fn forwarding_cycle_is_detected() {
    let first_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let second_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let first_addr = first_listener.local_addr().unwrap();
    let second_addr = second_listener.local_addr().unwrap();

    let first = Forward::default();
    first.upstream.set(second_addr).unwrap();
    let second = Forward::default();
    second.upstream.set(first_addr).unwrap();

    let first = Builder::new().build(first);
    let second = Builder::new().build(second);
    tokio::spawn(async move { first.serve(first_listener).await });
    tokio::spawn(async move { second.serve(second_listener).await });

    let result = tokio::task::spawn_blocking(move || {
        OwClient::new(first_addr).unwrap().read("/a", 2, 0)
    })
    .await
    .unwrap();
    assert!(matches!(result, Err(ClientError::Server(Errno::ELOOP))));
}
