use std::{net::TcpListener, thread, time::Duration};

use nix::errno::Errno;
use ownet_client::{ClientError, OwClient};
use ownet_protocol::{
    ControlFlags, MAX_PAYLOAD_SIZE, MessageKind, Request, Response, Version,
};
use ownet_server::server::Builder;
use ownet_tests::{FakeTree, spawn_server};

#[tokio::test(flavor = "multi_thread")]
async fn reconnects_after_the_server_closed_an_idle_connection() {
    let server = Builder::new()
        .min_persistent(0)
        .persistent_timeouts(Duration::from_millis(50), Duration::from_millis(50))
        .build(FakeTree::new().with_property("/a", "1"));
    let addr = spawn_server(server).await.unwrap();

    tokio::task::spawn_blocking(move || {
        let mut client = OwClient::new(addr).unwrap().persistent(true);
        assert_eq!(client.read("/a", 1, 0).unwrap(), b"1");
        assert!(client.is_connected());
        thread::sleep(Duration::from_millis(300));
        // The server has hung up in the meantime
        assert_eq!(client.read("/a", 1, 0).unwrap(), b"1");
        assert!(client.is_connected());
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn non_persistent_client_drops_the_connection() {
    let server = Builder::new().build(FakeTree::new().with_property("/a", "1"));
    let addr = spawn_server(server).await.unwrap();

    tokio::task::spawn_blocking(move || {
        let mut client = OwClient::new(addr).unwrap();
        client.nop().unwrap();
        assert!(!client.is_connected());
        client.write("/a", b"2", 0).unwrap();
        assert_eq!(client.read("/a", 10, 0).unwrap(), b"2");
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn server_errors_are_reported() {
    let server = Builder::new().build(FakeTree::new().with_read_only("/type", "DS2408"));
    let addr = spawn_server(server).await.unwrap();

    tokio::task::spawn_blocking(move || {
        let mut client = OwClient::new(addr).unwrap();
        assert!(matches!(
            client.write("/type", b"DS18B20", 0),
            Err(ClientError::Server(Errno::EROFS))
        ));
        assert!(matches!(
            client.read("/nothing", 10, 0),
            Err(ClientError::Server(Errno::ENOENT))
        ));
    })
    .await
    .unwrap();
}

/// Serves `connections` requests the way servers without `dirall` do.
fn spawn_legacy_server(connections: usize) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for _ in 0..connections {
            let (mut tcp, _) = listener.accept().unwrap();
            let request = Request::from_reader(&mut tcp, MAX_PAYLOAD_SIZE).unwrap();
            let base = Response::new(Version::default(), ControlFlags::default());
            match request.kind {
                MessageKind::Dir => {
                    for entry in ["/10.67C6697351FF", "/29.ABCDEF012345"] {
                        let mut data = entry.as_bytes().to_vec();
                        data.push(0);
                        let element = Response {
                            size: entry.len() as i32,
                            data,
                            ..base.clone()
                        };
                        element.write_to(&mut tcp).unwrap();
                    }
                    base.write_to(&mut tcp).unwrap();
                }
                _ => {
                    let unsupported = Response {
                        ret: -(Errno::ENOMSG as i32),
                        ..base
                    };
                    unsupported.write_to(&mut tcp).unwrap();
                }
            }
        }
    });
    addr
}

#[test]
fn dirall_falls_back_to_dir() {
    let addr = spawn_legacy_server(2);
    let mut client = OwClient::new(addr).unwrap();
    let listing = client.dir_all("/", false).unwrap();
    assert_eq!(listing.entries, ["/10.67C6697351FF", "/29.ABCDEF012345"]);
}
