use std::{net::TcpListener, time::Duration};

use ownet_client::OwClient;
use ownet_protocol::{ControlFlags, MAX_PAYLOAD_SIZE, Request, Response};
use ownet_server::{server::Builder, sidetap::SideHeader};
use ownet_tests::{FakeTree, RawConnection, spawn_server};

#[tokio::test(flavor = "multi_thread")]
async fn requests_and_responses_are_copied() {
    let side = TcpListener::bind("127.0.0.1:0").unwrap();
    let server = Builder::new()
        .side_tap(side.local_addr().unwrap())
        .keepalive(Duration::from_millis(10), Duration::from_millis(20))
        .build(
            FakeTree::new()
                .with_property("/10.67C6697351FF/temperature", "21")
                .with_latency(Duration::from_millis(100)),
        );
    let addr = spawn_server(server).await.unwrap();

    tokio::task::spawn_blocking(move || {
        let mut conn = RawConnection::connect(addr).unwrap();
        let request = Request::read("/10.67C6697351FF/temperature", 2, 0)
            .with_flags(ControlFlags::default().with_persistent(true));
        conn.send(&request).unwrap();
        let responses = conn.receive_answer().unwrap();
        // Pulsed to the client, but only the answer is copied
        assert!(responses.len() > 1);
        let peer = conn.local_addr().unwrap().to_string();

        let (mut tap, _) = side.accept().unwrap();
        let header = SideHeader::read_from(&mut tap).unwrap();
        assert!(header.version.is_sidetap());
        assert!(!header.is_response());
        assert_eq!(header.host, addr.to_string());
        assert_eq!(header.peer, peer);
        let copied = Request::from_reader(&mut tap, MAX_PAYLOAD_SIZE).unwrap();
        assert_eq!(copied.path, request.path);
        assert_eq!(copied.size, 2);

        let header = SideHeader::read_from(&mut tap).unwrap();
        assert!(header.is_response());
        assert_eq!(header.peer, peer);
        let copied = Response::from_reader(&mut tap, MAX_PAYLOAD_SIZE).unwrap();
        assert!(!copied.keepalive);
        assert_eq!(copied.data, b"21");
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_listener_does_not_disturb_clients() {
    let gone = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let server = Builder::new()
        .side_tap(gone)
        .build(FakeTree::new().with_property("/a", "1"));
    let addr = spawn_server(server).await.unwrap();

    tokio::task::spawn_blocking(move || {
        let mut client = OwClient::new(addr).unwrap().persistent(true);
        for _ in 0..3 {
            assert_eq!(client.read("/a", 1, 0).unwrap(), b"1");
        }
    })
    .await
    .unwrap();
}
