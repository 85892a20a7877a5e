//! End-to-end tests for `MuxServer` over TCP.

use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use muxframe::{
    ConnectionConfig,
    ErrorCode,
    Frame,
    FrameCodec,
    FrameKind,
    MuxServer,
    StreamId,
};
use muxframe_testing::{EchoHandler, Gate, GatedHandler, within};
use rstest::{fixture, rstest};
use tokio::{
    net::TcpStream,
    sync::oneshot,
    time::{Duration, timeout},
};
use tokio_util::codec::Framed;

const LIMIT: Duration = Duration::from_secs(5);

#[fixture]
fn free_listener() -> StdTcpListener {
    StdTcpListener::bind(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0))
        .expect("bind free port listener")
}

async fn connect(addr: SocketAddr) -> Framed<TcpStream, FrameCodec> {
    let stream = TcpStream::connect(addr).await.expect("connect to server");
    let mut framed = Framed::new(stream, FrameCodec::default());
    framed
        .send(Frame::settings(&[]))
        .await
        .expect("send settings");
    framed
}

async fn next_of(framed: &mut Framed<TcpStream, FrameCodec>, kind: FrameKind) -> Frame {
    loop {
        let frame = timeout(LIMIT, framed.next())
            .await
            .expect("frame before timeout")
            .expect("connection open")
            .expect("valid frame");
        if frame.kind() == kind {
            return frame;
        }
    }
}

#[rstest]
#[tokio::test]
async fn serves_streams_over_tcp(free_listener: StdTcpListener) {
    let server = MuxServer::new(EchoHandler, ConnectionConfig::default())
        .workers(1)
        .bind_existing_listener(free_listener)
        .expect("bind listener");
    let addr = server.local_addr().expect("bound address");
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(server.run_with_shutdown(async {
        let _ = stop_rx.await;
    }));

    let mut client = connect(addr).await;
    client
        .send(Frame::headers(
            StreamId::new(1),
            Bytes::from_static(b"GET /tcp"),
            false,
            true,
        ))
        .await
        .expect("send headers");
    client
        .send(Frame::data(StreamId::new(1), Bytes::from_static(b"over tcp"), true))
        .await
        .expect("send data");

    let headers = next_of(&mut client, FrameKind::Headers).await;
    assert_eq!(headers.payload().as_ref(), b"GET /tcp");
    let data = next_of(&mut client, FrameKind::Data).await;
    assert_eq!(data.payload().as_ref(), b"over tcp");
    assert!(data.is_end_stream());

    let _ = stop_tx.send(());
    within!(LIMIT, task)
        .expect("server task joins")
        .expect("server stops cleanly");
}

#[rstest]
#[tokio::test]
async fn server_shutdown_drains_open_connections(free_listener: StdTcpListener) {
    let gate = Gate::new();
    let config = ConnectionConfig::default().with_grace_period(Duration::from_secs(10));
    let server = MuxServer::new(GatedHandler::new(gate.clone(), b"drained"), config)
        .workers(1)
        .bind_existing_listener(free_listener)
        .expect("bind listener");
    let addr = server.local_addr().expect("bound address");
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(server.run_with_shutdown(async {
        let _ = stop_rx.await;
    }));

    let mut client = connect(addr).await;
    client
        .send(Frame::headers(
            StreamId::new(1),
            Bytes::from_static(b"GET /"),
            true,
            true,
        ))
        .await
        .expect("send headers");
    next_of(&mut client, FrameKind::Headers).await;
    gate.wait_entered(1).await;

    let _ = stop_tx.send(());
    let goaway = next_of(&mut client, FrameKind::GoAway).await;
    let payload = goaway.go_away_payload().expect("valid GOAWAY");
    assert_eq!(payload.last_stream_id, StreamId::new(1));
    assert_eq!(payload.error_code, ErrorCode::NoError);
    assert!(!task.is_finished());

    gate.open();
    let data = next_of(&mut client, FrameKind::Data).await;
    assert_eq!(data.payload().as_ref(), b"drained");
    within!(LIMIT, task)
        .expect("server task joins")
        .expect("server stops cleanly");
}
