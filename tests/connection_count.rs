//! The process-wide live connection gauge.

use muxframe::{ConnectionConfig, active_connection_count};
use muxframe_testing::{EchoHandler, spawn_connection};
use rstest::rstest;
use serial_test::serial;

#[rstest]
#[serial]
#[tokio::test]
async fn gauge_tracks_connection_lifetime() {
    let before = active_connection_count();
    let mut first = spawn_connection(EchoHandler, ConnectionConfig::default());
    let mut second = spawn_connection(EchoHandler, ConnectionConfig::default());
    assert_eq!(active_connection_count(), before + 2);

    first.peer.handshake(&[]).await;
    first.handle.request_shutdown();
    first.join().await.expect("graceful close");
    assert_eq!(active_connection_count(), before + 1);

    second.peer.handshake(&[]).await;
    second.handle.request_shutdown();
    second.join().await.expect("graceful close");
    assert_eq!(active_connection_count(), before);
}

#[rstest]
#[serial]
#[tokio::test]
async fn dropped_connection_releases_its_slot() {
    let before = active_connection_count();
    let conn = spawn_connection(EchoHandler, ConnectionConfig::default());
    assert_eq!(active_connection_count(), before + 1);
    conn.task.abort();
    let _ = conn.task.await;
    assert_eq!(active_connection_count(), before);
}
