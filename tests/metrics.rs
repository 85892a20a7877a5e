#![cfg(feature = "metrics")]
//! Tests for `muxframe` metrics helpers.
//!
//! These tests verify that counters and gauges update as expected using
//! `metrics_util::debugging::DebuggingRecorder`.

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use muxframe::{
    ConnectionConfig,
    ErrorCode,
    Frame,
    FrameKind,
    StreamId,
    metrics::{self as mux_metrics, Direction},
};
use muxframe_testing::{FailingHandler, spawn_connection};
use rstest::rstest;
use serial_test::serial;

/// Creates a debugging recorder and snapshotter for metrics testing.
fn debugging_recorder_setup() -> (Snapshotter, DebuggingRecorder) {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    (snapshotter, recorder)
}

fn counter_value(snapshotter: &Snapshotter, name: &str, label: Option<(&str, &str)>) -> u64 {
    snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .filter(|(k, _, _, _)| {
            k.key().name() == name
                && label.is_none_or(|(key, value)| {
                    k.key()
                        .labels()
                        .any(|l| l.key() == key && l.value() == value)
                })
        })
        .map(|(_, _, _, v)| match v {
            DebugValue::Counter(c) => c,
            _ => 0,
        })
        .sum()
}

#[rstest]
#[case(Direction::Inbound)]
#[case(Direction::Outbound)]
fn frame_metric_carries_direction(#[case] direction: Direction) {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || mux_metrics::inc_frames(direction));
    assert_eq!(
        counter_value(
            &snapshotter,
            mux_metrics::FRAMES_PROCESSED,
            Some(("direction", direction.as_str()))
        ),
        1
    );
}

#[test]
fn connection_gauge_moves_both_ways() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        mux_metrics::inc_connections();
        mux_metrics::inc_connections();
        mux_metrics::dec_connections();
    });
    let found = snapshotter.snapshot().into_vec().into_iter().any(|(k, _, _, v)| {
        k.key().name() == mux_metrics::CONNECTIONS_ACTIVE
            && matches!(v, DebugValue::Gauge(g) if (g.into_inner() - 1.0).abs() < f64::EPSILON)
    });
    assert!(found, "active connection gauge not recorded");
}

#[test]
fn shutdown_metric_is_labelled_by_kind() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || mux_metrics::inc_shutdowns("abortive"));
    assert_eq!(
        counter_value(
            &snapshotter,
            mux_metrics::SHUTDOWNS_TOTAL,
            Some(("kind", "abortive"))
        ),
        1
    );
}

/// A running connection reports resets, frames and its close through the
/// recorder installed on the current thread.
#[rstest]
#[serial]
#[tokio::test]
async fn connection_records_resets_and_shutdown() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    let _guard = metrics::set_default_local_recorder(&recorder);

    let mut conn = spawn_connection(
        FailingHandler::Stream(ErrorCode::Cancel),
        ConnectionConfig::default(),
    );
    conn.peer.handshake(&[]).await;
    conn.peer.open_stream(1, b"GET /", true).await;
    let reset = conn
        .peer
        .recv_until(|f| f.kind() == FrameKind::RstStream)
        .await;
    assert_eq!(reset.stream_id(), StreamId::new(1));
    conn.peer.send(Frame::ping(*b"metrics!", false)).await;
    conn.handle.shutdown().await;

    assert_eq!(
        counter_value(&snapshotter, mux_metrics::STREAM_RESETS, None),
        1
    );
    assert_eq!(
        counter_value(
            &snapshotter,
            mux_metrics::SHUTDOWNS_TOTAL,
            Some(("kind", "graceful"))
        ),
        1
    );
    assert!(
        counter_value(
            &snapshotter,
            mux_metrics::FRAMES_PROCESSED,
            Some(("direction", "inbound"))
        ) >= 3
    );
}
