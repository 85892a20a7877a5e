//! Assertion macros shared by integration tests.

/// Receive the next frame from a [`TestPeer`](crate::TestPeer) and assert
/// its kind, panicking with the call site on mismatch.
#[macro_export]
macro_rules! expect_frame {
    ($peer:expr, $kind:pat) => {{
        let frame = $peer.recv().await;
        assert!(
            matches!(frame.kind(), $kind),
            "unexpected {:?} frame on stream {} at {}:{}",
            frame.kind(),
            frame.stream_id(),
            file!(),
            line!()
        );
        frame
    }};
}

/// Await a future under a timeout and panic with contextual diagnostics when
/// it does not finish.
#[macro_export]
macro_rules! within {
    ($limit:expr, $fut:expr) => {{
        ::tokio::time::timeout($limit, $fut)
            .await
            .expect(concat!("timed out at ", file!(), ":", line!()))
    }};
}

pub use crate::{expect_frame, within};
