//! Property tests for flow-control accounting.

use muxframe::{
    StreamId,
    flow::{DEFAULT_WINDOW_SIZE, FlowControlError, FlowController, FlowScope, MAX_WINDOW_SIZE},
};
use proptest::prelude::*;

const S1: StreamId = StreamId::new(1);

#[derive(Clone, Debug)]
enum Op {
    Reserve(u32),
    Release(u32),
    GrantStream(u32),
    GrantConnection(u32),
    SetInitial(u32),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u32..40_000).prop_map(Op::Reserve),
        (0u32..40_000).prop_map(Op::Release),
        (1u32..40_000).prop_map(Op::GrantStream),
        (1u32..40_000).prop_map(Op::GrantConnection),
        (0u32..200_000).prop_map(Op::SetInitial),
    ]
}

proptest! {
    /// Reservations never exceed the credit on offer and windows never
    /// exceed the protocol maximum, whatever order operations arrive in.
    #[test]
    fn send_credit_stays_within_bounds(ops in prop::collection::vec(op(), 1..64)) {
        let mut flow = FlowController::new(DEFAULT_WINDOW_SIZE, DEFAULT_WINDOW_SIZE);
        flow.open_stream(S1);
        let mut outstanding: u32 = 0;
        for op in ops {
            match op {
                Op::Reserve(amount) => {
                    let before = flow.available(FlowScope::Stream(S1));
                    let granted = flow.reserve(FlowScope::Stream(S1), amount);
                    prop_assert!(granted <= amount);
                    prop_assert!(granted <= before);
                    outstanding = outstanding.saturating_add(granted);
                }
                Op::Release(amount) => {
                    let amount = amount.min(outstanding);
                    flow.release(FlowScope::Stream(S1), amount);
                    outstanding -= amount;
                }
                Op::GrantStream(delta) => {
                    let _ = flow.grant(FlowScope::Stream(S1), delta);
                }
                Op::GrantConnection(delta) => {
                    let _ = flow.grant(FlowScope::Connection, delta);
                }
                Op::SetInitial(size) => {
                    let _ = flow.set_initial_send_window(size);
                }
            }
            prop_assert!(flow.available(FlowScope::Connection) <= MAX_WINDOW_SIZE);
            prop_assert!(
                flow.available(FlowScope::Stream(S1)) <= flow.available(FlowScope::Connection)
            );
        }
    }

    /// The peer can never deliver more than it was granted.
    #[test]
    fn receive_is_bounded_by_advertised_credit(chunks in prop::collection::vec(1u32..20_000, 1..16)) {
        let mut flow = FlowController::new(DEFAULT_WINDOW_SIZE, DEFAULT_WINDOW_SIZE);
        flow.open_stream(S1);
        let mut accepted: u64 = 0;
        for len in chunks {
            match flow.receive(Some(S1), len) {
                Ok(()) => accepted += u64::from(len),
                Err(err) => {
                    let is_window_error =
                        matches!(err, FlowControlError::ReceiveWindowExceeded { .. });
                    prop_assert!(is_window_error);
                    break;
                }
            }
        }
        prop_assert!(accepted <= u64::from(DEFAULT_WINDOW_SIZE));
    }
}

#[test]
fn consumed_credit_is_returned_to_the_peer() {
    let mut flow = FlowController::new(DEFAULT_WINDOW_SIZE, DEFAULT_WINDOW_SIZE);
    flow.open_stream(S1);
    flow.receive(Some(S1), 40_000).expect("within window");
    let updates = flow.consume(Some(S1), 40_000);
    assert_eq!(updates.connection, Some(40_000));
    assert_eq!(updates.stream, Some(40_000));
    flow.receive(Some(S1), 60_000)
        .expect("returned credit is usable again");
}

#[test]
fn stream_overflow_is_reported_with_stream_scope() {
    let mut flow = FlowController::new(1_000, DEFAULT_WINDOW_SIZE);
    flow.open_stream(S1);
    let err = flow
        .receive(Some(S1), 1_001)
        .expect_err("stream window exceeded");
    assert_eq!(err.scope(), FlowScope::Stream(S1));
}
