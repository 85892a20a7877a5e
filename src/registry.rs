//! Concurrency-safe table of live streams.
//!
//! [`StreamRegistry`] maps stream identifiers to [`StreamRecord`]s and enforces
//! the per-connection concurrency limit. The live-stream count is published
//! through a `watch` channel so the shutdown path can await the moment the
//! connection becomes idle while racing a drain deadline.
//!
//! Admission checks and count updates happen under the channel's write lock,
//! so two concurrent `create` calls can never both take the last slot and a
//! `create` racing [`StreamRegistry::begin_draining`] is either admitted
//! before the drain or judged against its boundary.

use std::{
    fmt,
    sync::atomic::{AtomicU8, AtomicU32, Ordering},
};

use dashmap::{DashMap, mapref::entry::Entry};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::frame::StreamId;

/// Lifecycle state of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    /// The local side has sent `END_STREAM`.
    HalfClosedLocal,
    /// The peer has sent `END_STREAM`.
    HalfClosedRemote,
    Closed,
    Reset,
}

impl StreamState {
    /// Returns `true` for `Closed` and `Reset`.
    #[must_use]
    pub fn is_terminal(self) -> bool { matches!(self, Self::Closed | Self::Reset) }

    /// Returns `true` while the peer may still send payload.
    #[must_use]
    pub fn accepts_remote_data(self) -> bool { matches!(self, Self::Open | Self::HalfClosedLocal) }

    /// Returns `true` while the local side may still send payload.
    #[must_use]
    pub fn accepts_local_data(self) -> bool { matches!(self, Self::Open | Self::HalfClosedRemote) }

    /// State after the local side sends `END_STREAM`.
    #[must_use]
    pub fn close_local(self) -> Self {
        match self {
            Self::Open | Self::Idle => Self::HalfClosedLocal,
            Self::HalfClosedRemote => Self::Closed,
            other => other,
        }
    }

    /// State after the peer sends `END_STREAM`.
    #[must_use]
    pub fn close_remote(self) -> Self {
        match self {
            Self::Open | Self::Idle => Self::HalfClosedRemote,
            Self::HalfClosedLocal => Self::Closed,
            other => other,
        }
    }
}

/// Why a stream was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefusalReason {
    ConcurrencyLimit { limit: usize },
    Draining,
    Closed,
}

impl fmt::Display for RefusalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConcurrencyLimit { limit } => write!(f, "concurrency limit {limit} reached"),
            Self::Draining => f.write_str("connection is draining"),
            Self::Closed => f.write_str("connection is closed"),
        }
    }
}

/// Errors returned by [`StreamRegistry`] operations.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("stream {id} refused: {reason}")]
    Refused { id: StreamId, reason: RefusalReason },
    #[error("stream {0} not found")]
    NotFound(StreamId),
    #[error("stream {0} already exists")]
    Duplicate(StreamId),
}

/// A registered stream.
#[derive(Clone, Debug)]
pub struct StreamRecord {
    id: StreamId,
    state: StreamState,
    cancel: CancellationToken,
}

impl StreamRecord {
    #[must_use]
    pub fn id(&self) -> StreamId { self.id }

    #[must_use]
    pub fn state(&self) -> StreamState { self.state }

    /// Token cancelled when the stream is reset or aborted.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken { &self.cancel }
}

/// Default scheduling weight for new streams.
pub const DEFAULT_WEIGHT: u16 = 16;

const ADMIT_OPEN: u8 = 0;
const ADMIT_DRAINING: u8 = 1;
const ADMIT_CLOSED: u8 = 2;

/// Table of live streams for one connection.
#[derive(Debug)]
pub struct StreamRegistry {
    streams: DashMap<StreamId, StreamRecord>,
    count: watch::Sender<usize>,
    admission: AtomicU8,
    boundary: AtomicU32,
    limit: usize,
}

impl StreamRegistry {
    /// Create a registry admitting at most `limit` concurrent streams.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        let (count, _) = watch::channel(0);
        Self {
            streams: DashMap::new(),
            count,
            admission: AtomicU8::new(ADMIT_OPEN),
            boundary: AtomicU32::new(0),
            limit,
        }
    }

    /// Register a new stream in the `Open` state.
    ///
    /// `parent` is the connection-wide cancellation token; the stream's own
    /// token is a child of it so aborting the connection cancels every stream.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Refused`] when the limit is reached, when the
    /// connection is draining and `id` lies above the drain boundary, or once
    /// the connection is closed. Returns [`RegistryError::Duplicate`] if `id`
    /// is already registered.
    pub fn create(
        &self,
        id: StreamId,
        parent: &CancellationToken,
    ) -> Result<StreamRecord, RegistryError> {
        let mut outcome = Err(RegistryError::NotFound(id));
        self.count.send_if_modified(|count| {
            let refusal = match self.admission.load(Ordering::Acquire) {
                ADMIT_DRAINING if id.get() > self.boundary.load(Ordering::Acquire) => {
                    Some(RefusalReason::Draining)
                }
                ADMIT_CLOSED => Some(RefusalReason::Closed),
                _ if *count >= self.limit => Some(RefusalReason::ConcurrencyLimit {
                    limit: self.limit,
                }),
                _ => None,
            };
            if let Some(reason) = refusal {
                outcome = Err(RegistryError::Refused { id, reason });
                return false;
            }
            match self.streams.entry(id) {
                Entry::Occupied(_) => {
                    outcome = Err(RegistryError::Duplicate(id));
                    false
                }
                Entry::Vacant(slot) => {
                    let record = StreamRecord {
                        id,
                        state: StreamState::Open,
                        cancel: parent.child_token(),
                    };
                    slot.insert(record.clone());
                    outcome = Ok(record);
                    *count += 1;
                    true
                }
            }
        });
        outcome
    }

    /// Snapshot of the record for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if `id` is not registered.
    pub fn get(&self, id: StreamId) -> Result<StreamRecord, RegistryError> {
        self.streams
            .get(&id)
            .map(|record| record.clone())
            .ok_or(RegistryError::NotFound(id))
    }

    /// Apply a state transition, returning the previous state.
    ///
    /// Terminal states are sticky: once a stream is `Closed` or `Reset` its
    /// state no longer changes, which guarantees the closing transition runs
    /// exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if `id` is not registered.
    pub fn transition(
        &self,
        id: StreamId,
        next: impl FnOnce(StreamState) -> StreamState,
    ) -> Result<StreamState, RegistryError> {
        let mut record = self
            .streams
            .get_mut(&id)
            .ok_or(RegistryError::NotFound(id))?;
        let previous = record.state;
        if !previous.is_terminal() {
            record.state = next(previous);
        }
        Ok(previous)
    }

    /// Move `id` into a terminal state and cancel its handler.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn terminate(&self, id: StreamId, terminal: StreamState) -> bool {
        let Some(mut record) = self.streams.get_mut(&id) else {
            return false;
        };
        if record.state.is_terminal() {
            return false;
        }
        record.state = terminal;
        if terminal == StreamState::Reset {
            record.cancel.cancel();
        }
        true
    }

    /// Remove `id`, returning its record the first time only.
    pub fn remove(&self, id: StreamId) -> Option<StreamRecord> {
        let mut removed = None;
        self.count.send_if_modified(|count| {
            removed = self.streams.remove(&id).map(|(_, record)| record);
            if removed.is_some() {
                *count = count.saturating_sub(1);
                true
            } else {
                false
            }
        });
        removed
    }

    /// Invoke `f` for every stream that is not yet closed or reset.
    ///
    /// `f` runs while a shard lock is held and must not call back into the
    /// registry.
    pub fn for_each_open(&self, mut f: impl FnMut(&StreamRecord)) {
        for entry in &self.streams {
            if !entry.state.is_terminal() {
                f(entry.value());
            }
        }
    }

    /// Identifiers of streams that are not yet closed or reset, in ascending order.
    #[must_use]
    pub fn open_ids(&self) -> Vec<StreamId> {
        let mut ids = Vec::new();
        self.for_each_open(|record| ids.push(record.id));
        ids.sort_unstable();
        ids
    }

    /// Number of registered streams, including ones whose final frames are
    /// still being flushed.
    #[must_use]
    pub fn open_count(&self) -> usize { *self.count.borrow() }

    /// Resolve once no streams remain registered.
    pub async fn wait_idle(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    /// Refuse streams above `boundary` from now on.
    ///
    /// Streams at or below the boundary were announced as still processed
    /// and may register until the connection closes. Has no effect once the
    /// registry is already draining or closed.
    pub fn begin_draining(&self, boundary: StreamId) {
        self.count.send_if_modified(|_| {
            if self.admission.load(Ordering::Acquire) == ADMIT_OPEN {
                self.boundary.store(boundary.get(), Ordering::Release);
                self.admission.store(ADMIT_DRAINING, Ordering::Release);
            }
            false
        });
    }

    /// Refuse every new stream. Final.
    pub fn close(&self) {
        self.count.send_if_modified(|_| {
            self.admission.store(ADMIT_CLOSED, Ordering::Release);
            false
        });
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use rstest::{fixture, rstest};

    use super::*;

    #[fixture]
    fn registry() -> StreamRegistry { StreamRegistry::new(2) }

    fn id(raw: u32) -> StreamId { StreamId::new(raw) }

    #[rstest]
    fn create_enforces_limit(registry: StreamRegistry) {
        let parent = CancellationToken::new();
        registry.create(id(1), &parent).expect("first");
        registry.create(id(3), &parent).expect("second");
        assert_eq!(
            registry.create(id(5), &parent).map(|r| r.id()),
            Err(RegistryError::Refused {
                id: id(5),
                reason: RefusalReason::ConcurrencyLimit { limit: 2 }
            })
        );
        assert_eq!(registry.open_count(), 2);
    }

    #[rstest]
    fn duplicate_is_rejected(registry: StreamRegistry) {
        let parent = CancellationToken::new();
        registry.create(id(1), &parent).expect("create");
        assert_eq!(
            registry.create(id(1), &parent).map(|r| r.id()),
            Err(RegistryError::Duplicate(id(1)))
        );
        assert_eq!(registry.open_count(), 1);
    }

    #[rstest]
    fn draining_refuses_streams_above_the_boundary(registry: StreamRegistry) {
        let parent = CancellationToken::new();
        registry.begin_draining(id(3));
        assert!(matches!(
            registry.create(id(5), &parent),
            Err(RegistryError::Refused {
                reason: RefusalReason::Draining,
                ..
            })
        ));
        registry.create(id(3), &parent).expect("announced stream still admitted");
        registry.begin_draining(id(7));
        assert!(matches!(
            registry.create(id(5), &parent),
            Err(RegistryError::Refused {
                reason: RefusalReason::Draining,
                ..
            })
        ));
    }

    #[rstest]
    fn closed_refuses_every_stream(registry: StreamRegistry) {
        let parent = CancellationToken::new();
        registry.begin_draining(id(9));
        registry.close();
        registry.begin_draining(id(9));
        assert!(matches!(
            registry.create(id(1), &parent),
            Err(RegistryError::Refused {
                reason: RefusalReason::Closed,
                ..
            })
        ));
    }

    #[rstest]
    fn remove_decrements_once(registry: StreamRegistry) {
        let parent = CancellationToken::new();
        registry.create(id(1), &parent).expect("create");
        assert!(registry.remove(id(1)).is_some());
        assert!(registry.remove(id(1)).is_none());
        assert_eq!(registry.open_count(), 0);
        assert_eq!(registry.get(id(1)).map(|r| r.id()), Err(RegistryError::NotFound(id(1))));
    }

    #[rstest]
    fn terminal_state_is_sticky(registry: StreamRegistry) {
        let parent = CancellationToken::new();
        let record = registry.create(id(1), &parent).expect("create");
        assert!(registry.terminate(id(1), StreamState::Reset));
        assert!(record.cancel_token().is_cancelled());
        assert!(!registry.terminate(id(1), StreamState::Closed));
        registry
            .transition(id(1), StreamState::close_local)
            .expect("transition");
        assert_eq!(registry.get(id(1)).expect("get").state(), StreamState::Reset);
        assert!(registry.open_ids().is_empty());
    }

    #[rstest]
    fn parent_cancellation_reaches_streams(registry: StreamRegistry) {
        let parent = CancellationToken::new();
        let record = registry.create(id(1), &parent).expect("create");
        parent.cancel();
        assert!(record.cancel_token().is_cancelled());
    }

    #[test]
    fn half_close_transitions() {
        assert_eq!(StreamState::Open.close_remote(), StreamState::HalfClosedRemote);
        assert_eq!(StreamState::HalfClosedRemote.close_local(), StreamState::Closed);
        assert_eq!(StreamState::HalfClosedLocal.close_remote(), StreamState::Closed);
        assert!(!StreamState::HalfClosedRemote.accepts_remote_data());
        assert!(StreamState::HalfClosedRemote.accepts_local_data());
    }

    #[tokio::test]
    async fn wait_idle_resolves_after_last_removal() {
        let registry = Arc::new(StreamRegistry::new(4));
        let parent = CancellationToken::new();
        registry.create(id(1), &parent).expect("create");
        registry.create(id(3), &parent).expect("create");

        let waiter = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move { registry.wait_idle().await }
        });
        registry.remove(id(1));
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        registry.remove(id(3));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("idle in time")
            .expect("waiter task");
    }

    #[test]
    fn concurrent_creates_never_exceed_limit() {
        let registry = Arc::new(StreamRegistry::new(8));
        let parent = CancellationToken::new();
        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let registry = Arc::clone(&registry);
                let parent = parent.clone();
                std::thread::spawn(move || {
                    (0..16u32)
                        .filter(|n| registry.create(id(t * 64 + n * 2 + 1), &parent).is_ok())
                        .count()
                })
            })
            .collect();
        let admitted: usize = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .sum();
        assert_eq!(admitted, 8);
        assert_eq!(registry.open_count(), 8);
    }
}
