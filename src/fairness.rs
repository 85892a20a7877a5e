//! Weighted deficit round-robin over streams with queued output.
//!
//! Each round a stream earns a quantum of bytes proportional to its weight.
//! A stream that cannot send because it has no flow-control credit is skipped
//! for the round but keeps its place in the ring, so one stalled stream never
//! holds back the others.

use std::collections::{HashMap, VecDeque};

use crate::{frame::StreamId, registry::DEFAULT_WEIGHT};

/// State of a stream's queue after its turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Backlog {
    /// Nothing left to send.
    Drained,
    /// More to send once the stream is served again.
    Pending,
    /// Output is queued but flow-control credit is exhausted.
    Blocked,
}

/// Result of serving one stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Turn {
    pub(crate) frames: usize,
    pub(crate) bytes: usize,
    pub(crate) backlog: Backlog,
}

impl Turn {
    pub(crate) fn drained(frames: usize, bytes: usize) -> Self {
        Self {
            frames,
            bytes,
            backlog: Backlog::Drained,
        }
    }
}

#[derive(Debug)]
struct Entry {
    weight: u16,
    deficit: usize,
}

#[derive(Debug)]
pub(crate) struct FairScheduler {
    quantum: usize,
    ring: VecDeque<StreamId>,
    entries: HashMap<StreamId, Entry>,
}

impl FairScheduler {
    /// `quantum` is the byte allowance per round for a stream of default weight.
    pub(crate) fn new(quantum: usize) -> Self {
        Self {
            quantum: quantum.max(1),
            ring: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    pub(crate) fn set_quantum(&mut self, quantum: usize) { self.quantum = quantum.max(1); }

    /// Mark `id` as having output queued.
    pub(crate) fn activate(&mut self, id: StreamId, weight: u16) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.weight = weight;
            return;
        }
        self.entries.insert(id, Entry { weight, deficit: 0 });
        self.ring.push_back(id);
    }

    pub(crate) fn set_weight(&mut self, id: StreamId, weight: u16) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.weight = weight;
        }
    }

    pub(crate) fn remove(&mut self, id: StreamId) {
        if self.entries.remove(&id).is_some() {
            self.ring.retain(|queued| *queued != id);
        }
    }

    pub(crate) fn is_empty(&self) -> bool { self.ring.is_empty() }

    fn allowance(&self, weight: u16) -> usize {
        (self.quantum * usize::from(weight) / usize::from(DEFAULT_WEIGHT)).max(1)
    }

    /// Serve active streams round by round until a full round makes no progress.
    ///
    /// `serve` receives the stream and its byte allowance for the turn.
    pub(crate) fn run(&mut self, mut serve: impl FnMut(StreamId, usize) -> Turn) {
        loop {
            let mut progressed = false;
            for _ in 0..self.ring.len() {
                let Some(id) = self.ring.pop_front() else {
                    break;
                };
                let Some(weight) = self.entries.get(&id).map(|e| e.weight) else {
                    continue;
                };
                let allowance = self.allowance(weight);
                let Some(entry) = self.entries.get_mut(&id) else {
                    continue;
                };
                entry.deficit = entry.deficit.saturating_add(allowance);
                let turn = serve(id, entry.deficit);
                progressed |= turn.frames > 0;
                match turn.backlog {
                    Backlog::Drained => {
                        self.entries.remove(&id);
                    }
                    Backlog::Pending => {
                        entry.deficit = entry.deficit.saturating_sub(turn.bytes);
                        self.ring.push_back(id);
                    }
                    Backlog::Blocked => {
                        entry.deficit = 0;
                        self.ring.push_back(id);
                    }
                }
            }
            if !progressed || self.ring.is_empty() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rstest::rstest;

    use super::*;

    /// Streams with a fixed amount of queued bytes and optional credit.
    struct Queues {
        queued: HashMap<StreamId, usize>,
        credit: HashMap<StreamId, usize>,
        order: Vec<(StreamId, usize)>,
    }

    impl Queues {
        fn serve(&mut self, id: StreamId, allowance: usize) -> Turn {
            let queued = self.queued.entry(id).or_default();
            let credit = self.credit.entry(id).or_insert(usize::MAX);
            let sent = (*queued).min(allowance).min(*credit);
            *queued -= sent;
            *credit -= sent;
            if sent > 0 {
                self.order.push((id, sent));
            }
            let backlog = if *queued == 0 {
                Backlog::Drained
            } else if *credit == 0 {
                Backlog::Blocked
            } else {
                Backlog::Pending
            };
            Turn {
                frames: usize::from(sent > 0),
                bytes: sent,
                backlog,
            }
        }
    }

    fn id(raw: u32) -> StreamId { StreamId::new(raw) }

    #[rstest]
    fn streams_alternate_per_round() {
        let mut scheduler = FairScheduler::new(10);
        let mut queues = Queues {
            queued: HashMap::from([(id(1), 25), (id(3), 25)]),
            credit: HashMap::new(),
            order: Vec::new(),
        };
        scheduler.activate(id(1), DEFAULT_WEIGHT);
        scheduler.activate(id(3), DEFAULT_WEIGHT);
        scheduler.run(|stream, allowance| queues.serve(stream, allowance));
        let ids: Vec<_> = queues.order.iter().map(|(s, _)| s.get()).collect();
        assert_eq!(ids, vec![1, 3, 1, 3, 1, 3]);
        assert!(scheduler.is_empty());
    }

    #[rstest]
    fn heavier_streams_get_more_per_round() {
        let mut scheduler = FairScheduler::new(16);
        let mut queues = Queues {
            queued: HashMap::from([(id(1), 1000), (id(3), 1000)]),
            credit: HashMap::from([(id(1), 64), (id(3), 64)]),
            order: Vec::new(),
        };
        scheduler.activate(id(1), 32);
        scheduler.activate(id(3), 16);
        scheduler.run(|stream, allowance| queues.serve(stream, allowance));
        assert_eq!(queues.order.first(), Some(&(id(1), 32)));
        assert_eq!(queues.order.get(1), Some(&(id(3), 16)));
    }

    #[rstest]
    fn blocked_stream_does_not_starve_others() {
        let mut scheduler = FairScheduler::new(10);
        let mut queues = Queues {
            queued: HashMap::from([(id(1), 100), (id(3), 30)]),
            credit: HashMap::from([(id(1), 0)]),
            order: Vec::new(),
        };
        scheduler.activate(id(1), DEFAULT_WEIGHT);
        scheduler.activate(id(3), DEFAULT_WEIGHT);
        scheduler.run(|stream, allowance| queues.serve(stream, allowance));
        let sent: usize = queues
            .order
            .iter()
            .filter(|(s, _)| *s == id(3))
            .map(|(_, n)| n)
            .sum();
        assert_eq!(sent, 30);
        assert!(!scheduler.is_empty(), "blocked stream stays scheduled");

        queues.credit.insert(id(1), 100);
        scheduler.run(|stream, allowance| queues.serve(stream, allowance));
        assert!(scheduler.is_empty());
    }

    #[rstest]
    fn removed_streams_are_skipped() {
        let mut scheduler = FairScheduler::new(10);
        scheduler.activate(id(1), DEFAULT_WEIGHT);
        scheduler.activate(id(3), DEFAULT_WEIGHT);
        scheduler.remove(id(1));
        let mut served = Vec::new();
        scheduler.run(|stream, _| {
            served.push(stream);
            Turn::drained(1, 0)
        });
        assert_eq!(served, vec![id(3)]);
    }
}
