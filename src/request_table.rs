//! In-flight request table keyed by `sequence_id` (spec §4.2).

use crate::error::ProducerError;
use crate::message::Message;
use crate::queue::AckRef;
use std::collections::BTreeMap;
use std::time::Instant;
use tokio::sync::oneshot;

/// A batch that has been sent to the broker but not yet acknowledged.
pub struct InflightRequest {
    /// Durable-queue cursor token for this batch; released on ack.
    pub ack_ref: AckRef,
    /// Synchronous callers awaiting this batch's receipt. Empty if every
    /// submission in the batch came in through the async `send` path.
    pub replies: Vec<oneshot::Sender<Result<u64, ProducerError>>>,
    /// The sub-batches that were coalesced into this send, preserved so
    /// per-message retention decisions and the async callback's message
    /// count remain possible.
    pub entries: Vec<(Instant, Vec<Message>)>,
}

impl InflightRequest {
    pub fn message_count(&self) -> usize {
        self.entries.iter().map(|(_, msgs)| msgs.len()).sum()
    }
}

/// Maps `sequence_id` to its [`InflightRequest`].
///
/// A `BTreeMap` rather than a `HashMap` so reconnect replay (`iter_sorted`)
/// is a plain in-order traversal, per spec §4.2 and §9.
#[derive(Default)]
pub struct RequestTable {
    requests: BTreeMap<u64, InflightRequest>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Invariant 2: no two entries may share an `ack_ref`. Debug-asserted
    /// at the insertion boundary; the actor is the sole writer and is
    /// expected to uphold this by construction.
    pub fn insert(&mut self, sequence_id: u64, entry: InflightRequest) {
        debug_assert!(
            self.requests
                .values()
                .all(|existing| existing.ack_ref != entry.ack_ref),
            "ack_ref reused across distinct in-flight entries"
        );
        self.requests.insert(sequence_id, entry);
    }

    pub fn take(&mut self, sequence_id: u64) -> Option<InflightRequest> {
        self.requests.remove(&sequence_id)
    }

    pub fn contains(&self, sequence_id: u64) -> bool {
        self.requests.contains_key(&sequence_id)
    }

    /// Ascending `sequence_id` order, respecting the wrap window: since the
    /// actor never allocates a `sequence_id` that collides with one still
    /// in flight (§4.1), a plain numeric `BTreeMap` order already agrees
    /// with wrap order within any window the table can actually hold.
    pub fn iter_sorted(&self) -> impl Iterator<Item = (u64, &InflightRequest)> {
        self.requests.iter().map(|(seq, req)| (*seq, req))
    }

    pub fn drain_sorted(&mut self) -> Vec<(u64, InflightRequest)> {
        std::mem::take(&mut self.requests).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::AckRef;

    fn entry(ack_ref: u64) -> InflightRequest {
        InflightRequest {
            ack_ref: AckRef::for_test(ack_ref),
            replies: Vec::new(),
            entries: vec![(Instant::now(), vec![Message::new(Vec::from(*b"x"))])],
        }
    }

    #[test]
    fn iter_sorted_yields_ascending_sequence_ids() {
        let mut table = RequestTable::new();
        table.insert(5, entry(1));
        table.insert(2, entry(2));
        table.insert(9, entry(3));

        let seqs: Vec<u64> = table.iter_sorted().map(|(seq, _)| seq).collect();
        assert_eq!(seqs, vec![2, 5, 9]);
    }

    #[test]
    fn take_removes_and_returns_the_entry() {
        let mut table = RequestTable::new();
        table.insert(1, entry(1));
        assert!(table.take(1).is_some());
        assert!(table.take(1).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn message_count_sums_across_coalesced_groups() {
        let req = InflightRequest {
            ack_ref: AckRef::for_test(1),
            replies: Vec::new(),
            entries: vec![
                (Instant::now(), vec![Message::new(Vec::from(*b"a"))]),
                (
                    Instant::now(),
                    vec![Message::new(Vec::from(*b"b")), Message::new(Vec::from(*b"c"))],
                ),
            ],
        };
        assert_eq!(req.message_count(), 3);
    }
}
