//! Round-trip conversion between the actor's live in-flight state and a
//! minimal serializable form, for the hot code-change path (spec §4.3, §8).
//!
//! A code downgrade must be able to serialize whatever the old release's
//! state record understood; a following upgrade must resume from it
//! without losing already-acked-for-storage guarantees. See
//! [Open Question decision 1](../DESIGN.md) for what a downgrade is
//! allowed to drop.

use crate::options::DurableQueueOptions;
use crate::queue::AckRef;
use crate::request_table::{InflightRequest, RequestTable};

/// One in-flight batch reduced to the fields a legacy release's state
/// record format understands: `sequence_id`, the durable-queue cursor,
/// and a message count for diagnostics. Synchronous-reply senders and the
/// user callback have no representation here and are dropped on downgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyInflightEntry {
    pub sequence_id: u64,
    pub ack_ref: AckRef,
    pub message_count: usize,
}

/// A downgraded snapshot of [`crate::actor::PartitionProducer`]'s
/// allocator and request-table state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyProducerState {
    pub producer_id: u64,
    pub producer_name: Option<String>,
    pub next_request_id: u64,
    pub next_sequence_id: u64,
    pub requests: Vec<LegacyInflightEntry>,
}

impl LegacyProducerState {
    /// Captures a downgrade snapshot. `requests` is walked in ascending
    /// `sequence_id` order so an upgrade that replays it reconstructs the
    /// same resend order the live table would have used.
    ///
    /// `queue_opts` is accepted only to be dropped: the legacy slot format
    /// has no `durable_queue` key, so a live state's queue configuration —
    /// and, with it, the `retention_period` sub-option — does not survive a
    /// downgrade. Two states differing only in `queue_opts` downgrade to
    /// identical records.
    pub fn downgrade(
        producer_id: u64,
        producer_name: Option<String>,
        next_request_id: u64,
        next_sequence_id: u64,
        requests: &RequestTable,
        _queue_opts: &DurableQueueOptions,
    ) -> Self {
        let requests = requests
            .iter_sorted()
            .map(|(sequence_id, entry)| LegacyInflightEntry {
                sequence_id,
                ack_ref: entry.ack_ref,
                message_count: entry.message_count(),
            })
            .collect();

        Self {
            producer_id,
            producer_name,
            next_request_id,
            next_sequence_id,
            requests,
        }
    }

    /// Reconstructs a [`RequestTable`] from the downgraded snapshot, plus
    /// the durable-queue configuration an upgrade always resumes with:
    /// mem-only and `retention_period = infinity`, since the legacy slot
    /// format never carried `durable_queue` for this to restore instead.
    ///
    /// Every reconstructed [`InflightRequest`] has empty `replies` and
    /// `entries`: a `SendReceipt` arriving for one of these after the
    /// upgrade still acks the durable queue (invariant 5 is preserved) but
    /// delivers to nobody, since the original callers and batch payloads
    /// did not survive the round trip.
    pub fn upgrade(self) -> (u64, Option<String>, u64, u64, RequestTable, DurableQueueOptions) {
        let mut table = RequestTable::new();
        for entry in self.requests {
            table.insert(
                entry.sequence_id,
                InflightRequest {
                    ack_ref: entry.ack_ref,
                    replies: Vec::new(),
                    entries: Vec::new(),
                },
            );
        }
        (
            self.producer_id,
            self.producer_name,
            self.next_request_id,
            self.next_sequence_id,
            table,
            DurableQueueOptions::default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::options::DurableQueueOptionsBuilder;
    use std::time::Duration;
    use std::time::Instant;

    #[test]
    fn downgrade_then_upgrade_preserves_sequence_ids_and_ack_refs() {
        let mut requests = RequestTable::new();
        requests.insert(
            5,
            InflightRequest {
                ack_ref: AckRef::for_test(10),
                replies: Vec::new(),
                entries: vec![(Instant::now(), vec![Message::new(Vec::from(*b"a"))])],
            },
        );
        requests.insert(
            9,
            InflightRequest {
                ack_ref: AckRef::for_test(11),
                replies: Vec::new(),
                entries: vec![(Instant::now(), vec![Message::new(Vec::from(*b"b"))])],
            },
        );

        let snapshot = LegacyProducerState::downgrade(
            1,
            Some("standalone-0-1".into()),
            3,
            7,
            &requests,
            &DurableQueueOptions::default(),
        );
        assert_eq!(snapshot.requests.len(), 2);
        assert_eq!(snapshot.requests[0].sequence_id, 5);
        assert_eq!(snapshot.requests[1].sequence_id, 9);

        let (producer_id, producer_name, next_request_id, next_sequence_id, table, _queue_opts) =
            snapshot.upgrade();
        assert_eq!(producer_id, 1);
        assert_eq!(producer_name.as_deref(), Some("standalone-0-1"));
        assert_eq!(next_request_id, 3);
        assert_eq!(next_sequence_id, 7);
        assert!(table.contains(5));
        assert!(table.contains(9));
    }

    #[test]
    fn upgraded_entries_have_no_replies_or_message_payloads() {
        let mut requests = RequestTable::new();
        requests.insert(
            1,
            InflightRequest {
                ack_ref: AckRef::for_test(1),
                replies: Vec::new(),
                entries: vec![(Instant::now(), vec![Message::new(Vec::from(*b"x"))])],
            },
        );

        let snapshot = LegacyProducerState::downgrade(
            1,
            None,
            1,
            2,
            &requests,
            &DurableQueueOptions::default(),
        );
        let (_, _, _, _, mut table, _queue_opts) = snapshot.upgrade();
        let entry = table.take(1).unwrap();
        assert!(entry.replies.is_empty());
        assert!(entry.entries.is_empty());
    }

    /// Scenario 4: a live state carrying a real `durable_queue`
    /// configuration (a backing directory and a finite retention period)
    /// downgrades to the same fixed-slot record as a state that never had
    /// one — the legacy format has no key to carry either through.
    #[test]
    fn downgrading_drops_the_durable_queue_slot_and_retention_period() {
        let requests = RequestTable::new();
        let with_queue = DurableQueueOptionsBuilder::new()
            .dir("/var/lib/producer/queue")
            .retention_period(Duration::from_secs(1000))
            .build();
        let mem_only = DurableQueueOptions::default();

        let downgraded_with_queue =
            LegacyProducerState::downgrade(1, None, 0, 0, &requests, &with_queue);
        let downgraded_mem_only =
            LegacyProducerState::downgrade(1, None, 0, 0, &requests, &mem_only);

        assert_eq!(
            downgraded_with_queue, downgraded_mem_only,
            "two states differing only in queue configuration must downgrade to the same record"
        );
    }

    /// Scenario 5: upgrading a legacy tuple state always reinstates a
    /// mem-only queue with infinite retention, regardless of what the
    /// state that was originally downgraded had configured.
    #[test]
    fn upgrading_reinstates_a_mem_only_queue_with_infinite_retention() {
        let requests = RequestTable::new();
        let had_queue = DurableQueueOptionsBuilder::new()
            .dir("/var/lib/producer/queue")
            .retention_period(Duration::from_secs(1000))
            .build();
        let snapshot = LegacyProducerState::downgrade(1, None, 0, 0, &requests, &had_queue);

        let (_, _, _, _, _, queue_opts) = snapshot.upgrade();
        assert!(queue_opts.is_mem_only());
        assert_eq!(queue_opts.retention_period, None, "None means infinity");
    }
}
