//! Append-only, causally ordered event log with replayable subscriptions.
//!
//! Concurrent appenders observe a single total order: each append receives
//! a distinct, strictly increasing, gapless offset. Records are immutable
//! once committed, so a subscriber starting from any historical offset
//! replays exactly the records every other subscriber saw there.
//!
//! Subscribers pull at their own pace; a lagging subscriber never blocks
//! appenders. Durable storage of records is an external collaborator's
//! concern; this log defines only the ordering and replay contract.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use bytes::Bytes;
use futures::Stream;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Notify;

/// One committed event. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    /// Position in the log, strictly increasing from zero.
    pub log_offset: u64,
    /// Opaque event payload.
    pub payload: Bytes,
    /// When the record was committed. Informational; ordering is defined
    /// by the offset alone.
    pub committed_at: SystemTime,
}

#[derive(Debug, Default)]
struct Inner {
    records: RwLock<Vec<EventRecord>>,
    tail: Notify,
}

/// An in-memory append-only event log.
///
/// Cheap to clone; clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    inner: Arc<Inner>,
}

impl EventLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a payload, returning its assigned offset.
    ///
    /// Atomic and totally ordered across concurrent appenders: the write
    /// lock is the single serialization point assigning offsets.
    pub fn append(&self, payload: impl Into<Bytes>) -> u64 {
        let record_offset = {
            let mut records = self.inner.records.write();
            let offset = records.len() as u64;
            records.push(EventRecord {
                log_offset: offset,
                payload: payload.into(),
                committed_at: SystemTime::now(),
            });
            offset
        };
        self.inner.tail.notify_waiters();
        record_offset
    }

    /// Number of committed records.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.inner.records.read().len() as u64
    }

    /// Whether the log holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.records.read().is_empty()
    }

    /// Offset of the most recent record, if any.
    #[must_use]
    pub fn last_offset(&self) -> Option<u64> {
        self.inner.records.read().last().map(|r| r.log_offset)
    }

    /// Fetch a single committed record by offset.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn get(&self, offset: u64) -> Option<EventRecord> {
        self.inner.records.read().get(offset as usize).cloned()
    }

    /// Subscribe from a historical or future offset.
    ///
    /// The subscription is infinite and restartable: it replays committed
    /// records from `from_offset` in order, then waits at the tail for new
    /// appends.
    #[must_use]
    pub fn subscribe(&self, from_offset: u64) -> EventSubscriber {
        EventSubscriber {
            inner: Arc::clone(&self.inner),
            next_offset: from_offset,
        }
    }
}

/// A pull cursor over the log. See [`EventLog::subscribe`].
#[derive(Debug)]
pub struct EventSubscriber {
    inner: Arc<Inner>,
    next_offset: u64,
}

impl EventSubscriber {
    /// The offset the next yielded record will have.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.next_offset
    }

    /// Yield the next record in order, waiting at the tail if it has not
    /// been committed yet.
    #[allow(clippy::cast_possible_truncation)]
    pub async fn next(&mut self) -> EventRecord {
        loop {
            // Arm the tail notification before checking so an append
            // between the check and the await is not missed.
            let notified = self.inner.tail.notified();
            {
                let records = self.inner.records.read();
                if let Some(record) = records.get(self.next_offset as usize) {
                    self.next_offset += 1;
                    return record.clone();
                }
            }
            notified.await;
        }
    }

    /// Adapt the subscriber into an infinite [`Stream`] of records.
    pub fn into_stream(self) -> impl Stream<Item = EventRecord> {
        futures::stream::unfold(self, |mut subscriber| async move {
            let record = subscriber.next().await;
            Some((record, subscriber))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn append_assigns_gapless_increasing_offsets() {
        let log = EventLog::new();
        for i in 0..10u64 {
            assert_eq!(log.append(format!("event-{i}")), i);
        }
        assert_eq!(log.len(), 10);
        assert_eq!(log.last_offset(), Some(9));
    }

    #[tokio::test]
    async fn concurrent_appends_form_a_total_order() {
        let log = EventLog::new();
        let mut tasks = Vec::new();
        for worker in 0..8u64 {
            let log = log.clone();
            tasks.push(tokio::spawn(async move {
                let mut offsets = Vec::new();
                for i in 0..100u64 {
                    offsets.push(log.append(format!("{worker}-{i}")));
                }
                offsets
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            let offsets = task.await.unwrap();
            // Each appender's own offsets are strictly increasing.
            assert!(offsets.windows(2).all(|w| w[0] < w[1]));
            all.extend(offsets);
        }

        // Across all appenders: no gaps, no duplicates.
        all.sort_unstable();
        let expected: Vec<u64> = (0..800).collect();
        assert_eq!(all, expected);
    }

    #[tokio::test]
    async fn replay_is_identical_from_any_offset() {
        let log = EventLog::new();
        for i in 0..10u64 {
            log.append(format!("event-{i}"));
        }

        let mut from_zero = log.subscribe(0);
        for _ in 0..5 {
            from_zero.next().await;
        }

        let mut late_joiner = log.subscribe(5);
        for expected_offset in 5..10 {
            let a = from_zero.next().await;
            let b = late_joiner.next().await;
            assert_eq!(a, b);
            assert_eq!(a.log_offset, expected_offset);
        }
    }

    #[tokio::test]
    async fn subscriber_waits_at_the_tail() {
        let log = EventLog::new();
        let mut sub = log.subscribe(0);

        let waiter = tokio::spawn(async move { sub.next().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        log.append("late");
        let record = waiter.await.unwrap();
        assert_eq!(record.log_offset, 0);
        assert_eq!(record.payload, Bytes::from_static(b"late"));
    }

    #[tokio::test]
    async fn lagging_subscriber_does_not_block_appenders() {
        let log = EventLog::new();
        let _laggard = log.subscribe(0); // never polled
        for i in 0..1000u64 {
            assert_eq!(log.append(vec![0u8; 16]), i);
        }
    }

    #[tokio::test]
    async fn stream_adapter_yields_in_order() {
        let log = EventLog::new();
        for i in 0..3u64 {
            log.append(format!("event-{i}"));
        }

        let stream = log.subscribe(0).into_stream();
        let records: Vec<_> = stream.take(3).collect().await;
        let offsets: Vec<u64> = records.iter().map(|r| r.log_offset).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn records_are_immutable_and_re_readable() {
        let log = EventLog::new();
        log.append("payload");
        let first = log.get(0).unwrap();
        log.append("another");
        let again = log.get(0).unwrap();
        assert_eq!(first, again);
        assert!(log.get(2).is_none());
    }
}
