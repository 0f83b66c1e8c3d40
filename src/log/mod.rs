//! In-memory per-stream log (§2, §4.3, §9): an append-only stream with
//! named-field entries, consumer groups, and a pending-entries list (PEL),
//! mirroring the subset of Redis Streams semantics (`XADD`/`XREADGROUP`/
//! `XACK`) the fan-out bridge relies on. Stands in for the external log
//! reachable via `LOG_HOST`/`LOG_PORT`/`LOG_URL` (see `config.rs`).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub id: u64,
    pub symbol: String,
    pub data: String,
}

struct PendingEntry {
    consumer: String,
}

#[derive(Default)]
struct GroupState {
    /// Index of the next not-yet-delivered entry.
    next_new: usize,
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<LogEntry>,
    groups: HashMap<String, GroupState>,
}

/// A single delivered entry, tagged with the stream it came from so a
/// multi-stream read can route and ack correctly.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub stream: String,
    pub entry: LogEntry,
}

/// The per-stream log. Cheap to clone (wraps an `Arc`).
#[derive(Clone)]
pub struct Log {
    streams: Arc<Mutex<HashMap<String, StreamState>>>,
    notify: Arc<Notify>,
}

impl Log {
    pub fn new() -> Self {
        Self {
            streams: Arc::new(Mutex::new(HashMap::new())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Appends an entry with the two named fields of §6 (`symbol`, `data`).
    pub fn append(&self, stream: &str, symbol: &str, data: &str) -> u64 {
        let mut streams = self.streams.lock();
        let state = streams.entry(stream.to_string()).or_default();
        let id = state.entries.len() as u64;
        state.entries.push(LogEntry {
            id,
            symbol: symbol.to_string(),
            data: data.to_string(),
        });
        drop(streams);
        self.notify.notify_waiters();
        id
    }

    pub fn consumer_group(&self, streams: &[&str], group: &str, consumer: &str) -> GroupConsumer {
        GroupConsumer {
            log: self.clone(),
            streams: streams.iter().map(|s| s.to_string()).collect(),
            group: group.to_string(),
            consumer: consumer.to_string(),
        }
    }
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

/// A durable consumer-group reader over one or more streams.
#[derive(Clone)]
pub struct GroupConsumer {
    log: Log,
    streams: Vec<String>,
    group: String,
    consumer: String,
}

impl GroupConsumer {
    fn drain_pending_locked(
        streams: &mut HashMap<String, StreamState>,
        stream_names: &[String],
        group: &str,
        consumer: &str,
        max: usize,
    ) -> Vec<Delivery> {
        let mut out = Vec::new();
        for name in stream_names {
            if out.len() >= max {
                break;
            }
            let Some(state) = streams.get(name) else { continue };
            let Some(group_state) = state.groups.get(group) else { continue };
            for (&id, pending) in group_state.pending.iter() {
                if pending.consumer != consumer {
                    continue;
                }
                if let Some(entry) = state.entries.get(id as usize) {
                    out.push(Delivery {
                        stream: name.clone(),
                        entry: entry.clone(),
                    });
                    if out.len() >= max {
                        break;
                    }
                }
            }
        }
        out
    }

    fn read_new_locked(
        streams: &mut HashMap<String, StreamState>,
        stream_names: &[String],
        group: &str,
        consumer: &str,
        max: usize,
    ) -> Vec<Delivery> {
        let mut out = Vec::new();
        for name in stream_names {
            if out.len() >= max {
                break;
            }
            let state = streams.entry(name.clone()).or_default();
            let group_state = state.groups.entry(group.to_string()).or_default();
            while group_state.next_new < state.entries.len() && out.len() < max {
                let entry = state.entries[group_state.next_new].clone();
                group_state.pending.insert(
                    entry.id,
                    PendingEntry {
                        consumer: consumer.to_string(),
                    },
                );
                group_state.next_new += 1;
                out.push(Delivery {
                    stream: name.clone(),
                    entry,
                });
            }
        }
        out
    }

    /// Reads up to `max` entries, first draining this consumer's own pending
    /// list (§4.3 recovery rule), then new entries across the subscribed
    /// streams. Blocks up to `timeout` waiting for new data when nothing is
    /// immediately available; an empty result on timeout is a normal
    /// continuation, not an error.
    pub async fn read(&self, max: usize, timeout: Duration) -> Vec<Delivery> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut streams = self.log.streams.lock();
                let pending = Self::drain_pending_locked(
                    &mut streams,
                    &self.streams,
                    &self.group,
                    &self.consumer,
                    max,
                );
                if !pending.is_empty() {
                    return pending;
                }
                let fresh =
                    Self::read_new_locked(&mut streams, &self.streams, &self.group, &self.consumer, max);
                if !fresh.is_empty() {
                    return fresh;
                }
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Vec::new();
            }
            let notified = self.log.notify.notified();
            let _ = tokio::time::timeout(remaining, notified).await;
            if tokio::time::Instant::now() >= deadline {
                return Vec::new();
            }
        }
    }

    /// Acknowledges an entry, removing it from the group's pending list.
    pub fn ack(&self, stream: &str, entry_id: u64) {
        let mut streams = self.log.streams.lock();
        if let Some(state) = streams.get_mut(stream) {
            if let Some(group_state) = state.groups.get_mut(&self.group) {
                group_state.pending.remove(&entry_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_entries_are_delivered_once() {
        let log = Log::new();
        log.append("market:realtime:trades", "AAPL", "{}");
        let consumer = log.consumer_group(&["market:realtime:trades"], "gateway_stream_consumers", "c1");

        let batch = consumer.read(10, Duration::from_millis(50)).await;
        assert_eq!(batch.len(), 1);

        consumer.ack(&batch[0].stream, batch[0].entry.id);
        let batch2 = consumer.read(10, Duration::from_millis(20)).await;
        assert!(batch2.is_empty());
    }

    #[tokio::test]
    async fn unacked_entries_are_redelivered_on_recovery() {
        let log = Log::new();
        log.append("market:realtime:trades", "AAPL", "{}");
        let consumer = log.consumer_group(&["market:realtime:trades"], "gateway_stream_consumers", "gateway-consumer");

        let first = consumer.read(10, Duration::from_millis(50)).await;
        assert_eq!(first.len(), 1);

        // Simulate a restart with a fresh reader handle under the same
        // consumer name: pending recovery must drain before new reads.
        let restarted = log.consumer_group(&["market:realtime:trades"], "gateway_stream_consumers", "gateway-consumer");
        let recovered = restarted.read(10, Duration::from_millis(50)).await;
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].entry.id, first[0].entry.id);
    }

    #[tokio::test]
    async fn reads_span_multiple_streams_in_one_call() {
        let log = Log::new();
        log.append("market:realtime:trades", "AAPL", "{\"type\":\"trade\"}");
        log.append("market:realtime:bars", "AAPL", "{\"type\":\"bar\"}");

        let consumer = log.consumer_group(
            &["market:realtime:trades", "market:realtime:bars"],
            "gateway_stream_consumers",
            "gateway-consumer",
        );
        let batch = consumer.read(10, Duration::from_millis(50)).await;
        assert_eq!(batch.len(), 2);
    }
}
