//! Flow records and the table that owns them.
//!
//! Lock discipline: the table's index lock is held only to look up, insert,
//! or remove record handles. A record's fields are only touched while
//! holding that record's own lock. Both the ingestion path and the control
//! loop use `try_lock` and skip work rather than wait.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::features::MIN_RTT_UNKNOWN;
use crate::mitigation::RwndTable;
use crate::{Decision, FlowKey, Label, PacketSample};

/// State for one flow. Only reachable through a [`FlowHandle`].
#[derive(Debug)]
pub struct FlowRecord {
    fourtuple: FlowKey,
    packets: VecDeque<PacketSample>,
    buffer_cap: usize,
    /// Smallest RTT ever observed (us); only feature computation lowers it.
    pub min_rtt_us: u32,
    /// When this flow was last selected for evaluation.
    pub latest_seen_time: Option<Instant>,
    last_packet_time: Instant,
    pub label: Label,
    pub decision: Decision,
}

impl FlowRecord {
    fn new(fourtuple: FlowKey, buffer_cap: usize, now: Instant) -> Self {
        Self {
            fourtuple,
            packets: VecDeque::new(),
            buffer_cap,
            min_rtt_us: MIN_RTT_UNKNOWN,
            latest_seen_time: None,
            last_packet_time: now,
            label: Label::default(),
            decision: Decision::default(),
        }
    }

    pub fn fourtuple(&self) -> &FlowKey {
        &self.fourtuple
    }

    pub fn packets(&self) -> &VecDeque<PacketSample> {
        &self.packets
    }

    pub fn num_packets(&self) -> usize {
        self.packets.len()
    }

    /// Append a sample, dropping the oldest ones past the buffer cap.
    pub fn push(&mut self, sample: PacketSample, now: Instant) {
        self.packets.push_back(sample);
        while self.packets.len() > self.buffer_cap {
            self.packets.pop_front();
        }
        self.last_packet_time = now;
    }

    /// Hand over the buffered samples and leave the buffer empty.
    pub fn take_packets(&mut self) -> Vec<PacketSample> {
        self.packets.drain(..).collect()
    }

    pub fn last_activity(&self) -> Instant {
        match self.latest_seen_time {
            Some(seen) if seen > self.last_packet_time => seen,
            _ => self.last_packet_time,
        }
    }
}

pub type FlowHandle = Arc<Mutex<FlowRecord>>;

/// Outcome of offering one packet to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    Stored,
    NewFlow,
    /// The index was locked; the packet was dropped.
    TableBusy,
    /// The flow was locked; the packet was dropped.
    FlowBusy,
}

/// Read-only copy of a record for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowSnapshot {
    pub num_packets: usize,
    pub min_rtt_us: u32,
    pub label: Label,
    pub decision: Decision,
}

#[derive(Debug)]
pub struct FlowTable {
    flows: Mutex<HashMap<FlowKey, FlowHandle>>,
    buffer_cap: usize,
}

impl FlowTable {
    pub fn new(buffer_cap: usize) -> Self {
        Self {
            flows: Mutex::new(HashMap::new()),
            buffer_cap: buffer_cap.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.flows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.lock().is_empty()
    }

    /// Handle for `key`, creating the record on first sight.
    ///
    /// Returns `None` without waiting if the index is locked. The boolean is
    /// true when this call created the record.
    pub fn get_or_create(&self, key: FlowKey, now: Instant) -> Option<(FlowHandle, bool)> {
        let mut flows = self.flows.try_lock()?;
        let mut created = false;
        let handle = flows
            .entry(key)
            .or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(FlowRecord::new(key, self.buffer_cap, now)))
            })
            .clone();
        Some((handle, created))
    }

    pub fn get(&self, key: &FlowKey) -> Option<FlowHandle> {
        self.flows.lock().get(key).cloned()
    }

    pub fn remove(&self, key: &FlowKey) -> Option<FlowHandle> {
        self.flows.lock().remove(key)
    }

    /// Record a packet for its flow, skipping it under contention.
    pub fn ingest(&self, key: FlowKey, sample: PacketSample, now: Instant) -> Ingest {
        let Some((handle, created)) = self.get_or_create(key, now) else {
            return Ingest::TableBusy;
        };
        // The index lock is already released here.
        let Some(mut record) = handle.try_lock() else {
            return Ingest::FlowBusy;
        };
        record.push(sample, now);
        if created {
            Ingest::NewFlow
        } else {
            Ingest::Stored
        }
    }

    /// Every flow's handle, or `None` if the index is locked.
    pub fn try_handles(&self) -> Option<Vec<(FlowKey, FlowHandle)>> {
        let flows = self.flows.try_lock()?;
        Some(flows.iter().map(|(k, h)| (*k, h.clone())).collect())
    }

    /// Visit a snapshot of every flow. Flows locked elsewhere are passed as `None`.
    pub fn for_each_snapshot(&self, mut f: impl FnMut(&FlowKey, Option<FlowSnapshot>)) {
        let handles: Vec<_> = {
            let flows = self.flows.lock();
            flows.iter().map(|(k, h)| (*k, h.clone())).collect()
        };
        for (key, handle) in handles {
            let snapshot = handle.try_lock().map(|record| FlowSnapshot {
                num_packets: record.num_packets(),
                min_rtt_us: record.min_rtt_us,
                label: record.label,
                decision: record.decision,
            });
            f(&key, snapshot);
        }
    }

    /// Remove idle flows and their mitigation entries.
    ///
    /// A flow is removed when it is not locked, holds fewer than
    /// `min_packets_to_retain` samples, and has seen no packet or evaluation
    /// for longer than `idle_threshold`. Returns the removed keys; an empty
    /// list is also returned when the index is busy.
    pub fn gc(
        &self,
        now: Instant,
        idle_threshold: Duration,
        min_packets_to_retain: usize,
        table: &dyn RwndTable,
    ) -> Vec<FlowKey> {
        let mut removed = Vec::new();
        {
            let Some(mut flows) = self.flows.try_lock() else {
                debug!("Flow table busy, skipping garbage collection");
                return removed;
            };
            flows.retain(|key, handle| match handle.try_lock() {
                Some(record) => {
                    let idle = now.saturating_duration_since(record.last_activity());
                    let stale =
                        record.num_packets() < min_packets_to_retain && idle > idle_threshold;
                    if stale {
                        removed.push(*key);
                    }
                    !stale
                }
                None => {
                    debug!("Could not acquire lock for flow {}, keeping it", key);
                    true
                }
            });
        }

        if !removed.is_empty() {
            info!("Removed {} idle flows", removed.len());
        }
        for key in &removed {
            debug!("\t{}", key);
            if let Err(e) = table.remove(key) {
                warn!("Failed to clear RWND for removed flow {}: {:#}", key, e);
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mitigation::MemoryRwndTable;
    use std::thread;

    fn key(n: u16) -> FlowKey {
        FlowKey::new(0x0100_000a, 0x0200_000a, 40_000 + n, 9000)
    }

    fn sample(seq: u32) -> PacketSample {
        PacketSample {
            seq,
            total_bytes: 1500,
            payload_bytes: 1448,
            time_us: u64::from(seq),
            ..Default::default()
        }
    }

    #[test]
    fn ingest_creates_then_appends() {
        let table = FlowTable::new(100);
        let now = Instant::now();
        assert_eq!(table.ingest(key(1), sample(1), now), Ingest::NewFlow);
        assert_eq!(table.ingest(key(1), sample(2), now), Ingest::Stored);
        assert_eq!(table.len(), 1);
        let handle = table.get(&key(1)).unwrap();
        assert_eq!(handle.lock().num_packets(), 2);
    }

    #[test]
    fn remove_drops_only_the_index_entry() {
        let table = FlowTable::new(10);
        let now = Instant::now();
        table.ingest(key(1), sample(1), now);
        table.ingest(key(2), sample(1), now);

        let handle = table.remove(&key(1)).unwrap();
        assert_eq!(handle.lock().num_packets(), 1);
        assert!(table.get(&key(1)).is_none());
        assert!(table.remove(&key(1)).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn buffer_is_capped_to_most_recent() {
        let table = FlowTable::new(3);
        let now = Instant::now();
        for seq in 0..10 {
            table.ingest(key(1), sample(seq), now);
        }
        let handle = table.get(&key(1)).unwrap();
        let record = handle.lock();
        let seqs: Vec<_> = record.packets().iter().map(|p| p.seq).collect();
        assert_eq!(seqs, vec![7, 8, 9]);
    }

    #[test]
    fn ingest_skips_busy_flows_and_index() {
        let table = FlowTable::new(100);
        let now = Instant::now();
        table.ingest(key(1), sample(1), now);
        let handle = table.get(&key(1)).unwrap();
        {
            let _held = handle.lock();
            assert_eq!(table.ingest(key(1), sample(2), now), Ingest::FlowBusy);
        }
        {
            let _index = table.flows.lock();
            assert_eq!(table.ingest(key(2), sample(2), now), Ingest::TableBusy);
            assert!(table.try_handles().is_none());
        }
        assert_eq!(handle.lock().num_packets(), 1);
    }

    #[test]
    fn concurrent_creation_yields_one_record() {
        let table = Arc::new(FlowTable::new(100));
        let now = Instant::now();
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                thread::spawn(move || loop {
                    if let Some((handle, _)) = table.get_or_create(key(7), now) {
                        return handle;
                    }
                    thread::yield_now();
                })
            })
            .collect();
        let handles: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert_eq!(table.len(), 1);
        for h in &handles {
            assert!(Arc::ptr_eq(h, &handles[0]));
        }
    }

    #[test]
    fn gc_removes_idle_flows_from_both_tables() {
        let table = FlowTable::new(100);
        let rwnd = MemoryRwndTable::new();
        let start = Instant::now();
        table.ingest(key(1), sample(1), start);
        table.ingest(key(2), sample(1), start);
        rwnd.set(&key(1), 1000).unwrap();
        rwnd.set(&key(2), 2000).unwrap();

        let idle = Duration::from_secs(300);
        assert!(table.gc(start + Duration::from_secs(10), idle, 100, &rwnd).is_empty());

        let handle = table.get(&key(2)).unwrap();
        let _busy = handle.lock();
        let removed = table.gc(start + Duration::from_secs(301), idle, 100, &rwnd);
        assert_eq!(removed, vec![key(1)]);
        assert!(table.get(&key(1)).is_none());
        assert_eq!(rwnd.get(&key(1)), None);
        // The locked flow survives.
        assert!(table.get(&key(2)).is_some());
        assert_eq!(rwnd.get(&key(2)), Some(2000));
    }

    #[test]
    fn gc_keeps_flows_with_pending_work() {
        let table = FlowTable::new(100);
        let rwnd = MemoryRwndTable::new();
        let start = Instant::now();
        for seq in 0..5 {
            table.ingest(key(1), sample(seq), start);
        }
        let later = start + Duration::from_secs(600);
        assert!(table.gc(later, Duration::from_secs(300), 5, &rwnd).is_empty());
        assert_eq!(table.gc(later, Duration::from_secs(300), 6, &rwnd), vec![key(1)]);
    }

    #[test]
    fn evaluation_counts_as_activity() {
        let table = FlowTable::new(100);
        let rwnd = MemoryRwndTable::new();
        let start = Instant::now();
        table.ingest(key(1), sample(1), start);
        let handle = table.get(&key(1)).unwrap();
        {
            let mut record = handle.lock();
            record.take_packets();
            record.latest_seen_time = Some(start + Duration::from_secs(200));
        }
        let idle = Duration::from_secs(300);
        assert!(table.gc(start + Duration::from_secs(400), idle, 1, &rwnd).is_empty());
        assert_eq!(
            table.gc(start + Duration::from_secs(501), idle, 1, &rwnd),
            vec![key(1)]
        );
    }

    #[test]
    fn snapshots_mark_busy_flows() {
        let table = FlowTable::new(100);
        let now = Instant::now();
        table.ingest(key(1), sample(1), now);
        table.ingest(key(2), sample(1), now);
        let handle = table.get(&key(2)).unwrap();
        let _busy = handle.lock();
        let mut seen = HashMap::new();
        table.for_each_snapshot(|k, snap| {
            seen.insert(*k, snap);
        });
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[&key(1)].unwrap().num_packets, 1);
        assert_eq!(seen[&key(1)].unwrap().decision, Decision::NotPaced);
        assert!(seen[&key(2)].is_none());
    }
}
