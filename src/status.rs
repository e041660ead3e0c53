//! Pool diagnostics: counter snapshots and an in-memory time series.
//!
//! The time series is a bounded ring buffer with a compact binary encoding
//! (`[u32 count][N x 26-byte entries]`) and a JSON projection for dashboards.

use std::collections::VecDeque;

use serde::Serialize;

/// Maximum retained entries: 2 hours at the default 5-second tick.
const MAX_ENTRIES: usize = 1440;

/// Size of one serialized entry in bytes.
const ENTRY_SIZE: usize = 26;

/// Snapshot of the manager's counters and queue depths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct PoolStatus {
    /// Workers expected to be live
    pub live_workers: usize,
    /// Requests submitted since startup
    pub requested: u64,
    /// Requests dispatched since startup
    pub processed: u64,
    /// Step/workflow requests pinned to a port, not yet delivered
    pub pending_steps: usize,
    /// Substep batches waiting for any free worker
    pub queued_substeps: usize,
    /// Idle ports with nothing assigned
    pub available_ports: usize,
    /// Idle ports earmarked for a not-yet-arrived request
    pub claimed_ports: usize,
}

impl PoolStatus {
    /// Outstanding work: submitted but not yet dispatched.
    pub fn backlog(&self) -> u64 {
        self.requested.saturating_sub(self.processed)
    }
}

/// A single time-series data point (26 bytes serialized).
#[derive(Debug, Clone, Copy)]
pub struct TimeSeriesEntry {
    /// Unix timestamp in seconds
    pub timestamp_secs: i64,
    /// Dispatches per second over the last tick
    pub dispatches_per_sec: f32,
    /// Live worker count
    pub live_workers: u16,
    /// Pending port-bound requests
    pub pending_steps: u32,
    /// Queued substep batches
    pub queued_substeps: u32,
    /// Idle available ports
    pub available_ports: u32,
}

impl TimeSeriesEntry {
    /// Build an entry from a status snapshot and a measured dispatch rate.
    pub fn from_status(status: &PoolStatus, timestamp_secs: i64, dispatches_per_sec: f32) -> Self {
        Self {
            timestamp_secs,
            dispatches_per_sec,
            live_workers: status.live_workers.min(u16::MAX as usize) as u16,
            pending_steps: status.pending_steps as u32,
            queued_substeps: status.queued_substeps as u32,
            available_ports: status.available_ports as u32,
        }
    }
}

/// Ring buffer of time-series entries.
#[derive(Debug, Clone, Default)]
pub struct PoolTimeSeries {
    entries: VecDeque<TimeSeriesEntry>,
}

impl PoolTimeSeries {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Append an entry, dropping the oldest if over capacity.
    pub fn push(&mut self, entry: TimeSeriesEntry) {
        if self.entries.len() >= MAX_ENTRIES {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encode to binary: `[u32 count][N x 26-byte entries]`.
    pub fn encode(&self) -> Vec<u8> {
        let count = self.entries.len() as u32;
        let mut buf = Vec::with_capacity(4 + self.entries.len() * ENTRY_SIZE);
        buf.extend_from_slice(&count.to_le_bytes());
        for entry in &self.entries {
            buf.extend_from_slice(&entry.timestamp_secs.to_le_bytes());
            buf.extend_from_slice(&entry.dispatches_per_sec.to_le_bytes());
            buf.extend_from_slice(&entry.live_workers.to_le_bytes());
            buf.extend_from_slice(&entry.pending_steps.to_le_bytes());
            buf.extend_from_slice(&entry.queued_substeps.to_le_bytes());
            buf.extend_from_slice(&entry.available_ports.to_le_bytes());
        }
        buf
    }

    /// Decode from binary. Returns `None` if the bytes are malformed.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 4 {
            return None;
        }
        let count = u32::from_le_bytes(bytes[0..4].try_into().ok()?) as usize;
        if count > MAX_ENTRIES {
            return None;
        }
        if bytes.len() < 4 + count * ENTRY_SIZE {
            return None;
        }
        let mut entries = VecDeque::with_capacity(count);
        for i in 0..count {
            let offset = 4 + i * ENTRY_SIZE;
            let timestamp_secs = i64::from_le_bytes(bytes[offset..offset + 8].try_into().ok()?);
            let dispatches_per_sec =
                f32::from_le_bytes(bytes[offset + 8..offset + 12].try_into().ok()?);
            let live_workers =
                u16::from_le_bytes(bytes[offset + 12..offset + 14].try_into().ok()?);
            let pending_steps =
                u32::from_le_bytes(bytes[offset + 14..offset + 18].try_into().ok()?);
            let queued_substeps =
                u32::from_le_bytes(bytes[offset + 18..offset + 22].try_into().ok()?);
            let available_ports =
                u32::from_le_bytes(bytes[offset + 22..offset + 26].try_into().ok()?);
            entries.push_back(TimeSeriesEntry {
                timestamp_secs,
                dispatches_per_sec,
                live_workers,
                pending_steps,
                queued_substeps,
                available_ports,
            });
        }
        Some(Self { entries })
    }

    /// Convert to JSON-friendly entries for dashboards.
    pub fn to_json_entries(&self) -> Vec<TimeSeriesJsonEntry> {
        self.entries
            .iter()
            .map(|e| TimeSeriesJsonEntry {
                t: e.timestamp_secs,
                dps: e.dispatches_per_sec,
                w: e.live_workers,
                ps: e.pending_steps,
                qs: e.queued_substeps,
                ap: e.available_ports,
            })
            .collect()
    }
}

/// JSON-serializable time-series entry.
#[derive(Debug, Clone, Serialize)]
pub struct TimeSeriesJsonEntry {
    /// Unix timestamp (seconds)
    pub t: i64,
    /// Dispatches per second
    pub dps: f32,
    /// Live worker count
    pub w: u16,
    /// Pending port-bound requests
    pub ps: u32,
    /// Queued substep batches
    pub qs: u32,
    /// Available ports
    pub ap: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(ts: i64) -> TimeSeriesEntry {
        TimeSeriesEntry {
            timestamp_secs: ts,
            dispatches_per_sec: 1.5,
            live_workers: 4,
            pending_steps: 2,
            queued_substeps: 5,
            available_ports: 1,
        }
    }

    #[test]
    fn capacity_is_bounded() {
        let mut series = PoolTimeSeries::new();
        for i in 0..(MAX_ENTRIES + 60) {
            series.push(sample_entry(i as i64));
        }
        assert_eq!(series.len(), MAX_ENTRIES);
        let json = series.to_json_entries();
        assert_eq!(json[0].t, 60);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut series = PoolTimeSeries::new();
        series.push(sample_entry(1700000000));
        series.push(TimeSeriesEntry {
            timestamp_secs: 1700000005,
            dispatches_per_sec: 0.25,
            live_workers: 1,
            pending_steps: 0,
            queued_substeps: 0,
            available_ports: 1,
        });

        let decoded = PoolTimeSeries::decode(&series.encode()).expect("decode");
        assert_eq!(decoded.len(), 2);
        let json = decoded.to_json_entries();
        assert_eq!(json[0].t, 1700000000);
        assert_eq!(json[0].w, 4);
        assert_eq!(json[1].t, 1700000005);
        assert!((json[1].dps - 0.25).abs() < f32::EPSILON);
    }

    #[test]
    fn decode_rejects_truncated_input() {
        assert!(PoolTimeSeries::decode(&[0, 1]).is_none());
        // count says 1 entry but no entry data follows
        assert!(PoolTimeSeries::decode(&1u32.to_le_bytes()).is_none());
    }

    #[test]
    fn backlog_is_requested_minus_processed() {
        let status = PoolStatus {
            requested: 7,
            processed: 3,
            ..PoolStatus::default()
        };
        assert_eq!(status.backlog(), 4);
    }
}
