use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const MAX_CHUNK_DURATIONS: usize = 1000;

/// Process-local counters and gauges for one pipeline invocation.
///
/// Counters are monotonic for the lifetime of the process; the rolling
/// duration window is capped at `MAX_CHUNK_DURATIONS` entries.
pub struct PipelineMetrics {
    dumps_prepared: AtomicU64,
    dumps_imported: AtomicU64,
    dumps_pruned: AtomicU64,
    chunks_processed: AtomicU64,
    rows_fast_path: AtomicU64,
    rows_row_path: AtomicU64,
    chunk_durations: Mutex<VecDeque<Duration>>,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        PipelineMetrics {
            dumps_prepared: AtomicU64::new(0),
            dumps_imported: AtomicU64::new(0),
            dumps_pruned: AtomicU64::new(0),
            chunks_processed: AtomicU64::new(0),
            rows_fast_path: AtomicU64::new(0),
            rows_row_path: AtomicU64::new(0),
            chunk_durations: Mutex::new(VecDeque::with_capacity(64)),
        }
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_dump_prepared(&self) {
        self.dumps_prepared.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dump_imported(&self) {
        self.dumps_imported.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dump_pruned(&self) {
        self.dumps_pruned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fast_path_rows(&self, n: u64) {
        self.rows_fast_path.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_row_path_rows(&self, n: u64) {
        self.rows_row_path.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_chunk(&self, items: usize, elapsed: Duration) {
        self.chunks_processed.fetch_add(1, Ordering::Relaxed);
        let items_per_sec = if elapsed.as_secs_f64() > 0.0 {
            items as f64 / elapsed.as_secs_f64()
        } else {
            items as f64
        };
        log::info!(
            "chunk {} processed: {} items in {:.3}s ({:.0} items/sec)",
            self.chunks_processed.load(Ordering::Relaxed),
            items,
            elapsed.as_secs_f64(),
            items_per_sec
        );

        let mut durations = self.chunk_durations.lock().expect("metrics mutex poisoned");
        durations.push_back(elapsed);
        while durations.len() > MAX_CHUNK_DURATIONS {
            durations.pop_front();
        }
    }

    /// Sample RSS once per chunk and log a warning past `threshold_kb`.
    /// Best-effort: a platform without `/proc` just no-ops.
    pub fn sample_rss(&self, threshold_kb: u64) {
        if let Some(rss_kb) = read_rss_kb() {
            if rss_kb > threshold_kb {
                log::warn!("RSS {rss_kb} KiB exceeds threshold {threshold_kb} KiB; consider clearing resolver caches more eagerly");
            }
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let durations = self.chunk_durations.lock().expect("metrics mutex poisoned");
        let mut millis: Vec<f64> = durations.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
        millis.sort_by(|a, b| a.partial_cmp(b).unwrap());

        MetricsSummary {
            dumps_prepared: self.dumps_prepared.load(Ordering::Relaxed),
            dumps_imported: self.dumps_imported.load(Ordering::Relaxed),
            dumps_pruned: self.dumps_pruned.load(Ordering::Relaxed),
            chunks_processed: self.chunks_processed.load(Ordering::Relaxed),
            rows_fast_path: self.rows_fast_path.load(Ordering::Relaxed),
            rows_row_path: self.rows_row_path.load(Ordering::Relaxed),
            chunk_ms_p50: percentile(&millis, 0.50),
            chunk_ms_p95: percentile(&millis, 0.95),
            chunk_ms_p99: percentile(&millis, 0.99),
        }
    }
}

/// Parse `VmRSS` out of `/proc/self/status`. Returns `None` off Linux or if
/// the file is unreadable; RSS sampling is an optimization, not a contract.
fn read_rss_kb() -> Option<u64> {
    let status = fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            return rest.trim().split_whitespace().next()?.parse().ok();
        }
    }
    None
}

fn percentile(sorted_ms: &[f64], p: f64) -> f64 {
    if sorted_ms.is_empty() {
        return 0.0;
    }
    let idx = ((sorted_ms.len() as f64 - 1.0) * p).round() as usize;
    sorted_ms[idx.min(sorted_ms.len() - 1)]
}

#[derive(Debug, Clone, Copy)]
pub struct MetricsSummary {
    pub dumps_prepared: u64,
    pub dumps_imported: u64,
    pub dumps_pruned: u64,
    pub chunks_processed: u64,
    pub rows_fast_path: u64,
    pub rows_row_path: u64,
    pub chunk_ms_p50: f64,
    pub chunk_ms_p95: f64,
    pub chunk_ms_p99: f64,
}

impl fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dumps(prepared={}, imported={}, pruned={}) chunks={} rows(fast={}, row={}) chunk_ms(p50={:.1}, p95={:.1}, p99={:.1})",
            self.dumps_prepared,
            self.dumps_imported,
            self.dumps_pruned,
            self.chunks_processed,
            self.rows_fast_path,
            self.rows_row_path,
            self.chunk_ms_p50,
            self.chunk_ms_p95,
            self.chunk_ms_p99,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let metrics = PipelineMetrics::new();
        let summary = metrics.summary();
        assert_eq!(summary.dumps_prepared, 0);
        assert_eq!(summary.chunks_processed, 0);
    }

    #[test]
    fn counters_are_monotonic() {
        let metrics = PipelineMetrics::new();
        metrics.record_dump_prepared();
        metrics.record_dump_prepared();
        assert_eq!(metrics.summary().dumps_prepared, 2);
    }

    #[test]
    fn sample_rss_does_not_panic_regardless_of_platform() {
        let metrics = PipelineMetrics::new();
        metrics.sample_rss(1);
    }

    #[test]
    fn chunk_duration_window_is_bounded() {
        let metrics = PipelineMetrics::new();
        for _ in 0..(MAX_CHUNK_DURATIONS + 50) {
            metrics.record_chunk(10, Duration::from_millis(1));
        }
        let durations = metrics.chunk_durations.lock().unwrap();
        assert_eq!(durations.len(), MAX_CHUNK_DURATIONS);
    }
}
