//! Bounded latency/outcome windows for backend call classes.
//!
//! Metric name constants live here; call sites and the exposition route use
//! them rather than raw strings so renaming stays centralized.

use std::collections::VecDeque;
use std::fmt::Write as _;

use parking_lot::Mutex;
use serde::Serialize;

/// Samples kept per call class.
const WINDOW_CAPACITY: usize = 500;

/// Histogram bucket upper bounds in milliseconds.
const BUCKETS_MS: [u64; 10] = [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];

/// Batched profile/presence reads.
pub const CLASS_PROFILE_BATCH_READ: &str = "profile_batch_read";
/// Message persistence writes.
pub const CLASS_MESSAGE_WRITE: &str = "message_write";

#[derive(Debug, Clone, Copy)]
struct Sample {
    latency_ms: u64,
    ok: bool,
}

/// JSON summary of one call class over its current window.
#[derive(Debug, Clone, Serialize)]
pub struct CallSummary {
    pub count: usize,
    pub avg_ms: f64,
    pub p50_ms: u64,
    pub p90_ms: u64,
    pub p99_ms: u64,
    pub success_rate: f64,
}

/// One call class: a bounded window of (latency, outcome) samples.
pub struct CallStats {
    name: &'static str,
    window: Mutex<VecDeque<Sample>>,
}

impl CallStats {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            window: Mutex::new(VecDeque::with_capacity(WINDOW_CAPACITY)),
        }
    }

    /// Record one attempt. Short-circuited writes land here too, with ~0
    /// latency and `ok = false`.
    pub fn record(&self, latency_ms: u64, ok: bool) {
        let mut window = self.window.lock();
        window.push_back(Sample { latency_ms, ok });
        while window.len() > WINDOW_CAPACITY {
            window.pop_front();
        }
    }

    pub fn summary(&self) -> CallSummary {
        let window = self.window.lock();
        let count = window.len();
        if count == 0 {
            return CallSummary {
                count: 0,
                avg_ms: 0.0,
                p50_ms: 0,
                p90_ms: 0,
                p99_ms: 0,
                success_rate: 1.0,
            };
        }

        let mut latencies: Vec<u64> = window.iter().map(|s| s.latency_ms).collect();
        latencies.sort_unstable();
        let ok_count = window.iter().filter(|s| s.ok).count();
        let sum: u64 = latencies.iter().sum();

        CallSummary {
            count,
            avg_ms: sum as f64 / count as f64,
            p50_ms: percentile(&latencies, 50.0),
            p90_ms: percentile(&latencies, 90.0),
            p99_ms: percentile(&latencies, 99.0),
            success_rate: ok_count as f64 / count as f64,
        }
    }

    /// Append this class in Prometheus text exposition format: a cumulative
    /// latency histogram plus outcome counters over the current window.
    pub fn render_text(&self, out: &mut String) {
        let window = self.window.lock();
        let metric = format!("relay_backend_{}_latency_milliseconds", self.name);

        let _ = writeln!(out, "# TYPE {metric} histogram");
        for bucket in BUCKETS_MS {
            let cumulative = window.iter().filter(|s| s.latency_ms <= bucket).count();
            let _ = writeln!(out, "{metric}_bucket{{le=\"{bucket}\"}} {cumulative}");
        }
        let _ = writeln!(out, "{metric}_bucket{{le=\"+Inf\"}} {}", window.len());
        let sum: u64 = window.iter().map(|s| s.latency_ms).sum();
        let _ = writeln!(out, "{metric}_sum {sum}");
        let _ = writeln!(out, "{metric}_count {}", window.len());

        let calls = format!("relay_backend_{}_calls_total", self.name);
        let ok_count = window.iter().filter(|s| s.ok).count();
        let _ = writeln!(out, "# TYPE {calls} counter");
        let _ = writeln!(out, "{calls}{{outcome=\"success\"}} {ok_count}");
        let _ = writeln!(
            out,
            "{calls}{{outcome=\"failure\"}} {}",
            window.len() - ok_count
        );
    }
}

/// Nearest-rank percentile over a sorted window.
fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p / 100.0 * sorted.len() as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

/// The call classes the relay reports on.
pub struct BackendStats {
    pub reads: CallStats,
    pub writes: CallStats,
}

impl BackendStats {
    pub fn new() -> Self {
        Self {
            reads: CallStats::new(CLASS_PROFILE_BATCH_READ),
            writes: CallStats::new(CLASS_MESSAGE_WRITE),
        }
    }

    pub fn summary_json(&self) -> serde_json::Value {
        serde_json::json!({
            CLASS_PROFILE_BATCH_READ: self.reads.summary(),
            CLASS_MESSAGE_WRITE: self.writes.summary(),
        })
    }

    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        self.reads.render_text(&mut out);
        self.writes.render_text(&mut out);
        out
    }
}

impl Default for BackendStats {
    fn default() -> Self {
        Self::new()
    }
}
