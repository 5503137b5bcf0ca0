//! Per-pod connection statistics and the idleness decision.
//!
//! Each pod keeps its two most recent samples. A tick can only conclude
//! "idle" when every pod has a valid, fresh pair of samples showing no
//! connection movement; anything that undermines the comparison (missing
//! baseline, stale sample, sidecar restart) forces the tick to assume
//! activity instead.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Connection counters reported by one sidecar proxy.
///
/// `proxy_id` is a random identifier the sidecar picks at process start; a
/// change between samples means the counters were reset.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    /// Identifier of the reporting proxy instance
    pub proxy_id: String,
    /// Connections opened since proxy start
    pub connections_opened: u64,
    /// Connections closed since proxy start
    pub connections_closed: u64,
}

/// One timestamped sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// When the sample was scraped
    pub time: DateTime<Utc>,
    /// The scraped counters
    pub stats: ConnectionStats,
}

/// The sliding two-sample window kept per pod
#[derive(Debug, Clone, Default)]
pub struct PodStats {
    /// Set when the pod was deleted; the record is retained until the
    /// deletion predates the current window
    pub deleted_at: Option<DateTime<Utc>>,
    /// The sample before `recent`
    pub previous: Option<Sample>,
    /// The most recent successful sample
    pub recent: Option<Sample>,
}

impl PodStats {
    /// Record a new sample, shifting the previous one down the window.
    pub fn push(&mut self, time: DateTime<Utc>, stats: ConnectionStats) {
        self.previous = self.recent.take();
        self.recent = Some(Sample { time, stats });
    }
}

/// Outcome of one window evaluation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowVerdict {
    /// Some pod showed connection movement during the window
    pub found_activity: bool,
    /// Some pod's samples could not support an idleness conclusion
    pub assumed_activity: bool,
}

impl WindowVerdict {
    /// Whether this tick may scale the workload to zero.
    pub fn idle(&self) -> bool {
        !self.found_activity && !self.assumed_activity
    }
}

/// Evaluate one window over all tracked pods.
///
/// Records of pods deleted before the window started are dropped; they have
/// already contributed to every window that could see them.
pub fn assess_idleness(
    all_stats: &mut HashMap<String, PodStats>,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
) -> WindowVerdict {
    all_stats.retain(|_, stats| match stats.deleted_at {
        Some(deleted_at) => deleted_at >= period_start,
        None => true,
    });
    let mut verdict = WindowVerdict::default();
    for stats in all_stats.values() {
        if verdict.found_activity || verdict.assumed_activity {
            break;
        }
        let (Some(previous), Some(recent)) = (&stats.previous, &stats.recent) else {
            // No comparison baseline.
            verdict.assumed_activity = true;
            continue;
        };
        if recent.time < period_end {
            // The scrape failed this cycle; the sample is stale.
            verdict.assumed_activity = true;
            continue;
        }
        if recent.stats.proxy_id != previous.stats.proxy_id {
            // Sidecar restarted; the counters reset.
            verdict.assumed_activity = true;
            continue;
        }
        if recent.stats.connections_opened > previous.stats.connections_opened
            || recent.stats.connections_closed > previous.stats.connections_closed
            || recent.stats.connections_opened > recent.stats.connections_closed
        {
            verdict.found_activity = true;
        }
    }
    verdict
}
