// SPDX-License-Identifier: Apache-2.0

//! Session counters. Counters accumulate between snapshots; a snapshot
//! drains them, so an idle interval reports nothing.

use std::collections::BTreeMap;
use tower::BoxError;

pub type StatsSnapshot = BTreeMap<&'static str, u64>;

/// Invoked with each periodic snapshot. A handler that returns an error is
/// disabled for the remainder of the session.
pub type StatsHandler = Box<dyn FnMut(&StatsSnapshot) -> Result<(), BoxError> + Send>;

#[derive(Debug, Default)]
pub struct Stats {
    /// Lines received from the tailers, dropped or not.
    pub received: u64,
    /// Documents rendered and queued.
    pub docs: u64,
    /// Bulk HTTP requests issued.
    pub http_req: u64,
    pub bulk_success: u64,
    pub bulk_failure: u64,
    /// Items acknowledged by the cluster.
    pub indexed: u64,
    /// Per-item errors inside successful responses.
    pub errors: u64,
    /// Batches sealed from the queue.
    pub batches: u64,
    /// Records written to the backlog.
    pub backlogged: u64,
    /// Backlog files read back for replay.
    pub consumed: u64,
    pub cleanup_success: u64,
    pub cleanup_fail: u64,
    /// Tail errors that dropped a file from the active set.
    pub wheel_error: u64,
}

impl Stats {
    /// Drain the counters into a snapshot of the nonzero ones.
    pub fn snapshot(&mut self) -> StatsSnapshot {
        let mut out = BTreeMap::new();
        let mut take = |name: &'static str, value: &mut u64| {
            if *value > 0 {
                out.insert(name, *value);
                *value = 0;
            }
        };
        take("received", &mut self.received);
        take("docs", &mut self.docs);
        take("http_req", &mut self.http_req);
        take("bulk_success", &mut self.bulk_success);
        take("bulk_failure", &mut self.bulk_failure);
        take("indexed", &mut self.indexed);
        take("errors", &mut self.errors);
        take("batches", &mut self.batches);
        take("backlogged", &mut self.backlogged);
        take("consumed", &mut self.consumed);
        take("cleanup_success", &mut self.cleanup_success);
        take("cleanup_fail", &mut self.cleanup_fail);
        take("wheel_error", &mut self.wheel_error);
        out
    }
}

/// Format a snapshot for the periodic report line.
pub fn report_line(snapshot: &StatsSnapshot) -> String {
    if snapshot.is_empty() {
        return "Nothing to report.".to_string();
    }
    snapshot
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_drains_nonzero_counters() {
        let mut stats = Stats::default();
        stats.received = 3;
        stats.bulk_success = 1;

        let snap = stats.snapshot();
        assert_eq!(snap.get("received"), Some(&3));
        assert_eq!(snap.get("bulk_success"), Some(&1));
        assert_eq!(snap.len(), 2);

        assert!(stats.snapshot().is_empty());
    }

    #[test]
    fn report_line_sorted_pairs() {
        let mut stats = Stats::default();
        stats.indexed = 2;
        stats.bulk_success = 1;
        let snap = stats.snapshot();
        assert_eq!(report_line(&snap), "bulk_success=1 indexed=2");
    }

    #[test]
    fn report_line_empty() {
        assert_eq!(report_line(&StatsSnapshot::new()), "Nothing to report.");
    }
}
