//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `ledger_postings_total` - Postings accepted into a group
//! - `ledger_journals_committed_total` - Journals committed
//! - `ledger_commit_failures_total{kind}` - Failed commit attempts by error kind
//! - `ledger_group_timeouts_total` - Groups that expired
//! - `ledger_pending_groups` - Groups currently waiting for postings
//! - `ledger_commit_duration_seconds` - Commit latency

use crate::error::ErrorKind;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
///
/// Owns its registry so several engines can live in one process.
#[derive(Clone)]
pub struct Metrics {
    /// Postings accepted
    pub postings_total: IntCounter,

    /// Journals committed
    pub journals_committed: IntCounter,

    /// Failed commits by kind
    pub commit_failures: IntCounterVec,

    /// Expired groups
    pub group_timeouts: IntCounter,

    /// Groups in flight
    pub pending_groups: IntGauge,

    /// Commit latency
    pub commit_duration: Histogram,

    registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let postings_total =
            IntCounter::new("ledger_postings_total", "Postings accepted into a group")?;
        registry.register(Box::new(postings_total.clone()))?;

        let journals_committed =
            IntCounter::new("ledger_journals_committed_total", "Journals committed")?;
        registry.register(Box::new(journals_committed.clone()))?;

        let commit_failures = IntCounterVec::new(
            Opts::new("ledger_commit_failures_total", "Failed commit attempts by error kind"),
            &["kind"],
        )?;
        registry.register(Box::new(commit_failures.clone()))?;

        let group_timeouts =
            IntCounter::new("ledger_group_timeouts_total", "Posting groups that expired")?;
        registry.register(Box::new(group_timeouts.clone()))?;

        let pending_groups =
            IntGauge::new("ledger_pending_groups", "Posting groups waiting for postings")?;
        registry.register(Box::new(pending_groups.clone()))?;

        let commit_duration = Histogram::with_opts(
            HistogramOpts::new("ledger_commit_duration_seconds", "Commit latency")
                .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 1.0]),
        )?;
        registry.register(Box::new(commit_duration.clone()))?;

        Ok(Self {
            postings_total,
            journals_committed,
            commit_failures,
            group_timeouts,
            pending_groups,
            commit_duration,
            registry,
        })
    }

    /// Record a posting accepted into a group
    pub fn record_posting(&self) {
        self.postings_total.inc();
    }

    /// Record a commit attempt
    pub fn record_commit(&self, outcome: Result<(), ErrorKind>, duration_seconds: f64) {
        self.commit_duration.observe(duration_seconds);
        match outcome {
            Ok(()) => self.journals_committed.inc(),
            Err(kind) => self.commit_failures.with_label_values(&[kind.as_str()]).inc(),
        }
    }

    /// Record a group timeout
    pub fn record_timeout(&self) {
        self.group_timeouts.inc();
    }

    /// Update in-flight group count
    pub fn set_pending_groups(&self, count: usize) {
        self.pending_groups.set(count as i64);
    }

    /// Export all metrics in Prometheus text format
    pub fn export(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("postings_total", &self.postings_total.get())
            .field("journals_committed", &self.journals_committed.get())
            .field("group_timeouts", &self.group_timeouts.get())
            .finish()
    }
}
