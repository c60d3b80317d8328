//! Terminal per-execution metrics reporting.

use std::fmt;

/// Collector for the two counters this crate reports: attempts executed and
/// retries attempted, emitted exactly once per execution at success or final
/// exhaustion.
pub trait MetricsSink: Send + Sync + fmt::Debug {
    /// Record the terminal counters of one execution.
    fn record_execution(&self, scope: &str, attempts: u32, retries: u32);
}

/// Sink that drops every measurement.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_execution(&self, _scope: &str, _attempts: u32, _retries: u32) {}
}
