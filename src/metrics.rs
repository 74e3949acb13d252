//! Fire-and-forget metrics sink.

use std::time::Duration;

/// Receives pipeline measurements. Implementations must not block or panic.
pub trait MetricsSink: Send + Sync {
    fn record_request(&self, agent: &str, status: &str, latency: Duration);

    fn record_retrieval_hits(&self, agent: &str, count: usize);

    fn record_synthesis_tokens(&self, agent: &str, count: u32);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_request(&self, _agent: &str, _status: &str, _latency: Duration) {}

    fn record_retrieval_hits(&self, _agent: &str, _count: usize) {}

    fn record_synthesis_tokens(&self, _agent: &str, _count: u32) {}
}

/// Emits each measurement as a structured `tracing` event on the `metrics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record_request(&self, agent: &str, status: &str, latency: Duration) {
        tracing::info!(
            target: "metrics",
            agent,
            status,
            latency_ms = latency.as_millis() as u64,
            "request"
        );
    }

    fn record_retrieval_hits(&self, agent: &str, count: usize) {
        tracing::info!(target: "metrics", agent, count, "retrieval_hits");
    }

    fn record_synthesis_tokens(&self, agent: &str, count: u32) {
        tracing::info!(target: "metrics", agent, count, "synthesis_tokens");
    }
}
