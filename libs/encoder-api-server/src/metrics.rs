use std::time::Instant;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

/// Per-RPC request, response and latency metrics.
#[derive(Clone)]
pub(crate) struct RpcMetrics {
    requests: IntCounterVec,
    /// Labelled by `method` and twirp `code` (`ok` on success).
    responses: IntCounterVec,
    duration: HistogramVec,
}

impl RpcMetrics {
    pub(crate) fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self {
            requests: IntCounterVec::new(
                Opts::new("encoder_rpc_requests_total", "Lifecycle RPCs received"),
                &["method"],
            )?,
            responses: IntCounterVec::new(
                Opts::new("encoder_rpc_responses_total", "Lifecycle RPCs answered, by twirp code"),
                &["method", "code"],
            )?,
            duration: HistogramVec::new(
                HistogramOpts::new("encoder_rpc_duration_seconds", "Lifecycle RPC latency"),
                &["method"],
            )?,
        };
        registry.register(Box::new(metrics.requests.clone()))?;
        registry.register(Box::new(metrics.responses.clone()))?;
        registry.register(Box::new(metrics.duration.clone()))?;
        Ok(metrics)
    }

    /// Count an incoming call; pass the returned instant to [`RpcMetrics::answered`].
    pub(crate) fn received(&self, method: &str) -> Instant {
        self.requests.with_label_values(&[method]).inc();
        Instant::now()
    }

    pub(crate) fn answered(&self, method: &str, code: &str, started: Instant) {
        self.responses.with_label_values(&[method, code]).inc();
        self.duration
            .with_label_values(&[method])
            .observe(started.elapsed().as_secs_f64());
    }
}
