use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Counters for the ingest path and recovery.
///
/// Registered into an explicit [`Registry`] owned by the composition root;
/// nothing here is global.
#[derive(Clone)]
pub struct EncoderMetrics {
    pub messages_received: IntCounter,
    pub messages_unrouted: IntCounter,
    pub deliveries: IntCounter,
    /// Labelled by `stage` ("encrypt" or "write").
    pub delivery_failures: IntCounterVec,
    pub recovery_failures: IntCounter,
    pub active_streams: IntGauge,
}

impl EncoderMetrics {
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self {
            messages_received: IntCounter::new(
                "encoder_messages_received_total",
                "Broker messages handed to the ingest pipeline",
            )?,
            messages_unrouted: IntCounter::new(
                "encoder_messages_unrouted_total",
                "Broker messages dropped because no stream was bound to their topic",
            )?,
            deliveries: IntCounter::new(
                "encoder_deliveries_total",
                "Encrypted records written to the datastore",
            )?,
            delivery_failures: IntCounterVec::new(
                Opts::new(
                    "encoder_delivery_failures_total",
                    "Per-stream deliveries that failed, by stage",
                ),
                &["stage"],
            )?,
            recovery_failures: IntCounter::new(
                "encoder_recovery_failures_total",
                "Streams that could not be resubscribed during recovery",
            )?,
            active_streams: IntGauge::new("encoder_active_streams", "Streams with a live subscription")?,
        };

        registry.register(Box::new(metrics.messages_received.clone()))?;
        registry.register(Box::new(metrics.messages_unrouted.clone()))?;
        registry.register(Box::new(metrics.deliveries.clone()))?;
        registry.register(Box::new(metrics.delivery_failures.clone()))?;
        registry.register(Box::new(metrics.recovery_failures.clone()))?;
        registry.register(Box::new(metrics.active_streams.clone()))?;
        Ok(metrics)
    }

    pub fn failures(&self, stage: &str) -> u64 {
        self.delivery_failures.with_label_values(&[stage]).get()
    }
}
