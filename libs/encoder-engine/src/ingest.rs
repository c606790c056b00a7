use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use encoder_api::{
    Cipher, CollaboratorError, DatastoreClient, EncryptedRecord, InboundMessage, MessageHandler,
    StreamSpec,
};

use crate::deadline::cancellable;
use crate::metrics::EncoderMetrics;
use crate::routes::RouteTable;

/// Why one stream's delivery of a message failed.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("encrypt: {0}")]
    Encrypt(CollaboratorError),

    #[error("write: {0}")]
    Write(CollaboratorError),
}

impl DeliveryError {
    pub fn stage(&self) -> &'static str {
        match self {
            DeliveryError::Encrypt(_) => "encrypt",
            DeliveryError::Write(_) => "write",
        }
    }
}

/// Outcome of one inbound message across all bound streams.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub delivered: usize,
    pub failed: usize,
}

/// Plaintext handed to the cipher for every stream bound to a topic.
#[derive(Serialize)]
struct TelemetryRecord<'a> {
    topic: &'a str,
    observed_at: i64,
    payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    encoding: Option<&'static str>,
}

/// Build the plaintext record for `message`.
///
/// JSON payloads are embedded as JSON; anything else travels as base64.
pub fn telemetry_record(message: &InboundMessage) -> Vec<u8> {
    let (payload, encoding) = match serde_json::from_slice::<serde_json::Value>(&message.payload) {
        Ok(value) => (value, None),
        Err(_) => (
            serde_json::Value::String(BASE64.encode(&message.payload)),
            Some("base64"),
        ),
    };
    let record = TelemetryRecord {
        topic: &message.topic,
        observed_at: message.arrived_at_ms,
        payload,
        encoding,
    };
    // Serializing a Value with string keys cannot fail.
    serde_json::to_vec(&record).unwrap_or_default()
}

/// Per-message handler: topic → bound streams → encrypt → write.
///
/// Deliveries to the streams of one message run concurrently and fail
/// independently. Nothing is retried; lost telemetry is accepted.
pub struct IngestPipeline {
    routes: Arc<RouteTable>,
    cipher: Arc<dyn Cipher>,
    datastore: Arc<dyn DatastoreClient>,
    metrics: Arc<EncoderMetrics>,
    call_timeout: Duration,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl IngestPipeline {
    pub fn new(
        routes: Arc<RouteTable>,
        cipher: Arc<dyn Cipher>,
        datastore: Arc<dyn DatastoreClient>,
        metrics: Arc<EncoderMetrics>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            routes,
            cipher,
            datastore,
            metrics,
            call_timeout,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Deliver one message to every stream bound to its subscription topic.
    pub async fn ingest(&self, message: InboundMessage) -> IngestSummary {
        self.metrics.messages_received.inc();

        if self.cancel.is_cancelled() {
            tracing::debug!(topic = %message.topic, "shutting down, message dropped");
            return IngestSummary::default();
        }

        let streams = self.routes.snapshot(&message.subscription);
        if streams.is_empty() {
            self.metrics.messages_unrouted.inc();
            tracing::debug!(topic = %message.topic, "no stream bound to topic, message dropped");
            return IngestSummary::default();
        }

        let plaintext = telemetry_record(&message);
        let outcomes = futures::future::join_all(
            streams
                .iter()
                .map(|spec| self.deliver(spec, plaintext.clone(), message.arrived_at_ms)),
        )
        .await;

        let mut summary = IngestSummary::default();
        for (spec, outcome) in streams.iter().zip(outcomes) {
            match outcome {
                Ok(()) => {
                    summary.delivered += 1;
                    self.metrics.deliveries.inc();
                }
                Err(e) => {
                    summary.failed += 1;
                    self.metrics.delivery_failures.with_label_values(&[e.stage()]).inc();
                    tracing::warn!(
                        uid = %spec.uid,
                        topic = %message.topic,
                        target = %spec.datastore_target,
                        error = %e,
                        "delivery failed, record dropped"
                    );
                }
            }
        }
        summary
    }

    async fn deliver(
        &self,
        spec: &StreamSpec,
        plaintext: Vec<u8>,
        observed_at_ms: i64,
    ) -> Result<(), DeliveryError> {
        let ciphertext = cancellable(
            "cipher encrypt",
            self.call_timeout,
            &self.cancel,
            self.cipher.encrypt(&spec.recipient_key, plaintext),
        )
        .await
        .map_err(DeliveryError::Encrypt)?;

        let record = EncryptedRecord {
            datastore_target: spec.datastore_target.clone(),
            ciphertext,
            observed_at_ms,
        };
        cancellable(
            "datastore write",
            self.call_timeout,
            &self.cancel,
            self.datastore.write(record),
        )
        .await
        .map_err(DeliveryError::Write)
    }

    /// Messages currently being delivered.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for in-flight messages until `deadline`. `true` if all finished.
    pub async fn drain(&self, deadline: Instant) -> bool {
        self.tracker.close();
        tokio::time::timeout_at(deadline, self.tracker.wait()).await.is_ok()
    }

    /// Abort outstanding encrypt/write calls and drop further messages.
    pub fn abort_in_flight(&self) {
        self.cancel.cancel();
    }
}

impl MessageHandler for IngestPipeline {
    fn handle(&self, message: InboundMessage) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.tracker.track_future(self.ingest(message)).await;
        })
    }
}
