//! Stream lifecycle and ingest engine.
//!
//! [`StreamRegistry`] persists stream specs, [`SubscriptionManager`] binds
//! them to broker subscriptions, and [`IngestPipeline`] encrypts and writes
//! every message that arrives on a bound topic. [`Encoder`] wires the three
//! together and owns startup and shutdown ordering.

pub mod bootstrap;
pub mod config;
mod deadline;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod registry;
pub mod routes;
pub mod sealer;
pub mod subscription;

pub use bootstrap::{Collaborators, Encoder};
pub use config::{BrokerConfig, DatastoreConfig, EncoderConfig, RecoveryConfig, StorageConfig, StorageKind};
pub use error::{EngineError, StreamError};
pub use ingest::{DeliveryError, IngestPipeline, IngestSummary, telemetry_record};
pub use metrics::EncoderMetrics;
pub use registry::StreamRegistry;
pub use routes::{RouteTable, StreamState};
pub use sealer::KeySealer;
pub use subscription::{NewStream, RecoveryPolicy, RecoveryReport, SubscriptionManager};
