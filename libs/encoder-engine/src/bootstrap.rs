use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use encoder_api::{Broker, Cipher, Component, DatastoreClient, StreamStorage};

use crate::config::EncoderConfig;
use crate::deadline::bounded;
use crate::error::EngineError;
use crate::ingest::IngestPipeline;
use crate::metrics::EncoderMetrics;
use crate::registry::StreamRegistry;
use crate::routes::RouteTable;
use crate::sealer::KeySealer;
use crate::subscription::{RecoveryPolicy, RecoveryReport, SubscriptionManager};

/// Time given to aborted deliveries to unwind once the grace period is over.
const ABORT_SETTLE: Duration = Duration::from_millis(250);

/// The external systems the engine drives, built by the composition root.
#[derive(Clone)]
pub struct Collaborators {
    pub storage: Arc<dyn StreamStorage>,
    pub broker: Arc<dyn Broker>,
    pub cipher: Arc<dyn Cipher>,
    pub datastore: Arc<dyn DatastoreClient>,
}

/// The running engine: registry, subscriptions and ingest, wired once.
pub struct Encoder {
    manager: Arc<SubscriptionManager>,
    pipeline: Arc<IngestPipeline>,
    collaborators: Collaborators,
    metrics: Arc<EncoderMetrics>,
    metrics_registry: prometheus::Registry,
    recovery: RecoveryReport,
    call_timeout: Duration,
    shutdown_grace: Duration,
}

impl std::fmt::Debug for Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encoder")
            .field("recovery", &self.recovery)
            .field("active_streams", &self.manager.routes().active_count())
            .finish_non_exhaustive()
    }
}

impl Encoder {
    /// Bootstrap the engine.
    ///
    /// Start order: storage (connect + migrate) → cipher, datastore →
    /// broker → recovery. A failure stops whatever was already started.
    /// The lifecycle RPC surface must only be opened after this returns.
    pub async fn bootstrap(config: &EncoderConfig, collaborators: Collaborators) -> Result<Self, EngineError> {
        Self::bootstrap_with(config, collaborators, |manager| manager).await
    }

    /// Like [`Encoder::bootstrap`], letting the caller adjust the manager
    /// before recovery runs.
    pub async fn bootstrap_with(
        config: &EncoderConfig,
        collaborators: Collaborators,
        customize: impl FnOnce(SubscriptionManager) -> SubscriptionManager,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let call_timeout = config.call_timeout();
        let sealer = KeySealer::from_passphrase(&config.encryption_password)?;
        let metrics_registry = prometheus::Registry::new();
        let metrics = Arc::new(EncoderMetrics::register(&metrics_registry)?);

        // --- 1. Start collaborators in dependency order ---
        if let Err((started, e)) = start_collaborators(&collaborators, call_timeout).await {
            stop_collaborators(&collaborators, started, Instant::now() + call_timeout).await;
            return Err(e);
        }

        // --- 2. Wire ---
        let routes = Arc::new(RouteTable::new());
        let pipeline = Arc::new(IngestPipeline::new(
            routes.clone(),
            collaborators.cipher.clone(),
            collaborators.datastore.clone(),
            metrics.clone(),
            call_timeout,
        ));
        let registry = StreamRegistry::new(collaborators.storage.clone(), sealer, call_timeout);
        let manager = customize(SubscriptionManager::new(
            registry,
            collaborators.broker.clone(),
            collaborators.cipher.clone(),
            pipeline.clone(),
            routes,
            metrics.clone(),
            call_timeout,
            RecoveryPolicy::from(&config.recovery),
        ));
        let manager = Arc::new(manager);

        // --- 3. Recover ---
        let recovery = match manager.recover().await {
            Ok(report) => report,
            Err(e) => {
                stop_collaborators(&collaborators, STARTED_ALL, Instant::now() + call_timeout).await;
                return Err(EngineError::Recovery(e));
            }
        };

        Ok(Encoder {
            manager,
            pipeline,
            collaborators,
            metrics,
            metrics_registry,
            recovery,
            call_timeout,
            shutdown_grace: config.shutdown_grace(),
        })
    }

    pub fn manager(&self) -> &Arc<SubscriptionManager> {
        &self.manager
    }

    pub fn metrics(&self) -> &Arc<EncoderMetrics> {
        &self.metrics
    }

    /// Registry the `/metrics` endpoint renders.
    pub fn metrics_registry(&self) -> &prometheus::Registry {
        &self.metrics_registry
    }

    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    /// Ordered shutdown, bounded by `deadline`.
    ///
    /// The caller closes the RPC surface first. Then: accepted lifecycle
    /// calls get until `deadline` → broker stops delivering → in-flight
    /// deliveries get until `deadline` → leftovers are aborted → datastore,
    /// cipher, storage stop.
    pub async fn shutdown(self, deadline: Instant) {
        let c = &self.collaborators;
        if !self.manager.drain(deadline).await {
            tracing::warn!(
                in_flight = self.manager.in_flight(),
                "grace period elapsed with lifecycle calls still running"
            );
        }

        stop_component(c.broker.as_ref(), deadline.max(Instant::now() + self.call_timeout)).await;

        if !self.pipeline.drain(deadline).await {
            tracing::warn!(
                in_flight = self.pipeline.in_flight(),
                "grace period elapsed, aborting in-flight deliveries"
            );
            self.pipeline.abort_in_flight();
            if !self.pipeline.drain(Instant::now() + ABORT_SETTLE).await {
                tracing::warn!(in_flight = self.pipeline.in_flight(), "deliveries still unwinding, moving on");
            }
        } else {
            self.pipeline.abort_in_flight();
        }

        // Broker already stopped above.
        stop_collaborators(c, STARTED_ALL - 1, Instant::now() + self.call_timeout).await;
        tracing::info!("engine shut down");
    }
}

// ---------------------------------------------------------------------------
// Component lifecycle helpers
// ---------------------------------------------------------------------------

/// Number of collaborators `start_collaborators` brings up.
const STARTED_ALL: usize = 4;

/// Start storage → cipher → datastore → broker. On failure, returns how many
/// were started before the failing one.
async fn start_collaborators(c: &Collaborators, limit: Duration) -> Result<(), (usize, EngineError)> {
    start_component(c.storage.as_ref(), limit).await.map_err(|e| (0, e))?;
    start_component(c.cipher.as_ref(), limit).await.map_err(|e| (1, e))?;
    start_component(c.datastore.as_ref(), limit).await.map_err(|e| (2, e))?;
    start_component(c.broker.as_ref(), limit).await.map_err(|e| (3, e))?;
    Ok(())
}

/// Stop the first `started` collaborators of the start order, in reverse.
async fn stop_collaborators(c: &Collaborators, started: usize, deadline: Instant) {
    if started > 3 {
        stop_component(c.broker.as_ref(), deadline).await;
    }
    if started > 2 {
        stop_component(c.datastore.as_ref(), deadline).await;
    }
    if started > 1 {
        stop_component(c.cipher.as_ref(), deadline).await;
    }
    if started > 0 {
        stop_component(c.storage.as_ref(), deadline).await;
    }
}

async fn start_component<C: Component + ?Sized>(component: &C, limit: Duration) -> Result<(), EngineError> {
    bounded("start", limit, component.start())
        .await
        .map_err(|source| EngineError::Start {
            component: component.name().to_string(),
            source,
        })?;
    tracing::info!(component = %component.name(), "started");
    Ok(())
}

/// Errors are logged, never returned: shutdown must go on.
async fn stop_component<C: Component + ?Sized>(component: &C, deadline: Instant) {
    let limit = deadline.saturating_duration_since(Instant::now());
    match bounded("stop", limit, component.stop()).await {
        Ok(()) => tracing::info!(component = %component.name(), "stopped"),
        Err(e) => tracing::error!(component = %component.name(), error = %e, "stop failed"),
    }
}
