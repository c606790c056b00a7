use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;

use encoder_api::{Broker, Cipher, MessageHandler, StreamSpec, SubscriptionHandle, now_ms, topic};

use crate::config::RecoveryConfig;
use crate::deadline::bounded;
use crate::error::StreamError;
use crate::metrics::EncoderMetrics;
use crate::registry::StreamRegistry;
use crate::routes::{RouteTable, StreamState};

/// Input of `CreateStream`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewStream {
    pub topic: String,
    pub recipient_key: String,
    pub datastore_target: String,
}

/// Bounded exponential backoff for resubscribing during recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&RecoveryConfig> for RecoveryPolicy {
    fn from(cfg: &RecoveryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
        }
    }
}

/// Result of a recovery pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Streams that reached `Active`.
    pub active: Vec<String>,
    /// Streams left `Pending` after all attempts failed.
    pub failed: Vec<String>,
}

/// A live binding: stream spec plus the broker token it is delivered through.
#[derive(Debug, Clone)]
struct Subscription {
    spec: Arc<StreamSpec>,
    handle: SubscriptionHandle,
}

/// One broker subscription shared by every stream on the topic.
#[derive(Debug)]
struct TopicBinding {
    handle: SubscriptionHandle,
    uids: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct ManagerState {
    /// uid → live subscription.
    subscriptions: HashMap<String, Subscription>,
    /// uid → persisted stream without a live subscription.
    pending: HashMap<String, Arc<StreamSpec>>,
    /// topic → broker subscription and the uids bound to it.
    topics: HashMap<String, TopicBinding>,
}

impl ManagerState {
    fn knows(&self, uid: &str) -> bool {
        self.subscriptions.contains_key(uid) || self.pending.contains_key(uid)
    }
}

type UidGenerator = Box<dyn Fn() -> String + Send + Sync>;

/// Binds registry entries to live broker subscriptions.
///
/// Every lifecycle transition holds one mutex for its whole duration, so
/// create, delete and recovery are serialized across all uids (the topic
/// index is shared). Message dispatch never takes that mutex; it reads the
/// [`RouteTable`].
///
/// Transitions run on tasks owned by the manager. A caller that stops
/// waiting (client disconnect, aborted request) does not cut a transition
/// short; it still completes or rolls back.
pub struct SubscriptionManager {
    core: Arc<Core>,
    lifecycle: TaskTracker,
    next_uid: UidGenerator,
}

/// State and collaborators shared with the transition tasks.
struct Core {
    registry: StreamRegistry,
    broker: Arc<dyn Broker>,
    cipher: Arc<dyn Cipher>,
    handler: Arc<dyn MessageHandler>,
    routes: Arc<RouteTable>,
    metrics: Arc<EncoderMetrics>,
    call_timeout: Duration,
    recovery: RecoveryPolicy,
    state: Mutex<ManagerState>,
    recovered: AtomicBool,
    closing: AtomicBool,
}

impl SubscriptionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: StreamRegistry,
        broker: Arc<dyn Broker>,
        cipher: Arc<dyn Cipher>,
        handler: Arc<dyn MessageHandler>,
        routes: Arc<RouteTable>,
        metrics: Arc<EncoderMetrics>,
        call_timeout: Duration,
        recovery: RecoveryPolicy,
    ) -> Self {
        Self {
            core: Arc::new(Core {
                registry,
                broker,
                cipher,
                handler,
                routes,
                metrics,
                call_timeout,
                recovery,
                state: Mutex::new(ManagerState::default()),
                recovered: AtomicBool::new(false),
                closing: AtomicBool::new(false),
            }),
            lifecycle: TaskTracker::new(),
            next_uid: Box::new(|| uuid::Uuid::new_v4().to_string()),
        }
    }

    /// Replace the uid source (UUID v4 by default).
    pub fn with_uid_generator(mut self, generator: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.next_uid = Box::new(generator);
        self
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.core.routes
    }

    /// Current state of `uid`, without waiting on lifecycle calls.
    pub fn state(&self, uid: &str) -> StreamState {
        self.core.routes.state(uid)
    }

    /// Registered streams, straight from the registry.
    pub async fn list_streams(&self) -> Result<Vec<StreamSpec>, StreamError> {
        self.core.registry.list().await
    }

    /// Validate, persist, subscribe, bind. Returns the new uid.
    ///
    /// A subscribe failure removes the registry entry written by this call.
    pub async fn create_stream(&self, request: NewStream) -> Result<String, StreamError> {
        self.core.ensure_ready()?;
        self.core.validate(&request)?;

        let spec = StreamSpec {
            uid: (self.next_uid)(),
            topic: request.topic,
            recipient_key: request.recipient_key,
            datastore_target: request.datastore_target,
            created_at_ms: now_ms(),
        };
        let core = self.core.clone();
        self.run(async move { core.create(spec).await }).await
    }

    /// Unsubscribe (best-effort), unregister (authoritative), unbind.
    pub async fn delete_stream(&self, uid: &str) -> Result<(), StreamError> {
        self.core.ensure_ready()?;
        let core = self.core.clone();
        let uid = uid.to_string();
        self.run(async move { core.delete(&uid).await }).await
    }

    /// Rebuild live subscriptions from the registry.
    ///
    /// Per-stream subscribe failures are retried with bounded backoff and
    /// leave the stream `Pending`; they never fail the pass. Only a registry
    /// listing failure does. Calling it again retries pending streams.
    pub async fn recover(&self) -> Result<RecoveryReport, StreamError> {
        let core = self.core.clone();
        self.run(async move { core.recover().await }).await
    }

    /// Refuse new lifecycle calls and wait for accepted ones until
    /// `deadline`. `true` if none is left running.
    pub async fn drain(&self, deadline: Instant) -> bool {
        self.core.closing.store(true, Ordering::Release);
        self.lifecycle.close();
        tokio::time::timeout_at(deadline, self.lifecycle.wait()).await.is_ok()
    }

    /// Lifecycle transitions still running.
    pub fn in_flight(&self) -> usize {
        self.lifecycle.len()
    }

    /// Run `transition` on a tracked task and wait for its outcome.
    async fn run<T, F>(&self, transition: F) -> Result<T, StreamError>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, StreamError>> + Send + 'static,
    {
        match self.lifecycle.spawn(transition).await {
            Ok(outcome) => outcome,
            Err(e) => Err(StreamError::Internal(format!("lifecycle task failed: {e}"))),
        }
    }
}

impl Core {
    fn ensure_ready(&self) -> Result<(), StreamError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(StreamError::Unavailable("shutting down".into()));
        }
        if !self.recovered.load(Ordering::Acquire) {
            return Err(StreamError::Unavailable("recovery has not completed".into()));
        }
        Ok(())
    }

    fn validate(&self, request: &NewStream) -> Result<(), StreamError> {
        topic::validate_filter(&request.topic).map_err(StreamError::InvalidArgument)?;
        self.cipher
            .check_recipient(&request.recipient_key)
            .map_err(|e| StreamError::InvalidArgument(format!("recipient key: {}", e.message())))?;
        if request.datastore_target.trim().is_empty() {
            return Err(StreamError::InvalidArgument("datastore target must not be empty".into()));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Create
    // -----------------------------------------------------------------------

    async fn create(&self, spec: StreamSpec) -> Result<String, StreamError> {
        let uid = spec.uid.clone();
        let mut state = self.state.lock().await;
        if state.knows(&uid) {
            return Err(StreamError::Conflict(uid));
        }

        // 1. Persist. Nothing else happens if this fails.
        self.registry.create(&spec).await?;
        let spec = Arc::new(spec);
        self.routes.set_state(&uid, StreamState::Pending);

        // 2. Subscribe, or compensate.
        let handle = match self.attach(&state, &spec).await {
            Ok(handle) => handle,
            Err(e) => {
                self.compensate(&mut state, &spec).await;
                return Err(e);
            }
        };

        // 3. Bind.
        self.bind(&mut state, spec.clone(), handle);
        tracing::info!(uid = %uid, topic = %spec.topic, target = %spec.datastore_target, "stream created");
        Ok(uid)
    }

    /// Undo step 1 of a failed create.
    async fn compensate(&self, state: &mut ManagerState, spec: &Arc<StreamSpec>) {
        match self.registry.delete(&spec.uid).await {
            Ok(()) | Err(StreamError::NotFound(_)) => {
                self.routes.remove(&spec.uid, &spec.topic);
                tracing::info!(uid = %spec.uid, topic = %spec.topic, "subscribe failed, registry entry rolled back");
            }
            Err(e) => {
                // The row survived; keep it deletable and let the next recovery retry it.
                state.pending.insert(spec.uid.clone(), spec.clone());
                tracing::error!(uid = %spec.uid, topic = %spec.topic, error = %e, "rollback of registry entry failed, stream left pending");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Delete
    // -----------------------------------------------------------------------

    async fn delete(&self, uid: &str) -> Result<(), StreamError> {
        let mut state = self.state.lock().await;

        if let Some(spec) = state.pending.get(uid).cloned() {
            self.unregister(uid).await?;
            state.pending.remove(uid);
            self.routes.remove(uid, &spec.topic);
            tracing::info!(uid = %uid, topic = %spec.topic, "pending stream deleted");
            return Ok(());
        }

        let Some(sub) = state.subscriptions.get(uid).cloned() else {
            return Err(StreamError::NotFound(uid.to_string()));
        };
        let topic = sub.spec.topic.clone();
        self.routes.set_state(uid, StreamState::Stopping);

        // 1. Release the broker subscription when this is the topic's last stream.
        let last_on_topic = state
            .topics
            .get(&topic)
            .is_none_or(|binding| binding.uids.iter().all(|u| u == uid));
        if last_on_topic {
            match bounded("broker unsubscribe", self.call_timeout, self.broker.unsubscribe(&sub.handle)).await {
                Ok(()) => tracing::debug!(uid = %uid, handle = %sub.handle, "unsubscribed"),
                Err(e) => tracing::warn!(uid = %uid, handle = %sub.handle, error = %e, "unsubscribe failed, continuing"),
            }
        }

        // 2. Unregister. Authoritative: once the row is gone, the stream is gone.
        if let Err(e) = self.unregister(uid).await {
            if last_on_topic {
                self.restore(&mut state, &sub).await;
            } else {
                self.routes.set_state(uid, StreamState::Active);
            }
            return Err(e);
        }

        // 3. Unbind.
        self.unbind(&mut state, uid, &topic);
        tracing::info!(uid = %uid, topic = %topic, "stream deleted");
        Ok(())
    }

    /// Registry delete where an already-missing row counts as done.
    async fn unregister(&self, uid: &str) -> Result<(), StreamError> {
        match self.registry.delete(uid).await {
            Ok(()) => Ok(()),
            Err(StreamError::NotFound(_)) => {
                tracing::warn!(uid = %uid, "registry entry already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Re-open the subscription dropped by a delete whose registry step failed.
    async fn restore(&self, state: &mut ManagerState, sub: &Subscription) {
        let uid = sub.spec.uid.clone();
        let topic = sub.spec.topic.clone();
        match bounded(
            "broker subscribe",
            self.call_timeout,
            self.broker.subscribe(&topic, self.handler.clone()),
        )
        .await
        {
            Ok(handle) => {
                if let Some(binding) = state.topics.get_mut(&topic) {
                    binding.handle = handle.clone();
                }
                if let Some(live) = state.subscriptions.get_mut(&uid) {
                    live.handle = handle;
                }
                self.routes.set_state(&uid, StreamState::Active);
                tracing::info!(uid = %uid, topic = %topic, "subscription restored after failed delete");
            }
            Err(e) => {
                self.detach(state, &uid, &topic);
                state.pending.insert(uid.clone(), sub.spec.clone());
                self.routes.deactivate(&uid, &topic);
                tracing::error!(uid = %uid, topic = %topic, error = %e, "cannot restore subscription, stream left pending");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    async fn recover(&self) -> Result<RecoveryReport, StreamError> {
        // Listing under the lock: a delete finishing in between must not
        // have its row resurrected.
        let mut state = self.state.lock().await;
        let specs = self.registry.list().await?;
        let mut report = RecoveryReport::default();

        tracing::info!(streams = specs.len(), "recovering streams");
        for spec in specs {
            if state.subscriptions.contains_key(&spec.uid) {
                continue;
            }
            let spec = Arc::new(spec);
            match self.attach_with_retry(&state, &spec).await {
                Ok(handle) => {
                    state.pending.remove(&spec.uid);
                    report.active.push(spec.uid.clone());
                    self.bind(&mut state, spec, handle);
                }
                Err((attempts, e)) => {
                    self.metrics.recovery_failures.inc();
                    tracing::error!(
                        uid = %spec.uid,
                        topic = %spec.topic,
                        attempts,
                        error = %e,
                        "stream recovery failed, left pending"
                    );
                    report.failed.push(spec.uid.clone());
                    self.routes.set_state(&spec.uid, StreamState::Pending);
                    state.pending.insert(spec.uid.clone(), spec);
                }
            }
        }

        self.recovered.store(true, Ordering::Release);
        tracing::info!(active = report.active.len(), failed = report.failed.len(), "recovery complete");
        Ok(report)
    }

    async fn attach_with_retry(
        &self,
        state: &ManagerState,
        spec: &Arc<StreamSpec>,
    ) -> Result<SubscriptionHandle, (u32, StreamError)> {
        let mut delay = self.recovery.initial_backoff;
        let mut attempt = 1;
        loop {
            match self.attach(state, spec).await {
                Ok(handle) => return Ok(handle),
                Err(e) if attempt >= self.recovery.max_attempts => return Err((attempt, e)),
                Err(e) => {
                    tracing::warn!(
                        uid = %spec.uid,
                        topic = %spec.topic,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "resubscribe failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.recovery.max_backoff);
                    attempt += 1;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Map maintenance (caller holds the state mutex)
    // -----------------------------------------------------------------------

    /// Handle of the topic's broker subscription, opening it if needed.
    async fn attach(&self, state: &ManagerState, spec: &StreamSpec) -> Result<SubscriptionHandle, StreamError> {
        if let Some(binding) = state.topics.get(&spec.topic) {
            return Ok(binding.handle.clone());
        }
        bounded(
            "broker subscribe",
            self.call_timeout,
            self.broker.subscribe(&spec.topic, self.handler.clone()),
        )
        .await
        .map_err(|e| StreamError::from_collaborator(&spec.uid, e))
    }

    fn bind(&self, state: &mut ManagerState, spec: Arc<StreamSpec>, handle: SubscriptionHandle) {
        state
            .topics
            .entry(spec.topic.clone())
            .or_insert_with(|| TopicBinding {
                handle: handle.clone(),
                uids: BTreeSet::new(),
            })
            .uids
            .insert(spec.uid.clone());
        state.subscriptions.insert(
            spec.uid.clone(),
            Subscription {
                spec: spec.clone(),
                handle,
            },
        );
        self.routes.activate(spec);
        self.metrics.active_streams.set(state.subscriptions.len() as i64);
    }

    /// Drop `uid` from the subscription and topic maps.
    fn detach(&self, state: &mut ManagerState, uid: &str, topic: &str) {
        state.subscriptions.remove(uid);
        if let Some(binding) = state.topics.get_mut(topic) {
            binding.uids.remove(uid);
            if binding.uids.is_empty() {
                state.topics.remove(topic);
            }
        }
        self.metrics.active_streams.set(state.subscriptions.len() as i64);
    }

    fn unbind(&self, state: &mut ManagerState, uid: &str, topic: &str) {
        self.detach(state, uid, topic);
        self.routes.remove(uid, topic);
    }
}
