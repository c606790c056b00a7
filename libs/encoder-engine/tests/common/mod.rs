//! In-process fakes for the four collaborators.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use encoder_api::{
    Broker, Cipher, CollaboratorError, Component, DatastoreClient, EncryptedRecord, InboundMessage,
    MessageHandler, StoredStream, StreamStorage, SubscriptionHandle, now_ms, topic,
};
use encoder_engine::{Collaborators, Encoder, EncoderConfig, KeySealer, SubscriptionManager};
use encoder_storage_memory::MemoryStorage;

pub const PASSWORD: &str = "correct horse battery staple";

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, CollaboratorError>> + Send + 'a>>;

/// Ordered record of start/stop calls across all fakes.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

fn lifecycle<'a>(journal: &'a Journal, name: &'a str, verb: &'a str, fail: bool) -> BoxFut<'a, ()> {
    Box::pin(async move {
        journal.push(format!("{verb} {name}"));
        if fail {
            return Err(CollaboratorError::unavailable(format!("{name} refused to {verb}")));
        }
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// [`MemoryStorage`] with switchable faults.
pub struct FlakyStorage {
    pub inner: MemoryStorage,
    journal: Journal,
    pub fail_delete: AtomicBool,
    pub fail_list: AtomicBool,
}

impl FlakyStorage {
    pub fn new(journal: Journal, rows: Vec<StoredStream>) -> Self {
        Self {
            inner: MemoryStorage::with_rows(rows),
            journal,
            fail_delete: AtomicBool::new(false),
            fail_list: AtomicBool::new(false),
        }
    }
}

impl Component for FlakyStorage {
    fn name(&self) -> &str {
        "storage"
    }

    fn start(&self) -> BoxFut<'_, ()> {
        lifecycle(&self.journal, "storage", "start", false)
    }

    fn stop(&self) -> BoxFut<'_, ()> {
        lifecycle(&self.journal, "storage", "stop", false)
    }
}

impl StreamStorage for FlakyStorage {
    fn insert(&self, row: StoredStream) -> BoxFut<'_, ()> {
        self.inner.insert(row)
    }

    fn delete(&self, uid: &str) -> BoxFut<'_, ()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Box::pin(async { Err(CollaboratorError::unavailable("connection reset")) });
        }
        self.inner.delete(uid)
    }

    fn list(&self) -> BoxFut<'_, Vec<StoredStream>> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Box::pin(async { Err(CollaboratorError::unavailable("connection refused")) });
        }
        self.inner.list()
    }
}

/// A row as a previous run would have persisted it.
pub fn stored(uid: &str, topic: &str, recipient_key: &str, target: &str) -> StoredStream {
    let sealer = KeySealer::from_passphrase(PASSWORD).unwrap();
    StoredStream {
        uid: uid.into(),
        topic: topic.into(),
        sealed_recipient_key: sealer.seal(recipient_key.as_bytes()).unwrap(),
        datastore_target: target.into(),
        created_at_ms: now_ms(),
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

struct LiveSubscription {
    topic: String,
    handler: Arc<dyn MessageHandler>,
}

/// Broker that delivers whatever the test publishes, synchronously.
pub struct FakeBroker {
    journal: Journal,
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, LiveSubscription>>,
    calls: Mutex<Vec<String>>,
    failing_topics: Mutex<HashSet<String>>,
    subscribe_delay: Mutex<Duration>,
    unsubscribe_delay: Mutex<Duration>,
    pub fail_start: AtomicBool,
}

impl FakeBroker {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            next_id: AtomicU64::new(1),
            live: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            failing_topics: Mutex::new(HashSet::new()),
            subscribe_delay: Mutex::new(Duration::ZERO),
            unsubscribe_delay: Mutex::new(Duration::ZERO),
            fail_start: AtomicBool::new(false),
        }
    }

    /// Refuse every subscribe for `topic` from now on.
    pub fn fail_topic(&self, topic: &str) {
        self.failing_topics.lock().unwrap().insert(topic.to_string());
    }

    pub fn heal_topic(&self, topic: &str) {
        self.failing_topics.lock().unwrap().remove(topic);
    }

    /// Every SUBACK arrives `delay` after the subscribe call.
    pub fn slow_subscribe(&self, delay: Duration) {
        *self.subscribe_delay.lock().unwrap() = delay;
    }

    pub fn slow_unsubscribe(&self, delay: Duration) {
        *self.unsubscribe_delay.lock().unwrap() = delay;
    }

    /// `"subscribe <topic>"` / `"unsubscribe <topic>"`, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn live_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.live.lock().unwrap().values().map(|s| s.topic.clone()).collect();
        topics.sort();
        topics
    }

    /// Hand `payload` to every subscription whose filter matches `topic`.
    /// Returns the number of subscriptions it reached.
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> usize {
        let targets: Vec<(String, Arc<dyn MessageHandler>)> = self
            .live
            .lock()
            .unwrap()
            .values()
            .filter(|s| topic::matches(&s.topic, topic))
            .map(|s| (s.topic.clone(), s.handler.clone()))
            .collect();

        for (filter, handler) in &targets {
            handler
                .handle(InboundMessage {
                    subscription: filter.clone(),
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                    arrived_at_ms: now_ms(),
                })
                .await;
        }
        targets.len()
    }
}

impl Component for FakeBroker {
    fn name(&self) -> &str {
        "broker"
    }

    fn start(&self) -> BoxFut<'_, ()> {
        lifecycle(&self.journal, "broker", "start", self.fail_start.load(Ordering::SeqCst))
    }

    fn stop(&self) -> BoxFut<'_, ()> {
        lifecycle(&self.journal, "broker", "stop", false)
    }
}

impl Broker for FakeBroker {
    fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> BoxFut<'_, SubscriptionHandle> {
        let topic = topic.to_string();
        Box::pin(async move {
            self.calls.lock().unwrap().push(format!("subscribe {topic}"));
            let delay = *self.subscribe_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.failing_topics.lock().unwrap().contains(&topic) {
                return Err(CollaboratorError::unavailable(format!("suback timeout for '{topic}'")));
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.live.lock().unwrap().insert(
                id,
                LiveSubscription {
                    topic: topic.clone(),
                    handler,
                },
            );
            Ok(SubscriptionHandle { id, topic })
        })
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) -> BoxFut<'_, ()> {
        let handle = handle.clone();
        Box::pin(async move {
            self.calls.lock().unwrap().push(format!("unsubscribe {}", handle.topic));
            let delay = *self.unsubscribe_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match self.live.lock().unwrap().remove(&handle.id) {
                Some(_) => Ok(()),
                None => Err(CollaboratorError::not_found(format!("no subscription {handle}"))),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Cipher
// ---------------------------------------------------------------------------

/// "Encrypts" by XOR so the plaintext never shows up verbatim downstream.
pub struct RecordingCipher {
    journal: Journal,
    seen: Mutex<Vec<(String, Vec<u8>)>>,
    failing_keys: Mutex<HashSet<String>>,
}

pub const XOR_MASK: u8 = 0x5a;

impl RecordingCipher {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            seen: Mutex::new(Vec::new()),
            failing_keys: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_key(&self, key: &str) {
        self.failing_keys.lock().unwrap().insert(key.to_string());
    }

    /// `(recipient_key, plaintext)` of every encrypt call.
    pub fn seen(&self) -> Vec<(String, Vec<u8>)> {
        self.seen.lock().unwrap().clone()
    }
}

impl Component for RecordingCipher {
    fn name(&self) -> &str {
        "cipher"
    }

    fn start(&self) -> BoxFut<'_, ()> {
        lifecycle(&self.journal, "cipher", "start", false)
    }

    fn stop(&self) -> BoxFut<'_, ()> {
        lifecycle(&self.journal, "cipher", "stop", false)
    }
}

impl Cipher for RecordingCipher {
    fn check_recipient(&self, recipient_key: &str) -> Result<(), CollaboratorError> {
        if recipient_key.starts_with("age1") {
            Ok(())
        } else {
            Err(CollaboratorError::rejected("not an age recipient"))
        }
    }

    fn encrypt(&self, recipient_key: &str, plaintext: Vec<u8>) -> BoxFut<'_, Vec<u8>> {
        let key = recipient_key.to_string();
        Box::pin(async move {
            self.seen.lock().unwrap().push((key.clone(), plaintext.clone()));
            if self.failing_keys.lock().unwrap().contains(&key) {
                return Err(CollaboratorError::internal("recipient stanza failed"));
            }
            Ok(plaintext.into_iter().map(|b| b ^ XOR_MASK).collect())
        })
    }
}

// ---------------------------------------------------------------------------
// Datastore
// ---------------------------------------------------------------------------

pub struct RecordingDatastore {
    journal: Journal,
    written: Mutex<Vec<EncryptedRecord>>,
    attempts: AtomicU64,
    failing_targets: Mutex<HashSet<String>>,
    delay: Mutex<Duration>,
}

impl RecordingDatastore {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            written: Mutex::new(Vec::new()),
            attempts: AtomicU64::new(0),
            failing_targets: Mutex::new(HashSet::new()),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn fail_target(&self, target: &str) {
        self.failing_targets.lock().unwrap().insert(target.to_string());
    }

    /// Every write takes `delay` before it lands.
    pub fn slow_down(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn written(&self) -> Vec<EncryptedRecord> {
        self.written.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Component for RecordingDatastore {
    fn name(&self) -> &str {
        "datastore"
    }

    fn start(&self) -> BoxFut<'_, ()> {
        lifecycle(&self.journal, "datastore", "start", false)
    }

    fn stop(&self) -> BoxFut<'_, ()> {
        lifecycle(&self.journal, "datastore", "stop", false)
    }
}

impl DatastoreClient for RecordingDatastore {
    fn write(&self, record: EncryptedRecord) -> BoxFut<'_, ()> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let delay = *self.delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.failing_targets.lock().unwrap().contains(&record.datastore_target) {
                return Err(CollaboratorError::rejected(format!(
                    "bucket '{}' does not accept writes",
                    record.datastore_target
                )));
            }
            self.written.lock().unwrap().push(record);
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub fn config() -> EncoderConfig {
    let mut config = EncoderConfig::parse(&format!(
        r#"
        encryption_password = "{PASSWORD}"
        call_timeout_ms = 1000
        shutdown_grace_ms = 500

        [recovery]
        max_attempts = 3
        initial_backoff_ms = 1
        max_backoff_ms = 4
        "#
    ))
    .unwrap();
    config.listen_addr = "127.0.0.1:0".into();
    config
}

pub struct Fakes {
    pub journal: Journal,
    pub storage: Arc<FlakyStorage>,
    pub broker: Arc<FakeBroker>,
    pub cipher: Arc<RecordingCipher>,
    pub datastore: Arc<RecordingDatastore>,
}

impl Fakes {
    pub fn new() -> Self {
        Self::with_rows(Vec::new())
    }

    pub fn with_rows(rows: Vec<StoredStream>) -> Self {
        let journal = Journal::default();
        Self {
            storage: Arc::new(FlakyStorage::new(journal.clone(), rows)),
            broker: Arc::new(FakeBroker::new(journal.clone())),
            cipher: Arc::new(RecordingCipher::new(journal.clone())),
            datastore: Arc::new(RecordingDatastore::new(journal.clone())),
            journal,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            storage: self.storage.clone(),
            broker: self.broker.clone(),
            cipher: self.cipher.clone(),
            datastore: self.datastore.clone(),
        }
    }

    /// Bootstrap with sequential uids `s-1`, `s-2`, ...
    pub async fn boot(&self) -> Encoder {
        let counter = AtomicU64::new(1);
        self.boot_with(move |manager| {
            manager.with_uid_generator(move || format!("s-{}", counter.fetch_add(1, Ordering::SeqCst)))
        })
        .await
    }

    pub async fn boot_with(
        &self,
        customize: impl FnOnce(SubscriptionManager) -> SubscriptionManager,
    ) -> Encoder {
        Encoder::bootstrap_with(&config(), self.collaborators(), customize)
            .await
            .expect("bootstrap")
    }
}

pub fn new_stream(topic: &str, key: &str, target: &str) -> encoder_engine::NewStream {
    encoder_engine::NewStream {
        topic: topic.into(),
        recipient_key: key.into(),
        datastore_target: target.into(),
    }
}
