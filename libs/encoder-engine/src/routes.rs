use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use encoder_api::StreamSpec;

/// Lifecycle state of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Persisted, but no live broker subscription (creating, or recovery failed).
    Pending,
    /// Persisted and subscribed; messages are delivered.
    Active,
    /// Delete in progress.
    Stopping,
    /// Gone from registry and maps.
    Removed,
}

#[derive(Debug, Default)]
struct Routes {
    /// topic → uid → spec, active streams only.
    by_topic: HashMap<String, BTreeMap<String, Arc<StreamSpec>>>,
    states: HashMap<String, StreamState>,
}

/// Read-optimized projection of the manager's maps.
///
/// Message dispatch and status queries only take the read lock; the manager
/// takes the write lock for the instant of a map update, never across an
/// await, so delivery is never stuck behind a lifecycle call.
#[derive(Debug, Default)]
pub struct RouteTable {
    inner: RwLock<Routes>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Routes> {
        match self.inner.read() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("route table read lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Routes> {
        match self.inner.write() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("route table write lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Point-in-time snapshot of the streams bound to `topic`.
    pub fn snapshot(&self, topic: &str) -> Vec<Arc<StreamSpec>> {
        self.read()
            .by_topic
            .get(topic)
            .map(|streams| streams.values().cloned().collect())
            .unwrap_or_default()
    }

    /// State of `uid`; `Removed` for uids the engine does not know.
    pub fn state(&self, uid: &str) -> StreamState {
        self.read().states.get(uid).copied().unwrap_or(StreamState::Removed)
    }

    pub fn active_count(&self) -> usize {
        self.read().by_topic.values().map(BTreeMap::len).sum()
    }

    pub(crate) fn set_state(&self, uid: &str, state: StreamState) {
        self.write().states.insert(uid.to_string(), state);
    }

    pub(crate) fn activate(&self, spec: Arc<StreamSpec>) {
        let mut routes = self.write();
        routes.states.insert(spec.uid.clone(), StreamState::Active);
        routes
            .by_topic
            .entry(spec.topic.clone())
            .or_default()
            .insert(spec.uid.clone(), spec);
    }

    /// Stop routing `uid` but keep it known as `Pending`.
    pub(crate) fn deactivate(&self, uid: &str, topic: &str) {
        let mut routes = self.write();
        Self::unroute(&mut routes, uid, topic);
        routes.states.insert(uid.to_string(), StreamState::Pending);
    }

    pub(crate) fn remove(&self, uid: &str, topic: &str) {
        let mut routes = self.write();
        Self::unroute(&mut routes, uid, topic);
        routes.states.remove(uid);
    }

    fn unroute(routes: &mut Routes, uid: &str, topic: &str) {
        if let Some(streams) = routes.by_topic.get_mut(topic) {
            streams.remove(uid);
            if streams.is_empty() {
                routes.by_topic.remove(topic);
            }
        }
    }
}
