use std::sync::Arc;
use std::time::Duration;

use encoder_api::{StoredStream, StreamSpec, StreamStorage};

use crate::deadline::bounded;
use crate::error::StreamError;
use crate::sealer::KeySealer;

/// Typed façade over [`StreamStorage`], the source of truth for which
/// streams should exist.
///
/// Recipient keys are sealed before they reach storage and unsealed on
/// read, so a raw dump of the backing store holds no key material.
pub struct StreamRegistry {
    storage: Arc<dyn StreamStorage>,
    sealer: KeySealer,
    call_timeout: Duration,
}

impl StreamRegistry {
    pub fn new(storage: Arc<dyn StreamStorage>, sealer: KeySealer, call_timeout: Duration) -> Self {
        Self {
            storage,
            sealer,
            call_timeout,
        }
    }

    /// Persist a new spec. `Conflict` if its uid is already registered.
    pub async fn create(&self, spec: &StreamSpec) -> Result<(), StreamError> {
        let row = self.seal(spec)?;
        bounded("storage insert", self.call_timeout, self.storage.insert(row))
            .await
            .map_err(|e| StreamError::from_collaborator(&spec.uid, e))?;
        tracing::debug!(uid = %spec.uid, topic = %spec.topic, "stream registered");
        Ok(())
    }

    /// Remove a spec. `NotFound` if the uid is not registered.
    pub async fn delete(&self, uid: &str) -> Result<(), StreamError> {
        bounded("storage delete", self.call_timeout, self.storage.delete(uid))
            .await
            .map_err(|e| StreamError::from_collaborator(uid, e))?;
        tracing::debug!(uid = %uid, "stream unregistered");
        Ok(())
    }

    /// All registered specs, keys unsealed.
    pub async fn list(&self) -> Result<Vec<StreamSpec>, StreamError> {
        let rows = bounded("storage list", self.call_timeout, self.storage.list())
            .await
            .map_err(|e| StreamError::from_collaborator("*", e))?;
        rows.into_iter().map(|row| self.unseal(row)).collect()
    }

    fn seal(&self, spec: &StreamSpec) -> Result<StoredStream, StreamError> {
        Ok(StoredStream {
            uid: spec.uid.clone(),
            topic: spec.topic.clone(),
            sealed_recipient_key: self.sealer.seal(spec.recipient_key.as_bytes())?,
            datastore_target: spec.datastore_target.clone(),
            created_at_ms: spec.created_at_ms,
        })
    }

    fn unseal(&self, row: StoredStream) -> Result<StreamSpec, StreamError> {
        let key = self
            .sealer
            .unseal(&row.sealed_recipient_key)
            .map_err(|e| StreamError::Internal(format!("stream '{}': {e}", row.uid)))?;
        let recipient_key = String::from_utf8(key)
            .map_err(|e| StreamError::Internal(format!("stream '{}': recipient key: {e}", row.uid)))?;
        Ok(StreamSpec {
            uid: row.uid,
            topic: row.topic,
            recipient_key,
            datastore_target: row.datastore_target,
            created_at_ms: row.created_at_ms,
        })
    }
}
