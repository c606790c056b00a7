use serde::{Deserialize, Serialize};

/// A persistent binding from one topic to one recipient and one datastore
/// destination. `uid` is the only identity key; several specs may share a
/// topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub uid: String,
    pub topic: String,
    pub recipient_key: String,
    pub datastore_target: String,
    /// Creation time, Unix milliseconds.
    pub created_at_ms: i64,
}

/// The row handed to storage: a [`StreamSpec`] whose recipient key has been
/// sealed by the registry. Storage never sees key material in the clear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredStream {
    pub uid: String,
    pub topic: String,
    /// `nonce || ciphertext` of the recipient key.
    pub sealed_recipient_key: Vec<u8>,
    pub datastore_target: String,
    pub created_at_ms: i64,
}

/// Ciphertext ready for the datastore. Produced per message and per stream,
/// never stored locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedRecord {
    pub datastore_target: String,
    pub ciphertext: Vec<u8>,
    /// Broker arrival time, Unix milliseconds.
    pub observed_at_ms: i64,
}
