pub mod broker;
pub mod cipher;
pub mod component;
pub mod datastore;
pub mod error;
pub mod storage;
pub mod stream;
pub mod topic;

pub use broker::{Broker, InboundMessage, MessageHandler, SubscriptionHandle};
pub use cipher::Cipher;
pub use component::Component;
pub use datastore::DatastoreClient;
pub use error::{CollaboratorError, ErrorKind};
pub use storage::StreamStorage;
pub use stream::{EncryptedRecord, StoredStream, StreamSpec};

/// Current Unix time in milliseconds.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
