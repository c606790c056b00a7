use std::future::Future;
use std::pin::Pin;

use crate::component::Component;
use crate::error::CollaboratorError;
use crate::stream::EncryptedRecord;

/// Remote append-only sink for encrypted records.
///
/// `Unavailable` for transient faults, `Rejected` for permanent ones.
/// Writes are not assumed to be idempotent.
pub trait DatastoreClient: Component {
    fn write(
        &self,
        record: EncryptedRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), CollaboratorError>> + Send + '_>>;
}
