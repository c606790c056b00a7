use std::future::Future;
use std::pin::Pin;

use crate::component::Component;
use crate::error::CollaboratorError;
use crate::stream::StoredStream;

/// Durable record of stream bindings.
///
/// The engine doesn't know concrete implementations; it only relies on
/// the error kinds documented per method.
pub trait StreamStorage: Component {
    /// Insert a new row. `Conflict` if the uid already exists.
    fn insert(
        &self,
        row: StoredStream,
    ) -> Pin<Box<dyn Future<Output = Result<(), CollaboratorError>> + Send + '_>>;

    /// Delete a row by uid. `NotFound` if no such row exists.
    fn delete(
        &self,
        uid: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), CollaboratorError>> + Send + '_>>;

    /// All rows, oldest first.
    fn list(&self) -> Pin<Box<dyn Future<Output = Result<Vec<StoredStream>, CollaboratorError>> + Send + '_>>;
}
