use std::future::Future;
use std::pin::Pin;

use crate::error::CollaboratorError;

/// Typed lifecycle implemented by every collaborator.
///
/// The orchestrator calls `start()` in dependency order (storage, then
/// broker) and `stop()` in reverse. Collaborators without connections
/// simply return `Ok(())`.
pub trait Component: Send + Sync {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    /// Connect / migrate / spawn background tasks.
    fn start(&self) -> Pin<Box<dyn Future<Output = Result<(), CollaboratorError>> + Send + '_>>;

    /// Release connections and stop background tasks.
    fn stop(&self) -> Pin<Box<dyn Future<Output = Result<(), CollaboratorError>> + Send + '_>>;
}
