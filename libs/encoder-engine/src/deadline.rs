use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use encoder_api::CollaboratorError;

/// Run a collaborator call under a per-call deadline.
///
/// An elapsed deadline is reported as `Unavailable`.
pub(crate) async fn bounded<T, F>(what: &str, limit: Duration, call: F) -> Result<T, CollaboratorError>
where
    F: Future<Output = Result<T, CollaboratorError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(|e| e.with_context(what)),
        Err(_) => Err(CollaboratorError::unavailable(format!(
            "{what}: no answer within {}ms",
            limit.as_millis()
        ))),
    }
}

/// Like [`bounded`], but also gives up as soon as `cancel` fires.
pub(crate) async fn cancellable<T, F>(
    what: &str,
    limit: Duration,
    cancel: &CancellationToken,
    call: F,
) -> Result<T, CollaboratorError>
where
    F: Future<Output = Result<T, CollaboratorError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CollaboratorError::unavailable(format!("{what}: aborted by shutdown"))),
        result = bounded(what, limit, call) => result,
    }
}
