//! Racing store and service calls against a cancellation token.

use crate::error::{ProcessorError, Result};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Await `fut` unless `cancel` fires first. A call in flight is dropped on
/// cancellation.
pub(crate) async fn cancellable<T, E, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<ProcessorError>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProcessorError::Cancelled),
        result = fut => result.map_err(Into::into),
    }
}
