// src/error.rs
use std::future::Future;
use std::time::Duration;

/// Failure of one bounded call to an external collaborator.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{op} timed out after {limit:?}")]
    Timeout { op: &'static str, limit: Duration },
    #[error("{op} failed: {cause:#}")]
    Upstream {
        op: &'static str,
        cause: anyhow::Error,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,
    #[error("partition {0} is not assigned to this consumer")]
    UnknownPartition(usize),
    #[error("channel layout: {0}")]
    Layout(String),
    #[error("channel database: {0}")]
    Database(#[source] sqlx::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("encoding envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("enqueue failed: {0}")]
    Channel(#[from] ChannelError),
    #[error("enqueue timed out after {0:?}")]
    Timeout(Duration),
}

/// Run `fut` with a deadline. Both an `Err` and an elapsed timeout count as
/// the failure of `op`.
pub async fn within<T, F>(limit: Duration, op: &'static str, fut: F) -> Result<T, PipelineError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(cause)) => Err(PipelineError::Upstream { op, cause }),
        Err(_) => Err(PipelineError::Timeout { op, limit }),
    }
}
