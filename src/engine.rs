//! Session-engine seam.
//!
//! Query execution is not part of the supervisor; a worker hands each
//! statement of its session to a [`SessionEngine`]. The built-in
//! [`EchoEngine`] answers every statement with a single row echoing it,
//! which is enough to exercise the full connection lifecycle end to end.

use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Statement was interrupted by an out-of-band cancel.
    #[error("canceling statement due to user request")]
    Canceled,

    /// Statement failed; the session continues.
    #[error("{0}")]
    Failed(String),

    /// The engine is in an unrecoverable state; the worker must die
    /// abnormally so the supervisor quiesces the fleet.
    #[error("engine failure: {0}")]
    Crashed(String),
}

/// Result set of one executed statement.
#[derive(Debug, Clone)]
pub struct EngineOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    /// Completion tag reported to the client.
    pub tag: String,
}

/// Executes the statements of one session.
///
/// Implementations must be cheap to share across workers and must poll the
/// interrupt token at their own safe points; cancellation is never
/// synchronous.
#[async_trait::async_trait]
pub trait SessionEngine: Send + Sync + 'static {
    async fn execute(
        &self,
        statement: &str,
        interrupt: &CancellationToken,
    ) -> Result<EngineOutput, EngineError>;
}

/// Default engine: echoes every statement back as one row.
pub struct EchoEngine;

#[async_trait::async_trait]
impl SessionEngine for EchoEngine {
    async fn execute(
        &self,
        statement: &str,
        interrupt: &CancellationToken,
    ) -> Result<EngineOutput, EngineError> {
        if interrupt.is_cancelled() {
            return Err(EngineError::Canceled);
        }
        Ok(EngineOutput {
            columns: vec!["echo".to_string()],
            rows: vec![vec![Some(statement.to_string())]],
            tag: "ECHO 1".to_string(),
        })
    }
}
