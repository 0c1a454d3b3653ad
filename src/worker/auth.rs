use rand::rngs::StdRng;
use thiserror::Error;

use crate::server::context::ConnectionContext;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication failed for user \"{0}\"")]
    Rejected(String),
}

/// Authentication back-end seam.
///
/// Real back-ends (password, challenge-response) exchange messages with
/// the client and draw challenge material from the worker's own generator;
/// the supervisor only guarantees the deadline around the whole exchange.
#[async_trait::async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn authenticate(
        &self,
        context: &ConnectionContext,
        rng: &mut StdRng,
    ) -> Result<(), AuthError>;

    /// Re-read authentication state (password and group files); invoked on
    /// the corresponding wake-up.
    fn refresh(&self) {}
}

/// Accepts everyone; the default for local development and tests.
pub struct TrustAuthenticator;

#[async_trait::async_trait]
impl Authenticator for TrustAuthenticator {
    async fn authenticate(
        &self,
        _context: &ConnectionContext,
        _rng: &mut StdRng,
    ) -> Result<(), AuthError> {
        Ok(())
    }
}
