//! Per-connection worker.
//!
//! A worker owns its connection context from the moment it is spawned. It
//! never holds listener handles, derives its own entropy state from the
//! seed the supervisor drew for it, authenticates the client under a
//! deadline, joins shared session state (where the configured connection
//! maximum is the hard cap), and then serves the session until the client
//! or a supervisor control message ends it.
//!
//! Exit codes: 0 for every orderly termination (including client errors
//! and lost connections), nonzero only for genuine failures - the
//! supervisor treats any nonzero exit as a crash and quiesces the fleet.

pub mod auth;
pub mod session;

pub use auth::{AuthError, Authenticator, TrustAuthenticator};

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::{Semaphore, mpsc};
use tracing::debug;

use crate::auxiliary::stats::{StatEvent, StatsSender};
use crate::engine::SessionEngine;
use crate::entropy;
use crate::protocol::{BackendMessage, ErrorInfo, TransactionStatus, sql_state};
use crate::server::context::ConnectionContext;
use crate::server::registry::{WorkerId, WorkerSignal};
use crate::server::stream::ClientStream;

/// Orderly termination.
pub const EXIT_OK: i32 = 0;
/// Unrecoverable failure; triggers fleet quiesce.
pub const EXIT_ERROR: i32 = 1;
/// Immediate exit on a quit message.
pub const EXIT_QUICKDIE: i32 = 2;

pub struct Worker {
    pub id: WorkerId,
    pub context: ConnectionContext,
    pub stream: ClientStream,
    pub signals: mpsc::UnboundedReceiver<WorkerSignal>,
    pub engine: Arc<dyn SessionEngine>,
    pub authenticator: Arc<dyn Authenticator>,
    /// Shared session slots; the permit is the hard connection cap.
    pub session_gate: Arc<Semaphore>,
    pub stats: StatsSender,
    pub authentication_timeout: Duration,
    pub rng_seed: u64,
}

impl Worker {
    pub async fn run(mut self) -> i32 {
        // The worker's own generator, derived before spawn so siblings
        // never share a sequence.
        let mut rng = entropy::worker_rng(self.rng_seed);

        // The whole authentication exchange runs under the deadline;
        // expiry is a termination with no session reporting.
        let authenticated = tokio::time::timeout(
            self.authentication_timeout,
            self.authenticator.authenticate(&self.context, &mut rng),
        )
        .await;
        match authenticated {
            Err(_) => {
                debug!(worker = self.id, "authentication timeout expired");
                return EXIT_OK;
            }
            Ok(Err(e)) => {
                self.send_fatal(
                    sql_state::INVALID_AUTHORIZATION_SPECIFICATION,
                    e.to_string(),
                )
                .await;
                return EXIT_OK;
            }
            Ok(Ok(())) => {}
        }

        // Join shared session state. Admission let us through on the soft
        // cap; the configured maximum is enforced here.
        let _permit = match self.session_gate.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.send_fatal(
                    sql_state::TOO_MANY_CONNECTIONS,
                    "sorry, too many clients already",
                )
                .await;
                return EXIT_OK;
            }
        };

        if self.send_greeting().await.is_err() {
            return EXIT_OK;
        }

        self.stats.send(StatEvent::SessionStart {
            worker: self.id,
            database: self.context.database.clone(),
            user: self.context.user.clone(),
        });

        let code = session::run(
            self.id,
            &mut self.stream,
            &mut self.signals,
            &self.engine,
        )
        .await;

        self.stats.send(StatEvent::SessionEnd { worker: self.id });
        code
    }

    /// Authentication result, key data for cancels, session parameters,
    /// and the first ready-for-query.
    async fn send_greeting(&mut self) -> std::io::Result<()> {
        let mut greeting = BackendMessage::AuthenticationOk.to_bytes();
        greeting.extend_from_slice(
            &BackendMessage::BackendKeyData {
                worker_id: self.id,
                cancel_secret: self.context.cancel_secret,
            }
            .to_bytes(),
        );
        for (name, value) in [
            ("server_version", env!("CARGO_PKG_VERSION")),
            ("server_encoding", "UTF8"),
            ("client_encoding", "UTF8"),
        ] {
            greeting.extend_from_slice(
                &BackendMessage::ParameterStatus {
                    name: name.to_string(),
                    value: value.to_string(),
                }
                .to_bytes(),
            );
        }
        greeting.extend_from_slice(
            &BackendMessage::ReadyForQuery {
                status: TransactionStatus::Idle,
            }
            .to_bytes(),
        );
        self.stream.write_all(&greeting).await?;
        self.stream.flush().await
    }

    async fn send_fatal(&mut self, code: &'static str, message: impl Into<String>) {
        let reply = BackendMessage::ErrorResponse(ErrorInfo::fatal(code, message.into()));
        let _ = self.stream.write_all(&reply.to_bytes()).await;
        let _ = self.stream.flush().await;
    }
}
