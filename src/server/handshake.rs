use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;

use crate::protocol::startup::{PROTOCOL_EARLIEST, PROTOCOL_LATEST};
use crate::protocol::{BackendMessage, ErrorInfo, ProtocolError, StartupMessage, sql_state};
use crate::server::admission::{self, FleetSnapshot};
use crate::server::context::ConnectionContext;
use crate::server::listener::{Accepted, EndpointInfo};
use crate::server::registry::Registry;
use crate::server::stream::{ClientStream, TlsUpgrader};

/// How one handshake ended.
pub enum HandshakeOutcome {
    /// A session request passed admission; spawn a worker for it.
    Admitted {
        context: ConnectionContext,
        stream: ClientStream,
    },
    /// A cancel request was routed; nothing is ever reported back.
    CancelDispatched,
    /// A reject or unsupported-protocol reply was sent (best effort).
    Rejected { category: &'static str },
}

/// Processes the startup exchange of one accepted connection.
///
/// Runs as an unauthenticated pre-spawn task; it touches supervisor state
/// only through the fleet snapshot, the registry (cancel path and child
/// count), and the outcome it returns.
pub struct Handshake {
    endpoint: EndpointInfo,
    remote: Option<SocketAddr>,
    tls_enabled: bool,
    tls: Option<Arc<dyn TlsUpgrader>>,
    stream: ClientStream,
}

impl Handshake {
    pub fn new(
        accepted: Accepted,
        tls_enabled: bool,
        tls: Option<Arc<dyn TlsUpgrader>>,
    ) -> Self {
        Self {
            endpoint: accepted.endpoint,
            remote: accepted.remote,
            tls_enabled,
            tls,
            stream: accepted.stream,
        }
    }

    /// Drive the handshake to an outcome.
    ///
    /// The admission verdict is computed and recorded in the connection
    /// context before anything is written back, so a reject costs one
    /// non-blocking write. Communication failures surface as errors and
    /// are not answered.
    pub async fn run(
        self,
        registry: &Registry,
        fleet: &Mutex<FleetSnapshot>,
        soft_cap: usize,
        salt: [u8; 4],
    ) -> Result<HandshakeOutcome, ProtocolError> {
        let Handshake {
            endpoint,
            remote,
            tls_enabled,
            tls,
            mut stream,
        } = self;

        let mut negotiated = false;
        loop {
            let message = match StartupMessage::read(&mut stream, negotiated).await {
                Ok(message) => message,
                Err(e) => return Self::answer_failure(&stream, e),
            };

            match message {
                StartupMessage::NegotiateTls => {
                    // Secure transport is never offered on local endpoints.
                    let accept = tls_enabled && !endpoint.local && tls.is_some();
                    stream
                        .write_all(if accept { b"S" } else { b"N" })
                        .await?;
                    stream.flush().await?;
                    if accept {
                        if let Some(upgrader) = &tls {
                            stream = upgrader.upgrade(stream).await?;
                        }
                    }
                    // Exactly one more startup message may follow, and it
                    // must not negotiate again.
                    negotiated = true;
                }
                StartupMessage::Cancel {
                    worker_id,
                    cancel_secret,
                } => {
                    registry.cancel(worker_id, cancel_secret);
                    return Ok(HandshakeOutcome::CancelDispatched);
                }
                StartupMessage::Start {
                    version,
                    parameters,
                } => {
                    let verdict =
                        admission::assess(*fleet.lock(), registry.children(), soft_cap);
                    let context = ConnectionContext {
                        endpoint,
                        remote,
                        version,
                        user: parameters.user,
                        database: parameters.database,
                        options: parameters.options,
                        session_options: parameters.extra,
                        admission: verdict,
                        cancel_secret: 0,
                        salt,
                    };

                    if let Some(info) = verdict.rejection() {
                        reject_oneshot(&stream, &info);
                        return Ok(HandshakeOutcome::Rejected {
                            category: verdict.category(),
                        });
                    }
                    debug_assert!(context.admission.is_ok());
                    return Ok(HandshakeOutcome::Admitted { context, stream });
                }
            }
        }
    }

    /// Answer a failed startup read with the appropriate one-shot reply.
    fn answer_failure(
        stream: &ClientStream,
        error: ProtocolError,
    ) -> Result<HandshakeOutcome, ProtocolError> {
        match error {
            ProtocolError::UnsupportedVersion { major, minor } => {
                let info = ErrorInfo::fatal(
                    sql_state::FEATURE_NOT_SUPPORTED,
                    format!(
                        "unsupported frontend protocol {major}.{minor}: \
                         server supports {PROTOCOL_EARLIEST} to {PROTOCOL_LATEST}"
                    ),
                );
                reject_oneshot(stream, &info);
                Ok(HandshakeOutcome::Rejected {
                    category: "UNSUPPORTED_PROTOCOL",
                })
            }
            ProtocolError::NoUserName => {
                let info = ErrorInfo::fatal(
                    sql_state::INVALID_AUTHORIZATION_SPECIFICATION,
                    error.to_string(),
                );
                reject_oneshot(stream, &info);
                Ok(HandshakeOutcome::Rejected {
                    category: "BAD_USER",
                })
            }
            // A plain hangup (often right after a negotiation answer the
            // client did not like) gets no reply.
            ProtocolError::IncompletePacket | ProtocolError::Io(_) => Err(error),
            violation => {
                let info =
                    ErrorInfo::fatal(sql_state::PROTOCOL_VIOLATION, violation.to_string());
                reject_oneshot(stream, &info);
                Err(violation)
            }
        }
    }
}

/// Best-effort one-shot error reply: a single non-blocking write, no
/// retry, before the connection closes.
fn reject_oneshot(stream: &ClientStream, info: &ErrorInfo) {
    let message = BackendMessage::ErrorResponse(info.clone());
    let _ = stream.try_write_oneshot(&message.to_bytes());
}
