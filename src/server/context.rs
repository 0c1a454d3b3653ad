use std::net::SocketAddr;

use crate::protocol::ProtocolVersion;
use crate::server::admission::Admission;
use crate::server::listener::EndpointInfo;

/// Everything a worker needs to know about its connection.
///
/// Built by the handshake processor, owned by the supervisor side until the
/// worker is spawned, then moved into the worker. The cancel secret is
/// written by the spawner and never flows back.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub endpoint: EndpointInfo,
    pub remote: Option<SocketAddr>,
    pub version: ProtocolVersion,
    pub user: String,
    pub database: String,
    /// Extra command-line style options for the worker.
    pub options: Option<String>,
    /// Generic session-scope name/value options.
    pub session_options: Vec<(String, String)>,
    /// Verdict recorded before any reply was sent.
    pub admission: Admission,
    /// Per-worker cancellation secret, filled in at spawn.
    pub cancel_secret: u32,
    /// Per-session salt material for authentication exchanges.
    pub salt: [u8; 4],
}
