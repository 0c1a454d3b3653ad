//! Startup-phase wire protocol.
//!
//! This module implements the client-facing startup protocol: the
//! length-prefixed startup packet with its special request discriminators,
//! and the backend messages the supervisor and workers send in reply.
//!
//! ## Architecture
//!
//! ```text
//! +----------+                            +------------+
//! |  Client  |  --- StartupMessage   -->  | Supervisor |
//! |          |  <-- 'S'/'N', errors  ---  |            |
//! |          |  <-- BackendMessage   ---  |  (worker)  |
//! +----------+                            +------------+
//! ```
//!
//! ## Terminology
//!
//! - **StartupMessage**: the first message on a connection (secure-transport
//!   negotiation, cancel request, or session startup)
//! - **BackendMessage**: messages from server to client (key data, errors,
//!   row data)
//! - **Codec**: framing and string helpers shared by both directions

pub mod codec;
pub mod error;
pub mod reply;
pub mod startup;

pub use error::ProtocolError;
pub use reply::{BackendMessage, ErrorInfo, FieldDescription, TransactionStatus, sql_state};
pub use startup::{
    CANCEL_REQUEST_CODE, MAX_STARTUP_BODY_LENGTH, NEGOTIATE_TLS_CODE, ProtocolVersion,
    StartupMessage, StartupParameters,
};
