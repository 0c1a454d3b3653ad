//! Connection dispatch: listening, handshake, admission, worker spawn.
//!
//! ## Architecture
//!
//! ```text
//! +-------------+     +-----------+     +-----------+     +----------+
//! | ListenerSet | --> | Handshake | --> | Admission | --> | Spawner  |
//! +-------------+     +-----------+     +-----------+     +----------+
//!                          |                                    |
//!                          v  (cancel request)                  v
//!                     +----------+                         +--------+
//!                     | Registry | <---------------------- | Worker |
//!                     +----------+     (entry per worker)  +--------+
//! ```
//!
//! The listener set owns every bound endpoint; a handshake runs per
//! accepted connection as an unauthenticated task; admission is a pure
//! function of the fleet snapshot; the spawner links a registry row before
//! the worker body can run, so an immediately following cancel request
//! cannot miss it.

pub mod admission;
pub mod context;
pub mod handshake;
pub mod listener;
pub mod registry;
pub mod spawn;
pub mod stream;

pub use admission::{Admission, FleetSnapshot};
pub use context::ConnectionContext;
pub use handshake::{Handshake, HandshakeOutcome};
pub use listener::{Accepted, BindError, EndpointInfo, ListenerSet};
pub use registry::{Registry, WorkerId};
pub use spawn::{Dispatcher, SpawnError};
pub use stream::{ClientStream, TlsUpgrader};
