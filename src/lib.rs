//! gatehouse: connection-dispatch supervisor for a client/server
//! relational database.
//!
//! The supervisor listens on network and local endpoints, processes the
//! client startup handshake (secure-transport negotiation, cancel
//! requests, session startup), admits or rejects sessions against
//! fleet-wide state, spawns one worker per admitted connection, and
//! manages the lifecycle of the worker pool and of the fixed auxiliary
//! subsystems (startup/recovery, page writer, archiver, statistics
//! collector, system logger). Query execution, authentication back-ends,
//! and the secure-transport library plug in through trait seams.

pub mod auxiliary;
pub mod config;
pub mod engine;
pub mod entropy;
pub mod pidfile;
pub mod protocol;
pub mod server;
pub mod supervisor;
pub mod worker;
