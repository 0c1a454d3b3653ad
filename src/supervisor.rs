//! The supervisor proper: life-phase state machine, event loop, auxiliary
//! lifecycle, and crash containment.
//!
//! ## Architecture
//!
//! ```text
//!  signals ----\                         +--------------+
//!  child exits --> ControlEvent queue -->|  main loop   |--> dispatcher
//!  wake-ups ---/                         | (Supervisor) |--> auxiliaries
//!                                        +--------------+
//! ```
//!
//! Asynchronous inputs never mutate state directly; listener tasks enqueue
//! control events and the single main loop drains them, so every
//! transition of the state machine happens in one place.

pub mod core;
pub mod events;
pub mod reaper;
pub mod signals;
pub mod state;

pub use core::{BootError, Builder, Supervisor};
pub use events::{AuxKind, ChildId, ControlEvent, EventSender, ExitStatus, WakeReason};
pub use state::{LifePhase, ShutdownKind, SupervisorState};
