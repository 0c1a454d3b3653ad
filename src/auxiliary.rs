//! Auxiliary subsystems owned by the supervisor.
//!
//! Five fixed helpers run beside the worker pool: startup/recovery, the
//! background page writer, the WAL archiver, the statistics collector, and
//! the system logger. Each runs as an independent child whose exit is
//! reported on the supervisor event queue, and each is driven by a small
//! control-message channel standing in for process signals.

pub mod archiver;
pub mod pagewriter;
pub mod startup;
pub mod stats;
pub mod syslogger;

use std::path::{Path, PathBuf};

use tokio::sync::mpsc;

use crate::supervisor::events::{AuxKind, ChildId, ControlEvent, EventSender, ExitStatus};

/// Control messages delivered to an auxiliary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxSignal {
    /// Re-read configuration.
    Reload,
    /// Exit immediately.
    Quit,
    /// Write the shutdown checkpoint, then exit cleanly (page writer).
    CheckpointAndExit,
    /// Wake up for fresh work.
    Waken,
}

/// Delivery handle for one auxiliary.
#[derive(Debug, Clone)]
pub struct AuxHandle {
    kind: AuxKind,
    tx: mpsc::UnboundedSender<AuxSignal>,
}

impl AuxHandle {
    pub fn kind(&self) -> AuxKind {
        self.kind
    }

    /// Best-effort delivery; an exited auxiliary drops the message.
    pub fn signal(&self, signal: AuxSignal) {
        let _ = self.tx.send(signal);
    }
}

/// Start an auxiliary child and watch it.
///
/// The watcher translates the body's return code (or panic) into a
/// child-exit event on the supervisor queue; nothing else observes the
/// child directly.
pub fn launch<F, Fut>(kind: AuxKind, events: &EventSender, make: F) -> AuxHandle
where
    F: FnOnce(mpsc::UnboundedReceiver<AuxSignal>) -> Fut,
    Fut: std::future::Future<Output = i32> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let body = tokio::spawn(make(rx));
    let events = events.clone();
    tokio::spawn(async move {
        let status = match body.await {
            Ok(0) => ExitStatus::Clean,
            Ok(code) => ExitStatus::Code(code),
            Err(e) if e.is_panic() => ExitStatus::Panicked,
            Err(_) => ExitStatus::Clean,
        };
        events.send(ControlEvent::ChildExit {
            child: ChildId::Auxiliary(kind),
            status,
        });
    });
    AuxHandle { kind, tx }
}

/// Presence map of the auxiliary children.
#[derive(Default)]
pub struct AuxSet {
    startup: Option<AuxHandle>,
    page_writer: Option<AuxHandle>,
    archiver: Option<AuxHandle>,
    stats: Option<AuxHandle>,
    syslogger: Option<AuxHandle>,
}

impl AuxSet {
    fn slot(&self, kind: AuxKind) -> &Option<AuxHandle> {
        match kind {
            AuxKind::Startup => &self.startup,
            AuxKind::PageWriter => &self.page_writer,
            AuxKind::Archiver => &self.archiver,
            AuxKind::Stats => &self.stats,
            AuxKind::SysLogger => &self.syslogger,
        }
    }

    fn slot_mut(&mut self, kind: AuxKind) -> &mut Option<AuxHandle> {
        match kind {
            AuxKind::Startup => &mut self.startup,
            AuxKind::PageWriter => &mut self.page_writer,
            AuxKind::Archiver => &mut self.archiver,
            AuxKind::Stats => &mut self.stats,
            AuxKind::SysLogger => &mut self.syslogger,
        }
    }

    pub fn set(&mut self, handle: AuxHandle) {
        let kind = handle.kind();
        *self.slot_mut(kind) = Some(handle);
    }

    pub fn clear(&mut self, kind: AuxKind) {
        *self.slot_mut(kind) = None;
    }

    pub fn is_present(&self, kind: AuxKind) -> bool {
        self.slot(kind).is_some()
    }

    /// Signal the auxiliary if it is present.
    pub fn signal(&self, kind: AuxKind, signal: AuxSignal) {
        if let Some(handle) = self.slot(kind) {
            handle.signal(signal);
        }
    }
}

/// The control record under `global/` tracking clean-shutdown state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFile {
    /// "running" while the system is up, "clean" after a shutdown
    /// checkpoint.
    pub state: String,
    /// Monotonic checkpoint counter.
    pub checkpoint: u64,
    /// Buffer count the system was last started with.
    pub buffers: usize,
}

impl ControlFile {
    pub fn path(data_dir: &Path) -> PathBuf {
        data_dir.join("global").join("control")
    }

    /// Load the control record; `Ok(None)` when it does not exist yet.
    pub fn load(data_dir: &Path) -> std::io::Result<Option<Self>> {
        let text = match std::fs::read_to_string(Self::path(data_dir)) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut ctl = ControlFile {
            state: String::new(),
            checkpoint: 0,
            buffers: 0,
        };
        for line in text.lines() {
            let Some((name, value)) = line.split_once('=') else {
                continue;
            };
            match name {
                "state" => ctl.state = value.to_string(),
                "checkpoint" => {
                    ctl.checkpoint = value.parse().map_err(|_| {
                        std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "corrupt control record",
                        )
                    })?;
                }
                "buffers" => ctl.buffers = value.parse().unwrap_or(0),
                _ => {}
            }
        }
        if ctl.state.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "corrupt control record",
            ));
        }
        Ok(Some(ctl))
    }

    pub fn store(&self, data_dir: &Path) -> std::io::Result<()> {
        std::fs::write(
            Self::path(data_dir),
            format!(
                "state={}\ncheckpoint={}\nbuffers={}\n",
                self.state, self.checkpoint, self.buffers
            ),
        )
    }
}
