use tokio::sync::mpsc;

use crate::server::registry::WorkerId;

/// The fixed auxiliary subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxKind {
    /// Startup and crash recovery.
    Startup,
    /// Background page writer; flushes a shutdown checkpoint on exit.
    PageWriter,
    /// Write-ahead-log archiver.
    Archiver,
    /// Statistics collector.
    Stats,
    /// System logger.
    SysLogger,
}

impl AuxKind {
    /// Noun phrase used in child-exit log lines.
    pub fn describe(self) -> &'static str {
        match self {
            AuxKind::Startup => "startup process",
            AuxKind::PageWriter => "page writer process",
            AuxKind::Archiver => "archiver process",
            AuxKind::Stats => "statistics collector process",
            AuxKind::SysLogger => "system logger process",
        }
    }
}

/// Identity of an exited child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildId {
    Worker(WorkerId),
    Auxiliary(AuxKind),
}

/// How a child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Clean,
    Code(i32),
    /// The task body panicked; the analog of death by signal.
    Panicked,
}

impl ExitStatus {
    pub fn is_clean(self) -> bool {
        matches!(self, ExitStatus::Clean)
    }

    pub fn describe(self) -> String {
        match self {
            ExitStatus::Clean => "exited with exit code 0".to_string(),
            ExitStatus::Code(code) => format!("exited with exit code {code}"),
            ExitStatus::Panicked => "was terminated by a panic".to_string(),
        }
    }
}

/// Wake-up requests carried by the user-defined-1 signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// Authentication files changed; refresh them.
    AuthFiles,
    /// Kick the archiver for a fresh segment.
    Archiver,
}

/// Everything that can wake the supervisor main loop.
///
/// Signal listeners and child-completion watchers translate their inputs
/// into these events and do no substantive work themselves; the main loop
/// drains the queue and applies the transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Re-read configuration and propagate it (hang-up signal).
    Reload,
    /// Finish current sessions, then stop (terminate signal).
    SmartStop,
    /// Abort sessions, then stop (interrupt signal).
    FastStop,
    /// Stop at once without waiting (quit signal).
    ImmediateStop,
    /// A child was observed to exit.
    ChildExit { child: ChildId, status: ExitStatus },
    /// Internal wake-up from a child.
    Wake(WakeReason),
}

/// Cloneable handle for posting control events.
#[derive(Debug, Clone)]
pub struct EventSender(mpsc::UnboundedSender<ControlEvent>);

impl EventSender {
    /// Post an event; dropped silently once the supervisor is gone.
    pub fn send(&self, event: ControlEvent) {
        let _ = self.0.send(event);
    }
}

/// Create the supervisor event queue.
pub fn channel() -> (EventSender, mpsc::UnboundedReceiver<ControlEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender(tx), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_descriptions() {
        assert!(ExitStatus::Clean.is_clean());
        assert!(!ExitStatus::Code(1).is_clean());
        assert!(!ExitStatus::Panicked.is_clean());
        assert_eq!(ExitStatus::Code(2).describe(), "exited with exit code 2");
    }

    #[tokio::test]
    async fn test_channel_round_trip() {
        let (tx, mut rx) = channel();
        tx.send(ControlEvent::SmartStop);
        assert_eq!(rx.recv().await, Some(ControlEvent::SmartStop));
    }
}
