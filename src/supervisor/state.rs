use crate::server::admission::FleetSnapshot;

/// The supervisor's high-level state.
///
/// Shutdown phases are strictly ordered by severity; transitions between
/// them are monotonic. Crash recovery is entered from Running and left
/// only by a successful startup child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifePhase {
    Booting,
    Running,
    SmartShutdown,
    FastShutdown,
    ImmediateShutdown,
    CrashRecovery,
}

impl LifePhase {
    /// Severity of the pending shutdown; zero outside shutdown phases.
    pub fn shutdown_severity(self) -> u8 {
        match self {
            LifePhase::SmartShutdown => 1,
            LifePhase::FastShutdown => 2,
            LifePhase::ImmediateShutdown => 3,
            _ => 0,
        }
    }

    pub fn is_shutting_down(self) -> bool {
        self.shutdown_severity() > 0
    }
}

/// A requested shutdown level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    /// Existing sessions run to completion.
    Smart,
    /// Sessions are told to abort and exit.
    Fast,
    /// Everything is told to quit; no waiting.
    Immediate,
}

impl ShutdownKind {
    pub fn severity(self) -> u8 {
        match self {
            ShutdownKind::Smart => 1,
            ShutdownKind::Fast => 2,
            ShutdownKind::Immediate => 3,
        }
    }

    pub fn phase(self) -> LifePhase {
        match self {
            ShutdownKind::Smart => LifePhase::SmartShutdown,
            ShutdownKind::Fast => LifePhase::FastShutdown,
            ShutdownKind::Immediate => LifePhase::ImmediateShutdown,
        }
    }
}

/// The signal-driven state machine, kept free of I/O so transitions can be
/// driven directly in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorState {
    pub phase: LifePhase,
    /// Latched on any crash while up; cleared only by a successful
    /// startup child exit.
    pub fatal_error: bool,
}

impl SupervisorState {
    pub fn new() -> Self {
        Self {
            phase: LifePhase::Booting,
            fatal_error: false,
        }
    }

    /// Apply a shutdown request. Only a request strictly stronger than the
    /// pending level takes effect; the return value says whether it did.
    pub fn request_shutdown(&mut self, kind: ShutdownKind) -> bool {
        if kind.severity() <= self.phase.shutdown_severity() {
            return false;
        }
        self.phase = kind.phase();
        true
    }

    /// A worker or the page writer died uncleanly.
    pub fn note_crash(&mut self) {
        self.fatal_error = true;
        if self.phase == LifePhase::Running {
            self.phase = LifePhase::CrashRecovery;
        }
    }

    /// The startup child finished cleanly: boot or recovery is complete.
    pub fn startup_succeeded(&mut self) {
        self.fatal_error = false;
        if matches!(self.phase, LifePhase::Booting | LifePhase::CrashRecovery) {
            self.phase = LifePhase::Running;
        }
    }

    /// The flags admission decisions are made from.
    pub fn fleet(&self, startup_present: bool) -> FleetSnapshot {
        FleetSnapshot {
            starting: startup_present,
            shutting_down: self.phase.is_shutting_down(),
            recovering: self.fatal_error,
        }
    }
}

impl Default for SupervisorState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> SupervisorState {
        let mut state = SupervisorState::new();
        state.startup_succeeded();
        state
    }

    #[test]
    fn test_boot_reaches_running() {
        let mut state = SupervisorState::new();
        assert_eq!(state.phase, LifePhase::Booting);
        state.startup_succeeded();
        assert_eq!(state.phase, LifePhase::Running);
        assert!(!state.fatal_error);
    }

    #[test]
    fn test_shutdown_severity_is_monotonic() {
        let mut state = running();
        assert!(state.request_shutdown(ShutdownKind::Smart));
        assert_eq!(state.phase, LifePhase::SmartShutdown);

        // A weaker or equal request is ignored.
        assert!(!state.request_shutdown(ShutdownKind::Smart));
        assert!(state.request_shutdown(ShutdownKind::Fast));
        assert!(!state.request_shutdown(ShutdownKind::Smart));
        assert!(!state.request_shutdown(ShutdownKind::Fast));
        assert_eq!(state.phase, LifePhase::FastShutdown);

        assert!(state.request_shutdown(ShutdownKind::Immediate));
        assert_eq!(state.phase, LifePhase::ImmediateShutdown);
        assert!(!state.request_shutdown(ShutdownKind::Immediate));
    }

    #[test]
    fn test_smart_then_fast_equals_fast_alone() {
        let mut stepped = running();
        stepped.request_shutdown(ShutdownKind::Smart);
        stepped.request_shutdown(ShutdownKind::Fast);

        let mut direct = running();
        direct.request_shutdown(ShutdownKind::Fast);

        assert_eq!(stepped, direct);
    }

    #[test]
    fn test_severity_wins_regardless_of_order() {
        let mut a = running();
        a.request_shutdown(ShutdownKind::Smart);
        a.request_shutdown(ShutdownKind::Fast);

        let mut b = running();
        b.request_shutdown(ShutdownKind::Fast);
        b.request_shutdown(ShutdownKind::Smart);

        assert_eq!(a, b);
        assert_eq!(a.phase, LifePhase::FastShutdown);
    }

    #[test]
    fn test_crash_and_recovery_cycle() {
        let mut state = running();
        state.note_crash();
        assert_eq!(state.phase, LifePhase::CrashRecovery);
        assert!(state.fatal_error);

        state.startup_succeeded();
        assert_eq!(state.phase, LifePhase::Running);
        assert!(!state.fatal_error);
    }

    #[test]
    fn test_crash_during_shutdown_keeps_the_phase() {
        let mut state = running();
        state.request_shutdown(ShutdownKind::Fast);
        state.note_crash();
        assert_eq!(state.phase, LifePhase::FastShutdown);
        assert!(state.fatal_error);

        // Recovery completes without reviving the fleet phase.
        state.startup_succeeded();
        assert_eq!(state.phase, LifePhase::FastShutdown);
        assert!(!state.fatal_error);
    }

    #[test]
    fn test_shutdown_during_boot() {
        let mut state = SupervisorState::new();
        assert!(state.request_shutdown(ShutdownKind::Smart));
        assert_eq!(state.phase, LifePhase::SmartShutdown);
        // The startup child finishing does not undo the shutdown.
        state.startup_succeeded();
        assert_eq!(state.phase, LifePhase::SmartShutdown);
    }

    #[test]
    fn test_fleet_flags() {
        let mut state = running();
        assert_eq!(state.fleet(false), FleetSnapshot::default());

        let booting = SupervisorState::new();
        assert!(booting.fleet(true).starting);

        state.note_crash();
        assert!(state.fleet(false).recovering);

        state.request_shutdown(ShutdownKind::Smart);
        let fleet = state.fleet(false);
        assert!(fleet.shutting_down && fleet.recovering);
    }
}
