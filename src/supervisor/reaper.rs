//! Child-exit classification and crash containment.
//!
//! Exit notifications are drained from the event queue by the main loop
//! and land here one at a time. Workers that exit cleanly are simply
//! unregistered; any unclean worker or page-writer exit quiesces the whole
//! fleet and enters crash recovery. After every exit, [`advance`] checks
//! whether a drained fleet allows the next lifecycle step: relaunching the
//! startup child under a fatal error, or walking the shutdown sequence to
//! its end.

use tracing::{debug, error, info, warn};

use crate::auxiliary::AuxSignal;
use crate::server::registry::{WorkerId, WorkerSignal};
use crate::supervisor::core::Supervisor;
use crate::supervisor::events::{AuxKind, ChildId, ExitStatus};
use crate::supervisor::state::LifePhase;

pub(crate) fn child_exited(sup: &mut Supervisor, child: ChildId, status: ExitStatus) {
    match child {
        ChildId::Auxiliary(AuxKind::Startup) => startup_exited(sup, status),
        ChildId::Auxiliary(AuxKind::PageWriter) => page_writer_exited(sup, status),
        ChildId::Auxiliary(kind @ (AuxKind::Archiver | AuxKind::Stats)) => {
            sup.aux.clear(kind);
            if !status.is_clean() {
                warn!("{} {}", kind.describe(), status.describe());
            }
            // The next maintenance tick starts a replacement.
        }
        ChildId::Auxiliary(AuxKind::SysLogger) => {
            sup.aux.clear(AuxKind::SysLogger);
            // Launch the replacement first, so the predecessor's death is
            // itself captured in the log.
            if sup.config.redirect_log {
                sup.start_syslogger();
            }
            if !status.is_clean() {
                warn!("{} {}", AuxKind::SysLogger.describe(), status.describe());
            }
        }
        ChildId::Worker(id) => worker_exited(sup, id, status),
    }
}

fn startup_exited(sup: &mut Supervisor, status: ExitStatus) {
    sup.aux.clear(AuxKind::Startup);

    if !status.is_clean() {
        warn!("{} {}", AuxKind::Startup.describe(), status.describe());
        if sup.state.phase == LifePhase::Booting {
            error!("aborting startup due to startup process failure");
            sup.exit = Some(1);
        } else {
            // Recovery keeps failing; retry after a short delay rather
            // than spinning on the failure event.
            warn!("crash recovery failed; will retry");
            sup.delay_recovery_retry();
        }
        return;
    }

    // Boot or recovery is complete: sessions may be admitted again.
    sup.state.startup_succeeded();
    sup.next_recovery_attempt = None;
    debug_assert!(!sup.aux.is_present(AuxKind::PageWriter));
    sup.start_page_writer();

    if sup.state.phase.is_shutting_down() {
        // A shutdown queued up behind the startup child; set it going.
        sup.aux
            .signal(AuxKind::PageWriter, AuxSignal::CheckpointAndExit);
    } else {
        if sup.config.archive_mode && !sup.aux.is_present(AuxKind::Archiver) {
            sup.start_archiver();
        }
        if !sup.aux.is_present(AuxKind::Stats) {
            sup.start_stats();
        }
    }
}

fn page_writer_exited(sup: &mut Supervisor, status: ExitStatus) {
    sup.aux.clear(AuxKind::PageWriter);

    if status.is_clean()
        && sup.state.phase.is_shutting_down()
        && !sup.state.fatal_error
        && sup.dispatcher.registry.is_empty()
    {
        // Normal supervisor exit: the page writer wrote the shutdown
        // checkpoint after the fleet drained.
        info!("database system is shut down");
        sup.exit = Some(0);
        return;
    }

    // Any other page-writer exit is a crash.
    handle_crash(sup, None, AuxKind::PageWriter.describe(), status);
}

fn worker_exited(sup: &mut Supervisor, id: WorkerId, status: ExitStatus) {
    if status.is_clean() {
        if let Some(age) = sup.dispatcher.registry.remove(id) {
            debug!(worker = id, session = ?age, "worker exited");
        }
        return;
    }
    handle_crash(sup, Some(id), "worker process", status);
}

/// Quiesce the fleet after an unclean child exit.
///
/// The freshly dead child is unregistered; every other worker and the
/// page writer, archiver, and stats collector are told to quit (or stop,
/// when core-dump preservation is configured). The system logger is kept.
/// Under an already-latched fatal error the unclean exits are the expected
/// answers to our own quit messages and are not re-escalated.
fn handle_crash(
    sup: &mut Supervisor,
    dead_worker: Option<WorkerId>,
    name: &str,
    status: ExitStatus,
) {
    if let Some(id) = dead_worker {
        sup.dispatcher.registry.remove(id);
    }

    if !sup.state.fatal_error {
        match dead_worker {
            Some(id) => warn!(worker = id, "{name} {}", status.describe()),
            None => warn!("{name} {}", status.describe()),
        }
        error!("terminating any other active server processes");

        let signal = if sup.config.send_stop {
            WorkerSignal::Stop
        } else {
            WorkerSignal::Quit
        };
        sup.dispatcher.registry.signal_all(signal);
        sup.aux.signal(AuxKind::PageWriter, AuxSignal::Quit);
        sup.aux.signal(AuxKind::Archiver, AuxSignal::Quit);
        sup.aux.signal(AuxKind::Stats, AuxSignal::Quit);
        // The system logger stays; the log must survive the crash.
    }

    sup.state.note_crash();
}

/// Take the next lifecycle step once the fleet has drained far enough.
pub(crate) fn advance(sup: &mut Supervisor) {
    if sup.exit.is_some() {
        return;
    }

    if sup.state.fatal_error {
        // Wait for every worker, the startup child, and the page writer
        // to be gone, then rebuild shared state and start recovery.
        if sup.dispatcher.registry.is_empty()
            && !sup.aux.is_present(AuxKind::Startup)
            && !sup.aux.is_present(AuxKind::PageWriter)
            && sup.recovery_retry_due()
        {
            info!("all server processes terminated; reinitializing");
            sup.dispatcher.rebuild_shared_state();
            sup.start_startup_child();
        }
        return;
    }

    if sup.state.phase.is_shutting_down() {
        if !sup.dispatcher.registry.is_empty() || sup.aux.is_present(AuxKind::Startup) {
            return;
        }
        // Sessions are gone: have the page writer flush and exit, and
        // dismiss the remaining helpers. Repeats are harmless.
        if !sup.aux.is_present(AuxKind::PageWriter) {
            sup.start_page_writer();
        }
        sup.aux
            .signal(AuxKind::PageWriter, AuxSignal::CheckpointAndExit);
        sup.aux.signal(AuxKind::Archiver, AuxSignal::Quit);
        sup.aux.signal(AuxKind::Stats, AuxSignal::Quit);
    }
}
