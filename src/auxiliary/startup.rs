//! Startup and crash recovery.
//!
//! Runs once per boot and once per crash recovery cycle. Establishes the
//! data-directory layout, replays the write-ahead log when the control
//! record says the last life ended uncleanly, and leaves the system marked
//! as running. A zero exit tells the supervisor that sessions may be
//! admitted again.

use std::path::Path;

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::auxiliary::{AuxSignal, ControlFile};

const LAYOUT: &[&str] = &[
    "global",
    "wal",
    "wal/archive_status",
    "archive",
    "stats",
    "log",
];

pub async fn run(
    data_dir: std::path::PathBuf,
    buffers: usize,
    mut signals: mpsc::UnboundedReceiver<AuxSignal>,
) -> i32 {
    for sub in LAYOUT {
        if let Err(e) = std::fs::create_dir_all(data_dir.join(sub)) {
            error!(dir = %sub, error = %e, "could not establish data directory layout");
            return 1;
        }
    }

    let mut ctl = match ControlFile::load(&data_dir) {
        Ok(Some(ctl)) => ctl,
        Ok(None) => {
            info!("creating control record for a fresh data directory");
            ControlFile {
                state: "clean".to_string(),
                checkpoint: 0,
                buffers,
            }
        }
        Err(e) => {
            error!(error = %e, "control record unreadable");
            return 1;
        }
    };

    if ctl.state != "clean" {
        info!("database system was interrupted; replaying write-ahead log");
        let segments = match count_segments(&data_dir) {
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, "could not scan write-ahead log");
                return 1;
            }
        };
        if quit_requested(&mut signals) {
            return 2;
        }
        ctl.checkpoint += 1;
        info!(segments, checkpoint = ctl.checkpoint, "redo complete");
    }

    ctl.state = "running".to_string();
    ctl.buffers = buffers;
    if let Err(e) = ctl.store(&data_dir) {
        error!(error = %e, "could not write control record");
        return 1;
    }
    info!("database system is ready");
    0
}

fn count_segments(data_dir: &Path) -> std::io::Result<usize> {
    let mut segments = 0;
    for entry in std::fs::read_dir(data_dir.join("wal"))? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            segments += 1;
        }
    }
    Ok(segments)
}

fn quit_requested(signals: &mut mpsc::UnboundedReceiver<AuxSignal>) -> bool {
    while let Ok(signal) = signals.try_recv() {
        if signal == AuxSignal::Quit {
            return true;
        }
    }
    false
}
