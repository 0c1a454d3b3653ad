//! Background page writer.
//!
//! Trickles buffer maintenance on a fixed cadence while the system is up.
//! The buffer pool itself belongs to the storage layer; the supervisor
//! cares about this child for one reason: when a shutdown is in progress
//! and every session has drained, the page writer is told to write the
//! shutdown checkpoint and exit, and its clean exit is the supervisor's
//! own terminal condition.

use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::auxiliary::{AuxSignal, ControlFile};

const ROUND_DELAY: Duration = Duration::from_secs(1);

pub async fn run(
    data_dir: std::path::PathBuf,
    mut signals: mpsc::UnboundedReceiver<AuxSignal>,
) -> i32 {
    let mut rounds: u64 = 0;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(ROUND_DELAY) => {
                rounds += 1;
            }
            signal = signals.recv() => match signal {
                Some(AuxSignal::CheckpointAndExit) => {
                    debug!(rounds, "writing shutdown checkpoint");
                    return match write_shutdown_checkpoint(&data_dir) {
                        Ok(checkpoint) => {
                            info!(checkpoint, "shutdown checkpoint complete");
                            0
                        }
                        Err(e) => {
                            error!(error = %e, "could not write shutdown checkpoint");
                            1
                        }
                    };
                }
                Some(AuxSignal::Quit) | None => return 2,
                Some(AuxSignal::Reload) | Some(AuxSignal::Waken) => {}
            }
        }
    }
}

fn write_shutdown_checkpoint(data_dir: &Path) -> std::io::Result<u64> {
    let mut ctl = ControlFile::load(data_dir)?.unwrap_or(ControlFile {
        state: "running".to_string(),
        checkpoint: 0,
        buffers: 0,
    });
    ctl.checkpoint += 1;
    ctl.state = "clean".to_string();
    ctl.store(data_dir)?;
    Ok(ctl.checkpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_checkpoint_and_exit_marks_clean() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("global")).unwrap();
        ControlFile {
            state: "running".to_string(),
            checkpoint: 7,
            buffers: 100,
        }
        .store(dir.path())
        .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(AuxSignal::CheckpointAndExit).unwrap();
        assert_eq!(run(dir.path().to_path_buf(), rx).await, 0);

        let ctl = ControlFile::load(dir.path()).unwrap().unwrap();
        assert_eq!(ctl.state, "clean");
        assert_eq!(ctl.checkpoint, 8);
    }

    #[tokio::test]
    async fn test_quit_exits_without_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("global")).unwrap();
        ControlFile {
            state: "running".to_string(),
            checkpoint: 7,
            buffers: 100,
        }
        .store(dir.path())
        .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(AuxSignal::Quit).unwrap();
        assert_eq!(run(dir.path().to_path_buf(), rx).await, 2);

        let ctl = ControlFile::load(dir.path()).unwrap().unwrap();
        assert_eq!(ctl.state, "running");
        assert_eq!(ctl.checkpoint, 7);
    }
}
