//! Write-ahead-log archiver.
//!
//! Watches `wal/archive_status` for `.ready` markers, copies the named
//! segments into `archive/`, and flips the markers to `.done`. Sweeps on a
//! fixed cadence and immediately on a wake-up. Death of this child is
//! never a crash; the supervisor simply starts a new one.

use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::auxiliary::AuxSignal;

const SWEEP_DELAY: Duration = Duration::from_secs(60);

pub async fn run(
    data_dir: std::path::PathBuf,
    mut signals: mpsc::UnboundedReceiver<AuxSignal>,
) -> i32 {
    loop {
        match archive_ready_segments(&data_dir) {
            Ok(0) => {}
            Ok(archived) => debug!(archived, "archived write-ahead segments"),
            Err(e) => warn!(error = %e, "archive sweep failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(SWEEP_DELAY) => {}
            signal = signals.recv() => match signal {
                Some(AuxSignal::Quit) | Some(AuxSignal::CheckpointAndExit) | None => return 0,
                Some(AuxSignal::Waken) | Some(AuxSignal::Reload) => {}
            }
        }
    }
}

fn archive_ready_segments(data_dir: &Path) -> std::io::Result<usize> {
    let status_dir = data_dir.join("wal").join("archive_status");
    let mut archived = 0;

    let mut ready: Vec<_> = std::fs::read_dir(&status_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "ready"))
        .collect();
    ready.sort();

    for marker in ready {
        let Some(segment) = marker.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let source = data_dir.join("wal").join(segment);
        let target = data_dir.join("archive").join(segment);
        std::fs::copy(&source, &target)?;
        std::fs::rename(&marker, marker.with_extension("done"))?;
        archived += 1;
    }
    Ok(archived)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(dir: &Path) {
        for sub in ["wal/archive_status", "archive"] {
            std::fs::create_dir_all(dir.join(sub)).unwrap();
        }
    }

    #[test]
    fn test_ready_segments_are_archived_in_order() {
        let dir = tempfile::tempdir().unwrap();
        layout(dir.path());
        for name in ["seg2", "seg1"] {
            std::fs::write(dir.path().join("wal").join(name), name).unwrap();
            std::fs::write(
                dir.path().join(format!("wal/archive_status/{name}.ready")),
                "",
            )
            .unwrap();
        }

        assert_eq!(archive_ready_segments(dir.path()).unwrap(), 2);
        assert!(dir.path().join("archive/seg1").exists());
        assert!(dir.path().join("archive/seg2").exists());
        assert!(dir.path().join("wal/archive_status/seg1.done").exists());
        assert!(!dir.path().join("wal/archive_status/seg1.ready").exists());

        // A second sweep finds nothing left to do.
        assert_eq!(archive_ready_segments(dir.path()).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_waken_triggers_immediate_sweep() {
        let dir = tempfile::tempdir().unwrap();
        layout(dir.path());

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(dir.path().to_path_buf(), rx));

        // Let the first sweep pass, then drop a segment and wake.
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(dir.path().join("wal/seg9"), "x").unwrap();
        std::fs::write(dir.path().join("wal/archive_status/seg9.ready"), "").unwrap();
        tx.send(AuxSignal::Waken).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(dir.path().join("archive/seg9").exists());

        tx.send(AuxSignal::Quit).unwrap();
        assert_eq!(handle.await.unwrap(), 0);
    }
}
