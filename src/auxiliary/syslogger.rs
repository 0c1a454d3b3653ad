//! System logger.
//!
//! When log redirection is enabled, every log line produced by the
//! supervisor and its children flows through a pipe into this child, which
//! appends it to `log/gatehouse.log` in the data directory. The write end
//! is installed as the tracing writer at process start; the read end is
//! shared so a restarted logger keeps draining the same pipe, and lines
//! written while no logger is alive are not lost. A reload reopens the
//! file so external rotation works.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::auxiliary::AuxSignal;

const LOG_FILE: &str = "gatehouse.log";

/// Write end of the log pipe, cloneable into the tracing subscriber.
#[derive(Debug, Clone)]
pub struct LogPipe {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl Write for LogPipe {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let _ = self.tx.send(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogPipe {
    type Writer = LogPipe;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Read end of the log pipe, shared across logger incarnations.
pub type LogFeed = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>;

pub fn log_channel() -> (LogPipe, LogFeed) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LogPipe { tx }, Arc::new(tokio::sync::Mutex::new(rx)))
}

pub async fn run(
    data_dir: std::path::PathBuf,
    feed: LogFeed,
    mut signals: mpsc::UnboundedReceiver<AuxSignal>,
) -> i32 {
    let mut feed = feed.lock().await;
    let mut file = match open_log(&data_dir) {
        Ok(file) => file,
        Err(_) => return 1,
    };

    loop {
        tokio::select! {
            chunk = feed.recv() => match chunk {
                Some(bytes) => {
                    if file.write_all(&bytes).is_err() {
                        return 1;
                    }
                }
                None => return 0,
            },
            signal = signals.recv() => match signal {
                Some(AuxSignal::Reload) => {
                    // Reopen so an externally rotated file is released.
                    match open_log(&data_dir) {
                        Ok(fresh) => file = fresh,
                        Err(_) => return 1,
                    }
                }
                Some(AuxSignal::Quit) | None => return 0,
                Some(AuxSignal::CheckpointAndExit) | Some(AuxSignal::Waken) => {}
            }
        }
    }
}

fn open_log(data_dir: &Path) -> std::io::Result<std::fs::File> {
    let dir = data_dir.join("log");
    std::fs::create_dir_all(&dir)?;
    std::fs::File::options()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lines_reach_the_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let (pipe, feed) = log_channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let logger = tokio::spawn(run(dir.path().to_path_buf(), feed, rx));

        let mut writer = pipe.clone();
        writer.write_all(b"first line\n").unwrap();
        writer.write_all(b"second line\n").unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        tx.send(AuxSignal::Quit).unwrap();
        assert_eq!(logger.await.unwrap(), 0);

        let text =
            std::fs::read_to_string(dir.path().join("log").join(LOG_FILE)).unwrap();
        assert!(text.contains("first line"));
        assert!(text.contains("second line"));
    }

    #[tokio::test]
    async fn test_restart_resumes_the_same_feed() {
        let dir = tempfile::tempdir().unwrap();
        let (pipe, feed) = log_channel();

        let (tx, rx) = mpsc::unbounded_channel();
        let first = tokio::spawn(run(dir.path().to_path_buf(), feed.clone(), rx));
        tx.send(AuxSignal::Quit).unwrap();
        assert_eq!(first.await.unwrap(), 0);

        // Written while no logger is alive; must not be lost.
        let mut writer = pipe.clone();
        writer.write_all(b"buffered while down\n").unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let second = tokio::spawn(run(dir.path().to_path_buf(), feed, rx));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        tx.send(AuxSignal::Quit).unwrap();
        assert_eq!(second.await.unwrap(), 0);

        let text =
            std::fs::read_to_string(dir.path().join("log").join(LOG_FILE)).unwrap();
        assert!(text.contains("buffered while down"));
    }
}
