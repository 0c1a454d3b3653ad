//! Statistics collector.
//!
//! Workers report session starts and ends over a channel; the collector
//! aggregates totals and persists them to `stats/global.stat` on a fixed
//! cadence and on exit. The feed outlives any one collector incarnation so
//! a restarted collector resumes draining where the dead one stopped.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

use crate::auxiliary::AuxSignal;
use crate::server::registry::WorkerId;

const FLUSH_DELAY: Duration = Duration::from_secs(30);

/// One statistics report from a worker.
#[derive(Debug, Clone)]
pub enum StatEvent {
    SessionStart {
        worker: WorkerId,
        database: String,
        user: String,
    },
    SessionEnd {
        worker: WorkerId,
    },
}

/// Cloneable reporting handle handed to every worker.
#[derive(Debug, Clone)]
pub struct StatsSender(mpsc::UnboundedSender<StatEvent>);

impl StatsSender {
    /// Fire-and-forget; statistics are advisory.
    pub fn send(&self, event: StatEvent) {
        let _ = self.0.send(event);
    }
}

/// The collector's end of the feed, shared so restarts can re-take it.
pub type StatsFeed = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<StatEvent>>>;

pub fn stats_channel() -> (StatsSender, StatsFeed) {
    let (tx, rx) = mpsc::unbounded_channel();
    (StatsSender(tx), Arc::new(tokio::sync::Mutex::new(rx)))
}

#[derive(Debug, Default)]
struct Totals {
    started: u64,
    ended: u64,
}

impl Totals {
    fn apply(&mut self, event: &StatEvent) {
        match event {
            StatEvent::SessionStart { .. } => self.started += 1,
            StatEvent::SessionEnd { .. } => self.ended += 1,
        }
    }

    fn active(&self) -> u64 {
        self.started.saturating_sub(self.ended)
    }
}

pub async fn run(
    data_dir: std::path::PathBuf,
    feed: StatsFeed,
    mut signals: mpsc::UnboundedReceiver<AuxSignal>,
) -> i32 {
    let mut feed = feed.lock().await;
    let mut totals = Totals::default();

    loop {
        tokio::select! {
            event = feed.recv() => {
                if let Some(event) = event {
                    totals.apply(&event);
                }
            }
            _ = tokio::time::sleep(FLUSH_DELAY) => {
                flush(&data_dir, &totals);
            }
            signal = signals.recv() => match signal {
                Some(AuxSignal::Quit) | Some(AuxSignal::CheckpointAndExit) | None => {
                    // Drain what is already queued, then persist and go.
                    while let Ok(event) = feed.try_recv() {
                        totals.apply(&event);
                    }
                    flush(&data_dir, &totals);
                    return 0;
                }
                Some(AuxSignal::Reload) | Some(AuxSignal::Waken) => {}
            }
        }
    }
}

fn flush(data_dir: &Path, totals: &Totals) {
    let path = data_dir.join("stats").join("global.stat");
    let contents = format!(
        "sessions_started={}\nsessions_ended={}\nactive={}\n",
        totals.started,
        totals.ended,
        totals.active()
    );
    if let Err(e) = std::fs::write(&path, contents) {
        warn!(error = %e, "could not persist statistics");
    }
}
