use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auxiliary::stats::{StatsFeed, stats_channel};
use crate::auxiliary::syslogger::LogFeed;
use crate::auxiliary::{self, AuxSet, AuxSignal};
use crate::config::Config;
use crate::engine::{EchoEngine, SessionEngine};
use crate::pidfile::{LockError, LockFile};
use crate::server::listener::BindError;
use crate::server::registry::{Registry, WorkerSignal};
use crate::server::spawn::Dispatcher;
use crate::server::stream::TlsUpgrader;
use crate::server::{Accepted, ListenerSet};
use crate::supervisor::events::{self, AuxKind, ControlEvent, EventSender, WakeReason};
use crate::supervisor::reaper;
use crate::supervisor::signals;
use crate::supervisor::state::{ShutdownKind, SupervisorState};
use crate::worker::{Authenticator, TrustAuthenticator};

/// The main loop blocks in the listener wait for at most this long, so
/// periodic maintenance always runs.
const LOOP_WAIT: Duration = Duration::from_secs(60);

/// Socket and lock files are re-touched at least this often.
const TOUCH_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Back-off between startup retries while crash recovery keeps failing.
const RECOVERY_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum BootError {
    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("could not install signal listeners: {0}")]
    Signals(std::io::Error),

    #[error("could not record startup options: {0}")]
    Opts(std::io::Error),
}

/// Assembles a supervisor with its external collaborators plugged in.
pub struct Builder {
    config: Config,
    engine: Arc<dyn SessionEngine>,
    authenticator: Arc<dyn Authenticator>,
    tls: Option<Arc<dyn TlsUpgrader>>,
    log_feed: Option<LogFeed>,
    argv: Option<Vec<String>>,
}

impl Builder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            engine: Arc::new(EchoEngine),
            authenticator: Arc::new(TrustAuthenticator),
            tls: None,
            log_feed: None,
            argv: None,
        }
    }

    pub fn engine(mut self, engine: Arc<dyn SessionEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn tls_upgrader(mut self, tls: Arc<dyn TlsUpgrader>) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Read end of the log pipe for the system logger (log redirection).
    pub fn log_feed(mut self, feed: LogFeed) -> Self {
        self.log_feed = Some(feed);
        self
    }

    /// Argument vector to record in the options file.
    pub fn argv(mut self, argv: Vec<String>) -> Self {
        self.argv = Some(argv);
        self
    }

    /// Bind endpoints, claim the data directory, and launch the first
    /// children. The returned supervisor is in the Booting phase; `run`
    /// drives it from there.
    pub async fn boot(self) -> Result<Supervisor, BootError> {
        let config = Arc::new(self.config);
        let listeners = ListenerSet::bind(&config).await?;
        let bound_port = listeners
            .local_addrs()
            .first()
            .map(|addr| addr.port())
            .unwrap_or(config.port);

        let mut lock = LockFile::create(&config.data_dir, std::process::id(), bound_port)?;
        if let Some(path) = &config.external_pid_file {
            lock.add_external_pid_file(path, std::process::id())?;
        }
        if let Some(argv) = &self.argv {
            crate::pidfile::write_opts_file(&config.data_dir, argv).map_err(BootError::Opts)?;
        }

        let (events, events_rx) = events::channel();
        signals::spawn_listeners(&events).map_err(BootError::Signals)?;

        let (stats, stats_feed) = stats_channel();
        let registry = Arc::new(Registry::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&config),
            registry,
            events.clone(),
            self.engine,
            self.authenticator,
            self.tls,
            stats,
        );

        let mut supervisor = Supervisor {
            config,
            state: SupervisorState::new(),
            aux: AuxSet::default(),
            listeners,
            dispatcher,
            events,
            events_rx,
            stats_feed,
            log_feed: self.log_feed,
            lock,
            shutdown_token: CancellationToken::new(),
            last_touch: Instant::now(),
            next_recovery_attempt: None,
            exit: None,
        };

        // The logger comes up first so boot-time lines are captured.
        if supervisor.config.redirect_log {
            supervisor.start_syslogger();
        }
        supervisor.start_startup_child();
        supervisor.publish_fleet();
        Ok(supervisor)
    }
}

/// The connection-dispatch supervisor: one task owning all supervisor
/// state, driven by accepted connections, control events, and a bounded
/// maintenance tick.
pub struct Supervisor {
    pub(crate) config: Arc<Config>,
    pub(crate) state: SupervisorState,
    pub(crate) aux: AuxSet,
    pub(crate) listeners: ListenerSet,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) events: EventSender,
    events_rx: mpsc::UnboundedReceiver<ControlEvent>,
    pub(crate) stats_feed: StatsFeed,
    pub(crate) log_feed: Option<LogFeed>,
    lock: LockFile,
    shutdown_token: CancellationToken,
    last_touch: Instant,
    pub(crate) next_recovery_attempt: Option<Instant>,
    pub(crate) exit: Option<i32>,
}

enum LoopInput {
    Accepted(std::io::Result<Option<Accepted>>),
    Event(Option<ControlEvent>),
}

impl Supervisor {
    /// Handle for posting control events (used by children and tests; the
    /// signal listeners hold their own clone).
    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    /// Bound network addresses, for discovering an ephemeral port.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.local_addrs()
    }

    /// Drive the supervisor until it terminates; returns the exit code.
    pub async fn run(mut self) -> i32 {
        info!(
            port = self.local_addrs().first().map(|a| a.port()),
            "supervisor started"
        );

        loop {
            let input = tokio::select! {
                accepted = self.listeners.accept(LOOP_WAIT, &self.shutdown_token) => {
                    LoopInput::Accepted(accepted)
                }
                event = self.events_rx.recv() => LoopInput::Event(event),
            };

            match input {
                LoopInput::Accepted(Ok(Some(accepted))) => {
                    self.dispatcher.observe_event();
                    self.dispatcher.dispatch(accepted);
                }
                LoopInput::Accepted(Ok(None)) => {}
                LoopInput::Accepted(Err(e)) => {
                    error!(error = %e, "accept failed");
                }
                LoopInput::Event(Some(event)) => {
                    self.handle_event(event);
                    while self.exit.is_none() {
                        match self.events_rx.try_recv() {
                            Ok(event) => self.handle_event(event),
                            Err(_) => break,
                        }
                    }
                }
                LoopInput::Event(None) => {
                    // Every sender is gone; nothing can drive us further.
                    self.exit = Some(0);
                }
            }

            if self.exit.is_none() {
                self.tick();
            }
            if let Some(code) = self.exit {
                self.shutdown_token.cancel();
                return code;
            }
        }
    }

    /// Apply one control event; all substantive work happens here, on the
    /// main loop, never in signal context.
    pub(crate) fn handle_event(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Reload => self.reload(),
            ControlEvent::SmartStop => self.request_shutdown(ShutdownKind::Smart),
            ControlEvent::FastStop => self.request_shutdown(ShutdownKind::Fast),
            ControlEvent::ImmediateStop => self.immediate_stop(),
            ControlEvent::ChildExit { child, status } => {
                reaper::child_exited(self, child, status);
                reaper::advance(self);
            }
            ControlEvent::Wake(reason) => self.wake(reason),
        }
        self.publish_fleet();
    }

    fn reload(&mut self) {
        // Ignored once the shutdown is past the smart stage.
        if self.state.phase.shutdown_severity() > ShutdownKind::Smart.severity() {
            return;
        }
        info!("reload request: re-reading configuration");
        match self.config.reload() {
            Ok(next) => {
                self.config = Arc::new(next);
                self.dispatcher.swap_config(Arc::clone(&self.config));
            }
            Err(e) => {
                warn!(error = %e, "configuration reload failed; keeping previous settings");
            }
        }
        // Authentication state is re-read on every reload as well as on
        // the dedicated wake-up.
        self.dispatcher.refresh_auth();
        self.dispatcher.registry.signal_all(WorkerSignal::Reload);
        for kind in [
            AuxKind::Startup,
            AuxKind::PageWriter,
            AuxKind::Archiver,
            AuxKind::SysLogger,
        ] {
            self.aux.signal(kind, AuxSignal::Reload);
        }
        // The statistics collector has nothing to re-read.
    }

    fn request_shutdown(&mut self, kind: ShutdownKind) {
        if !self.state.request_shutdown(kind) {
            return;
        }
        match kind {
            ShutdownKind::Smart => {
                info!("received smart shutdown request");
            }
            ShutdownKind::Fast => {
                info!("received fast shutdown request");
                if !self.dispatcher.registry.is_empty() && !self.state.fatal_error {
                    info!("aborting any active transactions");
                    self.dispatcher.registry.signal_all(WorkerSignal::Terminate);
                }
            }
            ShutdownKind::Immediate => unreachable!("handled by immediate_stop"),
        }
        reaper::advance(self);
    }

    fn immediate_stop(&mut self) {
        info!("received immediate shutdown request");
        self.state.request_shutdown(ShutdownKind::Immediate);
        for kind in [
            AuxKind::Startup,
            AuxKind::PageWriter,
            AuxKind::Archiver,
            AuxKind::Stats,
        ] {
            self.aux.signal(kind, AuxSignal::Quit);
        }
        self.dispatcher.registry.signal_all(WorkerSignal::Quit);
        // No waiting: children notice on their own, or die with us.
        self.exit = Some(0);
    }

    fn wake(&mut self, reason: WakeReason) {
        match reason {
            WakeReason::AuthFiles => {
                info!("authentication files changed; refreshing");
                self.dispatcher.refresh_auth();
            }
            WakeReason::Archiver => {
                if !self.state.phase.is_shutting_down() {
                    self.aux.signal(AuxKind::Archiver, AuxSignal::Waken);
                }
            }
        }
    }

    /// Periodic maintenance: restart missing auxiliaries, retry recovery,
    /// refresh socket-file timestamps.
    pub(crate) fn tick(&mut self) {
        if self.config.redirect_log
            && !self.aux.is_present(AuxKind::SysLogger)
            && self.log_feed.is_some()
        {
            self.start_syslogger();
        }

        let startup_present = self.aux.is_present(AuxKind::Startup);

        if !self.aux.is_present(AuxKind::PageWriter) && !startup_present && !self.state.fatal_error
        {
            self.start_page_writer();
            if self.state.phase.is_shutting_down() {
                self.aux
                    .signal(AuxKind::PageWriter, AuxSignal::CheckpointAndExit);
            }
        }

        let quiet = !startup_present
            && !self.state.fatal_error
            && !self.state.phase.is_shutting_down();
        if self.config.archive_mode && quiet && !self.aux.is_present(AuxKind::Archiver) {
            self.start_archiver();
        }
        if quiet && !self.aux.is_present(AuxKind::Stats) {
            self.start_stats();
        }

        reaper::advance(self);

        if self.last_touch.elapsed() >= TOUCH_INTERVAL {
            self.listeners.touch();
            self.lock.touch();
            self.last_touch = Instant::now();
        }

        self.publish_fleet();
    }

    /// Push the admission-relevant flags to the connection dispatcher.
    pub(crate) fn publish_fleet(&self) {
        self.dispatcher
            .publish_fleet(self.state.fleet(self.aux.is_present(AuxKind::Startup)));
    }

    pub(crate) fn start_startup_child(&mut self) {
        debug_assert!(!self.aux.is_present(AuxKind::Startup));
        let data_dir = self.config.data_dir.clone();
        let buffers = self.config.buffers;
        let handle = auxiliary::launch(AuxKind::Startup, &self.events, move |signals| {
            auxiliary::startup::run(data_dir, buffers, signals)
        });
        self.aux.set(handle);
    }

    pub(crate) fn start_page_writer(&mut self) {
        let data_dir = self.config.data_dir.clone();
        let handle = auxiliary::launch(AuxKind::PageWriter, &self.events, move |signals| {
            auxiliary::pagewriter::run(data_dir, signals)
        });
        self.aux.set(handle);
    }

    pub(crate) fn start_archiver(&mut self) {
        let data_dir = self.config.data_dir.clone();
        let handle = auxiliary::launch(AuxKind::Archiver, &self.events, move |signals| {
            auxiliary::archiver::run(data_dir, signals)
        });
        self.aux.set(handle);
    }

    pub(crate) fn start_stats(&mut self) {
        let data_dir = self.config.data_dir.clone();
        let feed = Arc::clone(&self.stats_feed);
        let handle = auxiliary::launch(AuxKind::Stats, &self.events, move |signals| {
            auxiliary::stats::run(data_dir, feed, signals)
        });
        self.aux.set(handle);
    }

    pub(crate) fn start_syslogger(&mut self) {
        let Some(feed) = self.log_feed.clone() else {
            debug!("log redirection enabled but no log pipe was installed");
            return;
        };
        let data_dir = self.config.data_dir.clone();
        let handle = auxiliary::launch(AuxKind::SysLogger, &self.events, move |signals| {
            auxiliary::syslogger::run(data_dir, feed, signals)
        });
        self.aux.set(handle);
    }
}

impl Supervisor {
    /// Startup retry gate used while crash recovery keeps failing.
    pub(crate) fn recovery_retry_due(&self) -> bool {
        self.next_recovery_attempt
            .map_or(true, |at| at <= Instant::now())
    }

    pub(crate) fn delay_recovery_retry(&mut self) {
        self.next_recovery_attempt = Some(Instant::now() + RECOVERY_RETRY_DELAY);
    }
}
