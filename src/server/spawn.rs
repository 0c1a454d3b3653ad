use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info, warn};

use crate::auxiliary::stats::StatsSender;
use crate::config::Config;
use crate::engine::SessionEngine;
use crate::entropy::EntropySource;
use crate::protocol::{BackendMessage, ErrorInfo, sql_state};
use crate::server::admission::FleetSnapshot;
use crate::server::context::ConnectionContext;
use crate::server::handshake::{Handshake, HandshakeOutcome};
use crate::server::listener::Accepted;
use crate::server::registry::{Registry, WorkerHandle, WorkerId};
use crate::server::stream::{ClientStream, TlsUpgrader};
use crate::supervisor::events::{ChildId, ControlEvent, EventSender, ExitStatus};
use crate::worker::{Authenticator, Worker};

#[derive(Debug, Error)]
pub enum SpawnError {
    /// Registry row preallocation failed; recoverable, nothing spawned.
    #[error("no free worker slot")]
    RegistryFull,
}

/// Runs the unauthenticated side of every accepted connection: handshake,
/// admission, cancel routing, and worker spawn.
///
/// Supervisor state reaches connection handling only through the fleet
/// snapshot published here; everything else the dispatcher owns or shares
/// by handle.
pub struct Dispatcher {
    config: Mutex<Arc<Config>>,
    fleet: Mutex<FleetSnapshot>,
    pub registry: Arc<Registry>,
    entropy: Mutex<EntropySource>,
    events: EventSender,
    engine: Arc<dyn SessionEngine>,
    authenticator: Arc<dyn Authenticator>,
    tls: Option<Arc<dyn TlsUpgrader>>,
    /// Shared session slots, rebuilt after crash recovery.
    session_gate: Mutex<Arc<Semaphore>>,
    stats: StatsSender,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        registry: Arc<Registry>,
        events: EventSender,
        engine: Arc<dyn SessionEngine>,
        authenticator: Arc<dyn Authenticator>,
        tls: Option<Arc<dyn TlsUpgrader>>,
        stats: StatsSender,
    ) -> Arc<Self> {
        let gate = Arc::new(Semaphore::new(config.max_connections));
        Arc::new(Self {
            config: Mutex::new(config),
            fleet: Mutex::new(FleetSnapshot {
                starting: true,
                ..FleetSnapshot::default()
            }),
            registry,
            entropy: Mutex::new(EntropySource::new()),
            events,
            engine,
            authenticator,
            tls,
            session_gate: Mutex::new(gate),
            stats,
        })
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.lock().clone()
    }

    /// Install a reloaded configuration for future connections.
    pub fn swap_config(&self, config: Arc<Config>) {
        *self.config.lock() = config;
    }

    /// Publish the admission-relevant state flags.
    pub fn publish_fleet(&self, fleet: FleetSnapshot) {
        *self.fleet.lock() = fleet;
    }

    /// Feed external-event timing into the entropy source.
    pub fn observe_event(&self) {
        self.entropy.lock().observe_event();
    }

    /// Ask the authentication back-end to re-read its state.
    pub fn refresh_auth(&self) {
        self.authenticator.refresh();
    }

    /// Rebuild shared session structures after crash recovery. The worker
    /// registry must already be drained.
    pub fn rebuild_shared_state(&self) {
        let config = self.config();
        *self.session_gate.lock() = Arc::new(Semaphore::new(config.max_connections));
        let generation = self.registry.bump_generation();
        debug!(generation, "shared session state rebuilt");
    }

    /// Hand one accepted connection to its own handshake task.
    pub fn dispatch(self: &Arc<Self>, accepted: Accepted) {
        let this = Arc::clone(self);
        tokio::spawn(this.handle_connection(accepted));
    }

    async fn handle_connection(self: Arc<Self>, accepted: Accepted) {
        let config = self.config();
        let salt = {
            let mut entropy = self.entropy.lock();
            entropy.observe_event();
            entropy.session_salt()
        };
        let endpoint = accepted.endpoint.clone();

        let handshake = Handshake::new(accepted, config.enable_tls, self.tls.clone());
        match handshake
            .run(&self.registry, &self.fleet, config.admission_cap(), salt)
            .await
        {
            Ok(HandshakeOutcome::Admitted { context, stream }) => {
                if config.log_connections {
                    info!(
                        user = %context.user,
                        database = %context.database,
                        endpoint = %endpoint.address,
                        "connection authorized"
                    );
                }
                match self.spawn_worker(context, stream, &config) {
                    Ok(id) => debug!(worker = id, "worker spawned"),
                    Err((e, stream)) => {
                        warn!(error = %e, "could not spawn worker for connection");
                        let reply = BackendMessage::ErrorResponse(ErrorInfo::fatal(
                            sql_state::TOO_MANY_CONNECTIONS,
                            "sorry, too many clients already",
                        ));
                        let _ = stream.try_write_oneshot(&reply.to_bytes());
                    }
                }
            }
            Ok(HandshakeOutcome::CancelDispatched) => {
                debug!(endpoint = %endpoint.address, "cancel request handled");
            }
            Ok(HandshakeOutcome::Rejected { category }) => {
                info!(category, endpoint = %endpoint.address, "connection rejected");
            }
            Err(e) => {
                debug!(endpoint = %endpoint.address, error = %e, "startup exchange failed");
            }
        }
    }

    /// Spawn a worker for an admitted connection.
    ///
    /// Ordering matters: the cancel secret is drawn first so the
    /// supervisor's entropy sequence advances before the worker's own
    /// state is derived from it; the registry row is preallocated and
    /// fully linked (identity, secret, delivery handle) before the worker
    /// body can run, so an immediately following cancel request cannot
    /// miss it.
    fn spawn_worker(
        &self,
        mut context: ConnectionContext,
        stream: ClientStream,
        config: &Config,
    ) -> Result<WorkerId, (SpawnError, ClientStream)> {
        let (cancel_secret, rng_seed) = {
            let mut entropy = self.entropy.lock();
            (entropy.next_secret(), entropy.worker_seed())
        };

        let Some(id) = self.registry.reserve(config.admission_cap()) else {
            return Err((SpawnError::RegistryFull, stream));
        };

        // Flush our own output streams so worker log lines are not
        // interleaved mid-line across the spawn boundary.
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        self.registry
            .commit(id, cancel_secret, WorkerHandle::new(signal_tx));
        context.cancel_secret = cancel_secret;
        // Configured extra options precede any the client supplied.
        context.options = match (&config.worker_options, context.options.take()) {
            (Some(fixed), Some(client)) => Some(format!("{fixed} {client}")),
            (Some(fixed), None) => Some(fixed.clone()),
            (None, client) => client,
        };

        let worker = Worker {
            id,
            context,
            stream,
            signals: signal_rx,
            engine: Arc::clone(&self.engine),
            authenticator: Arc::clone(&self.authenticator),
            session_gate: self.session_gate.lock().clone(),
            stats: self.stats.clone(),
            authentication_timeout: config.authentication_timeout,
            rng_seed,
        };

        let events = self.events.clone();
        let body = tokio::spawn(worker.run());
        tokio::spawn(async move {
            let status = match body.await {
                Ok(0) => ExitStatus::Clean,
                Ok(code) => ExitStatus::Code(code),
                Err(e) if e.is_panic() => ExitStatus::Panicked,
                Err(_) => ExitStatus::Clean,
            };
            events.send(ControlEvent::ChildExit {
                child: ChildId::Worker(id),
                status,
            });
        });

        Ok(id)
    }
}
