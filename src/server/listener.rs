use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::server::stream::ClientStream;

#[derive(Debug, Error)]
pub enum BindError {
    #[error("could not bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("could not resolve listen address \"{0}\"")]
    Resolve(String),

    #[error("no listening endpoints could be created")]
    NoEndpoints,
}

/// Which bound endpoint a connection arrived on.
#[derive(Debug, Clone)]
pub struct EndpointInfo {
    pub index: usize,
    /// Local-domain endpoints never negotiate secure transport.
    pub local: bool,
    pub address: String,
}

/// One accepted raw connection plus its endpoint metadata.
pub struct Accepted {
    pub stream: ClientStream,
    pub endpoint: EndpointInfo,
    pub remote: Option<SocketAddr>,
}

enum Bound {
    Tcp { listener: TcpListener, addr: SocketAddr },
    Unix { listener: UnixListener, path: PathBuf },
}

/// The ordered set of bound endpoints. Established at boot, immutable
/// thereafter; endpoint handles never leave the supervisor.
pub struct ListenerSet {
    endpoints: Vec<Bound>,
    /// Files to re-touch periodically so tmp cleaners leave them alone.
    touchable: Vec<PathBuf>,
}

impl ListenerSet {
    /// Bind every configured endpoint: each network host (or the `*`
    /// wildcard) on the single configured port, plus the local-domain
    /// socket when a socket directory is configured.
    ///
    /// Individual binds may fail (and are logged); startup fails only when
    /// no endpoint at all could be bound.
    pub async fn bind(cfg: &Config) -> Result<Self, BindError> {
        let mut endpoints = Vec::new();
        let mut touchable = Vec::new();
        let mut first_error = None;

        let mut hosts: Vec<String> = Vec::new();
        for host in &cfg.listen_addresses {
            if host == "*" {
                hosts.push("0.0.0.0".to_string());
                hosts.push("::".to_string());
            } else {
                hosts.push(host.clone());
            }
        }

        for host in hosts {
            // Numeric addresses bind directly; names go through the
            // resolver, first answer wins.
            let addr = if let Ok(ip) = host.parse::<std::net::IpAddr>() {
                SocketAddr::new(ip, cfg.port)
            } else {
                let target = format!("{host}:{}", cfg.port);
                let lookup_result = tokio::net::lookup_host(&target).await;
                match lookup_result {
                    Ok(mut addrs) => match addrs.next() {
                        Some(addr) => addr,
                        None => {
                            warn!(host = %host, "listen address did not resolve");
                            first_error.get_or_insert(BindError::Resolve(host));
                            continue;
                        }
                    },
                    Err(_) => {
                        warn!(host = %host, "listen address did not resolve");
                        first_error.get_or_insert(BindError::Resolve(host));
                        continue;
                    }
                }
            };
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    // With port 0 the kernel picks; report the real address.
                    let addr = listener.local_addr().unwrap_or(addr);
                    debug!(address = %addr, "listening");
                    endpoints.push(Bound::Tcp { listener, addr });
                }
                Err(source) => {
                    warn!(address = %addr, error = %source, "could not bind");
                    first_error.get_or_insert(BindError::Bind {
                        address: addr.to_string(),
                        source,
                    });
                }
            }
        }

        if let Some(path) = cfg.socket_path() {
            match Self::bind_unix(&path) {
                Ok(listener) => {
                    debug!(path = %path.display(), "listening on local socket");
                    touchable.push(path.clone());
                    let lock = socket_lock_path(&path);
                    if std::fs::write(&lock, format!("{}\n", std::process::id())).is_ok() {
                        touchable.push(lock);
                    }
                    endpoints.push(Bound::Unix { listener, path });
                }
                Err(source) => {
                    warn!(path = %path.display(), error = %source, "could not bind local socket");
                    first_error.get_or_insert(BindError::Bind {
                        address: path.display().to_string(),
                        source,
                    });
                }
            }
        }

        if endpoints.is_empty() {
            return Err(first_error.unwrap_or(BindError::NoEndpoints));
        }
        Ok(Self {
            endpoints,
            touchable,
        })
    }

    fn bind_unix(path: &std::path::Path) -> std::io::Result<UnixListener> {
        // A leftover socket file from a dead supervisor blocks the bind;
        // the data-directory lock file is the real exclusion mechanism.
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        UnixListener::bind(path)
    }

    /// Wait up to `limit` for any endpoint to produce a connection.
    ///
    /// Returns `Ok(None)` on timeout or when `cancel` fires.
    pub async fn accept(
        &self,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> std::io::Result<Option<Accepted>> {
        let mut pending = Vec::with_capacity(self.endpoints.len());
        for (index, bound) in self.endpoints.iter().enumerate() {
            pending.push(Box::pin(Self::accept_one(index, bound)));
        }

        tokio::select! {
            _ = cancel.cancelled() => Ok(None),
            _ = tokio::time::sleep(limit) => Ok(None),
            (result, _, _) = futures_util::future::select_all(pending) => result.map(Some),
        }
    }

    async fn accept_one(index: usize, bound: &Bound) -> std::io::Result<Accepted> {
        match bound {
            Bound::Tcp { listener, addr } => {
                let (stream, remote) = listener.accept().await?;
                Ok(Accepted {
                    stream: ClientStream::Tcp(stream),
                    endpoint: EndpointInfo {
                        index,
                        local: false,
                        address: addr.to_string(),
                    },
                    remote: Some(remote),
                })
            }
            Bound::Unix { listener, path } => {
                let (stream, _) = listener.accept().await?;
                Ok(Accepted {
                    stream: ClientStream::Unix(stream),
                    endpoint: EndpointInfo {
                        index,
                        local: true,
                        address: path.display().to_string(),
                    },
                    remote: None,
                })
            }
        }
    }

    /// Refresh socket-file timestamps so external tmp cleaners do not
    /// unlink them.
    pub fn touch(&self) {
        for path in &self.touchable {
            if let Ok(file) = std::fs::File::options().write(true).open(path) {
                let _ = file.set_modified(std::time::SystemTime::now());
            }
        }
    }

    /// Bound network addresses, in endpoint order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.endpoints
            .iter()
            .filter_map(|b| match b {
                Bound::Tcp { addr, .. } => Some(*addr),
                Bound::Unix { .. } => None,
            })
            .collect()
    }
}

/// Sibling lock file of the local socket (`<socket>.lock`).
fn socket_lock_path(path: &std::path::Path) -> PathBuf {
    PathBuf::from(format!("{}.lock", path.display()))
}

impl Drop for ListenerSet {
    fn drop(&mut self) {
        for bound in &self.endpoints {
            if let Bound::Unix { path, .. } = bound {
                let _ = std::fs::remove_file(path);
                let _ = std::fs::remove_file(socket_lock_path(path));
            }
        }
    }
}
