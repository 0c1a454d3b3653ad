//! Supervisor configuration.
//!
//! Configuration is assembled once at boot from the command line (plus the
//! data-directory environment fallback) and can be partially refreshed on a
//! reload request from the optional `gatehouse.conf` name=value overrides
//! in the data directory. Reload failures leave the previous configuration
//! in effect.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Name of the optional override file read on reload.
pub const OVERRIDE_FILE: &str = "gatehouse.conf";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unrecognized configuration parameter \"{0}\"")]
    UnknownParameter(String),

    #[error("invalid value for parameter \"{name}\": \"{value}\"")]
    InvalidValue { name: String, value: String },

    #[error("parameter \"{0}\" cannot be changed after server start")]
    NotReloadable(String),

    #[error("malformed assignment \"{0}\": expected name=value")]
    MalformedAssignment(String),

    #[error("could not read \"{path}\": {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Immutable-at-boot and runtime-changeable settings of the supervisor.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory holding persistent state and the local socket lock.
    pub data_dir: PathBuf,
    /// Network hosts to listen on; `*` means every interface. Empty
    /// disables network listening.
    pub listen_addresses: Vec<String>,
    /// Single port shared by all network endpoints and the local socket
    /// name.
    pub port: u16,
    /// Directory for the local-domain socket; `None` disables the local
    /// endpoint.
    pub socket_dir: Option<PathBuf>,
    /// Configured maximum of concurrent sessions (the hard cap enforced at
    /// session join; admission allows up to twice this many children to
    /// cover the unauthenticated handshake window).
    pub max_connections: usize,
    /// Shared buffer count handed to the startup subsystem.
    pub buffers: usize,
    /// Whether secure-transport negotiation may answer 'S'.
    pub enable_tls: bool,
    /// Silent mode: no console output, log redirection only.
    pub silent: bool,
    /// Extra options string passed through to every worker.
    pub worker_options: Option<String>,
    /// Preserve crashed-worker peers for core dumps (send stop instead of
    /// quit).
    pub send_stop: bool,
    /// Whether the archiver auxiliary runs.
    pub archive_mode: bool,
    /// Whether the system-logger auxiliary captures log output.
    pub redirect_log: bool,
    /// Deadline for a worker to finish client authentication.
    pub authentication_timeout: Duration,
    /// Log one line per accepted session.
    pub log_connections: bool,
    /// Optional pid file written outside the data directory.
    pub external_pid_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::new(),
            listen_addresses: vec!["127.0.0.1".to_string()],
            port: 5432,
            socket_dir: None,
            max_connections: 100,
            buffers: 1000,
            enable_tls: false,
            silent: false,
            worker_options: None,
            send_stop: false,
            archive_mode: false,
            redirect_log: false,
            authentication_timeout: Duration::from_secs(60),
            log_connections: false,
            external_pid_file: None,
        }
    }
}

impl Config {
    /// Split a listen-addresses option into hosts (comma or whitespace
    /// separated).
    pub fn parse_listen_addresses(raw: &str) -> Vec<String> {
        raw.split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Apply one `name=value` assignment.
    ///
    /// `at_boot` widens the set of assignable parameters to those fixed for
    /// the life of the supervisor.
    pub fn apply_assignment(&mut self, raw: &str, at_boot: bool) -> Result<(), ConfigError> {
        let Some((name, value)) = raw.split_once('=') else {
            return Err(ConfigError::MalformedAssignment(raw.to_string()));
        };
        self.set(name.trim(), value.trim(), at_boot)
    }

    fn set(&mut self, name: &str, value: &str, at_boot: bool) -> Result<(), ConfigError> {
        match name {
            "authentication_timeout" => {
                self.authentication_timeout = Duration::from_secs(parse(name, value)?);
            }
            "log_connections" => self.log_connections = parse_bool(name, value)?,
            "max_connections" if at_boot => self.max_connections = parse(name, value)?,
            "shared_buffers" if at_boot => self.buffers = parse(name, value)?,
            "port" if at_boot => self.port = parse(name, value)?,
            "archive_mode" if at_boot => self.archive_mode = parse_bool(name, value)?,
            "max_connections" | "shared_buffers" | "port" | "archive_mode" => {
                return Err(ConfigError::NotReloadable(name.to_string()));
            }
            _ => return Err(ConfigError::UnknownParameter(name.to_string())),
        }
        Ok(())
    }

    /// Re-read the runtime-changeable overrides from the data directory.
    ///
    /// Returns the refreshed configuration; the caller swaps it in only on
    /// success. A missing override file is not an error.
    pub fn reload(&self) -> Result<Config, ConfigError> {
        let mut next = self.clone();
        let path = self.data_dir.join(OVERRIDE_FILE);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(next),
            Err(e) => return Err(ConfigError::Unreadable { path, source: e }),
        };
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            next.apply_assignment(line, false)?;
        }
        Ok(next)
    }

    /// Path of the local-domain socket for this configuration, if local
    /// sockets are enabled.
    pub fn socket_path(&self) -> Option<PathBuf> {
        self.socket_dir
            .as_ref()
            .map(|dir: &PathBuf| dir.join(format!(".s.GATE.{}", self.port)))
    }

    /// Soft admission cap: twice the configured maximum, leaving room for
    /// children that are still in the unauthenticated handshake phase.
    pub fn admission_cap(&self) -> usize {
        2 * self.max_connections
    }
}

fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Check that the data directory exists and is readable.
pub fn check_data_dir(path: &Path) -> Result<(), std::io::Error> {
    std::fs::read_dir(path).map(|_| ())
}
