//! Lock and options files persisted in the data directory.
//!
//! The lock file records the supervisor's process id and port so a second
//! supervisor refuses to start over the same data directory. The options
//! file records the exact argument vector used to start, for operator
//! tooling that wants to restart the server identically.

use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Lock file name inside the data directory.
pub const LOCK_FILE: &str = "gatehouse.pid";

/// Options-record file name inside the data directory.
pub const OPTS_FILE: &str = "gatehouse.opts";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock file \"{0}\" already exists; is another supervisor running?")]
    AlreadyLocked(PathBuf),

    #[error("could not write \"{path}\": {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// The supervisor's lock file plus any secondary pid files.
///
/// Dropping the guard removes everything it created.
pub struct LockFile {
    paths: Vec<PathBuf>,
}

impl LockFile {
    /// Create the data-directory lock file, recording pid and port.
    ///
    /// An existing lock file is an error; a stale one must be removed by
    /// the operator (or a fresh data directory used).
    pub fn create(data_dir: &Path, pid: u32, port: u16) -> Result<Self, LockError> {
        let path = data_dir.join(LOCK_FILE);
        if path.exists() {
            return Err(LockError::AlreadyLocked(path));
        }
        write_private(&path, format!("{pid}\n{port}\n").as_bytes()).map_err(|source| {
            LockError::Io {
                path: path.clone(),
                source,
            }
        })?;
        Ok(Self { paths: vec![path] })
    }

    /// Also write an external pid file outside the data directory.
    pub fn add_external_pid_file(&mut self, path: &Path, pid: u32) -> Result<(), LockError> {
        write_private(path, format!("{pid}\n").as_bytes()).map_err(|source| LockError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.paths.push(path.to_path_buf());
        Ok(())
    }

    /// Refresh the lock file's timestamp so tmp cleaners leave it alone.
    pub fn touch(&self) {
        for path in &self.paths {
            if let Ok(file) = std::fs::File::options().write(true).open(path) {
                let _ = file.set_modified(std::time::SystemTime::now());
            }
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        for path in &self.paths {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Record the startup argument vector in the options file.
pub fn write_opts_file(data_dir: &Path, argv: &[String]) -> std::io::Result<()> {
    let path = data_dir.join(OPTS_FILE);
    let mut line = String::new();
    for (i, arg) in argv.iter().enumerate() {
        if i == 0 {
            line.push_str(arg);
        } else {
            line.push_str(&format!(" '{arg}'"));
        }
    }
    line.push('\n');
    write_private(&path, line.as_bytes())
}

fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = std::fs::File::options();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)
}
