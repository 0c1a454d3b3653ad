use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use gatehouse::auxiliary::syslogger;
use gatehouse::config::{self, Config};
use gatehouse::supervisor::Builder;

/// Connection-dispatch supervisor for a client/server relational
/// database.
#[derive(Parser, Debug)]
#[command(name = "gatehouse", version)]
struct Args {
    /// Data directory holding persistent state.
    #[arg(short = 'D', long = "data-dir", env = "GATEHOUSE_DATA")]
    data_dir: PathBuf,

    /// Network hosts to listen on (comma or whitespace separated; `*`
    /// means every interface). An empty value disables network listening.
    #[arg(long = "listen", default_value = "127.0.0.1")]
    listen: String,

    /// Port shared by all network endpoints and the local socket name.
    #[arg(short = 'p', long, default_value_t = 5432)]
    port: u16,

    /// Directory for the local-domain socket; omit to disable it.
    #[arg(short = 'k', long = "socket-dir")]
    socket_dir: Option<PathBuf>,

    /// Maximum number of concurrent sessions.
    #[arg(short = 'N', long = "max-connections", default_value_t = 100)]
    max_connections: usize,

    /// Shared buffer count handed to the startup subsystem.
    #[arg(short = 'B', long, default_value_t = 1000)]
    buffers: usize,

    /// Offer secure transport during negotiation.
    #[arg(short = 'l', long = "tls")]
    tls: bool,

    /// Silent mode: no console output (requires --log-redirect).
    #[arg(short = 'S', long)]
    silent: bool,

    /// Extra options string passed through to every worker.
    #[arg(short = 'o', long = "worker-options")]
    worker_options: Option<String>,

    /// Named configuration assignment (name=value); repeatable.
    #[arg(short = 'c', long = "set", value_name = "NAME=VALUE")]
    assignments: Vec<String>,

    /// Preserve crashed-worker peers for core dumps instead of quitting
    /// them.
    #[arg(short = 's', long = "send-stop")]
    send_stop: bool,

    /// Run the write-ahead-log archiver.
    #[arg(long = "archive")]
    archive: bool,

    /// Capture all log output through the system logger.
    #[arg(long = "log-redirect")]
    log_redirect: bool,

    /// Log filter directive (also honored from GATEHOUSE_LOG).
    #[arg(long = "log-filter", env = "GATEHOUSE_LOG", default_value = "info")]
    log_filter: String,

    /// Additional pid file written outside the data directory.
    #[arg(long = "pid-file")]
    pid_file: Option<PathBuf>,
}

fn build_config(args: &Args) -> Result<Config, config::ConfigError> {
    let mut cfg = Config {
        data_dir: args.data_dir.clone(),
        listen_addresses: Config::parse_listen_addresses(&args.listen),
        port: args.port,
        socket_dir: args.socket_dir.clone(),
        max_connections: args.max_connections,
        buffers: args.buffers,
        enable_tls: args.tls,
        silent: args.silent,
        worker_options: args.worker_options.clone(),
        send_stop: args.send_stop,
        archive_mode: args.archive,
        redirect_log: args.log_redirect,
        external_pid_file: args.pid_file.clone(),
        ..Config::default()
    };
    for assignment in &args.assignments {
        cfg.apply_assignment(assignment, true)?;
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let cfg = match build_config(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("gatehouse: {e}");
            return ExitCode::from(1);
        }
    };

    if cfg.silent && !cfg.redirect_log {
        eprintln!("gatehouse: silent mode requires --log-redirect");
        return ExitCode::from(1);
    }

    // A missing or unreadable data directory is its own exit code, so
    // wrappers can tell it apart from ordinary startup failures.
    if let Err(e) = config::check_data_dir(&cfg.data_dir) {
        eprintln!(
            "gatehouse: data directory \"{}\": {e}",
            cfg.data_dir.display()
        );
        return ExitCode::from(2);
    }

    // With log redirection every line flows through the logger pipe; the
    // system-logger auxiliary drains it into the data directory.
    let log_feed = if cfg.redirect_log {
        let (pipe, feed) = syslogger::log_channel();
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_filter))
            .with_writer(pipe)
            .with_ansi(false)
            .init();
        Some(feed)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_filter))
            .init();
        None
    };

    let mut builder = Builder::new(cfg).argv(std::env::args().collect());
    if let Some(feed) = log_feed {
        builder = builder.log_feed(feed);
    }

    let supervisor = match builder.boot().await {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!(error = %e, "startup failed");
            return ExitCode::from(1);
        }
    };

    let code = supervisor.run().await;
    ExitCode::from(code.clamp(0, u8::MAX as i32) as u8)
}
