//! Test utilities for supervisor integration tests.
//!
//! Boots a real supervisor on an ephemeral port over a scratch data
//! directory, and speaks the startup wire protocol over raw sockets.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use gatehouse::config::Config;
use gatehouse::supervisor::{Builder, EventSender};

pub const CANCEL_CODE: u32 = (1234 << 16) | 5678;
pub const NEGOTIATE_CODE: u32 = (1234 << 16) | 5679;
pub const VERSION_3: u32 = 3 << 16;

const IO_DEADLINE: Duration = Duration::from_secs(10);

/// A booted supervisor over a scratch data directory.
///
/// The runtime task is aborted on drop; tests that exercise shutdown can
/// await `handle` for the exit code instead.
pub struct TestServer {
    pub port: u16,
    pub socket_path: Option<PathBuf>,
    pub events: EventSender,
    pub handle: JoinHandle<i32>,
    pub data_dir: tempfile::TempDir,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(3, None, |builder| builder).await
    }

    pub async fn start_with(
        max_connections: usize,
        socket_dir: Option<PathBuf>,
        customize: impl FnOnce(Builder) -> Builder,
    ) -> Self {
        let data_dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: data_dir.path().to_path_buf(),
            listen_addresses: vec!["127.0.0.1".to_string()],
            port: 0,
            socket_dir,
            max_connections,
            authentication_timeout: Duration::from_secs(5),
            ..Config::default()
        };
        let socket_path = config.socket_path();

        let supervisor = customize(Builder::new(config)).boot().await.unwrap();
        let port = supervisor.local_addrs()[0].port();
        let events = supervisor.events();
        let handle = tokio::spawn(supervisor.run());

        let server = Self {
            port,
            socket_path,
            events,
            handle,
            data_dir,
        };
        server.wait_until_admitting().await;
        server
    }

    /// Poll until the startup child has finished and sessions are
    /// admitted.
    pub async fn wait_until_admitting(&self) {
        let deadline = tokio::time::Instant::now() + IO_DEADLINE;
        loop {
            if let Ok(mut session) = open_session(self.port, "probe").await {
                session.terminate().await;
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "server did not start admitting sessions"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub async fn connect(&self) -> TcpStream {
        TcpStream::connect(("127.0.0.1", self.port)).await.unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Build a v3 startup packet from name/value pairs.
pub fn startup_packet(pairs: &[(&str, &str)]) -> Vec<u8> {
    let mut body = VERSION_3.to_be_bytes().to_vec();
    for (name, value) in pairs {
        body.extend_from_slice(name.as_bytes());
        body.push(0);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    body.push(0);
    frame(&body)
}

/// Build a special-request packet (cancel, negotiation).
pub fn request_packet(code: u32, rest: &[u8]) -> Vec<u8> {
    let mut body = code.to_be_bytes().to_vec();
    body.extend_from_slice(rest);
    frame(&body)
}

fn frame(body: &[u8]) -> Vec<u8> {
    let mut wire = ((body.len() + 4) as u32).to_be_bytes().to_vec();
    wire.extend_from_slice(body);
    wire
}

/// Read one backend message (type byte, body).
pub async fn read_message<S>(stream: &mut S) -> std::io::Result<(u8, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    tokio::time::timeout(IO_DEADLINE, async {
        let ty = stream.read_u8().await?;
        let len = stream.read_i32().await?;
        let mut body = vec![0u8; (len - 4) as usize];
        stream.read_exact(&mut body).await?;
        Ok((ty, body))
    })
    .await
    .expect("timed out reading backend message")
}

/// Extract the SQLSTATE field from an ErrorResponse body.
pub fn error_code(body: &[u8]) -> Option<String> {
    let mut offset = 0;
    while offset < body.len() && body[offset] != 0 {
        let field = body[offset];
        let end = body[offset + 1..].iter().position(|&b| b == 0)? + offset + 1;
        if field == b'C' {
            return String::from_utf8(body[offset + 1..end].to_vec()).ok();
        }
        offset = end + 1;
    }
    None
}

/// An authenticated session with its cancel credentials.
#[derive(Debug)]
pub struct Session<S> {
    pub stream: S,
    pub worker_id: u32,
    pub cancel_secret: u32,
}

/// Open a session over an arbitrary stream; `Err` carries the SQLSTATE of
/// the rejection (or "CLOSED" if the server hung up first).
pub async fn open_session_on<S>(mut stream: S, user: &str) -> Result<Session<S>, String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&startup_packet(&[("user", user)]))
        .await
        .map_err(|_| "CLOSED".to_string())?;

    let mut worker_id = 0;
    let mut cancel_secret = 0;
    loop {
        let (ty, body) = match read_message(&mut stream).await {
            Ok(message) => message,
            Err(_) => return Err("CLOSED".to_string()),
        };
        match ty {
            b'E' => return Err(error_code(&body).unwrap_or_default()),
            b'K' => {
                worker_id = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                cancel_secret = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
            }
            b'Z' => {
                return Ok(Session {
                    stream,
                    worker_id,
                    cancel_secret,
                });
            }
            _ => {}
        }
    }
}

pub async fn open_session(port: u16, user: &str) -> Result<Session<TcpStream>, String> {
    let stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .map_err(|_| "CLOSED".to_string())?;
    open_session_on(stream, user).await
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    /// Run one statement; `Ok` carries (rows, completion tag), `Err` the
    /// SQLSTATE.
    pub async fn query(
        &mut self,
        statement: &str,
    ) -> Result<(Vec<Vec<Option<String>>>, String), String> {
        let mut body = statement.as_bytes().to_vec();
        body.push(0);
        let mut message = vec![b'Q'];
        message.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
        message.extend_from_slice(&body);
        self.stream
            .write_all(&message)
            .await
            .map_err(|_| "CLOSED".to_string())?;

        let mut rows = Vec::new();
        let mut tag = String::new();
        let mut error = None;
        loop {
            let (ty, body) = match read_message(&mut self.stream).await {
                Ok(message) => message,
                Err(_) => return Err("CLOSED".to_string()),
            };
            match ty {
                b'D' => rows.push(parse_data_row(&body)),
                b'C' => {
                    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
                    tag = String::from_utf8_lossy(&body[..end]).to_string();
                }
                b'E' => error = Some(error_code(&body).unwrap_or_default()),
                b'Z' => {
                    return match error {
                        Some(code) => Err(code),
                        None => Ok((rows, tag)),
                    };
                }
                _ => {}
            }
        }
    }

    /// Send the terminate message and drop the connection.
    pub async fn terminate(&mut self) {
        let _ = self.stream.write_all(&[b'X', 0, 0, 0, 4]).await;
        let _ = self.stream.flush().await;
    }
}

fn parse_data_row(body: &[u8]) -> Vec<Option<String>> {
    let count = i16::from_be_bytes([body[0], body[1]]) as usize;
    let mut values = Vec::with_capacity(count);
    let mut offset = 2;
    for _ in 0..count {
        let len = i32::from_be_bytes([
            body[offset],
            body[offset + 1],
            body[offset + 2],
            body[offset + 3],
        ]);
        offset += 4;
        if len < 0 {
            values.push(None);
        } else {
            let end = offset + len as usize;
            values.push(Some(String::from_utf8_lossy(&body[offset..end]).to_string()));
            offset = end;
        }
    }
    values
}

/// Send a cancel request for the given worker; the connection closes with
/// no reply either way.
pub async fn send_cancel(port: u16, worker_id: u32, cancel_secret: u32) {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut rest = worker_id.to_be_bytes().to_vec();
    rest.extend_from_slice(&cancel_secret.to_be_bytes());
    stream
        .write_all(&request_packet(CANCEL_CODE, &rest))
        .await
        .unwrap();
    // The server closes without a byte of response.
    let mut scratch = [0u8; 1];
    let read = tokio::time::timeout(IO_DEADLINE, stream.read(&mut scratch))
        .await
        .expect("timed out waiting for cancel close")
        .unwrap_or(0);
    assert_eq!(read, 0, "cancel requests are answered with silence");
}

/// Engine used by crash and cancellation tests: echoes statements, crashes
/// on "boom", sleeps interruptibly on "sleep".
pub struct DrillEngine;

#[async_trait::async_trait]
impl gatehouse::engine::SessionEngine for DrillEngine {
    async fn execute(
        &self,
        statement: &str,
        interrupt: &tokio_util::sync::CancellationToken,
    ) -> Result<gatehouse::engine::EngineOutput, gatehouse::engine::EngineError> {
        if statement.starts_with("boom") {
            return Err(gatehouse::engine::EngineError::Crashed(
                "drill crash".to_string(),
            ));
        }
        if statement.starts_with("sleep") {
            tokio::select! {
                _ = interrupt.cancelled() => {
                    return Err(gatehouse::engine::EngineError::Canceled);
                }
                _ = tokio::time::sleep(Duration::from_secs(30)) => {}
            }
        }
        Ok(gatehouse::engine::EngineOutput {
            columns: vec!["echo".to_string()],
            rows: vec![vec![Some(statement.to_string())]],
            tag: "ECHO 1".to_string(),
        })
    }
}

/// Authenticator that holds every connection in the handshake window for a
/// while; used to pin children in the unauthenticated phase.
pub struct SlowAuthenticator(pub Duration);

#[async_trait::async_trait]
impl gatehouse::worker::Authenticator for SlowAuthenticator {
    async fn authenticate(
        &self,
        _context: &gatehouse::server::ConnectionContext,
        _rng: &mut rand::rngs::StdRng,
    ) -> Result<(), gatehouse::worker::AuthError> {
        tokio::time::sleep(self.0).await;
        Ok(())
    }
}

/// Convenience: engine/authenticator builders for tests.
pub fn drill_engine() -> Arc<DrillEngine> {
    Arc::new(DrillEngine)
}
