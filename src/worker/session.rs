use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::{EngineError, SessionEngine};
use crate::protocol::{
    BackendMessage, ErrorInfo, FieldDescription, TransactionStatus, sql_state,
};
use crate::server::registry::{WorkerId, WorkerSignal};
use crate::server::stream::ClientStream;
use crate::worker::{EXIT_ERROR, EXIT_OK, EXIT_QUICKDIE};

/// Largest frontend message body accepted in session phase.
const MAX_MESSAGE_BODY: usize = 1024 * 1024;

/// Incremental frame reader for session-phase messages.
///
/// Buffers partial input so a read raced against a control message can be
/// dropped and resumed without losing framing.
#[derive(Default)]
struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    /// Produce the next complete `(type, body)` frame. `Ok(None)` is a
    /// clean hangup on a frame boundary.
    async fn next(
        &mut self,
        stream: &mut ClientStream,
    ) -> std::io::Result<Option<(u8, Vec<u8>)>> {
        loop {
            if self.buf.len() >= 5 {
                let len = i32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
                if len < 4 || (len - 4) as usize > MAX_MESSAGE_BODY {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "invalid frontend message length",
                    ));
                }
                let total = 1 + len as usize;
                if self.buf.len() >= total {
                    let frame: Vec<u8> = self.buf.drain(..total).collect();
                    return Ok(Some((frame[0], frame[5..].to_vec())));
                }
            }

            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(std::io::ErrorKind::UnexpectedEof.into())
                };
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Drive one authenticated session until the client or the supervisor ends
/// it. Returns the worker exit code.
pub async fn run(
    worker: WorkerId,
    stream: &mut ClientStream,
    signals: &mut mpsc::UnboundedReceiver<WorkerSignal>,
    engine: &Arc<dyn SessionEngine>,
) -> i32 {
    let mut reader = FrameReader::default();

    loop {
        tokio::select! {
            // Control messages take priority over new client work.
            biased;
            signal = signals.recv() => match signal {
                Some(WorkerSignal::Terminate) => {
                    send_fatal(
                        stream,
                        sql_state::ADMIN_SHUTDOWN,
                        "terminating connection due to administrator command",
                    )
                    .await;
                    return EXIT_OK;
                }
                Some(WorkerSignal::Quit) | None => return EXIT_QUICKDIE,
                Some(WorkerSignal::Stop) => return frozen(signals).await,
                // Nothing in flight; an interrupt between statements is
                // dropped on the floor.
                Some(WorkerSignal::Interrupt) => {}
                Some(WorkerSignal::Reload) => {
                    debug!(worker, "configuration reload acknowledged");
                }
            },
            message = reader.next(stream) => match message {
                Ok(Some((b'Q', body))) => {
                    let Some(statement) = statement_text(&body) else {
                        send_fatal(
                            stream,
                            sql_state::PROTOCOL_VIOLATION,
                            "malformed query message",
                        )
                        .await;
                        return EXIT_OK;
                    };
                    if let Some(code) =
                        execute(worker, stream, signals, engine, &statement).await
                    {
                        return code;
                    }
                }
                Ok(Some((b'X', _))) => return EXIT_OK,
                Ok(Some((ty, _))) => {
                    send_fatal(
                        stream,
                        sql_state::PROTOCOL_VIOLATION,
                        format!("unknown frontend message type {}", ty as char),
                    )
                    .await;
                    return EXIT_OK;
                }
                Ok(None) => return EXIT_OK,
                Err(e) => {
                    debug!(worker, error = %e, "session connection lost");
                    return EXIT_OK;
                }
            }
        }
    }
}

/// Run one statement, answering control messages while it is in flight.
///
/// Returns `Some(code)` when the session must end.
async fn execute(
    worker: WorkerId,
    stream: &mut ClientStream,
    signals: &mut mpsc::UnboundedReceiver<WorkerSignal>,
    engine: &Arc<dyn SessionEngine>,
    statement: &str,
) -> Option<i32> {
    if statement.trim().is_empty() {
        let mut reply = BackendMessage::EmptyQueryResponse.to_bytes();
        reply.extend_from_slice(&ready());
        if stream.write_all(&reply).await.is_err() {
            return Some(EXIT_OK);
        }
        return None;
    }

    // The interrupt token is the statement's safe-point flag; the engine
    // polls it, nothing cancels it synchronously.
    let interrupt = CancellationToken::new();
    let exec = engine.execute(statement, &interrupt);
    tokio::pin!(exec);

    let result = loop {
        tokio::select! {
            biased;
            signal = signals.recv() => match signal {
                Some(WorkerSignal::Interrupt) => interrupt.cancel(),
                Some(WorkerSignal::Terminate) => {
                    send_fatal(
                        stream,
                        sql_state::ADMIN_SHUTDOWN,
                        "terminating connection due to administrator command",
                    )
                    .await;
                    return Some(EXIT_OK);
                }
                Some(WorkerSignal::Stop) => return Some(frozen(signals).await),
                Some(WorkerSignal::Quit) | None => return Some(EXIT_QUICKDIE),
                Some(WorkerSignal::Reload) => {}
            },
            result = &mut exec => break result,
        }
    };

    let mut reply = match result {
        Ok(output) => {
            let mut reply = BackendMessage::RowDescription {
                fields: output
                    .columns
                    .iter()
                    .map(|name| FieldDescription { name: name.clone() })
                    .collect(),
            }
            .to_bytes();
            for row in output.rows {
                reply.extend_from_slice(&BackendMessage::DataRow { values: row }.to_bytes());
            }
            reply.extend_from_slice(
                &BackendMessage::CommandComplete { tag: output.tag }.to_bytes(),
            );
            reply
        }
        Err(EngineError::Canceled) => BackendMessage::ErrorResponse(ErrorInfo::new(
            sql_state::QUERY_CANCELED,
            "canceling statement due to user request",
        ))
        .to_bytes(),
        Err(EngineError::Failed(message)) => {
            BackendMessage::ErrorResponse(ErrorInfo::new(sql_state::INTERNAL_ERROR, message))
                .to_bytes()
        }
        Err(EngineError::Crashed(message)) => {
            debug!(worker, message = %message, "engine failure");
            return Some(EXIT_ERROR);
        }
    };

    reply.extend_from_slice(&ready());
    if stream.write_all(&reply).await.is_err() {
        return Some(EXIT_OK);
    }
    None
}

/// Frozen state: only Quit (or a vanished supervisor) releases the worker.
async fn frozen(signals: &mut mpsc::UnboundedReceiver<WorkerSignal>) -> i32 {
    loop {
        match signals.recv().await {
            Some(WorkerSignal::Quit) | None => return EXIT_QUICKDIE,
            _ => {}
        }
    }
}

fn statement_text(body: &[u8]) -> Option<String> {
    let end = body.iter().position(|&b| b == 0)?;
    String::from_utf8(body[..end].to_vec()).ok()
}

fn ready() -> Vec<u8> {
    BackendMessage::ReadyForQuery {
        status: TransactionStatus::Idle,
    }
    .to_bytes()
}

async fn send_fatal(
    stream: &mut ClientStream,
    code: &'static str,
    message: impl Into<String>,
) {
    let reply = BackendMessage::ErrorResponse(ErrorInfo::fatal(code, message.into()));
    let _ = stream.write_all(&reply.to_bytes()).await;
    let _ = stream.flush().await;
}
