use bytes::{BufMut, BytesMut};

use crate::protocol::codec::put_cstring;

/// SQLSTATE codes used in error responses.
pub mod sql_state {
    /// Server cannot accept connections right now (starting up, shutting
    /// down, recovering).
    pub const CANNOT_CONNECT_NOW: &str = "57P03";
    /// Connection slots exhausted.
    pub const TOO_MANY_CONNECTIONS: &str = "53300";
    /// Frontend protocol revision not supported.
    pub const FEATURE_NOT_SUPPORTED: &str = "0A000";
    /// Missing or unusable user name.
    pub const INVALID_AUTHORIZATION_SPECIFICATION: &str = "28000";
    /// Malformed startup packet.
    pub const PROTOCOL_VIOLATION: &str = "08P01";
    /// Statement canceled on user request.
    pub const QUERY_CANCELED: &str = "57014";
    /// Session terminated by the administrator.
    pub const ADMIN_SHUTDOWN: &str = "57P01";
    /// Internal error.
    pub const INTERNAL_ERROR: &str = "XX000";
}

/// Error/Notice field codes.
#[derive(Debug, Clone, Copy)]
pub enum ErrorFieldCode {
    Severity,
    SeverityNonLocalized,
    SqlState,
    Message,
}

impl ErrorFieldCode {
    fn as_u8(self) -> u8 {
        match self {
            ErrorFieldCode::Severity => b'S',
            ErrorFieldCode::SeverityNonLocalized => b'V',
            ErrorFieldCode::SqlState => b'C',
            ErrorFieldCode::Message => b'M',
        }
    }
}

/// Structured error information for an ErrorResponse.
#[derive(Debug, Clone)]
pub struct ErrorInfo {
    /// Severity level (ERROR, FATAL, PANIC).
    pub severity: &'static str,
    /// SQLSTATE code.
    pub code: &'static str,
    /// Primary human-readable message.
    pub message: String,
}

impl ErrorInfo {
    /// Creates a new error with severity ERROR.
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: "ERROR",
            code,
            message: message.into(),
        }
    }

    /// Creates a new error with severity FATAL (connection will close).
    pub fn fatal(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: "FATAL",
            code,
            message: message.into(),
        }
    }
}

/// Transaction status indicator for ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    Failed,
}

impl TransactionStatus {
    fn as_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        }
    }
}

/// Column metadata for RowDescription.
#[derive(Debug, Clone)]
pub struct FieldDescription {
    pub name: String,
}

impl FieldDescription {
    fn encode(&self, dst: &mut BytesMut) {
        put_cstring(dst, &self.name);
        dst.put_i32(0); // table oid
        dst.put_i16(0); // column id
        dst.put_i32(25); // text type oid
        dst.put_i16(-1); // variable length
        dst.put_i32(-1); // no type modifier
        dst.put_i16(0); // text format
    }
}

/// Messages sent by the server to the client.
#[derive(Debug)]
pub enum BackendMessage {
    /// 'R' - Authentication succeeded.
    AuthenticationOk,
    /// 'K' - Worker identity and cancel secret for out-of-band cancels.
    BackendKeyData { worker_id: u32, cancel_secret: u32 },
    /// 'S' - Parameter status notification.
    ParameterStatus { name: String, value: String },
    /// 'Z' - Ready for the next command.
    ReadyForQuery { status: TransactionStatus },
    /// 'E' - Error response.
    ErrorResponse(ErrorInfo),
    /// 'T' - Row description.
    RowDescription { fields: Vec<FieldDescription> },
    /// 'D' - Data row (text format).
    DataRow { values: Vec<Option<String>> },
    /// 'C' - Command complete.
    CommandComplete { tag: String },
    /// 'I' - Empty query response.
    EmptyQueryResponse,
}

impl BackendMessage {
    fn ty(&self) -> u8 {
        match self {
            BackendMessage::AuthenticationOk => b'R',
            BackendMessage::BackendKeyData { .. } => b'K',
            BackendMessage::ParameterStatus { .. } => b'S',
            BackendMessage::ReadyForQuery { .. } => b'Z',
            BackendMessage::ErrorResponse(_) => b'E',
            BackendMessage::RowDescription { .. } => b'T',
            BackendMessage::DataRow { .. } => b'D',
            BackendMessage::CommandComplete { .. } => b'C',
            BackendMessage::EmptyQueryResponse => b'I',
        }
    }

    /// Encodes this message (type byte, length word, body).
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.ty());

        let len_pos = dst.len();
        dst.put_i32(0); // placeholder

        self.encode_body(dst);

        let total_len = (dst.len() - len_pos) as i32;
        dst[len_pos..][..4].copy_from_slice(&total_len.to_be_bytes());
    }

    fn encode_body(&self, dst: &mut BytesMut) {
        match self {
            BackendMessage::AuthenticationOk => {
                dst.put_i32(0);
            }
            BackendMessage::BackendKeyData {
                worker_id,
                cancel_secret,
            } => {
                dst.put_u32(*worker_id);
                dst.put_u32(*cancel_secret);
            }
            BackendMessage::ParameterStatus { name, value } => {
                put_cstring(dst, name);
                put_cstring(dst, value);
            }
            BackendMessage::ReadyForQuery { status } => {
                dst.put_u8(status.as_byte());
            }
            BackendMessage::ErrorResponse(info) => {
                for (code, value) in [
                    (ErrorFieldCode::Severity, info.severity),
                    (ErrorFieldCode::SeverityNonLocalized, info.severity),
                    (ErrorFieldCode::SqlState, info.code),
                    (ErrorFieldCode::Message, info.message.as_str()),
                ] {
                    dst.put_u8(code.as_u8());
                    put_cstring(dst, value);
                }
                dst.put_u8(0); // terminator
            }
            BackendMessage::RowDescription { fields } => {
                dst.put_i16(fields.len() as i16);
                for field in fields {
                    field.encode(dst);
                }
            }
            BackendMessage::DataRow { values } => {
                dst.put_i16(values.len() as i16);
                for value in values {
                    match value {
                        None => dst.put_i32(-1),
                        Some(v) => {
                            dst.put_i32(v.len() as i32);
                            dst.put_slice(v.as_bytes());
                        }
                    }
                }
            }
            BackendMessage::CommandComplete { tag } => {
                put_cstring(dst, tag);
            }
            BackendMessage::EmptyQueryResponse => {}
        }
    }

    /// Encodes this message into a fresh byte vector.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.to_vec()
    }
}
