use tokio::io::{AsyncRead, AsyncReadExt};

use crate::protocol::ProtocolError;
use crate::protocol::codec::{get_cstring, get_fixed_string, truncate_name};

/// Special discriminator for an out-of-band cancel request.
pub const CANCEL_REQUEST_CODE: u32 = (1234 << 16) | 5678;

/// Special discriminator for secure-transport negotiation.
pub const NEGOTIATE_TLS_CODE: u32 = (1234 << 16) | 5679;

/// Oldest frontend protocol revision this server still speaks.
pub const PROTOCOL_EARLIEST: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

/// Newest frontend protocol revision this server speaks.
pub const PROTOCOL_LATEST: ProtocolVersion = ProtocolVersion { major: 3, minor: 0 };

/// Upper bound on the startup packet body (the declared length minus the
/// four-byte length word). One byte more is a protocol violation.
pub const MAX_STARTUP_BODY_LENGTH: usize = 10000;

/// Field widths of the legacy fixed-layout startup record, in body order
/// after the discriminator.
const LEGACY_DATABASE_WIDTH: usize = 64;
const LEGACY_USER_WIDTH: usize = 32;
const LEGACY_OPTIONS_WIDTH: usize = 64;

/// A `major.minor` frontend protocol revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub fn from_wire(code: u32) -> Self {
        Self {
            major: (code >> 16) as u16,
            minor: (code & 0xffff) as u16,
        }
    }

    pub fn as_wire(self) -> u32 {
        ((self.major as u32) << 16) | self.minor as u32
    }

    /// Whether this revision falls inside the supported window.
    ///
    /// Revisions older than the earliest major or newer than the latest
    /// major are out; so is a newer minor within the latest major.
    pub fn is_supported(self) -> bool {
        if self.major < PROTOCOL_EARLIEST.major || self.major > PROTOCOL_LATEST.major {
            return false;
        }
        !(self.major == PROTOCOL_LATEST.major && self.minor > PROTOCOL_LATEST.minor)
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Connection parameters extracted from a session startup packet.
#[derive(Debug, Clone, Default)]
pub struct StartupParameters {
    pub user: String,
    pub database: String,
    /// Extra command-line style options for the worker.
    pub options: Option<String>,
    /// Unrecognized name/value pairs, kept in arrival order as generic
    /// session options.
    pub extra: Vec<(String, String)>,
}

/// The first message on a new connection.
#[derive(Debug)]
pub enum StartupMessage {
    /// Client asks whether secure transport is available.
    NegotiateTls,
    /// Client wants to cancel in-flight work on an existing worker.
    Cancel { worker_id: u32, cancel_secret: u32 },
    /// Client opens a session.
    Start {
        version: ProtocolVersion,
        parameters: StartupParameters,
    },
}

impl StartupMessage {
    /// Read one length-prefixed startup message from the stream.
    ///
    /// `after_negotiation` marks a read that follows a successful
    /// secure-transport upgrade; a repeated negotiation request there is a
    /// protocol violation, and a bare EOF is reported as such quietly
    /// (clients are allowed to hang up after an unwelcome answer).
    pub async fn read<R>(r: &mut R, after_negotiation: bool) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let len = match r.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ProtocolError::IncompletePacket);
            }
            Err(e) => return Err(e.into()),
        };

        // The length word counts itself; the body must hold at least the
        // discriminator and at most the fixed maximum.
        if len < 8 || len - 4 > MAX_STARTUP_BODY_LENGTH {
            return Err(ProtocolError::InvalidLength);
        }

        let mut body = vec![0u8; len - 4];
        r.read_exact(&mut body)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => ProtocolError::IncompletePacket,
                _ => ProtocolError::Io(e),
            })?;

        Self::parse(&body, after_negotiation)
    }

    /// Parse a startup packet body (everything after the length word).
    pub fn parse(body: &[u8], after_negotiation: bool) -> Result<Self, ProtocolError> {
        if body.len() < 4 {
            return Err(ProtocolError::InvalidLength);
        }
        let code = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);

        match code {
            CANCEL_REQUEST_CODE if body.len() == 12 => Ok(StartupMessage::Cancel {
                worker_id: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
                cancel_secret: u32::from_be_bytes([body[8], body[9], body[10], body[11]]),
            }),
            NEGOTIATE_TLS_CODE if body.len() == 4 => {
                if after_negotiation {
                    Err(ProtocolError::DuplicateNegotiation)
                } else {
                    Ok(StartupMessage::NegotiateTls)
                }
            }
            CANCEL_REQUEST_CODE | NEGOTIATE_TLS_CODE => Err(ProtocolError::InvalidLength),
            _ => {
                let version = ProtocolVersion::from_wire(code);
                if !version.is_supported() {
                    return Err(ProtocolError::UnsupportedVersion {
                        major: version.major,
                        minor: version.minor,
                    });
                }

                let mut parameters = if version.major >= 3 {
                    parse_pair_parameters(&body[4..])?
                } else {
                    parse_legacy_parameters(&body[4..])?
                };

                if parameters.user.is_empty() {
                    return Err(ProtocolError::NoUserName);
                }
                // The database defaults to the user name.
                if parameters.database.is_empty() {
                    parameters.database = parameters.user.clone();
                }
                truncate_name(&mut parameters.user);
                truncate_name(&mut parameters.database);

                Ok(StartupMessage::Start {
                    version,
                    parameters,
                })
            }
        }
    }
}

/// Parse the NUL-terminated name/value pair layout of protocol 3.
///
/// The empty-name terminator must land exactly on the last byte of the
/// declared body; anything else is a malformed packet.
fn parse_pair_parameters(body: &[u8]) -> Result<StartupParameters, ProtocolError> {
    let mut params = StartupParameters::default();
    let mut offset = 0;

    loop {
        let (name, after_name) = get_cstring(body, offset)?;
        if name.is_empty() {
            if after_name != body.len() {
                return Err(ProtocolError::BadTerminator);
            }
            break;
        }
        let (value, after_value) = get_cstring(body, after_name)?;
        offset = after_value;

        match name.as_str() {
            "database" => params.database = value,
            "user" => params.user = value,
            "options" => params.options = Some(value),
            _ => params.extra.push((name, value)),
        }
    }

    Ok(params)
}

/// Parse the fixed-width record layout of legacy protocols.
///
/// Short packets read as zero-padded; each field is truncated to its record
/// width and later to the system name limit.
fn parse_legacy_parameters(body: &[u8]) -> Result<StartupParameters, ProtocolError> {
    let database = get_fixed_string(body, 0, LEGACY_DATABASE_WIDTH)?;
    let user = get_fixed_string(body, LEGACY_DATABASE_WIDTH, LEGACY_USER_WIDTH)?;
    let options = get_fixed_string(
        body,
        LEGACY_DATABASE_WIDTH + LEGACY_USER_WIDTH,
        LEGACY_OPTIONS_WIDTH,
    )?;

    Ok(StartupParameters {
        user,
        database,
        options: if options.is_empty() {
            None
        } else {
            Some(options)
        },
        extra: Vec::new(),
    })
}
