use thiserror::Error;

/// Protocol parsing errors for the startup phase.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Connection closed before a complete packet arrived.
    #[error("incomplete startup packet")]
    IncompletePacket,

    /// Declared packet length is outside the accepted bounds.
    #[error("invalid length of startup packet")]
    InvalidLength,

    /// Packet body does not match its declared layout.
    #[error("invalid startup packet layout: expected terminator as last byte")]
    BadTerminator,

    /// A second secure-transport negotiation on an already negotiated
    /// connection.
    #[error("duplicate secure-transport negotiation request")]
    DuplicateNegotiation,

    /// Frontend speaks a protocol revision outside the supported window.
    #[error("unsupported frontend protocol {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    /// Startup parameters carried no user name.
    #[error("no user name specified in startup packet")]
    NoUserName,

    /// A string field was not valid UTF-8.
    #[error("invalid UTF-8 in startup packet")]
    InvalidUtf8,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
