use crate::close::CloseCode;
use std::io;
use thiserror::Error;
use tokio::sync::AcquireError;

/// Errors the handshake collaborator (accept/dial) can produce before the
/// connection core takes over.
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("request is not a valid HTTP Upgrade request")]
    InvalidHTTPHandshake,

    #[error("Connection: Upgrade header missing in the request")]
    NoConnectionHeaderPresent,

    #[error("Upgrade: websocket header missing in the request")]
    NoUpgradeHeaderPresent,

    #[error("Sec-WebSocket-Version: 13 header missing or mismatched")]
    VersionMismatch,

    #[error("Sec-WebSocket-Key header missing in the request")]
    NoSecWebsocketKey,

    #[error("origin not allowed by server policy")]
    OriginNotAllowed,

    #[error("server didn't upgrade the connection")]
    NoUpgrade,

    #[error("server didn't send a Sec-WebSocket-Accept header")]
    NoAccept,

    #[error("server sent an invalid Sec-WebSocket-Accept value")]
    InvalidAcceptKey,

    #[error("server chose a subprotocol outside the requested set")]
    SubprotocolMismatch,

    #[error("{source}")]
    Http {
        #[from]
        source: httparse::Error,
    },

    #[error("incomplete HTTP request")]
    IncompleteHTTPRequest,

    #[error("{source}")]
    UrlParse {
        #[from]
        source: url::ParseError,
    },

    #[error("invalid scheme in WebSocket URL, expected ws:// or wss://")]
    InvalidSchemeURL,

    #[error("URL has no host")]
    URLNoHost,
}

/// Every terminal condition a connection can reach round-trips through this
/// enum. `Clone` so it can be latched once and handed back to every
/// subsequent caller.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The peer closed, or we did; terminal but inspectable via
    /// [`Error::close_status`].
    #[error("websocket closed: {0:?} {1:?}")]
    Closed(CloseCode, String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("message exceeds configured read limit")]
    MessageTooBig,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("usage error: {0}")]
    Usage(&'static str),

    #[error("handshake error: {0}")]
    Handshake(String),
}

impl Error {
    /// Returns the peer's close code if this error represents a completed
    /// close handshake, `None` otherwise.
    pub fn close_status(&self) -> Option<CloseCode> {
        match self {
            Error::Closed(code, _) => Some(*code),
            _ => None,
        }
    }
}

/// Inspection helper mirroring [`Error::close_status`] as a free function.
pub fn close_status(err: &Error) -> Option<CloseCode> {
    err.close_status()
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io(source.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::DeadlineExceeded
    }
}

impl From<HandshakeError> for Error {
    fn from(source: HandshakeError) -> Self {
        Error::Handshake(source.to_string())
    }
}

impl From<AcquireError> for Error {
    fn from(_: AcquireError) -> Self {
        Error::Usage("connection is closed, no handle can be acquired")
    }
}
