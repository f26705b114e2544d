use std::fmt;

/// Result returning Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors of the chat platform. Config and Protocol are contract violations
/// surfaced to the caller; the others wrap I/O-level failures.
#[derive(Debug)]
pub enum Error {
    /// invalid configuration or argument at a call site.
    Config(String),
    /// violation of a protocol-level contract (illegal state).
    Protocol(String),
    /// failure of the underlying socket.
    Io(std::io::Error),
    /// failure to encode or decode a wire message.
    Codec(postcard::Error),
    /// a channel endpoint closed while the other side was still in use.
    Channel(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(s) => write!(f, "configuration error: {}", s),
            Error::Protocol(s) => write!(f, "protocol error: {}", s),
            Error::Io(e) => write!(f, "i/o error: {}", e),
            Error::Codec(e) => write!(f, "codec error: {}", e),
            Error::Channel(s) => write!(f, "channel error: {}", s),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<postcard::Error> for Error {
    fn from(e: postcard::Error) -> Self {
        Error::Codec(e)
    }
}
