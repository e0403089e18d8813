//! Crate-wide error types

use thiserror::Error;

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the restreamer core
#[derive(Debug, Error)]
pub enum Error {
    /// The upstream URL list was empty
    #[error("no upstream URL configured")]
    NoUrl,

    /// An upstream URL could not be parsed
    #[error("invalid upstream URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The URL scheme is not one of file, http, https, tcp
    #[error("unsupported protocol: {0}")]
    InvalidProtocol(String),

    /// Close was called on a client that is not connected
    #[error("socket not connected")]
    NoConnection,

    /// Connect was called on a client that is already running
    #[error("socket is already connected")]
    AlreadyConnected,

    /// The upstream HTTP server answered with a non-2xx status
    #[error("unsupported upstream response code: {0}")]
    InvalidResponse(u16),

    /// The upstream byte stream ended cleanly at a frame boundary
    #[error("end of stream")]
    EndOfStream,

    /// Subscriber admission was denied because the stream is at capacity
    #[error("too many subscribers")]
    TooManySubscribers,

    /// The broadcaster has shut down and no longer accepts subscribers
    #[error("broadcaster is shut down")]
    HubClosed,

    /// The configuration document could not be deserialized
    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),

    /// Transport-level I/O failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failure (connect, TLS, redirect, ...)
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Whether the connection loop may recover from this error by rolling
    /// over to the next endpoint. Configuration-class errors are fatal.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Http(_) | Error::InvalidResponse(_) | Error::EndOfStream
        )
    }
}
