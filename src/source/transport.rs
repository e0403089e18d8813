//! Transport dispatch by URL scheme
//!
//! Every transport reduces to the same capability set: open once, expose an
//! async byte reader, report an HTTP-ish status. `file` and `tcp` report 200
//! while connected; `http`/`https` retain the upstream status code.

use std::future::Future;
use std::io;
use std::time::Duration;

use futures::TryStreamExt;
use tokio::io::{AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio_util::io::StreamReader;
use url::Url;

use crate::error::{Error, Result};

/// Reader over whatever byte source the scheme dialed
pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Supported upstream schemes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    File,
    Http,
    Https,
    Tcp,
}

impl Scheme {
    /// Classify a URL, rejecting anything this system cannot ingest.
    pub fn of(url: &Url) -> Result<Self> {
        match url.scheme() {
            "file" => Ok(Scheme::File),
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            "tcp" => Ok(Scheme::Tcp),
            other => Err(Error::InvalidProtocol(other.to_string())),
        }
    }

    /// A clean end of stream on a finite source ends the client instead of
    /// triggering reconnection; network sources treat EOF as a fault.
    pub fn eof_is_terminal(self) -> bool {
        matches!(self, Scheme::File)
    }
}

/// An opened upstream input
pub struct Input {
    pub(crate) reader: BoxedReader,
    pub(crate) status: u16,
    pub(crate) scheme: Scheme,
}

impl std::fmt::Debug for Input {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Input")
            .field("status", &self.status)
            .field("scheme", &self.scheme)
            .finish()
    }
}

impl Input {
    /// Dial `url` and return its byte stream.
    ///
    /// `timeout` bounds connection establishment (and, for HTTP, the wait
    /// for response headers); zero disables the deadline. A non-2xx HTTP
    /// response is rejected here, before any body byte is framed.
    pub async fn open(url: &Url, timeout: Duration, http: &reqwest::Client) -> Result<Input> {
        let scheme = Scheme::of(url)?;
        match scheme {
            Scheme::File => {
                let file = tokio::fs::File::open(url.path()).await?;
                Ok(Input {
                    reader: Box::new(BufReader::new(file)),
                    status: 200,
                    scheme,
                })
            }
            Scheme::Http | Scheme::Https => {
                let response = deadline(timeout, http.get(url.clone()).send())
                    .await
                    .map_err(Error::Io)??;
                let status = response.status().as_u16();
                if !response.status().is_success() {
                    return Err(Error::InvalidResponse(status));
                }
                let body = Box::pin(response.bytes_stream().map_err(io::Error::other));
                Ok(Input {
                    reader: Box::new(StreamReader::new(body)),
                    status,
                    scheme,
                })
            }
            Scheme::Tcp => {
                let host = url
                    .host_str()
                    .ok_or_else(|| invalid_url("tcp url is missing a host"))?;
                let port = url
                    .port()
                    .ok_or_else(|| invalid_url("tcp url is missing a port"))?;
                let socket = deadline(timeout, TcpStream::connect((host, port)))
                    .await
                    .map_err(Error::Io)??;
                Ok(Input {
                    reader: Box::new(socket),
                    status: 200,
                    scheme,
                })
            }
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }
}

fn invalid_url(message: &str) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::InvalidInput, message.to_string()))
}

/// Run `fut` under `timeout`; zero means no deadline.
async fn deadline<F, T>(timeout: Duration, fut: F) -> io::Result<T>
where
    F: Future<Output = T>,
{
    if timeout.is_zero() {
        return Ok(fut.await);
    }
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "upstream connect timed out"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn scheme_classification() {
        assert_eq!(Scheme::of(&url("file:///tmp/a.ts")).unwrap(), Scheme::File);
        assert_eq!(Scheme::of(&url("http://host/s")).unwrap(), Scheme::Http);
        assert_eq!(Scheme::of(&url("https://host/s")).unwrap(), Scheme::Https);
        assert_eq!(Scheme::of(&url("tcp://host:5000")).unwrap(), Scheme::Tcp);
        assert!(matches!(
            Scheme::of(&url("udp://host:5000")),
            Err(Error::InvalidProtocol(p)) if p == "udp"
        ));
    }

    #[test]
    fn only_file_eof_is_terminal() {
        assert!(Scheme::File.eof_is_terminal());
        assert!(!Scheme::Http.eof_is_terminal());
        assert!(!Scheme::Https.eof_is_terminal());
        assert!(!Scheme::Tcp.eof_is_terminal());
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let http = reqwest::Client::new();
        let err = Input::open(&url("file:///nonexistent/stream.ts"), Duration::ZERO, &http)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn tcp_url_without_port_is_rejected() {
        let http = reqwest::Client::new();
        let err = Input::open(&url("tcp://localhost"), Duration::ZERO, &http)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::InvalidInput));
    }
}
