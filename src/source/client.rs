//! Upstream client: failover, reconnection, and the pull loop

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{Error, Result};
use crate::packet::{read_packet, Packet};
use crate::stats::Collector;

use super::transport::{BoxedReader, Input};
use super::Scheme;

/// Why an established upstream stopped producing
enum Outcome {
    /// The transport failed or the stream ended; the connection loop keeps
    /// going per the reconnect policy.
    Disconnected(Error),
    /// Nothing left to do: file drained, intake closed, or explicit close.
    Finished(&'static str),
}

/// Pulls framed packets from one of several failover endpoints into the
/// broadcaster's intake buffer.
///
/// The client is constructed detached and started once with
/// [`connect`](UpstreamClient::connect), which spawns the connection loop.
/// The `connected` flag and the retained status code are observable from
/// other tasks (the `/check` handler polls them).
pub struct UpstreamClient {
    urls: Vec<Url>,
    // taken by the connection loop on startup and dropped when it ends, so
    // the broadcaster observes intake closure once the client is done
    intake: std::sync::Mutex<Option<mpsc::Sender<Packet>>>,
    timeout: Duration,
    reconnect: Duration,
    stats: Arc<dyn Collector>,
    http: reqwest::Client,
    running: AtomicBool,
    status: AtomicU16,
    started: AtomicBool,
    shutdown: CancellationToken,
}

impl UpstreamClient {
    /// Build a client for an ordered list of failover endpoints.
    ///
    /// Fails fast on configuration errors: an empty list, an unparseable
    /// URI, or an unsupported scheme. `timeout` bounds connection setup and
    /// each frame read (zero disables it); `reconnect` is the pause between
    /// full failover passes, zero meaning a single pass.
    pub fn new(
        uris: &[String],
        intake: mpsc::Sender<Packet>,
        timeout: Duration,
        reconnect: Duration,
        stats: Arc<dyn Collector>,
    ) -> Result<Self> {
        if uris.is_empty() {
            return Err(Error::NoUrl);
        }
        let urls = uris
            .iter()
            .map(|uri| {
                let url = Url::parse(uri)?;
                Scheme::of(&url)?;
                Ok(url)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut builder = reqwest::Client::builder();
        if !timeout.is_zero() {
            builder = builder.connect_timeout(timeout);
        }
        let http = builder.build()?;

        Ok(Self {
            urls,
            intake: std::sync::Mutex::new(Some(intake)),
            timeout,
            reconnect,
            stats,
            http,
            running: AtomicBool::new(false),
            status: AtomicU16::new(0),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawn the connection loop. Returns [`Error::AlreadyConnected`] on a
    /// second call.
    pub fn connect(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyConnected);
        }
        let client = Arc::clone(self);
        Ok(tokio::spawn(async move { client.run().await }))
    }

    /// Stop the connection loop and release the current input.
    /// Returns [`Error::NoConnection`] if the client was never started or
    /// is already closed.
    pub fn close(&self) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) || self.shutdown.is_cancelled() {
            return Err(Error::NoConnection);
        }
        self.shutdown.cancel();
        Ok(())
    }

    /// True while the pull loop is streaming into intake
    pub fn connected(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Retained HTTP status for http(s) inputs, 200 for a connected file or
    /// tcp input, 0 while disconnected
    pub fn status_code(&self) -> u16 {
        self.status.load(Ordering::Relaxed)
    }

    /// The connection loop: walk the endpoint list in order, pull from the
    /// first one that opens, retry the whole list after `reconnect`.
    async fn run(&self) {
        let intake = match self.intake.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(intake) = intake else { return };

        let mut first = true;

        'passes: loop {
            if !first {
                if self.reconnect.is_zero() {
                    tracing::info!("reconnecting disabled, stream stays offline");
                    break;
                }
                tracing::info!(
                    delay_secs = self.reconnect.as_secs(),
                    "retrying upstream list"
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.reconnect) => {}
                    _ = self.shutdown.cancelled() => break,
                }
            }
            first = false;

            for url in &self.urls {
                match self.attempt(url, &intake).await {
                    Err(err) => {
                        // never produced input; roll over to the next endpoint
                        tracing::warn!(url = %url, error = %err, "upstream attempt failed");
                    }
                    Ok(Outcome::Disconnected(err)) => {
                        tracing::warn!(url = %url, error = %err, "upstream disconnected");
                        continue 'passes;
                    }
                    Ok(Outcome::Finished(reason)) => {
                        tracing::info!(url = %url, reason, "upstream client stopping");
                        break 'passes;
                    }
                }
            }
        }
    }

    async fn attempt(&self, url: &Url, intake: &mpsc::Sender<Packet>) -> Result<Outcome> {
        let input = Input::open(url, self.timeout, &self.http).await?;
        tracing::info!(url = %url, status = input.status(), "pulling upstream stream");
        let outcome = self.pull(input, intake).await;
        tracing::info!(url = %url, "upstream input closed");
        Ok(outcome)
    }

    /// Stream frames from an open input into intake until something gives.
    ///
    /// The intake send deliberately blocks when the buffer is full: that is
    /// the backpressure channel, pushing the stall into the upstream TCP
    /// window instead of dropping packets here.
    async fn pull(&self, input: Input, intake: &mpsc::Sender<Packet>) -> Outcome {
        let scheme = input.scheme();
        let mut reader = input.reader;

        self.running.store(true, Ordering::Relaxed);
        self.status.store(input.status, Ordering::Relaxed);
        self.stats.source_connected();

        let outcome = loop {
            let packet = tokio::select! {
                _ = self.shutdown.cancelled() => break Outcome::Finished("closed"),
                read = self.read_frame(&mut reader) => match read {
                    Ok(Some(packet)) => packet,
                    Ok(None) if scheme.eof_is_terminal() => {
                        break Outcome::Finished("file source drained");
                    }
                    Ok(None) => break Outcome::Disconnected(Error::EndOfStream),
                    Err(err) => break Outcome::Disconnected(err.into()),
                },
            };

            self.stats.packet_received();

            tokio::select! {
                _ = self.shutdown.cancelled() => break Outcome::Finished("closed"),
                sent = intake.send(packet) => {
                    if sent.is_err() {
                        break Outcome::Finished("intake closed");
                    }
                }
            }
        };

        self.running.store(false, Ordering::Relaxed);
        self.status.store(0, Ordering::Relaxed);
        self.stats.source_disconnected();
        outcome
    }

    /// One framed read under the per-read deadline
    async fn read_frame(&self, reader: &mut BoxedReader) -> io::Result<Option<Packet>> {
        if self.timeout.is_zero() {
            return read_packet(reader).await;
        }
        match tokio::time::timeout(self.timeout, read_packet(reader)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "upstream read timed out",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use crate::packet::{PACKET_SIZE, SYNC_BYTE};
    use crate::stats::NullCollector;

    use super::*;

    fn frame(fill: u8) -> Vec<u8> {
        let mut data = vec![fill; PACKET_SIZE];
        data[0] = SYNC_BYTE;
        data
    }

    fn client(
        uris: &[String],
        intake: mpsc::Sender<Packet>,
        reconnect: Duration,
    ) -> Result<Arc<UpstreamClient>> {
        UpstreamClient::new(
            uris,
            intake,
            Duration::from_secs(5),
            reconnect,
            Arc::new(NullCollector),
        )
        .map(Arc::new)
    }

    #[tokio::test]
    async fn empty_url_list_is_fatal() {
        let (intake, _rx) = mpsc::channel(4);
        assert!(matches!(
            client(&[], intake, Duration::ZERO),
            Err(Error::NoUrl)
        ));
    }

    #[tokio::test]
    async fn unsupported_scheme_is_fatal() {
        let (intake, _rx) = mpsc::channel(4);
        let result = client(&["udp://239.0.0.1:1234".into()], intake, Duration::ZERO);
        assert!(matches!(result, Err(Error::InvalidProtocol(p)) if p == "udp"));
    }

    #[tokio::test]
    async fn malformed_url_is_fatal() {
        let (intake, _rx) = mpsc::channel(4);
        assert!(matches!(
            client(&["not a url".into()], intake, Duration::ZERO),
            Err(Error::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn second_connect_is_rejected() {
        let (intake, _rx) = mpsc::channel(4);
        let client = client(&["tcp://127.0.0.1:1".into()], intake, Duration::ZERO).unwrap();
        let handle = client.connect().unwrap();
        assert!(matches!(client.connect(), Err(Error::AlreadyConnected)));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn close_before_connect_reports_no_connection() {
        let (intake, _rx) = mpsc::channel(4);
        let client = client(&["tcp://127.0.0.1:1".into()], intake, Duration::ZERO).unwrap();
        assert!(matches!(client.close(), Err(Error::NoConnection)));
    }

    #[tokio::test]
    async fn streams_a_tcp_source_into_intake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            for fill in 1..=5u8 {
                socket.write_all(&frame(fill)).await.unwrap();
            }
            // hold the socket open until the test has asserted liveness
            let _ = done_rx.await;
        });

        let (intake, mut rx) = mpsc::channel(16);
        let client = client(&[format!("tcp://{addr}")], intake, Duration::ZERO).unwrap();
        let handle = client.connect().unwrap();

        for fill in 1..=5u8 {
            let packet = rx.recv().await.unwrap();
            assert_eq!(packet.as_ref()[1], fill);
        }
        assert!(client.connected());
        assert_eq!(client.status_code(), 200);

        // single pass: after the source closes, the client stays offline
        drop(done_tx);
        handle.await.unwrap();
        assert!(!client.connected());
        assert_eq!(client.status_code(), 0);
    }

    #[tokio::test]
    async fn fails_over_to_the_next_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&frame(9)).await.unwrap();
        });

        // port 1 refuses; the client must roll over to the live endpoint
        let urls = vec!["tcp://127.0.0.1:1".to_string(), format!("tcp://{addr}")];
        let (intake, mut rx) = mpsc::channel(16);
        let client = client(&urls, intake, Duration::ZERO).unwrap();
        let handle = client.connect().unwrap();

        let packet = rx.recv().await.unwrap();
        assert_eq!(packet.as_ref()[1], 9);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn reconnects_after_the_source_drops() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            // first connection: two frames, then drop
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&frame(1)).await.unwrap();
            socket.write_all(&frame(2)).await.unwrap();
            drop(socket);

            // second connection after the client's reconnect pause
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&frame(3)).await.unwrap();
            let _ = done_rx.await;
        });

        let (intake, mut rx) = mpsc::channel(16);
        let client = client(&[format!("tcp://{addr}")], intake, Duration::from_millis(50)).unwrap();
        let _handle = client.connect().unwrap();

        for fill in 1..=3u8 {
            let packet = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("reconnect never delivered")
                .unwrap();
            assert_eq!(packet.as_ref()[1], fill);
        }
        assert!(client.connected());

        client.close().unwrap();
        assert!(matches!(client.close(), Err(Error::NoConnection)));
        drop(done_tx);
    }

    #[tokio::test]
    async fn rejects_non_2xx_http_upstreams() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let (intake, mut rx) = mpsc::channel(16);
        let client = client(&[format!("http://{addr}/s")], intake, Duration::ZERO).unwrap();
        let handle = client.connect().unwrap();

        handle.await.unwrap();
        assert!(rx.try_recv().is_err());
        assert!(!client.connected());
    }

    #[tokio::test]
    async fn terminates_when_intake_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            loop {
                if socket.write_all(&frame(1)).await.is_err() {
                    break;
                }
            }
        });

        let (intake, mut rx) = mpsc::channel(4);
        // reconnect enabled: only intake closure may end the task
        let client = client(&[format!("tcp://{addr}")], intake, Duration::from_secs(60)).unwrap();
        let handle = client.connect().unwrap();

        rx.recv().await.unwrap();
        rx.close();
        drop(rx);

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("client outlived its intake")
            .unwrap();
    }
}
