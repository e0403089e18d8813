//! HTTP surface: stream endpoints, liveness checks, health and stats
//!
//! Each configured stream contributes two routes: its public path, serving
//! the packet stream as a chunked `video/mpeg` response, and
//! `/check<serve>`, a plain-text liveness probe over the upstream client's
//! connected flag. `/health` and `/stats` aggregate over all streams.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use futures::Stream;
use serde_json::json;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::hub::Broadcaster;
use crate::logging::AccessLog;
use crate::source::UpstreamClient;
use crate::stats::{Collector, StreamStats};

use super::config::{Config, StreamConfig};

/// One fully wired stream: upstream client, broadcaster, counters
pub struct StreamContext {
    pub serve: String,
    pub client: Arc<UpstreamClient>,
    pub hub: Broadcaster,
    pub stats: Arc<StreamStats>,
    pub log: Arc<dyn AccessLog>,
}

impl StreamContext {
    /// Wire intake, broadcaster, and upstream client for one stream
    /// definition and start both background tasks.
    pub fn start(
        config: &Config,
        stream: &StreamConfig,
        log: Arc<dyn AccessLog>,
    ) -> Result<Arc<Self>> {
        let stats = Arc::new(StreamStats::new(&stream.serve));
        let (intake, intake_rx) = mpsc::channel(config.input_buffer.max(1));

        let hub = Broadcaster::spawn(
            intake_rx,
            config.max_connections,
            config.output_buffer,
            Arc::clone(&stats) as Arc<dyn Collector>,
        );

        let client = Arc::new(UpstreamClient::new(
            stream.remote.uris(),
            intake,
            config.timeout(),
            config.reconnect(),
            Arc::clone(&stats) as Arc<dyn Collector>,
        )?);
        let _ = client.connect()?;

        log.log(json!({
            "module": "client",
            "event": "start",
            "path": stream.serve,
            "remote": stream.remote.uris(),
        }));

        Ok(Arc::new(Self {
            serve: stream.serve.clone(),
            client,
            hub,
            stats,
            log,
        }))
    }

    /// Stop the upstream client and close every subscriber session.
    pub fn shutdown(&self) {
        let _ = self.client.close();
        self.hub.shutdown();
    }
}

/// Aggregate state behind `/health` and `/stats`
struct ServerState {
    streams: Vec<Arc<StreamContext>>,
    limit: usize,
}

/// Assemble the router for a set of wired streams.
pub fn build_router(streams: Vec<Arc<StreamContext>>, max_connections: usize) -> Router {
    let mut router = Router::new();
    for ctx in &streams {
        router = router
            .route(&ctx.serve, get(stream_handler).with_state(Arc::clone(ctx)))
            .route(
                &format!("/check{}", ctx.serve),
                get(check_handler).with_state(Arc::clone(ctx)),
            );
    }

    let state = Arc::new(ServerState {
        streams,
        limit: max_connections,
    });
    router
        .route("/health", get(health_handler).with_state(Arc::clone(&state)))
        .route("/stats", get(stats_handler).with_state(state))
}

async fn stream_handler(
    State(ctx): State<Arc<StreamContext>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    let subscription = match ctx.hub.subscribe(peer.to_string()).await {
        Ok(subscription) => subscription,
        Err(err) => {
            tracing::warn!(remote = %peer, path = %ctx.serve, error = %err, "subscriber rejected");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                [(header::CONTENT_TYPE, "text/plain")],
                "503 service unavailable",
            )
                .into_response();
        }
    };

    tracing::info!(
        remote = %peer,
        path = %ctx.serve,
        subscriber = %subscription.id(),
        "serving subscriber"
    );
    ctx.log.log(json!({
        "module": "subscriber",
        "event": "connect",
        "remote": peer.to_string(),
        "path": ctx.serve,
    }));

    let body = LoggedBody::new(
        subscription.into_stream(),
        Arc::clone(&ctx.log),
        ctx.serve.clone(),
        peer.to_string(),
    );

    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mpeg")
        .body(Body::from_stream(body))
    {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(error = %err, "could not build stream response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn check_handler(State(ctx): State<Arc<StreamContext>>) -> Response {
    let (status, body) = if ctx.client.connected() {
        (StatusCode::OK, "200 ok")
    } else {
        (StatusCode::NOT_FOUND, "404 not found")
    };
    (status, [(header::CONTENT_TYPE, "text/plain")], body).into_response()
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> Response {
    let viewer: u32 = state.streams.iter().map(|s| s.stats.subscribers()).sum();
    let bandwidth: u64 = state.streams.iter().map(|s| s.stats.bitrate()).sum();

    Json(json!({
        "status": "ok",
        "viewer": viewer,
        "limit": state.limit,
        "bandwidth": bandwidth,
    }))
    .into_response()
}

async fn stats_handler(State(state): State<Arc<ServerState>>) -> Response {
    let streams: Vec<_> = state.streams.iter().map(|s| s.stats.snapshot()).collect();
    Json(json!({ "streams": streams })).into_response()
}

/// Body stream wrapper that records the session end in the access log.
///
/// Counting happens here, on the served side of the queue, so the
/// disconnect record carries what actually went to the peer.
struct LoggedBody {
    inner: Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>,
    log: Arc<dyn AccessLog>,
    path: String,
    remote: String,
    started: Instant,
    bytes: u64,
}

impl LoggedBody {
    fn new(
        inner: impl Stream<Item = std::io::Result<Bytes>> + Send + 'static,
        log: Arc<dyn AccessLog>,
        path: String,
        remote: String,
    ) -> Self {
        Self {
            inner: Box::pin(inner),
            log,
            path,
            remote,
            started: Instant::now(),
            bytes: 0,
        }
    }
}

impl Stream for LoggedBody {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.inner.as_mut().poll_next(cx);
        if let Poll::Ready(Some(Ok(chunk))) = &polled {
            this.bytes += chunk.len() as u64;
        }
        polled
    }
}

impl Drop for LoggedBody {
    fn drop(&mut self) {
        tracing::info!(remote = %self.remote, path = %self.path, "subscriber left");
        self.log.log(json!({
            "module": "subscriber",
            "event": "disconnect",
            "remote": self.remote,
            "path": self.path,
            "duration": self.started.elapsed().as_secs(),
            "bytes": self.bytes,
        }));
    }
}
