//! Live MPEG-TS restreamer
//!
//! Pulls transport-stream packets from unreliable upstreams (file, HTTP,
//! raw TCP) and fans each stream out to many concurrent HTTP clients over
//! long-lived chunked responses.
//!
//! Per configured stream the pipeline is:
//!
//! ```text
//! UpstreamClient ──bounded intake──▶ Broadcaster ──lossy queues──▶ HTTP sessions
//! ```
//!
//! The upstream client blocks on a full intake (backpressure flows into the
//! upstream TCP window); the broadcaster never blocks on a subscriber: a
//! slow viewer loses packets, everyone else keeps watching.

pub mod error;
pub mod hub;
pub mod logging;
pub mod packet;
pub mod server;
pub mod source;
pub mod stats;

pub use error::{Error, Result};
pub use hub::{Broadcaster, SubscriberId, Subscription};
pub use packet::{read_packet, Packet, PACKET_SIZE, SYNC_BYTE};
pub use server::{build_router, Config, StreamContext};
pub use source::UpstreamClient;
pub use stats::{Collector, StreamStats};
