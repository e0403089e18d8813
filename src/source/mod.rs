//! Upstream stream acquisition
//!
//! An [`UpstreamClient`] pulls framed transport-stream packets from one of a
//! list of failover endpoints and pushes them into the broadcaster's intake
//! buffer. Transports are selected by URL scheme; all transport failures are
//! recoverable by rolling over to the next endpoint and, with a nonzero
//! reconnect delay, retrying the whole list.

mod client;
mod transport;

pub use client::UpstreamClient;
pub use transport::{Input, Scheme};
