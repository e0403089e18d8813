//! HTTP server: configuration and the public surface

pub mod config;
pub mod http;

pub use config::{Config, Remote, StreamConfig};
pub use http::{build_router, StreamContext};
