//! Broadcast hub: lossy packet fan-out to subscriber sessions
//!
//! One [`Broadcaster`] per configured stream. A single worker task owns the
//! intake buffer and the subscriber set; register/unregister arrive as inbox
//! messages, so admission is atomic and fan-out never iterates under a lock
//! a subscriber could need on its way out.
//!
//! ```text
//!   UpstreamClient ──intake──▶ FanoutWorker ──try_send──▶ [Subscription]
//!                                  ▲                  └──▶ [Subscription]
//!                                  │ inbox
//!                    subscribe / unsubscribe / shutdown
//! ```
//!
//! Delivery is lossy per subscriber: a full queue drops the packet for that
//! subscriber only. Backpressure belongs on the ingress side of intake,
//! never between subscribers.

mod broadcaster;
mod subscriber;

pub use broadcaster::Broadcaster;
pub use subscriber::{Subscription, SubscriptionCloser};

use std::fmt;

/// Opaque identity of one subscriber within its broadcaster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    pub(crate) fn new(raw: u64) -> Self {
        SubscriberId(raw)
    }

    /// Construct an id from its raw value; intended for tests and log replay
    pub fn from_raw(raw: u64) -> Self {
        SubscriberId(raw)
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
