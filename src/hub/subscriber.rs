//! Subscriber session handle

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use tokio::sync::{mpsc, Notify};

use crate::packet::Packet;

use super::broadcaster::Broadcaster;
use super::SubscriberId;

/// How often the serving loop wakes with nothing to do. The tick only
/// bounds the latency of noticing a shutdown signal.
const SERVE_TICK: Duration = Duration::from_secs(1);

/// One admitted subscriber: the receiving end of a private packet queue.
///
/// Dropping the subscription unregisters it from the broadcaster, so a
/// session that ends on a failed write (peer gone mid-stream) cleans up the
/// same way as one that ends on queue closure.
pub struct Subscription {
    id: SubscriberId,
    queue: mpsc::Receiver<Packet>,
    shutdown: Arc<Notify>,
    hub: Broadcaster,
    remote_addr: String,
}

/// Signals one subscription to stop serving; single-shot
#[derive(Clone)]
pub struct SubscriptionCloser {
    shutdown: Arc<Notify>,
}

impl SubscriptionCloser {
    pub fn close(&self) {
        // notify_one stores a permit, so closing before the session reaches
        // its next wait point is not lost
        self.shutdown.notify_one();
    }
}

impl Subscription {
    pub(super) fn new(
        id: SubscriberId,
        queue: mpsc::Receiver<Packet>,
        hub: Broadcaster,
        remote_addr: String,
    ) -> Self {
        Self {
            id,
            queue,
            shutdown: Arc::new(Notify::new()),
            hub,
            remote_addr,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Peer address, kept for log records only
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn closer(&self) -> SubscriptionCloser {
        SubscriptionCloser {
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Receive the next packet; `None` once the broadcaster closed the queue
    pub async fn recv(&mut self) -> Option<Packet> {
        self.queue.recv().await
    }

    /// Convert the subscription into the body byte stream of an HTTP
    /// response. The stream ends on queue closure or on the shutdown
    /// signal; dropping it (peer disconnect) unregisters the subscriber.
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Bytes>> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            loop {
                tokio::select! {
                    packet = sub.queue.recv() => {
                        return match packet {
                            Some(packet) => {
                                Some((Ok::<Bytes, io::Error>(packet.into_bytes()), sub))
                            }
                            // queue closed: end the body, drop guard cleans up
                            None => None,
                        };
                    }
                    _ = sub.shutdown.notified() => {
                        tracing::debug!(subscriber = %sub.id, "session closed by signal");
                        return None;
                    }
                    _ = tokio::time::sleep(SERVE_TICK) => {}
                }
            }
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}
