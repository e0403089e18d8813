//! Fan-out worker and its public handle

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::packet::Packet;
use crate::stats::Collector;

use super::subscriber::Subscription;
use super::SubscriberId;

type AdmissionReply = oneshot::Sender<Result<(SubscriberId, mpsc::Receiver<Packet>)>>;

enum Command {
    Subscribe {
        remote_addr: String,
        reply: AdmissionReply,
    },
    Unsubscribe(SubscriberId),
    Shutdown,
}

/// Handle to a running fan-out worker; cheap to clone
#[derive(Clone)]
pub struct Broadcaster {
    commands: mpsc::UnboundedSender<Command>,
}

impl Broadcaster {
    /// Start the fan-out worker for one stream.
    ///
    /// `intake` is the bounded buffer fed by the upstream client. Each
    /// admitted subscriber gets a private queue of `queue_size` packets.
    pub fn spawn(
        intake: mpsc::Receiver<Packet>,
        max_subscribers: usize,
        queue_size: usize,
        stats: Arc<dyn Collector>,
    ) -> Self {
        let (commands, inbox) = mpsc::unbounded_channel();

        let worker = FanoutWorker {
            intake,
            inbox,
            subscribers: HashMap::new(),
            max_subscribers,
            // a zero-capacity queue cannot exist; one slot is the floor
            queue_size: queue_size.max(1),
            next_id: 1,
            stats,
        };
        tokio::spawn(worker.run());

        Broadcaster { commands }
    }

    /// Request admission for a new subscriber.
    ///
    /// Returns [`Error::TooManySubscribers`] when the stream is at capacity
    /// and [`Error::HubClosed`] when the worker has shut down.
    pub async fn subscribe(&self, remote_addr: impl Into<String>) -> Result<Subscription> {
        let remote_addr = remote_addr.into();
        let (reply, admitted) = oneshot::channel();

        self.commands
            .send(Command::Subscribe {
                remote_addr: remote_addr.clone(),
                reply,
            })
            .map_err(|_| Error::HubClosed)?;

        let (id, queue) = admitted.await.map_err(|_| Error::HubClosed)??;
        Ok(Subscription::new(id, queue, self.clone(), remote_addr))
    }

    /// Remove a subscriber from the set. Idempotent; safe after shutdown.
    pub fn unsubscribe(&self, id: SubscriberId) {
        let _ = self.commands.send(Command::Unsubscribe(id));
    }

    /// Stop the worker and close every subscriber queue.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// The single task that owns intake consumption and the subscriber set
struct FanoutWorker {
    intake: mpsc::Receiver<Packet>,
    inbox: mpsc::UnboundedReceiver<Command>,
    subscribers: HashMap<SubscriberId, mpsc::Sender<Packet>>,
    max_subscribers: usize,
    queue_size: usize,
    next_id: u64,
    stats: Arc<dyn Collector>,
}

impl FanoutWorker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                packet = self.intake.recv() => match packet {
                    Some(packet) => self.fan_out(packet),
                    None => {
                        // upstream gone for good; queued packets are already
                        // fanned out, so closing the queues gives every
                        // session a clean end of stream
                        tracing::debug!("intake closed, stopping fan-out");
                        break;
                    }
                },
                command = self.inbox.recv() => match command {
                    Some(Command::Subscribe { remote_addr, reply }) => {
                        self.admit(remote_addr, reply);
                    }
                    Some(Command::Unsubscribe(id)) => self.remove(id),
                    Some(Command::Shutdown) | None => {
                        tracing::debug!("broadcaster shutdown");
                        break;
                    }
                },
            }
        }

        for (_, _queue) in self.subscribers.drain() {
            self.stats.subscriber_removed();
        }
    }

    /// Non-blocking delivery to every subscriber; a full queue drops the
    /// packet for that subscriber only.
    fn fan_out(&mut self, packet: Packet) {
        let mut closed = Vec::new();

        for (&id, queue) in &self.subscribers {
            match queue.try_send(packet.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => self.stats.packet_dropped(id),
                Err(TrySendError::Closed(_)) => closed.push(id),
            }
        }

        for id in closed {
            self.remove(id);
        }
    }

    fn admit(&mut self, remote_addr: String, reply: AdmissionReply) {
        if self.subscribers.len() >= self.max_subscribers {
            tracing::warn!(
                remote = %remote_addr,
                limit = self.max_subscribers,
                "subscriber rejected: stream at capacity"
            );
            let _ = reply.send(Err(Error::TooManySubscribers));
            return;
        }

        let id = SubscriberId::new(self.next_id);
        self.next_id += 1;

        let (queue, handle) = mpsc::channel(self.queue_size);
        if reply.send(Ok((id, handle))).is_ok() {
            self.subscribers.insert(id, queue);
            self.stats.subscriber_added();
            tracing::debug!(
                subscriber = %id,
                remote = %remote_addr,
                total = self.subscribers.len(),
                "subscriber admitted"
            );
        }
        // a dropped reply means the session gave up mid-admission; nothing
        // was inserted, so there is nothing to clean up
    }

    fn remove(&mut self, id: SubscriberId) {
        if self.subscribers.remove(&id).is_some() {
            self.stats.subscriber_removed();
            tracing::debug!(
                subscriber = %id,
                total = self.subscribers.len(),
                "subscriber removed"
            );
        }
    }
}
