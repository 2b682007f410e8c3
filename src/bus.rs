//! In-process event bus notifying workers that new work is available.
//!
//! Other deployments bridge API, MTA and worker processes with a
//! websocket-backed message bus service running as separate OS processes.
//! The binaries here can run pipeline, workers and API in one process, so
//! the same "a send happened, go look at the queue" signal collapses to a
//! `tokio::sync::broadcast` channel with no network hop.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::{EmailId, TenantId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum BusMessage {
    /// A message finished validation/signing and is ready for the delivery
    /// worker to pick up.
    EmailReadyToSend(EmailId),
    /// A delivery attempt finished; `tenant_id` lets webhook fanout and
    /// analytics subscribers filter without re-querying storage.
    DeliveryAttempted(TenantId, EmailId),
}

const CHANNEL_CAPACITY: usize = 1024;

/// Cheap to clone; every clone shares the same underlying channel.
#[derive(Clone)]
pub struct Bus {
    sender: broadcast::Sender<BusMessage>,
}

impl Bus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Bus { sender }
    }

    /// Ignores the "no active receivers" error: publishing is fire-and-forget
    /// since every subscriber (workers, periodic tasks) also polls storage
    /// directly and treats the bus purely as a latency optimization.
    pub fn publish(&self, message: BusMessage) {
        let _ = self.sender.send(message);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn multiple_subscribers_receive_the_same_message() {
        let bus = Bus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        let email_id = EmailId::new();
        bus.publish(BusMessage::EmailReadyToSend(email_id));

        assert_eq!(a.recv().await.unwrap(), BusMessage::EmailReadyToSend(email_id));
        assert_eq!(b.recv().await.unwrap(), BusMessage::EmailReadyToSend(email_id));
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = Bus::new();
        bus.publish(BusMessage::EmailReadyToSend(EmailId::new()));
    }
}
