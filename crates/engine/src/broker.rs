//! The seam between the worker and the job broker.
//!
//! The engine only ever talks to the broker through these traits:
//! subscribe to named queues with a priority, block on delivery,
//! acknowledge or hand back a message, and submit payloads. The gearman
//! wire client implements them for real deployments; [`MemoryBroker`] is
//! an in-process implementation for tests and embeddings.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

/// Failures crossing the broker seam.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// No broker endpoint could be reached.
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    /// The peer sent something the client cannot make sense of.
    #[error("broker protocol error: {0}")]
    Protocol(String),
    /// Transport-level failure on an established connection.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One message pulled off a queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Queue the message arrived on.
    pub queue: String,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// Broker-side handle used to complete or fail the message.
    pub(crate) tag: String,
}

/// An established broker connection, owned by a single worker.
#[async_trait]
pub trait Connection: Send {
    /// Register interest in a queue. Higher `priority` queues are polled
    /// first where the broker supports it.
    async fn subscribe(&mut self, queue: &str, priority: u32) -> Result<(), BrokerError>;

    /// Block until the broker hands over a message.
    async fn receive(&mut self) -> Result<Delivery, BrokerError>;

    /// Mark the message as handled.
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Hand the message back for redelivery.
    async fn nack(&mut self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Publish a payload onto a queue.
    async fn submit(&mut self, queue: &str, payload: &[u8]) -> Result<(), BrokerError>;
}

/// Connection factory, cloned into every worker.
#[async_trait]
pub trait Broker: Clone + Send + Sync + 'static {
    /// Connection type produced by [`Broker::connect`].
    type Conn: Connection + 'static;

    /// Establish a fresh connection; implementations rotate through their
    /// configured endpoints.
    async fn connect(&self) -> Result<Self::Conn, BrokerError>;
}

#[derive(Default)]
struct MemoryState {
    queues: HashMap<String, VecDeque<Vec<u8>>>,
}

#[derive(Default)]
struct MemoryShared {
    state: Mutex<MemoryState>,
    notify: Notify,
}

/// In-process broker backed by plain queues.
///
/// Honours subscription priority strictly and redelivers nacked messages,
/// which makes it a faithful stand-in for the wire broker in tests.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<MemoryShared>,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a payload, as a submitter would.
    pub fn push(&self, queue: &str, payload: &[u8]) {
        let mut state = self.shared.state.lock().expect("memory broker lock");
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(payload.to_vec());
        drop(state);
        self.shared.notify.notify_waiters();
    }

    /// Take everything currently sitting on a queue.
    pub fn drain(&self, queue: &str) -> Vec<Vec<u8>> {
        let mut state = self.shared.state.lock().expect("memory broker lock");
        state
            .queues
            .get_mut(queue)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    /// Number of messages waiting on a queue.
    pub fn queue_len(&self, queue: &str) -> usize {
        let state = self.shared.state.lock().expect("memory broker lock");
        state.queues.get(queue).map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Conn = MemoryConnection;

    async fn connect(&self) -> Result<Self::Conn, BrokerError> {
        Ok(MemoryConnection {
            shared: self.shared.clone(),
            subscriptions: Vec::new(),
        })
    }
}

/// Connection handle onto a [`MemoryBroker`].
pub struct MemoryConnection {
    shared: Arc<MemoryShared>,
    subscriptions: Vec<(String, u32)>,
}

impl MemoryConnection {
    fn try_pop(&self) -> Option<Delivery> {
        let mut state = self.shared.state.lock().expect("memory broker lock");
        for (queue, _) in &self.subscriptions {
            if let Some(payload) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) {
                return Some(Delivery {
                    queue: queue.clone(),
                    payload,
                    tag: String::new(),
                });
            }
        }
        None
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn subscribe(&mut self, queue: &str, priority: u32) -> Result<(), BrokerError> {
        self.subscriptions.push((queue.to_string(), priority));
        // Stable sort keeps the subscription order within a priority.
        self.subscriptions.sort_by_key(|(_, prio)| std::cmp::Reverse(*prio));
        Ok(())
    }

    async fn receive(&mut self) -> Result<Delivery, BrokerError> {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(delivery) = self.try_pop() {
                return Ok(delivery);
            }
            notified.await;
        }
    }

    async fn ack(&mut self, _delivery: &Delivery) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn nack(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut state = self.shared.state.lock().expect("memory broker lock");
        state
            .queues
            .entry(delivery.queue.clone())
            .or_default()
            .push_back(delivery.payload.clone());
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn submit(&mut self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let mut state = self.shared.state.lock().expect("memory broker lock");
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(payload.to_vec());
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn delivers_in_subscription_priority_order() {
        let broker = MemoryBroker::new();
        broker.push("host", b"generic");
        broker.push("hostgroup_web", b"grouped");

        let mut conn = broker.connect().await.unwrap();
        conn.subscribe("host", 0).await.unwrap();
        conn.subscribe("hostgroup_web", 1).await.unwrap();

        let first = conn.receive().await.unwrap();
        assert_eq!(first.queue, "hostgroup_web");
        let second = conn.receive().await.unwrap();
        assert_eq!(second.queue, "host");
    }

    #[tokio::test]
    async fn receive_blocks_until_a_push() {
        let broker = MemoryBroker::new();
        let mut conn = broker.connect().await.unwrap();
        conn.subscribe("service", 0).await.unwrap();

        let pusher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pusher.push("service", b"late");
        });

        let delivery = tokio::time::timeout(Duration::from_secs(1), conn.receive())
            .await
            .expect("receive should be woken")
            .unwrap();
        assert_eq!(delivery.payload, b"late");
    }

    #[tokio::test]
    async fn nack_puts_the_message_back() {
        let broker = MemoryBroker::new();
        broker.push("service", b"again");

        let mut conn = broker.connect().await.unwrap();
        conn.subscribe("service", 0).await.unwrap();

        let delivery = conn.receive().await.unwrap();
        conn.nack(&delivery).await.unwrap();
        assert_eq!(broker.queue_len("service"), 1);

        let redelivered = conn.receive().await.unwrap();
        assert_eq!(redelivered.payload, b"again");
        conn.ack(&redelivered).await.unwrap();
        assert_eq!(broker.queue_len("service"), 0);
    }
}
