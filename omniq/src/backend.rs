//! The seams between the queue facade and the broker client libraries.
//!
//! A backend provides a connection ([`Backend`]) from which the facade creates one [`Producer`]
//! and, on every `Dequeue`, one [`Subscription`]. Optional broker features are reachable through
//! the capability probes of the producer and are never emulated.

use crate::message::Message;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Optional producer features.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Capability {
    /// Delivery of a message after a delay.
    Deferred,
    /// Publishing many messages in one atomic request.
    Batch,
    /// Publishing in a transaction.
    Transactional,
}

/// The topic and the consumer group (or channel, or queue group) of a subscription.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identity {
    pub topic: String,
    pub group: String,
}

impl Identity {
    pub fn new(topic: &str, group: &str) -> Self {
        Identity {
            topic: topic.to_string(),
            group: group.to_string(),
        }
    }
}

/// An open connection to a broker. The queue facade owns it and closes it exactly once.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn producer(&self, topic: &str) -> Result<Box<dyn Producer>>;

    async fn subscribe(&self, identity: &Identity) -> Result<Box<dyn Subscription>>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait Producer: Send + Sync {
    /// Sends one message and waits for the broker confirmation.
    async fn send(&self, payload: Bytes) -> Result<()>;

    /// Sends messages one by one, stopping at the first failure. Messages sent before the
    /// failure are not rolled back. Backends with atomic batches override this and report
    /// [`Capability::Batch`].
    async fn send_batch(&self, payloads: Vec<Bytes>) -> Result<()> {
        for payload in payloads {
            self.send(payload).await?;
        }

        Ok(())
    }

    /// Closes the producer. Calling it again does nothing.
    async fn close(&self) -> Result<()>;

    fn capabilities(&self) -> &'static [Capability] {
        &[]
    }

    fn as_deferred(&self) -> Option<&dyn DeferredProducer> {
        None
    }

    fn as_transactional(&self) -> Option<&dyn TransactionalProducer> {
        None
    }
}

#[async_trait]
pub trait DeferredProducer: Send + Sync {
    async fn send_after(&self, delay: Duration, payload: Bytes) -> Result<()>;
}

#[async_trait]
pub trait TransactionalProducer: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>>;
}

/// Messages sent in a transaction are visible to consumers after `commit` and never after
/// `rollback`.
#[async_trait]
pub trait Transaction: Send {
    async fn send(&mut self, payload: Bytes) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// A pull based subscription of one [`Identity`], driven by the worker task of a consumer session.
///
/// Group coordinated backends report the end of a claim generation by returning
/// [`crate::Interrupt::Rebalance`] from `setup` or `recv`, and the end of the group by
/// [`crate::Interrupt::GroupClosed`]. Any other error stops the session.
#[async_trait]
pub trait Subscription: Send {
    /// Binds the subscription, it returns when the broker assigned the claims.
    async fn setup(&mut self) -> Result<()>;

    /// Waits for the next message of the current generation. It must be cancel safe.
    async fn recv(&mut self) -> Result<Message>;

    /// Acknowledges the message or commits its offset.
    async fn commit(&mut self, message: &Message) -> Result<()>;

    /// Unsubscribes or leaves the group.
    async fn shutdown(&mut self) -> Result<()>;
}
