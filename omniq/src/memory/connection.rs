use crate::backend::{
    Backend, Capability, DeferredProducer, Identity, Producer, Subscription, Transaction, TransactionalProducer,
};
use crate::config::{Acks, Config, Partitioner};
use crate::error::{Interrupt, QueueError};
use crate::memory::broker::{self, BrokerCommand, BrokerSink, CommitCommand, Event, JoinCommand, Record};
use crate::message::{Message, Metadata};
use crate::queue_error;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, trace};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// A connection to a [`crate::memory::MemoryBroker`].
pub struct MemoryConnection {
    id: u64,
    broker: BrokerSink,
    config: Config,
    closed: Arc<AtomicBool>,
}

impl MemoryConnection {
    pub(crate) async fn open(broker: BrokerSink, config: &Config) -> Result<Self> {
        let id = broker::call(&broker, BrokerCommand::Connect).await?;

        debug!("Memory connection {} opened", id);

        Ok(MemoryConnection {
            id,
            broker,
            config: config.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return queue_error!(QueueError::ConnectionLost);
        }

        Ok(())
    }
}

#[async_trait]
impl Backend for MemoryConnection {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn producer(&self, topic: &str) -> Result<Box<dyn Producer>> {
        self.check_open()?;

        let partitions = broker::call(&self.broker, |tx| BrokerCommand::Metadata(topic.to_string(), tx)).await?;

        Ok(Box::new(MemoryProducer {
            core: Arc::new(ProducerCore {
                broker: self.broker.clone(),
                topic: topic.to_string(),
                partitions,
                partitioner: self.config.partitioner,
                acks: self.config.acks,
                next_partition: AtomicU32::new(0),
                closed: AtomicBool::new(false),
                connection_closed: self.closed.clone(),
            }),
        }))
    }

    async fn subscribe(&self, identity: &Identity) -> Result<Box<dyn Subscription>> {
        self.check_open()?;

        let prefix = self.config.client_name.as_deref().unwrap_or("omniq");

        Ok(Box::new(MemorySubscription {
            broker: self.broker.clone(),
            identity: identity.clone(),
            member_id: format!("{}-{}", prefix, uuid::Uuid::new_v4().as_hyphenated()),
            config: self.config.clone(),
            events: None,
            joined: false,
            connection_closed: self.closed.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        debug!("Closing memory connection {}", self.id);

        broker::call(&self.broker, |tx| BrokerCommand::Disconnect(self.id, tx)).await?
    }
}

struct ProducerCore {
    broker: BrokerSink,
    topic: String,
    partitions: u32,
    partitioner: Partitioner,
    acks: Acks,
    next_partition: AtomicU32,
    closed: AtomicBool,
    connection_closed: Arc<AtomicBool>,
}

impl ProducerCore {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return queue_error!(QueueError::Closed);
        }

        if self.connection_closed.load(Ordering::Acquire) {
            return queue_error!(QueueError::ConnectionLost);
        }

        Ok(())
    }

    fn partition(&self) -> u32 {
        match self.partitioner {
            Partitioner::Random => rand::thread_rng().gen_range(0..self.partitions),
            Partitioner::RoundRobin => self.next_partition.fetch_add(1, Ordering::Relaxed) % self.partitions,
        }
    }

    async fn publish(&self, payloads: Vec<Bytes>, delay: Option<Duration>) -> Result<()> {
        self.check_open()?;

        let records = payloads.into_iter().map(|p| (self.partition(), p)).collect();
        let (tx, rx) = oneshot::channel();

        let command = BrokerCommand::Publish {
            topic: self.topic.clone(),
            records,
            delay,
            result: tx,
        };

        if self.broker.send(command).await.is_err() {
            return queue_error!(QueueError::ConnectionLost);
        }

        if self.acks == Acks::None {
            return Ok(());
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => queue_error!(QueueError::ConnectionLost),
        }
    }
}

/// Producer of one topic. Batches and transactions are appended atomically.
pub struct MemoryProducer {
    core: Arc<ProducerCore>,
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn send(&self, payload: Bytes) -> Result<()> {
        self.core.publish(vec![payload], None).await
    }

    async fn send_batch(&self, payloads: Vec<Bytes>) -> Result<()> {
        self.core.publish(payloads, None).await
    }

    async fn close(&self) -> Result<()> {
        if !self.core.closed.swap(true, Ordering::AcqRel) {
            debug!("Producer of {} closed", self.core.topic);
        }

        Ok(())
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Deferred, Capability::Batch, Capability::Transactional]
    }

    fn as_deferred(&self) -> Option<&dyn DeferredProducer> {
        Some(self)
    }

    fn as_transactional(&self) -> Option<&dyn TransactionalProducer> {
        Some(self)
    }
}

#[async_trait]
impl DeferredProducer for MemoryProducer {
    async fn send_after(&self, delay: Duration, payload: Bytes) -> Result<()> {
        self.core.publish(vec![payload], Some(delay)).await
    }
}

#[async_trait]
impl TransactionalProducer for MemoryProducer {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.core.check_open()?;

        Ok(Box::new(MemoryTransaction {
            core: self.core.clone(),
            staged: vec![],
        }))
    }
}

/// Messages are staged in the client and appended in one request at commit.
struct MemoryTransaction {
    core: Arc<ProducerCore>,
    staged: Vec<Bytes>,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn send(&mut self, payload: Bytes) -> Result<()> {
        self.core.check_open()?;
        self.staged.push(payload);

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        trace!("Commit {} staged messages to {}", self.staged.len(), self.core.topic);

        if self.staged.is_empty() {
            return Ok(());
        }

        self.core.publish(self.staged, None).await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        trace!("Roll back {} staged messages of {}", self.staged.len(), self.core.topic);

        Ok(())
    }
}

/// Group member subscription. Every `setup` joins the group with a fresh event channel, so events
/// of a revoked generation are never mixed with the new ones.
pub struct MemorySubscription {
    broker: BrokerSink,
    identity: Identity,
    member_id: String,
    config: Config,
    events: Option<mpsc::UnboundedReceiver<Event>>,
    joined: bool,
    connection_closed: Arc<AtomicBool>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn setup(&mut self) -> Result<()> {
        if self.connection_closed.load(Ordering::Acquire) {
            return queue_error!(QueueError::ConnectionLost);
        }

        let (sink, stream) = mpsc::unbounded_channel();

        let cmd = JoinCommand {
            identity: self.identity.clone(),
            member_id: self.member_id.clone(),
            strategy: self.config.rebalance,
            initial_offset: self.config.initial_offset,
            sink,
        };

        self.events = None;

        let generation = broker::call(&self.broker, |tx| BrokerCommand::Join(cmd, tx)).await??;

        debug!("{} joined {:?} generation {}", self.member_id, self.identity, generation);

        self.events = Some(stream);
        self.joined = true;

        Ok(())
    }

    async fn recv(&mut self) -> Result<Message> {
        let events = match self.events.as_mut() {
            Some(events) => events,
            None => return Err(anyhow!("Subscription of {:?} is not set up", self.identity)),
        };

        match events.recv().await {
            Some(Event::Record(record)) => {
                let metadata = Metadata {
                    partition: Some(record.partition),
                    offset: Some(record.offset),
                    attempt: Some(record.attempt),
                    reply: None,
                };

                Ok(Message::new(
                    record.topic.clone(),
                    record.payload.clone(),
                    metadata,
                    record,
                ))
            }
            Some(Event::Revoked) => queue_error!(Interrupt::Rebalance),
            Some(Event::GroupClosed) => queue_error!(Interrupt::GroupClosed),
            None => queue_error!(QueueError::ConnectionLost),
        }
    }

    async fn commit(&mut self, message: &Message) -> Result<()> {
        let record = match message.native::<Record>() {
            Some(record) => record,
            None => return Err(anyhow!("Message {:?} wasn't delivered by the memory broker", message)),
        };

        let cmd = CommitCommand {
            identity: self.identity.clone(),
            member_id: self.member_id.clone(),
            partition: record.partition,
            offset: record.offset,
        };

        broker::call(&self.broker, |tx| BrokerCommand::Commit(cmd, tx)).await?
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.events = None;

        if !self.joined {
            return Ok(());
        }

        self.joined = false;

        let identity = self.identity.clone();
        let member_id = self.member_id.clone();

        broker::call(&self.broker, |tx| BrokerCommand::Leave(identity, member_id, tx)).await
    }
}
