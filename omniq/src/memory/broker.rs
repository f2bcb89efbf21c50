use crate::backend::Identity;
use crate::config::{InitialOffset, RebalanceStrategy};
use crate::error::{Interrupt, QueueError};
use crate::memory::group::{EventSink, Group};
use anyhow::Result;
use bytes::Bytes;
use log::{debug, error, trace};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

// Broker task
//   handles:
//     - topic metadata (auto-creates topics)
//     - publish records, immediately or after a delay
//     - consumer groups: join, leave, commit, injected rebalance, group close
//     - connection bookkeeping and counters for the tests

/// A record of a topic partition as it is delivered to a group member.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub payload: Bytes,
    /// Number of deliveries to the group so far, this one included.
    pub attempt: u32,
}

/// Events pushed to a group member.
#[derive(Debug)]
pub(crate) enum Event {
    Record(Record),
    Revoked,
    GroupClosed,
}

/// Counters of broker requests.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Stats {
    /// Connections open right now.
    pub open: u64,
    pub connections: u64,
    pub disconnects: u64,
    pub publishes: u64,
    pub records: u64,
    pub joins: u64,
    pub leaves: u64,
}

#[derive(Debug)]
pub(crate) struct JoinCommand {
    pub(crate) identity: Identity,
    pub(crate) member_id: String,
    pub(crate) strategy: RebalanceStrategy,
    pub(crate) initial_offset: InitialOffset,
    pub(crate) sink: EventSink,
}

#[derive(Debug)]
pub(crate) struct CommitCommand {
    pub(crate) identity: Identity,
    pub(crate) member_id: String,
    pub(crate) partition: u32,
    pub(crate) offset: u64,
}

#[derive(Debug)]
pub(crate) enum BrokerCommand {
    Connect(oneshot::Sender<u64>),
    Disconnect(u64, oneshot::Sender<Result<()>>),
    Metadata(String, oneshot::Sender<u32>),
    Publish {
        topic: String,
        records: Vec<(u32, Bytes)>,
        delay: Option<Duration>,
        result: oneshot::Sender<Result<()>>,
    },
    /// A delayed publish whose time has come.
    Release {
        topic: String,
        records: Vec<(u32, Bytes)>,
    },
    Join(JoinCommand, oneshot::Sender<Result<u64>>),
    Commit(CommitCommand, oneshot::Sender<Result<()>>),
    Leave(Identity, String, oneshot::Sender<()>),
    Rebalance(Identity, oneshot::Sender<()>),
    CloseGroup(Identity, oneshot::Sender<()>),
    Committed(Identity, u32, oneshot::Sender<Option<u64>>),
    Stats(oneshot::Sender<Stats>),
}

pub(crate) type BrokerSink = mpsc::Sender<BrokerCommand>;

pub(crate) fn start(partitions: u32) -> BrokerSink {
    let (sink, stream) = mpsc::channel(64);
    let weak = sink.downgrade();

    tokio::spawn(async move {
        let mut broker = BrokerState {
            command_stream: stream,
            self_sink: weak,
            partitions: partitions.max(1),
            topics: HashMap::new(),
            groups: HashMap::new(),
            next_connection: 1,
            open_connections: HashSet::new(),
            stats: Stats::default(),
        };

        broker.command_loop().await;

        debug!("Memory broker stopped");
    });

    sink
}

fn lost<T>(_: T) -> anyhow::Error {
    anyhow::Error::new(QueueError::ConnectionLost)
}

/// Sends a command built around a reply channel and waits for the reply.
pub(crate) async fn call<T>(
    broker: &BrokerSink,
    command: impl FnOnce(oneshot::Sender<T>) -> BrokerCommand,
) -> Result<T> {
    let (tx, rx) = oneshot::channel();

    broker.send(command(tx)).await.map_err(lost)?;

    rx.await.map_err(lost)
}

struct BrokerState {
    command_stream: mpsc::Receiver<BrokerCommand>,
    self_sink: mpsc::WeakSender<BrokerCommand>,
    partitions: u32,
    topics: HashMap<String, Vec<Vec<Bytes>>>,
    groups: HashMap<Identity, Group>,
    next_connection: u64,
    open_connections: HashSet<u64>,
    stats: Stats,
}

impl BrokerState {
    async fn command_loop(&mut self) {
        while let Some(command) = self.command_stream.recv().await {
            trace!("Broker command {:?}", command);

            match command {
                BrokerCommand::Connect(tx) => {
                    let id = self.next_connection;

                    self.next_connection += 1;
                    self.open_connections.insert(id);
                    self.stats.connections += 1;

                    let _ = tx.send(id);
                }
                BrokerCommand::Disconnect(id, tx) => {
                    let _ = tx.send(self.handle_disconnect(id));
                }
                BrokerCommand::Metadata(topic, tx) => {
                    let _ = tx.send(self.topic_log(&topic).len() as u32);
                }
                BrokerCommand::Publish {
                    topic,
                    records,
                    delay,
                    result,
                } => {
                    self.stats.publishes += 1;

                    let _ = result.send(self.handle_publish(topic, records, delay));
                }
                BrokerCommand::Release { topic, records } => {
                    self.append(&topic, records);
                }
                BrokerCommand::Join(cmd, tx) => {
                    let _ = tx.send(self.handle_join(cmd));
                }
                BrokerCommand::Commit(cmd, tx) => {
                    let _ = tx.send(self.handle_commit(cmd));
                }
                BrokerCommand::Leave(identity, member_id, tx) => {
                    self.handle_leave(&identity, &member_id);

                    let _ = tx.send(());
                }
                BrokerCommand::Rebalance(identity, tx) => {
                    let partitions = self.topic_log(&identity.topic).len() as u32;

                    if let Some(group) = self.groups.get_mut(&identity) {
                        group.rebalance(partitions);
                    }

                    let _ = tx.send(());
                }
                BrokerCommand::CloseGroup(identity, tx) => {
                    if let Some(group) = self.groups.get_mut(&identity) {
                        group.close();
                    }

                    let _ = tx.send(());
                }
                BrokerCommand::Committed(identity, partition, tx) => {
                    let _ = tx.send(self.groups.get(&identity).and_then(|g| g.committed(partition)));
                }
                BrokerCommand::Stats(tx) => {
                    let stats = Stats {
                        open: self.open_connections.len() as u64,
                        ..self.stats.clone()
                    };

                    let _ = tx.send(stats);
                }
            }
        }
    }

    fn topic_log(&mut self, topic: &str) -> &mut Vec<Vec<Bytes>> {
        let partitions = self.partitions as usize;

        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![vec![]; partitions])
    }

    fn handle_disconnect(&mut self, id: u64) -> Result<()> {
        if !self.open_connections.remove(&id) {
            return crate::queue_error!(QueueError::ConnectionLost);
        }

        self.stats.disconnects += 1;

        Ok(())
    }

    fn handle_publish(&mut self, topic: String, records: Vec<(u32, Bytes)>, delay: Option<Duration>) -> Result<()> {
        let partitions = self.topic_log(&topic).len() as u32;

        if let Some((p, _)) = records.iter().find(|(p, _)| *p >= partitions) {
            let err = anyhow::anyhow!("Topic {} has no partition {}", topic, p);

            return Err(err.context(QueueError::Send { topic: topic.clone() }));
        }

        match delay {
            Some(delay) if !delay.is_zero() => {
                let sink = self.self_sink.clone();

                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;

                    if let Some(sink) = sink.upgrade() {
                        if sink.send(BrokerCommand::Release { topic, records }).await.is_err() {
                            error!("Broker stopped before releasing deferred records");
                        }
                    }
                });
            }
            _ => self.append(&topic, records),
        }

        Ok(())
    }

    /// Appends the records atomically and pushes them to the groups of the topic.
    fn append(&mut self, topic: &str, records: Vec<(u32, Bytes)>) {
        self.stats.records += records.len() as u64;

        let mut touched = vec![];
        let log = self.topic_log(topic);

        for (partition, payload) in records {
            if let Some(l) = log.get_mut(partition as usize) {
                l.push(payload);

                if !touched.contains(&partition) {
                    touched.push(partition);
                }
            }
        }

        let log = match self.topics.get(topic) {
            Some(log) => log,
            None => return,
        };

        for (identity, group) in self.groups.iter_mut() {
            if identity.topic == topic {
                for p in &touched {
                    group.push_partition(*p, log);
                }
            }
        }
    }

    fn handle_join(&mut self, cmd: JoinCommand) -> Result<u64> {
        self.topic_log(&cmd.identity.topic);

        let log = match self.topics.get(&cmd.identity.topic) {
            Some(log) => log,
            None => return crate::queue_error!(QueueError::ConnectionLost),
        };

        let group = self
            .groups
            .entry(cmd.identity.clone())
            .or_insert_with(|| Group::new(&cmd.identity.topic, cmd.strategy, cmd.initial_offset));

        if group.closed {
            return crate::queue_error!(Interrupt::GroupClosed);
        }

        let (generation, _) = group.join(&cmd.member_id, cmd.sink, log);

        self.stats.joins += 1;

        Ok(generation)
    }

    fn handle_commit(&mut self, cmd: CommitCommand) -> Result<()> {
        match self.groups.get_mut(&cmd.identity) {
            Some(group) if group.closed => crate::queue_error!(Interrupt::GroupClosed),
            Some(group) if group.is_member(&cmd.member_id) => {
                group.commit(cmd.partition, cmd.offset);

                Ok(())
            }
            _ => crate::queue_error!(Interrupt::Rebalance),
        }
    }

    fn handle_leave(&mut self, identity: &Identity, member_id: &str) {
        let partitions = self.topic_log(&identity.topic).len() as u32;

        if let Some(group) = self.groups.get_mut(identity) {
            if group.leave(member_id, partitions) {
                self.stats.leaves += 1;
            }
        }
    }
}
