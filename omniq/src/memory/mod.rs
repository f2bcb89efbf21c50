//! In-process broker with partitioned topics and consumer groups.
//!
//! It behaves like a small Kafka: producers choose partitions, groups share the partitions of a
//! topic among their members, commits are per partition offsets, and every membership change
//! revokes the claims of all members so they have to rejoin. Records which were not committed
//! before a rejoin are delivered again.
//!
//! Besides being a backend it has hooks to inject rebalances and to tear down groups.

mod broker;
mod connection;
mod group;


pub use broker::{Record, Stats};
pub use connection::{MemoryConnection, MemoryProducer, MemorySubscription};

use crate::backend::Identity;
use crate::config::Config;
use anyhow::Result;
use broker::{BrokerCommand, BrokerSink};

/// Handle of a running memory broker. Clones refer to the same broker, it stops when the last
/// handle and connection is dropped.
#[derive(Clone)]
pub struct MemoryBroker {
    sink: BrokerSink,
}

impl MemoryBroker {
    /// Spawns the broker task, topics get `config.partitions` partitions. Needs a tokio runtime.
    pub fn start(config: &Config) -> Self {
        MemoryBroker {
            sink: broker::start(config.partitions),
        }
    }

    pub async fn connect(&self, config: &Config) -> Result<MemoryConnection> {
        MemoryConnection::open(self.sink.clone(), config).await
    }

    /// Revokes the claims of every member of the group, they need to rejoin.
    pub async fn rebalance(&self, topic: &str, group: &str) -> Result<()> {
        let identity = Identity::new(topic, group);

        broker::call(&self.sink, |tx| BrokerCommand::Rebalance(identity, tx)).await
    }

    /// Tears down the group, its members stop and it cannot be joined any more.
    pub async fn close_group(&self, topic: &str, group: &str) -> Result<()> {
        let identity = Identity::new(topic, group);

        broker::call(&self.sink, |tx| BrokerCommand::CloseGroup(identity, tx)).await
    }

    /// The next offset the group will read from the partition, `None` if it hasn't committed yet.
    pub async fn committed(&self, topic: &str, group: &str, partition: u32) -> Result<Option<u64>> {
        let identity = Identity::new(topic, group);

        broker::call(&self.sink, |tx| BrokerCommand::Committed(identity, partition, tx)).await
    }

    pub async fn stats(&self) -> Result<Stats> {
        broker::call(&self.sink, BrokerCommand::Stats).await
    }
}
