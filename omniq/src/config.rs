//! Connection configuration shared by the backends.
//!
//! A `Config` is a plain value passed at construction. Defaults are applied by [`ConfigBuilder`]
//! or by serde when a field is missing from a TOML file, there is no mutable global default.

use anyhow::Result;
use serde_derive::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Acknowledgement level the broker should reach before a send is confirmed.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Acks {
    /// Fire and forget.
    None,
    /// The partition leader stored the message.
    Leader,
    /// All in-sync replicas stored the message.
    #[default]
    All,
}

/// How a producer chooses the partition of a message.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Partitioner {
    #[default]
    Random,
    RoundRobin,
}

/// How a consumer group distributes partitions among its members.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceStrategy {
    #[default]
    RoundRobin,
    Range,
}

/// Where a consumer group without committed offsets starts reading.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum InitialOffset {
    #[default]
    Oldest,
    Newest,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Credentials {
    UserPass { username: String, password: String },
    Token { token: String },
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub brokers: Vec<String>,
    pub acks: Acks,
    pub partitioner: Partitioner,
    pub rebalance: RebalanceStrategy,
    pub initial_offset: InitialOffset,
    pub credentials: Option<Credentials>,
    pub client_name: Option<String>,
    /// Pause between two subscription attempts while a group is rebalancing.
    pub retry_backoff_ms: u64,
    /// Number of partitions of the topics the memory backend creates on first use.
    pub partitions: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            brokers: vec!["127.0.0.1:9092".to_string()],
            acks: Acks::default(),
            partitioner: Partitioner::default(),
            rebalance: RebalanceStrategy::default(),
            initial_offset: InitialOffset::default(),
            credentials: None,
            client_name: None,
            retry_backoff_ms: 100,
            partitions: 1,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn from_toml(text: &str) -> Result<Config> {
        Ok(toml::from_str(text)?)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Reads a TOML config file. Missing fields get their default values.
pub fn parse_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let cfg = std::fs::read_to_string(path)?;

    Config::from_toml(&cfg)
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn brokers<I, S>(mut self, brokers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.brokers = brokers.into_iter().map(Into::into).collect();
        self
    }

    pub fn acks(mut self, value: Acks) -> Self {
        self.config.acks = value;
        self
    }

    pub fn partitioner(mut self, value: Partitioner) -> Self {
        self.config.partitioner = value;
        self
    }

    pub fn rebalance(mut self, value: RebalanceStrategy) -> Self {
        self.config.rebalance = value;
        self
    }

    pub fn initial_offset(mut self, value: InitialOffset) -> Self {
        self.config.initial_offset = value;
        self
    }

    pub fn user_pass(mut self, username: &str, password: &str) -> Self {
        self.config.credentials = Some(Credentials::UserPass {
            username: username.to_string(),
            password: password.to_string(),
        });
        self
    }

    pub fn token(mut self, token: &str) -> Self {
        self.config.credentials = Some(Credentials::Token {
            token: token.to_string(),
        });
        self
    }

    pub fn client_name(mut self, name: &str) -> Self {
        self.config.client_name = Some(name.to_string());
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.config.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Partition count of auto-created topics, at least one.
    pub fn partitions(mut self, count: u32) -> Self {
        self.config.partitions = count.max(1);
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
