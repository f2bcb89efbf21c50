//! NATS backend of the omniq queue facade.
//!
//! Topics are subjects and consumer groups are queue groups, so every message is delivered to one
//! member of each group. Core NATS has no acknowledgements, committing is a no-op, and there is no
//! delayed or transactional publishing.
//!
//! ```no_run
//! use omniq::{Config, Queue};
//! use std::sync::Arc;
//!
//! async fn run() -> anyhow::Result<()> {
//!     let config = Config::builder().brokers(["nats://127.0.0.1:4222"]).build();
//!     let conn = omniq_nats::connect(&config).await?;
//!     let queue = Queue::open(Arc::new(conn), "orders", &config).await?;
//!
//!     queue.enqueue("hello").await?;
//!     queue.close().await
//! }
//! ```

mod producer;
mod subscription;

pub use producer::NatsProducer;
pub use subscription::NatsSubscription;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use omniq::config::Credentials;
use omniq::{queue_error, Backend, Config, Identity, Producer, QueueError, Subscription};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const DEFAULT_PORT: u16 = 4222;

/// Normalizes a broker address to a NATS url, `host:port` gets the `nats` scheme.
pub fn broker_url(address: &str) -> Result<String> {
    let address = address.trim();
    let with_scheme = if address.contains("://") {
        address.to_string()
    } else {
        format!("nats://{address}")
    };

    let url = url::Url::parse(&with_scheme).with_context(|| format!("Invalid broker address {address}"))?;

    match url.scheme() {
        "nats" | "tls" => (),
        other => return Err(anyhow!("Unsupported scheme {other} in {address}")),
    }

    let host = match url.host_str() {
        Some(host) if !host.is_empty() => host,
        _ => return Err(anyhow!("Missing host in broker address {address}")),
    };

    Ok(format!(
        "{}://{}:{}",
        url.scheme(),
        host,
        url.port().unwrap_or(DEFAULT_PORT)
    ))
}

/// Connects to the first broker of the config.
pub async fn connect(config: &Config) -> Result<NatsConnection> {
    let address = match config.brokers.first() {
        Some(address) => broker_url(address)?,
        None => return Err(anyhow!("No broker address in config")),
    };

    let options = match &config.credentials {
        Some(Credentials::UserPass { username, password }) => nats::asynk::Options::with_user_pass(username, password),
        Some(Credentials::Token { token }) => nats::asynk::Options::with_token(token),
        None => nats::asynk::Options::new(),
    };

    let options = match &config.client_name {
        Some(name) => options.with_name(name),
        None => options,
    };

    let conn = options
        .connect(address.as_str())
        .await
        .with_context(|| format!("Cannot connect to {address}"))
        .context(QueueError::ConnectionLost)?;

    info!("Connected to NATS server {}", address);

    Ok(NatsConnection {
        conn,
        address,
        closed: Arc::new(AtomicBool::new(false)),
    })
}

/// An open NATS connection, the [`Backend`] of a queue.
pub struct NatsConnection {
    conn: nats::asynk::Connection,
    address: String,
    closed: Arc<AtomicBool>,
}

impl NatsConnection {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return queue_error!(QueueError::ConnectionLost);
        }

        Ok(())
    }
}

#[async_trait]
impl Backend for NatsConnection {
    fn name(&self) -> &'static str {
        "nats"
    }

    async fn producer(&self, topic: &str) -> Result<Box<dyn Producer>> {
        self.check_open()?;

        Ok(Box::new(NatsProducer::new(
            self.conn.clone(),
            topic,
            self.closed.clone(),
        )))
    }

    async fn subscribe(&self, identity: &Identity) -> Result<Box<dyn Subscription>> {
        self.check_open()?;

        Ok(Box::new(NatsSubscription::new(self.conn.clone(), identity.clone())))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        debug!("Closing connection to {}", self.address);

        self.conn.close().await.context(QueueError::ConnectionLost)
    }
}
