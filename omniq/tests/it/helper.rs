use anyhow::Result;
use omniq::memory::MemoryBroker;
use omniq::{Config, Message, Queue, QueueError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn config() -> Config {
    Config::builder()
        .partitions(2)
        .client_name("it")
        .retry_backoff(Duration::from_millis(10))
        .build()
}

/// Opens a queue of `topic` on a new connection of the broker.
pub async fn open(broker: &MemoryBroker, topic: &str) -> Result<Queue> {
    let config = config();
    let conn = broker.connect(&config).await?;

    Queue::open(Arc::new(conn), topic, &config).await
}

/// Payloads a handler has seen, in the order of delivery.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    /// A handler which records the payloads and acknowledges them.
    pub fn handler(&self) -> impl FnMut(&Message) -> bool + Send + 'static {
        self.handler_with(true)
    }

    pub fn handler_with(&self, ack: bool) -> impl FnMut(&Message) -> bool + Send + 'static {
        let seen = self.seen.clone();

        move |m| {
            seen.lock().unwrap().push(String::from_utf8_lossy(m.value()).to_string());

            ack
        }
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    pub async fn wait_for(&self, n: usize) -> Vec<String> {
        self.wait_until(|seen| seen.len() >= n).await
    }

    pub async fn wait_until(&self, done: impl Fn(&[String]) -> bool) -> Vec<String> {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !done(&self.seen()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("Timeout waiting for deliveries");

        self.seen()
    }
}

#[allow(dead_code)]
pub(crate) fn to_queue_error<T: std::fmt::Debug>(result: Result<T>) -> QueueError {
    omniq::queue_error(&result.unwrap_err()).cloned().unwrap()
}
