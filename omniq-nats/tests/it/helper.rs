use anyhow::Result;
use omniq::{Config, Message, Queue};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn config() -> Config {
    Config::builder()
        .brokers(["nats://127.0.0.1:4222"])
        .client_name("omniq-it")
        .build()
}

pub async fn open(topic: &str) -> Result<Queue> {
    let config = config();
    let conn = omniq_nats::connect(&config).await?;

    Queue::open(Arc::new(conn), topic, &config).await
}

/// Returns a unique subject, so parallel test runs don't see each other's messages.
pub fn subject(prefix: &str) -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();

    format!("{prefix}.{nanos}")
}

pub fn recorder() -> (Arc<Mutex<Vec<String>>>, impl FnMut(&Message) -> bool + Send + 'static) {
    let seen = Arc::new(Mutex::new(vec![]));
    let s = seen.clone();

    let handler = move |m: &Message| {
        s.lock().unwrap().push(String::from_utf8_lossy(m.value()).to_string());

        true
    };

    (seen, handler)
}

pub async fn wait_for(seen: &Arc<Mutex<Vec<String>>>, n: usize) -> Vec<String> {
    tokio::time::timeout(Duration::from_secs(2), async {
        while seen.lock().unwrap().len() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Timeout waiting for deliveries");

    seen.lock().unwrap().clone()
}
