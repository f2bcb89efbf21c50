//! Round trip on the in-process broker: a consumer is replaced by another one and survives a
//! rebalance of its group.

use anyhow::Result;
use log::info;
use omniq::memory::MemoryBroker;
use omniq::{Config, Queue};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    omniq::setup_logger();

    let config = Config::builder().partitions(3).build();
    let broker = MemoryBroker::start(&config);
    let queue = Queue::open(Arc::new(broker.connect(&config).await?), "orders", &config).await?;

    queue.multi_enqueue(["o1", "o2", "o3"]).await?;

    queue
        .dequeue("billing", |m| {
            info!("first handler got {:?}", m.value());
            true
        })
        .await?;

    tokio::time::sleep(Duration::from_millis(100)).await;

    queue
        .dequeue("billing", |m| {
            info!("second handler got {:?} attempt {:?}", m.value(), m.metadata().attempt);
            true
        })
        .await?;

    broker.rebalance("orders", "billing").await?;
    queue.enqueue("o4").await?;

    tokio::time::sleep(Duration::from_millis(100)).await;

    if let Some(status) = queue.session_status().await {
        info!("Session status {:?}", *status.borrow());
    }

    queue.close().await?;

    info!("Broker stats {:?}", broker.stats().await?);

    Ok(())
}
