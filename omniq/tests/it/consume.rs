use crate::helper::{self, Recorder};
use anyhow::Result;
use omniq::memory::MemoryBroker;
use omniq::SessionState;
use std::time::Duration;

async fn committed_total(broker: &MemoryBroker, topic: &str, group: &str) -> Result<u64> {
    let mut total = 0;

    for partition in 0..helper::config().partitions {
        total += broker.committed(topic, group, partition).await?.unwrap_or(0);
    }

    Ok(total)
}

#[tokio::test]
async fn acknowledged_messages_are_committed() -> Result<()> {
    let broker = MemoryBroker::start(&helper::config());
    let queue = helper::open(&broker, "orders").await?;
    let recorder = Recorder::default();

    queue.multi_enqueue(["o1", "o2", "o3", "o4"]).await?;
    queue.dequeue("billing", recorder.handler()).await?;

    recorder.wait_for(4).await;
    queue.close().await?;

    assert_eq!(committed_total(&broker, "orders", "billing").await?, 4);

    Ok(())
}

#[tokio::test]
async fn rejected_message_is_redelivered() -> Result<()> {
    let broker = MemoryBroker::start(&helper::config());
    let queue = helper::open(&broker, "orders").await?;
    let recorder = Recorder::default();

    queue.enqueue("o1").await?;
    queue.dequeue("billing", recorder.handler_with(false)).await?;

    recorder.wait_for(1).await;
    assert_eq!(committed_total(&broker, "orders", "billing").await?, 0);

    broker.rebalance("orders", "billing").await?;

    assert_eq!(recorder.wait_for(2).await, vec!["o1", "o1"]);

    queue.close().await?;

    Ok(())
}

#[tokio::test]
async fn delivery_resumes_after_rebalance() -> Result<()> {
    let broker = MemoryBroker::start(&helper::config());
    let queue = helper::open(&broker, "orders").await?;
    let recorder = Recorder::default();

    queue.enqueue("before").await?;
    queue.dequeue("billing", recorder.handler()).await?;
    recorder.wait_for(1).await;

    let mut status = queue.session_status().await.expect("No consumer session");
    assert_eq!(status.borrow().generation, 1);

    broker.rebalance("orders", "billing").await?;
    queue.enqueue("after").await?;

    assert_eq!(recorder.wait_for(2).await, vec!["before", "after"]);

    tokio::time::timeout(Duration::from_secs(1), status.wait_for(|s| s.generation == 2)).await??;

    broker.rebalance("orders", "billing").await?;
    tokio::time::timeout(Duration::from_secs(1), status.wait_for(|s| s.generation == 3)).await??;

    assert_eq!(recorder.seen(), vec!["before", "after"]);

    queue.close().await?;

    Ok(())
}

#[tokio::test]
async fn replaced_handler_is_never_called_again() -> Result<()> {
    let broker = MemoryBroker::start(&helper::config());
    let queue = helper::open(&broker, "orders").await?;
    let first = Recorder::default();
    let second = Recorder::default();

    queue.multi_enqueue(["o1", "o2"]).await?;

    queue.dequeue("billing", first.handler()).await?;
    queue.dequeue("billing", second.handler()).await?;

    let snapshot = first.seen();

    queue.multi_enqueue(["o3", "o4"]).await?;

    // the second handler gets whatever the first one didn't commit, and everything after
    let seen = second
        .wait_until(|seen| seen.iter().any(|m| m == "o3") && seen.iter().any(|m| m == "o4"))
        .await;

    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(first.seen(), snapshot);

    for m in ["o1", "o2"] {
        assert!(snapshot.iter().chain(seen.iter()).any(|s| s == m));
    }

    queue.close().await?;

    Ok(())
}

#[tokio::test]
async fn closed_group_stops_session() -> Result<()> {
    let broker = MemoryBroker::start(&helper::config());
    let queue = helper::open(&broker, "orders").await?;
    let recorder = Recorder::default();

    queue.dequeue("billing", recorder.handler()).await?;

    let mut status = queue.session_status().await.expect("No consumer session");

    broker.close_group("orders", "billing").await?;

    tokio::time::timeout(Duration::from_secs(1), status.wait_for(|s| s.state == SessionState::Stopped)).await??;

    // a closed group ended the session quietly
    queue.close().await?;

    Ok(())
}

#[tokio::test]
async fn closed_group_cannot_be_dequeued() -> Result<()> {
    let broker = MemoryBroker::start(&helper::config());
    let queue = helper::open(&broker, "orders").await?;

    queue.dequeue("billing", |_| true).await?;
    broker.close_group("orders", "billing").await?;

    let err = queue.dequeue("billing", |_| true).await;

    assert!(matches!(
        helper::to_queue_error(err),
        omniq::QueueError::SubscriptionSetup { .. }
    ));
    assert!(queue.session_status().await.is_none());

    queue.close().await?;

    Ok(())
}

#[tokio::test]
async fn groups_consume_independently() -> Result<()> {
    let broker = MemoryBroker::start(&helper::config());
    let producer = helper::open(&broker, "orders").await?;
    let billing = helper::open(&broker, "orders").await?;
    let shipping = helper::open(&broker, "orders").await?;
    let (b, s) = (Recorder::default(), Recorder::default());

    producer.enqueue("o1").await?;

    billing.dequeue("billing", b.handler()).await?;
    shipping.dequeue("shipping", s.handler()).await?;

    assert_eq!(b.wait_for(1).await, vec!["o1"]);
    assert_eq!(s.wait_for(1).await, vec!["o1"]);

    for q in [producer, billing, shipping] {
        q.close().await?;
    }

    Ok(())
}

#[tokio::test]
async fn panicking_handler_leaves_the_group() -> Result<()> {
    let broker = MemoryBroker::start(&helper::config());
    let queue = helper::open(&broker, "orders").await?;
    let recorder = Recorder::default();

    queue.enqueue("o0").await?;
    queue.dequeue("billing", |_| panic!("handler bug")).await?;

    let mut status = queue.session_status().await.expect("No consumer session");
    tokio::time::timeout(Duration::from_secs(1), status.wait_for(|s| s.state == SessionState::Stopped)).await??;

    assert_eq!(broker.stats().await?.leaves, 1);

    // the replacement owns every partition, including the ones of the panicked member
    queue.dequeue("billing", recorder.handler()).await?;

    let orders: Vec<String> = (1..=20).map(|i| format!("o{i}")).collect();
    queue.multi_enqueue(orders).await?;

    let seen = recorder.wait_for(21).await;
    assert!(seen.iter().any(|m| m == "o0"));

    queue.close().await?;

    Ok(())
}
