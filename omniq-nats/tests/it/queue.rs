use super::helper;
use anyhow::Result;
use omniq::{queue_error, Capability, QueueError};
use std::time::Duration;

#[tokio::test]
async fn enqueue_dequeue() -> Result<()> {
    let topic = helper::subject("orders");
    let queue = helper::open(&topic).await?;
    let (seen, handler) = helper::recorder();

    queue.dequeue("billing", handler).await?;
    queue.enqueue("hello").await?;
    queue.multi_enqueue(["a", "b"]).await?;

    assert_eq!(helper::wait_for(&seen, 3).await, vec!["hello", "a", "b"]);

    queue.close().await?;
    queue.close().await?;

    Ok(())
}

#[tokio::test]
async fn queue_group_shares_messages() -> Result<()> {
    let topic = helper::subject("jobs");
    let q1 = helper::open(&topic).await?;
    let q2 = helper::open(&topic).await?;
    let (seen1, h1) = helper::recorder();
    let (seen2, h2) = helper::recorder();

    q1.dequeue("workers", h1).await?;
    q2.dequeue("workers", h2).await?;

    let jobs: Vec<String> = (0..20).map(|i| format!("job-{i}")).collect();
    q1.multi_enqueue(jobs).await?;

    tokio::time::sleep(Duration::from_millis(200)).await;

    let total = seen1.lock().unwrap().len() + seen2.lock().unwrap().len();
    assert_eq!(total, 20);

    q1.close().await?;
    q2.close().await?;

    Ok(())
}

#[tokio::test]
async fn optional_capabilities_are_missing() -> Result<()> {
    let queue = helper::open(&helper::subject("misc")).await?;

    assert!(!queue.supports(Capability::Deferred).await);

    let err = queue.deferred_enqueue(Duration::from_secs(1), "x").await.unwrap_err();
    assert_eq!(queue_error(&err), Some(&QueueError::Unsupported(Capability::Deferred)));

    queue.close().await?;

    let err = queue.enqueue("x").await.unwrap_err();
    assert_eq!(queue_error(&err), Some(&QueueError::Closed));

    Ok(())
}
