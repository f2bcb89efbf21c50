use crate::helper::{self, Recorder};
use anyhow::Result;
use futures::future::join_all;
use omniq::memory::MemoryBroker;
use omniq::SessionState;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn concurrent_dequeues_leave_one_session() -> Result<()> {
    let broker = MemoryBroker::start(&helper::config());
    let queue = helper::open(&broker, "jobs").await?;
    let recorders: Vec<Recorder> = (0..5).map(|_| Recorder::default()).collect();

    let results = join_all(recorders.iter().map(|r| queue.dequeue("workers", r.handler()))).await;

    for result in results {
        result?;
    }

    let stats = broker.stats().await?;
    assert_eq!(stats.joins, 5);
    assert_eq!(stats.leaves, 4);

    let status = queue.session_status().await.expect("No consumer session");
    assert_eq!(status.borrow().state, SessionState::Delivering);

    queue.enqueue("job").await?;

    let total = || recorders.iter().map(|r| r.seen().len()).sum::<usize>();

    tokio::time::timeout(Duration::from_secs(1), async {
        while total() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(total(), 1);

    queue.close().await?;
    assert_eq!(broker.stats().await?.leaves, 5);

    Ok(())
}

#[tokio::test]
async fn close_twice() -> Result<()> {
    let broker = MemoryBroker::start(&helper::config());
    let queue = helper::open(&broker, "jobs").await?;

    queue.dequeue("workers", |_| true).await?;

    queue.close().await?;
    queue.close().await?;

    let stats = broker.stats().await?;
    assert_eq!(stats.disconnects, 1);
    assert_eq!(stats.leaves, 1);

    Ok(())
}

#[tokio::test]
async fn no_delivery_after_close() -> Result<()> {
    let broker = MemoryBroker::start(&helper::config());
    let producer = helper::open(&broker, "jobs").await?;
    let queue = helper::open(&broker, "jobs").await?;
    let handled = Arc::new(AtomicUsize::new(0));

    let jobs: Vec<String> = (0..200).map(|i| format!("job-{i}")).collect();
    producer.multi_enqueue(jobs).await?;

    let h = handled.clone();
    queue
        .dequeue("workers", move |_| {
            std::thread::sleep(Duration::from_millis(1));
            h.fetch_add(1, Ordering::SeqCst);

            true
        })
        .await?;

    while handled.load(Ordering::SeqCst) < 5 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    queue.close().await?;

    let at_close = handled.load(Ordering::SeqCst);
    assert!(at_close < 200);

    producer.enqueue("late").await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(handled.load(Ordering::SeqCst), at_close);

    producer.close().await?;

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_waits_for_running_handler() -> Result<()> {
    let broker = MemoryBroker::start(&helper::config());
    let queue = helper::open(&broker, "jobs").await?;
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));

    let (s, f) = (started.clone(), finished.clone());
    queue
        .dequeue("workers", move |_| {
            s.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
            f.store(true, Ordering::SeqCst);

            true
        })
        .await?;

    queue.enqueue("slow").await?;

    while !started.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    assert!(!finished.load(Ordering::SeqCst));

    queue.close().await?;

    assert!(finished.load(Ordering::SeqCst));

    Ok(())
}

#[tokio::test]
async fn session_is_stopped_after_close() -> Result<()> {
    let broker = MemoryBroker::start(&helper::config());
    let queue = helper::open(&broker, "jobs").await?;

    assert!(queue.session_status().await.is_none());

    queue.dequeue("workers", |_| true).await?;

    let status = queue.session_status().await.expect("No consumer session");
    assert_eq!(status.borrow().generation, 1);

    queue.close().await?;

    assert_eq!(status.borrow().state, SessionState::Stopped);
    assert!(queue.session_status().await.is_none());

    Ok(())
}

/// Handler which sleeps on every message, with flags telling whether a call started and finished.
fn slow_handler(
    started: &Arc<AtomicBool>,
    finished: &Arc<AtomicBool>,
) -> impl FnMut(&omniq::Message) -> bool + Send + 'static {
    let (s, f) = (started.clone(), finished.clone());

    move |_| {
        s.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(300));
        f.store(true, Ordering::SeqCst);

        true
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timed_out_close_still_closes_connection() -> Result<()> {
    let broker = MemoryBroker::start(&helper::config());
    let queue = helper::open(&broker, "jobs").await?;
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));

    queue.dequeue("workers", slow_handler(&started, &finished)).await?;
    queue.enqueue("slow").await?;

    while !started.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    assert!(tokio::time::timeout(Duration::from_millis(50), queue.close()).await.is_err());

    queue.close().await?;

    assert!(finished.load(Ordering::SeqCst));

    let stats = broker.stats().await?;
    assert_eq!(stats.disconnects, 1);
    assert_eq!(stats.leaves, 1);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timed_out_dequeue_keeps_sessions_apart() -> Result<()> {
    let broker = MemoryBroker::start(&helper::config());
    let queue = helper::open(&broker, "jobs").await?;
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let recorder = Recorder::default();

    queue.dequeue("workers", slow_handler(&started, &finished)).await?;
    queue.enqueue("slow").await?;

    while !started.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let replacing = queue.dequeue("workers", recorder.handler());
    assert!(tokio::time::timeout(Duration::from_millis(50), replacing).await.is_err());

    // the stopping session is still in place, the next dequeue waits until it has stopped
    queue.dequeue("workers", recorder.handler()).await?;

    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(broker.stats().await?.leaves, 1);

    queue.enqueue("fast").await?;
    recorder.wait_until(|seen| seen.iter().any(|m| m == "fast")).await;

    queue.close().await?;

    Ok(())
}
