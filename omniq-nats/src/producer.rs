use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, trace};
use omniq::{queue_error, Producer, QueueError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Publishes to the subject of the topic. A send returns after the server processed it (flush
/// round trip), multiple messages are sent one by one.
pub struct NatsProducer {
    conn: nats::asynk::Connection,
    subject: String,
    closed: AtomicBool,
    connection_closed: Arc<AtomicBool>,
}

impl NatsProducer {
    pub(crate) fn new(conn: nats::asynk::Connection, subject: &str, connection_closed: Arc<AtomicBool>) -> Self {
        NatsProducer {
            conn,
            subject: subject.to_string(),
            closed: AtomicBool::new(false),
            connection_closed,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return queue_error!(QueueError::Closed);
        }

        if self.connection_closed.load(Ordering::Acquire) {
            return queue_error!(QueueError::ConnectionLost);
        }

        Ok(())
    }

    fn send_error(&self) -> QueueError {
        QueueError::Send {
            topic: self.subject.clone(),
        }
    }
}

#[async_trait]
impl Producer for NatsProducer {
    async fn send(&self, payload: Bytes) -> Result<()> {
        self.check_open()?;

        trace!("Publish {} bytes to {}", payload.len(), self.subject);

        self.conn
            .publish(&self.subject, &payload)
            .await
            .with_context(|| self.send_error())?;

        self.conn.flush().await.with_context(|| self.send_error())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Producer of {} closed", self.subject);
        }

        Ok(())
    }
}
