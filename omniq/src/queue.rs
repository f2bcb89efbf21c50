//! The queue facade: a producer and at most one consumer session over one broker connection.


use crate::backend::{Backend, Capability, Identity, Producer, Transaction};
use crate::config::Config;
use crate::error::QueueError;
use crate::message::Message;
use crate::queue_error;
use crate::session::{setup_context, Session, SessionStatus};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// A queue bound to one topic of one broker.
///
/// All operations are serialized by one lock, so replacing the consumer session, closing and
/// sending never interleave. Dropping the queue without [`Queue::close`] cancels the consumer
/// worker but doesn't close the connection.
///
/// The operations can be abandoned, e.g. under `tokio::time::timeout`. A consumer session being
/// stopped stays in place until it has stopped, so the next call waits for it, and a started
/// close runs to the end in its own task.
pub struct Queue {
    topic: String,
    retry_backoff: Duration,
    inner: Mutex<Inner>,
}

struct Inner {
    lifecycle: Lifecycle,
    backend: Arc<dyn Backend>,
    producer: Arc<dyn Producer>,
    session: Option<Session>,
}

enum Lifecycle {
    Open,
    Closing(JoinHandle<Result<()>>),
    Closed,
}

impl Inner {
    fn is_closed(&self) -> bool {
        !matches!(self.lifecycle, Lifecycle::Open)
    }

    /// Stops the consumer session, if any. The session is removed only after it has stopped.
    async fn stop_session(&mut self) -> Result<()> {
        let result = match self.session.as_mut() {
            Some(session) => session.stop().await,
            None => return Ok(()),
        };

        self.session = None;

        result
    }
}

impl Queue {
    /// Creates the producer of `topic` on the connection. The queue owns the connection from now
    /// on and closes it in [`Queue::close`].
    pub async fn open(backend: Arc<dyn Backend>, topic: &str, config: &Config) -> Result<Queue> {
        let producer = backend.producer(topic).await?;

        info!("Queue of topic {} opened on {} backend", topic, backend.name());

        Ok(Queue {
            topic: topic.to_string(),
            retry_backoff: config.retry_backoff(),
            inner: Mutex::new(Inner {
                lifecycle: Lifecycle::Open,
                backend,
                producer: Arc::from(producer),
                session: None,
            }),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn enqueue(&self, payload: impl Into<Bytes>) -> Result<()> {
        let inner = self.inner.lock().await;

        if inner.is_closed() {
            return queue_error!(QueueError::Closed);
        }

        inner.producer.send(payload.into()).await
    }

    /// Sends the payloads in order. Unless the backend supports [`Capability::Batch`], messages
    /// before a failing one stay sent.
    pub async fn multi_enqueue<I, B>(&self, payloads: I) -> Result<()>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let payloads: Vec<Bytes> = payloads.into_iter().map(Into::into).collect();
        let inner = self.inner.lock().await;

        if inner.is_closed() {
            return queue_error!(QueueError::Closed);
        }

        if payloads.is_empty() {
            return Ok(());
        }

        inner.producer.send_batch(payloads).await
    }

    /// Delivers the payload to the consumers after `delay`. Fails with
    /// [`QueueError::Unsupported`] on backends without delayed delivery.
    pub async fn deferred_enqueue(&self, delay: Duration, payload: impl Into<Bytes>) -> Result<()> {
        let inner = self.inner.lock().await;

        if inner.is_closed() {
            return queue_error!(QueueError::Closed);
        }

        match inner.producer.as_deferred() {
            Some(deferred) => deferred.send_after(delay, payload.into()).await,
            None => queue_error!(QueueError::Unsupported(Capability::Deferred)),
        }
    }

    /// Sends the payloads in one transaction: consumers see all of them or none.
    pub async fn transactional_enqueue<I, B>(&self, payloads: I) -> Result<()>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let inner = self.inner.lock().await;

        if inner.is_closed() {
            return queue_error!(QueueError::Closed);
        }

        let producer = match inner.producer.as_transactional() {
            Some(producer) => producer,
            None => return queue_error!(QueueError::Unsupported(Capability::Transactional)),
        };

        let mut tx = producer.begin().await?;

        for payload in payloads {
            if let Err(e) = tx.send(payload.into()).await {
                rollback(tx).await;

                return Err(e);
            }
        }

        tx.commit().await
    }

    pub async fn supports(&self, capability: Capability) -> bool {
        let inner = self.inner.lock().await;

        inner.producer.capabilities().contains(&capability)
    }

    /// Starts consuming the topic as member of `group`, calling `handler` for every message.
    ///
    /// An active consumer session is stopped first, and its handler is never called again. The
    /// call returns when the new subscription is ready. If the backend rejects the subscription,
    /// the error is returned and the queue stays without consumer.
    pub async fn dequeue<F>(&self, group: &str, handler: F) -> Result<()>
    where
        F: FnMut(&Message) -> bool + Send + 'static,
    {
        let mut inner = self.inner.lock().await;

        if inner.is_closed() {
            return queue_error!(QueueError::Closed);
        }

        if let Some(session) = &inner.session {
            debug!("Replacing consumer session of {:?}", session.identity());
        }

        if let Err(e) = inner.stop_session().await {
            warn!("Replaced consumer session ended with error {:?}", e);
        }

        let identity = Identity::new(&self.topic, group);
        let subscription = match inner.backend.subscribe(&identity).await {
            Ok(subscription) => subscription,
            Err(e) => return Err(setup_context(&identity, e)),
        };

        let session = inner.session.insert(Session::spawn(
            identity,
            subscription,
            Box::new(handler),
            self.retry_backoff,
        ));

        // an abandoned call leaves a cancelled session behind, the next call collects it
        let abandoned = session.cancel_on_drop();
        let ready = session.ready().await;
        abandoned.disarm();

        if let Err(e) = ready {
            if let Err(stop_err) = inner.stop_session().await {
                warn!("Error while stopping failed subscription {:?}", stop_err);
            }

            return Err(e);
        }

        Ok(())
    }

    /// Observes the lifecycle of the active consumer session, `None` if there is none.
    pub async fn session_status(&self) -> Option<watch::Receiver<SessionStatus>> {
        let inner = self.inner.lock().await;

        inner.session.as_ref().map(Session::status)
    }

    /// Stops the consumer session, then closes the producer and the connection. Each step is
    /// attempted even if an earlier one failed, the first error is returned. Closing again does
    /// nothing, unless the first call was abandoned: then it waits for the steps started by the
    /// first call and returns their result.
    pub async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if let Lifecycle::Open = inner.lifecycle {
            let session = inner.session.take();
            let steps = teardown(session, inner.producer.clone(), inner.backend.clone());

            inner.lifecycle = Lifecycle::Closing(tokio::spawn(steps));
        }

        let result = match &mut inner.lifecycle {
            Lifecycle::Closing(teardown) => match teardown.await {
                Ok(result) => result,
                Err(e) => Err(anyhow!("Closing queue of {} panicked: {e}", self.topic)),
            },
            _ => return Ok(()),
        };

        inner.lifecycle = Lifecycle::Closed;

        info!("Queue of topic {} closed", self.topic);

        result
    }
}

async fn teardown(session: Option<Session>, producer: Arc<dyn Producer>, backend: Arc<dyn Backend>) -> Result<()> {
    let mut result = Ok(());

    if let Some(mut session) = session {
        result = result.and(session.stop().await);
    }

    result = result.and(producer.close().await);
    result.and(backend.close().await)
}

async fn rollback(tx: Box<dyn Transaction>) {
    if let Err(e) = tx.rollback().await {
        warn!("Rollback failed {:?}", e);
    }
}
