use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, trace, warn};
use omniq::{Identity, Message, Metadata, QueueError, Subscription};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Member of the queue group of a topic.
///
/// The client library delivers messages from a blocking thread, so a forwarding task moves them
/// into a channel and `recv` stays cancel safe.
pub struct NatsSubscription {
    conn: nats::asynk::Connection,
    identity: Identity,
    messages: Option<mpsc::Receiver<nats::asynk::Message>>,
    forwarder: Option<Forwarder>,
}

struct Forwarder {
    cancel: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl NatsSubscription {
    pub(crate) fn new(conn: nats::asynk::Connection, identity: Identity) -> Self {
        NatsSubscription {
            conn,
            identity,
            messages: None,
            forwarder: None,
        }
    }

    fn setup_error(&self) -> QueueError {
        QueueError::SubscriptionSetup {
            topic: self.identity.topic.clone(),
            group: self.identity.group.clone(),
        }
    }

    async fn stop_forwarder(&mut self) -> Result<()> {
        self.messages = None;

        let forwarder = match self.forwarder.take() {
            Some(forwarder) => forwarder,
            None => return Ok(()),
        };

        forwarder.cancel.cancel();

        match forwarder.handle.await {
            Ok(result) => result,
            Err(e) => Err(anyhow!("Message forwarder of {:?} panicked: {e}", self.identity)),
        }
    }
}

/// Forwards the messages of the subscription until cancelled or the subscription ends, then
/// unsubscribes.
async fn forward(
    sub: nats::asynk::Subscription,
    sink: mpsc::Sender<nats::asynk::Message>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            }
            message = sub.next() => {
                match message {
                    Some(message) => {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        warn!("Subscription ended by the server");

                        return Ok(());
                    }
                }
            }
        }
    }

    sub.unsubscribe().await.context("Cannot unsubscribe")
}

/// Next message of the forwarder. The channel closes before cancellation only if the server or
/// the connection ended the subscription.
async fn next_forwarded<T>(messages: &mut mpsc::Receiver<T>, identity: &Identity) -> Result<T> {
    match messages.recv().await {
        Some(message) => Ok(message),
        None => {
            Err(anyhow!("Subscription of {:?} ended by the connection", identity)).context(QueueError::ConnectionLost)
        }
    }
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn setup(&mut self) -> Result<()> {
        if let Err(e) = self.stop_forwarder().await {
            warn!("Stopping previous subscription of {:?} failed {:?}", self.identity, e);
        }

        let sub = self
            .conn
            .queue_subscribe(&self.identity.topic, &self.identity.group)
            .await
            .with_context(|| self.setup_error())?;

        // the subscription is registered on the server once the flush returns
        self.conn.flush().await.with_context(|| self.setup_error())?;

        debug!("Subscribed to {:?}", self.identity);

        let (sink, stream) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(forward(sub, sink, cancel.clone()));

        self.messages = Some(stream);
        self.forwarder = Some(Forwarder { cancel, handle });

        Ok(())
    }

    async fn recv(&mut self) -> Result<Message> {
        let messages = match self.messages.as_mut() {
            Some(messages) => messages,
            None => return Err(anyhow!("Subscription of {:?} is not set up", self.identity)),
        };

        let message = next_forwarded(messages, &self.identity).await?;

        trace!("Received {} bytes on {}", message.data.len(), message.subject);

        let metadata = Metadata {
            reply: message.reply.clone(),
            ..Default::default()
        };

        Ok(Message::new(
            message.subject.clone(),
            Bytes::from(message.data.clone()),
            metadata,
            message,
        ))
    }

    async fn commit(&mut self, _message: &Message) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.stop_forwarder().await
    }
}
