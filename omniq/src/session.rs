//! Consumer session: one live subscription and the worker task delivering its messages.
//!
//! ```text
//!   starting --> ready --> delivering <--> rebalancing
//!                               |               |
//!                               +--> stopping <-+--> stopped
//! ```
//!
//! [`Session::ready`] returns after the first `ready`. Every later generation
//! (after a rebalance) only bumps the generation number of the published [`SessionStatus`].


use crate::backend::{Identity, Subscription};
use crate::error::{queue_error, Interrupt, QueueError};
use crate::message::Message;
use crate::signal::Signal;
use anyhow::{anyhow, Result};
use log::{debug, error, trace, warn};
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

/// The user handler. Returning `true` commits (acknowledges) the message.
pub type Handler = Box<dyn FnMut(&Message) -> bool + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Ready,
    Delivering,
    Rebalancing,
    Stopping,
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Number of claim generations the session has been ready for.
    pub generation: u64,
}

pub(crate) struct Session {
    identity: Identity,
    cancel: CancellationToken,
    stopped: Signal,
    status: watch::Receiver<SessionStatus>,
    ready: Option<oneshot::Receiver<Result<()>>>,
    worker: JoinHandle<Result<()>>,
}

/// What the worker does after the current generation ended with an error.
enum Disposition {
    Resubscribe,
    Finish,
    Fail(anyhow::Error),
}

fn classify(err: anyhow::Error) -> Disposition {
    match err.downcast_ref::<Interrupt>() {
        Some(Interrupt::Rebalance) => Disposition::Resubscribe,
        Some(Interrupt::GroupClosed) => Disposition::Finish,
        None => Disposition::Fail(err),
    }
}

impl Session {
    /// Spawns the worker task. The subscription is set up by the worker, [`Session::ready`] tells
    /// when it is done.
    pub(crate) fn spawn(
        identity: Identity,
        subscription: Box<dyn Subscription>,
        handler: Handler,
        retry_backoff: Duration,
    ) -> Session {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus {
            state: SessionState::Starting,
            generation: 0,
        });
        let cancel = CancellationToken::new();
        let stopped = Signal::new();

        let worker = Worker {
            identity: identity.clone(),
            subscription,
            handler,
            cancel: cancel.clone(),
            status: status_tx,
            ready: Some(ready_tx),
            retry_backoff,
        };

        let worker = tokio::spawn(worker.run(stopped.clone()));

        Session {
            identity,
            cancel,
            stopped,
            status: status_rx,
            ready: Some(ready_rx),
            worker,
        }
    }

    /// Waits until the first subscription is set up. On error the worker is stopping or stopped,
    /// the session still has to be stopped to collect it.
    ///
    /// Cancel safe, the session keeps waiting for the outcome on the next call.
    pub(crate) async fn ready(&mut self) -> Result<()> {
        let ready = match self.ready.as_mut() {
            Some(ready) => ready,
            None => return Ok(()),
        };

        let outcome = ready.await;

        self.ready = None;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(setup_context(
                &self.identity,
                anyhow!("Worker exited before the subscription was ready"),
            )),
        }
    }

    /// Cancels the worker when the guard is dropped without being disarmed.
    pub(crate) fn cancel_on_drop(&self) -> DropGuard {
        self.cancel.clone().drop_guard()
    }

    pub(crate) fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub(crate) fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Cancels the worker and waits until it has returned. A handler call in progress is allowed
    /// to finish. Returns the error which stopped the worker, or the error of leaving the group.
    ///
    /// Cancel safe: the worker is already cancelled, calling again waits for the rest. Once it
    /// returned the session has to be dropped.
    pub(crate) async fn stop(&mut self) -> Result<()> {
        debug!("Stopping session of {:?}", self.identity);

        self.cancel.cancel();
        self.stopped.wait().await;

        match (&mut self.worker).await {
            Ok(result) => result,
            Err(e) => Err(anyhow!("Consumer worker of {:?} panicked: {e}", self.identity)),
        }
    }
}

impl Drop for Session {
    /// A session dropped without `stop` still cancels its worker.
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Fires the stoppage signal however the worker ends.
struct FireOnDrop(Signal);

impl Drop for FireOnDrop {
    fn drop(&mut self) {
        self.0.fire();
    }
}

struct Worker {
    identity: Identity,
    subscription: Box<dyn Subscription>,
    handler: Handler,
    cancel: CancellationToken,
    status: watch::Sender<SessionStatus>,
    /// Unblocks the caller of `Dequeue` after the first successful setup, or with the setup error.
    ready: Option<oneshot::Sender<Result<()>>>,
    retry_backoff: Duration,
}

impl Worker {
    async fn run(mut self, stopped: Signal) -> Result<()> {
        let _stopped = FireOnDrop(stopped);
        let result = self.consume_loop().await;

        self.set_state(SessionState::Stopping);

        let result = match self.ready.take() {
            Some(ready) => {
                // Never got ready, the caller of `Dequeue` gets the reason.
                let err = match result {
                    Err(e) => self.setup_error(e),
                    Ok(()) => self.setup_error(anyhow::Error::new(Interrupt::GroupClosed)),
                };

                let _ = ready.send(Err(err));

                Ok(())
            }
            None => result,
        };

        let shutdown = self.subscription.shutdown().await;

        if let Err(e) = &shutdown {
            warn!("Error leaving {:?} {:?}", self.identity, e);
        }

        self.set_state(SessionState::Stopped);

        debug!("Session of {:?} stopped", self.identity);

        result.and(shutdown)
    }

    /// Runs generations until cancelled, the group is closed or a fatal error happens.
    async fn consume_loop(&mut self) -> Result<()> {
        loop {
            self.set_state(SessionState::Starting);

            let setup = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    return Ok(());
                }
                result = self.subscription.setup() => {
                    result
                }
            };

            if let Err(e) = setup {
                match classify(e) {
                    Disposition::Resubscribe => {
                        trace!("Group of {:?} is still rebalancing", self.identity);

                        if backoff(&self.cancel, self.retry_backoff).await {
                            continue;
                        }

                        return Ok(());
                    }
                    Disposition::Finish => return Ok(()),
                    Disposition::Fail(e) => return Err(e),
                }
            }

            self.status.send_modify(|s| {
                s.state = SessionState::Ready;
                s.generation += 1;
            });

            if let Some(ready) = self.ready.take() {
                if ready.send(Ok(())).is_err() {
                    // nobody waits for us any more
                    return Ok(());
                }
            }

            self.set_state(SessionState::Delivering);

            match self.deliver().await {
                Ok(()) => return Ok(()),
                Err(e) => match classify(e) {
                    Disposition::Resubscribe => {
                        debug!("Claims of {:?} revoked, subscribing again", self.identity);

                        self.set_state(SessionState::Rebalancing);
                    }
                    Disposition::Finish => {
                        debug!("Consumer group of {:?} is closed", self.identity);

                        return Ok(());
                    }
                    Disposition::Fail(e) => {
                        error!("Consumer of {:?} failed {:?}", self.identity, e);

                        return Err(e);
                    }
                },
            }
        }
    }

    /// Delivers messages of the current generation. `Ok` means the session was cancelled.
    async fn deliver(&mut self) -> Result<()> {
        loop {
            let received = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    return Ok(());
                }
                message = self.subscription.recv() => {
                    message
                }
            };

            let message = received?;

            trace!("Delivering {:?}", message);

            let handler = &mut self.handler;
            let acked = match std::panic::catch_unwind(AssertUnwindSafe(|| (*handler)(&message))) {
                Ok(acked) => acked,
                Err(panic) => {
                    return Err(anyhow!(
                        "Handler panicked on message of {}: {}",
                        message.topic(),
                        panic_message(&*panic)
                    ))
                }
            };

            if acked {
                self.subscription.commit(&message).await?;
            }
        }
    }

    fn set_state(&self, state: SessionState) {
        self.status.send_modify(|s| s.state = state);
    }

    fn setup_error(&self, err: anyhow::Error) -> anyhow::Error {
        setup_context(&self.identity, err)
    }
}

/// Marks a failed subscription as [`QueueError::SubscriptionSetup`], unless the backend already
/// classified it.
pub(crate) fn setup_context(identity: &Identity, err: anyhow::Error) -> anyhow::Error {
    if queue_error(&err).is_some() {
        return err;
    }

    err.context(QueueError::SubscriptionSetup {
        topic: identity.topic.clone(),
        group: identity.group.clone(),
    })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string payload"
    }
}

/// Waits before the next subscription attempt, returns `false` if cancelled meanwhile.
async fn backoff(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;

        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
