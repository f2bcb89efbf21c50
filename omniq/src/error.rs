use crate::backend::Capability;
use std::fmt;

/// Errors surfaced to the users of a [`crate::Queue`].
///
/// Backend errors are kept as the root cause of the returned `anyhow::Error` and the `QueueError`
/// is attached as context, so both are visible: `err.downcast_ref::<QueueError>()` classifies the
/// failure and `err.root_cause()` is the native error of the broker client.
#[derive(Clone, Debug, PartialEq)]
pub enum QueueError {
    /// The queue (or the producer, or the connection) has already been closed.
    Closed,
    /// The backend refused or failed to establish the subscription.
    SubscriptionSetup { topic: String, group: String },
    /// The backend refused a publish.
    Send { topic: String },
    /// The backend doesn't implement an optional capability.
    Unsupported(Capability),
    /// The connection to the broker is gone.
    ConnectionLost,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Closed => write!(f, "queue is closed"),
            QueueError::SubscriptionSetup { topic, group } => {
                write!(f, "cannot subscribe to topic {topic} as group {group}")
            }
            QueueError::Send { topic } => write!(f, "cannot send message to topic {topic}"),
            QueueError::Unsupported(cap) => write!(f, "backend doesn't support {cap:?}"),
            QueueError::ConnectionLost => write!(f, "connection to the broker is lost"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Signals of group coordinated backends which stop the current claim generation of a
/// subscription. They never reach the caller of `Dequeue`, the consumer session absorbs them.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Interrupt {
    /// Claims were revoked, the subscription needs to be set up again.
    Rebalance,
    /// The consumer group itself was torn down, there is nothing to rejoin.
    GroupClosed,
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupt::Rebalance => write!(f, "claims revoked by a group rebalance"),
            Interrupt::GroupClosed => write!(f, "consumer group is closed"),
        }
    }
}

impl std::error::Error for Interrupt {}

/// Returns the `QueueError` kind of an error if it has one.
pub fn queue_error(err: &anyhow::Error) -> Option<&QueueError> {
    err.downcast_ref::<QueueError>()
}

/// Shorthand for returning typed errors from async functions.
#[macro_export]
macro_rules! queue_error {
    ($kind:expr) => {
        ::std::result::Result::Err(anyhow::Error::new($kind))
    };
}
