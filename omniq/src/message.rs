use bytes::Bytes;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Backend specific details of a delivered message. Fields a backend doesn't know are `None`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Metadata {
    pub partition: Option<u32>,
    pub offset: Option<u64>,
    /// How many times this message has been delivered to the group, starting from 1.
    pub attempt: Option<u32>,
    pub reply: Option<String>,
}

/// A delivered message as the user handler sees it.
///
/// It is read-only: acknowledging happens through the return value of the handler.
#[derive(Clone)]
pub struct Message {
    topic: String,
    value: Bytes,
    metadata: Metadata,
    native: Arc<dyn Any + Send + Sync>,
}

impl Message {
    pub fn new<N: Any + Send + Sync>(topic: impl Into<String>, value: Bytes, metadata: Metadata, native: N) -> Self {
        Message {
            topic: topic.into(),
            value,
            metadata,
            native: Arc::new(native),
        }
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// The envelope of the backend client library, if it is of type `N`.
    pub fn native<N: Any>(&self) -> Option<&N> {
        self.native.downcast_ref::<N>()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("topic", &self.topic)
            .field("value", &self.value)
            .field("metadata", &self.metadata)
            .finish()
    }
}
