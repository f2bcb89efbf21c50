//! Broker agnostic queue facade.
//!
//! A [`Queue`] publishes to a topic and consumes it through a uniform `enqueue`/`dequeue`/`close`
//! API over any [`Backend`]. The consumer side is a session with a worker task which survives
//! rebalances of group coordinated brokers and is replaced or closed without overlapping
//! deliveries.
//!
//! ```no_run
//! use omniq::{memory::MemoryBroker, Config, Queue};
//! use std::sync::Arc;
//!
//! async fn run() -> anyhow::Result<()> {
//!     let config = Config::builder().partitions(2).build();
//!     let broker = MemoryBroker::start(&config);
//!     let queue = Queue::open(Arc::new(broker.connect(&config).await?), "orders", &config).await?;
//!
//!     queue.enqueue("hello").await?;
//!     queue
//!         .dequeue("billing", |m| {
//!             println!("{:?}", m.value());
//!             true
//!         })
//!         .await?;
//!
//!     queue.close().await
//! }
//! ```

mod dev;
pub use dev::setup_logger;

pub mod backend;
pub use backend::{Backend, Capability, Identity, Producer, Subscription};

pub mod config;
pub use config::Config;

mod error;
pub use error::{queue_error, Interrupt, QueueError};

pub mod memory;

mod message;
pub use message::{Message, Metadata};

mod queue;
pub use queue::Queue;

mod session;
pub use session::{SessionState, SessionStatus};

mod signal;
pub use signal::Signal;
