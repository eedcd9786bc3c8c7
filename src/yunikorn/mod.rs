//! Scheduler integration: REST client, event stream transport and the
//! dispatcher that consumes it.

pub mod client;
pub mod service;
pub mod stream;

pub use self::client::{ApplicationStatus, Client, SchedulerClient};
pub use self::service::{EventHandler, NoopHandler, Service, ServiceError, ServiceState};
pub use self::stream::{ChunkSource, EventStream, ReaderSource, StreamClient, StreamError};
