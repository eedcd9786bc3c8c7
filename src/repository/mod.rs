//! Persistence for the scheduler snapshot and the live event counts.
//!
//! [`Repository`] is the durable side: natural-key upserts that the event
//! handler issues as events arrive. Every write is idempotent, so a batch
//! redelivered after a reconnect leaves the store unchanged.

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{
    Application, ApplicationKey, Cluster, HistoryEntry, Node, Partition, PartitionNodesUtil, Queue,
};

pub mod events;
pub mod memory;
pub mod postgres;

pub use self::events::{EventCounts, EventRepository, InMemoryEventRepository};
pub use self::memory::MemoryRepository;
pub use self::postgres::PostgresRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error during {op}: {source}")]
    Database {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("could not encode {field}: {source}")]
    Encode {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("not found: {0}")]
    NotFound(String),
}

impl RepositoryError {
    pub(crate) fn db(op: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| Self::Database { op, source }
    }
}

/// Schema setup failure. Fatal at startup.
#[derive(Debug, Error)]
#[error("schema setup failed at `{statement}`: {source}")]
pub struct SchemaSetupError {
    pub statement: String,
    #[source]
    pub source: sqlx::Error,
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[async_trait]
pub trait Repository: Send + Sync {
    /// Drop and recreate every table. Called once before streaming starts.
    async fn setup(&self) -> Result<(), SchemaSetupError>;

    async fn upsert_cluster(&self, cluster: &Cluster) -> RepositoryResult<()>;
    async fn upsert_partitions(&self, partitions: &[Partition]) -> RepositoryResult<()>;

    async fn upsert_queues(&self, queues: &[Queue]) -> RepositoryResult<()>;
    async fn delete_queue(&self, partition: &str, queue_name: &str) -> RepositoryResult<()>;

    /// Insert or update by `(partition, queue_name, app_id)`. The stored state
    /// log keeps every entry it already had, and a stored finish time is kept
    /// when the update carries none.
    async fn upsert_application(&self, app: &Application) -> RepositoryResult<()>;

    /// Remove the row of an application that now lives under another key.
    async fn delete_application(&self, key: &ApplicationKey) -> RepositoryResult<()>;

    /// Soft-mark a removed application with its terminal state.
    async fn mark_application_removed(
        &self,
        key: &ApplicationKey,
        state: &str,
        finished_time: i64,
    ) -> RepositoryResult<()>;

    async fn upsert_nodes(&self, nodes: &[Node]) -> RepositoryResult<()>;
    async fn delete_node(&self, partition: &str, node_id: &str) -> RepositoryResult<()>;

    async fn upsert_node_utilizations(&self, utils: &[PartitionNodesUtil]) -> RepositoryResult<()>;

    /// Write rollup samples. A sample already stored for the same type and
    /// timestamp is left alone.
    async fn record_history(&self, entries: &[HistoryEntry]) -> RepositoryResult<()>;

    fn backend_name(&self) -> &'static str;
}
