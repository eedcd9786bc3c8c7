//! In-memory durable repository.
//!
//! Mirrors the PostgreSQL upsert semantics so the handler and the service can
//! be exercised without a database. State is lost on restart.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{Repository, RepositoryResult, SchemaSetupError};
use crate::model::{
    merge_state_log, Application, ApplicationKey, Cluster, HistoryEntry, HistoryType, Node,
    Partition, PartitionNodesUtil, Queue,
};

/// A stored row: surrogate id plus the entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Row<T> {
    pub id: Uuid,
    pub value: T,
}

#[derive(Debug, Default)]
struct Tables {
    clusters: HashMap<String, Row<Cluster>>,
    partitions: HashMap<String, Row<Partition>>,
    queues: HashMap<(String, String), Row<Queue>>,
    applications: HashMap<ApplicationKey, Row<Application>>,
    nodes: HashMap<(String, String), Row<Node>>,
    nodes_util: HashMap<(String, String), Row<PartitionNodesUtil>>,
    history: BTreeMap<(HistoryType, i64), Row<HistoryEntry>>,
}

/// Keeps the surrogate id of an existing row and replaces its value.
fn upsert<K, T>(table: &mut HashMap<K, Row<T>>, key: K, value: T)
where
    K: std::hash::Hash + Eq,
{
    match table.get_mut(&key) {
        Some(row) => row.value = value,
        None => {
            table.insert(
                key,
                Row {
                    id: Uuid::new_v4(),
                    value,
                },
            );
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryRepository {
    tables: RwLock<Tables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cluster(&self, name: &str) -> Option<Row<Cluster>> {
        self.tables.read().clusters.get(name).cloned()
    }

    pub fn partition(&self, name: &str) -> Option<Row<Partition>> {
        self.tables.read().partitions.get(name).cloned()
    }

    pub fn queue(&self, partition: &str, name: &str) -> Option<Row<Queue>> {
        self.tables
            .read()
            .queues
            .get(&(partition.to_string(), name.to_string()))
            .cloned()
    }

    pub fn application(&self, key: &ApplicationKey) -> Option<Row<Application>> {
        self.tables.read().applications.get(key).cloned()
    }

    pub fn node(&self, partition: &str, node_id: &str) -> Option<Row<Node>> {
        self.tables
            .read()
            .nodes
            .get(&(partition.to_string(), node_id.to_string()))
            .cloned()
    }

    pub fn node_utilization(&self, cluster_id: &str, partition: &str) -> Option<Row<PartitionNodesUtil>> {
        self.tables
            .read()
            .nodes_util
            .get(&(cluster_id.to_string(), partition.to_string()))
            .cloned()
    }

    /// History samples ordered by type then timestamp.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.tables
            .read()
            .history
            .values()
            .map(|row| row.value)
            .collect()
    }

    pub fn queue_count(&self) -> usize {
        self.tables.read().queues.len()
    }

    pub fn application_count(&self) -> usize {
        self.tables.read().applications.len()
    }

    pub fn node_count(&self) -> usize {
        self.tables.read().nodes.len()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn setup(&self) -> Result<(), SchemaSetupError> {
        *self.tables.write() = Tables::default();
        Ok(())
    }

    async fn upsert_cluster(&self, cluster: &Cluster) -> RepositoryResult<()> {
        let mut tables = self.tables.write();
        upsert(
            &mut tables.clusters,
            cluster.cluster_name.clone(),
            cluster.clone(),
        );
        Ok(())
    }

    async fn upsert_partitions(&self, partitions: &[Partition]) -> RepositoryResult<()> {
        let mut tables = self.tables.write();
        for p in partitions {
            upsert(&mut tables.partitions, p.name.clone(), p.clone());
        }
        Ok(())
    }

    async fn upsert_queues(&self, queues: &[Queue]) -> RepositoryResult<()> {
        let mut tables = self.tables.write();
        for q in queues {
            let key = (q.partition.clone(), q.queue_name.clone());
            upsert(&mut tables.queues, key, q.clone());
        }
        Ok(())
    }

    async fn delete_queue(&self, partition: &str, queue_name: &str) -> RepositoryResult<()> {
        self.tables
            .write()
            .queues
            .remove(&(partition.to_string(), queue_name.to_string()));
        Ok(())
    }

    async fn upsert_application(&self, app: &Application) -> RepositoryResult<()> {
        let mut tables = self.tables.write();
        let key = app.key();
        match tables.applications.get_mut(&key) {
            Some(row) => {
                let mut log = std::mem::take(&mut row.value.state_log);
                merge_state_log(&mut log, &app.state_log);
                let finished_time = app.finished_time.or(row.value.finished_time);
                row.value = app.clone();
                row.value.state_log = log;
                row.value.finished_time = finished_time;
            }
            None => {
                tables.applications.insert(
                    key,
                    Row {
                        id: Uuid::new_v4(),
                        value: app.clone(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn delete_application(&self, key: &ApplicationKey) -> RepositoryResult<()> {
        self.tables.write().applications.remove(key);
        Ok(())
    }

    async fn mark_application_removed(
        &self,
        key: &ApplicationKey,
        state: &str,
        finished_time: i64,
    ) -> RepositoryResult<()> {
        if let Some(row) = self.tables.write().applications.get_mut(key) {
            row.value.state = state.to_string();
            row.value.finished_time = Some(finished_time);
        }
        Ok(())
    }

    async fn upsert_nodes(&self, nodes: &[Node]) -> RepositoryResult<()> {
        let mut tables = self.tables.write();
        for n in nodes {
            let key = (n.partition.clone(), n.node_id.clone());
            upsert(&mut tables.nodes, key, n.clone());
        }
        Ok(())
    }

    async fn delete_node(&self, partition: &str, node_id: &str) -> RepositoryResult<()> {
        self.tables
            .write()
            .nodes
            .remove(&(partition.to_string(), node_id.to_string()));
        Ok(())
    }

    async fn upsert_node_utilizations(&self, utils: &[PartitionNodesUtil]) -> RepositoryResult<()> {
        let mut tables = self.tables.write();
        for u in utils {
            let key = (u.cluster_id.clone(), u.partition.clone());
            upsert(&mut tables.nodes_util, key, u.clone());
        }
        Ok(())
    }

    async fn record_history(&self, entries: &[HistoryEntry]) -> RepositoryResult<()> {
        let mut tables = self.tables.write();
        for e in entries {
            tables
                .history
                .entry((e.history_type, e.timestamp))
                .or_insert_with(|| Row {
                    id: Uuid::new_v4(),
                    value: *e,
                });
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
