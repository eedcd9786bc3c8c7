//! In-process scheduler used by the collector tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use parking_lot::Mutex;

use crate::model::{
    Application, Cluster, HistoryEntry, HistoryType, Node, Partition, PartitionNodesUtil, Queue,
};
use crate::yunikorn::{ApplicationStatus, SchedulerClient};

#[derive(Default)]
struct State {
    partitions: Vec<Partition>,
    queues: HashMap<String, Vec<Queue>>,
    nodes: HashMap<String, Vec<Node>>,
    apps: Vec<Application>,
    history: Vec<HistoryEntry>,
    utilizations: Vec<PartitionNodesUtil>,
}

#[derive(Default)]
pub struct FakeScheduler {
    state: Mutex<State>,
    cluster_reads: AtomicUsize,
    partition_reads: AtomicUsize,
}

impl FakeScheduler {
    pub fn with_partition(name: &str) -> Self {
        let fake = Self::default();
        fake.state.lock().partitions.push(Partition {
            cluster_id: "cluster".to_string(),
            name: name.to_string(),
            state: "Active".to_string(),
            ..Default::default()
        });
        fake
    }

    pub fn put_app(&self, app: Application) {
        let mut state = self.state.lock();
        state.apps.retain(|a| a.app_id != app.app_id);
        state.apps.push(app);
    }

    pub fn remove_app(&self, app_id: &str) {
        self.state.lock().apps.retain(|a| a.app_id != app_id);
    }

    pub fn set_queues(&self, partition: &str, queues: Vec<Queue>) {
        self.state.lock().queues.insert(partition.to_string(), queues);
    }

    pub fn set_nodes(&self, partition: &str, nodes: Vec<Node>) {
        self.state.lock().nodes.insert(partition.to_string(), nodes);
    }

    pub fn set_history(&self, history: Vec<HistoryEntry>) {
        self.state.lock().history = history;
    }

    pub fn set_utilizations(&self, utilizations: Vec<PartitionNodesUtil>) {
        self.state.lock().utilizations = utilizations;
    }

    pub fn cluster_reads(&self) -> usize {
        self.cluster_reads.load(Ordering::SeqCst)
    }

    pub fn partition_reads(&self) -> usize {
        self.partition_reads.load(Ordering::SeqCst)
    }

    fn history_of(&self, t: HistoryType) -> Vec<HistoryEntry> {
        self.state
            .lock()
            .history
            .iter()
            .filter(|h| h.history_type == t)
            .copied()
            .collect()
    }
}

fn is_listed(app: &Application, status: ApplicationStatus) -> bool {
    match status {
        ApplicationStatus::Rejected => app.state == "Rejected",
        ApplicationStatus::Completed => matches!(app.state.as_str(), "Completed" | "Failed" | "Expired"),
        ApplicationStatus::Active => !matches!(
            app.state.as_str(),
            "Rejected" | "Completed" | "Failed" | "Expired"
        ),
    }
}

impl SchedulerClient for FakeScheduler {
    async fn get_clusters(&self) -> Result<Vec<Cluster>> {
        self.cluster_reads.fetch_add(1, Ordering::SeqCst);
        Ok(vec![Cluster {
            cluster_name: "cluster".to_string(),
            partition_name: "default".to_string(),
            ..Default::default()
        }])
    }

    async fn get_partitions(&self) -> Result<Vec<Partition>> {
        self.partition_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().partitions.clone())
    }

    async fn get_partition_queues(&self, partition: &str) -> Result<Vec<Queue>> {
        Ok(self
            .state
            .lock()
            .queues
            .get(partition)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_partition_nodes(&self, partition: &str) -> Result<Vec<Node>> {
        Ok(self
            .state
            .lock()
            .nodes
            .get(partition)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_applications(
        &self,
        partition: &str,
        status: ApplicationStatus,
    ) -> Result<Vec<Application>> {
        Ok(self
            .state
            .lock()
            .apps
            .iter()
            .filter(|a| a.partition == partition && is_listed(a, status))
            .cloned()
            .collect())
    }

    async fn get_application(&self, partition: &str, app_id: &str) -> Result<Option<Application>> {
        Ok(self
            .state
            .lock()
            .apps
            .iter()
            .find(|a| a.partition == partition && a.app_id == app_id)
            .cloned())
    }

    async fn get_application_history(&self) -> Result<Vec<HistoryEntry>> {
        Ok(self.history_of(HistoryType::Application))
    }

    async fn get_container_history(&self) -> Result<Vec<HistoryEntry>> {
        Ok(self.history_of(HistoryType::Container))
    }

    async fn get_node_utilizations(&self) -> Result<Vec<PartitionNodesUtil>> {
        Ok(self.state.lock().utilizations.clone())
    }
}
