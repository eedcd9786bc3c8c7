//! Materializes scheduler events into the durable repository.
//!
//! Events carry only an object id, so every record triggers a read of the
//! current scheduler state for that object, which is then upserted. Because
//! upserts are idempotent, a record redelivered after a reconnect simply
//! re-applies the same state.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::event::{ChangeType, EventRecord, EventType};
use crate::export::health::HealthMetrics;
use crate::model::{Application, ApplicationKey, Partition};
use crate::repository::{Repository, RepositoryResult};
use crate::yunikorn::{ApplicationStatus, EventHandler, SchedulerClient};

/// Application state used when a removed application left no terminal detail.
const DEFAULT_REMOVED_STATE: &str = "Completed";

/// Counts from one full resync.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncSummary {
    pub clusters: usize,
    pub partitions: usize,
    pub queues: usize,
    pub nodes: usize,
    pub applications: usize,
}

/// [`EventHandler`] that keeps the durable repository in step with the
/// scheduler.
pub struct RepositoryHandler<C> {
    client: Arc<C>,
    repo: Arc<dyn Repository>,
    metrics: Option<Arc<HealthMetrics>>,
    resync_on_connect: bool,
    synced: AtomicBool,
    partitions: RwLock<Vec<String>>,
    // app_id -> natural key, so removals can be applied after the scheduler
    // has forgotten the application.
    apps: DashMap<String, ApplicationKey>,
}

impl<C: SchedulerClient> RepositoryHandler<C> {
    pub fn new(client: Arc<C>, repo: Arc<dyn Repository>, resync_on_connect: bool) -> Self {
        Self {
            client,
            repo,
            metrics: None,
            resync_on_connect,
            synced: AtomicBool::new(false),
            partitions: RwLock::new(Vec::new()),
            apps: DashMap::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Runs a repository call and records its duration.
    async fn timed<F>(&self, op: &'static str, fut: F) -> RepositoryResult<()>
    where
        F: Future<Output = RepositoryResult<()>>,
    {
        let start = Instant::now();
        let result = fut.await;
        if let Some(m) = &self.metrics {
            m.record_repository_op(op, result.is_ok(), start.elapsed());
        }
        result
    }

    /// Known partition names, fetching them if none are cached yet.
    async fn partition_names(&self) -> Result<Vec<String>> {
        let cached = self.partitions.read().clone();
        if !cached.is_empty() {
            return Ok(cached);
        }
        Ok(self
            .refresh_partitions()
            .await?
            .into_iter()
            .map(|p| p.name)
            .collect())
    }

    /// Re-read and upsert every partition.
    pub async fn refresh_partitions(&self) -> Result<Vec<Partition>> {
        let partitions = self.client.get_partitions().await?;
        self.timed("upsert_partitions", self.repo.upsert_partitions(&partitions))
            .await
            .context("upserting partitions")?;

        *self.partitions.write() = partitions.iter().map(|p| p.name.clone()).collect();

        Ok(partitions)
    }

    /// Re-read the whole scheduler state and upsert it.
    pub async fn sync_all(&self) -> Result<SyncSummary> {
        let mut summary = SyncSummary::default();

        let clusters = self.client.get_clusters().await?;
        for cluster in &clusters {
            self.timed("upsert_cluster", self.repo.upsert_cluster(cluster))
                .await
                .with_context(|| format!("upserting cluster {}", cluster.cluster_name))?;
        }
        summary.clusters = clusters.len();

        let partitions = self.refresh_partitions().await?;
        summary.partitions = partitions.len();

        for partition in &partitions {
            let name = partition.name.as_str();

            summary.queues += self.sync_queues(name, None).await?;
            summary.nodes += self.sync_nodes(name, None).await?;

            for status in ApplicationStatus::ALL {
                let apps = self.client.get_applications(name, status).await?;
                for app in &apps {
                    self.store_application(app).await?;
                }
                summary.applications += apps.len();
            }
        }

        self.synced.store(true, Ordering::SeqCst);

        info!(
            clusters = summary.clusters,
            partitions = summary.partitions,
            queues = summary.queues,
            nodes = summary.nodes,
            applications = summary.applications,
            "scheduler state synchronized"
        );

        Ok(summary)
    }

    /// Upsert a partition's queues. When `removed` names a queue that the
    /// scheduler no longer reports, its row is deleted.
    async fn sync_queues(&self, partition: &str, removed: Option<&str>) -> Result<usize> {
        let queues = self.client.get_partition_queues(partition).await?;
        self.timed("upsert_queues", self.repo.upsert_queues(&queues))
            .await
            .with_context(|| format!("upserting queues of partition {partition}"))?;

        if let Some(name) = removed {
            if !queues.iter().any(|q| q.queue_name == name) {
                self.timed("delete_queue", self.repo.delete_queue(partition, name))
                    .await
                    .with_context(|| format!("deleting queue {name}"))?;
                debug!(partition, queue = name, "queue removed");
            }
        }

        Ok(queues.len())
    }

    /// Upsert a partition's nodes. When `removed` names a node that the
    /// scheduler no longer reports, its row is deleted.
    async fn sync_nodes(&self, partition: &str, removed: Option<&str>) -> Result<usize> {
        let nodes = self.client.get_partition_nodes(partition).await?;
        self.timed("upsert_nodes", self.repo.upsert_nodes(&nodes))
            .await
            .with_context(|| format!("upserting nodes of partition {partition}"))?;

        if let Some(node_id) = removed {
            let present: HashSet<&str> = nodes.iter().map(|n| n.node_id.as_str()).collect();
            if !present.contains(node_id) {
                self.timed("delete_node", self.repo.delete_node(partition, node_id))
                    .await
                    .with_context(|| format!("deleting node {node_id}"))?;
                debug!(partition, node_id, "node removed");
            }
        }

        Ok(nodes.len())
    }

    /// Upsert an application and remember its key. A row left under an
    /// earlier key (the application moved queues) is deleted first.
    async fn store_application(&self, app: &Application) -> Result<()> {
        let app_id = app.app_id.as_str();
        let key = app.key();

        if let Some(old) = self.apps.insert(app_id.to_string(), key.clone()) {
            if old != key {
                self.timed("delete_application", self.repo.delete_application(&old))
                    .await
                    .with_context(|| format!("deleting stale row {old}"))?;
                debug!(app_id, from = %old, to = %key, "application moved");
            }
        }

        self.timed("upsert_application", self.repo.upsert_application(app))
            .await
            .with_context(|| format!("upserting application {app_id}"))
    }

    async fn handle_app(&self, event: &EventRecord) -> Result<()> {
        let app_id = event.object_id.as_str();
        if app_id.is_empty() {
            bail!("application event without object id");
        }

        let mut candidates = self.partition_names().await?;
        if let Some(key) = self.apps.get(app_id) {
            candidates.retain(|p| *p != key.partition);
            candidates.insert(0, key.partition.clone());
        }

        for partition in &candidates {
            if let Some(app) = self.client.get_application(partition, app_id).await? {
                return self.store_application(&app).await;
            }
        }

        // The scheduler no longer knows the application.
        let key = match self.apps.get(app_id) {
            Some(key) => key.clone(),
            None => {
                debug!(app_id, "event for unknown application ignored");
                return Ok(());
            }
        };

        let state = event
            .event_change_detail
            .terminal_app_state()
            .unwrap_or(DEFAULT_REMOVED_STATE);
        let finished = if event.timestamp_nano > 0 {
            event.timestamp_nano
        } else {
            now_nanos()
        };

        self.timed(
            "mark_application_removed",
            self.repo.mark_application_removed(&key, state, finished),
        )
        .await
        .with_context(|| format!("marking application {app_id} removed"))?;

        if event.event_change_type == ChangeType::Remove {
            self.apps.remove(app_id);
        }

        debug!(app_id, state, "application marked removed");

        Ok(())
    }

    async fn handle_queue(&self, event: &EventRecord) -> Result<()> {
        let removed = (event.event_change_type == ChangeType::Remove)
            .then_some(event.object_id.as_str())
            .filter(|name| !name.is_empty());

        for partition in self.partition_names().await? {
            self.sync_queues(&partition, removed).await?;
        }

        Ok(())
    }

    async fn handle_node(&self, event: &EventRecord) -> Result<()> {
        let removed = (event.event_change_type == ChangeType::Remove)
            .then_some(event.object_id.as_str())
            .filter(|id| !id.is_empty());

        for partition in self.partition_names().await? {
            self.sync_nodes(&partition, removed).await?;
        }

        Ok(())
    }
}

fn now_nanos() -> i64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| chrono::Utc::now().timestamp_micros().saturating_mul(1000))
}

#[async_trait]
impl<C: SchedulerClient + 'static> EventHandler for RepositoryHandler<C> {
    async fn handle(&self, event: &EventRecord) -> Result<()> {
        match event.event_type {
            EventType::App => self.handle_app(event).await?,
            EventType::Queue => self.handle_queue(event).await?,
            EventType::Node => self.handle_node(event).await?,
            EventType::Request | EventType::UserGroup | EventType::Unknown => {
                debug!(key = %event.key(), "event type not materialized");
                return Ok(());
            }
        }

        self.refresh_partitions().await?;

        Ok(())
    }

    async fn on_stream_open(&self) -> Result<()> {
        if self.resync_on_connect || !self.synced.load(Ordering::SeqCst) {
            self.sync_all().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::testing::FakeScheduler;
    use crate::event::ChangeDetail;
    use crate::model::{Application, Node, Queue};
    use crate::repository::MemoryRepository;

    fn app(id: &str, queue: &str, state: &str) -> Application {
        Application {
            app_id: id.to_string(),
            partition: "default".to_string(),
            queue_name: queue.to_string(),
            state: state.to_string(),
            ..Default::default()
        }
    }

    fn setup() -> (Arc<FakeScheduler>, Arc<MemoryRepository>, RepositoryHandler<FakeScheduler>) {
        let sched = Arc::new(FakeScheduler::with_partition("default"));
        let repo = Arc::new(MemoryRepository::new());
        let handler = RepositoryHandler::new(sched.clone(), repo.clone(), true);
        (sched, repo, handler)
    }

    fn event(t: EventType, c: ChangeType, id: &str) -> EventRecord {
        let mut ev = EventRecord::new(t, c);
        ev.object_id = id.to_string();
        ev
    }

    #[tokio::test]
    async fn test_app_add_upserts_application() {
        let (sched, repo, handler) = setup();
        sched.put_app(app("app-1", "root.a", "Running"));

        handler
            .handle(&event(EventType::App, ChangeType::Add, "app-1"))
            .await
            .expect("handle");

        let key = app("app-1", "root.a", "").key();
        let row = repo.application(&key).expect("stored");
        assert_eq!(row.value.state, "Running");
        assert!(repo.partition("default").is_some());
    }

    #[tokio::test]
    async fn test_replayed_add_is_idempotent() {
        let (sched, repo, handler) = setup();
        sched.put_app(app("app-1", "root.a", "Running"));
        let ev = event(EventType::App, ChangeType::Add, "app-1");

        handler.handle(&ev).await.expect("handle");
        let key = app("app-1", "root.a", "").key();
        let once = repo.application(&key).expect("stored");

        handler.handle(&ev).await.expect("handle");
        let twice = repo.application(&key).expect("stored");

        assert_eq!(once, twice);
        assert_eq!(repo.application_count(), 1);
    }

    #[tokio::test]
    async fn test_app_remove_soft_marks_with_terminal_state() {
        let (sched, repo, handler) = setup();
        sched.put_app(app("app-1", "root.a", "Running"));
        handler
            .handle(&event(EventType::App, ChangeType::Add, "app-1"))
            .await
            .expect("handle");

        sched.remove_app("app-1");
        let mut remove = event(EventType::App, ChangeType::Remove, "app-1");
        remove.event_change_detail = ChangeDetail(210);
        remove.timestamp_nano = 99;
        handler.handle(&remove).await.expect("handle");

        let row = repo
            .application(&app("app-1", "root.a", "").key())
            .expect("row kept");
        assert_eq!(row.value.state, "Failed");
        assert_eq!(row.value.finished_time, Some(99));
    }

    #[tokio::test]
    async fn test_queue_move_leaves_single_row() {
        let (sched, repo, handler) = setup();
        sched.put_app(app("app-1", "root.a", "Running"));
        handler
            .handle(&event(EventType::App, ChangeType::Add, "app-1"))
            .await
            .expect("add");

        sched.put_app(app("app-1", "root.b", "Running"));
        handler
            .handle(&event(EventType::App, ChangeType::Set, "app-1"))
            .await
            .expect("set");

        assert_eq!(repo.application_count(), 1);
        assert!(repo.application(&app("app-1", "root.a", "").key()).is_none());

        sched.remove_app("app-1");
        let mut remove = event(EventType::App, ChangeType::Remove, "app-1");
        remove.event_change_detail = ChangeDetail(208);
        remove.timestamp_nano = 7;
        handler.handle(&remove).await.expect("remove");

        assert_eq!(repo.application_count(), 1);
        let row = repo
            .application(&app("app-1", "root.b", "").key())
            .expect("moved row kept");
        assert_eq!(row.value.state, "Completed");
        assert_eq!(row.value.finished_time, Some(7));
    }

    #[tokio::test]
    async fn test_resync_follows_queue_move() {
        let (sched, repo, handler) = setup();
        sched.put_app(app("app-1", "root.a", "Running"));
        handler.on_stream_open().await.expect("sync");

        sched.put_app(app("app-1", "root.b", "Running"));
        handler.on_stream_open().await.expect("resync");

        assert_eq!(repo.application_count(), 1);
        assert!(repo.application(&app("app-1", "root.b", "").key()).is_some());
    }

    #[tokio::test]
    async fn test_unknown_app_is_ignored() {
        let (_sched, repo, handler) = setup();
        handler
            .handle(&event(EventType::App, ChangeType::Remove, "ghost"))
            .await
            .expect("handle");
        assert_eq!(repo.application_count(), 0);
    }

    #[tokio::test]
    async fn test_app_event_without_id_fails() {
        let (_sched, _repo, handler) = setup();
        let err = handler
            .handle(&event(EventType::App, ChangeType::Add, ""))
            .await
            .expect_err("no id");
        assert!(err.to_string().contains("without object id"));
    }

    #[tokio::test]
    async fn test_queue_remove_deletes_row() {
        let (sched, repo, handler) = setup();
        sched.set_queues(
            "default",
            vec![
                Queue {
                    queue_name: "root".to_string(),
                    partition: "default".to_string(),
                    ..Default::default()
                },
                Queue {
                    queue_name: "root.a".to_string(),
                    partition: "default".to_string(),
                    ..Default::default()
                },
            ],
        );
        handler
            .handle(&event(EventType::Queue, ChangeType::Add, "root.a"))
            .await
            .expect("handle");
        assert_eq!(repo.queue_count(), 2);

        sched.set_queues(
            "default",
            vec![Queue {
                queue_name: "root".to_string(),
                partition: "default".to_string(),
                ..Default::default()
            }],
        );
        handler
            .handle(&event(EventType::Queue, ChangeType::Remove, "root.a"))
            .await
            .expect("handle");
        assert_eq!(repo.queue_count(), 1);
        assert!(repo.queue("default", "root.a").is_none());
    }

    #[tokio::test]
    async fn test_node_remove_deletes_row() {
        let (sched, repo, handler) = setup();
        sched.set_nodes(
            "default",
            vec![Node {
                node_id: "node-1".to_string(),
                partition: "default".to_string(),
                ..Default::default()
            }],
        );
        handler
            .handle(&event(EventType::Node, ChangeType::Add, "node-1"))
            .await
            .expect("handle");
        assert!(repo.node("default", "node-1").is_some());

        sched.set_nodes("default", Vec::new());
        handler
            .handle(&event(EventType::Node, ChangeType::Remove, "node-1"))
            .await
            .expect("handle");
        assert!(repo.node("default", "node-1").is_none());
    }

    #[tokio::test]
    async fn test_unmaterialized_types_skip_repository() {
        let (sched, repo, handler) = setup();
        handler
            .handle(&event(EventType::Request, ChangeType::Add, "ask-1"))
            .await
            .expect("handle");
        assert!(repo.partition("default").is_none());
        assert_eq!(sched.partition_reads(), 0);
    }

    #[tokio::test]
    async fn test_on_stream_open_resyncs() {
        let (sched, repo, handler) = setup();
        sched.put_app(app("app-1", "root.a", "Running"));
        sched.put_app(app("app-2", "root.b", "Completed"));

        handler.on_stream_open().await.expect("sync");
        assert_eq!(repo.application_count(), 2);
        assert!(repo.cluster("cluster").is_some());

        // Resync repeats on every open.
        handler.on_stream_open().await.expect("sync");
        assert_eq!(sched.cluster_reads(), 2);
    }

    #[tokio::test]
    async fn test_initial_sync_only_without_resync() {
        let sched = Arc::new(FakeScheduler::with_partition("default"));
        let repo = Arc::new(MemoryRepository::new());
        let handler = RepositoryHandler::new(sched.clone(), repo, false);

        handler.on_stream_open().await.expect("sync");
        handler.on_stream_open().await.expect("sync");
        assert_eq!(sched.cluster_reads(), 1);
    }
}
