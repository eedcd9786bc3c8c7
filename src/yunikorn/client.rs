use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use tracing::debug;

use super::stream::{EventStream, StreamClient, StreamError};
use crate::config::YunikornConfig;
use crate::model::{
    flatten_queues, Application, Cluster, HistoryEntry, HistoryType, Node, Partition,
    PartitionNodesUtil, Queue,
};

pub const EVENT_STREAM_PATH: &str = "/ws/v1/events/stream";

/// Callback type for recording request metrics.
/// Receives (endpoint_name, status, duration).
pub type MetricsCallback = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;

/// Application listing filter of the partition applications endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationStatus {
    Active,
    Rejected,
    Completed,
}

impl ApplicationStatus {
    pub const ALL: [Self; 3] = [Self::Active, Self::Rejected, Self::Completed];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Rejected => "rejected",
            Self::Completed => "completed",
        }
    }
}

/// Scheduler state endpoints read by the event handler.
pub trait SchedulerClient: Send + Sync {
    fn get_clusters(&self) -> impl Future<Output = Result<Vec<Cluster>>> + Send;

    fn get_partitions(&self) -> impl Future<Output = Result<Vec<Partition>>> + Send;

    /// Queue hierarchy of a partition, flattened.
    fn get_partition_queues(
        &self,
        partition: &str,
    ) -> impl Future<Output = Result<Vec<Queue>>> + Send;

    fn get_partition_nodes(&self, partition: &str)
        -> impl Future<Output = Result<Vec<Node>>> + Send;

    fn get_applications(
        &self,
        partition: &str,
        status: ApplicationStatus,
    ) -> impl Future<Output = Result<Vec<Application>>> + Send;

    /// `None` when the scheduler no longer knows the application.
    fn get_application(
        &self,
        partition: &str,
        app_id: &str,
    ) -> impl Future<Output = Result<Option<Application>>> + Send;

    fn get_application_history(&self) -> impl Future<Output = Result<Vec<HistoryEntry>>> + Send;

    fn get_container_history(&self) -> impl Future<Output = Result<Vec<HistoryEntry>>> + Send;

    fn get_node_utilizations(
        &self,
    ) -> impl Future<Output = Result<Vec<PartitionNodesUtil>>> + Send;
}

/// HTTP client for the scheduler REST API.
pub struct Client {
    http: reqwest::Client,
    // No overall timeout: the event stream body is unbounded.
    stream_http: reqwest::Client,
    endpoint: String,
    metrics: Option<MetricsCallback>,
}

impl Client {
    /// Create a new scheduler client.
    pub fn new(cfg: &YunikornConfig) -> Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        let stream_http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .context("building streaming HTTP client")?;

        Ok(Self {
            http,
            stream_http,
            endpoint: cfg.base_url(),
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Record a request metric.
    fn record_request(&self, endpoint: &str, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(endpoint, status, duration);
        }
    }

    /// Perform a GET request and deserialize the JSON response.
    ///
    /// A 404 yields `Ok(None)`.
    async fn get_json_opt<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let start = Instant::now();
        let endpoint = endpoint_from_path(path);
        let url = format!("{}{}", self.endpoint, path);

        let response = self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .with_context(|| format!("requesting {path}"))?;

        let status_code = response.status();

        if status_code == reqwest::StatusCode::NOT_FOUND {
            self.record_request(endpoint, "not_found", start.elapsed());
            return Ok(None);
        }

        if !status_code.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.record_request(endpoint, "error", start.elapsed());
            bail!("unexpected status {} from {}: {}", status_code, path, body);
        }

        let result: T = response
            .json()
            .await
            .with_context(|| format!("decoding response from {path}"))?;

        self.record_request(endpoint, "success", start.elapsed());

        Ok(Some(result))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.get_json_opt(path)
            .await?
            .with_context(|| format!("{path} returned 404"))
    }
}

/// Extract a short endpoint name from an API path.
fn endpoint_from_path(path: &str) -> &'static str {
    let segments: Vec<&str> = path.trim_start_matches("/ws/v1/").split('/').collect();
    match segments.as_slice() {
        ["clusters"] => "clusters",
        ["partitions"] => "partitions",
        ["partition", _, "queues"] => "queues",
        ["partition", _, "nodes"] => "nodes",
        ["partition", _, "applications", _] => "applications",
        ["partition", _, "application", _] => "application",
        ["history", "apps"] => "history_apps",
        ["history", "containers"] => "history_containers",
        ["scheduler", "node-utilizations"] => "node_utilizations",
        ["events", "stream"] => "event_stream",
        _ => "other",
    }
}

/// Percent-encodes a path segment.
fn segment(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

// --- JSON response structures ---

/// Totals are serialized as strings by some scheduler versions.
fn lenient_i64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    match Raw::deserialize(d)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApplicationHistoryData {
    timestamp: i64,
    #[serde(deserialize_with = "lenient_i64")]
    total_applications: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerHistoryData {
    timestamp: i64,
    #[serde(deserialize_with = "lenient_i64")]
    total_containers: i64,
}

impl SchedulerClient for Client {
    async fn get_clusters(&self) -> Result<Vec<Cluster>> {
        debug!("fetching clusters");
        self.get_json("/ws/v1/clusters")
            .await
            .context("fetching clusters")
    }

    async fn get_partitions(&self) -> Result<Vec<Partition>> {
        debug!("fetching partitions");
        self.get_json("/ws/v1/partitions")
            .await
            .context("fetching partitions")
    }

    async fn get_partition_queues(&self, partition: &str) -> Result<Vec<Queue>> {
        debug!(partition, "fetching queues");
        let path = format!("/ws/v1/partition/{}/queues", segment(partition));
        let root: Option<Queue> = self
            .get_json_opt(&path)
            .await
            .with_context(|| format!("fetching queues of partition {partition}"))?;

        Ok(root
            .map(|root| flatten_queues(root, partition))
            .unwrap_or_default())
    }

    async fn get_partition_nodes(&self, partition: &str) -> Result<Vec<Node>> {
        debug!(partition, "fetching nodes");
        let path = format!("/ws/v1/partition/{}/nodes", segment(partition));
        let mut nodes: Vec<Node> = self
            .get_json_opt(&path)
            .await
            .with_context(|| format!("fetching nodes of partition {partition}"))?
            .unwrap_or_default();

        for node in &mut nodes {
            if node.partition.is_empty() {
                node.partition = partition.to_string();
            }
        }

        Ok(nodes)
    }

    async fn get_applications(
        &self,
        partition: &str,
        status: ApplicationStatus,
    ) -> Result<Vec<Application>> {
        debug!(partition, status = status.as_str(), "fetching applications");
        let path = format!(
            "/ws/v1/partition/{}/applications/{}",
            segment(partition),
            status.as_str()
        );
        Ok(self
            .get_json_opt(&path)
            .await
            .with_context(|| format!("fetching {} applications", status.as_str()))?
            .unwrap_or_default())
    }

    async fn get_application(&self, partition: &str, app_id: &str) -> Result<Option<Application>> {
        debug!(partition, app_id, "fetching application");
        let path = format!(
            "/ws/v1/partition/{}/application/{}",
            segment(partition),
            segment(app_id)
        );
        self.get_json_opt(&path)
            .await
            .with_context(|| format!("fetching application {app_id}"))
    }

    async fn get_application_history(&self) -> Result<Vec<HistoryEntry>> {
        let data: Vec<ApplicationHistoryData> = self
            .get_json("/ws/v1/history/apps")
            .await
            .context("fetching application history")?;

        Ok(data
            .into_iter()
            .map(|d| HistoryEntry {
                history_type: HistoryType::Application,
                total_number: d.total_applications,
                timestamp: d.timestamp,
            })
            .collect())
    }

    async fn get_container_history(&self) -> Result<Vec<HistoryEntry>> {
        let data: Vec<ContainerHistoryData> = self
            .get_json("/ws/v1/history/containers")
            .await
            .context("fetching container history")?;

        Ok(data
            .into_iter()
            .map(|d| HistoryEntry {
                history_type: HistoryType::Container,
                total_number: d.total_containers,
                timestamp: d.timestamp,
            })
            .collect())
    }

    async fn get_node_utilizations(&self) -> Result<Vec<PartitionNodesUtil>> {
        self.get_json("/ws/v1/scheduler/node-utilizations")
            .await
            .context("fetching node utilizations")
    }
}

#[async_trait]
impl StreamClient for Client {
    async fn open(&self) -> Result<EventStream, StreamError> {
        let url = format!("{}{}", self.endpoint, EVENT_STREAM_PATH);
        let start = Instant::now();

        let response = self
            .stream_http
            .get(&url)
            .send()
            .await
            .map_err(StreamError::Request)?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            self.record_request("event_stream", "error", start.elapsed());
            return Err(StreamError::Connection {
                status: status.as_u16(),
            });
        }

        self.record_request("event_stream", "success", start.elapsed());
        debug!(url = %url, "event stream opened");

        Ok(EventStream::from_response(response))
    }
}
