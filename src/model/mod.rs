//! Durable snapshot entities.
//!
//! Field names follow the scheduler's REST payloads so the same types decode
//! API responses and feed the repository. Surrogate ids are owned by the
//! repository; entities here carry only their natural keys.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Resource vector, e.g. `{"memory": 1024, "vcore": 2000}`.
pub type ResourceMap = BTreeMap<String, i64>;

/// Treats an explicit JSON `null` like an absent field.
fn nullable<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub cluster_name: String,
    #[serde(rename = "partition", default)]
    pub partition_name: String,
    #[serde(default)]
    pub start_time: i64,
    #[serde(rename = "rmBuildInformation", default, deserialize_with = "nullable")]
    pub build_info: Vec<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionCapacity {
    #[serde(default, deserialize_with = "nullable")]
    pub capacity: ResourceMap,
    #[serde(default, deserialize_with = "nullable")]
    pub used_capacity: ResourceMap,
    #[serde(default, deserialize_with = "nullable")]
    pub utilization: ResourceMap,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Partition {
    #[serde(default)]
    pub cluster_id: String,
    pub name: String,
    #[serde(default)]
    pub capacity: PartitionCapacity,
    #[serde(default)]
    pub total_nodes: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub applications: BTreeMap<String, i64>,
    #[serde(default)]
    pub total_containers: i64,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub last_state_transition_time: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Queue {
    #[serde(rename = "queuename")]
    pub queue_name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub partition: String,
    #[serde(default, deserialize_with = "nullable")]
    pub pending_resource: ResourceMap,
    #[serde(default, deserialize_with = "nullable")]
    pub max_resource: ResourceMap,
    #[serde(default, deserialize_with = "nullable")]
    pub guaranteed_resource: ResourceMap,
    #[serde(default, deserialize_with = "nullable")]
    pub allocated_resource: ResourceMap,
    #[serde(default, deserialize_with = "nullable")]
    pub preempting_resource: ResourceMap,
    #[serde(rename = "headroom", default, deserialize_with = "nullable")]
    pub head_room: ResourceMap,
    #[serde(default)]
    pub is_leaf: bool,
    #[serde(default)]
    pub is_managed: bool,
    #[serde(default, deserialize_with = "nullable")]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub parent: String,
    #[serde(rename = "template", default)]
    pub template_info: Value,
    /// Nested children as returned by the API. Cleared by [`flatten_queues`].
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Queue>,
    #[serde(default, deserialize_with = "nullable")]
    pub children_names: Vec<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub abs_used_capacity: ResourceMap,
    #[serde(default)]
    pub max_running_apps: i64,
    #[serde(default)]
    pub running_apps: i64,
    #[serde(default)]
    pub current_priority: i32,
    #[serde(default, deserialize_with = "nullable")]
    pub allocating_accepted_apps: Vec<String>,
}

/// Flattens a queue tree into one entry per queue.
///
/// Children are referenced by name only; every entry inherits `partition`
/// when the API left it empty.
pub fn flatten_queues(root: Queue, partition: &str) -> Vec<Queue> {
    let mut out = Vec::new();
    let mut stack = vec![root];

    while let Some(mut queue) = stack.pop() {
        if queue.partition.is_empty() {
            queue.partition = partition.to_string();
        }
        let children = std::mem::take(&mut queue.children);
        if queue.children_names.is_empty() {
            queue.children_names = children.iter().map(|c| c.queue_name.clone()).collect();
        }
        for mut child in children.into_iter().rev() {
            if child.parent.is_empty() {
                child.parent = queue.queue_name.clone();
            }
            stack.push(child);
        }
        out.push(queue);
    }

    out
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateLogEntry {
    pub time: i64,
    pub application_state: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    #[serde(rename = "applicationID")]
    pub app_id: String,
    #[serde(default, deserialize_with = "nullable")]
    pub used_resource: ResourceMap,
    #[serde(default, deserialize_with = "nullable")]
    pub max_used_resource: ResourceMap,
    #[serde(default, deserialize_with = "nullable")]
    pub pending_resource: ResourceMap,
    #[serde(default)]
    pub partition: String,
    #[serde(default)]
    pub queue_name: String,
    #[serde(default)]
    pub submission_time: i64,
    #[serde(default)]
    pub finished_time: Option<i64>,
    #[serde(default)]
    pub requests: Value,
    #[serde(default)]
    pub allocations: Value,
    #[serde(rename = "applicationState", default)]
    pub state: String,
    #[serde(default)]
    pub user: String,
    #[serde(default, deserialize_with = "nullable")]
    pub groups: Vec<String>,
    #[serde(default)]
    pub rejected_message: String,
    #[serde(default, deserialize_with = "nullable")]
    pub state_log: Vec<StateLogEntry>,
    #[serde(rename = "placeholderData", default)]
    pub place_holder_data: Value,
    #[serde(default)]
    pub has_reserved: bool,
    #[serde(default, deserialize_with = "nullable")]
    pub reservations: Vec<String>,
    #[serde(default)]
    pub max_request_priority: i32,
}

impl Application {
    pub fn key(&self) -> ApplicationKey {
        ApplicationKey {
            partition: self.partition.clone(),
            queue_name: self.queue_name.clone(),
            app_id: self.app_id.clone(),
        }
    }
}

/// Appends the entries of `incoming` that `existing` does not already hold.
///
/// The state log only grows: a replayed or shorter log never removes history.
pub fn merge_state_log(existing: &mut Vec<StateLogEntry>, incoming: &[StateLogEntry]) {
    for entry in incoming {
        if !existing.contains(entry) {
            existing.push(entry.clone());
        }
    }
}

/// Natural key of an application row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ApplicationKey {
    pub partition: String,
    pub queue_name: String,
    pub app_id: String,
}

impl fmt::Display for ApplicationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.partition, self.queue_name, self.app_id)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    #[serde(rename = "nodeID")]
    pub node_id: String,
    #[serde(default)]
    pub partition: String,
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub rack_name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "nullable")]
    pub capacity: ResourceMap,
    #[serde(default, deserialize_with = "nullable")]
    pub allocated: ResourceMap,
    #[serde(default, deserialize_with = "nullable")]
    pub occupied: ResourceMap,
    #[serde(default, deserialize_with = "nullable")]
    pub available: ResourceMap,
    #[serde(default, deserialize_with = "nullable")]
    pub utilized: ResourceMap,
    #[serde(default)]
    pub allocations: Value,
    #[serde(default)]
    pub schedulable: bool,
    #[serde(default)]
    pub is_reserved: bool,
    #[serde(default, deserialize_with = "nullable")]
    pub reservations: Vec<String>,
}

/// Node utilization distribution for one partition.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionNodesUtil {
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub partition: String,
    #[serde(rename = "utilizations", default)]
    pub nodes_util_list: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HistoryType {
    Container,
    Application,
}

impl HistoryType {
    /// Returns the stored enum label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Application => "application",
        }
    }
}

impl fmt::Display for HistoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rollup sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryEntry {
    pub history_type: HistoryType,
    pub total_number: i64,
    pub timestamp: i64,
}
