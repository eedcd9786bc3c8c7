//! PostgreSQL durable repository.
//!
//! Every entity is written with `INSERT .. ON CONFLICT (<natural key>) DO
//! UPDATE`, so the surrogate id assigned on first insert survives later
//! upserts and replaying a write is a no-op. Resource vectors and other
//! composite fields are stored as JSONB, name lists as `TEXT[]`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{Repository, RepositoryError, RepositoryResult, SchemaSetupError};
use crate::config::PostgresConfig;
use crate::model::{
    Application, ApplicationKey, Cluster, HistoryEntry, Node, Partition, PartitionNodesUtil, Queue,
    StateLogEntry,
};

/// Statements run in order by [`Repository::setup`]. Existing tables are
/// dropped, so setup always starts from an empty store.
static SCHEMA: &[&str] = &[
    "DROP TABLE IF EXISTS clusters",
    "CREATE TABLE clusters(
        id UUID PRIMARY KEY,
        cluster_name TEXT NOT NULL,
        partition_name TEXT,
        start_time BIGINT,
        build_info JSONB,
        UNIQUE (cluster_name))",
    "DROP TABLE IF EXISTS partitions",
    "CREATE TABLE partitions(
        id UUID PRIMARY KEY,
        cluster_id TEXT NOT NULL,
        name TEXT NOT NULL,
        capacity JSONB,
        used_capacity JSONB,
        utilization JSONB,
        total_nodes BIGINT,
        applications JSONB,
        total_containers BIGINT,
        state TEXT,
        last_state_transition_time BIGINT,
        UNIQUE (name))",
    "DROP TABLE IF EXISTS applications",
    r#"CREATE TABLE applications(
        id UUID PRIMARY KEY,
        app_id TEXT NOT NULL,
        used_resource JSONB,
        max_used_resource JSONB,
        pending_resource JSONB,
        partition TEXT NOT NULL,
        queue_name TEXT NOT NULL,
        submission_time BIGINT,
        finished_time BIGINT,
        requests JSONB,
        allocations JSONB,
        state TEXT,
        "user" TEXT,
        groups TEXT[],
        rejected_message TEXT,
        state_log JSONB,
        place_holder_data JSONB,
        has_reserved BOOLEAN,
        reservations TEXT[],
        max_request_priority INTEGER)"#,
    "CREATE UNIQUE INDEX idx_partition_queue_app_id ON applications (partition, queue_name, app_id)",
    "DROP TABLE IF EXISTS queues",
    "CREATE TABLE queues(
        id UUID PRIMARY KEY,
        queue_name TEXT NOT NULL,
        status TEXT,
        partition TEXT NOT NULL,
        pending_resource JSONB,
        max_resource JSONB,
        guaranteed_resource JSONB,
        allocated_resource JSONB,
        preempting_resource JSONB,
        head_room JSONB,
        is_leaf BOOLEAN,
        is_managed BOOLEAN,
        properties JSONB,
        parent TEXT,
        template_info JSONB,
        children_names TEXT[],
        abs_used_capacity JSONB,
        max_running_apps BIGINT,
        running_apps BIGINT NOT NULL,
        current_priority INTEGER,
        allocating_accepted_apps TEXT[])",
    "CREATE UNIQUE INDEX idx_partition_queue_name ON queues (partition, queue_name)",
    "DROP TABLE IF EXISTS nodes",
    "CREATE TABLE nodes(
        id UUID PRIMARY KEY,
        node_id TEXT NOT NULL,
        partition TEXT NOT NULL,
        host_name TEXT NOT NULL,
        rack_name TEXT,
        attributes JSONB,
        capacity JSONB,
        allocated JSONB,
        occupied JSONB,
        available JSONB,
        utilized JSONB,
        allocations JSONB,
        schedulable BOOLEAN,
        is_reserved BOOLEAN,
        reservations TEXT[])",
    "CREATE UNIQUE INDEX idx_partition_node_id ON nodes (partition, node_id)",
    "DROP TABLE IF EXISTS partition_nodes_util",
    "CREATE TABLE partition_nodes_util(
        id UUID PRIMARY KEY,
        cluster_id TEXT NOT NULL,
        partition TEXT NOT NULL,
        nodes_util_list JSONB)",
    "CREATE UNIQUE INDEX idx_cluster_partition ON partition_nodes_util (cluster_id, partition)",
    "DROP TABLE IF EXISTS history",
    "DROP TYPE IF EXISTS history_type",
    "CREATE TYPE history_type AS ENUM ('container', 'application')",
    "CREATE TABLE history(
        id UUID PRIMARY KEY,
        history_type history_type NOT NULL,
        total_number BIGINT NOT NULL,
        timestamp BIGINT NOT NULL)",
    "CREATE UNIQUE INDEX idx_history_type_timestamp ON history (history_type, timestamp)",
];

/// Tables created by [`SCHEMA`].
pub const TABLES: &[&str] = &[
    "clusters",
    "partitions",
    "applications",
    "queues",
    "nodes",
    "partition_nodes_util",
    "history",
];

const UPSERT_CLUSTER: &str = "
    INSERT INTO clusters (id, cluster_name, partition_name, start_time, build_info)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (cluster_name) DO UPDATE SET
        partition_name = EXCLUDED.partition_name,
        start_time = EXCLUDED.start_time,
        build_info = EXCLUDED.build_info";

const UPSERT_PARTITION: &str = "
    INSERT INTO partitions (id, cluster_id, name, capacity, used_capacity, utilization,
        total_nodes, applications, total_containers, state, last_state_transition_time)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
    ON CONFLICT (name) DO UPDATE SET
        cluster_id = EXCLUDED.cluster_id,
        capacity = EXCLUDED.capacity,
        used_capacity = EXCLUDED.used_capacity,
        utilization = EXCLUDED.utilization,
        total_nodes = EXCLUDED.total_nodes,
        applications = EXCLUDED.applications,
        total_containers = EXCLUDED.total_containers,
        state = EXCLUDED.state,
        last_state_transition_time = EXCLUDED.last_state_transition_time";

const UPSERT_QUEUE: &str = "
    INSERT INTO queues (id, queue_name, status, partition, pending_resource, max_resource,
        guaranteed_resource, allocated_resource, preempting_resource, head_room, is_leaf,
        is_managed, properties, parent, template_info, children_names, abs_used_capacity,
        max_running_apps, running_apps, current_priority, allocating_accepted_apps)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18,
        $19, $20, $21)
    ON CONFLICT (partition, queue_name) DO UPDATE SET
        status = EXCLUDED.status,
        pending_resource = EXCLUDED.pending_resource,
        max_resource = EXCLUDED.max_resource,
        guaranteed_resource = EXCLUDED.guaranteed_resource,
        allocated_resource = EXCLUDED.allocated_resource,
        preempting_resource = EXCLUDED.preempting_resource,
        head_room = EXCLUDED.head_room,
        is_leaf = EXCLUDED.is_leaf,
        is_managed = EXCLUDED.is_managed,
        properties = EXCLUDED.properties,
        parent = EXCLUDED.parent,
        template_info = EXCLUDED.template_info,
        children_names = EXCLUDED.children_names,
        abs_used_capacity = EXCLUDED.abs_used_capacity,
        max_running_apps = EXCLUDED.max_running_apps,
        running_apps = EXCLUDED.running_apps,
        current_priority = EXCLUDED.current_priority,
        allocating_accepted_apps = EXCLUDED.allocating_accepted_apps";

// The state log merge appends incoming entries the stored log lacks, so the
// column only ever grows.
const UPSERT_APPLICATION: &str = r#"
    INSERT INTO applications (id, app_id, used_resource, max_used_resource, pending_resource,
        partition, queue_name, submission_time, finished_time, requests, allocations, state,
        "user", groups, rejected_message, state_log, place_holder_data, has_reserved,
        reservations, max_request_priority)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18,
        $19, $20)
    ON CONFLICT (partition, queue_name, app_id) DO UPDATE SET
        used_resource = EXCLUDED.used_resource,
        max_used_resource = EXCLUDED.max_used_resource,
        pending_resource = EXCLUDED.pending_resource,
        submission_time = EXCLUDED.submission_time,
        finished_time = COALESCE(EXCLUDED.finished_time, applications.finished_time),
        requests = EXCLUDED.requests,
        allocations = EXCLUDED.allocations,
        state = EXCLUDED.state,
        "user" = EXCLUDED."user",
        groups = EXCLUDED.groups,
        rejected_message = EXCLUDED.rejected_message,
        state_log = COALESCE(applications.state_log, '[]'::jsonb) || COALESCE(
            (SELECT jsonb_agg(entry ORDER BY ord)
             FROM jsonb_array_elements(EXCLUDED.state_log) WITH ORDINALITY AS t(entry, ord)
             WHERE NOT COALESCE(applications.state_log, '[]'::jsonb) @> jsonb_build_array(entry)),
            '[]'::jsonb),
        place_holder_data = EXCLUDED.place_holder_data,
        has_reserved = EXCLUDED.has_reserved,
        reservations = EXCLUDED.reservations,
        max_request_priority = EXCLUDED.max_request_priority"#;

const DELETE_APPLICATION: &str = "
    DELETE FROM applications WHERE partition = $1 AND queue_name = $2 AND app_id = $3";

const MARK_APPLICATION_REMOVED: &str = "
    UPDATE applications SET state = $4, finished_time = $5
    WHERE partition = $1 AND queue_name = $2 AND app_id = $3";

const UPSERT_NODE: &str = "
    INSERT INTO nodes (id, node_id, partition, host_name, rack_name, attributes, capacity,
        allocated, occupied, available, utilized, allocations, schedulable, is_reserved,
        reservations)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
    ON CONFLICT (partition, node_id) DO UPDATE SET
        host_name = EXCLUDED.host_name,
        rack_name = EXCLUDED.rack_name,
        attributes = EXCLUDED.attributes,
        capacity = EXCLUDED.capacity,
        allocated = EXCLUDED.allocated,
        occupied = EXCLUDED.occupied,
        available = EXCLUDED.available,
        utilized = EXCLUDED.utilized,
        allocations = EXCLUDED.allocations,
        schedulable = EXCLUDED.schedulable,
        is_reserved = EXCLUDED.is_reserved,
        reservations = EXCLUDED.reservations";

const UPSERT_NODES_UTIL: &str = "
    INSERT INTO partition_nodes_util (id, cluster_id, partition, nodes_util_list)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (cluster_id, partition) DO UPDATE SET
        nodes_util_list = EXCLUDED.nodes_util_list";

const INSERT_HISTORY: &str = "
    INSERT INTO history (id, history_type, total_number, timestamp)
    VALUES ($1, $2::history_type, $3, $4)
    ON CONFLICT (history_type, timestamp) DO NOTHING";

/// Stored application, as read back for verification.
#[derive(Debug, Clone, FromRow)]
pub struct DbApplication {
    pub id: Uuid,
    pub app_id: String,
    pub partition: String,
    pub queue_name: String,
    pub state: Option<String>,
    pub finished_time: Option<i64>,
    pub state_log: Option<Json<Vec<StateLogEntry>>>,
}

fn to_json<T: Serialize>(field: &'static str, value: &T) -> RepositoryResult<Value> {
    serde_json::to_value(value).map_err(|source| RepositoryError::Encode { field, source })
}

/// Shortened statement for error messages.
fn preview(stmt: &str) -> String {
    let flat = stmt.split_whitespace().collect::<Vec<_>>().join(" ");
    flat.chars().take(80).collect()
}

/// PostgreSQL-backed [`Repository`].
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    /// Opens a connection pool sized from `cfg`.
    pub async fn connect(cfg: &PostgresConfig) -> Result<Self> {
        let options = PgConnectOptions::new()
            .host(&cfg.host)
            .port(cfg.port)
            .username(&cfg.username)
            .password(&cfg.password)
            .database(&cfg.db_name);

        let mut pool = PgPoolOptions::new();
        if cfg.pool_max_conns > 0 {
            pool = pool.max_connections(cfg.pool_max_conns);
        }
        if cfg.pool_min_conns > 0 {
            pool = pool.min_connections(cfg.pool_min_conns);
        }
        if !cfg.pool_max_conn_lifetime.is_zero() {
            pool = pool.max_lifetime(cfg.pool_max_conn_lifetime);
        }
        if !cfg.pool_max_conn_idle_time.is_zero() {
            pool = pool.idle_timeout(cfg.pool_max_conn_idle_time);
        }

        let pool = pool
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to PostgreSQL at {}:{}", cfg.host, cfg.port))?;

        tracing::info!(
            connection = %cfg.redacted_connection_string(),
            "PostgreSQL repository connected"
        );

        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Reads one application back by natural key.
    pub async fn fetch_application(
        &self,
        key: &ApplicationKey,
    ) -> RepositoryResult<Option<DbApplication>> {
        sqlx::query_as::<_, DbApplication>(
            "SELECT id, app_id, partition, queue_name, state, finished_time, state_log
             FROM applications WHERE partition = $1 AND queue_name = $2 AND app_id = $3",
        )
        .bind(&key.partition)
        .bind(&key.queue_name)
        .bind(&key.app_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::db("fetch_application"))
    }

    /// Row count of one of the [`TABLES`].
    pub async fn row_count(&self, table: &str) -> RepositoryResult<i64> {
        if !TABLES.contains(&table) {
            return Err(RepositoryError::NotFound(format!("table {table}")));
        }
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .map_err(RepositoryError::db("row_count"))?;
        Ok(count)
    }
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn setup(&self) -> Result<(), SchemaSetupError> {
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|source| SchemaSetupError {
                    statement: preview(stmt),
                    source,
                })?;
        }

        tracing::info!(tables = TABLES.len(), "database schema created");

        Ok(())
    }

    async fn upsert_cluster(&self, cluster: &Cluster) -> RepositoryResult<()> {
        sqlx::query(UPSERT_CLUSTER)
            .bind(Uuid::new_v4())
            .bind(&cluster.cluster_name)
            .bind(&cluster.partition_name)
            .bind(cluster.start_time)
            .bind(to_json("build_info", &cluster.build_info)?)
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::db("upsert_cluster"))?;
        Ok(())
    }

    async fn upsert_partitions(&self, partitions: &[Partition]) -> RepositoryResult<()> {
        let mut tx = self.pool.begin().await.map_err(RepositoryError::db("begin"))?;
        for p in partitions {
            sqlx::query(UPSERT_PARTITION)
                .bind(Uuid::new_v4())
                .bind(&p.cluster_id)
                .bind(&p.name)
                .bind(to_json("capacity", &p.capacity.capacity)?)
                .bind(to_json("used_capacity", &p.capacity.used_capacity)?)
                .bind(to_json("utilization", &p.capacity.utilization)?)
                .bind(p.total_nodes)
                .bind(to_json("applications", &p.applications)?)
                .bind(p.total_containers)
                .bind(&p.state)
                .bind(p.last_state_transition_time)
                .execute(&mut *tx)
                .await
                .map_err(RepositoryError::db("upsert_partition"))?;
        }
        tx.commit().await.map_err(RepositoryError::db("commit"))?;
        Ok(())
    }

    async fn upsert_queues(&self, queues: &[Queue]) -> RepositoryResult<()> {
        let mut tx = self.pool.begin().await.map_err(RepositoryError::db("begin"))?;
        for q in queues {
            sqlx::query(UPSERT_QUEUE)
                .bind(Uuid::new_v4())
                .bind(&q.queue_name)
                .bind(&q.status)
                .bind(&q.partition)
                .bind(to_json("pending_resource", &q.pending_resource)?)
                .bind(to_json("max_resource", &q.max_resource)?)
                .bind(to_json("guaranteed_resource", &q.guaranteed_resource)?)
                .bind(to_json("allocated_resource", &q.allocated_resource)?)
                .bind(to_json("preempting_resource", &q.preempting_resource)?)
                .bind(to_json("head_room", &q.head_room)?)
                .bind(q.is_leaf)
                .bind(q.is_managed)
                .bind(to_json("properties", &q.properties)?)
                .bind(&q.parent)
                .bind(&q.template_info)
                .bind(&q.children_names)
                .bind(to_json("abs_used_capacity", &q.abs_used_capacity)?)
                .bind(q.max_running_apps)
                .bind(q.running_apps)
                .bind(q.current_priority)
                .bind(&q.allocating_accepted_apps)
                .execute(&mut *tx)
                .await
                .map_err(RepositoryError::db("upsert_queue"))?;
        }
        tx.commit().await.map_err(RepositoryError::db("commit"))?;
        Ok(())
    }

    async fn delete_queue(&self, partition: &str, queue_name: &str) -> RepositoryResult<()> {
        sqlx::query("DELETE FROM queues WHERE partition = $1 AND queue_name = $2")
            .bind(partition)
            .bind(queue_name)
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::db("delete_queue"))?;
        Ok(())
    }

    async fn upsert_application(&self, app: &Application) -> RepositoryResult<()> {
        sqlx::query(UPSERT_APPLICATION)
            .bind(Uuid::new_v4())
            .bind(&app.app_id)
            .bind(to_json("used_resource", &app.used_resource)?)
            .bind(to_json("max_used_resource", &app.max_used_resource)?)
            .bind(to_json("pending_resource", &app.pending_resource)?)
            .bind(&app.partition)
            .bind(&app.queue_name)
            .bind(app.submission_time)
            .bind(app.finished_time)
            .bind(&app.requests)
            .bind(&app.allocations)
            .bind(&app.state)
            .bind(&app.user)
            .bind(&app.groups)
            .bind(&app.rejected_message)
            .bind(to_json("state_log", &app.state_log)?)
            .bind(&app.place_holder_data)
            .bind(app.has_reserved)
            .bind(&app.reservations)
            .bind(app.max_request_priority)
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::db("upsert_application"))?;
        Ok(())
    }

    async fn delete_application(&self, key: &ApplicationKey) -> RepositoryResult<()> {
        sqlx::query(DELETE_APPLICATION)
            .bind(&key.partition)
            .bind(&key.queue_name)
            .bind(&key.app_id)
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::db("delete_application"))?;
        Ok(())
    }

    async fn mark_application_removed(
        &self,
        key: &ApplicationKey,
        state: &str,
        finished_time: i64,
    ) -> RepositoryResult<()> {
        sqlx::query(MARK_APPLICATION_REMOVED)
            .bind(&key.partition)
            .bind(&key.queue_name)
            .bind(&key.app_id)
            .bind(state)
            .bind(finished_time)
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::db("mark_application_removed"))?;
        Ok(())
    }

    async fn upsert_nodes(&self, nodes: &[Node]) -> RepositoryResult<()> {
        let mut tx = self.pool.begin().await.map_err(RepositoryError::db("begin"))?;
        for n in nodes {
            sqlx::query(UPSERT_NODE)
                .bind(Uuid::new_v4())
                .bind(&n.node_id)
                .bind(&n.partition)
                .bind(&n.host_name)
                .bind(&n.rack_name)
                .bind(to_json("attributes", &n.attributes)?)
                .bind(to_json("capacity", &n.capacity)?)
                .bind(to_json("allocated", &n.allocated)?)
                .bind(to_json("occupied", &n.occupied)?)
                .bind(to_json("available", &n.available)?)
                .bind(to_json("utilized", &n.utilized)?)
                .bind(&n.allocations)
                .bind(n.schedulable)
                .bind(n.is_reserved)
                .bind(&n.reservations)
                .execute(&mut *tx)
                .await
                .map_err(RepositoryError::db("upsert_node"))?;
        }
        tx.commit().await.map_err(RepositoryError::db("commit"))?;
        Ok(())
    }

    async fn delete_node(&self, partition: &str, node_id: &str) -> RepositoryResult<()> {
        sqlx::query("DELETE FROM nodes WHERE partition = $1 AND node_id = $2")
            .bind(partition)
            .bind(node_id)
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::db("delete_node"))?;
        Ok(())
    }

    async fn upsert_node_utilizations(&self, utils: &[PartitionNodesUtil]) -> RepositoryResult<()> {
        let mut tx = self.pool.begin().await.map_err(RepositoryError::db("begin"))?;
        for u in utils {
            sqlx::query(UPSERT_NODES_UTIL)
                .bind(Uuid::new_v4())
                .bind(&u.cluster_id)
                .bind(&u.partition)
                .bind(&u.nodes_util_list)
                .execute(&mut *tx)
                .await
                .map_err(RepositoryError::db("upsert_node_utilization"))?;
        }
        tx.commit().await.map_err(RepositoryError::db("commit"))?;
        Ok(())
    }

    async fn record_history(&self, entries: &[HistoryEntry]) -> RepositoryResult<()> {
        let mut tx = self.pool.begin().await.map_err(RepositoryError::db("begin"))?;
        for e in entries {
            sqlx::query(INSERT_HISTORY)
                .bind(Uuid::new_v4())
                .bind(e.history_type.as_str())
                .bind(e.total_number)
                .bind(e.timestamp)
                .execute(&mut *tx)
                .await
                .map_err(RepositoryError::db("record_history"))?;
        }
        tx.commit().await.map_err(RepositoryError::db("commit"))?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
