pub mod handler;
pub mod history;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::repository::{EventRepository, InMemoryEventRepository, PostgresRepository, Repository};
use crate::yunikorn::{self, Service, ServiceError};

pub use self::handler::{RepositoryHandler, SyncSummary};
pub use self::history::{HistoryRollup, RollupSummary};

/// Collector wires the scheduler stream, the repositories and the health
/// server together.
pub struct Collector {
    cfg: Config,
    health: Arc<HealthMetrics>,
    events: Arc<InMemoryEventRepository>,
    service: Option<JoinHandle<Result<(), ServiceError>>>,
    rollup: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Collector {
    /// Creates a new Collector, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            events: Arc::new(InMemoryEventRepository::new()),
            service: None,
            rollup: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    pub fn events(&self) -> &Arc<InMemoryEventRepository> {
        &self.events
    }

    /// Start all components and begin consuming the event stream.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Health server first so probes respond during schema setup.
        self.health
            .start(self.events.clone())
            .await
            .context("starting health metrics server")?;
        info!("health metrics server started");

        // 1. Durable repository.
        let repo = PostgresRepository::connect(&self.cfg.postgres)
            .await
            .context("connecting to PostgreSQL")?;
        repo.setup().await.context("setting up database schema")?;
        let repo: Arc<dyn Repository> = Arc::new(repo);
        info!(backend = repo.backend_name(), "repository ready");

        // 2. Scheduler client, shared by the stream and the handler.
        let client = Arc::new(self.create_client()?);
        info!(endpoint = client.endpoint(), "scheduler client created");

        // 3. History rollup.
        if self.cfg.history.enabled {
            let rollup =
                HistoryRollup::new(Arc::clone(&client), Arc::clone(&repo), self.cfg.history.interval)
                    .with_metrics(Arc::clone(&self.health));
            self.rollup = Some(tokio::spawn(rollup.run(self.cancel.child_token())));
            info!(interval = ?self.cfg.history.interval, "history rollup started");
        }

        // 4. Event dispatcher.
        let handler = RepositoryHandler::new(
            Arc::clone(&client),
            repo,
            self.cfg.stream.resync_on_connect,
        )
        .with_metrics(Arc::clone(&self.health));

        let service = Service::new(client, self.events.clone(), handler, self.cfg.stream.clone())
            .with_metrics(Arc::clone(&self.health));

        let cancel = self.cancel.child_token();
        self.service = Some(tokio::spawn(
            async move { service.process_events(cancel).await },
        ));

        info!("collector fully started");

        Ok(())
    }

    /// Resolves when the dispatcher exits on its own, e.g. after the reconnect
    /// budget is spent. Pending forever if the collector was never started.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(handle) = self.service.as_mut() else {
            std::future::pending::<()>().await;
            return Ok(());
        };

        let result = handle.await;
        self.service = None;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e).context("event dispatcher stopped"),
            Err(e) => Err(e).context("event dispatcher task failed"),
        }
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(handle) = self.service.take() {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "event dispatcher stopped with error"),
                Err(e) => error!(error = %e, "event dispatcher task failed"),
            }
        }

        if let Some(handle) = self.rollup.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "history rollup task failed");
            }
        }

        let counts = self.events.counts().unwrap_or_default();
        info!(total = self.events.total(), ?counts, "final event counts");

        self.health.stop().await?;

        Ok(())
    }

    /// Create a scheduler client with metrics callback.
    fn create_client(&self) -> Result<yunikorn::Client> {
        let client =
            yunikorn::Client::new(&self.cfg.yunikorn).context("creating scheduler client")?;

        let health = Arc::clone(&self.health);
        let client = client.with_metrics(Box::new(move |endpoint, status, duration| {
            health.record_api_request(endpoint, status, duration);
        }));

        Ok(client)
    }
}
