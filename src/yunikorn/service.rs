//! Event dispatcher.
//!
//! [`Service::process_events`] owns the stream for its whole lifetime:
//!
//! ```text
//! Idle -> Connecting -> Streaming -> Reconnecting -> Connecting -> ...
//!                           |
//!                           +-> Draining -> Stopped   (cancelled mid-handler)
//!          any state ---------------------> Stopped   (cancelled)
//! ```
//!
//! Records are counted and handed to the [`EventHandler`] strictly one at a
//! time in wire order. A record that fails to decode, or whose handler fails,
//! is reported and skipped. Only cancellation, a non-retryable open failure
//! or exhausting the reconnect budget ends the loop.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::stream::{EventStream, StreamClient, StreamError};
use crate::config::StreamConfig;
use crate::event::{DecodedLine, EventRecord, StreamDecoder};
use crate::export::health::HealthMetrics;
use crate::repository::EventRepository;

/// Downstream consumer of decoded records.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Materialize one record. Errors are reported and the stream continues.
    async fn handle(&self, event: &EventRecord) -> anyhow::Result<()>;

    /// Called after every successful open, before the first record.
    async fn on_stream_open(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<T: EventHandler + ?Sized> EventHandler for Arc<T> {
    async fn handle(&self, event: &EventRecord) -> anyhow::Result<()> {
        (**self).handle(event).await
    }

    async fn on_stream_open(&self) -> anyhow::Result<()> {
        (**self).on_stream_open().await
    }
}

/// Handler that only lets records be counted.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

#[async_trait]
impl EventHandler for NoopHandler {
    async fn handle(&self, _event: &EventRecord) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Idle,
    Connecting,
    Streaming,
    Reconnecting,
    Draining,
    Stopped,
}

impl ServiceState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Reconnecting => "reconnecting",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }

    /// Value exported on the `service_state` gauge.
    pub const fn as_gauge(self) -> f64 {
        match self {
            Self::Idle => 0.0,
            Self::Connecting => 1.0,
            Self::Streaming => 2.0,
            Self::Reconnecting => 3.0,
            Self::Draining => 4.0,
            Self::Stopped => 5.0,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("gave up after {attempts} consecutive failed connects: {last}")]
    ReconnectAttemptsExhausted {
        attempts: u32,
        #[source]
        last: StreamError,
    },

    #[error("event stream cannot be opened: {0}")]
    Fatal(#[source] StreamError),
}

/// How one streaming session ended.
enum Session {
    Cancelled,
    Ended(StreamError),
}

/// Drives the event stream through the decoder into the repository and the
/// handler.
pub struct Service<C, H> {
    client: C,
    events: Arc<dyn EventRepository>,
    handler: H,
    cfg: StreamConfig,
    metrics: Option<Arc<HealthMetrics>>,
    state: watch::Sender<ServiceState>,
}

impl<C, H> Service<C, H>
where
    C: StreamClient,
    H: EventHandler,
{
    pub fn new(client: C, events: Arc<dyn EventRepository>, handler: H, cfg: StreamConfig) -> Self {
        let (state, _) = watch::channel(ServiceState::Idle);
        Self {
            client,
            events,
            handler,
            cfg,
            metrics: None,
            state,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    pub fn events(&self) -> &Arc<dyn EventRepository> {
        &self.events
    }

    fn set_state(&self, next: ServiceState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = %prev, to = %next, "service state");
        }
        if let Some(m) = &self.metrics {
            m.service_state.set(next.as_gauge());
        }
    }

    fn set_connected(&self, connected: bool) {
        if let Some(m) = &self.metrics {
            m.stream_connected.set(if connected { 1.0 } else { 0.0 });
        }
    }

    /// Consume the event stream until `cancel` fires.
    ///
    /// Returns `Ok(())` on cancellation. Buffered bytes of a partially
    /// received record are discarded.
    pub async fn process_events(&self, cancel: CancellationToken) -> Result<(), ServiceError> {
        let result = self.run(&cancel).await;
        self.set_connected(false);
        self.set_state(ServiceState::Stopped);
        result
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<(), ServiceError> {
        let mut decoder = StreamDecoder::with_max_line_bytes(self.cfg.max_line_bytes)
            .with_capacity(self.cfg.read_buffer_size);
        let mut backoff = self.cfg.backoff_initial;
        let mut failures: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            self.set_state(ServiceState::Connecting);

            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                opened = self.client.open() => opened,
            };

            match opened {
                Ok(stream) => {
                    failures = 0;
                    backoff = self.cfg.backoff_initial;

                    self.set_state(ServiceState::Streaming);
                    self.set_connected(true);
                    info!("event stream connected");

                    let session = self.stream(stream, &mut decoder, cancel).await;

                    self.set_connected(false);
                    decoder.reset();

                    match session {
                        Session::Cancelled => return Ok(()),
                        Session::Ended(err) => {
                            warn!(error = %err, "event stream interrupted");
                        }
                    }
                }
                Err(err) if !err.is_retryable() => {
                    return Err(ServiceError::Fatal(err));
                }
                Err(err) => {
                    failures += 1;
                    warn!(error = %err, attempt = failures, "opening event stream failed");

                    let max = self.cfg.max_reconnect_attempts;
                    if max > 0 && failures >= max {
                        return Err(ServiceError::ReconnectAttemptsExhausted {
                            attempts: failures,
                            last: err,
                        });
                    }
                }
            }

            self.set_state(ServiceState::Reconnecting);
            if let Some(m) = &self.metrics {
                m.stream_reconnects.inc();
            }
            debug!(backoff = ?backoff, "waiting before reconnect");

            if !wait_or_cancel(backoff, cancel).await {
                return Ok(());
            }
            backoff = backoff.saturating_mul(2).min(self.cfg.backoff_max);
        }
    }

    /// Read one connection until it ends or `cancel` fires.
    async fn stream(
        &self,
        mut stream: EventStream,
        decoder: &mut StreamDecoder,
        cancel: &CancellationToken,
    ) -> Session {
        let resync = self.handler.on_stream_open();
        if self.drive(resync, cancel, "stream open").await.is_break() {
            return Session::Cancelled;
        }

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Session::Cancelled,
                chunk = stream.next_chunk() => chunk,
            };

            match chunk {
                Ok(bytes) => {
                    for line in decoder.push(&bytes) {
                        if self.dispatch(line, cancel).await.is_break() {
                            return Session::Cancelled;
                        }
                    }
                }
                Err(StreamError::Closed) => {
                    if let Some(line) = decoder.finish() {
                        if self.dispatch(line, cancel).await.is_break() {
                            return Session::Cancelled;
                        }
                    }
                    return Session::Ended(StreamError::Closed);
                }
                Err(err) => return Session::Ended(err),
            }
        }
    }

    /// Count and handle one decoded line.
    async fn dispatch(&self, line: DecodedLine, cancel: &CancellationToken) -> ControlFlow<()> {
        let record = match line {
            Ok(record) => record,
            Err(err) => {
                if let Some(m) = &self.metrics {
                    m.decode_errors.inc();
                }
                warn!(error = %err, "skipping undecodable event");
                return ControlFlow::Continue(());
            }
        };

        let start = Instant::now();
        let key = record.key();

        if let Err(err) = self.events.record(&record) {
            warn!(key = %key, error = %err, "counting event failed");
        }
        if let Some(m) = &self.metrics {
            m.record_event(&key);
        }

        let flow = self
            .drive(self.handler.handle(&record), cancel, "event")
            .await;

        if let Some(m) = &self.metrics {
            m.event_processing_duration
                .observe(start.elapsed().as_secs_f64());
        }

        flow
    }

    /// Run a handler future to completion, or, once `cancel` fires, for at
    /// most the shutdown timeout.
    async fn drive<F>(&self, fut: F, cancel: &CancellationToken, what: &str) -> ControlFlow<()>
    where
        F: std::future::Future<Output = anyhow::Result<()>>,
    {
        tokio::pin!(fut);

        tokio::select! {
            result = &mut fut => {
                self.report(result, what);
                ControlFlow::Continue(())
            }
            _ = cancel.cancelled() => {
                self.set_state(ServiceState::Draining);
                match tokio::time::timeout(self.cfg.shutdown_timeout, fut).await {
                    Ok(result) => self.report(result, what),
                    Err(_) => warn!(
                        timeout = ?self.cfg.shutdown_timeout,
                        "{what} handler abandoned at shutdown"
                    ),
                }
                ControlFlow::Break(())
            }
        }
    }

    fn report(&self, result: anyhow::Result<()>, what: &str) {
        if let Err(err) = result {
            if let Some(m) = &self.metrics {
                m.handler_errors.inc();
            }
            warn!(error = %format!("{err:#}"), "{what} handler failed");
        }
    }
}

/// Sleeps for `delay`. Returns false if cancelled first.
async fn wait_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
