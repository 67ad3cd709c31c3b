//! Sentinel: the request-facing side of Canopy.
//!
//! Built from an explicit [`CanopyContext`] and torn down with
//! [`Sentinel::shutdown`]. All reads are served from the state store; the
//! sentinel never waits on worker execution.

use canopy_db::CanopyDb;
use canopy_protocol::{
    Artifact, CorrelationId, PluginRegistration, RequestId, RequestRecord, StateView, StatusFrame,
};
use canopy_state_store::{CancelOutcome, CanopyContext, Resolution};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SentinelConfig;
use crate::error::{Result, SentinelError};
use crate::feed::StatusFeed;
use crate::metrics::METRICS;
use crate::reaper::Reaper;
use crate::resolver::{DedupResolver, SubmitRequest};
use crate::router::QueueRouter;

pub struct Sentinel {
    ctx: CanopyContext,
    config: SentinelConfig,
    resolver: DedupResolver,
    reaper: Reaper,
    feed: StatusFeed,
    shutdown: CancellationToken,
    reaper_task: Option<JoinHandle<()>>,
}

impl Sentinel {
    pub fn new(ctx: CanopyContext, config: SentinelConfig) -> Self {
        let shutdown = CancellationToken::new();
        let router = QueueRouter::new(ctx.transport.clone(), config.message_ttl);
        let resolver = DedupResolver::new(ctx.store.clone(), router, config.deduplicate);
        let reaper = Reaper::new(&ctx, &config);
        let feed = StatusFeed::new(
            ctx.store.events().clone(),
            config.feed_poll_interval,
            config.feed_heartbeat_interval,
            shutdown.clone(),
        );

        Self {
            ctx,
            config,
            resolver,
            reaper,
            feed,
            shutdown,
            reaper_task: None,
        }
    }

    pub fn config(&self) -> &SentinelConfig {
        &self.config
    }

    pub fn context(&self) -> &CanopyContext {
        &self.ctx
    }

    pub fn reaper(&self) -> &Reaper {
        &self.reaper
    }

    /// Accept a request; returns the id of the computation serving it.
    pub async fn submit(&self, request: SubmitRequest) -> Result<CorrelationId> {
        let resolution = self.submit_at(&request, CanopyDb::now_millis()).await?;
        Ok(resolution.correlation_id)
    }

    /// [`Sentinel::submit`] at an explicit time, with the request id and
    /// whether a new computation was created.
    pub async fn submit_at(&self, request: &SubmitRequest, now: i64) -> Result<Resolution> {
        self.resolver.resolve(request, now).await
    }

    pub async fn get_state(&self, id: &CorrelationId) -> Result<StateView> {
        self.ctx
            .store
            .computations()
            .get_state(id)
            .await?
            .ok_or_else(|| SentinelError::NotFound(format!("computation {}", id)))
    }

    /// Committed artifacts ordered by rank; empty unless SUCCESS.
    pub async fn list_artifacts(&self, id: &CorrelationId) -> Result<Vec<Artifact>> {
        Ok(self.ctx.store.artifacts().list_artifacts(id).await?)
    }

    /// Stream of status frames for `id`, starting with its full history.
    pub async fn subscribe(&self, id: &CorrelationId) -> Result<mpsc::Receiver<StatusFrame>> {
        if self.ctx.store.computations().get(id).await?.is_none() {
            return Err(SentinelError::NotFound(format!("computation {}", id)));
        }
        Ok(self.feed.subscribe(id.clone()))
    }

    pub async fn cancel(&self, id: &CorrelationId) -> Result<CancelOutcome> {
        let outcome = self
            .ctx
            .store
            .callbacks()
            .cancel(id, CanopyDb::now_millis())
            .await?;
        match outcome {
            CancelOutcome::Revoked | CancelOutcome::Requested => {
                METRICS.inc_cancelled();
                info!(correlation_id = %id, outcome = ?outcome, "Cancel accepted");
            }
            CancelOutcome::AlreadyTerminal(state) => {
                info!(correlation_id = %id, state = %state.as_str(), "Cancel ignored: already terminal");
            }
            CancelOutcome::NotFound => {}
        }
        Ok(outcome)
    }

    pub async fn resolve_request(&self, request_id: &RequestId) -> Result<RequestRecord> {
        self.ctx
            .store
            .computations()
            .resolve_request(request_id)
            .await?
            .ok_or_else(|| SentinelError::NotFound(format!("request {}", request_id)))
    }

    pub async fn register_plugin(&self, registration: &PluginRegistration) -> Result<()> {
        self.ctx
            .store
            .plugins()
            .register(registration, CanopyDb::now_millis())
            .await?;
        Ok(())
    }

    pub async fn list_plugins(&self) -> Result<Vec<PluginRegistration>> {
        Ok(self.ctx.store.plugins().list().await?)
    }

    /// Start the periodic reaper. Calling it again has no effect.
    pub fn spawn_reaper(&mut self) {
        if self.reaper_task.is_some() {
            return;
        }
        let reaper = self.reaper.clone();
        let shutdown = self.shutdown.clone();
        self.reaper_task = Some(tokio::spawn(reaper.run(shutdown)));
    }

    /// Stop the reaper and every subscription, then close the state store.
    pub async fn shutdown(mut self) {
        info!("Sentinel shutting down");
        self.shutdown.cancel();
        if let Some(task) = self.reaper_task.take() {
            if let Err(err) = task.await {
                warn!("Reaper task failed during shutdown: {:?}", err);
            }
        }
        self.ctx.shutdown().await;
        info!(
            submitted = METRICS.snapshot().computations_submitted,
            "Sentinel stopped"
        );
    }
}
