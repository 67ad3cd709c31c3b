//! Worker node: consumes one plugin queue and runs computations.
//!
//! - run() consumes self, so it can only be called once
//! - computations are tracked by JoinHandle for bounded concurrency
//! - each computation heartbeats while its plugin runs on a blocking thread
//! - graceful shutdown through a shutdown channel

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use canopy_db::CanopyDb;
use canopy_protocol::{defaults, queue_name, ComputationFailure, CorrelationId, DispatchMessage};
use canopy_state_store::{CanopyContext, Delivery, NewArtifact, TransitionOutcome};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifact::ArtifactDraft;
use crate::error::{Result, WorkerError};
use crate::metrics::METRICS;
use crate::object_store::{artifact_key, ObjectStore};
use crate::plugin::{panic_message, ComputeContext, Plugin, PluginError};
use crate::registry::PluginRegistry;

/// Lower bound for configured intervals; tokio rejects a zero period.
const MIN_TICK: Duration = Duration::from_millis(1);

/// Worker configuration (plain data).
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub plugin_id: String,
    /// Unique per process: `{plugin_id}@{host}-{pid}-{suffix}`.
    pub worker_name: String,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub max_concurrent: usize,
}

impl WorkerConfig {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        let plugin_id = plugin_id.into();
        Self {
            worker_name: worker_name(&plugin_id),
            plugin_id,
            poll_interval: defaults::DEFAULT_WORKER_POLL_INTERVAL,
            heartbeat_interval: defaults::DEFAULT_HEARTBEAT_INTERVAL,
            max_concurrent: defaults::DEFAULT_MAX_CONCURRENT_COMPUTATIONS,
        }
    }
}

pub fn worker_name(plugin_id: &str) -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}@{}-{}-{}", plugin_id, host, std::process::id(), &suffix[..8])
}

/// How a computation run ended, from this worker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed,
    /// The computation left STARTED before this worker could finish it
    /// (timed out or otherwise resolved elsewhere).
    Lost,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    worker_name: String,
    shutdown_tx: mpsc::Sender<()>,
    join_handle: JoinHandle<Result<()>>,
}

impl WorkerHandle {
    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    /// Request graceful shutdown and wait for running computations.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(()).await;
        self.join_handle.await?
    }
}

struct ComputationReport {
    correlation_id: CorrelationId,
    outcome: RunOutcome,
}

pub struct Worker {
    config: WorkerConfig,
    ctx: CanopyContext,
    plugin: Arc<dyn Plugin>,
    object_store: Arc<dyn ObjectStore>,
    queue: String,
    result_tx: mpsc::Sender<ComputationReport>,
    result_rx: mpsc::Receiver<ComputationReport>,
    shutdown_rx: mpsc::Receiver<()>,
    active: HashMap<CorrelationId, JoinHandle<()>>,
}

impl Worker {
    /// Resolve the configured plugin and announce it to the catalog.
    /// Returns the worker and the sender that stops it.
    pub async fn connect(
        ctx: CanopyContext,
        registry: &PluginRegistry,
        object_store: Arc<dyn ObjectStore>,
        config: WorkerConfig,
    ) -> Result<(Self, mpsc::Sender<()>)> {
        let plugin = registry.get(&config.plugin_id)?;
        let registration = plugin.registration();
        ctx.store
            .plugins()
            .register(&registration, CanopyDb::now_millis())
            .await?;

        let queue = queue_name(&config.plugin_id);
        info!(
            worker_name = %config.worker_name,
            plugin_id = %registration.plugin_id,
            version = %registration.version,
            queue = %queue,
            "Worker registered"
        );

        let capacity = config.max_concurrent.max(1);
        let (result_tx, result_rx) = mpsc::channel(capacity * 2);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        Ok((
            Self {
                config,
                ctx,
                plugin,
                object_store,
                queue,
                result_tx,
                result_rx,
                shutdown_rx,
                active: HashMap::new(),
            },
            shutdown_tx,
        ))
    }

    /// Connect and run on a background task.
    pub async fn start(
        ctx: CanopyContext,
        registry: &PluginRegistry,
        object_store: Arc<dyn ObjectStore>,
        config: WorkerConfig,
    ) -> Result<WorkerHandle> {
        let worker_name = config.worker_name.clone();
        let (worker, shutdown_tx) = Self::connect(ctx, registry, object_store, config).await?;
        let join_handle = tokio::spawn(worker.run());
        Ok(WorkerHandle {
            worker_name,
            shutdown_tx,
            join_handle,
        })
    }

    /// Main loop; consumes self.
    pub async fn run(mut self) -> Result<()> {
        info!(worker_name = %self.config.worker_name, queue = %self.queue, "Entering consume loop");

        let mut poll = tokio::time::interval(self.config.poll_interval.max(MIN_TICK));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.reap_completed();

            tokio::select! {
                biased;

                _ = self.shutdown_rx.recv() => {
                    self.wait_for_all().await;
                    break;
                }

                Some(report) = self.result_rx.recv() => {
                    record_report(&report);
                }

                _ = poll.tick() => {
                    if let Err(err) = self.fill_capacity().await {
                        warn!(worker_name = %self.config.worker_name, error = %err, "Queue poll failed");
                    }
                }
            }
        }

        info!(
            worker_name = %self.config.worker_name,
            "Worker stopped: {}",
            METRICS.snapshot().summary()
        );
        Ok(())
    }

    fn reap_completed(&mut self) {
        self.active.retain(|id, handle| {
            if handle.is_finished() {
                debug!(correlation_id = %id, "Reaped finished computation");
                false
            } else {
                true
            }
        });
    }

    async fn fill_capacity(&mut self) -> Result<()> {
        while self.active.len() < self.config.max_concurrent.max(1) {
            let delivery = self
                .ctx
                .transport
                .consume(&self.queue, &self.config.worker_name)
                .await?;
            let Some(delivery) = delivery else {
                break;
            };
            METRICS.inc_deliveries_received();
            self.handle_delivery(delivery).await?;
        }
        Ok(())
    }

    /// Claim the computation, start it, then acknowledge the message.
    ///
    /// A delivery whose computation is no longer QUEUED (duplicate delivery,
    /// revoked or expired) is acknowledged and dropped.
    async fn handle_delivery(&mut self, delivery: Delivery) -> Result<()> {
        let message = delivery.message.clone();
        let id = message.correlation_id.clone();

        if message.plugin_id != self.config.plugin_id {
            warn!(
                correlation_id = %id,
                plugin_id = %message.plugin_id,
                queue = %self.queue,
                "Dead-lettering message for another plugin"
            );
            self.ctx.transport.reject(&delivery, false).await?;
            return Ok(());
        }

        let claim = self
            .ctx
            .store
            .callbacks()
            .claim(&id, &self.config.worker_name, CanopyDb::now_millis())
            .await;
        let claim = match claim {
            Ok(outcome) => outcome,
            Err(err) => {
                // Leave the message for another attempt.
                self.ctx.transport.reject(&delivery, true).await?;
                return Err(err.into());
            }
        };

        if claim == TransitionOutcome::Applied {
            METRICS.inc_computations_started();
            info!(
                correlation_id = %id,
                delivery_count = delivery.delivery_count,
                active = self.active.len() + 1,
                "Starting computation"
            );

            let runner = ComputationRunner {
                ctx: self.ctx.clone(),
                plugin: Arc::clone(&self.plugin),
                object_store: Arc::clone(&self.object_store),
                heartbeat_interval: self.config.heartbeat_interval,
            };
            let tx = self.result_tx.clone();
            let correlation_id = id.clone();
            let handle = tokio::spawn(async move {
                let outcome = runner.run(message).await;
                // Closed only while shutting down.
                let _ = tx
                    .send(ComputationReport {
                        correlation_id,
                        outcome,
                    })
                    .await;
            });
            self.active.insert(id.clone(), handle);
        } else {
            METRICS.inc_deliveries_ignored();
            info!(
                correlation_id = %id,
                delivery_count = delivery.delivery_count,
                "Dropping delivery: computation is not QUEUED"
            );
        }

        if let Err(err) = self.ctx.transport.ack(&delivery).await {
            // The message comes back after the visibility timeout and is
            // then dropped by the failed claim.
            warn!(correlation_id = %id, error = %err, "Ack failed");
        }
        Ok(())
    }

    async fn wait_for_all(&mut self) {
        info!(
            active = self.active.len(),
            "Graceful shutdown: waiting for running computations"
        );
        for (id, handle) in self.active.drain() {
            if let Err(err) = handle.await {
                warn!(correlation_id = %id, "Computation task failed during shutdown: {:?}", err);
            }
        }
        while let Ok(report) = self.result_rx.try_recv() {
            record_report(&report);
        }
    }
}

fn record_report(report: &ComputationReport) {
    match report.outcome {
        RunOutcome::Succeeded => METRICS.inc_computations_succeeded(),
        RunOutcome::Failed => METRICS.inc_computations_failed(),
        RunOutcome::Lost => METRICS.inc_computations_lost(),
    }
    info!(
        correlation_id = %report.correlation_id,
        outcome = ?report.outcome,
        "Computation finished"
    );
}

/// Everything one computation task needs.
struct ComputationRunner {
    ctx: CanopyContext,
    plugin: Arc<dyn Plugin>,
    object_store: Arc<dyn ObjectStore>,
    heartbeat_interval: Duration,
}

impl ComputationRunner {
    async fn run(self, message: DispatchMessage) -> RunOutcome {
        let id = message.correlation_id.clone();
        let started = Instant::now();
        let token = CancellationToken::new();

        // Heartbeat until the terminal transition is written.
        let work = async {
            match self.execute(message, &token).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(correlation_id = %id, error = %err, "Computation failed in the worker runtime");
                    self.fail(&id, &ComputationFailure::internal(), &BTreeMap::new())
                        .await
                }
            }
        };
        tokio::pin!(work);

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval.max(MIN_TICK));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        heartbeat.tick().await;

        let outcome = loop {
            tokio::select! {
                outcome = &mut work => break outcome,
                _ = heartbeat.tick() => self.heartbeat(&id, &token).await,
            }
        };

        METRICS.record_compute_time(started);
        outcome
    }

    async fn execute(&self, message: DispatchMessage, token: &CancellationToken) -> Result<RunOutcome> {
        let id = message.correlation_id.clone();
        let DispatchMessage { params, aoi, .. } = message;

        let plugin = Arc::clone(&self.plugin);
        let validated = match self
            .blocking(&id, move || plugin.validate_params(&params))
            .await?
        {
            Ok(Ok(validated)) => validated,
            Ok(Err(err)) => {
                info!(correlation_id = %id, "Params rejected: {}", err);
                return Ok(self.fail(&id, &err.to_failure(), &BTreeMap::new()).await);
            }
            Err(outcome) => return Ok(outcome),
        };

        let recorded = self
            .ctx
            .store
            .callbacks()
            .record_validated_params(&id, &validated)
            .await?;
        if recorded == TransitionOutcome::Ignored {
            warn!(correlation_id = %id, "Computation no longer running; skipping compute");
            return Ok(RunOutcome::Lost);
        }

        let compute_ctx = ComputeContext::new(id.clone(), token.clone());
        let plugin = Arc::clone(&self.plugin);
        let (compute_ctx, result) = match self
            .blocking(&id, move || {
                let mut compute_ctx = compute_ctx;
                let result = plugin.compute(&mut compute_ctx, &validated, &aoi);
                (compute_ctx, result)
            })
            .await?
        {
            Ok(pair) => pair,
            Err(outcome) => return Ok(outcome),
        };

        let (drafts, mut warnings) = compute_ctx.into_parts();
        METRICS.add_artifact_warnings(warnings.len() as u64);

        if let Err(err) = result {
            match &err {
                PluginError::Internal(detail) => {
                    error!(correlation_id = %id, "Plugin failed: {:?}", detail)
                }
                other => info!(correlation_id = %id, "Plugin failed: {}", other),
            }
            return Ok(self.fail(&id, &err.to_failure(), &warnings).await);
        }

        let Some(artifacts) = self.upload(&id, drafts, &mut warnings).await? else {
            return Ok(RunOutcome::Lost);
        };

        let outcome = self
            .ctx
            .store
            .callbacks()
            .commit_success(&id, &artifacts, &warnings, CanopyDb::now_millis())
            .await?;

        Ok(match outcome {
            TransitionOutcome::Ignored => {
                warn!(correlation_id = %id, "Commit ignored: computation already resolved");
                RunOutcome::Lost
            }
            TransitionOutcome::Applied if artifacts.is_empty() => RunOutcome::Failed,
            TransitionOutcome::Applied => RunOutcome::Succeeded,
        })
    }

    /// Upload drafts in creation order and register them with ranks.
    ///
    /// A failed upload becomes an artifact warning. Returns `None` once the
    /// computation stops being STARTED.
    async fn upload(
        &self,
        id: &CorrelationId,
        drafts: Vec<ArtifactDraft>,
        warnings: &mut BTreeMap<String, String>,
    ) -> Result<Option<Vec<NewArtifact>>> {
        let mut artifacts = Vec::with_capacity(drafts.len());

        for draft in drafts {
            let Some(artifact_id) = self.ctx.store.callbacks().allocate_artifact(id).await? else {
                warn!(correlation_id = %id, "Computation no longer running; skipping upload");
                return Ok(None);
            };

            let name = draft.meta.name.clone();
            let key = artifact_key(id, &artifact_id, &draft.meta.filename);
            let (uploaded, payload) = draft.into_uploaded(artifact_id, key.clone())?;

            match self.object_store.put(&key, payload).await {
                Ok(store_ref) => debug!(
                    correlation_id = %id,
                    artifact = %name,
                    key = %store_ref.key,
                    size = store_ref.size,
                    hash = %store_ref.content_hash,
                    "Uploaded artifact"
                ),
                Err(err) => {
                    error!(correlation_id = %id, artifact = %name, error = %err, "Artifact upload failed");
                    METRICS.add_artifact_warnings(1);
                    warnings.insert(name, String::new());
                    continue;
                }
            }

            let rank = u32::try_from(artifacts.len())
                .map_err(|_| WorkerError::Stage("artifact rank overflow".to_string()))?;
            artifacts.push(uploaded.into_registered(rank)?.into_new_artifact()?);
        }

        METRICS.add_artifacts_uploaded(artifacts.len() as u64);
        Ok(Some(artifacts))
    }

    /// Run plugin code off the async threads.
    ///
    /// A panic fails the computation as internal and comes back as the
    /// recorded outcome.
    async fn blocking<T, F>(&self, id: &CorrelationId, f: F) -> Result<std::result::Result<T, RunOutcome>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        match tokio::task::spawn_blocking(f).await {
            Ok(value) => Ok(Ok(value)),
            Err(err) if err.is_panic() => {
                let payload = err.into_panic();
                error!(correlation_id = %id, "Plugin panicked: {}", panic_message(payload.as_ref()));
                Ok(Err(self
                    .fail(id, &ComputationFailure::internal(), &BTreeMap::new())
                    .await))
            }
            Err(err) => Err(WorkerError::Join(err)),
        }
    }

    async fn heartbeat(&self, id: &CorrelationId, token: &CancellationToken) {
        let reply = self
            .ctx
            .store
            .callbacks()
            .heartbeat(id, CanopyDb::now_millis())
            .await;
        match reply {
            Ok(reply) if !reply.alive => {
                if !token.is_cancelled() {
                    token.cancel();
                    warn!(correlation_id = %id, "Computation no longer STARTED; cancelling plugin");
                }
            }
            Ok(reply) if reply.cancel_requested => {
                if !token.is_cancelled() {
                    token.cancel();
                    info!(correlation_id = %id, "Cancellation requested; signalling plugin");
                }
            }
            Ok(_) => debug!(correlation_id = %id, "Heartbeat"),
            Err(err) => warn!(correlation_id = %id, error = %err, "Heartbeat failed"),
        }
    }

    async fn fail(
        &self,
        id: &CorrelationId,
        failure: &ComputationFailure,
        warnings: &BTreeMap<String, String>,
    ) -> RunOutcome {
        let reported = self
            .ctx
            .store
            .callbacks()
            .report_failure(id, failure, warnings, CanopyDb::now_millis())
            .await;
        match reported {
            Ok(TransitionOutcome::Applied) => RunOutcome::Failed,
            Ok(TransitionOutcome::Ignored) => RunOutcome::Lost,
            Err(err) => {
                error!(correlation_id = %id, error = %err, "Could not record failure");
                RunOutcome::Lost
            }
        }
    }
}
