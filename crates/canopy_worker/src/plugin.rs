//! Plugin interface and the per-computation context handed to it.
//!
//! A plugin is a registered implementation of [`Plugin`] selected by
//! `plugin_id`. Its `compute` runs on a blocking thread and produces
//! artifacts through [`ComputeContext::artifact`], which isolates the
//! failure of any single artifact from the rest of the computation.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use canopy_protocol::{Aoi, ArtifactMeta, ComputationFailure, CorrelationId, PluginRegistration};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::artifact::ArtifactDraft;

/// Typed failure returned by plugin code.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Shown to the caller verbatim.
    #[error("{0}")]
    User(String),

    /// The plugin stopped because cancellation was requested.
    #[error("Cancelled")]
    Cancelled,

    /// Anything else. Detail is logged, never shown to the caller.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl PluginError {
    pub fn user(message: impl Into<String>) -> Self {
        PluginError::User(message.into())
    }

    /// Caller-facing failure for this error.
    pub fn to_failure(&self) -> ComputationFailure {
        match self {
            PluginError::User(message) => ComputationFailure::user(message.clone()),
            PluginError::Cancelled => ComputationFailure::cancelled(),
            PluginError::Internal(_) => ComputationFailure::internal(),
        }
    }
}

/// A computation implementation.
pub trait Plugin: Send + Sync + 'static {
    /// Identity, version and shelf life announced to the catalog.
    fn registration(&self) -> PluginRegistration;

    /// Check `params` and return the form `compute` receives.
    ///
    /// A `PluginError::User` is shown to the caller as is. The returned
    /// value is stored on the computation.
    fn validate_params(&self, params: &Value) -> Result<Value, PluginError> {
        Ok(params.clone())
    }

    /// Produce artifacts for `params` over `aoi` through `ctx`.
    ///
    /// Returning `Ok` with no artifacts is allowed; the computation then
    /// fails with the recorded artifact warnings.
    fn compute(&self, ctx: &mut ComputeContext, params: &Value, aoi: &Aoi)
        -> Result<(), PluginError>;
}

/// Content of one artifact as produced by a plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactOutput {
    pub meta: ArtifactMeta,
    pub payload: Vec<u8>,
}

impl ArtifactOutput {
    pub fn new(meta: ArtifactMeta, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            meta,
            payload: payload.into(),
        }
    }
}

/// Per-computation state collected while the plugin runs.
pub struct ComputeContext {
    correlation_id: CorrelationId,
    cancel: CancellationToken,
    drafts: Vec<ArtifactDraft>,
    warnings: BTreeMap<String, String>,
}

impl ComputeContext {
    pub fn new(correlation_id: CorrelationId, cancel: CancellationToken) -> Self {
        Self {
            correlation_id,
            cancel,
            drafts: Vec::new(),
            warnings: BTreeMap::new(),
        }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(PluginError::Cancelled)` once cancellation was requested.
    pub fn check_cancelled(&self) -> Result<(), PluginError> {
        if self.is_cancelled() {
            Err(PluginError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Produce one artifact inside an isolated scope.
    ///
    /// A user error is recorded as the warning `name -> message`; an internal
    /// error or a panic is logged and recorded with an empty message. Either
    /// way the computation goes on. Returns whether the artifact was kept.
    pub fn artifact<F>(&mut self, name: &str, produce: F) -> bool
    where
        F: FnOnce() -> Result<ArtifactOutput, PluginError>,
    {
        match catch_unwind(AssertUnwindSafe(produce)) {
            Ok(Ok(output)) => {
                self.drafts.push(ArtifactDraft::raw(output.meta, output.payload));
                true
            }
            Ok(Err(PluginError::User(message))) => {
                warn!(
                    correlation_id = %self.correlation_id,
                    artifact = name,
                    "Artifact failed: {}", message
                );
                self.warnings.insert(name.to_string(), message);
                false
            }
            Ok(Err(err)) => {
                error!(
                    correlation_id = %self.correlation_id,
                    artifact = name,
                    "Artifact failed: {:?}", err
                );
                self.warnings.insert(name.to_string(), String::new());
                false
            }
            Err(panic) => {
                error!(
                    correlation_id = %self.correlation_id,
                    artifact = name,
                    "Artifact panicked: {}",
                    panic_message(panic.as_ref())
                );
                self.warnings.insert(name.to_string(), String::new());
                false
            }
        }
    }

    pub fn warnings(&self) -> &BTreeMap<String, String> {
        &self.warnings
    }

    pub fn draft_count(&self) -> usize {
        self.drafts.len()
    }

    /// Drafts in creation order, plus the artifact warnings.
    pub fn into_parts(self) -> (Vec<ArtifactDraft>, BTreeMap<String, String>) {
        (self.drafts, self.warnings)
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
