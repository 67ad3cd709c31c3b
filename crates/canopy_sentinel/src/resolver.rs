//! Request admission: validation, fingerprinting, dedup and dispatch.

use canopy_protocol::{
    canonical_params_value, fingerprint, Aoi, CacheOverride, DispatchMessage, PluginRegistration,
    ShelfLife, ValidationError,
};
use canopy_state_store::{NewComputation, Resolution, StateStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::error::{Result, SentinelError};
use crate::metrics::METRICS;
use crate::router::QueueRouter;

/// A caller's request for a computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub plugin_id: String,
    pub params: Value,
    pub aoi: Aoi,
    /// Replaces the plugin's shelf life for this request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_override: Option<CacheOverride>,
}

impl SubmitRequest {
    pub fn new(plugin_id: impl Into<String>, params: Value, aoi: Aoi) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            params,
            aoi,
            cache_override: None,
        }
    }

    pub fn with_cache_override(mut self, cache_override: CacheOverride) -> Self {
        self.cache_override = Some(cache_override);
        self
    }
}

#[derive(Clone)]
pub struct DedupResolver {
    store: StateStore,
    router: QueueRouter,
    deduplicate: bool,
}

impl DedupResolver {
    pub fn new(store: StateStore, router: QueueRouter, deduplicate: bool) -> Self {
        Self {
            store,
            router,
            deduplicate,
        }
    }

    /// Fold `request` into a live computation, or create and dispatch a new one.
    ///
    /// Nothing is written when the request is invalid. A new computation
    /// whose message cannot be published is failed before the error is
    /// returned, so it never blocks later identical requests.
    pub async fn resolve(&self, request: &SubmitRequest, now: i64) -> Result<Resolution> {
        if request.plugin_id.trim().is_empty() {
            return Err(ValidationError::EmptyPluginId.into());
        }
        let plugin = self
            .store
            .plugins()
            .get(&request.plugin_id)
            .await?
            .ok_or_else(|| SentinelError::UnknownPlugin(request.plugin_id.clone()))?;

        let fp = fingerprint(
            &plugin.plugin_id,
            &plugin.version,
            &request.params,
            &request.aoi.geometry,
        )?;
        let params = canonical_params_value(&request.params)?;
        let shelf_life = self.shelf_life(&plugin, request.cache_override);

        let resolution = self
            .store
            .computations()
            .resolve_or_create(
                NewComputation {
                    plugin_id: &plugin.plugin_id,
                    plugin_version: &plugin.version,
                    fingerprint: &fp,
                    params: &params,
                    aoi: &request.aoi,
                    shelf_life,
                },
                now,
            )
            .await?;
        METRICS.inc_submitted();

        if !resolution.created {
            METRICS.inc_deduplicated();
            debug!(
                correlation_id = %resolution.correlation_id,
                request_id = %resolution.request_id,
                "Cache hit"
            );
            return Ok(resolution);
        }

        let message = DispatchMessage {
            correlation_id: resolution.correlation_id.clone(),
            plugin_id: plugin.plugin_id.clone(),
            params,
            aoi: request.aoi.clone(),
        };
        if let Err(err) = self.router.dispatch(&message).await {
            METRICS.inc_dispatch_failures();
            error!(
                correlation_id = %resolution.correlation_id,
                error = %err,
                "Dispatch failed; abandoning computation"
            );
            if let Err(abandon_err) = self
                .store
                .callbacks()
                .abandon_undispatched(&resolution.correlation_id, now)
                .await
            {
                error!(
                    correlation_id = %resolution.correlation_id,
                    error = %abandon_err,
                    "Could not abandon undispatched computation"
                );
            }
            return Err(err.into());
        }

        Ok(resolution)
    }

    fn shelf_life(
        &self,
        plugin: &PluginRegistration,
        cache_override: Option<CacheOverride>,
    ) -> ShelfLife {
        if !self.deduplicate {
            return ShelfLife::Never;
        }
        CacheOverride::apply(cache_override, plugin.shelf_life)
    }
}
