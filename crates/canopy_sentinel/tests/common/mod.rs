#![allow(dead_code)]

use std::time::Duration;

use canopy_db::CanopyDb;
use canopy_protocol::{Aoi, ComputationState, CorrelationId, Geometry, PluginRegistration, ShelfLife};
use canopy_sentinel::{Sentinel, SentinelConfig, SubmitRequest};
use canopy_state_store::{CanopyContext, StateStore};
use serde_json::{json, Value};
use tempfile::TempDir;

pub const PLUGIN: &str = "heat_islands";
pub const ONE_DAY: Duration = Duration::from_secs(24 * 3600);

pub async fn context() -> (TempDir, CanopyContext) {
    let tmp = TempDir::new().unwrap();
    let db = CanopyDb::open(tmp.path().join("state.sqlite")).await.unwrap();
    (tmp, CanopyContext::from_store(StateStore::from_db(db)))
}

/// Sentinel over a fresh store with `PLUGIN` registered.
pub async fn sentinel_with(config: SentinelConfig, shelf_life: ShelfLife) -> (TempDir, Sentinel) {
    let (tmp, ctx) = context().await;
    let sentinel = Sentinel::new(ctx, config);
    sentinel
        .register_plugin(&registration(PLUGIN, shelf_life))
        .await
        .unwrap();
    (tmp, sentinel)
}

pub async fn sentinel() -> (TempDir, Sentinel) {
    sentinel_with(SentinelConfig::default(), ShelfLife::For(ONE_DAY)).await
}

pub fn registration(plugin_id: &str, shelf_life: ShelfLife) -> PluginRegistration {
    PluginRegistration {
        plugin_id: plugin_id.to_string(),
        version: "1.0.0".to_string(),
        shelf_life,
        description: format!("{} test plugin", plugin_id),
    }
}

pub fn polygon_p() -> Aoi {
    Aoi::new(Geometry::Polygon(vec![vec![
        [8.67, 49.39],
        [8.71, 49.39],
        [8.71, 49.42],
        [8.67, 49.42],
        [8.67, 49.39],
    ]]))
    .with_labels("Heidelberg", "hd-1")
}

pub fn request(params: Value) -> SubmitRequest {
    SubmitRequest::new(PLUGIN, params, polygon_p())
}

pub fn x1() -> SubmitRequest {
    request(json!({"x": 1}))
}

pub async fn state_of(sentinel: &Sentinel, id: &CorrelationId) -> ComputationState {
    sentinel.get_state(id).await.unwrap().state
}

/// Poll until `id` reaches a terminal state.
pub async fn wait_terminal(sentinel: &Sentinel, id: &CorrelationId) -> ComputationState {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let state = state_of(sentinel, id).await;
        if state.is_terminal() {
            return state;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "computation {} stuck in {:?}",
            id,
            state
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
