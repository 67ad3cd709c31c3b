#![allow(dead_code)]

use canopy_db::CanopyDb;
use canopy_protocol::{
    fingerprint, Aoi, ArtifactId, ArtifactMeta, Geometry, ShelfLife,
};
use canopy_state_store::{NewArtifact, NewComputation, Resolution, StateStore};
use serde_json::{json, Value};
use tempfile::TempDir;

pub const PLUGIN: &str = "heat_islands";
pub const VERSION: &str = "1.0.0";

pub async fn setup() -> (TempDir, StateStore) {
    let tmp = TempDir::new().unwrap();
    let db = CanopyDb::open(tmp.path().join("state.sqlite")).await.unwrap();
    (tmp, StateStore::from_db(db))
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

pub async fn submit(
    store: &StateStore,
    params: Value,
    shelf_life: ShelfLife,
    now: i64,
) -> Resolution {
    submit_aoi(store, params, &polygon_p(), shelf_life, now).await
}

pub async fn submit_aoi(
    store: &StateStore,
    params: Value,
    aoi: &Aoi,
    shelf_life: ShelfLife,
    now: i64,
) -> Resolution {
    let fp = fingerprint(PLUGIN, VERSION, &params, &aoi.geometry).unwrap();
    store
        .computations()
        .resolve_or_create(
            NewComputation {
                plugin_id: PLUGIN,
                plugin_version: VERSION,
                fingerprint: &fp,
                params: &params,
                aoi,
                shelf_life,
            },
            now,
        )
        .await
        .unwrap()
}

pub fn default_params() -> Value {
    json!({"x": 1})
}

pub fn artifact(rank: u32, name: &str) -> NewArtifact {
    NewArtifact {
        id: ArtifactId::new(),
        rank,
        store_key: format!("test/{}.json", name),
        meta: ArtifactMeta {
            name: name.to_string(),
            filename: format!("{}.json", name),
            content_type: "application/json".to_string(),
            primary: rank == 0,
            tags: ["climate".to_string()].into_iter().collect(),
            summary: format!("{} summary", name),
            legend: Some(json!({"low": "#00f", "high": "#f00"})),
            ..Default::default()
        },
    }
}
