//! Request admission: validation, dedup policy, cancellation and lookups.

mod common;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use canopy_db::{CanopyDb, DbError};
use canopy_protocol::{
    queue_name, Aoi, CacheOverride, ComputationState, DispatchMessage, ErrorKind, Geometry,
    MessageId, RequestId, ShelfLife, ValidationError,
};
use canopy_sentinel::{Sentinel, SentinelConfig, SentinelError, SubmitRequest};
use canopy_state_store::{CancelOutcome, Delivery, StateStoreError, Transport};
use common::*;
use serde_json::json;

struct OfflineTransport;

#[async_trait]
impl Transport for OfflineTransport {
    async fn publish(
        &self,
        _: &str,
        _: &DispatchMessage,
        _: Duration,
    ) -> canopy_state_store::Result<MessageId> {
        Err(StateStoreError::Db(DbError::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "broker offline",
        ))))
    }

    async fn consume(&self, _: &str, _: &str) -> canopy_state_store::Result<Option<Delivery>> {
        Ok(None)
    }

    async fn ack(&self, _: &Delivery) -> canopy_state_store::Result<()> {
        Ok(())
    }

    async fn reject(&self, _: &Delivery, _: bool) -> canopy_state_store::Result<()> {
        Ok(())
    }

    async fn expire_due(&self, _: i64) -> canopy_state_store::Result<u64> {
        Ok(0)
    }

    async fn redeliver_stale(&self, _: Duration, _: i64) -> canopy_state_store::Result<u64> {
        Ok(0)
    }
}

async fn computation_count(sentinel: &Sentinel) -> u64 {
    let mut total = 0;
    for state in ComputationState::ALL {
        total += sentinel
            .context()
            .store
            .computations()
            .count_by_state(state)
            .await
            .unwrap();
    }
    total
}

#[tokio::test]
async fn test_unknown_plugin_is_rejected_without_writes() {
    let (_tmp, sentinel) = sentinel().await;

    let err = sentinel
        .submit(SubmitRequest::new("ndvi", json!({}), polygon_p()))
        .await
        .unwrap_err();
    assert!(matches!(err, SentinelError::UnknownPlugin(ref id) if id == "ndvi"));
    assert!(err.is_validation());
    assert_eq!(computation_count(&sentinel).await, 0);
}

#[tokio::test]
async fn test_malformed_input_is_rejected_without_writes() {
    let (_tmp, sentinel) = sentinel().await;

    let err = sentinel.submit(request(json!([1, 2]))).await.unwrap_err();
    assert!(matches!(
        err,
        SentinelError::Validation(ValidationError::ParamsNotObject)
    ));

    let sliver = Aoi::new(Geometry::Polygon(vec![vec![
        [8.0, 49.0],
        [9.0, 49.0],
        [8.0, 49.0],
    ]]));
    let err = sentinel
        .submit(SubmitRequest::new(PLUGIN, json!({}), sliver))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SentinelError::Validation(ValidationError::DegenerateRing { .. })
    ));

    let err = sentinel
        .submit(SubmitRequest::new(" ", json!({}), polygon_p()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SentinelError::Validation(ValidationError::EmptyPluginId)
    ));

    assert_eq!(computation_count(&sentinel).await, 0);
}

#[tokio::test]
async fn test_equivalent_requests_fold() {
    let (_tmp, sentinel) = sentinel().await;

    let first = sentinel
        .submit(request(json!({"x": 1, "y": 2.0, "opts": {"a": true, "b": null}})))
        .await
        .unwrap();

    let rotated = Aoi::new(Geometry::MultiPolygon(vec![vec![vec![
        [8.71, 49.42],
        [8.71, 49.39],
        [8.67, 49.39],
        [8.67, 49.42],
        [8.71, 49.42],
    ]]]))
    .with_labels("Altstadt", "hd-2");
    let second = sentinel
        .submit(SubmitRequest::new(
            PLUGIN,
            json!({"opts": {"b": null, "a": true}, "y": 2, "x": 1.0}),
            rotated,
        ))
        .await
        .unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn test_stored_params_are_normalized() {
    let (_tmp, sentinel) = sentinel().await;
    let id = sentinel.submit(request(json!({"x": 1.0}))).await.unwrap();

    let record = sentinel
        .context()
        .store
        .computations()
        .get(&id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.params, json!({"x": 1}));
    assert_eq!(record.plugin_version, "1.0.0");
}

#[tokio::test]
async fn test_cache_override_never_always_creates() {
    let (_tmp, sentinel) = sentinel().await;

    let a = sentinel
        .submit(x1().with_cache_override(CacheOverride::Never))
        .await
        .unwrap();
    let b = sentinel
        .submit(x1().with_cache_override(CacheOverride::Never))
        .await
        .unwrap();
    assert_ne!(a, b);

    // A never-cached computation is not matched by a normal request either.
    let c = sentinel.submit(x1()).await.unwrap();
    assert_ne!(c, a);
    assert_ne!(c, b);
}

#[tokio::test]
async fn test_cache_override_forever_outlives_plugin_shelf_life() {
    let (_tmp, sentinel) = sentinel_with(
        SentinelConfig::default(),
        ShelfLife::For(Duration::from_secs(1)),
    )
    .await;
    let t0 = CanopyDb::now_millis();
    let ten_years = 10 * 365 * 24 * 3600 * 1000_i64;

    let first = sentinel
        .submit_at(&x1().with_cache_override(CacheOverride::Forever), t0)
        .await
        .unwrap();
    let later = sentinel.submit_at(&x1(), t0 + ten_years).await.unwrap();
    assert_eq!(later.correlation_id, first.correlation_id);
}

#[tokio::test]
async fn test_dedup_disabled_in_config() {
    let config = SentinelConfig {
        deduplicate: false,
        ..SentinelConfig::default()
    };
    let (_tmp, sentinel) = sentinel_with(config, ShelfLife::Forever).await;

    let a = sentinel.submit(x1()).await.unwrap();
    let b = sentinel.submit(x1()).await.unwrap();
    assert_ne!(a, b);
}

#[tokio::test]
async fn test_concurrent_identical_submissions_fold() {
    let (_tmp, sentinel) = sentinel().await;
    let sentinel = Arc::new(sentinel);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let sentinel = Arc::clone(&sentinel);
        handles.push(tokio::spawn(async move { sentinel.submit(x1()).await.unwrap() }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }

    assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(computation_count(&sentinel).await, 1);
    let pending = sentinel
        .context()
        .store
        .transport()
        .pending_count(&queue_name(PLUGIN))
        .await
        .unwrap();
    assert_eq!(pending, 1);
}

#[tokio::test]
async fn test_resolve_request_keeps_each_callers_labels() {
    let (_tmp, sentinel) = sentinel().await;
    let now = CanopyDb::now_millis();

    let first = sentinel.submit_at(&x1(), now).await.unwrap();
    let relabelled = SubmitRequest::new(
        PLUGIN,
        json!({"x": 1}),
        polygon_p().with_labels("Neuenheim", "hd-9"),
    );
    let second = sentinel.submit_at(&relabelled, now + 1).await.unwrap();
    assert_eq!(second.correlation_id, first.correlation_id);

    let record = sentinel.resolve_request(&second.request_id).await.unwrap();
    assert_eq!(record.correlation_id, first.correlation_id);
    assert_eq!(record.aoi_name.as_deref(), Some("Neuenheim"));
    assert_eq!(record.aoi_id.as_deref(), Some("hd-9"));

    let err = sentinel.resolve_request(&RequestId::new()).await.unwrap_err();
    assert!(matches!(err, SentinelError::NotFound(_)));
}

#[tokio::test]
async fn test_cancel_queued_revokes_message() {
    let (_tmp, sentinel) = sentinel().await;
    let id = sentinel.submit(x1()).await.unwrap();

    assert_eq!(sentinel.cancel(&id).await.unwrap(), CancelOutcome::Revoked);

    let view = sentinel.get_state(&id).await.unwrap();
    assert_eq!(view.state, ComputationState::Failure);
    assert_eq!(view.error_kind, Some(ErrorKind::Cancelled));
    let pending = sentinel
        .context()
        .store
        .transport()
        .pending_count(&queue_name(PLUGIN))
        .await
        .unwrap();
    assert_eq!(pending, 0);

    assert_eq!(
        sentinel.cancel(&id).await.unwrap(),
        CancelOutcome::AlreadyTerminal(ComputationState::Failure)
    );

    // A cancelled computation does not absorb the next request.
    let fresh = sentinel.submit(x1()).await.unwrap();
    assert_ne!(fresh, id);
}

#[tokio::test]
async fn test_cancel_started_sets_flag() {
    let (_tmp, sentinel) = sentinel().await;
    let callbacks = sentinel.context().store.callbacks();
    let id = sentinel.submit(x1()).await.unwrap();
    let now = CanopyDb::now_millis();
    callbacks.claim(&id, "w", now).await.unwrap();

    assert_eq!(sentinel.cancel(&id).await.unwrap(), CancelOutcome::Requested);
    let reply = callbacks.heartbeat(&id, now + 1).await.unwrap();
    assert!(reply.alive);
    assert!(reply.cancel_requested);
    assert_eq!(state_of(&sentinel, &id).await, ComputationState::Started);
}

#[tokio::test]
async fn test_unknown_ids() {
    let (_tmp, sentinel) = sentinel().await;
    let id = canopy_protocol::CorrelationId::new();

    assert!(matches!(
        sentinel.get_state(&id).await,
        Err(SentinelError::NotFound(_))
    ));
    assert!(matches!(
        sentinel.subscribe(&id).await,
        Err(SentinelError::NotFound(_))
    ));
    assert_eq!(sentinel.cancel(&id).await.unwrap(), CancelOutcome::NotFound);
    assert!(sentinel.list_artifacts(&id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_dispatch_failure_abandons_computation() {
    let (_tmp, ctx) = context().await;
    let sentinel = Sentinel::new(
        ctx.with_transport(Arc::new(OfflineTransport)),
        SentinelConfig::default(),
    );
    sentinel
        .register_plugin(&registration(PLUGIN, ShelfLife::Forever))
        .await
        .unwrap();

    let err = sentinel.submit(x1()).await.unwrap_err();
    assert!(matches!(err, SentinelError::Store(_)));
    assert!(!err.is_validation());

    let computations = sentinel.context().store.computations();
    assert_eq!(
        computations.count_by_state(ComputationState::Failure).await.unwrap(),
        1
    );
    assert_eq!(
        computations.count_by_state(ComputationState::Queued).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn test_plugin_catalog() {
    let (_tmp, sentinel) = sentinel().await;
    sentinel
        .register_plugin(&registration("ghg_budget", ShelfLife::Never))
        .await
        .unwrap();

    let ids: Vec<String> = sentinel
        .list_plugins()
        .await
        .unwrap()
        .into_iter()
        .map(|plugin| plugin.plugin_id)
        .collect();
    assert_eq!(ids, vec!["ghg_budget".to_string(), PLUGIN.to_string()]);
}
