mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use canopy_db::CanopyDb;
use canopy_protocol::{ComputationFailure, ComputationState, ShelfLife, StatusFrame};
use canopy_sentinel::SentinelConfig;
use common::*;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn fast_feed() -> SentinelConfig {
    SentinelConfig {
        feed_poll_interval: Duration::from_millis(10),
        feed_heartbeat_interval: Duration::from_secs(3600),
        ..SentinelConfig::default()
    }
}

async fn next_event(rx: &mut mpsc::Receiver<StatusFrame>) -> Option<StatusFrame> {
    loop {
        match timeout(Duration::from_secs(5), rx.recv()).await.ok()? {
            Some(StatusFrame::Heartbeat { .. }) => continue,
            other => return other,
        }
    }
}

fn state(frame: &StatusFrame) -> ComputationState {
    match frame {
        StatusFrame::Event(event) => event.state,
        StatusFrame::Heartbeat { .. } => panic!("expected an event frame"),
    }
}

#[tokio::test]
async fn test_subscriber_sees_every_transition_then_close() {
    let (_tmp, sentinel) = sentinel_with(fast_feed(), ShelfLife::For(ONE_DAY)).await;
    let callbacks = sentinel.context().store.callbacks();

    let id = sentinel.submit(x1()).await.unwrap();
    let mut rx = sentinel.subscribe(&id).await.unwrap();

    let queued = next_event(&mut rx).await.unwrap();
    assert_eq!(state(&queued), ComputationState::Queued);

    let now = CanopyDb::now_millis();
    callbacks.claim(&id, "w", now).await.unwrap();
    let started = next_event(&mut rx).await.unwrap();
    assert_eq!(state(&started), ComputationState::Started);

    callbacks
        .report_failure(
            &id,
            &ComputationFailure::user("AOI too large"),
            &BTreeMap::new(),
            now + 1,
        )
        .await
        .unwrap();
    let failed = next_event(&mut rx).await.unwrap();
    assert!(failed.is_terminal());
    match &failed {
        StatusFrame::Event(event) => {
            assert_eq!(event.correlation_id, id);
            assert_eq!(event.error_message.as_deref(), Some("AOI too large"));
        }
        StatusFrame::Heartbeat { .. } => unreachable!(),
    }

    // The feed closes after the terminal event.
    assert!(next_event(&mut rx).await.is_none());
}

#[tokio::test]
async fn test_late_subscriber_gets_history() {
    let (_tmp, sentinel) = sentinel_with(fast_feed(), ShelfLife::For(ONE_DAY)).await;

    let id = sentinel.submit(x1()).await.unwrap();
    sentinel.cancel(&id).await.unwrap();

    let mut rx = sentinel.subscribe(&id).await.unwrap();
    let mut seen = Vec::new();
    while let Some(frame) = next_event(&mut rx).await {
        seen.push(state(&frame));
    }
    assert_eq!(seen, vec![ComputationState::Queued, ComputationState::Failure]);
}

#[tokio::test]
async fn test_heartbeat_frames_while_idle() {
    let config = SentinelConfig {
        feed_poll_interval: Duration::from_millis(10),
        feed_heartbeat_interval: Duration::from_millis(20),
        ..SentinelConfig::default()
    };
    let (_tmp, sentinel) = sentinel_with(config, ShelfLife::For(ONE_DAY)).await;
    let id = sentinel.submit(x1()).await.unwrap();
    let mut rx = sentinel.subscribe(&id).await.unwrap();

    let mut heartbeats = 0;
    while heartbeats < 2 {
        let frame = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        if let StatusFrame::Heartbeat { .. } = frame {
            heartbeats += 1;
        }
    }
}

#[tokio::test]
async fn test_shutdown_ends_subscriptions() {
    let (_tmp, sentinel) = sentinel_with(fast_feed(), ShelfLife::For(ONE_DAY)).await;
    let id = sentinel.submit(x1()).await.unwrap();
    let mut rx = sentinel.subscribe(&id).await.unwrap();
    assert!(next_event(&mut rx).await.is_some());

    sentinel.shutdown().await;
    assert!(next_event(&mut rx).await.is_none());
}
