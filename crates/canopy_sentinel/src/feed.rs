//! Push channel of computation status changes.
//!
//! Each subscription is a task that tails the event log of one computation.
//! It replays the history first, then forwards new events as they are
//! recorded, interleaved with heartbeat frames. The task ends after the
//! terminal event, when the receiver is dropped, or on sentinel shutdown.

use std::time::Duration;

use canopy_protocol::{CorrelationId, StatusFrame};
use canopy_state_store::EventLog;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const FEED_BUFFER: usize = 32;
const MIN_TICK: Duration = Duration::from_millis(1);

#[derive(Clone)]
pub struct StatusFeed {
    events: EventLog,
    poll_interval: Duration,
    heartbeat_interval: Duration,
    shutdown: CancellationToken,
}

impl StatusFeed {
    pub fn new(
        events: EventLog,
        poll_interval: Duration,
        heartbeat_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            events,
            poll_interval,
            heartbeat_interval,
            shutdown,
        }
    }

    pub fn subscribe(&self, id: CorrelationId) -> mpsc::Receiver<StatusFrame> {
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        tokio::spawn(self.clone().pump(id, tx));
        rx
    }

    async fn pump(self, id: CorrelationId, tx: mpsc::Sender<StatusFrame>) {
        debug!(correlation_id = %id, "Subscriber attached");

        let mut poll = tokio::time::interval(self.poll_interval.max(MIN_TICK));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval.max(MIN_TICK));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        heartbeat.tick().await;

        let mut after_seq = 0;
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                _ = tx.closed() => break,

                _ = poll.tick() => {
                    let events = match self.events.events_after(&id, after_seq).await {
                        Ok(events) => events,
                        Err(err) => {
                            warn!(correlation_id = %id, error = %err, "Status poll failed");
                            continue;
                        }
                    };
                    for event in events {
                        after_seq = event.seq;
                        let frame = StatusFrame::Event(event);
                        let terminal = frame.is_terminal();
                        if tx.send(frame).await.is_err() || terminal {
                            debug!(correlation_id = %id, terminal, "Subscription finished");
                            return;
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    if tx.send(StatusFrame::Heartbeat { at: Utc::now() }).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(correlation_id = %id, "Subscriber detached");
    }
}
