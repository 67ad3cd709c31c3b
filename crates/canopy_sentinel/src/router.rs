//! Maps plugins to their work queues and publishes dispatch messages.

use std::sync::Arc;
use std::time::Duration;

use canopy_protocol::{queue_name, DispatchMessage, MessageId};
use canopy_state_store::{Result, Transport};
use tracing::debug;

use crate::metrics::METRICS;

#[derive(Clone)]
pub struct QueueRouter {
    transport: Arc<dyn Transport>,
    message_ttl: Duration,
}

impl QueueRouter {
    pub fn new(transport: Arc<dyn Transport>, message_ttl: Duration) -> Self {
        Self {
            transport,
            message_ttl,
        }
    }

    pub fn message_ttl(&self) -> Duration {
        self.message_ttl
    }

    /// Publish `message` to the queue of its plugin.
    ///
    /// The message is dead-lettered if no worker consumes it within the TTL.
    pub async fn dispatch(&self, message: &DispatchMessage) -> Result<MessageId> {
        let queue = queue_name(&message.plugin_id);
        let message_id = self
            .transport
            .publish(&queue, message, self.message_ttl)
            .await?;
        METRICS.inc_dispatched();
        debug!(
            correlation_id = %message.correlation_id,
            message_id = %message_id,
            queue = %queue,
            "Dispatched computation"
        );
        Ok(message_id)
    }
}
