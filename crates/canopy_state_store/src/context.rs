//! Explicit handles shared by the sentinel and workers.

use std::sync::Arc;

use crate::error::Result;
use crate::queue::Transport;
use crate::StateStore;

/// State store plus message transport, built once at startup and passed to
/// every component that needs them.
#[derive(Clone)]
pub struct CanopyContext {
    pub store: StateStore,
    pub transport: Arc<dyn Transport>,
}

impl CanopyContext {
    /// Open the state store at `url` and use its durable SQL transport.
    pub async fn open(url: &str) -> Result<Self> {
        Ok(Self::from_store(StateStore::open(url).await?))
    }

    pub fn from_store(store: StateStore) -> Self {
        let transport: Arc<dyn Transport> = store.transport();
        Self { store, transport }
    }

    /// Swap the transport, keeping the store.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub async fn shutdown(self) {
        self.store.close().await;
    }
}
