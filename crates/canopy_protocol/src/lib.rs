//! Canopy protocol: types shared across the sentinel, state store and workers.

pub mod aoi;
pub mod canonical;
pub mod defaults;
pub mod fingerprint;
pub mod state;
pub mod types;

pub use aoi::{Aoi, Geometry, Position, Ring};
pub use canopy_ids::{ArtifactId, CorrelationId, IdParseError, MessageId, RequestId};
pub use fingerprint::{canonical_params_value, fingerprint, Fingerprint, ValidationError};
pub use state::{ComputationFailure, ComputationState, ErrorKind};
pub use types::{
    Artifact, ArtifactMeta, CacheOverride, DispatchMessage, PluginRegistration, RequestRecord,
    ShelfLife, StateView, StatusEvent, StatusFrame,
};

/// Work queue serving a plugin.
pub fn queue_name(plugin_id: &str) -> String {
    format!("{}{}", plugin_id, defaults::QUEUE_SUFFIX)
}
