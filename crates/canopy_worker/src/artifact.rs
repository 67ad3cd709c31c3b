//! Artifact drafts and their enrichment stages.
//!
//! A draft starts as a raw payload, becomes an uploaded object once the
//! computation has allocated its identity and the bytes are stored, and is
//! registered with a rank right before commit. Only registered drafts turn
//! into committable [`NewArtifact`] rows.

use canopy_protocol::{ArtifactId, ArtifactMeta};
use canopy_state_store::NewArtifact;

use crate::error::{Result, WorkerError};

#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactStage {
    Raw {
        payload: Vec<u8>,
    },
    Uploaded {
        id: ArtifactId,
        store_key: String,
    },
    Registered {
        id: ArtifactId,
        rank: u32,
        store_key: String,
    },
}

impl ArtifactStage {
    pub fn name(&self) -> &'static str {
        match self {
            ArtifactStage::Raw { .. } => "raw",
            ArtifactStage::Uploaded { .. } => "uploaded",
            ArtifactStage::Registered { .. } => "registered",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactDraft {
    pub meta: ArtifactMeta,
    pub stage: ArtifactStage,
}

impl ArtifactDraft {
    pub fn raw(meta: ArtifactMeta, payload: Vec<u8>) -> Self {
        Self {
            meta,
            stage: ArtifactStage::Raw { payload },
        }
    }

    /// Raw payload bytes, while the draft has not been uploaded yet.
    pub fn payload(&self) -> Option<&[u8]> {
        match &self.stage {
            ArtifactStage::Raw { payload } => Some(payload),
            _ => None,
        }
    }

    /// Raw -> Uploaded. Returns the payload so it can be handed to the store.
    pub fn into_uploaded(self, id: ArtifactId, store_key: String) -> Result<(Self, Vec<u8>)> {
        match self.stage {
            ArtifactStage::Raw { payload } => Ok((
                Self {
                    meta: self.meta,
                    stage: ArtifactStage::Uploaded { id, store_key },
                },
                payload,
            )),
            other => Err(stage_error(&self.meta, "upload", &other)),
        }
    }

    /// Uploaded -> Registered.
    pub fn into_registered(self, rank: u32) -> Result<Self> {
        match self.stage {
            ArtifactStage::Uploaded { id, store_key } => Ok(Self {
                meta: self.meta,
                stage: ArtifactStage::Registered {
                    id,
                    rank,
                    store_key,
                },
            }),
            other => Err(stage_error(&self.meta, "register", &other)),
        }
    }

    /// Committable row. Fails unless the draft is registered.
    pub fn into_new_artifact(self) -> Result<NewArtifact> {
        match self.stage {
            ArtifactStage::Registered {
                id,
                rank,
                store_key,
            } => Ok(NewArtifact {
                id,
                rank,
                store_key,
                meta: self.meta,
            }),
            other => Err(stage_error(&self.meta, "commit", &other)),
        }
    }
}

fn stage_error(meta: &ArtifactMeta, action: &str, stage: &ArtifactStage) -> WorkerError {
    WorkerError::Stage(format!(
        "cannot {} artifact '{}' in stage {}",
        action,
        meta.name,
        stage.name()
    ))
}
