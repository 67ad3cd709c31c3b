use canopy_protocol::{Artifact, ArtifactId, CorrelationId};
use sqlx::sqlite::SqlitePool;

use crate::error::Result;
use crate::models::artifact_from_row;

/// Read side of committed artifacts.
#[derive(Clone)]
pub struct ArtifactStore {
    pool: SqlitePool,
}

impl ArtifactStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Artifacts of a computation, ordered by rank.
    ///
    /// Empty unless the computation is SUCCESS. The state check and the
    /// artifact read are one statement, so the answer is never torn.
    pub async fn list_artifacts(&self, id: &CorrelationId) -> Result<Vec<Artifact>> {
        let rows = sqlx::query(
            r#"
            SELECT a.*
            FROM artifacts a
            JOIN computations c ON c.id = a.computation_id
            WHERE a.computation_id = ? AND c.state = 'SUCCESS'
            ORDER BY a.rank ASC
            "#,
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(artifact_from_row).collect()
    }

    pub async fn get_artifact(&self, id: &ArtifactId) -> Result<Option<Artifact>> {
        let row = sqlx::query("SELECT * FROM artifacts WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(artifact_from_row).transpose()
    }
}
