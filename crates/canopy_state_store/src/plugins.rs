use canopy_protocol::{PluginRegistration, ShelfLife};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::info;

use crate::error::Result;

/// Plugins workers have announced, with their version and shelf life.
#[derive(Clone)]
pub struct PluginCatalog {
    pool: SqlitePool,
}

impl PluginCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a plugin registration.
    pub async fn register(&self, registration: &PluginRegistration, now: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO plugins (plugin_id, version, shelf_life_ms, description, registered_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (plugin_id) DO UPDATE SET
                version = excluded.version,
                shelf_life_ms = excluded.shelf_life_ms,
                description = excluded.description,
                registered_at = excluded.registered_at
            "#,
        )
        .bind(&registration.plugin_id)
        .bind(&registration.version)
        .bind(registration.shelf_life.to_column())
        .bind(&registration.description)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!(
            plugin_id = %registration.plugin_id,
            version = %registration.version,
            "Registered plugin"
        );
        Ok(())
    }

    pub async fn get(&self, plugin_id: &str) -> Result<Option<PluginRegistration>> {
        let row = sqlx::query("SELECT * FROM plugins WHERE plugin_id = ?")
            .bind(plugin_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(registration_from_row).transpose()
    }

    pub async fn list(&self) -> Result<Vec<PluginRegistration>> {
        let rows = sqlx::query("SELECT * FROM plugins ORDER BY plugin_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(registration_from_row).collect()
    }
}

fn registration_from_row(row: &SqliteRow) -> Result<PluginRegistration> {
    Ok(PluginRegistration {
        plugin_id: row.try_get("plugin_id")?,
        version: row.try_get("version")?,
        shelf_life: ShelfLife::from_column(row.try_get("shelf_life_ms")?),
        description: row.try_get("description")?,
    })
}
