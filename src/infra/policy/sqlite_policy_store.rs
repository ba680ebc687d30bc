// SQLite-backed policy store.
//
// One row per (guild, section) holding the section document as JSON. Every
// write takes the next value of a store-wide revision counter, so a guild's
// revision is the highest revision among its rows.

use crate::core::policy::{PolicyError, PolicySection, PolicyStore, StoredPolicy};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};
use tracing::warn;

pub struct SqlitePolicyStore {
    pool: Pool<Sqlite>,
}

fn storage(e: sqlx::Error) -> PolicyError {
    PolicyError::Storage(e.to_string())
}

impl SqlitePolicyStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), PolicyError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS guild_config (
                guild_id INTEGER NOT NULL,
                section TEXT NOT NULL,
                document TEXT NOT NULL,
                revision INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (guild_id, section)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }
}

#[async_trait]
impl PolicyStore for SqlitePolicyStore {
    async fn revision(&self, guild_id: u64) -> Result<i64, PolicyError> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(revision), 0) AS revision FROM guild_config WHERE guild_id = ?",
        )
        .bind(guild_id as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;
        Ok(row.get("revision"))
    }

    async fn load_sections(&self, guild_id: u64) -> Result<StoredPolicy, PolicyError> {
        let rows = sqlx::query("SELECT section, document, revision FROM guild_config WHERE guild_id = ?")
            .bind(guild_id as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;

        let mut stored = StoredPolicy::default();
        for row in rows {
            let name: String = row.get("section");
            let document: String = row.get("document");
            stored.revision = stored.revision.max(row.get::<i64, _>("revision"));

            let Ok(section) = name.parse::<PolicySection>() else {
                warn!(guild_id, section = %name, "Unknown policy section in store");
                continue;
            };
            match serde_json::from_str(&document) {
                Ok(value) => stored.sections.push((section, value)),
                Err(e) => warn!(guild_id, %section, error = %e, "Stored policy section is not JSON"),
            }
        }
        Ok(stored)
    }

    async fn save_section(
        &self,
        guild_id: u64,
        section: PolicySection,
        value: serde_json::Value,
    ) -> Result<i64, PolicyError> {
        let row = sqlx::query(
            r#"
            INSERT INTO guild_config (guild_id, section, document, revision, updated_at)
            VALUES (?, ?, ?, (SELECT COALESCE(MAX(revision), 0) + 1 FROM guild_config), ?)
            ON CONFLICT(guild_id, section) DO UPDATE SET
                document = excluded.document,
                revision = excluded.revision,
                updated_at = excluded.updated_at
            RETURNING revision
            "#,
        )
        .bind(guild_id as i64)
        .bind(section.as_str())
        .bind(value.to_string())
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;
        Ok(row.get("revision"))
    }
}
