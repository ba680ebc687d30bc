// SQLite-backed case ledger storage.
//
// Tables:
// - moderation_cases: One row per applied action, case ids allocated per guild
// - appeals: Member appeals with a JSON snapshot of the appealed case

use crate::core::cases::{
    Appeal, AppealStatus, Case, CaseStatus, CaseStore, LedgerError, Moderator, NewCase,
};
use crate::core::moderation::ActionType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite};
use uuid::Uuid;

pub struct SqliteCaseStore {
    pool: Pool<Sqlite>,
}

fn storage(e: sqlx::Error) -> LedgerError {
    LedgerError::Storage(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LedgerError::Storage(format!("bad timestamp '{}': {}", value, e)))
}

impl SqliteCaseStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Run database migrations to create required tables.
    pub async fn migrate(&self) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS moderation_cases (
                guild_id INTEGER NOT NULL,
                case_id INTEGER NOT NULL,
                moderator_id INTEGER NOT NULL,
                target_user_id INTEGER NOT NULL,
                action_type TEXT NOT NULL,
                reason TEXT NOT NULL,
                rule_violated TEXT,
                duration_seconds INTEGER,
                created_at TEXT NOT NULL,
                source_event_id TEXT NOT NULL,
                channel_id INTEGER,
                message_id INTEGER,
                status TEXT NOT NULL DEFAULT 'applied',
                PRIMARY KEY (guild_id, case_id)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_cases_source
                ON moderation_cases(guild_id, source_event_id, action_type);
            CREATE INDEX IF NOT EXISTS idx_cases_target
                ON moderation_cases(guild_id, target_user_id, case_id);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS appeals (
                appeal_id TEXT PRIMARY KEY,
                guild_id INTEGER NOT NULL,
                target_user_id INTEGER NOT NULL,
                case_id INTEGER NOT NULL,
                reason TEXT NOT NULL,
                status TEXT NOT NULL,
                original_case TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_appeals_one_pending
                ON appeals(guild_id, case_id) WHERE status = 'pending';
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(())
    }
}

const CASE_COLUMNS: &str = "guild_id, case_id, moderator_id, target_user_id, action_type, reason, \
     rule_violated, duration_seconds, created_at, source_event_id, channel_id, message_id, status";

fn row_to_case(row: &sqlx::sqlite::SqliteRow) -> Result<Case, LedgerError> {
    let action: String = row.get("action_type");
    let status: String = row.get("status");
    let created_at: String = row.get("created_at");

    Ok(Case {
        case_id: row.get::<i64, _>("case_id") as u64,
        guild_id: row.get::<i64, _>("guild_id") as u64,
        moderator: Moderator::from_id(row.get::<i64, _>("moderator_id") as u64),
        target_user_id: row.get::<i64, _>("target_user_id") as u64,
        action_type: action.parse().map_err(LedgerError::Storage)?,
        reason: row.get("reason"),
        rule_violated: row.get("rule_violated"),
        duration_seconds: row
            .get::<Option<i64>, _>("duration_seconds")
            .map(|d| d as u64),
        created_at: parse_time(&created_at)?,
        source_event_id: row.get("source_event_id"),
        channel_id: row.get::<Option<i64>, _>("channel_id").map(|c| c as u64),
        message_id: row.get::<Option<i64>, _>("message_id").map(|m| m as u64),
        status: status.parse().map_err(LedgerError::Storage)?,
    })
}

fn row_to_appeal(row: &sqlx::sqlite::SqliteRow) -> Result<Appeal, LedgerError> {
    let appeal_id: String = row.get("appeal_id");
    let status: String = row.get("status");
    let snapshot: String = row.get("original_case");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(Appeal {
        appeal_id: Uuid::parse_str(&appeal_id)
            .map_err(|e| LedgerError::Storage(e.to_string()))?,
        guild_id: row.get::<i64, _>("guild_id") as u64,
        target_user_id: row.get::<i64, _>("target_user_id") as u64,
        reason: row.get("reason"),
        status: status.parse().map_err(LedgerError::Storage)?,
        original_case: serde_json::from_str(&snapshot)
            .map_err(|e| LedgerError::Storage(format!("bad case snapshot: {}", e)))?,
        created_at: parse_time(&created_at)?,
        updated_at: parse_time(&updated_at)?,
    })
}

#[async_trait]
impl CaseStore for SqliteCaseStore {
    async fn insert_case(&self, case: NewCase) -> Result<Case, LedgerError> {
        // Single statement, so id allocation and insert are atomic.
        let result = sqlx::query(
            r#"
            INSERT INTO moderation_cases (
                guild_id, case_id, moderator_id, target_user_id, action_type, reason,
                rule_violated, duration_seconds, created_at, source_event_id,
                channel_id, message_id, status
            )
            VALUES (
                ?,
                (SELECT COALESCE(MAX(case_id), 0) + 1 FROM moderation_cases WHERE guild_id = ?),
                ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'applied'
            )
            RETURNING case_id
            "#,
        )
        .bind(case.guild_id as i64)
        .bind(case.guild_id as i64)
        .bind(case.moderator.as_id() as i64)
        .bind(case.target_user_id as i64)
        .bind(case.action_type.as_str())
        .bind(&case.reason)
        .bind(&case.rule_violated)
        .bind(case.duration_seconds.map(|d| d as i64))
        .bind(case.created_at.to_rfc3339())
        .bind(&case.source_event_id)
        .bind(case.channel_id.map(|c| c as i64))
        .bind(case.message_id.map(|m| m as i64))
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => {
                let case_id = row.get::<i64, _>("case_id") as u64;
                Ok(case.into_case(case_id))
            }
            Err(e) if is_unique_violation(&e) => Err(LedgerError::Duplicate {
                source_event_id: case.source_event_id,
                action_type: case.action_type,
            }),
            Err(e) => Err(storage(e)),
        }
    }

    async fn find_by_source(
        &self,
        guild_id: u64,
        source_event_id: &str,
        action_type: ActionType,
    ) -> Result<Option<Case>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM moderation_cases \
             WHERE guild_id = ? AND source_event_id = ? AND action_type = ?",
            CASE_COLUMNS
        ))
        .bind(guild_id as i64)
        .bind(source_event_id)
        .bind(action_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.as_ref().map(row_to_case).transpose()
    }

    async fn get_case(&self, guild_id: u64, case_id: u64) -> Result<Option<Case>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM moderation_cases WHERE guild_id = ? AND case_id = ?",
            CASE_COLUMNS
        ))
        .bind(guild_id as i64)
        .bind(case_id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.as_ref().map(row_to_case).transpose()
    }

    async fn list_user_cases(
        &self,
        guild_id: u64,
        user_id: u64,
        limit: u32,
    ) -> Result<Vec<Case>, LedgerError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM moderation_cases \
             WHERE guild_id = ? AND target_user_id = ? \
             ORDER BY case_id DESC LIMIT ?",
            CASE_COLUMNS
        ))
        .bind(guild_id as i64)
        .bind(user_id as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.iter().map(row_to_case).collect()
    }

    async fn list_recent_cases(&self, guild_id: u64, limit: u32) -> Result<Vec<Case>, LedgerError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM moderation_cases WHERE guild_id = ? ORDER BY case_id DESC LIMIT ?",
            CASE_COLUMNS
        ))
        .bind(guild_id as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.iter().map(row_to_case).collect()
    }

    async fn set_case_status(
        &self,
        guild_id: u64,
        case_id: u64,
        status: CaseStatus,
    ) -> Result<bool, LedgerError> {
        let result =
            sqlx::query("UPDATE moderation_cases SET status = ? WHERE guild_id = ? AND case_id = ?")
                .bind(status.as_str())
                .bind(guild_id as i64)
                .bind(case_id as i64)
                .execute(&self.pool)
                .await
                .map_err(storage)?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_appeal(&self, appeal: &Appeal) -> Result<(), LedgerError> {
        let snapshot = serde_json::to_string(&appeal.original_case)
            .map_err(|e| LedgerError::Storage(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO appeals (
                appeal_id, guild_id, target_user_id, case_id, reason, status,
                original_case, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(appeal.appeal_id.to_string())
        .bind(appeal.guild_id as i64)
        .bind(appeal.target_user_id as i64)
        .bind(appeal.original_case.case_id as i64)
        .bind(&appeal.reason)
        .bind(appeal.status.as_str())
        .bind(snapshot)
        .bind(appeal.created_at.to_rfc3339())
        .bind(appeal.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(LedgerError::AppealAlreadyPending(appeal.original_case.case_id))
            }
            Err(e) => Err(storage(e)),
        }
    }

    async fn get_appeal(&self, appeal_id: Uuid) -> Result<Option<Appeal>, LedgerError> {
        let row = sqlx::query("SELECT * FROM appeals WHERE appeal_id = ?")
            .bind(appeal_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;

        row.as_ref().map(row_to_appeal).transpose()
    }

    async fn pending_appeal_for_case(
        &self,
        guild_id: u64,
        case_id: u64,
    ) -> Result<Option<Appeal>, LedgerError> {
        let row = sqlx::query(
            "SELECT * FROM appeals WHERE guild_id = ? AND case_id = ? AND status = 'pending'",
        )
        .bind(guild_id as i64)
        .bind(case_id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.as_ref().map(row_to_appeal).transpose()
    }

    async fn resolve_pending_appeal(
        &self,
        appeal_id: Uuid,
        status: AppealStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            "UPDATE appeals SET status = ?, updated_at = ? WHERE appeal_id = ? AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(updated_at.to_rfc3339())
        .bind(appeal_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_appeals(
        &self,
        guild_id: u64,
        status: Option<AppealStatus>,
    ) -> Result<Vec<Appeal>, LedgerError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM appeals WHERE guild_id = ? AND status = ? ORDER BY created_at DESC",
                )
                .bind(guild_id as i64)
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM appeals WHERE guild_id = ? ORDER BY created_at DESC")
                    .bind(guild_id as i64)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(storage)?;

        rows.iter().map(row_to_appeal).collect()
    }
}
