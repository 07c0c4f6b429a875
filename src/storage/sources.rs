use super::schema::Database;
use super::types::{to_millis, ScheduleState, SourceRow, StateStoreError, StoredSource};
use crate::feed::CacheHints;

const SOURCE_COLUMNS: &str = "id, url, enabled, next_poll_at, consecutive_failures, \
     last_success_at, etag, last_modified";

impl Database {
    // ========================================================================
    // Source Operations
    // ========================================================================

    /// Register a configured source, keeping any persisted schedule.
    ///
    /// When the URL changed since the last run the stored cache validators
    /// are dropped, since they belong to the old document.
    pub async fn upsert_source(
        &self,
        id: &str,
        url: &str,
        enabled: bool,
    ) -> Result<StoredSource, StateStoreError> {
        let row: SourceRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO sources (id, url, enabled)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                etag = CASE WHEN sources.url = excluded.url THEN sources.etag ELSE NULL END,
                last_modified = CASE WHEN sources.url = excluded.url THEN sources.last_modified ELSE NULL END,
                url = excluded.url,
                enabled = excluded.enabled
            RETURNING {SOURCE_COLUMNS}
        "#
        ))
        .bind(id)
        .bind(url)
        .bind(enabled)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    /// Persist the outcome of a poll cycle for a source
    pub async fn update_schedule(
        &self,
        id: &str,
        schedule: &ScheduleState,
        hints: &CacheHints,
    ) -> Result<(), StateStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sources SET
                next_poll_at = ?,
                consecutive_failures = ?,
                last_success_at = ?,
                etag = ?,
                last_modified = ?
            WHERE id = ?
        "#,
        )
        .bind(schedule.next_poll_at.map(to_millis))
        .bind(i64::from(schedule.consecutive_failures))
        .bind(schedule.last_success_at.map(to_millis))
        .bind(hints.etag.as_deref())
        .bind(hints.last_modified.as_deref())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StateStoreError::UnknownSource(id.to_string()));
        }
        Ok(())
    }

    /// Close the pool, waiting for checked-out connections to return
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
