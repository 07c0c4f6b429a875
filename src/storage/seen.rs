use chrono::{DateTime, Utc};
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{from_millis, to_millis, StateStoreError};

/// Identities per batched statement; keeps well under SQLite's 999 parameter limit
const BATCH_SIZE: usize = 500;

impl Database {
    // ========================================================================
    // Seen Entry Operations
    // ========================================================================

    /// Whether `identity` was already recorded for `source_id`
    pub async fn is_seen(&self, source_id: &str, identity: &str) -> Result<bool, StateStoreError> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM seen_entries WHERE source_id = ? AND identity = ?)",
        )
        .bind(source_id)
        .bind(identity)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Record `identity` as seen. A no-op when it already is.
    pub async fn insert_seen(
        &self,
        source_id: &str,
        identity: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<(), StateStoreError> {
        sqlx::query(
            "INSERT OR IGNORE INTO seen_entries (source_id, identity, observed_at) VALUES (?, ?, ?)",
        )
        .bind(source_id)
        .bind(identity)
        .bind(to_millis(observed_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Move `observed_at` forward for identities still present in the latest
    /// document. Never moves it backward.
    pub async fn refresh_seen(
        &self,
        source_id: &str,
        identities: &[String],
        observed_at: DateTime<Utc>,
    ) -> Result<(), StateStoreError> {
        if identities.is_empty() {
            return Ok(());
        }

        let observed = to_millis(observed_at);
        let mut tx = self.pool.begin().await?;

        for chunk in identities.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("UPDATE seen_entries SET observed_at = MAX(observed_at, ");
            builder.push_bind(observed);
            builder.push(") WHERE source_id = ");
            builder.push_bind(source_id);
            builder.push(" AND identity IN (");

            let mut separated = builder.separated(", ");
            for identity in chunk {
                separated.push_bind(identity);
            }
            separated.push_unseparated(")");

            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Delete identities observed strictly before `cutoff`. Returns the count removed.
    pub async fn delete_seen_before(
        &self,
        source_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StateStoreError> {
        let result = sqlx::query("DELETE FROM seen_entries WHERE source_id = ? AND observed_at < ?")
            .bind(source_id)
            .bind(to_millis(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// The observation time of the `keep`-th most recently observed identity,
    /// or `None` when the source holds fewer than `keep` identities.
    pub async fn retention_cutoff(
        &self,
        source_id: &str,
        keep: usize,
    ) -> Result<Option<DateTime<Utc>>, StateStoreError> {
        if keep == 0 {
            return Ok(None);
        }

        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT observed_at FROM seen_entries
            WHERE source_id = ?
            ORDER BY observed_at DESC
            LIMIT 1 OFFSET ?
        "#,
        )
        .bind(source_id)
        .bind(i64::try_from(keep - 1).unwrap_or(i64::MAX))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|(ms,)| from_millis(ms)))
    }

    /// Number of identities held for a source
    pub async fn seen_count(&self, source_id: &str) -> Result<u64, StateStoreError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM seen_entries WHERE source_id = ?")
            .bind(source_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(row.0).unwrap_or(0))
    }
}
