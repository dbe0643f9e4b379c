//! Cursor storage operations.

use super::{Storage, SyncCursor};
use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use unisync_core::{AttesterId, EventPosition};

impl Storage {
    /// Create a cursor for `attester_id` if none exists.
    ///
    /// Returns `true` if a new cursor was created.
    pub async fn seed_cursor(
        conn: &mut SqliteConnection,
        attester_id: AttesterId,
        latest_complete_block: Option<u64>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO synchronizer_state (attester_id, latest_complete_block, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(attester_id) DO NOTHING
            "#,
        )
        .bind(attester_id.to_bytes().as_slice())
        .bind(latest_complete_block.map(|b| b as i64))
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *conn)
        .await
        .context("Failed to seed cursor")?;

        Ok(result.rows_affected() > 0)
    }

    /// Record `position` as the last applied event for each attester.
    ///
    /// Never moves a cursor backwards.
    pub async fn advance_processed(
        conn: &mut SqliteConnection,
        attester_ids: &[AttesterId],
        position: EventPosition,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        for attester_id in attester_ids {
            sqlx::query(
                r#"
                UPDATE synchronizer_state
                SET latest_processed_block = ?1,
                    latest_processed_tx_index = ?2,
                    latest_processed_log_index = ?3,
                    updated_at = ?4
                WHERE attester_id = ?5
                  AND (latest_processed_block IS NULL
                       OR (latest_processed_block, latest_processed_tx_index, latest_processed_log_index)
                          < (?1, ?2, ?3))
                "#,
            )
            .bind(position.block_number as i64)
            .bind(position.tx_index as i64)
            .bind(position.log_index as i64)
            .bind(now)
            .bind(attester_id.to_bytes().as_slice())
            .execute(&mut *conn)
            .await
            .context("Failed to advance processed cursor")?;
        }

        Ok(())
    }

    /// Mark blocks up to `block` complete for each attester.
    ///
    /// Never moves a cursor backwards.
    pub async fn advance_complete(
        conn: &mut SqliteConnection,
        attester_ids: &[AttesterId],
        block: u64,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        for attester_id in attester_ids {
            sqlx::query(
                r#"
                UPDATE synchronizer_state
                SET latest_complete_block = ?1,
                    updated_at = ?2
                WHERE attester_id = ?3
                  AND (latest_complete_block IS NULL OR latest_complete_block < ?1)
                "#,
            )
            .bind(block as i64)
            .bind(now)
            .bind(attester_id.to_bytes().as_slice())
            .execute(&mut *conn)
            .await
            .context("Failed to advance complete block")?;
        }

        Ok(())
    }

    /// Cursor of one attester.
    pub async fn get_cursor(
        conn: &mut SqliteConnection,
        attester_id: AttesterId,
    ) -> Result<Option<SyncCursor>> {
        let row = sqlx::query(
            r#"
            SELECT attester_id, latest_complete_block, latest_processed_block,
                   latest_processed_tx_index, latest_processed_log_index, updated_at
            FROM synchronizer_state
            WHERE attester_id = ?
            "#,
        )
        .bind(attester_id.to_bytes().as_slice())
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to fetch cursor")?;

        Ok(row.as_ref().map(row_to_cursor))
    }

    /// The least advanced cursor among `attester_ids`.
    ///
    /// Cursors that do not exist yet are skipped.
    pub async fn min_cursor(
        conn: &mut SqliteConnection,
        attester_ids: &[AttesterId],
    ) -> Result<Option<SyncCursor>> {
        let mut lowest: Option<SyncCursor> = None;
        for attester_id in attester_ids {
            if let Some(cursor) = Self::get_cursor(conn, *attester_id).await? {
                let key = (cursor.latest_complete_block, cursor.latest_processed);
                let replace = match &lowest {
                    None => true,
                    Some(l) => key < (l.latest_complete_block, l.latest_processed),
                };
                if replace {
                    lowest = Some(cursor);
                }
            }
        }
        Ok(lowest)
    }

    /// Read-side wrapper of [`Storage::min_cursor`].
    pub async fn lowest_cursor(&self, attester_ids: &[AttesterId]) -> Result<Option<SyncCursor>> {
        let mut conn = self.pool.acquire().await?;
        Self::min_cursor(&mut conn, attester_ids).await
    }

    /// All cursors ordered by attester id.
    pub async fn list_cursors(&self) -> Result<Vec<SyncCursor>> {
        let rows = sqlx::query(
            r#"
            SELECT attester_id, latest_complete_block, latest_processed_block,
                   latest_processed_tx_index, latest_processed_log_index, updated_at
            FROM synchronizer_state
            ORDER BY attester_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list cursors")?;

        Ok(rows.iter().map(row_to_cursor).collect())
    }
}

fn row_to_cursor(row: &SqliteRow) -> SyncCursor {
    let id: Vec<u8> = row.get("attester_id");
    let block: Option<i64> = row.get("latest_processed_block");
    let tx: Option<i64> = row.get("latest_processed_tx_index");
    let log: Option<i64> = row.get("latest_processed_log_index");

    let latest_processed = match (block, tx, log) {
        (Some(b), Some(t), Some(l)) => Some(EventPosition::new(b as u64, t as u64, l as u64)),
        _ => None,
    };

    SyncCursor {
        attester_id: AttesterId::from_bytes(&id),
        latest_complete_block: row
            .get::<Option<i64>, _>("latest_complete_block")
            .map(|b| b as u64),
        latest_processed,
        updated_at: row.get("updated_at"),
    }
}
