//! Tree leaf storage operations.

use super::{HistoryTreeLeafRecord, Storage, TreeLeafRecord};
use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use unisync_core::{field_from_bytes, field_to_bytes, AttesterId, Field};

impl Storage {
    /// Insert a state tree leaf.
    ///
    /// A leaf hash already present for the attester is a replay: returns
    /// `false` and leaves the row untouched.
    pub async fn insert_state_tree_leaf(
        conn: &mut SqliteConnection,
        leaf: &TreeLeafRecord,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO state_tree_leaves (attester_id, epoch, leaf_index, hash, block_number)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(leaf.attester_id.to_bytes().as_slice())
        .bind(leaf.epoch as i64)
        .bind(leaf.index as i64)
        .bind(field_to_bytes(&leaf.hash).as_slice())
        .bind(leaf.block_number as i64)
        .execute(&mut *conn)
        .await
        .context("Failed to insert state tree leaf")?;

        Ok(result.rows_affected() > 0)
    }

    /// Write an epoch tree leaf; a later write to the same slot replaces it.
    ///
    /// Returns `false` if the slot already held the same hash.
    pub async fn upsert_epoch_tree_leaf(
        conn: &mut SqliteConnection,
        leaf: &TreeLeafRecord,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO epoch_tree_leaves (attester_id, epoch, leaf_index, hash, block_number)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(attester_id, epoch, leaf_index) DO UPDATE SET
                hash = excluded.hash,
                block_number = excluded.block_number
            WHERE hash != excluded.hash
            "#,
        )
        .bind(leaf.attester_id.to_bytes().as_slice())
        .bind(leaf.epoch as i64)
        .bind(leaf.index as i64)
        .bind(field_to_bytes(&leaf.hash).as_slice())
        .bind(leaf.block_number as i64)
        .execute(&mut *conn)
        .await
        .context("Failed to upsert epoch tree leaf")?;

        Ok(result.rows_affected() > 0)
    }

    /// Number of history leaves of an attester.
    pub async fn count_history_tree_leaves(
        conn: &mut SqliteConnection,
        attester_id: AttesterId,
    ) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM history_tree_leaves WHERE attester_id = ?")
                .bind(attester_id.to_bytes().as_slice())
                .fetch_one(&mut *conn)
                .await
                .context("Failed to count history tree leaves")?;

        Ok(count as u64)
    }

    /// Append a history leaf at the next free index.
    ///
    /// Equal leaf values get separate slots; replays are excluded by the
    /// caller's cursor.
    pub async fn append_history_tree_leaf(
        conn: &mut SqliteConnection,
        attester_id: AttesterId,
        leaf: Field,
    ) -> Result<u64> {
        let index = Self::count_history_tree_leaves(conn, attester_id).await?;

        sqlx::query(
            r#"
            INSERT INTO history_tree_leaves (attester_id, leaf_index, leaf)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(attester_id.to_bytes().as_slice())
        .bind(index as i64)
        .bind(field_to_bytes(&leaf).as_slice())
        .execute(&mut *conn)
        .await
        .context("Failed to append history tree leaf")?;

        Ok(index)
    }

    /// Write a history leaf at a known index.
    ///
    /// Returns `false` if the slot is already filled.
    pub async fn insert_history_tree_leaf(
        conn: &mut SqliteConnection,
        leaf: &HistoryTreeLeafRecord,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO history_tree_leaves (attester_id, leaf_index, leaf)
            VALUES (?, ?, ?)
            ON CONFLICT(attester_id, leaf_index) DO NOTHING
            "#,
        )
        .bind(leaf.attester_id.to_bytes().as_slice())
        .bind(leaf.index as i64)
        .bind(field_to_bytes(&leaf.leaf).as_slice())
        .execute(&mut *conn)
        .await
        .context("Failed to insert history tree leaf")?;

        Ok(result.rows_affected() > 0)
    }

    /// State tree leaf values of an epoch, by index.
    pub async fn state_tree_leaves(&self, attester_id: AttesterId, epoch: u64) -> Result<Vec<Field>> {
        let rows = sqlx::query(
            r#"
            SELECT hash FROM state_tree_leaves
            WHERE attester_id = ? AND epoch = ?
            ORDER BY leaf_index ASC
            "#,
        )
        .bind(attester_id.to_bytes().as_slice())
        .bind(epoch as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch state tree leaves")?;

        Ok(rows.iter().map(|r| hash_column(r, "hash")).collect())
    }

    /// State tree leaf rows of an epoch, by index.
    pub async fn state_tree_leaf_records(
        &self,
        attester_id: AttesterId,
        epoch: u64,
    ) -> Result<Vec<TreeLeafRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT attester_id, epoch, leaf_index, hash, block_number
            FROM state_tree_leaves
            WHERE attester_id = ? AND epoch = ?
            ORDER BY leaf_index ASC
            "#,
        )
        .bind(attester_id.to_bytes().as_slice())
        .bind(epoch as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch state tree leaves")?;

        Ok(rows.iter().map(row_to_tree_leaf).collect())
    }

    /// Number of state tree leaves of an epoch.
    pub async fn count_state_tree_leaves(&self, attester_id: AttesterId, epoch: u64) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM state_tree_leaves WHERE attester_id = ? AND epoch = ?",
        )
        .bind(attester_id.to_bytes().as_slice())
        .bind(epoch as i64)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count state tree leaves")?;

        Ok(count as u64)
    }

    /// Epoch tree leaf rows of an epoch, by index.
    pub async fn epoch_tree_leaves(
        &self,
        attester_id: AttesterId,
        epoch: u64,
    ) -> Result<Vec<TreeLeafRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT attester_id, epoch, leaf_index, hash, block_number
            FROM epoch_tree_leaves
            WHERE attester_id = ? AND epoch = ?
            ORDER BY leaf_index ASC
            "#,
        )
        .bind(attester_id.to_bytes().as_slice())
        .bind(epoch as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch epoch tree leaves")?;

        Ok(rows.iter().map(row_to_tree_leaf).collect())
    }

    /// History tree leaves of an attester, by index.
    pub async fn history_tree_leaves(
        &self,
        attester_id: AttesterId,
    ) -> Result<Vec<HistoryTreeLeafRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT attester_id, leaf_index, leaf FROM history_tree_leaves
            WHERE attester_id = ?
            ORDER BY leaf_index ASC
            "#,
        )
        .bind(attester_id.to_bytes().as_slice())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch history tree leaves")?;

        Ok(rows
            .iter()
            .map(|row| HistoryTreeLeafRecord {
                attester_id,
                index: row.get::<i64, _>("leaf_index") as u64,
                leaf: hash_column(row, "leaf"),
            })
            .collect())
    }
}

pub(crate) fn hash_column(row: &SqliteRow, column: &str) -> Field {
    let bytes: Vec<u8> = row.get(column);
    field_from_bytes(&bytes)
}

fn row_to_tree_leaf(row: &SqliteRow) -> TreeLeafRecord {
    let id: Vec<u8> = row.get("attester_id");
    TreeLeafRecord {
        attester_id: AttesterId::from_bytes(&id),
        epoch: row.get::<i64, _>("epoch") as u64,
        index: row.get::<i64, _>("leaf_index") as u64,
        hash: hash_column(row, "hash"),
        block_number: row.get::<i64, _>("block_number") as u64,
    }
}
