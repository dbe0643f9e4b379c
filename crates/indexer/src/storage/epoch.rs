//! Attester and epoch storage operations.

use super::{AttesterRecord, EpochRecord, Storage};
use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use unisync_core::AttesterId;

impl Storage {
    /// Register an attester. Registration is immutable; later calls are no-ops.
    ///
    /// Returns `true` if the attester was new.
    pub async fn upsert_attester(
        conn: &mut SqliteConnection,
        attester: &AttesterRecord,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO attesters (attester_id, start_timestamp, epoch_length)
            VALUES (?, ?, ?)
            ON CONFLICT(attester_id) DO NOTHING
            "#,
        )
        .bind(attester.attester_id.to_bytes().as_slice())
        .bind(attester.start_timestamp as i64)
        .bind(attester.epoch_length as i64)
        .execute(&mut *conn)
        .await
        .context("Failed to insert attester")?;

        Ok(result.rows_affected() > 0)
    }

    /// All registered attesters.
    pub async fn list_attesters(&self) -> Result<Vec<AttesterRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT attester_id, start_timestamp, epoch_length
            FROM attesters
            ORDER BY attester_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list attesters")?;

        Ok(rows
            .iter()
            .map(|row| {
                let id: Vec<u8> = row.get("attester_id");
                AttesterRecord {
                    attester_id: AttesterId::from_bytes(&id),
                    start_timestamp: row.get::<i64, _>("start_timestamp") as u64,
                    epoch_length: row.get::<i64, _>("epoch_length") as u64,
                }
            })
            .collect())
    }

    /// Highest-numbered epoch row of an attester.
    pub async fn latest_epoch(
        conn: &mut SqliteConnection,
        attester_id: AttesterId,
    ) -> Result<Option<EpochRecord>> {
        let row = sqlx::query(
            r#"
            SELECT attester_id, number, sealed
            FROM epochs
            WHERE attester_id = ?
            ORDER BY number DESC
            LIMIT 1
            "#,
        )
        .bind(attester_id.to_bytes().as_slice())
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to fetch latest epoch")?;

        Ok(row.as_ref().map(row_to_epoch))
    }

    /// One epoch row.
    pub async fn get_epoch(
        conn: &mut SqliteConnection,
        attester_id: AttesterId,
        number: u64,
    ) -> Result<Option<EpochRecord>> {
        let row = sqlx::query(
            r#"
            SELECT attester_id, number, sealed
            FROM epochs
            WHERE attester_id = ? AND number = ?
            "#,
        )
        .bind(attester_id.to_bytes().as_slice())
        .bind(number as i64)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to fetch epoch")?;

        Ok(row.as_ref().map(row_to_epoch))
    }

    /// Create an open epoch row if none exists.
    ///
    /// Returns `true` if a row was created.
    pub async fn ensure_epoch(
        conn: &mut SqliteConnection,
        attester_id: AttesterId,
        number: u64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO epochs (attester_id, number, sealed)
            VALUES (?, ?, 0)
            ON CONFLICT(attester_id, number) DO NOTHING
            "#,
        )
        .bind(attester_id.to_bytes().as_slice())
        .bind(number as i64)
        .execute(&mut *conn)
        .await
        .context("Failed to create epoch")?;

        Ok(result.rows_affected() > 0)
    }

    /// Mark an epoch sealed, creating it if needed.
    ///
    /// Returns `true` unless the epoch was already sealed.
    pub async fn seal_epoch(
        conn: &mut SqliteConnection,
        attester_id: AttesterId,
        number: u64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO epochs (attester_id, number, sealed)
            VALUES (?, ?, 1)
            ON CONFLICT(attester_id, number) DO UPDATE SET sealed = 1
            WHERE sealed = 0
            "#,
        )
        .bind(attester_id.to_bytes().as_slice())
        .bind(number as i64)
        .execute(&mut *conn)
        .await
        .context("Failed to seal epoch")?;

        Ok(result.rows_affected() > 0)
    }

    /// Latest epoch row of an attester, or an open epoch 0 if there is none.
    pub async fn read_latest_epoch(&self, attester_id: AttesterId) -> Result<EpochRecord> {
        let mut conn = self.pool.acquire().await?;
        Ok(Self::latest_epoch(&mut conn, attester_id)
            .await?
            .unwrap_or(EpochRecord {
                attester_id,
                number: 0,
                sealed: false,
            }))
    }

    /// Every epoch row of an attester in ascending order.
    pub async fn list_epochs(&self, attester_id: AttesterId) -> Result<Vec<EpochRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT attester_id, number, sealed
            FROM epochs
            WHERE attester_id = ?
            ORDER BY number ASC
            "#,
        )
        .bind(attester_id.to_bytes().as_slice())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list epochs")?;

        Ok(rows.iter().map(row_to_epoch).collect())
    }
}

fn row_to_epoch(row: &SqliteRow) -> EpochRecord {
    let id: Vec<u8> = row.get("attester_id");
    EpochRecord {
        attester_id: AttesterId::from_bytes(&id),
        number: row.get::<i64, _>("number") as u64,
        sealed: row.get::<i64, _>("sealed") != 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_attester_registration_is_immutable() {
        let storage = Storage::in_memory().await.unwrap();
        let mut conn = storage.pool().acquire().await.unwrap();
        let id = AttesterId::from(5u64);

        let first = AttesterRecord {
            attester_id: id,
            start_timestamp: 100,
            epoch_length: 1000,
        };
        assert!(Storage::upsert_attester(&mut conn, &first).await.unwrap());
        let second = AttesterRecord {
            epoch_length: 1,
            ..first
        };
        assert!(!Storage::upsert_attester(&mut conn, &second).await.unwrap());
        drop(conn);

        assert_eq!(storage.list_attesters().await.unwrap(), vec![first]);
    }

    #[tokio::test]
    async fn test_epoch_lifecycle() {
        let storage = Storage::in_memory().await.unwrap();
        let id = AttesterId::from(5u64);
        assert_eq!(storage.read_latest_epoch(id).await.unwrap().number, 0);

        let mut conn = storage.pool().acquire().await.unwrap();
        assert!(Storage::ensure_epoch(&mut conn, id, 0).await.unwrap());
        assert!(!Storage::ensure_epoch(&mut conn, id, 0).await.unwrap());

        assert!(Storage::seal_epoch(&mut conn, id, 0).await.unwrap());
        assert!(!Storage::seal_epoch(&mut conn, id, 0).await.unwrap());
        assert!(Storage::ensure_epoch(&mut conn, id, 1).await.unwrap());

        let sealed = Storage::get_epoch(&mut conn, id, 0).await.unwrap().unwrap();
        assert!(sealed.sealed);
        drop(conn);

        let latest = storage.read_latest_epoch(id).await.unwrap();
        assert_eq!(latest.number, 1);
        assert!(!latest.sealed);
        assert_eq!(storage.list_epochs(id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_seal_creates_missing_epoch() {
        let storage = Storage::in_memory().await.unwrap();
        let id = AttesterId::from(5u64);
        let mut conn = storage.pool().acquire().await.unwrap();

        assert!(Storage::seal_epoch(&mut conn, id, 3).await.unwrap());
        let epoch = Storage::get_epoch(&mut conn, id, 3).await.unwrap().unwrap();
        assert!(epoch.sealed);
    }
}
