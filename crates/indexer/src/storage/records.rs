//! Sign up, attestation and nullifier storage operations.

use super::leaves::hash_column;
use super::{AttestationRecord, NullifierRecord, Storage, UserSignUpRecord};
use alloy::primitives::B256;
use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use unisync_core::{field_to_bytes, AttesterId, Field};

impl Storage {
    /// Record a sign up; one per `(commitment, attester)`.
    ///
    /// Returns `false` if the user was already signed up.
    pub async fn insert_user_signup(
        conn: &mut SqliteConnection,
        user: &UserSignUpRecord,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO user_signups (commitment, attester_id, epoch, block_number)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(commitment, attester_id) DO NOTHING
            "#,
        )
        .bind(field_to_bytes(&user.commitment).as_slice())
        .bind(user.attester_id.to_bytes().as_slice())
        .bind(user.epoch as i64)
        .bind(user.block_number as i64)
        .execute(&mut *conn)
        .await
        .context("Failed to insert user sign up")?;

        Ok(result.rows_affected() > 0)
    }

    /// Whether an attestation with this index key exists.
    pub async fn attestation_exists(conn: &mut SqliteConnection, index: &str) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM attestations WHERE event_index = ?")
                .bind(index)
                .fetch_optional(&mut *conn)
                .await
                .context("Failed to look up attestation")?;

        Ok(found.is_some())
    }

    /// Record an attestation.
    ///
    /// Returns `false` if the index key was already present.
    pub async fn insert_attestation(
        conn: &mut SqliteConnection,
        attestation: &AttestationRecord,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO attestations (
                event_index, attester_id, epoch, epoch_key,
                field_index, change, block_number
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(event_index) DO NOTHING
            "#,
        )
        .bind(&attestation.index)
        .bind(attestation.attester_id.to_bytes().as_slice())
        .bind(attestation.epoch as i64)
        .bind(field_to_bytes(&attestation.epoch_key).as_slice())
        .bind(attestation.field_index as i64)
        .bind(field_to_bytes(&attestation.change).as_slice())
        .bind(attestation.block_number as i64)
        .execute(&mut *conn)
        .await
        .context("Failed to insert attestation")?;

        Ok(result.rows_affected() > 0)
    }

    /// Record a consumed nullifier. A nullifier is recorded once.
    ///
    /// Returns `false` if the nullifier was already recorded.
    pub async fn insert_nullifier(
        conn: &mut SqliteConnection,
        nullifier: &NullifierRecord,
    ) -> Result<bool> {
        let tx_hash = nullifier.transaction_hash.as_ref().map(|h| h.as_slice());

        let result = sqlx::query(
            r#"
            INSERT INTO nullifiers (nullifier, attester_id, epoch, transaction_hash, block_number)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(nullifier) DO NOTHING
            "#,
        )
        .bind(field_to_bytes(&nullifier.nullifier).as_slice())
        .bind(nullifier.attester_id.to_bytes().as_slice())
        .bind(nullifier.epoch as i64)
        .bind(tx_hash)
        .bind(nullifier.block_number as i64)
        .execute(&mut *conn)
        .await
        .context("Failed to insert nullifier")?;

        Ok(result.rows_affected() > 0)
    }

    /// Sign ups of an attester, in block order.
    pub async fn user_signups(&self, attester_id: AttesterId) -> Result<Vec<UserSignUpRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT commitment, attester_id, epoch, block_number
            FROM user_signups
            WHERE attester_id = ?
            ORDER BY block_number ASC, commitment ASC
            "#,
        )
        .bind(attester_id.to_bytes().as_slice())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch user sign ups")?;

        Ok(rows
            .iter()
            .map(|row| UserSignUpRecord {
                commitment: hash_column(row, "commitment"),
                attester_id,
                epoch: row.get::<i64, _>("epoch") as u64,
                block_number: row.get::<i64, _>("block_number") as u64,
            })
            .collect())
    }

    /// Attestations of an attester's epoch, in event order.
    pub async fn attestations(
        &self,
        attester_id: AttesterId,
        epoch: u64,
    ) -> Result<Vec<AttestationRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT event_index, attester_id, epoch, epoch_key, field_index, change, block_number
            FROM attestations
            WHERE attester_id = ? AND epoch = ?
            ORDER BY event_index ASC
            "#,
        )
        .bind(attester_id.to_bytes().as_slice())
        .bind(epoch as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch attestations")?;

        Ok(rows.iter().map(row_to_attestation).collect())
    }

    /// Look up a nullifier.
    pub async fn get_nullifier(&self, nullifier: Field) -> Result<Option<NullifierRecord>> {
        let row = sqlx::query(
            r#"
            SELECT nullifier, attester_id, epoch, transaction_hash, block_number
            FROM nullifiers
            WHERE nullifier = ?
            "#,
        )
        .bind(field_to_bytes(&nullifier).as_slice())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch nullifier")?;

        Ok(row.map(|row| {
            let id: Vec<u8> = row.get("attester_id");
            let tx_hash: Option<Vec<u8>> = row.get("transaction_hash");
            NullifierRecord {
                nullifier,
                attester_id: AttesterId::from_bytes(&id),
                epoch: row.get::<i64, _>("epoch") as u64,
                transaction_hash: tx_hash.map(|h| B256::from_slice(&h)),
                block_number: row.get::<i64, _>("block_number") as u64,
            }
        }))
    }
}

fn row_to_attestation(row: &SqliteRow) -> AttestationRecord {
    let id: Vec<u8> = row.get("attester_id");
    AttestationRecord {
        index: row.get("event_index"),
        attester_id: AttesterId::from_bytes(&id),
        epoch: row.get::<i64, _>("epoch") as u64,
        epoch_key: hash_column(row, "epoch_key"),
        field_index: row.get::<i64, _>("field_index") as u64,
        change: hash_column(row, "change"),
        block_number: row.get::<i64, _>("block_number") as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unisync_core::EventPosition;

    #[tokio::test]
    async fn test_user_signup_unique_per_attester() {
        let storage = Storage::in_memory().await.unwrap();
        let mut conn = storage.pool().acquire().await.unwrap();
        let user = UserSignUpRecord {
            commitment: Field::from(99u64),
            attester_id: AttesterId::from(1u64),
            epoch: 0,
            block_number: 5,
        };

        assert!(Storage::insert_user_signup(&mut conn, &user).await.unwrap());
        assert!(!Storage::insert_user_signup(&mut conn, &user).await.unwrap());

        let other = UserSignUpRecord {
            attester_id: AttesterId::from(2u64),
            ..user.clone()
        };
        assert!(Storage::insert_user_signup(&mut conn, &other).await.unwrap());
        drop(conn);

        assert_eq!(storage.user_signups(AttesterId::from(1u64)).await.unwrap(), vec![user]);
    }

    #[tokio::test]
    async fn test_attestation_keyed_by_position() {
        let storage = Storage::in_memory().await.unwrap();
        let mut conn = storage.pool().acquire().await.unwrap();
        let attestation = AttestationRecord {
            index: EventPosition::new(12, 1, 3).index_key(),
            attester_id: AttesterId::from(1u64),
            epoch: 0,
            epoch_key: Field::from(4u64),
            field_index: 1,
            change: Field::from(138u64),
            block_number: 12,
        };

        assert!(!Storage::attestation_exists(&mut conn, &attestation.index).await.unwrap());
        assert!(Storage::insert_attestation(&mut conn, &attestation).await.unwrap());
        assert!(Storage::attestation_exists(&mut conn, &attestation.index).await.unwrap());
        assert!(!Storage::insert_attestation(&mut conn, &attestation).await.unwrap());
        drop(conn);

        let stored = storage.attestations(AttesterId::from(1u64), 0).await.unwrap();
        assert_eq!(stored, vec![attestation]);
    }

    #[tokio::test]
    async fn test_duplicate_nullifier_is_noop() {
        let storage = Storage::in_memory().await.unwrap();
        let mut conn = storage.pool().acquire().await.unwrap();
        let record = NullifierRecord {
            nullifier: Field::from(31337u64),
            attester_id: AttesterId::from(1u64),
            epoch: 2,
            transaction_hash: Some(B256::repeat_byte(0xab)),
            block_number: 40,
        };

        assert!(Storage::insert_nullifier(&mut conn, &record).await.unwrap());
        let replay = NullifierRecord {
            epoch: 3,
            ..record.clone()
        };
        assert!(!Storage::insert_nullifier(&mut conn, &replay).await.unwrap());
        drop(conn);

        let stored = storage.get_nullifier(record.nullifier).await.unwrap().unwrap();
        assert_eq!(stored, record);
        assert!(storage
            .get_nullifier(Field::from(1u64))
            .await
            .unwrap()
            .is_none());
    }
}
