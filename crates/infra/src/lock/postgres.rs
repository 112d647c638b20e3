//! Postgres-backed lock store.
//!
//! ## Atomic acquisition
//!
//! Acquisition is a single `INSERT ... ON CONFLICT ... DO UPDATE ... WHERE`
//! statement. Postgres serializes conflicting upserts on the primary key, and
//! the `WHERE` clause is re-evaluated against the committed row, so at most
//! one concurrent caller gets a row back from `RETURNING`. No row back means
//! the lease is live elsewhere.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | LockStoreError |
//! |------------|----------------------|----------------|
//! | Database (check/not-null violation) | `23514`, `23502` | `Rejected` |
//! | Database (serialization failure, deadlock) | `40001`, `40P01` | `Unavailable` |
//! | Database (other) | Any other | `Unavailable` |
//! | ColumnDecode / ColumnNotFound | N/A | `Corrupt` |
//! | PoolTimedOut / PoolClosed / Io / Other | N/A | `Unavailable` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::instrument;

use jobguard_core::{LeaseToken, LockId, LockRecord};

use super::store::{LockStore, LockStoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS job_locks (
    job_name   TEXT        NOT NULL,
    lock_key   TEXT        NOT NULL,
    token      UUID        NOT NULL,
    epoch      BIGINT      NOT NULL CHECK (epoch > 0),
    started_at TIMESTAMPTZ NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (job_name, lock_key)
);
CREATE INDEX IF NOT EXISTS job_locks_expires_at_idx ON job_locks (expires_at);
"#;

/// Lock store on a shared Postgres database.
///
/// `Send + Sync`; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct PostgresLockStore {
    pool: Arc<PgPool>,
}

impl PostgresLockStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, LockStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the `job_locks` table and its expiry index if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), LockStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LockStore for PostgresLockStore {
    #[instrument(skip(self), fields(lock = %id), err)]
    async fn try_acquire(
        &self,
        id: &LockId,
        token: LeaseToken,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<LockRecord>, LockStoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO job_locks (job_name, lock_key, token, epoch, started_at, expires_at)
            VALUES ($1, $2, $3, 1, $4, $5)
            ON CONFLICT (job_name, lock_key) DO UPDATE
            SET
                token = EXCLUDED.token,
                epoch = job_locks.epoch + 1,
                started_at = EXCLUDED.started_at,
                expires_at = EXCLUDED.expires_at
            WHERE job_locks.expires_at <= EXCLUDED.started_at
            RETURNING job_name, lock_key, token, epoch, started_at, expires_at
            "#,
        )
        .bind(id.job_name())
        .bind(id.key())
        .bind(token.as_uuid())
        .bind(now)
        .bind(expires_at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("try_acquire", e))?;

        row.as_ref().map(decode_record).transpose()
    }

    #[instrument(skip(self), fields(lock = %id), err)]
    async fn release(&self, id: &LockId, token: LeaseToken) -> Result<bool, LockStoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM job_locks
            WHERE job_name = $1 AND lock_key = $2 AND token = $3
            "#,
        )
        .bind(id.job_name())
        .bind(id.key())
        .bind(token.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(lock = %id), err)]
    async fn renew(
        &self,
        id: &LockId,
        token: LeaseToken,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<LockRecord>, LockStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE job_locks
            SET expires_at = $5
            WHERE job_name = $1 AND lock_key = $2 AND token = $3 AND expires_at > $4
            RETURNING job_name, lock_key, token, epoch, started_at, expires_at
            "#,
        )
        .bind(id.job_name())
        .bind(id.key())
        .bind(token.as_uuid())
        .bind(now)
        .bind(expires_at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("renew", e))?;

        row.as_ref().map(decode_record).transpose()
    }

    #[instrument(skip(self), fields(lock = %id), err)]
    async fn get(&self, id: &LockId) -> Result<Option<LockRecord>, LockStoreError> {
        let row = sqlx::query(
            r#"
            SELECT job_name, lock_key, token, epoch, started_at, expires_at
            FROM job_locks
            WHERE job_name = $1 AND lock_key = $2
            "#,
        )
        .bind(id.job_name())
        .bind(id.key())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(decode_record).transpose()
    }

    #[instrument(skip(self), err)]
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, LockStoreError> {
        let result = sqlx::query("DELETE FROM job_locks WHERE expires_at < $1")
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_expired", e))?;

        Ok(result.rows_affected())
    }
}

// SQLx row decoding

#[derive(Debug)]
struct LockRow {
    job_name: String,
    lock_key: String,
    token: uuid::Uuid,
    epoch: i64,
    started_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for LockRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(LockRow {
            job_name: row.try_get("job_name")?,
            lock_key: row.try_get("lock_key")?,
            token: row.try_get("token")?,
            epoch: row.try_get("epoch")?,
            started_at: row.try_get("started_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

impl TryFrom<LockRow> for LockRecord {
    type Error = LockStoreError;

    fn try_from(row: LockRow) -> Result<Self, Self::Error> {
        let id = LockId::new(row.job_name, row.lock_key)
            .map_err(|e| LockStoreError::Corrupt(e.to_string()))?;
        let epoch = u64::try_from(row.epoch)
            .map_err(|_| LockStoreError::Corrupt(format!("negative epoch {}", row.epoch)))?;

        Ok(LockRecord {
            id,
            token: LeaseToken::from_uuid(row.token),
            epoch,
            started_at: row.started_at,
            expires_at: row.expires_at,
        })
    }
}

fn decode_record(row: &PgRow) -> Result<LockRecord, LockStoreError> {
    let row = <LockRow as sqlx::FromRow<'_, PgRow>>::from_row(row)
        .map_err(|e| LockStoreError::Corrupt(format!("failed to deserialize lock row: {e}")))?;
    row.try_into()
}

/// Map SQLx errors to `LockStoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LockStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            match db_err.code().as_deref() {
                // check / not-null violation
                Some("23514") | Some("23502") => LockStoreError::Rejected(msg),
                _ => LockStoreError::Unavailable(msg),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) => {
            LockStoreError::Corrupt(format!("decode error in {}: {}", operation, err))
        }
        sqlx::Error::PoolTimedOut => {
            LockStoreError::Unavailable(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            LockStoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        _ => LockStoreError::Unavailable(format!("sqlx error in {}: {}", operation, err)),
    }
}
