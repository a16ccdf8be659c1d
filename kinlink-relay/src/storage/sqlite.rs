//! SQLite storage backend for kinlink-relay.

use super::{Device, IssuedCode, Pairing, PairingStore, CODE_DIGITS};
use crate::error::StorageError;
use async_trait::async_trait;
use kinlink_types::{DeviceId, Role};
use rand::Rng;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Attempts at drawing an unused code before giving up.
const MAX_CODE_ATTEMPTS: u32 = 16;

/// SQLite-based pairing storage.
///
/// Uses WAL mode for concurrent reads/writes.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("connections", &self.pool.size())
            .finish()
    }
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    device_id: String,
    role: String,
    created_at: i64,
}

#[derive(sqlx::FromRow)]
struct PairingRow {
    guardian_id: String,
    elder_id: String,
    created_at: i64,
}

impl TryFrom<DeviceRow> for Device {
    type Error = StorageError;

    fn try_from(row: DeviceRow) -> Result<Self, Self::Error> {
        Ok(Device {
            device_id: parse_id(row.device_id)?,
            role: Role::from_str(&row.role).map_err(|e| StorageError::Corrupt(e.to_string()))?,
            created_at: row.created_at,
        })
    }
}

impl TryFrom<PairingRow> for Pairing {
    type Error = StorageError;

    fn try_from(row: PairingRow) -> Result<Self, Self::Error> {
        Ok(Pairing {
            guardian_id: parse_id(row.guardian_id)?,
            elder_id: parse_id(row.elder_id)?,
            created_at: row.created_at,
        })
    }
}

fn parse_id(raw: String) -> Result<DeviceId, StorageError> {
    DeviceId::new(raw).map_err(|e| StorageError::Corrupt(e.to_string()))
}

impl SqliteStorage {
    /// Create a new SQLite storage from a database path.
    ///
    /// Creates the database file if it doesn't exist.
    pub async fn new(path: &Path) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite storage (for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(":memory:")?;

        // A single connection that never recycles: the database lives and
        // dies with it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Close the pool, waiting for in-flight queries.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                device_id TEXT PRIMARY KEY,
                role TEXT NOT NULL CHECK (role IN ('guardian', 'elder')),
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pairing_codes (
                code TEXT PRIMARY KEY,
                elder_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pairings (
                guardian_id TEXT NOT NULL,
                elder_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (guardian_id, elder_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_codes_expires ON pairing_codes(expires_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_codes_elder ON pairing_codes(elder_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_pairings_elder ON pairings(elder_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn current_timestamp() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    fn random_code() -> String {
        let bound = 10u32.pow(CODE_DIGITS as u32);
        let n = rand::thread_rng().gen_range(0..bound);
        format!("{:0width$}", n, width = CODE_DIGITS)
    }

    /// Register a device under a role.
    ///
    /// Re-registering with the same role is a no-op; a different role is
    /// rejected.
    pub async fn register_device(
        &self,
        device_id: &DeviceId,
        role: Role,
    ) -> Result<Device, StorageError> {
        sqlx::query(
            r#"
            INSERT INTO devices (device_id, role, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(device_id) DO NOTHING
            "#,
        )
        .bind(device_id.as_str())
        .bind(role.as_str())
        .bind(Self::current_timestamp())
        .execute(&self.pool)
        .await?;

        let device = self
            .get_device(device_id)
            .await?
            .ok_or_else(|| StorageError::DeviceNotFound {
                device_id: device_id.clone(),
            })?;

        if device.role != role {
            return Err(StorageError::RoleMismatch {
                device_id: device_id.clone(),
                expected: role,
            });
        }
        Ok(device)
    }

    /// Fetch a registered device.
    pub async fn get_device(&self, device_id: &DeviceId) -> Result<Option<Device>, StorageError> {
        let row = sqlx::query_as::<_, DeviceRow>(
            "SELECT device_id, role, created_at FROM devices WHERE device_id = ?1",
        )
        .bind(device_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Device::try_from).transpose()
    }

    async fn require_role(&self, device_id: &DeviceId, role: Role) -> Result<(), StorageError> {
        match self.get_device(device_id).await? {
            None => Err(StorageError::DeviceNotFound {
                device_id: device_id.clone(),
            }),
            Some(device) if device.role != role => Err(StorageError::RoleMismatch {
                device_id: device_id.clone(),
                expected: role,
            }),
            Some(_) => Ok(()),
        }
    }

    /// Issue a single-use pairing code for an elder.
    ///
    /// Any code the elder issued earlier stops working.
    pub async fn issue_code(
        &self,
        elder_id: &DeviceId,
        ttl: Duration,
    ) -> Result<IssuedCode, StorageError> {
        self.require_role(elder_id, Role::Elder).await?;

        let now = Self::current_timestamp();
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let expires_at = now.saturating_add(ttl_secs);

        sqlx::query("DELETE FROM pairing_codes WHERE elder_id = ?1 OR expires_at <= ?2")
            .bind(elder_id.as_str())
            .bind(now)
            .execute(&self.pool)
            .await?;

        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = Self::random_code();
            let inserted = sqlx::query(
                r#"
                INSERT INTO pairing_codes (code, elder_id, created_at, expires_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
            )
            .bind(&code)
            .bind(elder_id.as_str())
            .bind(now)
            .bind(expires_at)
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(_) => {
                    tracing::debug!("Issued pairing code for elder {}", elder_id);
                    return Ok(IssuedCode {
                        code,
                        elder_id: elder_id.clone(),
                        expires_at,
                    });
                }
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(StorageError::CodeSpaceExhausted {
            attempts: MAX_CODE_ATTEMPTS,
        })
    }

    /// Redeem a pairing code on behalf of a guardian.
    ///
    /// The code is consumed and the guardian/elder pairing created in one
    /// transaction. Redeeming for an existing pairing is not an error.
    pub async fn redeem_code(
        &self,
        guardian_id: &DeviceId,
        code: &str,
    ) -> Result<Pairing, StorageError> {
        self.require_role(guardian_id, Role::Guardian).await?;

        let now = Self::current_timestamp();
        let mut tx = self.pool.begin().await?;

        let elder: Option<String> = sqlx::query_scalar(
            "DELETE FROM pairing_codes WHERE code = ?1 AND expires_at > ?2 RETURNING elder_id",
        )
        .bind(code)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let elder_id = parse_id(elder.ok_or(StorageError::InvalidCode)?)?;

        sqlx::query(
            r#"
            INSERT INTO pairings (guardian_id, elder_id, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(guardian_id, elder_id) DO NOTHING
            "#,
        )
        .bind(guardian_id.as_str())
        .bind(elder_id.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let created_at: i64 = sqlx::query_scalar(
            "SELECT created_at FROM pairings WHERE guardian_id = ?1 AND elder_id = ?2",
        )
        .bind(guardian_id.as_str())
        .bind(elder_id.as_str())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!("Paired guardian {} with elder {}", guardian_id, elder_id);
        Ok(Pairing {
            guardian_id: guardian_id.clone(),
            elder_id,
            created_at,
        })
    }

    /// All pairings a device takes part in, on either side.
    pub async fn list_pairings(&self, device_id: &DeviceId) -> Result<Vec<Pairing>, StorageError> {
        let rows = sqlx::query_as::<_, PairingRow>(
            r#"
            SELECT guardian_id, elder_id, created_at
            FROM pairings
            WHERE guardian_id = ?1 OR elder_id = ?1
            ORDER BY created_at ASC, guardian_id ASC, elder_id ASC
            "#,
        )
        .bind(device_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Pairing::try_from).collect()
    }

    /// Delete a pairing. Returns whether one existed.
    pub async fn remove_pairing(
        &self,
        guardian_id: &DeviceId,
        elder_id: &DeviceId,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM pairings WHERE guardian_id = ?1 AND elder_id = ?2")
            .bind(guardian_id.as_str())
            .bind(elder_id.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove expired pairing codes.
    ///
    /// Returns the number of codes deleted.
    pub async fn cleanup_expired_codes(&self) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM pairing_codes WHERE expires_at <= ?1")
            .bind(Self::current_timestamp())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Number of registered devices.
    pub async fn total_devices(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM devices")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Number of pairings.
    pub async fn total_pairings(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pairings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Number of codes that can still be redeemed.
    pub async fn active_codes(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pairing_codes WHERE expires_at > ?1")
            .bind(Self::current_timestamp())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

#[async_trait]
impl PairingStore for SqliteStorage {
    async fn has_pairing(
        &self,
        guardian_id: &DeviceId,
        elder_id: &DeviceId,
    ) -> Result<bool, StorageError> {
        let exists: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM pairings WHERE guardian_id = ?1 AND elder_id = ?2)",
        )
        .bind(guardian_id.as_str())
        .bind(elder_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(exists != 0)
    }
}
