//! SQLite storage backend implementation
//!
//! This module provides a SQLite-based implementation of the `StorageBackend`
//! trait, and of `MonitorRegistry` over the `monitors` table.
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Readers (API queries) don't block the storage actor's writes
//! - **Connection pooling**: Efficient resource usage
//! - **Migrations**: Automatic schema versioning with sqlx
//! - **Idempotent writes**: Check results and incidents are keyed by UUID, so
//!   a retried batch never produces duplicates
//!
//! ## Limitations
//!
//! - **Concurrency**: Limited concurrent writes
//! - **Distributed**: Single-machine only, matching the single scheduling authority

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::backend::{HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::schema::{UptimeStats, round2, uptime_percentage};
use crate::monitor::{CheckError, CheckResult, Incident, MonitorConfig, MonitorId};
use crate::registry::{MonitorRegistry, RegistryError};

/// SQLite storage backend
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Create a new SQLite backend
    ///
    /// This will:
    /// 1. Create the database file if it doesn't exist
    /// 2. Run migrations to create tables
    /// 3. Configure SQLite for WAL mode
    ///
    /// ## Example
    ///
    /// ```no_run
    /// # use apiwatch::storage::sqlite::SqliteBackend;
    /// # async fn example() -> anyhow::Result<()> {
    /// let backend = SqliteBackend::new("./apiwatch.db").await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StorageError::MigrationFailed(e.to_string()))?;

        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    /// Create or replace a monitor row
    ///
    /// The checker never calls this itself; it is the write side used by the
    /// monitor CRUD collaborator and by tests.
    #[instrument(skip(self, config), fields(monitor_id = config.id))]
    pub async fn upsert_monitor(&self, config: &MonitorConfig) -> StorageResult<()> {
        let headers = serde_json::to_string(&config.headers).map_err(|e| {
            StorageError::SerializationError(format!("failed to serialize headers: {}", e))
        })?;

        sqlx::query(
            r#"
            INSERT INTO monitors (
                id, owner_id, name, url, method, headers,
                expected_status, check_interval, timeout, is_active, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                owner_id = excluded.owner_id,
                name = excluded.name,
                url = excluded.url,
                method = excluded.method,
                headers = excluded.headers,
                expected_status = excluded.expected_status,
                check_interval = excluded.check_interval,
                timeout = excluded.timeout,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(config.id)
        .bind(config.owner_id)
        .bind(&config.name)
        .bind(&config.url)
        .bind(config.method.as_str())
        .bind(headers)
        .bind(i64::from(config.expected_status))
        .bind(config.check_interval as i64)
        .bind(config.timeout as i64)
        .bind(config.is_active)
        .bind(config.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete a monitor row, returns whether it existed
    pub async fn delete_monitor(&self, id: MonitorId) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM monitors WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    fn millis_to_timestamp(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
    }

    fn parse_uuid(raw: &str) -> StorageResult<Uuid> {
        Uuid::parse_str(raw)
            .map_err(|e| StorageError::SerializationError(format!("invalid uuid '{}': {}", raw, e)))
    }

    fn parse_check_error(raw: &str) -> StorageResult<CheckError> {
        raw.parse().map_err(StorageError::SerializationError)
    }

    /// Narrow an integer column, rejecting values out of range
    fn column_int<T: TryFrom<i64>>(row: &SqliteRow, column: &str) -> StorageResult<T> {
        Self::narrow(row.get::<i64, _>(column), column)
    }

    fn narrow<T: TryFrom<i64>>(value: i64, column: &str) -> StorageResult<T> {
        T::try_from(value).map_err(|_| {
            StorageError::SerializationError(format!("{column} out of range: {value}"))
        })
    }

    fn row_to_check(row: SqliteRow) -> StorageResult<CheckResult> {
        let check_id: String = row.get("check_id");
        let error: Option<String> = row.get("error");

        Ok(CheckResult {
            check_id: Self::parse_uuid(&check_id)?,
            monitor_id: row.get("monitor_id"),
            timestamp: Self::millis_to_timestamp(row.get("timestamp")),
            success: row.get("success"),
            status_code: row
                .get::<Option<i64>, _>("status_code")
                .map(|v| Self::narrow(v, "status_code"))
                .transpose()?,
            latency_ms: row
                .get::<Option<i64>, _>("latency_ms")
                .map(|v| Self::narrow(v, "latency_ms"))
                .transpose()?,
            error: error.as_deref().map(Self::parse_check_error).transpose()?,
            error_message: row.get("error_message"),
        })
    }

    fn row_to_incident(row: SqliteRow) -> StorageResult<Incident> {
        let id: String = row.get("id");
        let cause: String = row.get("cause");

        Ok(Incident {
            id: Self::parse_uuid(&id)?,
            monitor_id: row.get("monitor_id"),
            opened_at: Self::millis_to_timestamp(row.get("opened_at")),
            resolved_at: row
                .get::<Option<i64>, _>("resolved_at")
                .map(Self::millis_to_timestamp),
            cause: Self::parse_check_error(&cause)?,
        })
    }

    /// Decode monitor rows, skipping the ones that cannot be read
    fn decode_monitors(rows: Vec<SqliteRow>) -> Vec<MonitorConfig> {
        rows.into_iter()
            .filter_map(|row| {
                let id: MonitorId = row.get("id");
                match Self::row_to_monitor(row) {
                    Ok(monitor) => Some(monitor),
                    Err(e) => {
                        warn!("skipping unreadable monitor {id}: {e}");
                        None
                    }
                }
            })
            .collect()
    }

    fn row_to_monitor(row: SqliteRow) -> StorageResult<MonitorConfig> {
        let method: String = row.get("method");
        let headers: String = row.get("headers");

        Ok(MonitorConfig {
            id: row.get("id"),
            owner_id: row.get("owner_id"),
            name: row.get("name"),
            url: row.get("url"),
            method: method.parse().map_err(StorageError::SerializationError)?,
            headers: serde_json::from_str(&headers).map_err(|e| {
                StorageError::SerializationError(format!("failed to deserialize headers: {}", e))
            })?,
            expected_status: Self::column_int(&row, "expected_status")?,
            check_interval: Self::column_int(&row, "check_interval")?,
            timeout: Self::column_int(&row, "timeout")?,
            is_active: row.get("is_active"),
            updated_at: Self::millis_to_timestamp(row.get("updated_at")),
        })
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    #[instrument(skip(self, results), fields(count = results.len()))]
    async fn append_check_results(&self, results: Vec<CheckResult>) -> StorageResult<()> {
        if results.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for result in &results {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO check_results (
                    check_id, monitor_id, timestamp, success,
                    status_code, latency_ms, error, error_message
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(result.check_id.to_string())
            .bind(result.monitor_id)
            .bind(result.timestamp.timestamp_millis())
            .bind(result.success)
            .bind(result.status_code.map(i64::from))
            .bind(result.latency_ms.map(|v| v as i64))
            .bind(result.error.map(|e| e.as_str()))
            .bind(result.error_message.as_deref())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!("batch insert complete");
        Ok(())
    }

    #[instrument(skip(self, incident), fields(monitor_id = incident.monitor_id, incident_id = %incident.id))]
    async fn open_incident(&self, incident: &Incident) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO incidents (id, monitor_id, opened_at, resolved_at, cause)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(incident.id.to_string())
        .bind(incident.monitor_id)
        .bind(incident.opened_at.timestamp_millis())
        .bind(incident.resolved_at.map(|t| t.timestamp_millis()))
        .bind(incident.cause.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn resolve_incident(&self, id: Uuid, resolved_at: DateTime<Utc>) -> StorageResult<()> {
        let id_str = id.to_string();

        let result = sqlx::query(
            "UPDATE incidents SET resolved_at = ? WHERE id = ? AND resolved_at IS NULL",
        )
        .bind(resolved_at.timestamp_millis())
        .bind(&id_str)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // either already resolved (fine) or unknown
            let exists = sqlx::query("SELECT 1 FROM incidents WHERE id = ?")
                .bind(&id_str)
                .fetch_optional(&self.pool)
                .await?;
            if exists.is_none() {
                return Err(StorageError::NotFound(format!("incident {}", id)));
            }
        }

        Ok(())
    }

    #[instrument(skip(self))]
    async fn latest_checks(
        &self,
        monitor_id: MonitorId,
        limit: usize,
    ) -> StorageResult<Vec<CheckResult>> {
        let rows = sqlx::query(
            r#"
            SELECT check_id, monitor_id, timestamp, success,
                   status_code, latency_ms, error, error_message
            FROM check_results
            WHERE monitor_id = ?
            ORDER BY timestamp DESC
            LIMIT ?
            "#,
        )
        .bind(monitor_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_check).collect()
    }

    #[instrument(skip(self))]
    async fn checks_since(
        &self,
        monitor_id: MonitorId,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<CheckResult>> {
        let rows = sqlx::query(
            r#"
            SELECT check_id, monitor_id, timestamp, success,
                   status_code, latency_ms, error, error_message
            FROM check_results
            WHERE monitor_id = ? AND timestamp >= ?
            ORDER BY timestamp ASC
            "#,
        )
        .bind(monitor_id)
        .bind(since.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_check).collect()
    }

    #[instrument(skip(self))]
    async fn incidents(&self, monitor_id: MonitorId, limit: usize) -> StorageResult<Vec<Incident>> {
        let rows = sqlx::query(
            r#"
            SELECT id, monitor_id, opened_at, resolved_at, cause
            FROM incidents
            WHERE monitor_id = ?
            ORDER BY opened_at DESC
            LIMIT ?
            "#,
        )
        .bind(monitor_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_incident).collect()
    }

    #[instrument(skip(self))]
    async fn open_incidents(&self) -> StorageResult<Vec<Incident>> {
        let rows = sqlx::query(
            r#"
            SELECT id, monitor_id, opened_at, resolved_at, cause
            FROM incidents
            WHERE resolved_at IS NULL
            ORDER BY opened_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_incident).collect()
    }

    #[instrument(skip(self))]
    async fn uptime(
        &self,
        monitor_id: MonitorId,
        since: DateTime<Utc>,
    ) -> StorageResult<UptimeStats> {
        let since_millis = since.timestamp_millis();

        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(success), 0) AS successful,
                AVG(CASE WHEN success = 1 THEN latency_ms END) AS avg_latency
            FROM check_results
            WHERE monitor_id = ? AND timestamp >= ?
            "#,
        )
        .bind(monitor_id)
        .bind(since_millis)
        .fetch_one(&self.pool)
        .await?;

        let total = row.get::<i64, _>("total") as u64;
        let successful = row.get::<i64, _>("successful") as u64;
        let avg_latency: Option<f64> = row.get("avg_latency");

        let last = sqlx::query(
            r#"
            SELECT timestamp, success
            FROM check_results
            WHERE monitor_id = ? AND timestamp >= ?
            ORDER BY timestamp DESC
            LIMIT 1
            "#,
        )
        .bind(monitor_id)
        .bind(since_millis)
        .fetch_optional(&self.pool)
        .await?;

        let incidents = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN opened_at >= ? THEN 1 ELSE 0 END), 0) AS total,
                COALESCE(SUM(CASE WHEN resolved_at IS NULL THEN 1 ELSE 0 END), 0) AS ongoing
            FROM incidents
            WHERE monitor_id = ?
            "#,
        )
        .bind(since_millis)
        .bind(monitor_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(UptimeStats {
            monitor_id,
            since,
            total_checks: total,
            successful_checks: successful,
            failed_checks: total - successful,
            uptime_percentage: uptime_percentage(successful, total),
            avg_response_time_ms: avg_latency.map(round2),
            last_check_at: last
                .as_ref()
                .map(|r| Self::millis_to_timestamp(r.get("timestamp"))),
            last_check_success: last.as_ref().map(|r| r.get("success")),
            total_incidents: incidents.get::<i64, _>("total") as u64,
            ongoing_incidents: incidents.get::<i64, _>("ongoing") as u64,
        })
    }

    #[instrument(skip(self), fields(before = %before))]
    async fn cleanup_old_checks(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        info!("cleaning up check results older than {}", before);

        let result = sqlx::query("DELETE FROM check_results WHERE timestamp < ?")
            .bind(before.timestamp_millis())
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() as usize;
        info!("deleted {} old check results", deleted);

        Ok(deleted)
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => {
                let mut metadata = HashMap::new();
                metadata.insert("backend".to_string(), "sqlite".to_string());
                metadata.insert("db_path".to_string(), self.db_path.clone());

                Ok(HealthStatus {
                    healthy: true,
                    message: "SQLite backend operational".to_string(),
                    metadata,
                })
            }
            Err(e) => {
                warn!("health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {}", e),
                    metadata: HashMap::new(),
                })
            }
        }
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite connection pool");
        self.pool.close().await;
        Ok(())
    }
}

#[async_trait]
impl MonitorRegistry for SqliteBackend {
    #[instrument(skip(self))]
    async fn list_active_monitors(&self) -> Result<Vec<MonitorConfig>, RegistryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner_id, name, url, method, headers,
                   expected_status, check_interval, timeout, is_active, updated_at
            FROM monitors
            WHERE is_active = 1
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::from)?;

        let monitors = Self::decode_monitors(rows);
        debug!("loaded {} active monitors", monitors.len());
        Ok(monitors)
    }

    #[instrument(skip(self))]
    async fn list_monitors(&self) -> Result<Vec<MonitorConfig>, RegistryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner_id, name, url, method, headers,
                   expected_status, check_interval, timeout, is_active, updated_at
            FROM monitors
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::from)?;

        Ok(Self::decode_monitors(rows))
    }
}
