use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{ProcessHandle, ResourceId, Xid};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::{LogEntry, LogError, LogState, LogStream, Result, TransactionLog};

const COLUMNS: &str =
    "format, gtrid, bqual, owner_pid, owner_queue, state, resources, started, updated, deadline";

/// PostgreSQL-backed transaction log.
#[derive(Clone)]
pub struct PostgresTransactionLog {
    pool: PgPool,
}

impl PostgresTransactionLog {
    /// Creates a new PostgreSQL transaction log.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_entry(row: PgRow) -> Result<LogEntry> {
        let xid = Xid::from_parts(
            row.try_get::<i64, _>("format")?,
            row.try_get::<Vec<u8>, _>("gtrid")?,
            row.try_get::<Vec<u8>, _>("bqual")?,
        )
        .map_err(|e| LogError::Corrupt {
            line: 0,
            reason: e.to_string(),
        })?;

        let state: String = row.try_get("state")?;
        let state = state
            .parse::<LogState>()
            .map_err(|reason| LogError::Corrupt { line: 0, reason })?;

        let pid: i64 = row.try_get("owner_pid")?;
        let resources: Vec<i32> = row.try_get("resources")?;

        Ok(LogEntry {
            xid,
            owner: ProcessHandle::new(pid as u32, row.try_get("owner_queue")?),
            state,
            resources: resources.into_iter().map(ResourceId::new).collect(),
            started: row.try_get("started")?,
            updated: row.try_get("updated")?,
            deadline: row.try_get("deadline")?,
        })
    }

    fn resource_values(resources: &[ResourceId]) -> Vec<i32> {
        resources.iter().map(ResourceId::value).collect()
    }
}

#[async_trait]
impl TransactionLog for PostgresTransactionLog {
    async fn begin(&self, entry: LogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transaction_log (format, gtrid, bqual, owner_pid, owner_queue, state, resources, started, updated, deadline)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (format, gtrid, bqual) DO NOTHING
            "#,
        )
        .bind(entry.xid.format())
        .bind(entry.xid.gtrid())
        .bind(entry.xid.bqual())
        .bind(i64::from(entry.owner.pid))
        .bind(entry.owner.queue)
        .bind(entry.state.as_str())
        .bind(Self::resource_values(&entry.resources))
        .bind(entry.started)
        .bind(entry.updated)
        .bind(entry.deadline)
        .execute(&self.pool)
        .await?;

        metrics::counter!("tm_log_writes_total").increment(1);
        Ok(())
    }

    async fn prepare(
        &self,
        xid: &Xid,
        owner: &ProcessHandle,
        resources: &[ResourceId],
    ) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO transaction_log (format, gtrid, bqual, owner_pid, owner_queue, state, resources, started, updated, deadline)
            VALUES ($1, $2, $3, $4, $5, 'prepared', $6, $7, $7, NULL)
            ON CONFLICT (format, gtrid, bqual)
            DO UPDATE SET state = 'prepared', resources = EXCLUDED.resources, updated = EXCLUDED.updated
            "#,
        )
        .bind(xid.format())
        .bind(xid.gtrid())
        .bind(xid.bqual())
        .bind(i64::from(owner.pid))
        .bind(owner.queue)
        .bind(Self::resource_values(resources))
        .bind(now)
        .execute(&self.pool)
        .await?;

        metrics::counter!("tm_log_writes_total").increment(1);
        Ok(())
    }

    async fn timeout(&self, xid: &Xid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE transaction_log SET state = 'timeout', updated = $4
            WHERE format = $1 AND gtrid = $2 AND bqual = $3
            "#,
        )
        .bind(xid.format())
        .bind(xid.gtrid())
        .bind(xid.bqual())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        metrics::counter!("tm_log_writes_total").increment(1);
        Ok(())
    }

    async fn remove(&self, xid: &Xid) -> Result<()> {
        sqlx::query("DELETE FROM transaction_log WHERE format = $1 AND gtrid = $2 AND bqual = $3")
            .bind(xid.format())
            .bind(xid.gtrid())
            .bind(xid.bqual())
            .execute(&self.pool)
            .await?;

        metrics::counter!("tm_log_writes_total").increment(1);
        Ok(())
    }

    async fn select(&self, xid: &Xid) -> Result<Option<LogEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM transaction_log WHERE format = $1 AND gtrid = $2 AND bqual = $3"
        ))
        .bind(xid.format())
        .bind(xid.gtrid())
        .bind(xid.bqual())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_entry).transpose()
    }

    async fn scan(&self) -> Result<LogStream> {
        use futures_util::StreamExt;

        let stream = sqlx::query(
            r#"
            SELECT format, gtrid, bqual, owner_pid, owner_queue, state, resources, started, updated, deadline
            FROM transaction_log
            ORDER BY started ASC, gtrid ASC
            "#,
        )
        .fetch(&self.pool)
        .map(|result| match result {
            Ok(row) => Self::row_to_entry(row),
            Err(e) => Err(LogError::Database(e)),
        });

        Ok(Box::pin(stream))
    }

    async fn passed(&self, now: DateTime<Utc>) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM transaction_log WHERE deadline < $1 ORDER BY deadline ASC"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_entry).collect()
    }
}
