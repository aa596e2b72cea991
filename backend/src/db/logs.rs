use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::{postgres::PgPool, FromRow, Postgres, QueryBuilder, Row};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{app_id, corrupt, db_id};
use crate::error::ProvisioningResult;
use crate::telemetry::{
    LogContext, LogEntry, LogFilter, LogLevel, LogSink, LogStore, DEFAULT_QUERY_LIMIT,
};

const WRITE_BUFFER: usize = 1024;

#[derive(FromRow)]
struct LogRow {
    id: Uuid,
    logged_at: DateTime<Utc>,
    level: String,
    event_type: String,
    order_id: Option<i64>,
    customer_email: Option<String>,
    status: String,
    message: String,
    context: Value,
}

impl LogRow {
    fn into_entry(self) -> ProvisioningResult<LogEntry> {
        let level = LogLevel::parse(&self.level).ok_or_else(|| corrupt("log level", &self.level))?;
        Ok(LogEntry {
            id: self.id,
            timestamp: self.logged_at,
            level,
            event_type: self.event_type,
            order_id: self.order_id.map(app_id).transpose()?,
            customer_email: self.customer_email,
            status: self.status,
            message: self.message,
            context: self.context,
        })
    }
}

/// Integration log persisted to `integration_log`. Writes go through a
/// bounded channel to a background task so logging never blocks a request;
/// entries are dropped with a tracing warning when the buffer is full.
#[derive(Clone)]
pub struct PgIntegrationLog {
    pool: PgPool,
    sender: mpsc::Sender<LogEntry>,
    debug_enabled: bool,
}

impl PgIntegrationLog {
    /// Must be called from within a tokio runtime.
    pub fn spawn(pool: PgPool, debug_enabled: bool) -> Self {
        let (sender, mut receiver) = mpsc::channel::<LogEntry>(WRITE_BUFFER);
        let writer_pool = pool.clone();
        tokio::spawn(async move {
            while let Some(entry) = receiver.recv().await {
                if let Err(err) = insert_entry(&writer_pool, &entry).await {
                    tracing::error!(?err, entry_id = %entry.id, "failed to persist log entry");
                }
            }
        });
        Self {
            pool,
            sender,
            debug_enabled,
        }
    }
}

async fn insert_entry(pool: &PgPool, entry: &LogEntry) -> ProvisioningResult<()> {
    sqlx::query(
        r#"INSERT INTO integration_log
               (id, logged_at, level, event_type, order_id, customer_email, status, message, context)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
    )
    .bind(entry.id)
    .bind(entry.timestamp)
    .bind(entry.level.as_str())
    .bind(&entry.event_type)
    .bind(entry.order_id.map(db_id).transpose()?)
    .bind(&entry.customer_email)
    .bind(&entry.status)
    .bind(&entry.message)
    .bind(&entry.context)
    .execute(pool)
    .await?;
    Ok(())
}

fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, filter: &LogFilter) -> ProvisioningResult<()> {
    builder.push(" WHERE TRUE");
    if let Some(level) = filter.level {
        builder.push(" AND level = ");
        builder.push_bind(level.as_str());
    }
    if let Some(event_type) = &filter.event_type {
        builder.push(" AND event_type = ");
        builder.push_bind(event_type.clone());
    }
    if let Some(order_id) = filter.order_id {
        builder.push(" AND order_id = ");
        builder.push_bind(db_id(order_id)?);
    }
    if let Some(status) = &filter.status {
        builder.push(" AND status = ");
        builder.push_bind(status.clone());
    }
    if let Some(from) = filter.date_from {
        builder.push(" AND logged_at >= ");
        builder.push_bind(from);
    }
    if let Some(to) = filter.date_to {
        builder.push(" AND logged_at <= ");
        builder.push_bind(to);
    }
    Ok(())
}

impl LogSink for PgIntegrationLog {
    fn log(&self, level: LogLevel, message: &str, context: LogContext) -> Option<Uuid> {
        let entry = LogEntry::record(level, message, context, self.debug_enabled)?;
        entry.trace();
        let id = entry.id;
        if let Err(err) = self.sender.try_send(entry) {
            tracing::warn!(entry_id = %id, %err, "integration log buffer full, entry not persisted");
        }
        Some(id)
    }
}

#[async_trait]
impl LogStore for PgIntegrationLog {
    async fn query(&self, filter: &LogFilter) -> ProvisioningResult<Vec<LogEntry>> {
        let mut builder = QueryBuilder::new(
            "SELECT id, logged_at, level, event_type, order_id, customer_email, status, message, context FROM integration_log",
        );
        push_filters(&mut builder, filter)?;
        builder.push(" ORDER BY logged_at DESC, id DESC LIMIT ");
        builder.push_bind(filter.limit.unwrap_or(DEFAULT_QUERY_LIMIT) as i64);
        builder.push(" OFFSET ");
        builder.push_bind(filter.offset.unwrap_or(0) as i64);

        let rows = builder
            .build_query_as::<LogRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(LogRow::into_entry).collect()
    }

    async fn count(&self, filter: &LogFilter) -> ProvisioningResult<u64> {
        let mut builder = QueryBuilder::new("SELECT COUNT(*) AS total FROM integration_log");
        push_filters(&mut builder, filter)?;
        let row = builder.build().fetch_one(&self.pool).await?;
        let total: i64 = row.try_get("total")?;
        Ok(u64::try_from(total).unwrap_or(0))
    }

    async fn purge_older_than(
        &self,
        retention_days: u32,
        now: DateTime<Utc>,
    ) -> ProvisioningResult<u64> {
        let cutoff = now - Duration::days(i64::from(retention_days));
        let result = sqlx::query("DELETE FROM integration_log WHERE logged_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected();
        self.info(
            &format!("Cleaned up {deleted} old log entries"),
            LogContext::event("cleanup")
                .status("success")
                .field("deleted", deleted),
        );
        Ok(deleted)
    }
}
