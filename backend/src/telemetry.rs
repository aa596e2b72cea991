use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ProvisioningResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warning" => Some(LogLevel::Warning),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// Structured context attached to an integration log entry. The four well-known
/// fields are indexed; everything else travels in `fields`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LogContext {
    pub event_type: Option<String>,
    pub order_id: Option<u64>,
    pub customer_email: Option<String>,
    pub status: Option<String>,
    pub fields: Map<String, Value>,
}

impl LogContext {
    pub fn event(event_type: &str) -> Self {
        Self {
            event_type: Some(event_type.to_string()),
            ..Self::default()
        }
    }

    pub fn order(mut self, order_id: u64) -> Self {
        self.order_id = Some(order_id);
        self
    }

    pub fn email(mut self, email: &str) -> Self {
        self.customer_email = Some(email.to_string());
        self
    }

    pub fn status(mut self, status: &str) -> Self {
        self.status = Some(status.to_string());
        self
    }

    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub event_type: String,
    pub order_id: Option<u64>,
    pub customer_email: Option<String>,
    pub status: String,
    pub message: String,
    pub context: Value,
}

impl LogEntry {
    /// Builds the stored entry, or `None` for a debug entry while debug mode is off.
    pub fn record(
        level: LogLevel,
        message: &str,
        context: LogContext,
        debug_enabled: bool,
    ) -> Option<Self> {
        if level == LogLevel::Debug && !debug_enabled {
            return None;
        }
        Some(Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            level,
            event_type: context.event_type.unwrap_or_else(|| "general".to_string()),
            order_id: context.order_id,
            customer_email: context.customer_email,
            status: context.status.unwrap_or_else(|| "unknown".to_string()),
            message: message.to_string(),
            context: Value::Object(context.fields),
        })
    }

    /// Mirrors the entry to `tracing`.
    pub fn trace(&self) {
        let event_type = self.event_type.as_str();
        let status = self.status.as_str();
        let order_id = self.order_id;
        let fields = &self.context;
        let message = self.message.as_str();
        match self.level {
            LogLevel::Debug => {
                tracing::debug!(%event_type, ?order_id, %status, %fields, "{message}")
            }
            LogLevel::Info => {
                tracing::info!(%event_type, ?order_id, %status, %fields, "{message}")
            }
            LogLevel::Warning => {
                tracing::warn!(%event_type, ?order_id, %status, %fields, "{message}")
            }
            LogLevel::Error => {
                tracing::error!(%event_type, ?order_id, %status, %fields, "{message}")
            }
        }
    }
}

/// Sink for the integration event log.
pub trait LogSink: Send + Sync {
    /// Records an entry and returns its id, or `None` when the entry was suppressed.
    fn log(&self, level: LogLevel, message: &str, context: LogContext) -> Option<Uuid>;

    fn debug(&self, message: &str, context: LogContext) -> Option<Uuid> {
        self.log(LogLevel::Debug, message, context)
    }

    fn info(&self, message: &str, context: LogContext) -> Option<Uuid> {
        self.log(LogLevel::Info, message, context)
    }

    fn warning(&self, message: &str, context: LogContext) -> Option<Uuid> {
        self.log(LogLevel::Warning, message, context)
    }

    fn error(&self, message: &str, context: LogContext) -> Option<Uuid> {
        self.log(LogLevel::Error, message, context)
    }
}

/// Read side of the integration log, backing the admin log view.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Newest first, paginated by `limit`/`offset`.
    async fn query(&self, filter: &LogFilter) -> ProvisioningResult<Vec<LogEntry>>;

    async fn count(&self, filter: &LogFilter) -> ProvisioningResult<u64>;

    /// Drops entries older than the retention window and returns how many went.
    async fn purge_older_than(
        &self,
        retention_days: u32,
        now: DateTime<Utc>,
    ) -> ProvisioningResult<u64>;
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogFilter {
    pub level: Option<LogLevel>,
    pub event_type: Option<String>,
    pub order_id: Option<u64>,
    pub status: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl LogFilter {
    fn matches(&self, entry: &LogEntry) -> bool {
        self.level.map_or(true, |level| entry.level == level)
            && self
                .event_type
                .as_deref()
                .map_or(true, |event| entry.event_type == event)
            && self.order_id.map_or(true, |id| entry.order_id == Some(id))
            && self
                .status
                .as_deref()
                .map_or(true, |status| entry.status == status)
            && self.date_from.map_or(true, |from| entry.timestamp >= from)
            && self.date_to.map_or(true, |to| entry.timestamp <= to)
    }
}

pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Integration log that mirrors every entry to `tracing` and keeps it queryable
/// in memory. Used by tests and the route fixtures.
pub struct IntegrationLog {
    entries: RwLock<Vec<LogEntry>>,
    debug_enabled: bool,
}

impl IntegrationLog {
    pub fn new(debug_enabled: bool) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            debug_enabled,
        }
    }

    /// Newest first, paginated by `limit`/`offset`.
    pub fn query(&self, filter: &LogFilter) -> Vec<LogEntry> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .rev()
            .filter(|entry| filter.matches(entry))
            .skip(filter.offset.unwrap_or(0))
            .take(filter.limit.unwrap_or(DEFAULT_QUERY_LIMIT))
            .cloned()
            .collect()
    }

    pub fn count(&self, filter: &LogFilter) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.iter().filter(|entry| filter.matches(entry)).count()
    }

    /// Drops entries older than the retention window. Invoked by external maintenance.
    pub fn purge_older_than(&self, retention_days: u32, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::days(i64::from(retention_days));
        let deleted = {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            let before = entries.len();
            entries.retain(|entry| entry.timestamp >= cutoff);
            before - entries.len()
        };
        self.info(
            &format!("Cleaned up {deleted} old log entries"),
            LogContext::event("cleanup")
                .status("success")
                .field("deleted", deleted as u64),
        );
        deleted
    }
}

impl LogSink for IntegrationLog {
    fn log(&self, level: LogLevel, message: &str, context: LogContext) -> Option<Uuid> {
        let entry = LogEntry::record(level, message, context, self.debug_enabled)?;
        entry.trace();
        let id = entry.id;
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
        Some(id)
    }
}

#[async_trait]
impl LogStore for IntegrationLog {
    async fn query(&self, filter: &LogFilter) -> ProvisioningResult<Vec<LogEntry>> {
        Ok(IntegrationLog::query(self, filter))
    }

    async fn count(&self, filter: &LogFilter) -> ProvisioningResult<u64> {
        Ok(IntegrationLog::count(self, filter) as u64)
    }

    async fn purge_older_than(
        &self,
        retention_days: u32,
        now: DateTime<Utc>,
    ) -> ProvisioningResult<u64> {
        Ok(IntegrationLog::purge_older_than(self, retention_days, now) as u64)
    }
}
