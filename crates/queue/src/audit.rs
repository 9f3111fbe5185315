use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use payrouter_core::{AuditSink, Status};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

pub const OUTCOME: &str = "outcome";
pub const API_ERROR: &str = "api_error";
pub const API_CALL: &str = "api_call";
pub const INVOICE_HISTORY: &str = "invoice_history";
pub const INVOICE_ERROR: &str = "invoice_error";

/// One line of the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub timestamp: String,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchanger_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(event_type: &str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            event_type: event_type.to_string(),
            invoice_id: None,
            exchanger_id: None,
            provider: None,
            status: None,
            actor: None,
            user_id: None,
            duration_ms: None,
            invoice_created_at: None,
            endpoint: None,
            status_code: None,
            request_body: None,
            response_body: None,
            details: None,
            error: None,
        }
    }

    pub fn with_invoice(mut self, invoice_id: u64) -> Self {
        self.invoice_id = Some(invoice_id);
        self
    }

    pub fn with_exchanger(mut self, exchanger_id: u32) -> Self {
        self.exchanger_id = Some(exchanger_id);
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_call(
        mut self,
        endpoint: &str,
        status_code: u16,
        request_body: &str,
        response_body: &str,
    ) -> Self {
        self.endpoint = Some(endpoint.to_string());
        self.status_code = Some(status_code);
        self.request_body = Some(request_body.to_string());
        self.response_body = Some(response_body.to_string());
        self
    }

    fn outcome(
        invoice_id: u64,
        status: Status,
        provider: &str,
        duration_ms: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        let mut event = Self::new(OUTCOME).with_invoice(invoice_id).with_status(status);
        event.provider = Some(provider.to_string());
        event.duration_ms = Some(duration_ms);
        event.invoice_created_at = Some(created_at);
        event
    }

    fn history(
        invoice_id: u64,
        actor: &str,
        status: Status,
        user_id: Option<u64>,
        details: Option<&str>,
    ) -> Self {
        let mut event = Self::new(INVOICE_HISTORY)
            .with_invoice(invoice_id)
            .with_status(status);
        event.actor = Some(actor.to_string());
        event.user_id = user_id;
        event.details = details.map(str::to_string);
        event
    }
}

/// Appends events as JSON lines to a file. One handle is kept open and
/// writes are serialized through it.
pub struct JsonlAuditSink {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<File>>,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_event(&self, event: &AuditEvent) -> Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut slot = self.file.lock().await;
        let mut file = match slot.take() {
            Some(file) => file,
            None => {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .await?
            }
        };
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        // a handle that failed is dropped above and reopened on the next event
        *slot = Some(file);
        tracing::debug!(event_type = %event.event_type, invoice_id = ?event.invoice_id, "audit event written");
        Ok(())
    }

    async fn emit(&self, event: AuditEvent) {
        if let Err(e) = self.write_event(&event).await {
            tracing::warn!(event_type = %event.event_type, error = %e, "could not write audit event");
        }
    }
}

/// Keeps events in memory, for tests and dry runs.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn of_type(&self, event_type: &str) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    async fn emit(&self, event: AuditEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

macro_rules! impl_audit_sink {
    ($sink:ty) => {
        #[async_trait]
        impl AuditSink for $sink {
            async fn record_outcome(
                &self,
                invoice_id: u64,
                status: Status,
                provider: &str,
                duration_ms: u64,
                created_at: DateTime<Utc>,
            ) {
                self.emit(AuditEvent::outcome(
                    invoice_id,
                    status,
                    provider,
                    duration_ms,
                    created_at,
                ))
                .await;
            }

            async fn record_api_error(&self, invoice_id: u64, exchanger_id: u32, message: &str) {
                self.emit(
                    AuditEvent::new(API_ERROR)
                        .with_invoice(invoice_id)
                        .with_exchanger(exchanger_id)
                        .with_error(message),
                )
                .await;
            }

            async fn record_api_call(
                &self,
                endpoint: &str,
                status_code: u16,
                request_body: &str,
                response_body: &str,
                invoice_id: Option<u64>,
                exchanger_id: u32,
            ) {
                let mut event = AuditEvent::new(API_CALL)
                    .with_exchanger(exchanger_id)
                    .with_call(endpoint, status_code, request_body, response_body);
                event.invoice_id = invoice_id;
                self.emit(event).await;
            }

            async fn record_invoice_history(
                &self,
                invoice_id: u64,
                actor: &str,
                status: Status,
                user_id: Option<u64>,
                details: Option<&str>,
            ) {
                self.emit(AuditEvent::history(
                    invoice_id, actor, status, user_id, details,
                ))
                .await;
            }

            async fn record_invoice_error(&self, invoice_id: u64, message: &str) {
                self.emit(
                    AuditEvent::new(INVOICE_ERROR)
                        .with_invoice(invoice_id)
                        .with_error(message),
                )
                .await;
            }
        }
    };
}

impl_audit_sink!(JsonlAuditSink);
impl_audit_sink!(MemoryAuditSink);

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn jsonl_sink_appends_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlAuditSink::new(dir.path().join("audit.jsonl"));

        sink.record_api_error(7, 1, "HTTP 502").await;
        sink.record_invoice_history(7, "payrouter", Status::Pending, None, Some("exchanger=2"))
            .await;

        let text = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<AuditEvent> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].event_type, API_ERROR);
        assert_eq!(lines[0].error.as_deref(), Some("HTTP 502"));
        assert_eq!(lines[1].status, Some(Status::Pending));
        assert_eq!(lines[1].actor.as_deref(), Some("payrouter"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_produce_whole_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = std::sync::Arc::new(JsonlAuditSink::new(dir.path().join("audit.jsonl")));

        let mut writers = tokio::task::JoinSet::new();
        for invoice_id in 1..=64u64 {
            let sink = sink.clone();
            writers.spawn(async move {
                sink.record_invoice_error(invoice_id, &"x".repeat(512)).await;
            });
        }
        while let Some(joined) = writers.join_next().await {
            joined.unwrap();
        }

        let text = std::fs::read_to_string(sink.path()).unwrap();
        let mut ids: Vec<u64> = text
            .lines()
            .map(|l| serde_json::from_str::<AuditEvent>(l).unwrap().invoice_id.unwrap())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..=64).collect::<Vec<_>>());
    }

    #[test]
    fn unset_fields_are_not_serialized() {
        let line = serde_json::to_string(&AuditEvent::new(INVOICE_ERROR).with_invoice(3)).unwrap();
        assert!(line.contains(r#""invoice_id":3"#));
        assert!(!line.contains("endpoint"));
    }

    #[tokio::test]
    async fn unwritable_path_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        // a directory cannot be opened for appending
        let sink = JsonlAuditSink::new(dir.path());
        sink.record_invoice_error(1, "boom").await;
    }

    #[tokio::test]
    async fn memory_sink_filters_by_type() {
        let sink = MemoryAuditSink::new();
        sink.record_api_call("https://p.example", 200, "{}", "{}", None, 4)
            .await;
        sink.record_outcome(1, Status::Pending, "Test", 12, Utc::now())
            .await;
        assert_eq!(sink.of_type(API_CALL).len(), 1);
        assert_eq!(sink.of_type(API_CALL)[0].invoice_id, None);
        assert_eq!(sink.of_type(OUTCOME)[0].provider.as_deref(), Some("Test"));
    }
}
