//! Payment provider adapters.
//!
//! Each backend turns an [`InvoiceTask`] into [`DetailsRequisites`] through its
//! own HTTP API and maps its status vocabulary onto [`Status`] during
//! reconciliation. Adapters are resolved by provider name through the
//! [`AdapterRegistry`].

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use payrouter_core::{
    AuditSink, DetailsRequisites, ExchangerConfig, InvoiceCheckLite, InvoiceLedger, InvoiceTask,
    Status, StoreError,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod bitloga;
pub mod greengo;
mod http;
pub mod luckypay;
pub mod mock;
pub mod racs;
pub mod registry;
mod signing;
pub mod status;

pub use registry::{AdapterFactory, AdapterRegistry};
pub use status::{map_status, StatusTable};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("provider answered HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("provider rejected the request: {message}")]
    Rejected { message: String, body: String },
    #[error("malformed provider response: {reason}")]
    Malformed { reason: String, body: String },
    #[error("unrecognized provider status `{0}`")]
    UnrecognizedStatus(String),
    #[error("could not sign request: {0}")]
    Signing(String),
    #[error("invalid endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ProviderError {
    /// Raw provider response kept for the audit trail, when there was one.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            ProviderError::Status { body, .. }
            | ProviderError::Rejected { body, .. }
            | ProviderError::Malformed { body, .. } => Some(body),
            _ => None,
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>, body: &str) -> Self {
        ProviderError::Malformed {
            reason: reason.into(),
            body: body.to_string(),
        }
    }
}

/// Capabilities every payment backend offers.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Requests payment requisites for the task's invoice.
    async fn get_requisites(
        &self,
        task: &InvoiceTask,
        config: &ExchangerConfig,
    ) -> Result<DetailsRequisites, ProviderError>;

    /// Queries provider-side status for a batch of invoices and applies the
    /// mapped status of each resolved item. Per-item failures are logged and
    /// skipped; an error means the batch as a whole could not be checked.
    async fn check_invoices(
        &self,
        invoices: &[InvoiceCheckLite],
        service_id: u64,
    ) -> Result<(), ProviderError>;

    /// `false` for backends whose `check_invoices` cannot report provider-side
    /// status; their expired invoices are cancelled instead of checked.
    fn reconciles(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub request_timeout: Duration,
    /// Lifetime of requisites when the provider does not report an expiry.
    pub requisites_ttl: chrono::Duration,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(8),
            requisites_ttl: chrono::Duration::minutes(20),
        }
    }
}

/// Shared resources handed to every adapter instance.
#[derive(Clone)]
pub struct AdapterContext {
    pub http: reqwest::Client,
    pub ledger: InvoiceLedger,
    pub requisites_ttl: chrono::Duration,
}

impl AdapterContext {
    pub fn new(ledger: InvoiceLedger, settings: AdapterSettings) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()?;
        Ok(Self {
            http,
            ledger,
            requisites_ttl: settings.requisites_ttl,
        })
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        self.ledger.audit()
    }

    pub fn default_valid_until(&self) -> DateTime<Utc> {
        Utc::now() + self.requisites_ttl
    }
}

/// Parses provider timestamps: RFC 3339, or `YYYY-MM-DD HH:MM:SS` taken as UTC.
pub fn parse_provider_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use store::MemoryInvoiceStore;

    /// Collects history events; everything else is ignored.
    #[derive(Default)]
    pub struct HistoryAudit {
        pub history: Mutex<Vec<(u64, Status)>>,
    }

    #[async_trait]
    impl AuditSink for HistoryAudit {
        async fn record_outcome(&self, _: u64, _: Status, _: &str, _: u64, _: DateTime<Utc>) {}
        async fn record_api_error(&self, _: u64, _: u32, _: &str) {}
        async fn record_api_call(&self, _: &str, _: u16, _: &str, _: &str, _: Option<u64>, _: u32) {}
        async fn record_invoice_history(
            &self,
            invoice_id: u64,
            _: &str,
            status: Status,
            _: Option<u64>,
            _: Option<&str>,
        ) {
            self.history.lock().unwrap().push((invoice_id, status));
        }
        async fn record_invoice_error(&self, _: u64, _: &str) {}
    }

    pub fn context(store: MemoryInvoiceStore) -> (AdapterContext, Arc<HistoryAudit>) {
        let audit = Arc::new(HistoryAudit::default());
        let ledger = InvoiceLedger::new(Arc::new(store), audit.clone());
        let ctx = AdapterContext::new(ledger, AdapterSettings::default()).unwrap();
        (ctx, audit)
    }
}
