use crate::models::{DetailsRequisites, InvoiceCheck, InvoiceCheckLite, Status};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invoice {0} not found")]
    NotFound(u64),
    #[error("invoice {id} is already {status} and cannot change")]
    Terminal { id: u64, status: Status },
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Persistence of invoices, owned by the surrounding system.
///
/// Every call is an independent write or read; implementations must be safe
/// to share between concurrent workers.
#[async_trait]
pub trait InvoiceStore: Send + Sync {
    /// Stores requisites from a successful dispatch and marks the invoice `pending`.
    async fn update_invoice(
        &self,
        invoice_id: u64,
        exchanger_id: u32,
        details: &DetailsRequisites,
    ) -> Result<(), StoreError>;

    /// Updates the row matching both id and external id.
    async fn update_invoice_status(
        &self,
        invoice: &InvoiceCheckLite,
        status: Status,
    ) -> Result<(), StoreError>;

    async fn update_invoices_status_bulk(
        &self,
        ids: &[u64],
        status: Status,
    ) -> Result<(), StoreError>;

    async fn get_invoice_by_external_id(
        &self,
        external_id: &str,
        service_id: u64,
    ) -> Result<Option<InvoiceCheckLite>, StoreError>;

    /// Invoices still `pending` whose requisites expired at or before `now`,
    /// joined with the provider configuration of their service.
    async fn get_pending_invoices_past_expiry(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<InvoiceCheck>, StoreError>;

    /// Unconditional status write by invoice id.
    async fn set_invoice_status(&self, invoice_id: u64, status: Status) -> Result<(), StoreError>;
}

/// Analytics and audit trail. Failures stay inside the sink.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_outcome(
        &self,
        invoice_id: u64,
        status: Status,
        provider: &str,
        duration_ms: u64,
        created_at: DateTime<Utc>,
    );

    async fn record_api_error(&self, invoice_id: u64, exchanger_id: u32, message: &str);

    async fn record_api_call(
        &self,
        endpoint: &str,
        status_code: u16,
        request_body: &str,
        response_body: &str,
        invoice_id: Option<u64>,
        exchanger_id: u32,
    );

    async fn record_invoice_history(
        &self,
        invoice_id: u64,
        actor: &str,
        status: Status,
        user_id: Option<u64>,
        details: Option<&str>,
    );

    /// Errors that concern an invoice as a whole (bad task, storage failure).
    async fn record_invoice_error(&self, invoice_id: u64, message: &str);
}
