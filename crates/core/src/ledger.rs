use crate::models::{DetailsRequisites, InvoiceCheckLite, Status};
use crate::ports::{AuditSink, InvoiceStore, StoreError};
use std::sync::Arc;

/// Actor name written to the invoice history for transitions made here.
pub const ACTOR: &str = "payrouter";

/// Store and audit trail bundled so that every status transition leaves a
/// history record behind it.
#[derive(Clone)]
pub struct InvoiceLedger {
    store: Arc<dyn InvoiceStore>,
    audit: Arc<dyn AuditSink>,
}

impl InvoiceLedger {
    pub fn new(store: Arc<dyn InvoiceStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self { store, audit }
    }

    pub fn store(&self) -> &Arc<dyn InvoiceStore> {
        &self.store
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    pub async fn record_requisites(
        &self,
        invoice_id: u64,
        exchanger_id: u32,
        details: &DetailsRequisites,
    ) -> Result<(), StoreError> {
        self.store
            .update_invoice(invoice_id, exchanger_id, details)
            .await?;
        let note = format!(
            "exchanger={exchanger_id} external_id={}",
            details.external_id
        );
        self.audit
            .record_invoice_history(invoice_id, ACTOR, Status::Pending, None, Some(&note))
            .await;
        Ok(())
    }

    pub async fn update_status(
        &self,
        invoice: &InvoiceCheckLite,
        status: Status,
    ) -> Result<(), StoreError> {
        self.store.update_invoice_status(invoice, status).await?;
        tracing::info!(invoice_id = invoice.id, %status, "invoice status updated");
        self.audit
            .record_invoice_history(invoice.id, ACTOR, status, None, None)
            .await;
        Ok(())
    }

    /// Ad-hoc write used when a task is dropped before reaching a provider.
    pub async fn mark(
        &self,
        invoice_id: u64,
        status: Status,
        reason: &str,
    ) -> Result<(), StoreError> {
        self.store.set_invoice_status(invoice_id, status).await?;
        self.audit
            .record_invoice_history(invoice_id, ACTOR, status, None, Some(reason))
            .await;
        Ok(())
    }

    pub async fn update_bulk(&self, ids: &[u64], status: Status) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.store.update_invoices_status_bulk(ids, status).await?;
        for id in ids {
            self.audit
                .record_invoice_history(*id, ACTOR, status, None, Some("bulk update"))
                .await;
        }
        Ok(())
    }

    pub async fn find_by_external_id(
        &self,
        external_id: &str,
        service_id: u64,
    ) -> Result<Option<InvoiceCheckLite>, StoreError> {
        self.store
            .get_invoice_by_external_id(external_id, service_id)
            .await
    }
}
