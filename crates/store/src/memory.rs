use crate::transition;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use payrouter_core::{
    DetailsRequisites, ExchangerConfig, InvoiceCheck, InvoiceCheckLite, InvoiceRecord,
    InvoiceStore, Status, StoreError,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Thread-safe in-memory store, for tests and dry runs.
#[derive(Default, Clone)]
pub struct MemoryInvoiceStore {
    invoices: Arc<RwLock<HashMap<u64, InvoiceRecord>>>,
    exchangers: Arc<RwLock<HashMap<(u64, u32), ExchangerConfig>>>,
}

impl MemoryInvoiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_invoice(&self, rec: InvoiceRecord) {
        self.invoices.write().await.insert(rec.id, rec);
    }

    pub async fn get_invoice(&self, id: u64) -> Option<InvoiceRecord> {
        self.invoices.read().await.get(&id).cloned()
    }

    pub async fn register_exchanger(&self, service_id: u64, exchanger: ExchangerConfig) {
        self.exchangers
            .write()
            .await
            .insert((service_id, exchanger.id), exchanger);
    }
}

#[async_trait]
impl InvoiceStore for MemoryInvoiceStore {
    async fn update_invoice(
        &self,
        invoice_id: u64,
        exchanger_id: u32,
        details: &DetailsRequisites,
    ) -> Result<(), StoreError> {
        let mut invoices = self.invoices.write().await;
        let rec = invoices
            .get_mut(&invoice_id)
            .ok_or(StoreError::NotFound(invoice_id))?;
        if rec.status.is_terminal() {
            return Err(StoreError::Terminal {
                id: rec.id,
                status: rec.status,
            });
        }
        rec.apply_requisites(exchanger_id, details)?;
        Ok(())
    }

    async fn update_invoice_status(
        &self,
        invoice: &InvoiceCheckLite,
        status: Status,
    ) -> Result<(), StoreError> {
        let mut invoices = self.invoices.write().await;
        match invoices.get_mut(&invoice.id) {
            Some(rec) if rec.external_id.as_deref() == Some(invoice.external_id.as_str()) => {
                transition(rec, status)
            }
            _ => Err(StoreError::NotFound(invoice.id)),
        }
    }

    async fn update_invoices_status_bulk(
        &self,
        ids: &[u64],
        status: Status,
    ) -> Result<(), StoreError> {
        let mut invoices = self.invoices.write().await;
        let mut first_err = None;
        for id in ids {
            let res = match invoices.get_mut(id) {
                Some(rec) => transition(rec, status),
                None => Err(StoreError::NotFound(*id)),
            };
            if let Err(e) = res {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn get_invoice_by_external_id(
        &self,
        external_id: &str,
        service_id: u64,
    ) -> Result<Option<InvoiceCheckLite>, StoreError> {
        let invoices = self.invoices.read().await;
        Ok(invoices
            .values()
            .find(|rec| {
                rec.service_id == service_id && rec.external_id.as_deref() == Some(external_id)
            })
            .map(|rec| InvoiceCheckLite {
                id: rec.id,
                external_id: external_id.to_string(),
            }))
    }

    async fn get_pending_invoices_past_expiry(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<InvoiceCheck>, StoreError> {
        let invoices = self.invoices.read().await;
        let exchangers = self.exchangers.read().await;
        let mut out: Vec<InvoiceCheck> = invoices
            .values()
            .filter(|rec| rec.is_due_for_check(now))
            .filter_map(|rec| {
                let exchanger = exchangers.get(&(rec.service_id, rec.exchanger_id?))?;
                Some(InvoiceCheck {
                    id: rec.id,
                    external_id: rec.external_id.clone()?,
                    service_id: rec.service_id,
                    exchanger: exchanger.clone(),
                })
            })
            .collect();
        out.sort_by_key(|c| (c.exchanger.id, c.id));
        Ok(out)
    }

    async fn set_invoice_status(&self, invoice_id: u64, status: Status) -> Result<(), StoreError> {
        let mut invoices = self.invoices.write().await;
        let rec = invoices
            .get_mut(&invoice_id)
            .ok_or(StoreError::NotFound(invoice_id))?;
        transition(rec, status)
    }
}
