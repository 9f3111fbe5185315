use crate::transition;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use payrouter_core::{
    DetailsRequisites, ExchangerConfig, InvoiceCheck, InvoiceCheckLite, InvoiceRecord,
    InvoiceStore, Status, StoreError,
};
use sled::Db;
use std::path::Path;

/// Embedded durable store. Invoices live in the `invoices` tree keyed by id,
/// provider credentials per service in `service_exchangers`.
#[derive(Clone)]
pub struct SledInvoiceStore {
    db: Db,
}

fn backend(err: sled::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn exchanger_key(service_id: u64, exchanger_id: u32) -> String {
    format!("{service_id}:{exchanger_id}")
}

impl SledInvoiceStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(backend)?;
        Ok(Self { db })
    }

    fn invoices_tree(&self) -> Result<sled::Tree, StoreError> {
        self.db.open_tree("invoices").map_err(backend)
    }

    fn exchangers_tree(&self) -> Result<sled::Tree, StoreError> {
        self.db.open_tree("service_exchangers").map_err(backend)
    }

    pub fn insert_invoice(&self, rec: &InvoiceRecord) -> Result<(), StoreError> {
        let invoices = self.invoices_tree()?;
        invoices
            .insert(rec.id.to_be_bytes(), serde_json::to_vec(rec)?)
            .map_err(backend)?;
        Ok(())
    }

    pub fn get_invoice(&self, id: u64) -> Result<Option<InvoiceRecord>, StoreError> {
        let invoices = self.invoices_tree()?;
        match invoices.get(id.to_be_bytes()).map_err(backend)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn register_exchanger(
        &self,
        service_id: u64,
        exchanger: &ExchangerConfig,
    ) -> Result<(), StoreError> {
        let exchangers = self.exchangers_tree()?;
        exchangers
            .insert(
                exchanger_key(service_id, exchanger.id).as_bytes(),
                serde_json::to_vec(exchanger)?,
            )
            .map_err(backend)?;
        Ok(())
    }

    fn exchanger_for(
        &self,
        service_id: u64,
        exchanger_id: u32,
    ) -> Result<Option<ExchangerConfig>, StoreError> {
        let exchangers = self.exchangers_tree()?;
        match exchangers
            .get(exchanger_key(service_id, exchanger_id).as_bytes())
            .map_err(backend)?
        {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn list(&self) -> Result<Vec<InvoiceRecord>, StoreError> {
        let invoices = self.invoices_tree()?;
        let mut out = Vec::new();
        for item in invoices.iter() {
            let (_k, v) = item.map_err(backend)?;
            let rec: InvoiceRecord = serde_json::from_slice(&v)?;
            out.push(rec);
        }
        Ok(out)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(backend)?;
        Ok(())
    }
}

/// Read-modify-write of one row as a single compare-and-swap. When another
/// writer changed the row in between, `f` runs again on the fresh value.
fn update_record<F>(invoices: &sled::Tree, id: u64, mut f: F) -> Result<(), StoreError>
where
    F: FnMut(&mut InvoiceRecord) -> Result<(), StoreError>,
{
    let key = id.to_be_bytes();
    loop {
        let current = invoices
            .get(key)
            .map_err(backend)?
            .ok_or(StoreError::NotFound(id))?;
        let mut rec: InvoiceRecord = serde_json::from_slice(&current)?;
        f(&mut rec)?;
        let next = serde_json::to_vec(&rec)?;
        match invoices
            .compare_and_swap(key, Some(&current), Some(next))
            .map_err(backend)?
        {
            Ok(()) => return Ok(()),
            Err(_) => tracing::debug!(invoice_id = id, "row changed concurrently, retrying"),
        }
    }
}

#[async_trait]
impl InvoiceStore for SledInvoiceStore {
    async fn update_invoice(
        &self,
        invoice_id: u64,
        exchanger_id: u32,
        details: &DetailsRequisites,
    ) -> Result<(), StoreError> {
        let invoices = self.invoices_tree()?;
        update_record(&invoices, invoice_id, |rec| {
            if rec.status.is_terminal() {
                return Err(StoreError::Terminal {
                    id: rec.id,
                    status: rec.status,
                });
            }
            rec.apply_requisites(exchanger_id, details)?;
            Ok(())
        })?;
        tracing::info!(invoice_id, exchanger_id, "invoice requisites stored");
        Ok(())
    }

    async fn update_invoice_status(
        &self,
        invoice: &InvoiceCheckLite,
        status: Status,
    ) -> Result<(), StoreError> {
        let invoices = self.invoices_tree()?;
        update_record(&invoices, invoice.id, |rec| {
            if rec.external_id.as_deref() != Some(invoice.external_id.as_str()) {
                return Err(StoreError::NotFound(invoice.id));
            }
            transition(rec, status)
        })
    }

    async fn update_invoices_status_bulk(
        &self,
        ids: &[u64],
        status: Status,
    ) -> Result<(), StoreError> {
        let invoices = self.invoices_tree()?;
        let mut first_err = None;
        for id in ids {
            if let Err(e) = update_record(&invoices, *id, |rec| transition(rec, status)) {
                tracing::warn!(invoice_id = *id, error = %e, "bulk status update skipped invoice");
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
        Ok(self
            .list()?
            .into_iter()
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
        let mut out = Vec::new();
        for rec in self.list()? {
            if !rec.is_due_for_check(now) {
                continue;
            }
            let (Some(exchanger_id), Some(external_id)) = (rec.exchanger_id, rec.external_id)
            else {
                continue;
            };
            match self.exchanger_for(rec.service_id, exchanger_id)? {
                Some(exchanger) => out.push(InvoiceCheck {
                    id: rec.id,
                    external_id,
                    service_id: rec.service_id,
                    exchanger,
                }),
                None => tracing::warn!(
                    invoice_id = rec.id,
                    service_id = rec.service_id,
                    exchanger_id,
                    "no exchanger configured for pending invoice"
                ),
            }
        }
        out.sort_by_key(|c| (c.exchanger.id, c.id));
        Ok(out)
    }

    async fn set_invoice_status(&self, invoice_id: u64, status: Status) -> Result<(), StoreError> {
        let invoices = self.invoices_tree()?;
        update_record(&invoices, invoice_id, |rec| transition(rec, status))
    }
}
