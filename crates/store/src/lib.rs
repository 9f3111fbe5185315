//! Bundled `InvoiceStore` implementations.

mod memory;
mod sled_store;

pub use memory::MemoryInvoiceStore;
pub use sled_store::SledInvoiceStore;

use payrouter_core::{InvoiceRecord, Status, StoreError};

/// Applies a status change unless the row already reached a terminal state.
pub(crate) fn transition(rec: &mut InvoiceRecord, status: Status) -> Result<(), StoreError> {
    if rec.status.is_terminal() && rec.status != status {
        return Err(StoreError::Terminal {
            id: rec.id,
            status: rec.status,
        });
    }
    rec.status = status;
    rec.updated_at = chrono::Utc::now();
    Ok(())
}
