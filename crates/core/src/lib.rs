//! Data model, validation and persistence/audit ports shared by the
//! dispatch engine and the provider adapters.

pub mod ledger;
pub mod models;
pub mod parsing;
pub mod ports;
pub mod validation;

pub use ledger::InvoiceLedger;
pub use models::*;
pub use ports::{AuditSink, InvoiceStore, StoreError};
