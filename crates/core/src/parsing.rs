use crate::models::InvoiceTask;
use anyhow::Result;
use sha2::{Digest, Sha256};

/// Hex SHA-256 of a raw message body, used to reference bodies we could not parse.
pub fn task_fingerprint(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let bytes = hasher.finalize();
    hex::encode(bytes)
}

pub fn parse_invoice_task(body: &[u8]) -> Result<InvoiceTask, serde_json::Error> {
    serde_json::from_slice(body)
}

/// Reads only the invoice id from a body that may not satisfy the full schema.
pub fn peek_invoice_id(body: &[u8]) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("invoice")?.get("id")?.as_u64()
}

pub fn encode_invoice_task(task: &InvoiceTask) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(task)?)
}
