use crate::{AdapterContext, ProviderError};
use payrouter_core::{InvoiceCheckLite, Status};

/// Provider status vocabulary. `None` marks a status that needs no change yet.
pub type StatusTable = &'static [(&'static str, Option<Status>)];

pub fn map_status(table: StatusTable, raw: &str) -> Result<Option<Status>, ProviderError> {
    table
        .iter()
        .find(|(name, _)| *name == raw)
        .map(|(_, status)| *status)
        .ok_or_else(|| ProviderError::UnrecognizedStatus(raw.to_string()))
}

/// Maps `raw` through `table` and writes the result for one invoice.
pub(crate) async fn apply_status(
    ctx: &AdapterContext,
    table: StatusTable,
    invoice: &InvoiceCheckLite,
    raw: &str,
) -> Result<Option<Status>, ProviderError> {
    let Some(status) = map_status(table, raw)? else {
        tracing::debug!(invoice_id = invoice.id, provider_status = raw, "no status change");
        return Ok(None);
    };
    ctx.ledger.update_status(invoice, status).await?;
    Ok(Some(status))
}
