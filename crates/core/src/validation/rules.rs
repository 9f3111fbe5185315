use crate::models::{ExchangerConfig, Invoice};
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invoice id must be greater than zero")]
    InvoiceId,
    #[error("task carries no exchangers")]
    NoExchangers,
    #[error("exchanger id must be greater than zero")]
    ExchangerId,
    #[error("exchanger {exchanger_id}: name is empty")]
    Name { exchanger_id: u32 },
    #[error("exchanger {exchanger_id}: amount must be positive")]
    Amount { exchanger_id: u32 },
    #[error("exchanger {exchanger_id}: API key is empty")]
    ApiKey { exchanger_id: u32 },
    #[error("exchanger {exchanger_id}: endpoint is not an absolute URL")]
    Endpoint { exchanger_id: u32 },
}

pub fn check_invoice(invoice: &Invoice) -> Result<(), ValidationError> {
    if invoice.id == 0 {
        return Err(ValidationError::InvoiceId);
    }
    Ok(())
}

pub fn check_exchangers(exchangers: &[ExchangerConfig]) -> Result<(), Vec<ValidationError>> {
    if exchangers.is_empty() {
        return Err(vec![ValidationError::NoExchangers]);
    }

    let mut errs = Vec::new();
    for ex in exchangers {
        if let Err(mut re) = check_exchanger(ex) {
            errs.append(&mut re);
        }
    }

    if errs.is_empty() {
        Ok(())
    } else {
        Err(errs)
    }
}

fn check_exchanger(ex: &ExchangerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errs = Vec::new();
    let exchanger_id = ex.id;

    if ex.id == 0 {
        errs.push(ValidationError::ExchangerId);
    }

    if ex.name.trim().is_empty() {
        errs.push(ValidationError::Name { exchanger_id });
    }

    if ex.amount.is_sign_negative() || ex.amount.is_zero() {
        errs.push(ValidationError::Amount { exchanger_id });
    }

    if ex.api_key.is_empty() {
        errs.push(ValidationError::ApiKey { exchanger_id });
    }

    match Url::parse(&ex.endpoint) {
        Ok(url) if !url.cannot_be_a_base() => {}
        _ => errs.push(ValidationError::Endpoint { exchanger_id }),
    }

    if errs.is_empty() {
        Ok(())
    } else {
        Err(errs)
    }
}
