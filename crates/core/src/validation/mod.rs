mod rules;

use crate::models::InvoiceTask;
use std::fmt;

pub use rules::ValidationError;

/// Every rule violation found in a task, in the order the rules ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        f.write_str(&parts.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

pub fn validate(task: &InvoiceTask) -> Result<(), ValidationErrors> {
    let mut errs = Vec::new();
    if let Err(e) = rules::check_invoice(&task.invoice) {
        errs.push(e);
    }
    if let Err(mut re) = rules::check_exchangers(&task.exchangers) {
        errs.append(&mut re);
    }
    if errs.is_empty() {
        Ok(())
    } else {
        Err(ValidationErrors(errs))
    }
}
