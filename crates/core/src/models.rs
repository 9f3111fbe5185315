use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Internal invoice status. `paid` and every `cancel_*` variant are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Paid,
    Error,
    CancelTime,
    CancelSearch,
    CancelInvalid,
    CancelOperator,
    PendingConfirm,
}

impl Status {
    pub const ALL: [Status; 8] = [
        Status::Pending,
        Status::Paid,
        Status::Error,
        Status::CancelTime,
        Status::CancelSearch,
        Status::CancelInvalid,
        Status::CancelOperator,
        Status::PendingConfirm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Paid => "paid",
            Status::Error => "error",
            Status::CancelTime => "cancel_time",
            Status::CancelSearch => "cancel_search",
            Status::CancelInvalid => "cancel_invalid",
            Status::CancelOperator => "cancel_operator",
            Status::PendingConfirm => "pending_confirm",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Paid
                | Status::CancelTime
                | Status::CancelSearch
                | Status::CancelInvalid
                | Status::CancelOperator
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One queue message: the invoice to route and the providers to try, in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceTask {
    pub invoice: Invoice,
    #[serde(default)]
    pub exchangers: Vec<ExchangerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: u64,
    pub created_at: DateTime<Utc>,
}

/// Credentials and parameters for a single provider attempt.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ExchangerConfig {
    pub id: u32,
    pub name: String,
    pub endpoint: String,
    pub amount: Decimal,
    pub api_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub callback: String,
}

impl fmt::Debug for ExchangerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangerConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("amount", &self.amount)
            .field("api_key", &"****")
            .field("secret_key", &"****")
            .field("callback", &self.callback)
            .finish()
    }
}

/// Normalized result of a successful requisites request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetailsRequisites {
    pub external_id: String,
    pub amount_in: Decimal,
    pub requisites: String,
    pub valid_until: DateTime<Utc>,
    #[serde(default)]
    pub raw_details: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvoiceCheckLite {
    pub id: u64,
    pub external_id: String,
}

/// A pending invoice together with the provider configuration it was routed to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceCheck {
    pub id: u64,
    pub external_id: String,
    pub service_id: u64,
    pub exchanger: ExchangerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey {
    pub service_id: u64,
    pub exchanger_id: u32,
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service_id, self.exchanger_id)
    }
}

/// Invoices of one service routed to one provider instance.
#[derive(Debug, Clone)]
pub struct ExchangerGroup {
    pub service_id: u64,
    pub exchanger: ExchangerConfig,
    pub invoices: Vec<InvoiceCheckLite>,
}

impl ExchangerGroup {
    pub fn key(&self) -> GroupKey {
        GroupKey {
            service_id: self.service_id,
            exchanger_id: self.exchanger.id,
        }
    }

    pub fn invoice_ids(&self) -> Vec<u64> {
        self.invoices.iter().map(|i| i.id).collect()
    }
}

/// Persisted invoice row as kept by the bundled stores.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvoiceRecord {
    pub id: u64,
    pub service_id: u64,
    pub status: Status,
    pub exchanger_id: Option<u32>,
    pub external_id: Option<String>,
    pub requisites: Option<String>,
    pub amount_in: Option<Decimal>,
    pub expiry_at: Option<DateTime<Utc>>,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InvoiceRecord {
    pub fn new(id: u64, service_id: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            service_id,
            status: Status::Pending,
            exchanger_id: None,
            external_id: None,
            requisites: None,
            amount_in: None,
            expiry_at: None,
            details: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Copies the normalized requisites onto the row and marks it `pending`.
    pub fn apply_requisites(
        &mut self,
        exchanger_id: u32,
        details: &DetailsRequisites,
    ) -> serde_json::Result<()> {
        self.details = Some(serde_json::to_string(&details.raw_details)?);
        self.external_id = Some(details.external_id.clone());
        self.requisites = Some(details.requisites.clone());
        self.amount_in = Some(details.amount_in);
        self.expiry_at = Some(details.valid_until);
        self.exchanger_id = Some(exchanger_id);
        self.status = Status::Pending;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_due_for_check(&self, now: DateTime<Utc>) -> bool {
        self.status == Status::Pending
            && self.external_id.is_some()
            && self.expiry_at.map(|at| at <= now).unwrap_or(false)
    }
}
