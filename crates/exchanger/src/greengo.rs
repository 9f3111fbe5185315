use crate::http::{decode, decode_object, join_url, send, CallRecord};
use crate::status::apply_status;
use crate::{AdapterContext, ProviderAdapter, ProviderError, StatusTable};
use async_trait::async_trait;
use payrouter_core::{DetailsRequisites, ExchangerConfig, InvoiceCheckLite, InvoiceTask, Status};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const NAME: &str = "Greengo";

/// Payout wallet sent with every order; the provider ignores it for card payments.
const WALLET_PLACEHOLDER: &str = "xxxxxxxxxxx";

pub const STATUS_TABLE: StatusTable = &[
    ("payed", Some(Status::PendingConfirm)),
    ("completed", Some(Status::Paid)),
    ("unconfirmed", None),
    ("awaiting", None),
    ("autocanceled", Some(Status::CancelTime)),
];

#[derive(Clone)]
pub struct GreengoAdapter {
    config: ExchangerConfig,
    ctx: AdapterContext,
}

#[derive(Debug, Serialize)]
struct CreateOrder<'a> {
    payment_method: &'a str,
    wallet: &'a str,
    #[serde(with = "rust_decimal::serde::float")]
    from_amount: Decimal,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    response: String,
    #[serde(default)]
    items: Vec<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct OrderItem {
    order_id: Value,
    wallet_payment: String,
    amount_payable: Decimal,
}

#[derive(Debug, Serialize)]
struct CheckRequest {
    order_id: Vec<u64>,
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    data: CheckData,
}

#[derive(Debug, Deserialize)]
struct CheckData {
    #[serde(default)]
    orders: Vec<OrderState>,
}

#[derive(Debug, Deserialize)]
struct OrderState {
    order_id: Value,
    order_status: String,
}

/// Order ids arrive as strings on creation and as numbers on status checks.
fn order_id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => n.as_u64().map(|n| n.to_string()),
        _ => None,
    }
}

impl GreengoAdapter {
    pub fn new(config: ExchangerConfig, ctx: AdapterContext) -> Self {
        Self { config, ctx }
    }

    fn post(&self, url: &str, api_key: &str, body: String) -> reqwest::RequestBuilder {
        self.ctx
            .http
            .post(url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header("Api-Secret", api_key)
            .body(body)
    }

    fn format_details(&self, body: &str) -> Result<DetailsRequisites, ProviderError> {
        let resp: CreateResponse = decode(body)?;
        if resp.response != "success" {
            return Err(ProviderError::Rejected {
                message: resp.response,
                body: body.to_string(),
            });
        }
        let order = resp
            .items
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::malformed("empty `items`", body))?;
        let item: OrderItem = decode_object(&order, body)?;
        let external_id = order_id_text(&item.order_id)
            .ok_or_else(|| ProviderError::malformed("`order_id` is not an id", body))?;

        Ok(DetailsRequisites {
            external_id,
            amount_in: item.amount_payable,
            requisites: item.wallet_payment,
            valid_until: self.ctx.default_valid_until(),
            raw_details: order,
        })
    }

    async fn apply_orders(&self, orders: Vec<OrderState>, service_id: u64) {
        for order in orders {
            let Some(external_id) = order_id_text(&order.order_id) else {
                tracing::warn!(order = ?order.order_id, "order without a usable id");
                continue;
            };
            let invoice = match self.ctx.ledger.find_by_external_id(&external_id, service_id).await {
                Ok(Some(invoice)) => invoice,
                Ok(None) => {
                    tracing::warn!(%external_id, service_id, "no invoice for provider order");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(%external_id, error = %e, "invoice lookup failed");
                    continue;
                }
            };
            if let Err(e) = apply_status(&self.ctx, STATUS_TABLE, &invoice, &order.order_status).await {
                tracing::warn!(invoice_id = invoice.id, %external_id, error = %e, "could not apply order status");
            }
        }
    }
}

#[async_trait]
impl ProviderAdapter for GreengoAdapter {
    async fn get_requisites(
        &self,
        task: &InvoiceTask,
        config: &ExchangerConfig,
    ) -> Result<DetailsRequisites, ProviderError> {
        let body = serde_json::to_string(&CreateOrder {
            payment_method: "card",
            wallet: WALLET_PLACEHOLDER,
            from_amount: config.amount,
        })
        .map_err(|e| ProviderError::malformed(e.to_string(), ""))?;
        let url = join_url(&config.endpoint, "/api/v2/order/create");
        let req = self.post(&url, &config.api_key, body.clone());

        let resp = send(
            &self.ctx,
            req,
            CallRecord {
                endpoint: url,
                request_body: body,
                invoice_id: Some(task.invoice.id),
                exchanger_id: config.id,
            },
        )
        .await?;

        self.format_details(&resp)
    }

    async fn check_invoices(
        &self,
        invoices: &[InvoiceCheckLite],
        service_id: u64,
    ) -> Result<(), ProviderError> {
        let order_id: Vec<u64> = invoices
            .iter()
            .filter_map(|inv| inv.external_id.parse().ok())
            .collect();
        let body = serde_json::to_string(&CheckRequest { order_id })
            .map_err(|e| ProviderError::malformed(e.to_string(), ""))?;
        let url = join_url(&self.config.endpoint, "/api/v2/order/check/");
        let req = self.post(&url, &self.config.api_key, body.clone());

        let resp = send(
            &self.ctx,
            req,
            CallRecord {
                endpoint: url,
                request_body: body,
                invoice_id: None,
                exchanger_id: self.config.id,
            },
        )
        .await?;

        let parsed: CheckResponse = decode(&resp)?;
        if parsed.data.orders.is_empty() {
            return Err(ProviderError::malformed("no orders in check response", &resp));
        }
        self.apply_orders(parsed.data.orders, service_id).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::context;
    use payrouter_core::InvoiceRecord;
    use store::MemoryInvoiceStore;

    fn config() -> ExchangerConfig {
        ExchangerConfig {
            id: 4,
            name: NAME.into(),
            endpoint: "https://greengo.example".into(),
            amount: Decimal::new(500, 0),
            api_key: "key".into(),
            secret_key: String::new(),
            callback: String::new(),
        }
    }

    #[test]
    fn create_response_uses_first_item() {
        let (ctx, _) = context(MemoryInvoiceStore::new());
        let adapter = GreengoAdapter::new(config(), ctx);
        let body = r#"{"response":"success","items":[{"order_id":"9001","wallet_payment":"4276 0000 0000 0001","amount_payable":"512.30","extra":1}]}"#;
        let details = adapter.format_details(body).unwrap();
        assert_eq!(details.external_id, "9001");
        assert_eq!(details.requisites, "4276 0000 0000 0001");
        assert_eq!(details.amount_in, Decimal::new(51230, 2));
        assert_eq!(details.raw_details.get("extra"), Some(&Value::from(1)));
    }

    #[test]
    fn non_success_and_empty_items_are_errors() {
        let (ctx, _) = context(MemoryInvoiceStore::new());
        let adapter = GreengoAdapter::new(config(), ctx);
        let err = adapter
            .format_details(r#"{"response":"insufficient funds"}"#)
            .unwrap_err();
        assert!(matches!(err, ProviderError::Rejected { ref message, .. } if message == "insufficient funds"));

        let err = adapter
            .format_details(r#"{"response":"success","items":[]}"#)
            .unwrap_err();
        assert!(matches!(err, ProviderError::Malformed { .. }));
    }

    #[test]
    fn order_ids_accept_both_shapes() {
        assert_eq!(order_id_text(&Value::from("77")), Some("77".into()));
        assert_eq!(order_id_text(&Value::from(77u64)), Some("77".into()));
        assert_eq!(order_id_text(&Value::from(-1)), None);
        assert_eq!(order_id_text(&Value::Null), None);
    }

    #[tokio::test]
    async fn orders_are_resolved_by_external_id() {
        let store = MemoryInvoiceStore::new();
        for (id, ext) in [(1u64, "100"), (2, "200"), (3, "300")] {
            let mut rec = InvoiceRecord::new(id, 7);
            rec.exchanger_id = Some(4);
            rec.external_id = Some(ext.into());
            store.insert_invoice(rec).await;
        }
        let (ctx, audit) = context(store.clone());
        let adapter = GreengoAdapter::new(config(), ctx);

        let orders: CheckData = serde_json::from_str(
            r#"{"orders":[
                {"order_id":100,"order_status":"completed"},
                {"order_id":200,"order_status":"awaiting"},
                {"order_id":300,"order_status":"autocanceled"},
                {"order_id":999,"order_status":"completed"},
                {"order_id":100,"order_status":"refunded"}
            ]}"#,
        )
        .unwrap();
        adapter.apply_orders(orders.orders, 7).await;

        assert_eq!(store.get_invoice(1).await.unwrap().status, Status::Paid);
        assert_eq!(store.get_invoice(2).await.unwrap().status, Status::Pending);
        assert_eq!(store.get_invoice(3).await.unwrap().status, Status::CancelTime);
        assert_eq!(
            *audit.history.lock().unwrap(),
            vec![(1, Status::Paid), (3, Status::CancelTime)]
        );
    }
}
