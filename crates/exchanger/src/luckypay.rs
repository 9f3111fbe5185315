use crate::http::{decode, decode_object, join_url, send, CallRecord};
use crate::status::apply_status;
use crate::{parse_provider_time, AdapterContext, ProviderAdapter, ProviderError, StatusTable};
use async_trait::async_trait;
use payrouter_core::{DetailsRequisites, ExchangerConfig, InvoiceCheckLite, InvoiceTask, Status};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const NAME: &str = "LuckyPay";

pub const CARD_METHOD: &str = "8fe3669a-a448-4053-bc4b-43bb51cb3e9d";
pub const SBP_METHOD: &str = "2ec6dbd6-49a5-45d0-bd6d-b0134ee4639a";

pub const STATUS_TABLE: StatusTable = &[
    ("Completed", Some(Status::Paid)),
    ("CanceledByTimeout", Some(Status::CancelTime)),
    ("CanceledByService", Some(Status::CancelOperator)),
];

const CHECK_QUERY: &[(&str, &str)] = &[
    ("page", "1"),
    ("size", "100"),
    ("order_side", "buy"),
    ("order_status", "Completed,CanceledByTimeout,CanceledByService"),
];

#[derive(Clone)]
pub struct LuckyPayAdapter {
    config: ExchangerConfig,
    ctx: AdapterContext,
}

#[derive(Debug, Serialize)]
struct CreateOrder<'a> {
    client_order_id: String,
    order_side: &'a str,
    payment_method_id: &'a str,
    amount: String,
    customer_payment_account: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderCreated {
    id: String,
    holder_account: String,
    expires_at: String,
    amount: Decimal,
    #[serde(default)]
    method_name: Option<String>,
    #[serde(default)]
    holder_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderList {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    orders: Option<OrderPage>,
}

#[derive(Debug, Deserialize)]
struct OrderPage {
    items: Vec<OrderState>,
}

#[derive(Debug, Deserialize)]
struct OrderState {
    id: String,
    status: String,
}

impl LuckyPayAdapter {
    pub fn new(config: ExchangerConfig, ctx: AdapterContext) -> Self {
        Self { config, ctx }
    }

    async fn create_order(
        &self,
        task: &InvoiceTask,
        config: &ExchangerConfig,
        method: &str,
    ) -> Result<String, ProviderError> {
        let body = serde_json::to_string(&CreateOrder {
            client_order_id: task.invoice.id.to_string(),
            order_side: "Buy",
            payment_method_id: method,
            amount: config.amount.normalize().to_string(),
            customer_payment_account: None,
        })
        .map_err(|e| ProviderError::malformed(e.to_string(), ""))?;
        let url = join_url(&config.endpoint, "/api/v1/order/");
        let req = self
            .ctx
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header("X-API-Key", &config.api_key)
            .body(body.clone());

        send(
            &self.ctx,
            req,
            CallRecord {
                endpoint: url,
                request_body: body,
                invoice_id: Some(task.invoice.id),
                exchanger_id: config.id,
            },
        )
        .await
    }

    fn format_details(&self, body: &str) -> Result<DetailsRequisites, ProviderError> {
        let mut raw: Map<String, Value> = decode(body)?;
        let order: OrderCreated = decode_object(&raw, body)?;
        let valid_until = parse_provider_time(&order.expires_at).ok_or_else(|| {
            ProviderError::malformed(format!("unparseable `expires_at` {}", order.expires_at), body)
        })?;

        raw.insert(
            "important".into(),
            json!({
                "external_method_name": order.method_name,
                "external_holder_name": order.holder_name,
            }),
        );

        Ok(DetailsRequisites {
            external_id: order.id,
            amount_in: order.amount,
            requisites: order.holder_account,
            valid_until,
            raw_details: raw,
        })
    }

    async fn apply_orders(&self, orders: Vec<OrderState>, service_id: u64) {
        for order in orders {
            let invoice = match self.ctx.ledger.find_by_external_id(&order.id, service_id).await {
                Ok(Some(invoice)) => invoice,
                Ok(None) => {
                    tracing::debug!(external_id = %order.id, service_id, "order does not belong to a known invoice");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(external_id = %order.id, error = %e, "invoice lookup failed");
                    continue;
                }
            };
            if let Err(e) = apply_status(&self.ctx, STATUS_TABLE, &invoice, &order.status).await {
                tracing::warn!(invoice_id = invoice.id, error = %e, "could not apply order status");
            }
        }
    }
}

#[async_trait]
impl ProviderAdapter for LuckyPayAdapter {
    async fn get_requisites(
        &self,
        task: &InvoiceTask,
        config: &ExchangerConfig,
    ) -> Result<DetailsRequisites, ProviderError> {
        let body = match self.create_order(task, config, CARD_METHOD).await {
            Ok(body) => body,
            Err(e) => {
                tracing::info!(
                    invoice_id = task.invoice.id,
                    error = %e,
                    "card method failed, retrying with SBP"
                );
                self.create_order(task, config, SBP_METHOD).await?
            }
        };
        self.format_details(&body)
    }

    async fn check_invoices(
        &self,
        _invoices: &[InvoiceCheckLite],
        service_id: u64,
    ) -> Result<(), ProviderError> {
        let base = join_url(&self.config.endpoint, "/api/v1/order/");
        let url = url::Url::parse_with_params(&base, CHECK_QUERY)?;
        let req = self
            .ctx
            .http
            .get(url.clone())
            .header("Accept", "application/json")
            .header("X-API-Key", &self.config.api_key);

        let resp = send(
            &self.ctx,
            req,
            CallRecord {
                endpoint: url.to_string(),
                request_body: String::new(),
                invoice_id: None,
                exchanger_id: self.config.id,
            },
        )
        .await?;

        let list: OrderList = decode(&resp)?;
        if !list.success {
            return Err(ProviderError::Rejected {
                message: list.message.unwrap_or_default(),
                body: resp,
            });
        }
        let page = list
            .orders
            .ok_or_else(|| ProviderError::malformed("missing `orders`", &resp))?;
        self.apply_orders(page.items, service_id).await;
        Ok(())
    }
}
