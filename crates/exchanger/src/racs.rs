use crate::bitloga::check_signed_orders;
use crate::http::{decode, decode_object, join_url, send, CallRecord};
use crate::{AdapterContext, ProviderAdapter, ProviderError, StatusTable};
use async_trait::async_trait;
use chrono::DateTime;
use payrouter_core::{DetailsRequisites, ExchangerConfig, InvoiceCheckLite, InvoiceTask, Status};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{Map, Value};
use url::Url;

pub const NAME: &str = "Racs";

/// Status checks go through the same signed order API as Bitloga.
pub const STATUS_TABLE: StatusTable = &[
    ("Payed", Some(Status::Paid)),
    ("Pending", None),
    ("Error", Some(Status::Error)),
    ("Canceled", Some(Status::CancelTime)),
];

const REDACTED: &str = "***";

#[derive(Clone)]
pub struct RacsAdapter {
    config: ExchangerConfig,
    ctx: AdapterContext,
}

#[derive(Debug, Deserialize)]
struct FiatResponse {
    msg_error: String,
    #[serde(default)]
    order: Vec<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct FiatOrder {
    id: String,
    cart: String,
    amount: Decimal,
    time_unix: i64,
}

fn fiat_url(endpoint: &str, amount: Decimal, private_key: &str) -> Result<Url, ProviderError> {
    let base = join_url(endpoint, "/fiat_api");
    let amount = amount.normalize().to_string();
    Ok(Url::parse_with_params(
        &base,
        [
            ("amount", amount.as_str()),
            ("typecommission", "1"),
            ("private_key", private_key),
            ("currency", "RUB"),
        ],
    )?)
}

impl RacsAdapter {
    pub fn new(config: ExchangerConfig, ctx: AdapterContext) -> Self {
        Self { config, ctx }
    }

    fn format_details(&self, body: &str) -> Result<DetailsRequisites, ProviderError> {
        let raw: Map<String, Value> = decode(body)?;
        let resp: FiatResponse = decode_object(&raw, body)?;
        if !resp.msg_error.is_empty() {
            return Err(ProviderError::Rejected {
                message: resp.msg_error,
                body: body.to_string(),
            });
        }
        let first = resp
            .order
            .first()
            .ok_or_else(|| ProviderError::malformed("empty `order`", body))?;
        let order: FiatOrder = decode_object(first, body)?;
        let valid_until = DateTime::from_timestamp(order.time_unix, 0)
            .ok_or_else(|| ProviderError::malformed("`time_unix` out of range", body))?;

        Ok(DetailsRequisites {
            external_id: order.id,
            amount_in: order.amount,
            requisites: order.cart,
            valid_until,
            raw_details: raw,
        })
    }
}

#[async_trait]
impl ProviderAdapter for RacsAdapter {
    async fn get_requisites(
        &self,
        task: &InvoiceTask,
        config: &ExchangerConfig,
    ) -> Result<DetailsRequisites, ProviderError> {
        let url = fiat_url(&config.endpoint, config.amount, &config.secret_key)?;
        let audited = fiat_url(&config.endpoint, config.amount, REDACTED)?;
        let req = self
            .ctx
            .http
            .get(url)
            .header("Content-Type", "application/json")
            .bearer_auth(&config.api_key);

        let resp = send(
            &self.ctx,
            req,
            CallRecord {
                request_body: audited.query().unwrap_or_default().to_string(),
                endpoint: audited.to_string(),
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
        _service_id: u64,
    ) -> Result<(), ProviderError> {
        check_signed_orders(&self.ctx, &self.config, STATUS_TABLE, invoices).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::context;
    use store::MemoryInvoiceStore;

    fn adapter() -> RacsAdapter {
        let (ctx, _) = context(MemoryInvoiceStore::new());
        let config = ExchangerConfig {
            id: 8,
            name: NAME.into(),
            endpoint: "https://racs.example/".into(),
            amount: Decimal::new(2000, 0),
            api_key: "bearer".into(),
            secret_key: "s3cr3t".into(),
            callback: String::new(),
        };
        RacsAdapter::new(config, ctx)
    }

    #[test]
    fn query_carries_fixed_parameters() {
        let url = fiat_url("https://racs.example/", Decimal::new(2000, 0), "s3cr3t").unwrap();
        assert_eq!(
            url.as_str(),
            "https://racs.example/fiat_api?amount=2000&typecommission=1&private_key=s3cr3t&currency=RUB"
        );
        let audited = fiat_url("https://racs.example/", Decimal::new(2000, 0), REDACTED).unwrap();
        assert!(!audited.as_str().contains("s3cr3t"));
    }

    #[test]
    fn order_is_normalized() {
        let body = r#"{"msg_error":"","order":[{"id":"R-1","cart":"2202 2000 3000 4000","amount":"2031.40","time_unix":1717245000}]}"#;
        let details = adapter().format_details(body).unwrap();
        assert_eq!(details.external_id, "R-1");
        assert_eq!(details.requisites, "2202 2000 3000 4000");
        assert_eq!(details.amount_in, Decimal::new(203140, 2));
        assert_eq!(details.valid_until.timestamp(), 1717245000);
        assert!(details.raw_details.contains_key("order"));
    }

    #[test]
    fn provider_error_text_is_a_rejection() {
        let err = adapter()
            .format_details(r#"{"msg_error":"no cards available","order":[]}"#)
            .unwrap_err();
        assert!(matches!(err, ProviderError::Rejected { ref message, .. } if message == "no cards available"));
    }

    #[test]
    fn empty_order_list_is_malformed() {
        let err = adapter()
            .format_details(r#"{"msg_error":"","order":[]}"#)
            .unwrap_err();
        assert!(matches!(err, ProviderError::Malformed { .. }));
    }
}
