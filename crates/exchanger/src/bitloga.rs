use crate::http::{decode, decode_object, join_url, send, CallRecord};
use crate::signing::hmac_sha512_hex;
use crate::status::apply_status;
use crate::{AdapterContext, ProviderAdapter, ProviderError, StatusTable};
use async_trait::async_trait;
use payrouter_core::{DetailsRequisites, ExchangerConfig, InvoiceCheckLite, InvoiceTask, Status};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const NAME: &str = "Bitloga";

pub const STATUS_TABLE: StatusTable = &[
    ("Payed", Some(Status::Paid)),
    ("Pending", None),
    ("Error", Some(Status::Error)),
    ("Canceled", Some(Status::CancelTime)),
];

/// HMAC-signed JSON API: the hex HMAC-SHA512 of the raw body goes into
/// `X-SIGNATURE`, the API key into `X-APIKEY`.
#[derive(Clone)]
pub struct BitlogaAdapter {
    config: ExchangerConfig,
    ctx: AdapterContext,
}

#[derive(Debug, Serialize)]
struct InvoiceRequest<'a> {
    action: &'a str,
    uniqueid: String,
    paysys: &'a str,
    #[serde(with = "rust_decimal::serde::float")]
    amount: Decimal,
    comis: &'a str,
    name: &'a str,
    surname: String,
}

#[derive(Debug, Deserialize)]
struct InvoiceResponse {
    invoiceid: String,
    requisites: String,
    amount_payable: Decimal,
}

#[derive(Debug, Serialize)]
struct DetailsRequest<'a> {
    action: &'a str,
    uniqueid: u64,
}

#[derive(Debug, Deserialize)]
struct DetailsResponse {
    status: String,
}

/// Body of a signed request, kept as bytes so the signature covers exactly what is sent.
pub(crate) fn signed_post(
    ctx: &AdapterContext,
    config: &ExchangerConfig,
    url: &str,
    body: &[u8],
) -> Result<reqwest::RequestBuilder, ProviderError> {
    let signature = hmac_sha512_hex(&config.secret_key, body)?;
    Ok(ctx
        .http
        .post(url)
        .header("Content-Type", "application/json")
        .header("Accept", "application/json")
        .header("X-APIKEY", &config.api_key)
        .header("X-SIGNATURE", signature)
        .body(body.to_vec()))
}

/// Per-invoice status lookup shared by the backends speaking the signed order API.
pub(crate) async fn check_signed_orders(
    ctx: &AdapterContext,
    config: &ExchangerConfig,
    table: StatusTable,
    invoices: &[InvoiceCheckLite],
) -> Result<(), ProviderError> {
    let url = join_url(&config.endpoint, "/api/v1/order/");

    for invoice in invoices {
        let outcome = async {
            let body = serde_json::to_vec(&DetailsRequest {
                action: "details",
                uniqueid: invoice.id,
            })
            .map_err(|e| ProviderError::malformed(e.to_string(), ""))?;
            let req = signed_post(ctx, config, &url, &body)?;
            let resp = send(
                ctx,
                req,
                CallRecord {
                    endpoint: url.clone(),
                    request_body: String::from_utf8_lossy(&body).into_owned(),
                    invoice_id: Some(invoice.id),
                    exchanger_id: config.id,
                },
            )
            .await?;
            let details: DetailsResponse = decode(&resp)?;
            apply_status(ctx, table, invoice, &details.status).await
        }
        .await;

        if let Err(e) = outcome {
            tracing::warn!(
                exchanger = %config.name,
                invoice_id = invoice.id,
                error = %e,
                "could not reconcile invoice"
            );
        }
    }

    Ok(())
}

impl BitlogaAdapter {
    pub fn new(config: ExchangerConfig, ctx: AdapterContext) -> Self {
        Self { config, ctx }
    }

    fn format_details(&self, body: &str) -> Result<DetailsRequisites, ProviderError> {
        let raw: Map<String, Value> = decode(body)?;

        if raw.get("success").and_then(Value::as_bool) != Some(true) {
            let message = raw
                .get("message")
                .or_else(|| raw.get("response"))
                .and_then(Value::as_str)
                .unwrap_or("provider reported failure without a message")
                .to_string();
            return Err(ProviderError::Rejected {
                message,
                body: body.to_string(),
            });
        }

        let parsed: InvoiceResponse = decode_object(&raw, body)?;
        Ok(DetailsRequisites {
            external_id: parsed.invoiceid,
            amount_in: parsed.amount_payable,
            requisites: parsed.requisites,
            valid_until: self.ctx.default_valid_until(),
            raw_details: raw,
        })
    }
}

#[async_trait]
impl ProviderAdapter for BitlogaAdapter {
    async fn get_requisites(
        &self,
        task: &InvoiceTask,
        config: &ExchangerConfig,
    ) -> Result<DetailsRequisites, ProviderError> {
        let invoice_id = task.invoice.id.to_string();
        let payload = InvoiceRequest {
            action: "invoice",
            uniqueid: invoice_id.clone(),
            paysys: "RUBBALANCE",
            amount: config.amount,
            comis: "payer",
            name: "Invoice",
            surname: invoice_id,
        };
        let body =
            serde_json::to_vec(&payload).map_err(|e| ProviderError::malformed(e.to_string(), ""))?;
        let url = join_url(&config.endpoint, "/api/v1/");
        let req = signed_post(&self.ctx, config, &url, &body)?;

        let resp = send(
            &self.ctx,
            req,
            CallRecord {
                endpoint: url,
                request_body: String::from_utf8_lossy(&body).into_owned(),
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
