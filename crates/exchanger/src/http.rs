use crate::{AdapterContext, ProviderError};
use serde::de::DeserializeOwned;

/// What gets written to the audit trail for one outbound request.
pub(crate) struct CallRecord {
    pub endpoint: String,
    pub request_body: String,
    pub invoice_id: Option<u64>,
    pub exchanger_id: u32,
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Sends the request, audits the exchange and returns the body of a 200/201 answer.
pub(crate) async fn send(
    ctx: &AdapterContext,
    req: reqwest::RequestBuilder,
    record: CallRecord,
) -> Result<String, ProviderError> {
    let resp = req.send().await?;
    let status = resp.status().as_u16();
    let body = resp.text().await?;

    tracing::debug!(
        endpoint = %record.endpoint,
        status,
        exchanger_id = record.exchanger_id,
        "provider call completed"
    );
    ctx.audit()
        .record_api_call(
            &record.endpoint,
            status,
            &record.request_body,
            &body,
            record.invoice_id,
            record.exchanger_id,
        )
        .await;

    if status != 200 && status != 201 {
        return Err(ProviderError::Status { status, body });
    }
    Ok(body)
}

pub(crate) fn decode<T: DeserializeOwned>(body: &str) -> Result<T, ProviderError> {
    serde_json::from_str(body).map_err(|e| ProviderError::malformed(e.to_string(), body))
}

/// Typed view over an object that is also kept verbatim as raw details.
pub(crate) fn decode_object<T: DeserializeOwned>(
    object: &serde_json::Map<String, serde_json::Value>,
    body: &str,
) -> Result<T, ProviderError> {
    serde_json::from_value(serde_json::Value::Object(object.clone()))
        .map_err(|e| ProviderError::malformed(e.to_string(), body))
}
