use crate::{AdapterContext, ProviderAdapter, ProviderError};
use async_trait::async_trait;
use payrouter_core::{DetailsRequisites, ExchangerConfig, InvoiceCheckLite, InvoiceTask};
use rand::{distributions::Alphanumeric, Rng};
use serde_json::{json, Map};
use tokio::time::{sleep, Duration};

pub const NAME: &str = "Test";

/// Backend that never leaves the process. Requisites are synthesized and
/// status checks succeed without touching any invoice.
#[derive(Clone)]
pub struct TestAdapter {
    ctx: AdapterContext,
    latency: Duration,
}

impl TestAdapter {
    pub fn new(ctx: AdapterContext) -> Self {
        Self {
            ctx,
            latency: Duration::from_millis(50),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[async_trait]
impl ProviderAdapter for TestAdapter {
    async fn get_requisites(
        &self,
        task: &InvoiceTask,
        config: &ExchangerConfig,
    ) -> Result<DetailsRequisites, ProviderError> {
        let external_id = format!("test-{}", random_token(16));
        let card: String = (0..4)
            .map(|_| format!("{:04}", rand::thread_rng().gen_range(0..10_000)))
            .collect::<Vec<_>>()
            .join(" ");
        // simulate network latency
        sleep(self.latency).await;

        let mut raw = Map::new();
        raw.insert("invoice_id".into(), json!(task.invoice.id));
        raw.insert("id".into(), json!(external_id));
        raw.insert("requisites".into(), json!(card));

        Ok(DetailsRequisites {
            external_id,
            amount_in: config.amount,
            requisites: card,
            valid_until: self.ctx.default_valid_until(),
            raw_details: raw,
        })
    }

    async fn check_invoices(
        &self,
        invoices: &[InvoiceCheckLite],
        service_id: u64,
    ) -> Result<(), ProviderError> {
        tracing::debug!(service_id, count = invoices.len(), "test backend check skipped");
        Ok(())
    }

    fn reconciles(&self) -> bool {
        false
    }
}
