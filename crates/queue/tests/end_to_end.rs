use async_trait::async_trait;
use chrono::Utc;
use exchanger::{
    AdapterContext, AdapterRegistry, AdapterSettings, ProviderAdapter, ProviderError,
};
use payrouter_core::{
    DetailsRequisites, ExchangerConfig, InvoiceCheckLite, InvoiceLedger, InvoiceRecord,
    InvoiceTask, Status,
};
use queue::audit::{API_ERROR, OUTCOME};
use queue::{
    Acknowledger, BrokerError, Dispatcher, InboundMessage, MemoryAuditSink, PipelineSettings,
    QueuePipeline,
};
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use store::MemoryInvoiceStore;
use tokio::sync::mpsc;

#[derive(Default, Clone)]
struct Settled(Arc<Mutex<Vec<&'static str>>>);

#[async_trait]
impl Acknowledger for Settled {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0.lock().unwrap().push("ack");
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.0
            .lock()
            .unwrap()
            .push(if requeue { "requeue" } else { "drop" });
        Ok(())
    }
}

struct Down;

#[async_trait]
impl ProviderAdapter for Down {
    async fn get_requisites(
        &self,
        _: &InvoiceTask,
        _: &ExchangerConfig,
    ) -> Result<DetailsRequisites, ProviderError> {
        Err(ProviderError::Status {
            status: 503,
            body: "maintenance".into(),
        })
    }

    async fn check_invoices(&self, _: &[InvoiceCheckLite], _: u64) -> Result<(), ProviderError> {
        Ok(())
    }
}

struct Fixed;

#[async_trait]
impl ProviderAdapter for Fixed {
    async fn get_requisites(
        &self,
        task: &InvoiceTask,
        config: &ExchangerConfig,
    ) -> Result<DetailsRequisites, ProviderError> {
        Ok(DetailsRequisites {
            external_id: format!("fixed-{}", task.invoice.id),
            amount_in: config.amount,
            requisites: "2200 0000 0000 0007".into(),
            valid_until: Utc::now() + chrono::Duration::minutes(15),
            raw_details: Default::default(),
        })
    }

    async fn check_invoices(&self, _: &[InvoiceCheckLite], _: u64) -> Result<(), ProviderError> {
        Ok(())
    }
}

struct Harness {
    store: MemoryInvoiceStore,
    audit: Arc<MemoryAuditSink>,
    pipeline: QueuePipeline,
    tx: mpsc::Sender<InboundMessage>,
    settled: Settled,
}

fn harness(configure: impl FnOnce(&mut AdapterRegistry)) -> Harness {
    let store = MemoryInvoiceStore::new();
    let audit = Arc::new(MemoryAuditSink::new());
    let ledger = InvoiceLedger::new(Arc::new(store.clone()), audit.clone());
    let ctx = AdapterContext::new(ledger.clone(), AdapterSettings::default()).unwrap();
    let mut registry = AdapterRegistry::with_builtin(ctx);
    configure(&mut registry);

    let (tx, rx) = mpsc::channel(16);
    let pipeline = QueuePipeline::new(
        rx,
        Arc::new(Dispatcher::new(registry, ledger)),
        PipelineSettings {
            idle_timeout: Duration::from_millis(50),
            ..Default::default()
        },
    );
    Harness {
        store,
        audit,
        pipeline,
        tx,
        settled: Settled::default(),
    }
}

impl Harness {
    async fn publish(&self, body: String) {
        self.tx
            .send(InboundMessage::new(
                body.into_bytes(),
                Box::new(self.settled.clone()),
            ))
            .await
            .unwrap();
    }

    fn settled(&self) -> Vec<&'static str> {
        self.settled.0.lock().unwrap().clone()
    }
}

fn exchanger(id: u32, name: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "name": name,
        "endpoint": "https://provider.example",
        "amount": 100,
        "api_key": "key",
        "secret_key": "",
        "callback": ""
    })
}

fn task(invoice_id: u64, exchangers: Vec<serde_json::Value>) -> String {
    serde_json::json!({
        "invoice": { "id": invoice_id, "created_at": Utc::now().to_rfc3339() },
        "exchangers": exchangers,
    })
    .to_string()
}

#[tokio::test]
async fn test_provider_task_ends_pending_with_requisites() {
    let h = harness(|_| {});
    h.store.insert_invoice(InvoiceRecord::new(42, 1)).await;
    h.publish(task(42, vec![exchanger(1, "Test")])).await;

    let report = h.pipeline.run_cycle().await.unwrap();
    assert_eq!(report.collected, 1);
    assert_eq!(report.acked, 1);
    assert_eq!(h.settled(), vec!["ack"]);

    let rec = h.store.get_invoice(42).await.unwrap();
    assert_eq!(rec.status, Status::Pending);
    assert_eq!(rec.exchanger_id, Some(1));
    assert_eq!(rec.amount_in, Some(Decimal::from(100)));
    assert!(rec.external_id.unwrap().starts_with("test-"));
    let remaining = rec.expiry_at.unwrap() - Utc::now();
    assert!(remaining > chrono::Duration::minutes(19));
    assert!(remaining <= chrono::Duration::minutes(20));

    let outcomes = h.audit.of_type(OUTCOME);
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].provider.as_deref(), Some("Test"));
}

#[tokio::test]
async fn failing_provider_falls_back_to_the_next_one() {
    let h = harness(|registry| {
        registry.register("Down", |_, _| Arc::new(Down));
        registry.register("Fixed", |_, _| Arc::new(Fixed));
    });
    h.store.insert_invoice(InvoiceRecord::new(7, 1)).await;
    h.publish(task(7, vec![exchanger(1, "Down"), exchanger(2, "Fixed")]))
        .await;

    let report = h.pipeline.run_cycle().await.unwrap();
    assert_eq!(report.acked, 1);
    assert_eq!(h.settled(), vec!["ack"]);

    let rec = h.store.get_invoice(7).await.unwrap();
    assert_eq!(rec.external_id.as_deref(), Some("fixed-7"));
    assert_eq!(rec.exchanger_id, Some(2));
    assert_eq!(rec.requisites.as_deref(), Some("2200 0000 0000 0007"));

    let api_errors = h.audit.of_type(API_ERROR);
    assert_eq!(api_errors.len(), 1);
    assert_eq!(api_errors[0].invoice_id, Some(7));
    assert_eq!(api_errors[0].exchanger_id, Some(1));
}

#[tokio::test]
async fn exhausted_providers_requeue_the_message() {
    let h = harness(|registry| {
        registry.register("Down", |_, _| Arc::new(Down));
    });
    h.store.insert_invoice(InvoiceRecord::new(8, 1)).await;
    h.publish(task(8, vec![exchanger(1, "Down")])).await;

    let report = h.pipeline.run_cycle().await.unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(h.settled(), vec!["requeue"]);
    let rec = h.store.get_invoice(8).await.unwrap();
    assert_eq!(rec.status, Status::Pending);
    assert!(rec.external_id.is_none());
}
