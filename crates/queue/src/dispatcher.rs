use crate::error::DispatchError;
use exchanger::{AdapterRegistry, ProviderError};
use payrouter_core::{InvoiceLedger, InvoiceTask, Status};
use std::time::Instant;

/// Walks a task's exchanger list in order until one provider yields requisites.
pub struct Dispatcher {
    registry: AdapterRegistry,
    ledger: InvoiceLedger,
}

fn error_message(err: &ProviderError) -> String {
    match err.raw_response() {
        Some(body) if !body.is_empty() => format!("{err}; response: {body}"),
        _ => err.to_string(),
    }
}

impl Dispatcher {
    pub fn new(registry: AdapterRegistry, ledger: InvoiceLedger) -> Self {
        Self { registry, ledger }
    }

    pub fn ledger(&self) -> &InvoiceLedger {
        &self.ledger
    }

    /// Returns the requisites of the first provider that succeeds. Exchangers
    /// after the winner are never contacted, and an exhausted list leaves the
    /// invoice untouched.
    pub async fn process(&self, task: &InvoiceTask) -> Result<String, DispatchError> {
        let invoice = &task.invoice;
        let audit = self.ledger.audit();
        let mut attempts = 0;

        for config in &task.exchangers {
            let Some(adapter) = self.registry.resolve(config) else {
                tracing::warn!(
                    invoice_id = invoice.id,
                    exchanger = %config.name,
                    "unsupported provider, skipping"
                );
                continue;
            };
            attempts += 1;

            let started = Instant::now();
            let result = adapter.get_requisites(task, config).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(details) => {
                    if let Err(e) = self
                        .ledger
                        .record_requisites(invoice.id, config.id, &details)
                        .await
                    {
                        tracing::error!(
                            invoice_id = invoice.id,
                            exchanger = %config.name,
                            error = %e,
                            "could not persist requisites"
                        );
                        audit
                            .record_invoice_error(invoice.id, &format!("persisting requisites: {e}"))
                            .await;
                    }
                    audit
                        .record_outcome(
                            invoice.id,
                            Status::Pending,
                            &config.name,
                            elapsed_ms,
                            invoice.created_at,
                        )
                        .await;
                    tracing::info!(
                        invoice_id = invoice.id,
                        exchanger = %config.name,
                        external_id = %details.external_id,
                        elapsed_ms,
                        "requisites obtained"
                    );
                    return Ok(details.requisites);
                }
                Err(e) => {
                    tracing::warn!(
                        invoice_id = invoice.id,
                        exchanger = %config.name,
                        error = %e,
                        "provider attempt failed"
                    );
                    audit
                        .record_outcome(
                            invoice.id,
                            Status::Error,
                            &config.name,
                            elapsed_ms,
                            invoice.created_at,
                        )
                        .await;
                    audit
                        .record_api_error(invoice.id, config.id, &error_message(&e))
                        .await;
                }
            }
        }

        Err(DispatchError::AllProvidersExhausted {
            invoice_id: invoice.id,
            attempts,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audit::{MemoryAuditSink, API_ERROR, OUTCOME};
    use async_trait::async_trait;
    use chrono::Utc;
    use exchanger::{AdapterContext, AdapterSettings, ProviderAdapter};
    use mockall::mock;
    use payrouter_core::{
        DetailsRequisites, ExchangerConfig, Invoice, InvoiceCheckLite, InvoiceRecord,
    };
    use rust_decimal::Decimal;
    use serde_json::Map;
    use std::sync::Arc;
    use store::MemoryInvoiceStore;

    mock! {
        pub Adapter {}
        #[async_trait]
        impl ProviderAdapter for Adapter {
            async fn get_requisites(
                &self,
                task: &InvoiceTask,
                config: &ExchangerConfig,
            ) -> Result<DetailsRequisites, ProviderError>;
            async fn check_invoices(
                &self,
                invoices: &[InvoiceCheckLite],
                service_id: u64,
            ) -> Result<(), ProviderError>;
        }
    }

    fn exchanger(id: u32, name: &str) -> ExchangerConfig {
        ExchangerConfig {
            id,
            name: name.into(),
            endpoint: format!("https://{}.example", name.to_lowercase()),
            amount: Decimal::new(100, 0),
            api_key: "key".into(),
            secret_key: String::new(),
            callback: String::new(),
        }
    }

    fn requisites(external_id: &str) -> DetailsRequisites {
        DetailsRequisites {
            external_id: external_id.into(),
            amount_in: Decimal::new(101, 0),
            requisites: format!("card-{external_id}"),
            valid_until: Utc::now() + chrono::Duration::minutes(20),
            raw_details: Map::new(),
        }
    }

    fn succeeding(external_id: &'static str) -> MockAdapter {
        let mut adapter = MockAdapter::new();
        adapter
            .expect_get_requisites()
            .times(1)
            .returning(move |_, _| Ok(requisites(external_id)));
        adapter
    }

    fn failing() -> MockAdapter {
        let mut adapter = MockAdapter::new();
        adapter.expect_get_requisites().times(1).returning(|_, _| {
            Err(ProviderError::Status {
                status: 502,
                body: "bad gateway".into(),
            })
        });
        adapter
    }

    fn untouched() -> MockAdapter {
        let mut adapter = MockAdapter::new();
        adapter.expect_get_requisites().never();
        adapter
    }

    struct Fixture {
        store: MemoryInvoiceStore,
        audit: Arc<MemoryAuditSink>,
        dispatcher: Dispatcher,
    }

    async fn fixture(adapters: Vec<(&str, MockAdapter)>) -> Fixture {
        let store = MemoryInvoiceStore::new();
        store.insert_invoice(InvoiceRecord::new(7, 1)).await;
        let audit = Arc::new(MemoryAuditSink::new());
        let ledger = InvoiceLedger::new(Arc::new(store.clone()), audit.clone());
        let ctx = AdapterContext::new(ledger.clone(), AdapterSettings::default()).unwrap();
        let mut registry = AdapterRegistry::new(ctx);
        for (name, adapter) in adapters {
            let adapter: Arc<dyn ProviderAdapter> = Arc::new(adapter);
            registry.register(name, move |_, _| adapter.clone());
        }
        Fixture {
            store,
            audit,
            dispatcher: Dispatcher::new(registry, ledger),
        }
    }

    fn task(exchangers: Vec<ExchangerConfig>) -> InvoiceTask {
        InvoiceTask {
            invoice: Invoice {
                id: 7,
                created_at: Utc::now(),
            },
            exchangers,
        }
    }

    #[tokio::test]
    async fn first_success_wins_and_later_providers_are_skipped() {
        let fx = fixture(vec![
            ("A", failing()),
            ("B", succeeding("b-1")),
            ("C", untouched()),
        ])
        .await;
        let task = task(vec![exchanger(1, "A"), exchanger(2, "B"), exchanger(3, "C")]);

        let requisites = fx.dispatcher.process(&task).await.unwrap();
        assert_eq!(requisites, "card-b-1");

        let rec = fx.store.get_invoice(7).await.unwrap();
        assert_eq!(rec.status, Status::Pending);
        assert_eq!(rec.exchanger_id, Some(2));
        assert_eq!(rec.external_id.as_deref(), Some("b-1"));

        let errors = fx.audit.of_type(API_ERROR);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].exchanger_id, Some(1));
        assert!(errors[0].error.as_deref().unwrap().contains("bad gateway"));

        let outcomes: Vec<_> = fx
            .audit
            .of_type(OUTCOME)
            .into_iter()
            .map(|e| (e.provider.unwrap(), e.status.unwrap()))
            .collect();
        assert_eq!(
            outcomes,
            vec![("A".to_string(), Status::Error), ("B".to_string(), Status::Pending)]
        );
    }

    #[tokio::test]
    async fn exhausted_list_leaves_invoice_untouched() {
        let fx = fixture(vec![("A", failing()), ("B", failing())]).await;
        let task = task(vec![exchanger(1, "A"), exchanger(2, "B")]);
        let before = fx.store.get_invoice(7).await.unwrap();

        match fx.dispatcher.process(&task).await {
            Err(DispatchError::AllProvidersExhausted {
                invoice_id,
                attempts,
            }) => {
                assert_eq!(invoice_id, 7);
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fx.store.get_invoice(7).await.unwrap(), before);
        assert_eq!(fx.audit.of_type(API_ERROR).len(), 2);
    }

    #[tokio::test]
    async fn unknown_provider_is_skipped_without_failing_the_task() {
        let fx = fixture(vec![("B", succeeding("b-2"))]).await;
        let task = task(vec![exchanger(1, "Nobody"), exchanger(2, "B")]);

        assert_eq!(fx.dispatcher.process(&task).await.unwrap(), "card-b-2");
        assert!(fx.audit.of_type(API_ERROR).is_empty());
    }

    #[tokio::test]
    async fn only_unknown_providers_exhaust_with_zero_attempts() {
        let fx = fixture(vec![]).await;
        let task = task(vec![exchanger(1, "Nobody")]);
        assert!(matches!(
            fx.dispatcher.process(&task).await,
            Err(DispatchError::AllProvidersExhausted { attempts: 0, .. })
        ));
    }
}
