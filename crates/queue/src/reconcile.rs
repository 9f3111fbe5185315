use crate::guard::SingleFlightGuard;
use chrono::{DateTime, Utc};
use exchanger::AdapterRegistry;
use payrouter_core::{
    ExchangerGroup, GroupKey, InvoiceCheck, InvoiceCheckLite, InvoiceLedger, Status, StoreError,
};
use std::collections::BTreeMap;
use tracing::Instrument;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub groups: usize,
    pub invoices: usize,
    pub checked_groups: usize,
    /// Invoices cancelled because their provider is no longer supported.
    pub cancelled: usize,
    pub failed_groups: usize,
}

/// Partitions pending rows by `(service_id, exchanger_id)`. Every row lands in
/// exactly one group; groups come out in key order.
pub fn group_invoices(rows: Vec<InvoiceCheck>) -> Vec<ExchangerGroup> {
    let mut groups: BTreeMap<GroupKey, ExchangerGroup> = BTreeMap::new();
    for row in rows {
        let key = GroupKey {
            service_id: row.service_id,
            exchanger_id: row.exchanger.id,
        };
        let lite = InvoiceCheckLite {
            id: row.id,
            external_id: row.external_id,
        };
        groups
            .entry(key)
            .or_insert_with(|| ExchangerGroup {
                service_id: row.service_id,
                exchanger: row.exchanger,
                invoices: Vec::new(),
            })
            .invoices
            .push(lite);
    }
    groups.into_values().collect()
}

/// Periodic status check of invoices whose requisites have expired.
pub struct ReconciliationEngine {
    registry: AdapterRegistry,
    ledger: InvoiceLedger,
    guard: SingleFlightGuard,
}

impl ReconciliationEngine {
    pub fn new(registry: AdapterRegistry, ledger: InvoiceLedger) -> Self {
        Self {
            registry,
            ledger,
            guard: SingleFlightGuard::new(),
        }
    }

    pub fn guard(&self) -> &SingleFlightGuard {
        &self.guard
    }

    /// Guarded cycle; `Ok(None)` when the previous cycle is still running.
    pub async fn run_cycle(&self) -> Result<Option<ReconcileReport>, StoreError> {
        let Some(_permit) = self.guard.enter() else {
            tracing::info!("previous reconciliation still running, skipping");
            return Ok(None);
        };
        let cycle_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!("reconcile_cycle", %cycle_id);
        self.reconcile(Utc::now()).instrument(span).await.map(Some)
    }

    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<ReconcileReport, StoreError> {
        let rows = self
            .ledger
            .store()
            .get_pending_invoices_past_expiry(now)
            .await?;
        let mut report = ReconcileReport {
            invoices: rows.len(),
            ..Default::default()
        };
        if rows.is_empty() {
            tracing::debug!("nothing to reconcile");
            return Ok(report);
        }

        let groups = group_invoices(rows);
        report.groups = groups.len();
        for group in &groups {
            self.reconcile_group(group, &mut report).await;
        }

        tracing::info!(
            groups = report.groups,
            invoices = report.invoices,
            cancelled = report.cancelled,
            failed_groups = report.failed_groups,
            "reconciliation finished"
        );
        Ok(report)
    }

    async fn reconcile_group(&self, group: &ExchangerGroup, report: &mut ReconcileReport) {
        let key = group.key();
        let adapter = self
            .registry
            .resolve(&group.exchanger)
            .filter(|adapter| adapter.reconciles());
        let Some(adapter) = adapter else {
            let ids = group.invoice_ids();
            tracing::warn!(
                group = %key,
                exchanger = %group.exchanger.name,
                count = ids.len(),
                "provider has no status check, cancelling invoices"
            );
            match self.ledger.update_bulk(&ids, Status::CancelTime).await {
                Ok(()) => report.cancelled += ids.len(),
                Err(e) => {
                    tracing::error!(group = %key, error = %e, "bulk cancellation failed");
                }
            }
            return;
        };

        match adapter
            .check_invoices(&group.invoices, group.service_id)
            .await
        {
            Ok(()) => {
                report.checked_groups += 1;
                tracing::debug!(group = %key, count = group.invoices.len(), "group checked");
            }
            Err(e) => {
                report.failed_groups += 1;
                tracing::error!(
                    group = %key,
                    exchanger = %group.exchanger.name,
                    error = %e,
                    "status check failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use async_trait::async_trait;
    use exchanger::{AdapterContext, AdapterSettings, ProviderAdapter, ProviderError};
    use payrouter_core::{DetailsRequisites, ExchangerConfig, InvoiceRecord, InvoiceTask};
    use rust_decimal::Decimal;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use store::MemoryInvoiceStore;

    fn exchanger(id: u32, name: &str) -> ExchangerConfig {
        ExchangerConfig {
            id,
            name: name.into(),
            endpoint: "https://p.example".into(),
            amount: Decimal::ONE,
            api_key: "k".into(),
            secret_key: String::new(),
            callback: String::new(),
        }
    }

    fn row(id: u64, service_id: u64, ex: &ExchangerConfig) -> InvoiceCheck {
        InvoiceCheck {
            id,
            external_id: format!("ext-{id}"),
            service_id,
            exchanger: ex.clone(),
        }
    }

    #[test]
    fn grouping_is_a_partition_by_service_and_exchanger() {
        let a = exchanger(1, "Greengo");
        let b = exchanger(2, "LuckyPay");
        let rows = vec![
            row(1, 10, &a),
            row(2, 10, &b),
            row(3, 20, &a),
            row(4, 10, &a),
            row(5, 20, &a),
        ];
        let groups = group_invoices(rows);

        let keys: Vec<String> = groups.iter().map(|g| g.key().to_string()).collect();
        assert_eq!(keys, vec!["10:1", "10:2", "20:1"]);
        assert_eq!(groups[0].invoice_ids(), vec![1, 4]);
        assert_eq!(groups[2].invoice_ids(), vec![3, 5]);

        let mut seen = HashSet::new();
        for g in &groups {
            for inv in &g.invoices {
                assert!(seen.insert(inv.id));
            }
        }
        assert_eq!(seen.len(), 5);
    }

    /// Records the batches it was asked to check; fails for one service.
    struct RecordingAdapter {
        calls: Arc<Mutex<Vec<(u64, Vec<u64>)>>>,
        failing_service: u64,
    }

    #[async_trait]
    impl ProviderAdapter for RecordingAdapter {
        async fn get_requisites(
            &self,
            _: &InvoiceTask,
            _: &ExchangerConfig,
        ) -> Result<DetailsRequisites, ProviderError> {
            Err(ProviderError::Signing("unused".into()))
        }

        async fn check_invoices(
            &self,
            invoices: &[InvoiceCheckLite],
            service_id: u64,
        ) -> Result<(), ProviderError> {
            self.calls
                .lock()
                .unwrap()
                .push((service_id, invoices.iter().map(|i| i.id).collect()));
            if service_id == self.failing_service {
                return Err(ProviderError::Status {
                    status: 500,
                    body: String::new(),
                });
            }
            Ok(())
        }
    }

    async fn seed(store: &MemoryInvoiceStore, id: u64, service_id: u64, exchanger_id: u32) {
        let mut rec = InvoiceRecord::new(id, service_id);
        rec.exchanger_id = Some(exchanger_id);
        rec.external_id = Some(format!("ext-{id}"));
        rec.expiry_at = Some(Utc::now() - chrono::Duration::minutes(1));
        store.insert_invoice(rec).await;
    }

    #[tokio::test]
    async fn groups_are_checked_cancelled_or_isolated_on_failure() {
        let store = MemoryInvoiceStore::new();
        let checked = exchanger(1, "Recording");
        let retired = exchanger(2, "Retired");
        for service in [10, 20] {
            store.register_exchanger(service, checked.clone()).await;
            store.register_exchanger(service, retired.clone()).await;
        }
        seed(&store, 1, 10, 1).await;
        seed(&store, 2, 10, 1).await;
        seed(&store, 3, 20, 1).await;
        seed(&store, 4, 10, 2).await;
        // not yet expired
        let mut fresh = InvoiceRecord::new(5, 10);
        fresh.exchanger_id = Some(1);
        fresh.external_id = Some("ext-5".into());
        fresh.expiry_at = Some(Utc::now() + chrono::Duration::minutes(5));
        store.insert_invoice(fresh).await;

        let audit = Arc::new(MemoryAuditSink::new());
        let ledger = InvoiceLedger::new(Arc::new(store.clone()), audit);
        let ctx = AdapterContext::new(ledger.clone(), AdapterSettings::default()).unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = AdapterRegistry::new(ctx);
        let recorded = calls.clone();
        registry.register("Recording", move |_, _| {
            Arc::new(RecordingAdapter {
                calls: recorded.clone(),
                failing_service: 10,
            })
        });

        let engine = ReconciliationEngine::new(registry, ledger);
        let report = engine.run_cycle().await.unwrap().unwrap();

        assert_eq!(
            report,
            ReconcileReport {
                groups: 3,
                invoices: 4,
                checked_groups: 1,
                cancelled: 1,
                failed_groups: 1,
            }
        );
        assert_eq!(
            *calls.lock().unwrap(),
            vec![(10, vec![1, 2]), (20, vec![3])]
        );
        assert_eq!(store.get_invoice(4).await.unwrap().status, Status::CancelTime);
        assert_eq!(store.get_invoice(1).await.unwrap().status, Status::Pending);
        assert!(!engine.guard().is_running());
    }

    #[tokio::test]
    async fn expired_test_backend_invoices_are_cancelled() {
        let store = MemoryInvoiceStore::new();
        store.register_exchanger(10, exchanger(5, "Test")).await;
        seed(&store, 1, 10, 5).await;
        seed(&store, 2, 10, 5).await;

        let ledger = InvoiceLedger::new(Arc::new(store.clone()), Arc::new(MemoryAuditSink::new()));
        let ctx = AdapterContext::new(ledger.clone(), AdapterSettings::default()).unwrap();
        let engine = ReconciliationEngine::new(AdapterRegistry::with_builtin(ctx), ledger);

        let report = engine.reconcile(Utc::now()).await.unwrap();
        assert_eq!(report.cancelled, 2);
        assert_eq!(report.checked_groups, 0);
        for id in [1, 2] {
            assert_eq!(store.get_invoice(id).await.unwrap().status, Status::CancelTime);
        }
        // nothing is left to re-read on the next cycle
        let again = engine.reconcile(Utc::now()).await.unwrap();
        assert_eq!(again.invoices, 0);
    }

    #[tokio::test]
    async fn overlapping_reconciliation_is_skipped() {
        let store = MemoryInvoiceStore::new();
        let ledger = InvoiceLedger::new(Arc::new(store), Arc::new(MemoryAuditSink::new()));
        let ctx = AdapterContext::new(ledger.clone(), AdapterSettings::default()).unwrap();
        let engine = ReconciliationEngine::new(AdapterRegistry::with_builtin(ctx), ledger);

        let _permit = engine.guard().enter().unwrap();
        assert_eq!(engine.run_cycle().await.unwrap(), None);
    }
}
