use crate::broker::InboundMessage;
use crate::dispatcher::Dispatcher;
use crate::error::{disposition_of, Disposition, TaskError};
use crate::guard::SingleFlightGuard;
use chrono::Utc;
use payrouter_core::parsing::{parse_invoice_task, peek_invoice_id, task_fingerprint};
use payrouter_core::validation::validate;
use payrouter_core::{InvoiceLedger, Status};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::Instrument;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub batch_size: usize,
    /// Collection stops once no message arrived for this long.
    pub idle_timeout: Duration,
    pub max_concurrency: usize,
    /// Tasks older than this are cancelled instead of dispatched.
    pub task_ttl: chrono::Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            idle_timeout: Duration::from_secs(2),
            max_concurrency: 50,
            task_ttl: chrono::Duration::minutes(5),
        }
    }
}

/// Counts of how the messages of one cycle were settled.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub collected: usize,
    pub acked: usize,
    pub dropped: usize,
    pub requeued: usize,
}

impl CycleReport {
    fn count(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Ack => self.acked += 1,
            Disposition::Drop => self.dropped += 1,
            Disposition::Requeue => self.requeued += 1,
        }
    }
}

/// Turns one raw message into a dispatch, or into the reason it cannot be dispatched.
#[derive(Clone)]
pub struct TaskHandler {
    dispatcher: Arc<Dispatcher>,
    task_ttl: chrono::Duration,
}

impl TaskHandler {
    pub fn new(dispatcher: Arc<Dispatcher>, task_ttl: chrono::Duration) -> Self {
        Self {
            dispatcher,
            task_ttl,
        }
    }

    fn ledger(&self) -> &InvoiceLedger {
        self.dispatcher.ledger()
    }

    pub async fn handle(&self, body: &[u8]) -> Result<(), TaskError> {
        let task = match parse_invoice_task(body) {
            Ok(task) => task,
            Err(e) => {
                let fingerprint = task_fingerprint(body);
                tracing::warn!(%fingerprint, error = %e, "dropping unparseable message");
                tracing::debug!(body = %String::from_utf8_lossy(body), "unparseable body");
                if let Some(invoice_id) = peek_invoice_id(body) {
                    self.ledger()
                        .audit()
                        .record_invoice_error(
                            invoice_id,
                            &format!("malformed task {fingerprint}: {e}"),
                        )
                        .await;
                }
                return Err(TaskError::MalformedMessage(e));
            }
        };
        let invoice_id = task.invoice.id;

        if let Err(errors) = validate(&task) {
            tracing::warn!(invoice_id, %errors, "dropping invalid task");
            if invoice_id > 0 {
                self.mark(invoice_id, Status::CancelInvalid, &errors.to_string())
                    .await;
                self.ledger()
                    .audit()
                    .record_invoice_error(invoice_id, &errors.to_string())
                    .await;
            }
            return Err(TaskError::Invalid { invoice_id, errors });
        }

        let age = Utc::now() - task.invoice.created_at;
        if age > self.task_ttl {
            tracing::warn!(invoice_id, age_secs = age.num_seconds(), "dropping expired task");
            self.mark(invoice_id, Status::CancelSearch, "no requisites before expiry")
                .await;
            return Err(TaskError::TaskExpired {
                invoice_id,
                age_secs: age.num_seconds(),
            });
        }

        self.dispatcher.process(&task).await?;
        Ok(())
    }

    async fn mark(&self, invoice_id: u64, status: Status, reason: &str) {
        if let Err(e) = self.ledger().mark(invoice_id, status, reason).await {
            tracing::error!(invoice_id, %status, error = %e, "could not record status");
        }
    }
}

/// Batch consumer driven by the scheduler: collect, fan out, settle.
pub struct QueuePipeline {
    inbox: Mutex<mpsc::Receiver<InboundMessage>>,
    handler: TaskHandler,
    guard: SingleFlightGuard,
    settings: PipelineSettings,
}

impl QueuePipeline {
    pub fn new(
        inbox: mpsc::Receiver<InboundMessage>,
        dispatcher: Arc<Dispatcher>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            inbox: Mutex::new(inbox),
            handler: TaskHandler::new(dispatcher, settings.task_ttl),
            guard: SingleFlightGuard::new(),
            settings,
        }
    }

    pub fn guard(&self) -> &SingleFlightGuard {
        &self.guard
    }

    /// Runs one cycle, or returns `None` when the previous one is still running.
    pub async fn run_cycle(&self) -> Option<CycleReport> {
        let Some(_permit) = self.guard.enter() else {
            tracing::info!("previous pipeline cycle still running, skipping");
            return None;
        };
        let cycle_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!("pipeline_cycle", %cycle_id);
        Some(self.cycle().instrument(span).await)
    }

    async fn cycle(&self) -> CycleReport {
        let batch = self.collect().await;
        let mut report = CycleReport {
            collected: batch.len(),
            ..Default::default()
        };
        if batch.is_empty() {
            tracing::debug!("no messages");
            return report;
        }
        tracing::info!(count = batch.len(), "processing batch");

        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrency.max(1)));
        let mut workers = JoinSet::new();
        for message in batch {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let handler = self.handler.clone();
            workers.spawn(
                async move {
                    let _permit = permit;
                    let result = handler.handle(&message.body).await;
                    let disposition = disposition_of(&result);
                    if let Err(e) = message.settle(disposition).await {
                        tracing::warn!(?disposition, error = %e, "could not settle message");
                    }
                    disposition
                }
                .in_current_span(),
            );
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(disposition) => report.count(disposition),
                Err(e) => tracing::error!(error = %e, "pipeline worker failed"),
            }
        }
        tracing::info!(
            acked = report.acked,
            dropped = report.dropped,
            requeued = report.requeued,
            "batch finished"
        );
        report
    }

    async fn collect(&self) -> Vec<InboundMessage> {
        let mut inbox = self.inbox.lock().await;
        let mut batch = Vec::with_capacity(self.settings.batch_size);
        while batch.len() < self.settings.batch_size {
            match tokio::time::timeout(self.settings.idle_timeout, inbox.recv()).await {
                Ok(Some(message)) => batch.push(message),
                Ok(None) => {
                    tracing::warn!("consumer channel closed");
                    break;
                }
                Err(_) => break,
            }
        }
        batch
    }
}
