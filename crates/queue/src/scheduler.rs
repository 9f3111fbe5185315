use crate::pipeline::QueuePipeline;
use crate::reconcile::ReconciliationEngine;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Two independent timers: one drives the queue pipeline, the other reconciliation.
pub struct Scheduler {
    pipeline: Arc<QueuePipeline>,
    reconciler: Arc<ReconciliationEngine>,
    pipeline_every: Duration,
    reconcile_every: Duration,
}

pub struct SchedulerHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stops both timers. Cycles already running are left to finish.
    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

fn every<F, Fut>(name: &'static str, period: Duration, mut cycle: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(job = name, period_secs = period.as_secs(), "periodic job started");
        loop {
            timer.tick().await;
            tokio::spawn(cycle());
        }
    })
}

impl Scheduler {
    pub fn new(
        pipeline: Arc<QueuePipeline>,
        reconciler: Arc<ReconciliationEngine>,
        pipeline_every: Duration,
        reconcile_every: Duration,
    ) -> Self {
        Self {
            pipeline,
            reconciler,
            pipeline_every,
            reconcile_every,
        }
    }

    /// Spawns both loops. Each tick starts a cycle in its own task; an
    /// overlapping cycle is turned into a no-op by the job's guard.
    pub fn start(self) -> SchedulerHandle {
        let pipeline = self.pipeline;
        let queue_job = every("queue_pipeline", self.pipeline_every, move || {
            let pipeline = pipeline.clone();
            async move {
                pipeline.run_cycle().await;
            }
        });

        let reconciler = self.reconciler;
        let reconcile_job = every("reconciliation", self.reconcile_every, move || {
            let reconciler = reconciler.clone();
            async move {
                if let Err(e) = reconciler.run_cycle().await {
                    tracing::error!(error = %e, "could not load pending invoices");
                }
            }
        });

        SchedulerHandle {
            tasks: vec![queue_job, reconcile_job],
        }
    }
}
