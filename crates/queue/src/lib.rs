//! Queue-driven dispatch engine: broker consumption, the guarded batch
//! pipeline, provider fallback, reconciliation and the timers driving them.

pub mod audit;
pub mod broker;
mod dispatcher;
mod error;
mod guard;
mod pipeline;
mod reconcile;
mod scheduler;

pub use audit::{AuditEvent, JsonlAuditSink, MemoryAuditSink};
pub use broker::{Acknowledger, BrokerConnection, BrokerError, BrokerSettings, InboundMessage};
pub use dispatcher::Dispatcher;
pub use error::{disposition_of, DispatchError, Disposition, TaskError};
pub use guard::{FlightPermit, SingleFlightGuard};
pub use pipeline::{CycleReport, PipelineSettings, QueuePipeline, TaskHandler};
pub use reconcile::{group_invoices, ReconcileReport, ReconciliationEngine};
pub use scheduler::{Scheduler, SchedulerHandle};
