mod audit;
mod emit;
mod error;
mod processor;
mod store;
mod worker;

pub use audit::{AuditEvent, AuditLog};
pub use emit::{Caller, EmitRequest, EmitResponse, Emitter};
pub use error::{LedgerError, Result};
pub use processor::{DrainReport, HaltedDelivery, QueueProcessor};
pub use store::{ChainReport, ChainState, InvoiceRecord, LedgerStore, QueueEntry};
pub use worker::{BackoffPolicy, RetryWorker};
