//! Audit Sink
//!
//! Append-only record of every state-changing control-plane action.
//! - Every destructive action is logged with before/after state
//! - Failed attempts are logged too, with the error
//! - Writes are synced before `append` returns
//!
//! Services write to the sink but never read it back for decisions.

mod log;

pub use log::{AuditOutcome, AuditRecord, AuditSink, FileAuditLog, MemoryAuditLog};

/// Append a record, logging instead of failing when the sink is unavailable.
///
/// A broken audit sink must not turn a completed failover or rotation into
/// an error for the caller.
pub fn record(sink: &dyn AuditSink, record: AuditRecord) {
    if let Err(err) = sink.append(&record) {
        tracing::error!(
            action = %record.action,
            entity_type = %record.entity_type,
            entity_id = %record.entity_id,
            error = %err,
            "audit append failed"
        );
    }
}
