//! Fire-and-forget post-commit notification hook.
//!
//! Grounded on the reference server's `queue/traits.rs` trait-based queue
//! abstraction, simplified down to SPEC_FULL.md §4.8's contract: a
//! notification fires after commit, is never retried, and never blocks the
//! request that triggered it. `notify` is a plain synchronous call rather
//! than an awaited future for exactly that reason — a real sink (webhook,
//! message bus) that needs to do I/O is expected to spawn its own task.

use crate::models::{ResourceOperation, ResourceResult};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct NotifyEvent {
    pub resource_type: String,
    pub id: String,
    pub version_id: Option<i32>,
    pub action: &'static str,
}

impl NotifyEvent {
    pub fn for_result(result: &ResourceResult) -> Self {
        let action = match result.operation {
            ResourceOperation::Created => "create",
            ResourceOperation::Updated => "update",
            ResourceOperation::AlreadyExists => "noop",
            ResourceOperation::Deleted => "delete",
        };
        Self {
            resource_type: result.resource.resource_type.clone(),
            id: result.resource.id.clone(),
            version_id: Some(result.resource.version_id),
            action,
        }
    }

    pub fn deleted(resource_type: &str, id: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
            version_id: None,
            action: "delete",
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: NotifyEvent);
}

/// Default notifier: logs the event at info level and drops it.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: NotifyEvent) {
        tracing::info!(
            resource_type = %event.resource_type,
            id = %event.id,
            version_id = ?event.version_id,
            action = event.action,
            "resource change notification"
        );
    }
}
