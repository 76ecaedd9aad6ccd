//! Post-commit side effects: auto-linking and change notification.

pub mod autolink;
pub mod notify;

pub use notify::{NotifyEvent, Notifier, TracingNotifier};
