//! The Logger port, implemented over `tracing` the way the teacher's
//! modules log directly through `tracing::{info, warn, ...}`. Wrapping it
//! behind a trait lets the core stay decoupled from any particular
//! subscriber setup and keeps test doubles cheap.

use std::collections::HashMap;

pub trait Logger: Send + Sync {
    fn debug(&self, message: &str, context: &HashMap<String, String>);
    fn info(&self, message: &str, context: &HashMap<String, String>);
    fn warn(&self, message: &str, context: &HashMap<String, String>);
    fn error(&self, message: &str, context: &HashMap<String, String>);
}

/// A `Logger` backed by the global `tracing` subscriber.
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn debug(&self, message: &str, context: &HashMap<String, String>) {
        tracing::debug!(?context, "{message}");
    }

    fn info(&self, message: &str, context: &HashMap<String, String>) {
        tracing::info!(?context, "{message}");
    }

    fn warn(&self, message: &str, context: &HashMap<String, String>) {
        tracing::warn!(?context, "{message}");
    }

    fn error(&self, message: &str, context: &HashMap<String, String>) {
        tracing::error!(?context, "{message}");
    }
}
