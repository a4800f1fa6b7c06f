//! Observability scaffolding for the chatwire workspace.

pub mod tracing_setup;
