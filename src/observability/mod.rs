// Observability infrastructure using tracing crate
// Structured logging for session decisions without blocking the event loop

use anyhow::Result;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Default filter when RUST_LOG is not set
pub const DEFAULT_FILTER: &str = "session_gate=info";

/// Initialize the observability system
/// Sets up structured logging to stdout with JSON formatting for machine parsing
pub fn init() -> Result<()> {
    init_with_filter(DEFAULT_FILTER)
}

/// Initialize with an explicit fallback filter, still overridable by RUST_LOG
pub fn init_with_filter(fallback: &str) -> Result<()> {
    let fmt_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_span_events(FmtSpan::CLOSE);

    // Example: RUST_LOG=session_gate=debug
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))?;

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}

/// Create a span for one Reconciler operation
/// The correlation id ties together the remote calls made on its behalf
#[inline]
pub fn auth_span(operation: &str, identity: Option<&str>) -> tracing::Span {
    tracing::info_span!(
        "auth",
        operation = operation,
        identity = identity.unwrap_or("-"),
        correlation_id = %uuid::Uuid::new_v4(),
    )
}

/// Record the outcome of a gate decision
#[inline]
pub fn record_gate_decision(path: &str, decision: &str) {
    tracing::debug!(path = path, decision = decision, "gate decision");
}
