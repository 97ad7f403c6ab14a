//! Observability utilities.

mod telemetry;

pub use telemetry::{init_tracing, run_span, LogFormat, SpanTimer};
