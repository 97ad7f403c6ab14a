//! Event sinks for run observability.
//!
//! The engine emits a [`crate::core::RunEvent`] on every state transition,
//! deploy attempt and gate decision.

mod channel;
mod sink;

pub use channel::ChannelEventSink;
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
