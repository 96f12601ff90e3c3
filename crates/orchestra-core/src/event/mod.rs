//! Workflow event fan-out.
//!
//! Provides an `EventEmitter` that records events on the execution log and
//! distributes them to subscribers via per-execution broadcast channels.

pub mod emitter;

pub use emitter::{EventEmitter, EventSubscription};
