//! Shared domain types for Orchestra.
//!
//! Workflow definitions, execution records, events, audit entries, engine
//! configuration, health reporting, and the error taxonomy shared by every
//! other crate in the workspace.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, semver, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod health;
pub mod workflow;
