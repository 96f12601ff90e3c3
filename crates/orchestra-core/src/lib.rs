//! Workflow engine logic and repository trait definitions for Orchestra.
//!
//! This crate defines the "ports" (repository, agent invocation, expression
//! evaluation) that adapters implement, and the engine built on top of them:
//! registry, scheduler, execution coordinator, event emitter, and health
//! aggregator. It depends only on `orchestra-types` -- never on
//! `orchestra-infra` or any storage crate.

pub mod engine;
pub mod event;
pub mod health;
pub mod repository;
pub mod workflow;
