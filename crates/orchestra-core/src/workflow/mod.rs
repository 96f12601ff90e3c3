//! Workflow engine core: definitions, scheduling, and execution.
//!
//! - `definition` -- YAML parsing and structural validation
//! - `dag` -- dependency graph, cycle detection, container ownership
//! - `registry` -- validating create / update / delete of definitions
//! - `scheduler` -- which steps may move next, per strategy
//! - `retry` -- retry and backoff policy evaluation
//! - `context` -- evaluation context and input templates
//! - `expression` -- JEXL evaluator for conditions and guards
//! - `invoker` -- agent invocation port
//! - `coordinator` -- execution lifecycle and control operations
//! - `run` / `step_runner` -- the per-execution loop and single attempts

pub mod context;
pub mod coordinator;
pub mod dag;
pub mod definition;
pub mod expression;
pub mod invoker;
pub mod registry;
pub mod retry;
mod run;
pub mod scheduler;
mod step_runner;
