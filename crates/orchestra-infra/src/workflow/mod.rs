//! Workflow files on disk: load, save, and directory discovery.

pub mod loader;
