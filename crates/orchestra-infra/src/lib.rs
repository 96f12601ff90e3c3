//! Infrastructure layer for Orchestra.
//!
//! Contains implementations of the ports defined in `orchestra-core`: an
//! in-memory repository, the `config.toml` loader, and workflow file
//! discovery on disk.

pub mod config;
pub mod repository;
pub mod workflow;
