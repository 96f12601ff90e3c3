//! Workflow repository trait definition.
//!
//! Defines the storage interface for workflow definitions and execution
//! records. The infrastructure layer (orchestra-infra) implements this trait;
//! the engine assumes plain create/read/update semantics and serializes its
//! own writes per execution.

use orchestra_types::error::RepositoryError;
use orchestra_types::execution::{ExecutionFilter, WorkflowExecution};
use orchestra_types::workflow::{WorkflowDefinition, WorkflowFilter};
use uuid::Uuid;

/// Repository trait for workflow persistence.
///
/// Covers two entity families:
/// - **Definitions:** CRUD for validated workflow definitions.
/// - **Executions:** upsert and query of execution records, including their
///   step records and event logs.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Upsert a workflow definition (insert or replace by id).
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow definition by its UUID.
    fn get_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// List workflow definitions matching the filter, ordered by name.
    fn list_definitions(
        &self,
        filter: &WorkflowFilter,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    /// Delete a workflow definition by id. Returns `true` if it existed.
    fn delete_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Upsert an execution record (insert or replace by id).
    fn save_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get an execution by its UUID.
    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowExecution>, RepositoryError>> + Send;

    /// List executions matching the filter, newest first.
    fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowExecution>, RepositoryError>> + Send;
}
