//! Minimal in-process repository for engine unit tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use orchestra_types::error::RepositoryError;
use orchestra_types::execution::{ExecutionFilter, WorkflowExecution};
use orchestra_types::workflow::{WorkflowDefinition, WorkflowFilter};
use uuid::Uuid;

use super::workflow::WorkflowRepository;

#[derive(Default)]
pub(crate) struct MemoryRepo {
    definitions: Mutex<HashMap<Uuid, WorkflowDefinition>>,
    executions: Mutex<HashMap<Uuid, WorkflowExecution>>,
    /// When set, every execution write fails.
    pub fail_writes: AtomicBool,
}

impl MemoryRepo {
    pub fn execution_count(&self) -> usize {
        self.executions.lock().unwrap().len()
    }

    pub fn insert_execution(&self, execution: WorkflowExecution) {
        self.executions.lock().unwrap().insert(execution.id, execution);
    }
}

impl WorkflowRepository for MemoryRepo {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        self.definitions.lock().unwrap().insert(def.id, def.clone());
        Ok(())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.definitions.lock().unwrap().get(id).cloned())
    }

    async fn list_definitions(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut defs: Vec<_> = self
            .definitions
            .lock()
            .unwrap()
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(defs
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn delete_definition(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.definitions.lock().unwrap().remove(id).is_some())
    }

    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(RepositoryError::Connection("store offline".into()));
        }
        self.insert_execution(execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<WorkflowExecution>, RepositoryError> {
        Ok(self.executions.lock().unwrap().get(id).cloned())
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let mut execs: Vec<_> = self
            .executions
            .lock()
            .unwrap()
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        execs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(execs
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect())
    }
}
