//! In-memory workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `orchestra-core` on concurrent maps.
//! Records are stored as JSON blobs, so every read is a detached copy and
//! anything that cannot round-trip through serde is caught at write time.

use dashmap::DashMap;
use orchestra_core::repository::workflow::WorkflowRepository;
use orchestra_types::error::RepositoryError;
use orchestra_types::execution::{ExecutionFilter, WorkflowExecution};
use orchestra_types::workflow::{WorkflowDefinition, WorkflowFilter};
use uuid::Uuid;

/// Process-local implementation of `WorkflowRepository`.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowRepository {
    definitions: DashMap<Uuid, String>,
    executions: DashMap<Uuid, String>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn definition_count(&self) -> usize {
        self.definitions.len()
    }

    pub fn execution_count(&self) -> usize {
        self.executions.len()
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn encode<T: serde::Serialize>(kind: &str, value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|e| RepositoryError::Query(format!("failed to encode {kind}: {e}")))
}

fn decode_definition(blob: &str) -> Result<WorkflowDefinition, RepositoryError> {
    serde_json::from_str(blob)
        .map_err(|e| RepositoryError::Query(format!("invalid workflow definition JSON: {e}")))
}

fn decode_execution(blob: &str) -> Result<WorkflowExecution, RepositoryError> {
    serde_json::from_str(blob)
        .map_err(|e| RepositoryError::Query(format!("invalid workflow execution JSON: {e}")))
}

fn page<T>(items: Vec<T>, offset: usize, limit: Option<usize>) -> Vec<T> {
    items
        .into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let blob = encode("workflow definition", def)?;
        self.definitions.insert(def.id, blob);
        Ok(())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        self.definitions
            .get(id)
            .map(|blob| decode_definition(blob.value()))
            .transpose()
    }

    async fn list_definitions(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut defs = Vec::new();
        for entry in self.definitions.iter() {
            let def = decode_definition(entry.value())?;
            if filter.matches(&def) {
                defs.push(def);
            }
        }
        defs.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(page(defs, filter.offset, filter.limit))
    }

    async fn delete_definition(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.definitions.remove(id).is_some())
    }

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        let blob = encode("workflow execution", execution)?;
        self.executions.insert(execution.id, blob);
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<WorkflowExecution>, RepositoryError> {
        self.executions
            .get(id)
            .map(|blob| decode_execution(blob.value()))
            .transpose()
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let mut execs = Vec::new();
        for entry in self.executions.iter() {
            let exec = decode_execution(entry.value())?;
            if filter.matches(&exec) {
                execs.push(exec);
            }
        }
        execs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(page(execs, filter.offset, filter.limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use orchestra_core::workflow::definition::parse_workflow_yaml;
    use orchestra_types::execution::{ExecutionMetrics, ExecutionStatus, OrchestrationContext};
    use orchestra_types::workflow::ExecutionStrategy;

    fn definition(name: &str, strategy: &str) -> WorkflowDefinition {
        let mut def = parse_workflow_yaml(&format!(
            r#"
name: {name}
strategy: {strategy}
steps:
  - id: only
    config:
      type: delay
      duration_ms: 10
"#
        ))
        .unwrap();
        def.id = Uuid::now_v7();
        def
    }

    fn execution(workflow_id: Uuid, status: ExecutionStatus, age_secs: i64) -> WorkflowExecution {
        WorkflowExecution {
            id: Uuid::now_v7(),
            workflow_id,
            workflow_version: "1.0.0".into(),
            status,
            input: serde_json::json!({ "n": age_secs }),
            output: None,
            context: OrchestrationContext::default(),
            steps: vec![],
            current_step: None,
            metrics: ExecutionMetrics::default(),
            events: vec![],
            error: None,
            correlation_id: None,
            created_at: Utc::now() - Duration::seconds(age_secs),
            started_at: None,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn definition_crud() {
        let repo = InMemoryWorkflowRepository::new();
        let mut def = definition("alpha", "sequential");
        repo.save_definition(&def).await.unwrap();

        let loaded = repo.get_definition(&def.id).await.unwrap().unwrap();
        assert_eq!(loaded, def);

        def.description = Some("updated".into());
        repo.save_definition(&def).await.unwrap();
        assert_eq!(repo.definition_count(), 1);
        assert_eq!(
            repo.get_definition(&def.id).await.unwrap().unwrap().description.as_deref(),
            Some("updated")
        );

        assert!(repo.delete_definition(&def.id).await.unwrap());
        assert!(!repo.delete_definition(&def.id).await.unwrap());
        assert!(repo.get_definition(&def.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_definitions_filters_sorts_and_pages() {
        let repo = InMemoryWorkflowRepository::new();
        for (name, strategy) in [("charlie", "parallel"), ("alpha", "parallel"), ("bravo", "sequential")] {
            repo.save_definition(&definition(name, strategy)).await.unwrap();
        }

        let parallel = repo
            .list_definitions(&WorkflowFilter {
                strategy: Some(ExecutionStrategy::Parallel),
                ..WorkflowFilter::default()
            })
            .await
            .unwrap();
        let names: Vec<_> = parallel.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "charlie"]);

        let second = repo
            .list_definitions(&WorkflowFilter {
                offset: 1,
                limit: Some(1),
                ..WorkflowFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(second[0].name, "bravo");
    }

    #[tokio::test]
    async fn list_executions_newest_first_with_filter() {
        let repo = InMemoryWorkflowRepository::new();
        let workflow_id = Uuid::now_v7();
        let old = execution(workflow_id, ExecutionStatus::Completed, 30);
        let new = execution(workflow_id, ExecutionStatus::Running, 1);
        let other = execution(Uuid::now_v7(), ExecutionStatus::Running, 5);
        for exec in [&old, &new, &other] {
            repo.save_execution(exec).await.unwrap();
        }

        let mine = repo
            .list_executions(&ExecutionFilter {
                workflow_id: Some(workflow_id),
                ..ExecutionFilter::default()
            })
            .await
            .unwrap();
        let ids: Vec<_> = mine.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![new.id, old.id]);

        let running = repo
            .list_executions(&ExecutionFilter {
                status: Some(ExecutionStatus::Running),
                ..ExecutionFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(running.len(), 2);
    }

    #[tokio::test]
    async fn reads_are_detached_copies() {
        let repo = InMemoryWorkflowRepository::new();
        let exec = execution(Uuid::now_v7(), ExecutionStatus::Running, 0);
        repo.save_execution(&exec).await.unwrap();

        let mut copy = repo.get_execution(&exec.id).await.unwrap().unwrap();
        copy.status = ExecutionStatus::Failed;

        let stored = repo.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Running);
        assert_eq!(repo.execution_count(), 1);
    }
}
