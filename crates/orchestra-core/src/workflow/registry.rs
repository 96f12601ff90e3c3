//! Workflow definition registry.
//!
//! Owns create / update / delete of definitions. Every write is validated
//! before it reaches the repository, so the store never holds a definition
//! the scheduler cannot run.

use std::sync::Arc;

use orchestra_types::config::DeletePolicy;
use orchestra_types::error::WorkflowError;
use orchestra_types::execution::{ExecutionFilter, WorkflowExecution};
use orchestra_types::workflow::{WorkflowDefinition, WorkflowFilter, WorkflowPatch};
use uuid::Uuid;

use super::definition::validate_definition;
use crate::repository::workflow::WorkflowRepository;

/// Result of a delete request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub deleted: bool,
    /// Set when the definition was removed while executions still used it.
    pub warning: Option<String>,
}

/// Validating front end over the definition store.
pub struct WorkflowRegistry<R: WorkflowRepository> {
    repo: Arc<R>,
    delete_policy: DeletePolicy,
}

impl<R: WorkflowRepository> WorkflowRegistry<R> {
    pub fn new(repo: Arc<R>, delete_policy: DeletePolicy) -> Self {
        Self {
            repo,
            delete_policy,
        }
    }

    /// Validate and store a new definition.
    ///
    /// A nil id is replaced with a fresh UUIDv7. An id that already exists
    /// is a conflict.
    pub async fn create(&self, mut def: WorkflowDefinition) -> Result<WorkflowDefinition, WorkflowError> {
        if def.id.is_nil() {
            def.id = Uuid::now_v7();
        } else if self.repo.get_definition(&def.id).await?.is_some() {
            return Err(WorkflowError::Conflict(format!(
                "workflow {} already exists",
                def.id
            )));
        }

        validate_definition(&def)?;
        self.repo.save_definition(&def).await?;

        tracing::info!(workflow_id = %def.id, name = %def.name, version = %def.version, "workflow created");
        Ok(def)
    }

    /// Apply a patch and store the result.
    ///
    /// The patch version is bumped unless the patch sets `version`. Running
    /// executions keep the snapshot they started with.
    pub async fn update(&self, id: &Uuid, patch: WorkflowPatch) -> Result<WorkflowDefinition, WorkflowError> {
        let mut def = self.get(id).await?;
        let explicit_version = patch.version.is_some();
        apply_patch(&mut def, patch);

        if !explicit_version {
            def.version = bump_patch(&def.version)?;
        }

        validate_definition(&def)?;
        self.repo.save_definition(&def).await?;

        tracing::info!(workflow_id = %def.id, version = %def.version, "workflow updated");
        Ok(def)
    }

    /// Delete a definition, consulting the delete policy when executions are
    /// still active.
    pub async fn delete(&self, id: &Uuid) -> Result<DeleteOutcome, WorkflowError> {
        let active = self.active_executions(id).await?;

        let warning = if active.is_empty() {
            None
        } else {
            let message = format!(
                "workflow {id} is referenced by {} active execution(s)",
                active.len()
            );
            match self.delete_policy {
                DeletePolicy::Block => return Err(WorkflowError::Conflict(message)),
                DeletePolicy::AllowWithWarning => {
                    tracing::warn!(workflow_id = %id, active = active.len(), "deleting workflow with active executions");
                    Some(message)
                }
            }
        };

        let deleted = self.repo.delete_definition(id).await?;
        if !deleted {
            return Err(WorkflowError::WorkflowNotFound(*id));
        }
        tracing::info!(workflow_id = %id, "workflow deleted");
        Ok(DeleteOutcome { deleted, warning })
    }

    pub async fn get(&self, id: &Uuid) -> Result<WorkflowDefinition, WorkflowError> {
        self.repo
            .get_definition(id)
            .await?
            .ok_or(WorkflowError::WorkflowNotFound(*id))
    }

    pub async fn list(&self, filter: &WorkflowFilter) -> Result<Vec<WorkflowDefinition>, WorkflowError> {
        Ok(self.repo.list_definitions(filter).await?)
    }

    /// Number of stored definitions.
    pub async fn count(&self) -> Result<u64, WorkflowError> {
        Ok(self.repo.list_definitions(&WorkflowFilter::default()).await?.len() as u64)
    }

    async fn active_executions(&self, id: &Uuid) -> Result<Vec<WorkflowExecution>, WorkflowError> {
        let filter = ExecutionFilter {
            workflow_id: Some(*id),
            ..ExecutionFilter::default()
        };
        let executions = self.repo.list_executions(&filter).await?;
        Ok(executions
            .into_iter()
            .filter(|e| !e.status.is_terminal())
            .collect())
    }
}

fn apply_patch(def: &mut WorkflowDefinition, patch: WorkflowPatch) {
    if let Some(name) = patch.name {
        def.name = name;
    }
    if let Some(description) = patch.description {
        def.description = Some(description);
    }
    if let Some(version) = patch.version {
        def.version = version;
    }
    if let Some(strategy) = patch.strategy {
        def.strategy = strategy;
    }
    if let Some(steps) = patch.steps {
        def.steps = steps;
    }
    if let Some(triggers) = patch.triggers {
        def.triggers = triggers;
    }
    if let Some(error_handling) = patch.error_handling {
        def.error_handling = error_handling;
    }
    if let Some(max_retries) = patch.max_retries {
        def.max_retries = max_retries;
    }
    if let Some(timeout_ms) = patch.timeout_ms {
        def.timeout_ms = Some(timeout_ms);
    }
    if let Some(concurrency) = patch.concurrency {
        def.concurrency = Some(concurrency);
    }
    if let Some(compliance) = patch.compliance {
        def.compliance = compliance;
    }
    if let Some(metadata) = patch.metadata {
        def.metadata = metadata;
    }
}

fn bump_patch(version: &str) -> Result<String, WorkflowError> {
    let mut parsed = semver::Version::parse(version)
        .map_err(|e| WorkflowError::field("version", format!("'{version}' is not semver: {e}")))?;
    parsed.patch += 1;
    parsed.pre = semver::Prerelease::EMPTY;
    parsed.build = semver::BuildMetadata::EMPTY;
    Ok(parsed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::testing::MemoryRepo;
    use crate::workflow::definition::parse_workflow_yaml;
    use chrono::Utc;
    use orchestra_types::execution::{
        ExecutionMetrics, ExecutionStatus, OrchestrationContext, WorkflowExecution,
    };
    use orchestra_types::workflow::ExecutionStrategy;

    const PIPELINE: &str = r#"
name: pipeline
steps:
  - id: fetch
    config:
      type: agent
      agent: fetcher
  - id: store
    depends_on: [fetch]
    config:
      type: agent
      agent: writer
"#;

    fn registry(policy: DeletePolicy) -> (Arc<MemoryRepo>, WorkflowRegistry<MemoryRepo>) {
        let repo = Arc::new(MemoryRepo::default());
        (Arc::clone(&repo), WorkflowRegistry::new(repo, policy))
    }

    fn pipeline() -> WorkflowDefinition {
        parse_workflow_yaml(PIPELINE).unwrap()
    }

    fn running_execution(workflow_id: Uuid) -> WorkflowExecution {
        WorkflowExecution {
            id: Uuid::now_v7(),
            workflow_id,
            workflow_version: "1.0.0".into(),
            status: ExecutionStatus::Running,
            input: serde_json::Value::Null,
            output: None,
            context: OrchestrationContext::default(),
            steps: vec![],
            current_step: None,
            metrics: ExecutionMetrics::default(),
            events: vec![],
            error: None,
            correlation_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn create_assigns_id_and_rejects_duplicates() {
        let (_, registry) = registry(DeletePolicy::Block);
        let created = registry.create(pipeline()).await.unwrap();
        assert!(!created.id.is_nil());

        let err = registry.create(created.clone()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict(_)));
        assert_eq!(registry.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn create_rejects_cycle_without_storing() {
        let (_, registry) = registry(DeletePolicy::Block);
        let def: WorkflowDefinition = serde_yaml_ng::from_str(
            r#"
name: tangled
steps:
  - id: fan
    config: { type: parallel, steps: [store] }
  - id: fetch
    depends_on: [fan]
    config: { type: agent, agent: fetcher }
  - id: store
    depends_on: [fetch]
    config: { type: agent, agent: writer }
"#,
        )
        .unwrap();

        let err = registry.create(def).await.unwrap_err();
        match err {
            WorkflowError::DependencyCycle { cycle } => {
                assert!(cycle.contains(&"fetch".to_string()));
                assert!(cycle.contains(&"store".to_string()));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
        assert_eq!(registry.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn create_rejects_forward_reference_without_storing() {
        let (_, registry) = registry(DeletePolicy::Block);
        let mut def = pipeline();
        def.steps[0].depends_on = vec!["store".into()];

        let err = registry.create(def).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Validation { .. }));
        assert_eq!(registry.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn update_bumps_patch_version() {
        let (_, registry) = registry(DeletePolicy::Block);
        let created = registry.create(pipeline()).await.unwrap();

        let updated = registry
            .update(
                &created.id,
                WorkflowPatch {
                    strategy: Some(ExecutionStrategy::Parallel),
                    ..WorkflowPatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.version, "1.0.1");
        assert_eq!(updated.strategy, ExecutionStrategy::Parallel);

        let explicit = registry
            .update(
                &created.id,
                WorkflowPatch {
                    version: Some("2.0.0".into()),
                    ..WorkflowPatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(explicit.version, "2.0.0");
    }

    #[tokio::test]
    async fn invalid_update_leaves_stored_definition_untouched() {
        let (_, registry) = registry(DeletePolicy::Block);
        let created = registry.create(pipeline()).await.unwrap();

        let mut steps = created.steps.clone();
        steps[1].depends_on = vec!["ghost".into()];
        let err = registry
            .update(
                &created.id,
                WorkflowPatch {
                    steps: Some(steps),
                    ..WorkflowPatch::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let stored = registry.get(&created.id).await.unwrap();
        assert_eq!(stored, created);
    }

    #[tokio::test]
    async fn delete_blocked_by_active_execution() {
        let (repo, registry) = registry(DeletePolicy::Block);
        let created = registry.create(pipeline()).await.unwrap();
        repo.insert_execution(running_execution(created.id));

        let err = registry.delete(&created.id).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict(_)));
        assert!(registry.get(&created.id).await.is_ok());
    }

    #[tokio::test]
    async fn delete_allowed_with_warning() {
        let (repo, registry) = registry(DeletePolicy::AllowWithWarning);
        let created = registry.create(pipeline()).await.unwrap();
        repo.insert_execution(running_execution(created.id));

        let outcome = registry.delete(&created.id).await.unwrap();
        assert!(outcome.deleted);
        assert!(outcome.warning.is_some());
        assert!(matches!(
            registry.get(&created.id).await,
            Err(WorkflowError::WorkflowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_unknown_is_not_found() {
        let (_, registry) = registry(DeletePolicy::Block);
        let err = registry.delete(&Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::WorkflowNotFound(_)));
    }

    #[test]
    fn bump_patch_drops_prerelease() {
        assert_eq!(bump_patch("1.2.3").unwrap(), "1.2.4");
        assert_eq!(bump_patch("1.2.3-beta.1").unwrap(), "1.2.4");
        assert!(bump_patch("one").is_err());
    }
}
