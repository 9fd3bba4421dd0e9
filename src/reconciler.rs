//! Reconciler for converging provider state onto the template.
//!
//! This module implements the observe, diff, plan, execute loop: read back
//! what the provider has, compare it with the declarations and recorded
//! state, and apply the difference. Convergence means a re-run plans zero
//! mutations.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::graph::ResourceGraph;
use crate::planner::{
    ActionType, ApplyPlan, DiffEngine, ExecutionResult, FailureEntry, PlanExecutor,
};
use crate::provider::{with_retries, ProviderApi, RemoteResource, DEFAULT_MAX_ATTEMPTS};
use crate::state::{ApplyHistoryEntry, ApplyOperation, StackState, StateStore};
use crate::template::{SpecHasher, TemplateSet};

/// Reconciler for maintaining desired state.
pub struct Reconciler<'a, S: StateStore> {
    /// Resolved template set.
    template: &'a TemplateSet,
    /// State store.
    state_store: &'a S,
    /// Provider API handle.
    provider: Arc<dyn ProviderApi>,
    /// Spec hasher.
    hasher: SpecHasher,
    /// Diff engine.
    diff_engine: DiffEngine,
    /// Validation warnings carried into the plan.
    warnings: Vec<String>,
    /// Maximum convergence attempts.
    max_attempts: u32,
}

/// Result of a convergence run.
#[derive(Debug, Serialize)]
pub struct ConvergenceResult {
    /// Whether the run converged fully.
    pub success: bool,
    /// Whether any mutating provider call was issued.
    pub changed: bool,
    /// Number of resources created.
    pub created: usize,
    /// Number of resources updated.
    pub updated: usize,
    /// Number of resources deleted.
    pub deleted: usize,
    /// Number of resources already converged.
    pub unchanged: usize,
    /// Number of existing resources resolved.
    pub resolved: usize,
    /// Structured failure list.
    pub failures: Vec<FailureEntry>,
    /// Output values after the run.
    pub outputs: BTreeMap<String, String>,
}

impl<'a, S: StateStore> Reconciler<'a, S> {
    /// Creates a new reconciler.
    #[must_use]
    pub fn new(
        template: &'a TemplateSet,
        state_store: &'a S,
        provider: Arc<dyn ProviderApi>,
    ) -> Self {
        Self {
            template,
            state_store,
            provider,
            hasher: SpecHasher::new(),
            diff_engine: DiffEngine::new(),
            warnings: vec![],
            max_attempts: 3,
        }
    }

    /// Sets the maximum convergence attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Attaches validation warnings for plan display.
    #[must_use]
    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    /// Computes the plan for the current template without applying it.
    ///
    /// The dependency graph is validated before any provider call: a cyclic
    /// template never reaches the provider.
    ///
    /// # Errors
    ///
    /// Returns an error on cyclic or unresolvable templates, or if observing
    /// the provider fails outright.
    pub async fn plan(&self) -> Result<(ApplyPlan, StackState)> {
        let graph = ResourceGraph::build(&self.template.resources)?;
        graph.topo_order()?;

        let state = self.load_state().await?;
        let observed = self.observe().await?;
        let diff = self
            .diff_engine
            .compute(self.template, Some(&state), &observed);

        info!(
            "Diff: {} creates, {} updates, {} deletes, {} unchanged, {} resolves",
            diff.creates, diff.updates, diff.deletes, diff.unchanged, diff.resolves
        );

        let template_hash = self.hasher.hash_template(self.template);
        let plan = ApplyPlan::from_diff(
            &diff,
            self.template,
            &graph,
            Some(&state),
            &template_hash,
            self.warnings.clone(),
        )?;

        Ok((plan, state))
    }

    /// Runs the full convergence loop: plan, execute, re-plan on partial
    /// failure, up to the attempt bound.
    ///
    /// # Errors
    ///
    /// Returns an error on planning failures; per-resource apply failures
    /// are reported in the result instead.
    pub async fn converge(&self) -> Result<ConvergenceResult> {
        info!(
            "Reconciling {}/{}",
            self.template.project.name, self.template.project.environment
        );

        let mut last: Option<ExecutionResult> = None;

        for attempt in 1..=self.max_attempts {
            debug!("Convergence attempt {}/{}", attempt, self.max_attempts);

            let (plan, mut state) = self.plan().await?;

            if plan.is_converged() {
                info!("No changes required - state is converged");
                state.template_hash.clone_from(&plan.template_hash);
                let outputs = self.collect_outputs(&mut state);
                self.state_store.save(&state).await?;
                return Ok(Self::converged_result(&plan, outputs, last.as_ref()));
            }

            let execution = self.execute_plan(&plan, &mut state).await?;

            let history = if execution.success {
                ApplyHistoryEntry::new(
                    ApplyOperation::Apply,
                    &plan.template_hash,
                    touched_addresses(&execution),
                )
            } else {
                ApplyHistoryEntry::failed(
                    ApplyOperation::Apply,
                    &plan.template_hash,
                    touched_addresses(&execution),
                    &format!("{} actions failed", execution.failed),
                )
            };
            state.add_history(history);

            if execution.success {
                state.template_hash.clone_from(&plan.template_hash);
                let outputs = self.collect_outputs(&mut state);
                self.state_store.save(&state).await?;
                return Ok(Self::success_result(&execution, outputs));
            }

            error!(
                "Convergence attempt {attempt} left {} failures",
                execution.failed + execution.skipped
            );
            self.state_store.save(&state).await?;
            last = Some(execution);

            if attempt < self.max_attempts {
                warn!("Retrying convergence");
                tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            }
        }

        let execution = last.unwrap_or(ExecutionResult {
            results: vec![],
            successful: 0,
            failed: 0,
            skipped: 0,
            mutations: 0,
            success: false,
        });

        Ok(Self::failure_result(&execution))
    }

    /// Deletes every managed resource recorded in state, locks first.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded or saved.
    pub async fn destroy(&self) -> Result<ConvergenceResult> {
        info!(
            "Destroying {}/{}",
            self.template.project.name, self.template.project.environment
        );

        let mut state = self.load_state().await?;

        // An empty declaration set turns every managed record into a delete.
        let empty = TemplateSet {
            project: self.template.project.clone(),
            parameters: vec![],
            resources: vec![],
            outputs: vec![],
        };
        let graph = ResourceGraph::build(&empty.resources)?;
        let diff = self.diff_engine.compute(&empty, Some(&state), &HashMap::new());
        let template_hash = self.hasher.hash_template(&empty);
        let plan =
            ApplyPlan::from_diff(&diff, &empty, &graph, Some(&state), &template_hash, vec![])?;

        if plan.is_converged() {
            info!("Nothing to destroy");
            self.state_store.save(&state).await?;
            return Ok(Self::converged_result(&plan, BTreeMap::new(), None));
        }

        let execution = self.execute_plan_with(&plan, &empty, &mut state).await?;

        state.add_history(if execution.success {
            ApplyHistoryEntry::new(
                ApplyOperation::Destroy,
                &template_hash,
                touched_addresses(&execution),
            )
        } else {
            ApplyHistoryEntry::failed(
                ApplyOperation::Destroy,
                &template_hash,
                touched_addresses(&execution),
                &format!("{} actions failed", execution.failed),
            )
        });
        state.outputs.clear();
        self.state_store.save(&state).await?;

        Ok(if execution.success {
            Self::success_result(&execution, BTreeMap::new())
        } else {
            Self::failure_result(&execution)
        })
    }

    /// Loads recorded state, starting fresh when none exists.
    async fn load_state(&self) -> Result<StackState> {
        Ok(self.state_store.load().await?.unwrap_or_else(|| {
            StackState::new(
                &self.template.project.name,
                &self.template.project.environment,
            )
        }))
    }

    /// Reads back every declared managed resource from the provider.
    async fn observe(&self) -> Result<HashMap<String, RemoteResource>> {
        let mut observed = HashMap::new();

        for resource in self.template.managed_resources() {
            let address = resource.address();
            let remote = with_retries(&address, DEFAULT_MAX_ATTEMPTS, || {
                let provider = Arc::clone(&self.provider);
                let address = address.clone();
                async move { provider.get(&address).await }
            })
            .await?;

            if let Some(remote) = remote {
                observed.insert(address, remote);
            }
        }

        debug!("Observed {} resources on the provider", observed.len());
        Ok(observed)
    }

    /// Executes a plan against the reconciler's template.
    async fn execute_plan(
        &self,
        plan: &ApplyPlan,
        state: &mut StackState,
    ) -> Result<ExecutionResult> {
        self.execute_plan_with(plan, self.template, state).await
    }

    /// Executes a plan against an explicit template (destroy uses an empty
    /// one).
    async fn execute_plan_with(
        &self,
        plan: &ApplyPlan,
        template: &TemplateSet,
        state: &mut StackState,
    ) -> Result<ExecutionResult> {
        let executor = PlanExecutor::new(Arc::clone(&self.provider))
            .with_concurrency(self.template.project.concurrency)
            .with_apply_timeout(std::time::Duration::from_secs(
                self.template.project.apply_timeout_secs,
            ));
        executor.execute(plan, template, state).await
    }

    /// Collects declared outputs from applied state.
    fn collect_outputs(&self, state: &mut StackState) -> BTreeMap<String, String> {
        let mut outputs = BTreeMap::new();

        for output in &self.template.outputs {
            let value = state.get_resource(&output.resource).and_then(|record| {
                if output.attribute == "id" {
                    Some(record.provider_id.clone())
                } else {
                    record.attributes.get(&output.attribute).map(|v| match v {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                }
            });

            if let Some(value) = value {
                outputs.insert(output.name.clone(), value);
            } else {
                warn!(
                    "Output '{}' could not be resolved from '{}'",
                    output.name, output.resource
                );
            }
        }

        state.outputs.clone_from(&outputs);
        outputs
    }

    /// Builds the result for an already-converged plan.
    fn converged_result(
        plan: &ApplyPlan,
        outputs: BTreeMap<String, String>,
        previous: Option<&ExecutionResult>,
    ) -> ConvergenceResult {
        ConvergenceResult {
            success: true,
            changed: previous.is_some_and(|e| e.mutations > 0),
            created: 0,
            updated: 0,
            deleted: 0,
            unchanged: plan.count_of(ActionType::Noop),
            resolved: plan.count_of(ActionType::Resolve),
            failures: vec![],
            outputs,
        }
    }

    /// Builds the result for a fully successful execution.
    fn success_result(
        execution: &ExecutionResult,
        outputs: BTreeMap<String, String>,
    ) -> ConvergenceResult {
        ConvergenceResult {
            success: true,
            changed: execution.mutations > 0,
            created: count_success(execution, ActionType::Create),
            updated: count_success(execution, ActionType::Update),
            deleted: count_success(execution, ActionType::Delete),
            unchanged: count_success(execution, ActionType::Noop),
            resolved: count_success(execution, ActionType::Resolve),
            failures: vec![],
            outputs,
        }
    }

    /// Builds the result for a failed execution.
    fn failure_result(execution: &ExecutionResult) -> ConvergenceResult {
        ConvergenceResult {
            success: false,
            changed: execution.mutations > 0,
            created: count_success(execution, ActionType::Create),
            updated: count_success(execution, ActionType::Update),
            deleted: count_success(execution, ActionType::Delete),
            unchanged: count_success(execution, ActionType::Noop),
            resolved: count_success(execution, ActionType::Resolve),
            failures: execution.failures(),
            outputs: BTreeMap::new(),
        }
    }
}

/// Counts successful actions of a given type.
fn count_success(execution: &ExecutionResult, action_type: ActionType) -> usize {
    execution
        .results
        .iter()
        .filter(|r| r.success && r.operation == action_type)
        .count()
}

/// Lists the addresses an execution touched, for history entries.
fn touched_addresses(execution: &ExecutionResult) -> Vec<String> {
    execution
        .results
        .iter()
        .map(|r| r.address.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{DesiredResource, MockProviderApi};
    use crate::state::LocalStateStore;
    use crate::template::{OutputSpec, ProjectSpec, ResourceSpec};
    use serde_json::json;
    use std::collections::BTreeMap as Map;
    use tempfile::TempDir;

    fn resource(resource_type: &str, name: &str, depends_on: &[&str]) -> ResourceSpec {
        ResourceSpec {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            scope: None,
            parent: None,
            existing: false,
            lookup_id: None,
            target: None,
            depends_on: depends_on.iter().map(|s| (*s).to_string()).collect(),
            properties: Map::new(),
        }
    }

    fn template(resources: Vec<ResourceSpec>) -> TemplateSet {
        TemplateSet {
            project: ProjectSpec {
                name: String::from("test"),
                environment: String::from("dev"),
                location: None,
                apply_timeout_secs: 120,
                concurrency: 2,
                tags: Map::new(),
            },
            parameters: vec![],
            resources,
            outputs: vec![],
        }
    }

    fn remote_for(desired: &DesiredResource) -> RemoteResource {
        RemoteResource {
            provider_id: format!("/providers/{}", desired.address),
            address: desired.address.clone(),
            spec_hash: Some(desired.spec_hash.clone()),
            attributes: Map::new(),
            provisioning_state: Some(String::from("Succeeded")),
        }
    }

    fn store() -> (LocalStateStore, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        (LocalStateStore::with_base_dir(dir.path()), dir)
    }

    #[tokio::test]
    async fn test_converge_creates_and_records_outputs() {
        let mut set = template(vec![resource("storage.account", "main", &[])]);
        set.outputs.push(OutputSpec {
            name: String::from("storage_id"),
            resource: String::from("storage.account/main"),
            attribute: String::from("id"),
        });

        let mut mock = MockProviderApi::new();
        mock.expect_get().returning(|_| Ok(None));
        mock.expect_put().times(1).returning(|d| Ok(remote_for(d)));

        let (state_store, _dir) = store();
        let reconciler = Reconciler::new(&set, &state_store, Arc::new(mock));
        let result = reconciler.converge().await.unwrap();

        assert!(result.success);
        assert_eq!(result.created, 1);
        assert_eq!(
            result.outputs.get("storage_id").map(String::as_str),
            Some("/providers/storage.account/main")
        );

        let saved = state_store.load().await.unwrap().unwrap();
        assert!(saved.get_resource("storage.account/main").is_some());
    }

    #[tokio::test]
    async fn test_second_converge_is_a_noop() {
        let set = template(vec![resource("storage.account", "main", &[])]);
        let (state_store, _dir) = store();

        // First run creates.
        let mut first = MockProviderApi::new();
        first.expect_get().returning(|_| Ok(None));
        first.expect_put().times(1).returning(|d| Ok(remote_for(d)));
        let result = Reconciler::new(&set, &state_store, Arc::new(first))
            .converge()
            .await
            .unwrap();
        assert!(result.success && result.changed);

        // Second run observes the applied hash and issues no mutation: the
        // mock has no put/delete expectations, so any would panic.
        let expected_hash = SpecHasher::new().hash_resource(&set.resources[0]);
        let mut second = MockProviderApi::new();
        second.expect_get().returning(move |address| {
            Ok(Some(RemoteResource {
                provider_id: format!("/providers/{address}"),
                address: address.to_string(),
                spec_hash: Some(expected_hash.clone()),
                attributes: Map::new(),
                provisioning_state: Some(String::from("Succeeded")),
            }))
        });

        let result = Reconciler::new(&set, &state_store, Arc::new(second))
            .converge()
            .await
            .unwrap();
        assert!(result.success);
        assert!(!result.changed);
        assert_eq!(result.unchanged, 1);
    }

    #[tokio::test]
    async fn test_cyclic_template_never_reaches_provider() {
        let set = template(vec![
            resource("ai.account", "a", &["ai.deployment/b"]),
            resource("ai.deployment", "b", &["ai.account/a"]),
        ]);

        // No expectations: any provider call panics the mock.
        let mock = MockProviderApi::new();
        let (state_store, _dir) = store();
        let reconciler = Reconciler::new(&set, &state_store, Arc::new(mock));

        let result = reconciler.converge().await;
        assert!(matches!(
            result,
            Err(crate::error::StrataError::Graph(
                crate::error::GraphError::CycleDetected { .. }
            ))
        ));
    }

    #[tokio::test]
    async fn test_destroy_deletes_recorded_resources() {
        let set = template(vec![resource("storage.account", "main", &[])]);
        let (state_store, _dir) = store();

        let mut first = MockProviderApi::new();
        first.expect_get().returning(|_| Ok(None));
        first.expect_put().times(1).returning(|d| Ok(remote_for(d)));
        Reconciler::new(&set, &state_store, Arc::new(first))
            .converge()
            .await
            .unwrap();

        let mut second = MockProviderApi::new();
        second.expect_delete().times(1).returning(|_, _| Ok(()));
        let result = Reconciler::new(&set, &state_store, Arc::new(second))
            .destroy()
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.deleted, 1);

        let saved = state_store.load().await.unwrap().unwrap();
        assert!(saved.get_resource("storage.account/main").is_none());
    }

    #[tokio::test]
    async fn test_existing_resource_is_resolved_not_created() {
        let mut subnet = resource("network.subnet", "workload", &[]);
        subnet.existing = true;
        subnet.lookup_id = Some(String::from("/subscriptions/abc/subnets/workload"));

        let mut endpoint = resource("network.private_endpoint", "pe", &[]);
        endpoint.properties.insert(
            String::from("subnet_id"),
            json!("${network.subnet/workload:id}"),
        );

        let set = template(vec![subnet, endpoint]);

        let mut mock = MockProviderApi::new();
        mock.expect_get().returning(|_| Ok(None));
        mock.expect_get_by_id().times(1).returning(|id| {
            Ok(Some(RemoteResource {
                provider_id: id.to_string(),
                address: String::from("network.subnet/workload"),
                spec_hash: None,
                attributes: Map::new(),
                provisioning_state: None,
            }))
        });
        mock.expect_put().times(1).returning(|d| {
            // The endpoint's subnet reference resolved to the lookup id.
            assert_eq!(
                d.properties["subnet_id"],
                json!("/subscriptions/abc/subnets/workload")
            );
            Ok(remote_for(d))
        });

        let (state_store, _dir) = store();
        let result = Reconciler::new(&set, &state_store, Arc::new(mock))
            .converge()
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.created, 1);
        assert_eq!(result.resolved, 1);
    }
}
