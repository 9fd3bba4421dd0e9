//! Plan executor: bounded concurrent apply.
//!
//! The executor runs a plan through a worker pool. Actions whose
//! dependencies have all completed are ready; completing an action unblocks
//! its dependents. A failed action skips its whole dependent subtree while
//! independent branches keep going; a fatal provider error additionally
//! stops new launches while in-flight work runs to completion.

use serde::Serialize;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{ApplyError, GraphError, ProviderError, Result, StrataError, TemplateError};
use crate::provider::{with_retries, DesiredResource, ProviderApi, DEFAULT_MAX_ATTEMPTS};
use crate::state::{ResourceState, ResourceStatus, StackState};
use crate::template::{
    interpolate, Placeholder, ProjectSpec, ResourceKind, ResourceSpec, SpecHasher, TemplateSet,
};

use super::plan::{ActionType, ApplyPlan, PlannedAction};

/// Executor for apply plans.
pub struct PlanExecutor {
    /// Provider API handle.
    provider: Arc<dyn ProviderApi>,
    /// Maximum number of concurrently running actions.
    concurrency: usize,
    /// Per-action provider call timeout.
    apply_timeout: Duration,
    /// Retry attempts per provider call.
    max_attempts: u32,
}

/// Result of executing a single action.
#[derive(Debug, Clone)]
pub struct ActionResult {
    /// Action index within the plan.
    pub index: usize,
    /// Resource address.
    pub address: String,
    /// Operation that was attempted.
    pub operation: ActionType,
    /// Whether the action succeeded.
    pub success: bool,
    /// True when the action never ran because a dependency failed or the
    /// run was halted.
    pub skipped: bool,
    /// Provider-assigned identifier, when known.
    pub provider_id: Option<String>,
    /// Error message (if failed).
    pub error: Option<String>,
    /// Stable error kind (if failed).
    pub error_kind: Option<String>,
}

/// Result of executing the entire plan.
#[derive(Debug)]
pub struct ExecutionResult {
    /// Individual action results, indexed like the plan.
    pub results: Vec<ActionResult>,
    /// Number of successful actions.
    pub successful: usize,
    /// Number of failed actions (excluding skips).
    pub failed: usize,
    /// Number of skipped actions.
    pub skipped: usize,
    /// Number of mutating provider calls issued.
    pub mutations: usize,
    /// Whether the entire plan succeeded.
    pub success: bool,
}

/// One entry in the structured failure list reported on exit.
#[derive(Debug, Clone, Serialize)]
pub struct FailureEntry {
    /// Resource address.
    pub resource: String,
    /// Operation that was attempted.
    pub operation: String,
    /// Stable error kind.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

/// Output of one worker task.
enum TaskOutput {
    /// Create-or-update result.
    Applied(crate::provider::RemoteResource),
    /// Delete completed (or the object was already gone).
    Deleted,
    /// Existing-resource lookup result.
    Resolved(crate::provider::RemoteResource),
}

/// Work shipped to a worker task.
enum TaskKind {
    Put(DesiredResource),
    Delete { address: String, provider_id: String },
    Lookup { address: String, lookup_id: String },
}

/// Coordinator bookkeeping: in-degrees, ready queue, per-action results.
struct Scheduler {
    dependents: Vec<Vec<usize>>,
    in_degree: Vec<usize>,
    ready: BinaryHeap<Reverse<usize>>,
    results: Vec<Option<ActionResult>>,
}

impl Scheduler {
    fn new(plan: &ApplyPlan) -> Self {
        let n = plan.actions.len();
        let mut dependents = vec![Vec::new(); n];
        let mut in_degree = vec![0usize; n];
        for (i, action) in plan.actions.iter().enumerate() {
            for &dep in &action.dependencies {
                dependents[dep].push(i);
                in_degree[i] += 1;
            }
        }

        let ready = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        Self {
            dependents,
            in_degree,
            ready,
            results: (0..n).map(|_| None).collect(),
        }
    }

    /// Records a success and moves newly unblocked dependents to ready.
    fn record_success(&mut self, idx: usize, action: &PlannedAction, provider_id: Option<String>) {
        self.results[idx] = Some(ActionResult {
            index: idx,
            address: action.address.clone(),
            operation: action.action_type,
            success: true,
            skipped: false,
            provider_id,
            error: None,
            error_kind: None,
        });

        for i in 0..self.dependents[idx].len() {
            let dependent = self.dependents[idx][i];
            self.in_degree[dependent] -= 1;
            if self.in_degree[dependent] == 0 {
                self.ready.push(Reverse(dependent));
            }
        }
    }

    /// Records a failure and skips the transitive dependent subtree.
    /// Returns true when the error is fatal for the whole run.
    fn record_failure(&mut self, idx: usize, plan: &ApplyPlan, error: &StrataError) -> bool {
        let action = &plan.actions[idx];
        self.results[idx] = Some(ActionResult {
            index: idx,
            address: action.address.clone(),
            operation: action.action_type,
            success: false,
            skipped: false,
            provider_id: action.provider_id.clone(),
            error: Some(error.to_string()),
            error_kind: Some(error.kind().to_string()),
        });

        // Everything downstream of the failure is unreachable this run.
        let mut queue = VecDeque::from([idx]);
        while let Some(current) = queue.pop_front() {
            for i in 0..self.dependents[current].len() {
                let dependent = self.dependents[current][i];
                if self.results[dependent].is_some() {
                    continue;
                }
                let skipped = &plan.actions[dependent];
                let skip_error = StrataError::Apply(ApplyError::DependencyFailed {
                    address: skipped.address.clone(),
                    dependency: action.address.clone(),
                });
                self.results[dependent] = Some(ActionResult {
                    index: dependent,
                    address: skipped.address.clone(),
                    operation: skipped.action_type,
                    success: false,
                    skipped: true,
                    provider_id: skipped.provider_id.clone(),
                    error: Some(skip_error.to_string()),
                    error_kind: Some(skip_error.kind().to_string()),
                });
                queue.push_back(dependent);
            }
        }

        error.kind() == "provider_fatal"
    }
}

impl PlanExecutor {
    /// Creates a new plan executor.
    #[must_use]
    pub fn new(provider: Arc<dyn ProviderApi>) -> Self {
        Self {
            provider,
            concurrency: 4,
            apply_timeout: Duration::from_secs(120),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Sets the worker pool size.
    #[must_use]
    pub const fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets the per-action provider call timeout.
    #[must_use]
    pub const fn with_apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout = timeout;
        self
    }

    /// Sets the retry attempts per provider call.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Executes a plan, mutating state as actions complete.
    ///
    /// # Errors
    ///
    /// Returns an error only on coordinator failures (a panicked worker);
    /// per-resource failures land in the returned result.
    pub async fn execute(
        &self,
        plan: &ApplyPlan,
        template: &TemplateSet,
        state: &mut StackState,
    ) -> Result<ExecutionResult> {
        info!("Executing plan with {} actions", plan.actions.len());

        if plan.actions.is_empty() {
            return Ok(ExecutionResult {
                results: vec![],
                successful: 0,
                failed: 0,
                skipped: 0,
                mutations: 0,
                success: true,
            });
        }

        let mut scheduler = Scheduler::new(plan);
        let mut resolved = seed_resolved(state);
        let mut running: JoinSet<(usize, Result<TaskOutput>)> = JoinSet::new();
        let mut in_flight = 0usize;
        let mut mutations = 0usize;
        let mut halt_new = false;

        loop {
            while !halt_new && in_flight < self.concurrency {
                let Some(Reverse(idx)) = scheduler.ready.pop() else {
                    break;
                };
                let action = &plan.actions[idx];
                debug!("Starting action {idx}: {}", action.description());

                match action.action_type {
                    ActionType::Noop => {
                        complete_noop(action, state, &mut resolved);
                        scheduler.record_success(idx, action, action.provider_id.clone());
                    }
                    ActionType::Delete => {
                        if let Some(lock_address) = state.lock_for_target(&action.address) {
                            warn!(
                                "Refusing to delete '{}': protected by lock '{lock_address}'",
                                action.address
                            );
                            let err = StrataError::Apply(ApplyError::LockedResource {
                                address: action.address.clone(),
                                lock: lock_address.to_string(),
                            });
                            halt_new |= scheduler.record_failure(idx, plan, &err);
                            continue;
                        }

                        let provider_id = action.provider_id.clone().or_else(|| {
                            state
                                .get_resource(&action.address)
                                .map(|r| r.provider_id.clone())
                        });

                        if let Some(provider_id) = provider_id {
                            mutations += 1;
                            in_flight += 1;
                            self.spawn(
                                &mut running,
                                idx,
                                TaskKind::Delete {
                                    address: action.address.clone(),
                                    provider_id,
                                },
                            );
                        } else {
                            debug!(
                                "No provider id recorded for '{}', treating delete as done",
                                action.address
                            );
                            state.remove_resource(&action.address);
                            scheduler.record_success(idx, action, None);
                        }
                    }
                    ActionType::Resolve => {
                        let lookup_id = action
                            .resource_index
                            .and_then(|ri| template.resources[ri].lookup_id.clone());
                        if let Some(lookup_id) = lookup_id {
                            in_flight += 1;
                            self.spawn(
                                &mut running,
                                idx,
                                TaskKind::Lookup {
                                    address: action.address.clone(),
                                    lookup_id,
                                },
                            );
                        } else {
                            let err = StrataError::internal(format!(
                                "Existing resource '{}' has no lookup id",
                                action.address
                            ));
                            halt_new |= scheduler.record_failure(idx, plan, &err);
                        }
                    }
                    ActionType::Create | ActionType::Update => {
                        let prepared = action
                            .resource_index
                            .map(|ri| &template.resources[ri])
                            .ok_or_else(|| {
                                StrataError::internal(format!(
                                    "Action for '{}' has no resource declaration",
                                    action.address
                                ))
                            })
                            .and_then(|resource| {
                                prepare_desired(resource, action, &template.project, &resolved)
                            });

                        match prepared {
                            Ok(desired) => {
                                mutations += 1;
                                in_flight += 1;
                                self.spawn(&mut running, idx, TaskKind::Put(desired));
                            }
                            Err(e) => {
                                error!("Cannot prepare '{}': {e}", action.address);
                                halt_new |= scheduler.record_failure(idx, plan, &e);
                            }
                        }
                    }
                }
            }

            if in_flight == 0 {
                break;
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            in_flight -= 1;
            let (idx, outcome) = joined
                .map_err(|e| StrataError::internal(format!("Apply worker panicked: {e}")))?;
            let action = &plan.actions[idx];

            match outcome {
                Ok(TaskOutput::Applied(remote)) => {
                    info!("Applied '{}' ({})", action.address, remote.provider_id);
                    record_applied(action, template, &remote, state, &mut resolved);
                    scheduler.record_success(idx, action, Some(remote.provider_id));
                }
                Ok(TaskOutput::Deleted) => {
                    info!("Deleted '{}'", action.address);
                    state.remove_resource(&action.address);
                    scheduler.record_success(idx, action, action.provider_id.clone());
                }
                Ok(TaskOutput::Resolved(remote)) => {
                    debug!("Resolved existing '{}' to {}", action.address, remote.provider_id);
                    record_resolved(action, &remote, state, &mut resolved);
                    scheduler.record_success(idx, action, Some(remote.provider_id));
                }
                Err(e) => {
                    error!("Action failed for '{}': {e}", action.address);
                    let fatal = scheduler.record_failure(idx, plan, &e);
                    if fatal {
                        warn!("Fatal provider error: no new actions will start");
                        halt_new = true;
                    }
                }
            }
        }

        // Anything without a result never launched: the run was halted.
        for (i, slot) in scheduler.results.iter_mut().enumerate() {
            if slot.is_none() {
                let action = &plan.actions[i];
                let err = StrataError::Apply(ApplyError::Aborted {
                    reason: String::from("run halted by a fatal error"),
                });
                *slot = Some(ActionResult {
                    index: i,
                    address: action.address.clone(),
                    operation: action.action_type,
                    success: false,
                    skipped: true,
                    provider_id: action.provider_id.clone(),
                    error: Some(err.to_string()),
                    error_kind: Some(err.kind().to_string()),
                });
            }
        }

        let results: Vec<ActionResult> = scheduler.results.into_iter().flatten().collect();
        let successful = results.iter().filter(|r| r.success).count();
        let skipped = results.iter().filter(|r| r.skipped).count();
        let failed = results.iter().filter(|r| !r.success && !r.skipped).count();

        let execution = ExecutionResult {
            successful,
            failed,
            skipped,
            mutations,
            success: failed == 0 && skipped == 0,
            results,
        };
        info!("{execution}");
        Ok(execution)
    }

    /// Spawns a worker task for one action.
    fn spawn(
        &self,
        running: &mut JoinSet<(usize, Result<TaskOutput>)>,
        idx: usize,
        kind: TaskKind,
    ) {
        let provider = Arc::clone(&self.provider);
        let timeout = self.apply_timeout;
        let attempts = self.max_attempts;

        running.spawn(async move {
            let output = match kind {
                TaskKind::Put(desired) => {
                    let address = desired.address.clone();
                    with_retries(&address, attempts, || {
                        let provider = Arc::clone(&provider);
                        let desired = desired.clone();
                        async move {
                            match tokio::time::timeout(timeout, provider.put(&desired)).await {
                                Ok(result) => result,
                                Err(_) => Err(StrataError::Provider(ProviderError::Timeout {
                                    address: desired.address.clone(),
                                })),
                            }
                        }
                    })
                    .await
                    .map(TaskOutput::Applied)
                }
                TaskKind::Delete {
                    address,
                    provider_id,
                } => {
                    let result = with_retries(&address, attempts, || {
                        let provider = Arc::clone(&provider);
                        let address = address.clone();
                        let provider_id = provider_id.clone();
                        async move {
                            match tokio::time::timeout(
                                timeout,
                                provider.delete(&address, &provider_id),
                            )
                            .await
                            {
                                Ok(result) => result,
                                Err(_) => Err(StrataError::Provider(ProviderError::Timeout {
                                    address: address.clone(),
                                })),
                            }
                        }
                    })
                    .await;

                    match result {
                        Ok(()) => Ok(TaskOutput::Deleted),
                        // Already gone counts as deleted.
                        Err(StrataError::Provider(ProviderError::NotFound { .. })) => {
                            Ok(TaskOutput::Deleted)
                        }
                        Err(e) => Err(e),
                    }
                }
                TaskKind::Lookup { address, lookup_id } => {
                    let found = with_retries(&address, attempts, || {
                        let provider = Arc::clone(&provider);
                        let lookup_id = lookup_id.clone();
                        async move { provider.get_by_id(&lookup_id).await }
                    })
                    .await;

                    match found {
                        Ok(Some(remote)) => Ok(TaskOutput::Resolved(remote)),
                        Ok(None) => Err(StrataError::Provider(ProviderError::NotFound {
                            address,
                        })),
                        Err(e) => Err(e),
                    }
                }
            };
            (idx, output)
        });
    }
}

/// Seeds the reference resolution map from recorded state.
fn seed_resolved(state: &StackState) -> HashMap<String, BTreeMap<String, Value>> {
    let mut resolved = HashMap::with_capacity(state.resources.len());
    for (address, record) in &state.resources {
        let mut attrs = record.attributes.clone();
        attrs.insert(
            String::from("id"),
            Value::String(record.provider_id.clone()),
        );
        resolved.insert(address.clone(), attrs);
    }
    resolved
}

/// Completes a no-change action: converged resources still feed their
/// recorded attributes to dependents, and provider objects that match the
/// declaration without a state record are adopted.
fn complete_noop(
    action: &PlannedAction,
    state: &mut StackState,
    resolved: &mut HashMap<String, BTreeMap<String, Value>>,
) {
    if let Some(record) = state.get_resource_mut(&action.address) {
        record.set_status(ResourceStatus::Applied);
        return;
    }

    if let Some(provider_id) = &action.provider_id {
        let mut record = ResourceState::new(
            &action.address,
            provider_id,
            action.new_hash.as_deref().unwrap_or_default(),
        );
        record.set_status(ResourceStatus::Applied);
        state.set_resource(record);

        resolved
            .entry(action.address.clone())
            .or_default()
            .insert(String::from("id"), Value::String(provider_id.clone()));
    }
}

/// Records an applied resource into state and the resolution map.
fn record_applied(
    action: &PlannedAction,
    template: &TemplateSet,
    remote: &crate::provider::RemoteResource,
    state: &mut StackState,
    resolved: &mut HashMap<String, BTreeMap<String, Value>>,
) {
    let mut attrs = remote.attributes.clone();
    attrs.insert(
        String::from("id"),
        Value::String(remote.provider_id.clone()),
    );
    resolved.insert(action.address.clone(), attrs);

    let new_hash = action.new_hash.clone().unwrap_or_default();
    let mut record = state
        .get_resource(&action.address)
        .cloned()
        .unwrap_or_else(|| ResourceState::new(&action.address, &remote.provider_id, &new_hash));
    record.provider_id.clone_from(&remote.provider_id);
    record.spec_hash = new_hash;
    record.attributes.clone_from(&remote.attributes);
    record.existing = false;
    record.lock_target = action
        .resource_index
        .and_then(|ri| template.resources[ri].target.clone());
    record.set_status(ResourceStatus::Applied);
    state.set_resource(record);
}

/// Records a resolved existing resource into state and the resolution map.
fn record_resolved(
    action: &PlannedAction,
    remote: &crate::provider::RemoteResource,
    state: &mut StackState,
    resolved: &mut HashMap<String, BTreeMap<String, Value>>,
) {
    let mut attrs = remote.attributes.clone();
    attrs.insert(
        String::from("id"),
        Value::String(remote.provider_id.clone()),
    );
    resolved.insert(action.address.clone(), attrs);

    let mut record = ResourceState::new(&action.address, &remote.provider_id, "");
    record.existing = true;
    record.attributes.clone_from(&remote.attributes);
    record.set_status(ResourceStatus::Applied);
    state.set_resource(record);
}

/// Builds the desired-state submission for a create/update action, resolving
/// every reference against already-applied resources.
fn prepare_desired(
    resource: &ResourceSpec,
    action: &PlannedAction,
    project: &ProjectSpec,
    resolved: &HashMap<String, BTreeMap<String, Value>>,
) -> Result<DesiredResource> {
    let address = resource.address();

    let mut properties = serde_json::Map::new();
    for (key, value) in &resource.properties {
        let mut value = value.clone();
        resolve_value(&mut value, resolved, &address)?;
        properties.insert(key.clone(), value);
    }

    // Project-level decoration: location and tags flow onto every resource
    // unless the declaration overrides them.
    if let Some(location) = &project.location
        && !properties.contains_key("location")
    {
        properties.insert(
            String::from("location"),
            Value::String(location.clone()),
        );
    }
    if !project.tags.is_empty() {
        let tags = properties
            .entry(String::from("tags"))
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if let Value::Object(map) = tags {
            for (key, value) in &project.tags {
                map.entry(key.clone())
                    .or_insert_with(|| Value::String(value.clone()));
            }
        }
    }

    let scope = match &resource.scope {
        None => None,
        Some(s) if s.starts_with('/') => Some(s.clone()),
        Some(s) if s.contains("${") => Some(resolve_str(s, resolved, &address)?),
        Some(s) => Some(
            resolved
                .get(s)
                .and_then(|attrs| attrs.get("id"))
                .map(render_attr)
                .ok_or_else(|| {
                    StrataError::Graph(GraphError::UnresolvedReference {
                        from: address.clone(),
                        to: s.clone(),
                    })
                })?,
        ),
    };

    // Role assignments get their identity from what they bind, so re-apply
    // upserts the same assignment instead of duplicating it.
    let name = if resource.kind() == ResourceKind::RoleAssignment {
        let principal = properties
            .get("principal_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let role = properties
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or_default();
        SpecHasher::role_assignment_name(principal, role, scope.as_deref().unwrap_or_default())
    } else {
        resource.name.clone()
    };

    Ok(DesiredResource {
        address,
        resource_type: resource.resource_type.clone(),
        name,
        scope,
        properties: Value::Object(properties),
        spec_hash: action.new_hash.clone().unwrap_or_default(),
    })
}

/// Resolves reference placeholders in a property value tree.
fn resolve_value(
    value: &mut Value,
    resolved: &HashMap<String, BTreeMap<String, Value>>,
    from: &str,
) -> Result<()> {
    match value {
        Value::String(s) => {
            if s.contains("${") {
                *s = resolve_str(s, resolved, from)?;
            }
        }
        Value::Array(items) => {
            for item in items {
                resolve_value(item, resolved, from)?;
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                resolve_value(item, resolved, from)?;
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

/// Resolves reference placeholders inside a string.
fn resolve_str(
    input: &str,
    resolved: &HashMap<String, BTreeMap<String, Value>>,
    from: &str,
) -> Result<String> {
    interpolate(input, |placeholder| match placeholder {
        Placeholder::Resource { address, attribute } => resolved
            .get(address)
            .and_then(|attrs| attrs.get(attribute))
            .map(render_attr),
        Placeholder::Param(_) => None,
    })
    .map_err(|e| {
        let to = match e {
            TemplateError::InvalidReference { placeholder } => placeholder,
            other => other.to_string(),
        };
        StrataError::Graph(GraphError::UnresolvedReference {
            from: from.to_string(),
            to,
        })
    })
}

/// Renders an attribute value for string interpolation.
fn render_attr(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl ExecutionResult {
    /// Returns true if every action succeeded.
    #[must_use]
    pub const fn all_successful(&self) -> bool {
        self.success
    }

    /// Returns the structured failure list for reporting.
    #[must_use]
    pub fn failures(&self) -> Vec<FailureEntry> {
        self.results
            .iter()
            .filter(|r| !r.success)
            .map(|r| FailureEntry {
                resource: r.address.clone(),
                operation: r.operation.to_string(),
                kind: r
                    .error_kind
                    .clone()
                    .unwrap_or_else(|| String::from("unknown")),
                message: r.error.clone().unwrap_or_default(),
            })
            .collect()
    }
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Executed {} actions: {} successful, {} failed, {} skipped ({} provider mutations)",
            self.results.len(),
            self.successful,
            self.failed,
            self.skipped,
            self.mutations
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::DiffEngine;
    use crate::provider::{MockProviderApi, RemoteResource};
    use crate::template::ProjectSpec;
    use serde_json::json;
    use std::sync::Mutex;

    fn project() -> ProjectSpec {
        ProjectSpec {
            name: String::from("test"),
            environment: String::from("dev"),
            location: None,
            apply_timeout_secs: 120,
            concurrency: 4,
            tags: BTreeMap::new(),
        }
    }

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
            properties: BTreeMap::new(),
        }
    }

    fn template(resources: Vec<ResourceSpec>) -> TemplateSet {
        TemplateSet {
            project: project(),
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
            attributes: BTreeMap::new(),
            provisioning_state: Some(String::from("Succeeded")),
        }
    }

    fn plan_for(template_set: &TemplateSet, state: Option<&StackState>) -> ApplyPlan {
        let graph = crate::graph::ResourceGraph::build(&template_set.resources).unwrap();
        let diff = DiffEngine::new().compute(template_set, state, &HashMap::new());
        ApplyPlan::from_diff(&diff, template_set, &graph, state, "hash", vec![]).unwrap()
    }

    #[tokio::test]
    async fn test_apply_respects_dependency_order_and_resolves_references() {
        let storage = resource("storage.account", "main", &[]);
        let mut endpoint = resource("network.private_endpoint", "pe", &[]);
        endpoint.properties.insert(
            String::from("target_id"),
            json!("${storage.account/main:id}"),
        );

        let set = template(vec![endpoint, storage]);
        let plan = plan_for(&set, None);

        let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(vec![]));
        let order_clone = Arc::clone(&order);

        let mut mock = MockProviderApi::new();
        mock.expect_put().times(2).returning(move |desired| {
            order_clone
                .lock()
                .unwrap()
                .push(desired.address.clone());
            if desired.address == "network.private_endpoint/pe" {
                // The reference resolved to the storage account's id.
                assert_eq!(
                    desired.properties["target_id"],
                    json!("/providers/storage.account/main")
                );
            }
            Ok(remote_for(desired))
        });

        let mut state = StackState::new("test", "dev");
        let executor = PlanExecutor::new(Arc::new(mock)).with_concurrency(1);
        let result = executor.execute(&plan, &set, &mut state).await.unwrap();

        assert!(result.success);
        assert_eq!(result.mutations, 2);
        assert_eq!(
            *order.lock().unwrap(),
            vec![
                String::from("storage.account/main"),
                String::from("network.private_endpoint/pe"),
            ]
        );
        assert!(state.get_resource("storage.account/main").is_some());
        assert!(state.get_resource("network.private_endpoint/pe").is_some());
    }

    #[tokio::test]
    async fn test_converged_plan_issues_zero_mutating_calls() {
        let storage = resource("storage.account", "main", &[]);
        let set = template(vec![storage.clone()]);
        let hash = SpecHasher::new().hash_resource(&storage);

        let mut state = StackState::new("test", "dev");
        state.set_resource(ResourceState::new(
            "storage.account/main",
            "/providers/storage.account/main",
            &hash,
        ));

        let observed = HashMap::from([(
            String::from("storage.account/main"),
            RemoteResource {
                provider_id: String::from("/providers/storage.account/main"),
                address: String::from("storage.account/main"),
                spec_hash: Some(hash),
                attributes: BTreeMap::new(),
                provisioning_state: Some(String::from("Succeeded")),
            },
        )]);

        let graph = crate::graph::ResourceGraph::build(&set.resources).unwrap();
        let diff = DiffEngine::new().compute(&set, Some(&state), &observed);
        let plan =
            ApplyPlan::from_diff(&diff, &set, &graph, Some(&state), "hash", vec![]).unwrap();
        assert!(plan.is_converged());

        // No expectations set: any provider call would panic the mock.
        let mock = MockProviderApi::new();
        let executor = PlanExecutor::new(Arc::new(mock));
        let result = executor.execute(&plan, &set, &mut state).await.unwrap();

        assert!(result.success);
        assert_eq!(result.mutations, 0);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_but_siblings_apply() {
        let failing = resource("ai.account", "brain", &[]);
        let dependent = resource("ai.deployment", "model", &["ai.account/brain"]);
        let sibling = resource("storage.account", "main", &[]);

        let set = template(vec![failing, dependent, sibling]);
        let plan = plan_for(&set, None);

        let mut mock = MockProviderApi::new();
        mock.expect_put().times(2).returning(|desired| {
            if desired.address == "ai.account/brain" {
                Err(StrataError::Provider(ProviderError::network(
                    "connection reset",
                )))
            } else {
                Ok(remote_for(desired))
            }
        });

        let mut state = StackState::new("test", "dev");
        let executor = PlanExecutor::new(Arc::new(mock))
            .with_concurrency(1)
            .with_max_attempts(1);
        let result = executor.execute(&plan, &set, &mut state).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.failed, 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.successful, 1);

        let by_address = |addr: &str| {
            result
                .results
                .iter()
                .find(|r| r.address == addr)
                .unwrap()
                .clone()
        };
        assert!(!by_address("ai.account/brain").success);
        assert!(by_address("ai.deployment/model").skipped);
        assert!(by_address("storage.account/main").success);
        assert!(state.get_resource("storage.account/main").is_some());
        assert!(state.get_resource("ai.deployment/model").is_none());
    }

    #[tokio::test]
    async fn test_locked_resource_delete_refused_without_provider_call() {
        let mut state = StackState::new("test", "dev");
        state.set_resource(ResourceState::new("storage.account/main", "id-s", "h1"));
        let mut lock = ResourceState::new("lock.deletion/guard", "id-l", "h2");
        lock.lock_target = Some(String::from("storage.account/main"));
        state.set_resource(lock);

        // A delete plan for the protected target while the lock persists.
        let plan = ApplyPlan {
            created_at: chrono::Utc::now(),
            template_hash: String::from("hash"),
            actions: vec![PlannedAction {
                action_type: ActionType::Delete,
                address: String::from("storage.account/main"),
                resource_index: None,
                provider_id: Some(String::from("id-s")),
                reason: String::from("Removed from template"),
                new_hash: None,
                dependencies: vec![],
            }],
            warnings: vec![],
        };

        // No expectations: a delete call would panic the mock.
        let mock = MockProviderApi::new();
        let set = template(vec![]);
        let executor = PlanExecutor::new(Arc::new(mock));
        let result = executor.execute(&plan, &set, &mut state).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.mutations, 0);
        let failure = &result.failures()[0];
        assert_eq!(failure.kind, "locked_resource");
        assert!(state.get_resource("storage.account/main").is_some());
    }

    #[tokio::test]
    async fn test_lock_delete_unblocks_target_delete() {
        let mut state = StackState::new("test", "dev");
        state.set_resource(ResourceState::new("storage.account/main", "id-s", "h1"));
        let mut lock = ResourceState::new("lock.deletion/guard", "id-l", "h2");
        lock.lock_target = Some(String::from("storage.account/main"));
        state.set_resource(lock);

        let set = template(vec![]);
        let plan = plan_for(&set, Some(&state));
        assert_eq!(plan.count_of(ActionType::Delete), 2);

        let mut mock = MockProviderApi::new();
        mock.expect_delete().times(2).returning(|_, _| Ok(()));

        let executor = PlanExecutor::new(Arc::new(mock)).with_concurrency(1);
        let result = executor.execute(&plan, &set, &mut state).await.unwrap();

        assert!(result.success, "failures: {:?}", result.failures());
        assert!(state.get_resource("storage.account/main").is_none());
        assert!(state.get_resource("lock.deletion/guard").is_none());
    }

    #[tokio::test]
    async fn test_fatal_error_halts_new_launches() {
        let failing = resource("ai.account", "brain", &[]);
        let independent = resource("storage.account", "main", &[]);

        let set = template(vec![failing, independent]);
        let plan = plan_for(&set, None);

        let mut mock = MockProviderApi::new();
        mock.expect_put().times(1).returning(|_| {
            Err(StrataError::Provider(ProviderError::AuthorizationDenied {
                message: String::from("token expired"),
            }))
        });

        let mut state = StackState::new("test", "dev");
        let executor = PlanExecutor::new(Arc::new(mock)).with_concurrency(1);
        let result = executor.execute(&plan, &set, &mut state).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.failed, 1);
        assert_eq!(result.skipped, 1);
        let aborted = result
            .results
            .iter()
            .find(|r| r.address == "storage.account/main")
            .unwrap();
        assert!(aborted.skipped);
    }

    #[tokio::test]
    async fn test_role_assignment_gets_deterministic_name() {
        let mut assignment = resource("authorization.role_assignment", "reader", &[]);
        assignment.scope = Some(String::from("/subscriptions/abc/storage/main"));
        assignment
            .properties
            .insert(String::from("principal_id"), json!("principal-1"));
        assignment
            .properties
            .insert(String::from("role"), json!("StorageBlobDataReader"));

        let set = template(vec![assignment]);
        let plan = plan_for(&set, None);

        let expected = SpecHasher::role_assignment_name(
            "principal-1",
            "StorageBlobDataReader",
            "/subscriptions/abc/storage/main",
        );

        let mut mock = MockProviderApi::new();
        let expected_clone = expected.clone();
        mock.expect_put().times(1).returning(move |desired| {
            assert_eq!(desired.name, expected_clone);
            Ok(remote_for(desired))
        });

        let mut state = StackState::new("test", "dev");
        let executor = PlanExecutor::new(Arc::new(mock));
        let result = executor.execute(&plan, &set, &mut state).await.unwrap();
        assert!(result.success);
    }
}
