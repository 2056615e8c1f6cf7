//! Deployment orchestrator.
//!
//! Walks a [`TopologyGraph`] in dependency order. For every stack it
//! resolves the stack's imports against the [`ReferenceRegistry`], hands the
//! stack to the provisioning backend, and publishes the stack's exports from
//! what the backend reported. Destroy walks the reverse order and skips import
//! resolution. A selected deploy pulls in the selection's dependencies; a
//! selected destroy pulls in its dependents instead.
//!
//! Runs are fail-fast: the first failing stack stops the run and stacks that
//! were already deployed stay deployed. Nothing is retried.
//!
//! With `parallelism > 1`, the stacks of one deployment wave (stacks whose
//! dependencies all sit in earlier waves) are provisioned concurrently, at
//! most `parallelism` at a time. Exports of a wave are published in
//! deployment order once the whole batch has finished.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::backend::{ProvisionOutcome, ProvisionRequest, ProvisioningBackend, TeardownRequest};
use crate::error::{CoreError, CoreResult, Phase};
use crate::params::Parameters;
use crate::registry::ReferenceRegistry;
use crate::report::{RunAction, RunReport, StackOutcome};
use crate::scaling::ScalingPolicyBinder;
use crate::stack::{ExportSource, Stack, StackId};
use crate::topology::{ImportIssue, TopologyGraph};

fn default_parallelism() -> usize {
    1
}

/// Options for deploy and destroy runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployOptions {
    /// Maximum number of stacks provisioned at the same time.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Fail before provisioning if an import's producer is not a dependency.
    ///
    /// Always on when `parallelism > 1`.
    #[serde(default)]
    pub strict_imports: bool,
    /// Directory run reports are saved into.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            strict_imports: false,
            log_dir: None,
        }
    }
}

/// Requests cancellation of a run between stacks.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Deploys and destroys stacks through a provisioning backend.
pub struct DeploymentOrchestrator {
    backend: Arc<dyn ProvisioningBackend>,
    registry: ReferenceRegistry,
    policies: ScalingPolicyBinder,
    parameters: Parameters,
    options: DeployOptions,
    cancel: CancelHandle,
}

impl DeploymentOrchestrator {
    /// Create an orchestrator with its own empty registry.
    pub fn new(backend: Arc<dyn ProvisioningBackend>) -> Self {
        Self {
            backend,
            registry: ReferenceRegistry::new(),
            policies: ScalingPolicyBinder::new(),
            parameters: Parameters::new(),
            options: DeployOptions::default(),
            cancel: CancelHandle::default(),
        }
    }

    /// Use a shared registry instead of a private one.
    pub fn with_registry(mut self, registry: ReferenceRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Scaling policies handed to the backend with their stacks.
    pub fn with_policies(mut self, policies: ScalingPolicyBinder) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_options(mut self, options: DeployOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(&self) -> &ReferenceRegistry {
        &self.registry
    }

    pub fn options(&self) -> &DeployOptions {
        &self.options
    }

    /// Handle that cancels the current run before its next stack.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    fn new_report(&self, action: RunAction, selection: Option<&[StackId]>) -> RunReport {
        let report = RunReport::new(action, selection.map(<[StackId]>::to_vec).unwrap_or_default());
        match &self.options.log_dir {
            Some(dir) => report.with_log_dir(dir),
            None => report,
        }
    }

    /// Deploy the whole graph, or the dependency closure of `selection`.
    pub async fn deploy(
        &self,
        graph: &TopologyGraph,
        selection: Option<&[StackId]>,
    ) -> CoreResult<RunReport> {
        let mut report = self.new_report(RunAction::Deploy, selection);
        self.deploy_with_report(graph, selection, &mut report).await?;
        Ok(report)
    }

    /// Deploy, recording progress into a caller-owned report.
    ///
    /// On failure the report holds every stack processed before the error.
    pub async fn deploy_with_report(
        &self,
        graph: &TopologyGraph,
        selection: Option<&[StackId]>,
        report: &mut RunReport,
    ) -> CoreResult<()> {
        let result = self.run_deploy(graph, selection, report).await;
        match result {
            Ok(()) => {
                report.finish(None)?;
                info!(
                    "Deployment completed: {} stack(s), {} export(s) published",
                    report.outcomes.len(),
                    self.registry.len()
                );
                Ok(())
            }
            Err(e) => {
                error!("Deployment failed: {}", e);
                report.finish(Some(&e))?;
                Err(e)
            }
        }
    }

    async fn run_deploy(
        &self,
        graph: &TopologyGraph,
        selection: Option<&[StackId]>,
        report: &mut RunReport,
    ) -> CoreResult<()> {
        let waves = graph.deployment_waves_for(selection)?;
        let order: Vec<&Stack> = waves.iter().flatten().copied().collect();

        self.registry.clear();
        report.start(order.iter().map(|s| s.id.clone()).collect());
        info!(
            "Deploying {} stack(s) with {}: {}",
            order.len(),
            self.backend.name(),
            order.iter().map(|s| s.id.as_str()).collect::<Vec<_>>().join(", ")
        );

        let parameters = self.preflight(graph, &order)?;

        if self.options.parallelism <= 1 {
            for (i, stack) in order.iter().enumerate() {
                self.check_cancelled(&stack.id)?;
                info!("Deploying stack [{}/{}]: {}", i + 1, order.len(), stack.id);
                let started_at = Utc::now();
                let result = self.deploy_stack(stack, parameters[&stack.id].clone()).await;
                report.record(outcome(&stack.id, started_at, &result))?;
                result?;
            }
        } else {
            for (w, wave) in waves.iter().enumerate() {
                debug!("Wave {}/{}: {} stack(s)", w + 1, waves.len(), wave.len());
                for batch in wave.chunks(self.options.parallelism) {
                    self.check_cancelled(&batch[0].id)?;
                    self.deploy_batch(batch, &parameters, report).await?;
                }
            }
        }
        Ok(())
    }

    /// Resolve parameters for every stack in the run and lint imports.
    fn preflight(
        &self,
        graph: &TopologyGraph,
        order: &[&Stack],
    ) -> CoreResult<HashMap<StackId, HashMap<String, String>>> {
        for stack in self.parameters.scoped_stacks() {
            if !graph.contains(stack) {
                warn!("Parameters given for unknown stack {}", stack);
            }
        }

        let mut parameters = HashMap::new();
        for stack in order {
            let values = self
                .parameters
                .resolve_for(stack)
                .map_err(|e| e.at(&stack.id, Phase::Validate))?;
            parameters.insert(stack.id.clone(), values);
        }

        // Stacks of one wave run together, so only imports from ancestors are
        // guaranteed to be published in time.
        let strict = self.options.strict_imports || self.options.parallelism > 1;
        for issue in graph.check_imports() {
            let stack = match &issue {
                ImportIssue::NoProducer { stack, .. } | ImportIssue::NotAncestor { stack, .. } => {
                    stack.clone()
                }
            };
            if !order.iter().any(|s| s.id == stack) {
                continue;
            }
            warn!("{}", issue);
            if strict {
                let err = match issue {
                    ImportIssue::NoProducer { import, .. } => CoreError::UnresolvedImport(import),
                    ImportIssue::NotAncestor {
                        stack,
                        import,
                        producer,
                    } => CoreError::ImportNotInAncestry {
                        stack,
                        import,
                        producer,
                    },
                };
                return Err(err.at(&stack, Phase::Validate));
            }
        }
        Ok(parameters)
    }

    fn check_cancelled(&self, next: &StackId) -> CoreResult<()> {
        if self.cancel.is_cancelled() {
            warn!("Run cancelled before {}", next);
            return Err(CoreError::Cancelled(next.clone()));
        }
        Ok(())
    }

    /// Resolve imports and build the backend request for one stack.
    fn prepare(&self, stack: &Stack, parameters: HashMap<String, String>) -> CoreResult<ProvisionRequest> {
        let imports = self
            .registry
            .resolve_all(&stack.imports)
            .map_err(|e| e.at(&stack.id, Phase::ResolveImports))?;
        debug!("{}: resolved {} import(s)", stack.id, imports.len());
        let sensitive_imports = stack
            .imports
            .iter()
            .filter(|name| self.registry.get(name).map_or(false, |r| r.sensitive))
            .cloned()
            .collect();

        Ok(ProvisionRequest {
            stack: stack.clone(),
            imports,
            sensitive_imports,
            parameters,
            scaling: self.policies.for_stack(&stack.id),
        })
    }

    /// Publish every export of `stack` and return their names.
    fn publish(
        &self,
        stack: &Stack,
        parameters: &HashMap<String, String>,
        outcome: &ProvisionOutcome,
    ) -> CoreResult<Vec<String>> {
        let mut published = Vec::with_capacity(stack.exports.len());
        for export in &stack.exports {
            let value = match &export.source {
                ExportSource::Output(key) => outcome.outputs.get(key),
                ExportSource::Parameter(name) => parameters.get(name),
            }
            .ok_or_else(|| {
                let output = match &export.source {
                    ExportSource::Output(key) => key.clone(),
                    ExportSource::Parameter(name) => format!("parameter {}", name),
                };
                CoreError::MissingOutput {
                    stack: stack.id.clone(),
                    export: export.name.clone(),
                    output,
                }
                .at(&stack.id, Phase::PublishExports)
            })?;

            self.registry
                .publish(&export.name, value.clone(), &stack.id, export.sensitive)
                .map_err(|e| e.at(&stack.id, Phase::PublishExports))?;
            published.push(export.name.clone());
        }
        if !published.is_empty() {
            info!("{}: published {}", stack.id, published.join(", "));
        }
        Ok(published)
    }

    async fn deploy_stack(
        &self,
        stack: &Stack,
        parameters: HashMap<String, String>,
    ) -> CoreResult<Vec<String>> {
        let request = self.prepare(stack, parameters)?;
        let provisioned = provision(self.backend.clone(), request.clone()).await?;
        self.publish(stack, &request.parameters, &provisioned)
    }

    async fn deploy_batch(
        &self,
        batch: &[&Stack],
        parameters: &HashMap<StackId, HashMap<String, String>>,
        report: &mut RunReport,
    ) -> CoreResult<()> {
        let started_at = Utc::now();

        // Every import of the batch comes from an earlier wave, so all of
        // them resolve before anything in the batch starts.
        let mut requests = Vec::with_capacity(batch.len());
        for stack in batch {
            match self.prepare(stack, parameters[&stack.id].clone()) {
                Ok(request) => requests.push(request),
                Err(e) => {
                    let failed: CoreResult<Vec<String>> = Err(e);
                    report.record(outcome(&stack.id, started_at, &failed))?;
                    return failed.map(|_| ());
                }
            }
        }

        let mut tasks = JoinSet::new();
        for (i, request) in requests.iter().enumerate() {
            info!("Deploying stack {} (batch of {})", request.id(), batch.len());
            let backend = self.backend.clone();
            let request = request.clone();
            tasks.spawn(async move { (i, provision(backend, request).await) });
        }

        let mut results: Vec<Option<CoreResult<ProvisionOutcome>>> =
            (0..batch.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((i, result)) => results[i] = Some(result),
                Err(e) => error!("Provisioning task aborted: {}", e),
            }
        }

        let mut first_error = None;
        for (i, stack) in batch.iter().enumerate() {
            let result = match results[i].take() {
                Some(Ok(provisioned)) => self.publish(stack, &requests[i].parameters, &provisioned),
                Some(Err(e)) => Err(e),
                None => Err(CoreError::Provisioning {
                    stack: stack.id.clone(),
                    cause: "provisioning task aborted".to_string(),
                }
                .at(&stack.id, Phase::Provision)),
            };
            report.record(outcome(&stack.id, started_at, &result))?;
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Destroy the whole graph, or the dependency closure of `selection`,
    /// in teardown order.
    pub async fn destroy(
        &self,
        graph: &TopologyGraph,
        selection: Option<&[StackId]>,
    ) -> CoreResult<RunReport> {
        let mut report = self.new_report(RunAction::Destroy, selection);
        self.destroy_with_report(graph, selection, &mut report).await?;
        Ok(report)
    }

    /// Destroy, recording progress into a caller-owned report.
    pub async fn destroy_with_report(
        &self,
        graph: &TopologyGraph,
        selection: Option<&[StackId]>,
        report: &mut RunReport,
    ) -> CoreResult<()> {
        let result = self.run_destroy(graph, selection, report).await;
        match result {
            Ok(()) => {
                report.finish(None)?;
                info!("Teardown completed: {} stack(s)", report.outcomes.len());
                Ok(())
            }
            Err(e) => {
                error!("Teardown failed: {}", e);
                report.finish(Some(&e))?;
                Err(e)
            }
        }
    }

    async fn run_destroy(
        &self,
        graph: &TopologyGraph,
        selection: Option<&[StackId]>,
        report: &mut RunReport,
    ) -> CoreResult<()> {
        let order = graph.teardown_order_for(selection)?;
        report.start(order.iter().map(|s| s.id.clone()).collect());
        if let Some(selection) = selection {
            if order.len() > selection.len() {
                info!(
                    "Destroying {} stack(s) that depend on the selection as well",
                    order.len() - selection.len()
                );
            }
        }

        for (i, stack) in order.iter().enumerate() {
            self.check_cancelled(&stack.id)?;
            info!("Destroying stack [{}/{}]: {}", i + 1, order.len(), stack.id);

            let started_at = Utc::now();
            let request = TeardownRequest {
                stack: (*stack).clone(),
            };
            let result = self
                .backend
                .destroy(&request)
                .await
                .map(|()| Vec::new())
                .map_err(|e| as_provisioning(&stack.id, e).at(&stack.id, Phase::Teardown));
            report.record(outcome(&stack.id, started_at, &result))?;
            result?;
        }
        Ok(())
    }
}

/// Run the backend for one request, attributing any failure to the stack.
async fn provision(
    backend: Arc<dyn ProvisioningBackend>,
    request: ProvisionRequest,
) -> CoreResult<ProvisionOutcome> {
    let id = request.id().clone();
    backend
        .provision(&request)
        .await
        .map_err(|e| as_provisioning(&id, e).at(&id, Phase::Provision))
}

fn as_provisioning(stack: &StackId, err: CoreError) -> CoreError {
    match err {
        CoreError::Provisioning { .. } => err,
        other => CoreError::Provisioning {
            stack: stack.clone(),
            cause: other.to_string(),
        },
    }
}

fn outcome(
    stack: &StackId,
    started_at: chrono::DateTime<Utc>,
    result: &CoreResult<Vec<String>>,
) -> StackOutcome {
    let (phase, message) = match result {
        Ok(_) => (None, None),
        Err(CoreError::StageFailed { phase, source, .. }) => (Some(*phase), Some(source.to_string())),
        Err(e) => (None, Some(e.to_string())),
    };
    StackOutcome {
        stack: stack.clone(),
        success: result.is_ok(),
        phase,
        message,
        exports: result.as_ref().map(Clone::clone).unwrap_or_default(),
        started_at,
        completed_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::mock::MockBackend;
    use crate::report::RunState;
    use crate::stack::{ParameterDecl, StackKind};

    mockall::mock! {
        Provisioner {}

        #[async_trait]
        impl ProvisioningBackend for Provisioner {
            async fn provision(&self, request: &ProvisionRequest) -> CoreResult<ProvisionOutcome>;
            async fn destroy(&self, request: &TeardownRequest) -> CoreResult<()>;
        }
    }

    fn stack(id: &str) -> Stack {
        Stack::new(id, StackKind::Custom("test".to_string()))
    }

    /// Vpc <- Rds <- App, with App importing the endpoint Rds exports.
    fn chain() -> TopologyGraph {
        let mut graph = TopologyGraph::new();
        graph.add_stack(stack("Vpc"), Vec::<StackId>::new()).unwrap();
        graph
            .add_stack(
                stack("Rds").export_output("rds-endpoint", "Rds01.Endpoint").unwrap(),
                ["Vpc"],
            )
            .unwrap();
        graph
            .add_stack(stack("App").import("rds-endpoint"), ["Rds"])
            .unwrap();
        graph
    }

    fn ids(ids: &[&str]) -> Vec<StackId> {
        ids.iter().map(|id| StackId::new(*id)).collect()
    }

    #[tokio::test]
    async fn test_deploy_resolves_imports_in_order() {
        let registry = ReferenceRegistry::new();
        let backend = MockBackend::new()
            .with_output("Rds", "Rds01.Endpoint", "db.internal:3306")
            .with_probe(registry.clone(), &["rds-endpoint"]);
        let orchestrator =
            DeploymentOrchestrator::new(Arc::new(backend.clone())).with_registry(registry.clone());

        let report = orchestrator.deploy(&chain(), None).await.unwrap();

        assert_eq!(backend.stacks_called("provision"), vec!["Vpc", "Rds", "App"]);
        assert_eq!(backend.observed_for("Rds").unwrap()["rds-endpoint"], None);
        assert_eq!(
            backend.observed_for("App").unwrap()["rds-endpoint"].as_deref(),
            Some("db.internal:3306")
        );

        let app_call = &backend.get_method_calls("provision")[2];
        assert_eq!(app_call.imports["rds-endpoint"], "db.internal:3306");

        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.outcomes[1].exports, vec!["rds-endpoint"]);
        assert_eq!(registry.resolve("rds-endpoint").unwrap(), "db.internal:3306");
    }

    #[tokio::test]
    async fn test_failure_stops_run_without_rollback() {
        let backend = MockBackend::new().fail_on("Rds", "instance limit reached");
        let orchestrator = DeploymentOrchestrator::new(Arc::new(backend.clone()));

        let mut report = RunReport::new(RunAction::Deploy, Vec::new());
        let err = orchestrator
            .deploy_with_report(&chain(), None, &mut report)
            .await
            .unwrap_err();

        assert_eq!(err.failing_stack(), Some(&StackId::new("Rds")));
        assert!(matches!(err, CoreError::StageFailed { phase: Phase::Provision, .. }));
        assert!(matches!(err.root(), CoreError::Provisioning { cause, .. } if cause == "instance limit reached"));

        assert_eq!(backend.stacks_called("provision"), vec!["Vpc", "Rds"]);
        assert!(backend.get_method_calls("destroy").is_empty());
        assert_eq!(report.state, RunState::Failed);
        assert_eq!(report.succeeded(), vec![&StackId::new("Vpc")]);
        assert_eq!(report.pending(), vec![&StackId::new("App")]);
    }

    #[tokio::test]
    async fn test_missing_output_fails_publish() {
        let backend = MockBackend::new();
        let orchestrator = DeploymentOrchestrator::new(Arc::new(backend.clone()));

        let err = orchestrator.deploy(&chain(), None).await.unwrap_err();

        assert!(matches!(err, CoreError::StageFailed { phase: Phase::PublishExports, .. }));
        assert!(matches!(err.root(), CoreError::MissingOutput { output, .. } if output == "Rds01.Endpoint"));
        assert_eq!(backend.stacks_called("provision"), vec!["Vpc", "Rds"]);
    }

    #[tokio::test]
    async fn test_missing_parameter_fails_before_provisioning() {
        let mut graph = TopologyGraph::new();
        graph.add_stack(stack("Vpc"), Vec::<StackId>::new()).unwrap();
        graph
            .add_stack(
                stack("Rds").parameter(ParameterDecl::new("databasePassword", "Admin password").no_echo()),
                ["Vpc"],
            )
            .unwrap();

        let backend = MockBackend::new();
        let orchestrator = DeploymentOrchestrator::new(Arc::new(backend.clone()));
        let err = orchestrator.deploy(&graph, None).await.unwrap_err();

        assert!(err.is_validation());
        assert!(matches!(err.root(), CoreError::MissingParameter { parameter, .. } if parameter == "databasePassword"));
        assert!(backend.get_calls().is_empty());
    }

    #[tokio::test]
    async fn test_parameter_export_is_sensitive() {
        let mut graph = TopologyGraph::new();
        graph
            .add_stack(
                stack("Rds")
                    .parameter(ParameterDecl::new("databasePassword", "Admin password").no_echo())
                    .export_parameter("rds-password", "databasePassword")
                    .unwrap(),
                Vec::<StackId>::new(),
            )
            .unwrap();

        let backend = MockBackend::new();
        let orchestrator = DeploymentOrchestrator::new(Arc::new(backend.clone()))
            .with_parameters(Parameters::new().with("Rds", "databasePassword", "s3cret"));
        orchestrator.deploy(&graph, None).await.unwrap();

        let record = orchestrator.registry().get("rds-password").unwrap();
        assert!(record.sensitive);
        assert_eq!(record.value, "s3cret");
        assert_eq!(backend.get_calls()[0].parameters["databasePassword"], "s3cret");
    }

    #[tokio::test]
    async fn test_strict_imports_rejects_non_ancestor_producer() {
        let mut graph = TopologyGraph::new();
        graph
            .add_stack(
                stack("Sns").export_output("topic-arn", "Topic.Arn").unwrap(),
                Vec::<StackId>::new(),
            )
            .unwrap();
        graph
            .add_stack(stack("Worker").import("topic-arn"), Vec::<StackId>::new())
            .unwrap();

        let backend = MockBackend::new().with_output("Sns", "Topic.Arn", "arn:topic");

        // Lenient: insertion order happens to publish the topic first.
        let lenient = DeploymentOrchestrator::new(Arc::new(backend.clone()));
        lenient.deploy(&graph, None).await.unwrap();
        assert_eq!(backend.stacks_called("provision"), vec!["Sns", "Worker"]);

        backend.clear_calls();
        let strict = DeploymentOrchestrator::new(Arc::new(backend.clone())).with_options(DeployOptions {
            strict_imports: true,
            ..DeployOptions::default()
        });
        let err = strict.deploy(&graph, None).await.unwrap_err();
        assert!(matches!(err.root(), CoreError::ImportNotInAncestry { producer, .. } if producer.as_str() == "Sns"));
        assert!(backend.get_calls().is_empty());

        // Parallel runs check imports strictly, since Sns and Worker share a wave.
        let parallel = DeploymentOrchestrator::new(Arc::new(backend.clone())).with_options(DeployOptions {
            parallelism: 2,
            ..DeployOptions::default()
        });
        let err = parallel.deploy(&graph, None).await.unwrap_err();
        assert!(matches!(err, CoreError::StageFailed { phase: Phase::Validate, .. }));
        assert!(matches!(err.root(), CoreError::ImportNotInAncestry { .. }));
        assert!(backend.get_calls().is_empty());
    }

    #[tokio::test]
    async fn test_selection_deploys_dependency_closure_only() {
        let mut graph = chain();
        graph.add_stack(stack("Other"), ["Vpc"]).unwrap();

        let backend = MockBackend::new().with_output("Rds", "Rds01.Endpoint", "db");
        let orchestrator = DeploymentOrchestrator::new(Arc::new(backend.clone()));
        let report = orchestrator.deploy(&graph, Some(&ids(&["Rds"]))).await.unwrap();

        assert_eq!(backend.stacks_called("provision"), vec!["Vpc", "Rds"]);
        assert_eq!(report.selection, ids(&["Rds"]));
    }

    #[tokio::test]
    async fn test_parallel_waves() {
        let mut graph = TopologyGraph::new();
        for id in ["A", "B", "C"] {
            graph.add_stack(stack(id), Vec::<StackId>::new()).unwrap();
        }
        graph.add_stack(stack("D"), ["A", "B", "C"]).unwrap();

        let backend = MockBackend::new().with_delay(Duration::from_millis(20));
        let orchestrator = DeploymentOrchestrator::new(Arc::new(backend.clone())).with_options(DeployOptions {
            parallelism: 3,
            ..DeployOptions::default()
        });
        let report = orchestrator.deploy(&graph, None).await.unwrap();

        assert!(backend.max_in_flight() > 1);
        assert!(backend.max_in_flight() <= 3);
        let order: Vec<_> = report.outcomes.iter().map(|o| o.stack.to_string()).collect();
        assert_eq!(order, vec!["A", "B", "C", "D"]);
    }

    #[tokio::test]
    async fn test_parallel_failure_stops_later_waves() {
        let mut graph = TopologyGraph::new();
        graph.add_stack(stack("A"), Vec::<StackId>::new()).unwrap();
        graph.add_stack(stack("B"), Vec::<StackId>::new()).unwrap();
        graph.add_stack(stack("C"), ["A", "B"]).unwrap();

        let backend = MockBackend::new().fail_on("B", "boom");
        let orchestrator = DeploymentOrchestrator::new(Arc::new(backend.clone())).with_options(DeployOptions {
            parallelism: 2,
            ..DeployOptions::default()
        });

        let mut report = RunReport::new(RunAction::Deploy, Vec::new());
        let err = orchestrator
            .deploy_with_report(&graph, None, &mut report)
            .await
            .unwrap_err();

        assert_eq!(err.failing_stack(), Some(&StackId::new("B")));
        assert!(!backend.stacks_called("provision").contains(&"C".to_string()));
        assert_eq!(report.succeeded(), vec![&StackId::new("A")]);
    }

    #[tokio::test]
    async fn test_cancelled_run_provisions_nothing() {
        let backend = MockBackend::new();
        let orchestrator = DeploymentOrchestrator::new(Arc::new(backend.clone()));
        orchestrator.cancel_handle().cancel();

        let mut report = RunReport::new(RunAction::Deploy, Vec::new());
        let err = orchestrator
            .deploy_with_report(&chain(), None, &mut report)
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::Cancelled(ref id) if id.as_str() == "Vpc"));
        assert_eq!(report.state, RunState::Cancelled);
        assert!(backend.get_calls().is_empty());
    }

    #[tokio::test]
    async fn test_redeploy_starts_with_empty_registry() {
        let backend = MockBackend::new().with_output("Rds", "Rds01.Endpoint", "db");
        let orchestrator = DeploymentOrchestrator::new(Arc::new(backend));

        orchestrator.deploy(&chain(), None).await.unwrap();
        orchestrator.deploy(&chain(), None).await.unwrap();
        assert_eq!(orchestrator.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_destroy_reverse_order_and_fail_fast() {
        let backend = MockBackend::new();
        let orchestrator = DeploymentOrchestrator::new(Arc::new(backend.clone()));
        orchestrator.destroy(&chain(), None).await.unwrap();
        assert_eq!(backend.stacks_called("destroy"), vec!["App", "Rds", "Vpc"]);

        let backend = MockBackend::new().fail_teardown_on("Rds", "resource in use");
        let orchestrator = DeploymentOrchestrator::new(Arc::new(backend.clone()));
        let err = orchestrator.destroy(&chain(), None).await.unwrap_err();
        assert!(matches!(err, CoreError::StageFailed { phase: Phase::Teardown, .. }));
        assert_eq!(backend.stacks_called("destroy"), vec!["App", "Rds"]);
    }

    #[tokio::test]
    async fn test_destroy_selection_takes_dependents_not_dependencies() {
        let backend = MockBackend::new();
        let orchestrator = DeploymentOrchestrator::new(Arc::new(backend.clone()));

        let report = orchestrator.destroy(&chain(), Some(&ids(&["Rds"]))).await.unwrap();
        assert_eq!(backend.stacks_called("destroy"), vec!["App", "Rds"]);
        assert_eq!(report.outcomes.len(), 2);
    }

    #[tokio::test]
    async fn test_backend_errors_are_attributed_to_the_stack() {
        let mut backend = MockProvisioner::new();
        backend
            .expect_provision()
            .withf(|request| request.id().as_str() == "Vpc")
            .times(1)
            .returning(|_| Ok(ProvisionOutcome::new()));
        backend
            .expect_provision()
            .withf(|request| request.id().as_str() == "Rds")
            .times(1)
            .returning(|_| Err(CoreError::Serialization("bad template".to_string())));
        backend.expect_destroy().never();

        let orchestrator = DeploymentOrchestrator::new(Arc::new(backend));
        let err = orchestrator.deploy(&chain(), None).await.unwrap_err();

        match err.root() {
            CoreError::Provisioning { stack, cause } => {
                assert_eq!(stack.as_str(), "Rds");
                assert!(cause.contains("bad template"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_reports_saved_to_log_dir() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let backend = MockBackend::new().with_output("Rds", "Rds01.Endpoint", "db");
        let orchestrator = DeploymentOrchestrator::new(Arc::new(backend)).with_options(DeployOptions {
            log_dir: Some(temp_dir.path().to_path_buf()),
            ..DeployOptions::default()
        });

        let report = orchestrator.deploy(&chain(), None).await.unwrap();
        let loaded = RunReport::load(&report.log_path().unwrap()).unwrap();
        assert_eq!(loaded.state, RunState::Completed);
        assert_eq!(loaded.outcomes.len(), 3);
    }
}
