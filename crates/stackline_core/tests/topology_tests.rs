//! Integration tests for topology ordering and orchestrated deploys.
//!
//! The graphs here are built by hand with the mock backend, so no resources
//! are involved.

use std::collections::HashMap;
use std::sync::Arc;

use stackline_core::{
    CoreError, DeploymentOrchestrator, MockBackend, ReferenceRegistry, ResourceRef,
    ScalableDimension, ScalingPolicy, ScalingPolicyBinder, Stack, StackId, StackKind,
    TopologyGraph,
};

fn stack(id: &str, kind: StackKind) -> Stack {
    Stack::new(id, kind)
}

/// The seven-stack environment: network, cluster, database, topic, table
/// and two services.
fn environment() -> TopologyGraph {
    let mut graph = TopologyGraph::new();
    graph
        .add_stack(stack("Vpc", StackKind::Network), Vec::<StackId>::new())
        .unwrap();
    graph
        .add_stack(stack("Cluster", StackKind::Cluster), ["Vpc"])
        .unwrap();
    graph
        .add_stack(
            stack("Rds", StackKind::Database)
                .export_output("rds-endpoint", "Rds01.Endpoint")
                .unwrap(),
            ["Vpc"],
        )
        .unwrap();
    graph
        .add_stack(
            stack("Sns", StackKind::Messaging)
                .export_output("topic-arn", "Topic.Arn")
                .unwrap(),
            Vec::<StackId>::new(),
        )
        .unwrap();
    graph
        .add_stack(
            stack("Ddb", StackKind::Table)
                .export_output("events-table", "ProductEventsDdb.Name")
                .unwrap(),
            Vec::<StackId>::new(),
        )
        .unwrap();
    graph
        .add_stack(
            stack("Service01", StackKind::Service)
                .import("rds-endpoint")
                .import("topic-arn"),
            ["Cluster", "Rds", "Sns"],
        )
        .unwrap();
    graph
        .add_stack(
            stack("Service02", StackKind::Service)
                .import("topic-arn")
                .import("events-table"),
            ["Cluster", "Sns", "Ddb"],
        )
        .unwrap();
    graph
}

fn names(stacks: &[&Stack]) -> Vec<String> {
    stacks.iter().map(|s| s.id.to_string()).collect()
}

fn backend() -> MockBackend {
    MockBackend::new()
        .with_output("Rds", "Rds01.Endpoint", "aws-project01-db.internal")
        .with_output("Sns", "Topic.Arn", "arn:aws:sns:product-events")
        .with_output("Ddb", "ProductEventsDdb.Name", "product-events")
}

/// Every stack appears after all of its dependencies.
fn assert_valid_order(graph: &TopologyGraph, order: &[&Stack]) {
    let position: HashMap<_, _> = order.iter().enumerate().map(|(i, s)| (&s.id, i)).collect();
    assert_eq!(position.len(), graph.len());
    for s in order {
        for dep in graph.dependencies(&s.id).unwrap() {
            assert!(position[dep] < position[&s.id], "{} deployed before {}", s.id, dep);
        }
    }
}

#[test]
fn test_environment_deployment_order() {
    let graph = environment();
    let order = graph.deployment_order();

    assert_valid_order(&graph, &order);
    assert_eq!(
        names(&order),
        vec!["Vpc", "Sns", "Ddb", "Cluster", "Rds", "Service01", "Service02"]
    );

    let waves: Vec<Vec<String>> = graph.deployment_waves().iter().map(|w| names(w)).collect();
    assert_eq!(waves[0], vec!["Vpc", "Sns", "Ddb"]);
    assert_eq!(waves[1], vec!["Cluster", "Rds"]);
    assert_eq!(waves[2], vec!["Service01", "Service02"]);
}

#[test]
fn test_teardown_is_exact_reverse() {
    let graph = environment();
    let mut reversed = names(&graph.deployment_order());
    reversed.reverse();
    assert_eq!(names(&graph.teardown_order()), reversed);
}

#[test]
fn test_every_prefix_graph_orders_validly() {
    // Build the environment up one stack at a time; each intermediate graph
    // must order validly on its own.
    let full = environment();
    let mut graph = TopologyGraph::new();
    for s in full.stacks() {
        let deps: Vec<StackId> = full.dependencies(&s.id).unwrap().into_iter().cloned().collect();
        graph.add_stack(s.clone(), deps).unwrap();
        assert_valid_order(&graph, &graph.deployment_order());
    }
}

#[test]
fn test_rejected_cycle_keeps_previous_order() {
    let mut graph = environment();
    let before = names(&graph.deployment_order());

    let err = graph
        .add_dependency(&StackId::new("Vpc"), &StackId::new("Service01"))
        .unwrap_err();
    match err {
        CoreError::CyclicDependency { path } => {
            assert_eq!(path.first(), path.last());
            assert!(path.contains(&StackId::new("Service01")));
        }
        other => panic!("expected a cycle, got {}", other),
    }
    assert_eq!(names(&graph.deployment_order()), before);
}

#[test]
fn test_service_selection_closure() {
    let graph = environment();
    let closure = graph
        .dependency_closure(&[StackId::new("Service01")])
        .unwrap();
    let closure: Vec<_> = closure.iter().map(StackId::to_string).collect();
    assert_eq!(closure, vec!["Cluster", "Rds", "Service01", "Sns", "Vpc"]);

    let order = graph
        .deployment_order_for(Some(&[StackId::new("Service01")]))
        .unwrap();
    assert_eq!(names(&order), vec!["Vpc", "Sns", "Cluster", "Rds", "Service01"]);
}

#[test]
fn test_environment_imports_are_clean() {
    assert!(environment().check_imports().is_empty());
}

#[tokio::test]
async fn test_deploy_environment() {
    let registry = ReferenceRegistry::new();
    let backend = backend().with_probe(registry.clone(), &["rds-endpoint"]);

    let mut policies = ScalingPolicyBinder::new();
    policies
        .attach(
            ResourceRef::new("Service01", "ALB01"),
            ScalableDimension::TaskCount,
            ScalingPolicy::new(2, 4, 50.0),
        )
        .unwrap();

    let orchestrator = DeploymentOrchestrator::new(Arc::new(backend.clone()))
        .with_registry(registry.clone())
        .with_policies(policies);
    let report = orchestrator.deploy(&environment(), None).await.unwrap();

    assert_eq!(
        backend.stacks_called("provision"),
        vec!["Vpc", "Sns", "Ddb", "Cluster", "Rds", "Service01", "Service02"]
    );
    assert_eq!(
        backend.observed_for("Service01").unwrap()["rds-endpoint"].as_deref(),
        Some("aws-project01-db.internal")
    );

    let calls = backend.get_method_calls("provision");
    let service01 = calls.iter().find(|c| c.stack.as_str() == "Service01").unwrap();
    assert_eq!(service01.policies, 1);
    assert_eq!(service01.imports["topic-arn"], "arn:aws:sns:product-events");

    assert_eq!(report.outcomes.len(), 7);
    assert_eq!(registry.len(), 3);
}

#[tokio::test]
async fn test_deploy_single_service() {
    let backend = backend();
    let orchestrator = DeploymentOrchestrator::new(Arc::new(backend.clone()));

    orchestrator
        .deploy(&environment(), Some(&[StackId::new("Service01")]))
        .await
        .unwrap();

    assert_eq!(
        backend.stacks_called("provision"),
        vec!["Vpc", "Sns", "Cluster", "Rds", "Service01"]
    );
    assert!(!orchestrator.registry().contains("events-table"));
}

#[tokio::test]
async fn test_cluster_failure_stops_services() {
    let backend = backend().fail_on("Cluster", "capacity unavailable");
    let orchestrator = DeploymentOrchestrator::new(Arc::new(backend.clone()));

    let err = orchestrator.deploy(&environment(), None).await.unwrap_err();
    assert_eq!(err.failing_stack(), Some(&StackId::new("Cluster")));

    let called = backend.stacks_called("provision");
    assert_eq!(called, vec!["Vpc", "Sns", "Ddb", "Cluster"]);
    assert!(backend.get_method_calls("destroy").is_empty());
    // Exports published before the failure stay published.
    assert!(orchestrator.registry().contains("topic-arn"));
}

#[tokio::test]
async fn test_unknown_selection() {
    let orchestrator = DeploymentOrchestrator::new(Arc::new(backend()));
    let err = orchestrator
        .deploy(&environment(), Some(&[StackId::new("Service03")]))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::UnknownStack(name) if name == "Service03"));
}
