//! # stackline_core
//!
//! Dependency-ordered deployment engine for stackline.
//!
//! This crate models an environment as stacks in a dependency graph, computes
//! deployment and teardown order, passes values between stacks through a flat
//! export namespace, and records autoscaling policies for scalable resources.
//! Creating the resources themselves is delegated to a [`ProvisioningBackend`].
//!
//! # Architecture
//!
//! - **Stacks**: named units of resource declarations with exports and imports
//! - **Topology**: the dependency DAG, with cycle detection and ordering
//! - **Registry**: publish-once, read-many store of export values
//! - **Scaling**: validated autoscaling policies, one per scalable dimension
//! - **Orchestrator**: walks the graph, resolving imports and publishing exports
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stackline_core::{DeploymentOrchestrator, Stack, StackKind, TopologyGraph, StackId};
//!
//! let mut graph = TopologyGraph::new();
//! graph.add_stack(Stack::new("Vpc", StackKind::Network), Vec::<StackId>::new())?;
//! graph.add_stack(
//!     Stack::new("Rds", StackKind::Database).export_output("rds-endpoint", "Rds01.Endpoint")?,
//!     ["Vpc"],
//! )?;
//!
//! let orchestrator = DeploymentOrchestrator::new(Arc::new(my_backend));
//! let report = orchestrator.deploy(&graph, None).await?;
//! ```

pub mod backend;
pub mod error;
pub mod mock;
pub mod orchestrator;
pub mod params;
pub mod registry;
pub mod report;
pub mod scaling;
pub mod stack;
pub mod topology;

pub use backend::{ProvisionOutcome, ProvisionRequest, ProvisioningBackend, TeardownRequest};
pub use error::{CoreError, CoreResult, Phase};
pub use mock::{CapturedCall, MockBackend};
pub use orchestrator::{CancelHandle, DeployOptions, DeploymentOrchestrator};
pub use params::{ParameterAssignment, Parameters};
pub use registry::{ExportRecord, ReferenceRegistry, REDACTED};
pub use report::{RunAction, RunReport, RunState, StackOutcome};
pub use scaling::{
    BoundPolicy, ResourceRef, ScalableDimension, ScalingPolicy, ScalingPolicyBinder,
    UtilizationMetric,
};
pub use stack::{
    import_value, output_key, substitute_imports, validate_export_name, ExportSource, ExportSpec,
    ParameterDecl, ResourceDecl, Stack, StackId, StackKind,
};
pub use topology::{ImportIssue, TopologyGraph};
