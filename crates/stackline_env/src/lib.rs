//! # stackline_env
//!
//! The application environment deployed by stackline.
//!
//! Seven stacks make up the environment: a network, a container cluster, a
//! MySQL database, a product events topic, a product events table and two
//! load-balanced services. This crate declares their resources, wires the
//! dependency edges and cross-stack exports, binds the autoscaling policies,
//! and provides a file-backed backend for local runs.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stackline_core::{DeploymentOrchestrator, Parameters};
//! use stackline_env::{Environment, EnvironmentConfig, LocalBackend};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let env = Environment::build(EnvironmentConfig::default())?;
//! let backend = LocalBackend::new(&env.config)?;
//!
//! let orchestrator = DeploymentOrchestrator::new(Arc::new(backend))
//!     .with_policies(env.policies.clone())
//!     .with_parameters(Parameters::parse(["Rds:databasePassword=secret123"])?);
//! orchestrator.deploy(&env.graph, None).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod environment;
pub mod error;
pub mod local;
pub mod resources;
pub mod stacks;

pub use config::{EnvironmentConfig, ServiceImages, DEFAULT_CONFIG_FILE};
pub use environment::{scaling, topology, Environment};
pub use error::{EnvError, EnvResult};
pub use local::{DeployedStack, LocalBackend, LocalState};
pub use resources::{
    ClusterSpec, DatabaseSpec, QueueSpec, QueueSubscriptionSpec, ResourceSpec, ServiceSpec,
    TableSpec, TopicSpec, VpcSpec,
};
