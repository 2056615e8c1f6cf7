//! Assembly of the full environment.
//!
//! Builds the seven stacks, wires their dependency edges into a
//! [`TopologyGraph`] and binds the autoscaling policies of the two services
//! and the events table.

use std::time::Duration;

use tracing::{debug, info, warn};

use stackline_core::{
    ResourceRef, ScalableDimension, ScalingPolicy, ScalingPolicyBinder, StackId, TopologyGraph,
    UtilizationMetric,
};

use crate::config::EnvironmentConfig;
use crate::error::EnvResult;
use crate::stacks::{self, CLUSTER, DDB, RDS, SERVICE01, SERVICE02, SNS, VPC};

/// The application environment, ready to deploy.
#[derive(Debug, Clone)]
pub struct Environment {
    pub config: EnvironmentConfig,
    pub graph: TopologyGraph,
    pub policies: ScalingPolicyBinder,
}

impl Environment {
    /// Build the environment described by `config`.
    pub fn build(config: EnvironmentConfig) -> EnvResult<Self> {
        config.validate()?;
        let graph = topology(&config)?;
        let policies = scaling()?;

        for issue in graph.check_imports() {
            warn!("{}", issue);
        }
        info!(
            "Environment {}: {} stacks, {} scaling policies",
            config.name,
            graph.len(),
            policies.len()
        );

        Ok(Self {
            config,
            graph,
            policies,
        })
    }

    /// Ids of every stack, in deployment order.
    pub fn stack_ids(&self) -> Vec<StackId> {
        self.graph
            .deployment_order()
            .into_iter()
            .map(|s| s.id.clone())
            .collect()
    }

    /// Turn command-line stack names into a selection.
    ///
    /// An empty list selects the whole environment. Unknown names fail.
    pub fn selection(&self, names: &[String]) -> EnvResult<Option<Vec<StackId>>> {
        if names.is_empty() {
            return Ok(None);
        }
        let ids: Vec<StackId> = names.iter().map(|n| StackId::new(n.as_str())).collect();
        // Validates every name.
        self.graph.dependency_closure(&ids)?;
        Ok(Some(ids))
    }
}

/// The dependency graph of the environment.
pub fn topology(config: &EnvironmentConfig) -> EnvResult<TopologyGraph> {
    let mut graph = TopologyGraph::new();
    let none: [&str; 0] = [];

    graph.add_stack(stacks::vpc()?, none)?;
    graph.add_stack(stacks::cluster()?, [VPC])?;
    graph.add_stack(stacks::rds(config)?, [VPC])?;
    graph.add_stack(stacks::sns(config)?, none)?;
    graph.add_stack(stacks::service01(config)?, [CLUSTER, RDS, SNS])?;
    graph.add_stack(stacks::ddb()?, none)?;
    graph.add_stack(stacks::service02(config)?, [CLUSTER, SNS, DDB])?;

    debug!("Topology built with {} stacks", graph.len());
    Ok(graph)
}

/// Autoscaling policies of the environment.
pub fn scaling() -> EnvResult<ScalingPolicyBinder> {
    let mut binder = ScalingPolicyBinder::new();

    let service = ScalingPolicy::new(2, 4, 50.0)
        .with_metric(UtilizationMetric::Cpu)
        .with_cooldowns(Duration::from_secs(60), Duration::from_secs(60));
    binder.attach(
        ResourceRef::new(SERVICE01, stacks::SERVICE01_LB),
        ScalableDimension::TaskCount,
        service.clone(),
    )?;
    binder.attach(
        ResourceRef::new(SERVICE02, stacks::SERVICE02_LB),
        ScalableDimension::TaskCount,
        service,
    )?;

    let table = ScalingPolicy::new(1, 4, 50.0)
        .with_metric(UtilizationMetric::Capacity)
        .with_cooldowns(Duration::from_secs(30), Duration::from_secs(30));
    let events_table = ResourceRef::new(DDB, stacks::EVENTS_TABLE);
    binder.attach(events_table.clone(), ScalableDimension::ReadCapacity, table.clone())?;
    binder.attach(events_table, ScalableDimension::WriteCapacity, table)?;

    Ok(binder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EnvError;
    use stackline_core::CoreError;

    fn env() -> Environment {
        Environment::build(EnvironmentConfig::default()).unwrap()
    }

    #[test]
    fn test_build_environment() {
        let env = env();
        assert_eq!(env.graph.len(), 7);
        assert_eq!(env.policies.len(), 4);
        assert!(env.graph.check_imports().is_empty());

        let ids: Vec<String> = env.stack_ids().iter().map(ToString::to_string).collect();
        assert_eq!(
            ids,
            vec!["Vpc", "Sns", "Ddb", "Cluster", "Rds", "Service01", "Service02"]
        );
    }

    #[test]
    fn test_policies_bound_per_stack() {
        let env = env();
        let service = env.policies.for_stack(&StackId::new(SERVICE01));
        assert_eq!(service.len(), 1);
        assert_eq!(service[0].policy.min_capacity, 2);
        assert_eq!(service[0].policy.scale_in_cooldown(), Duration::from_secs(60));

        let table = env.policies.for_stack(&StackId::new(DDB));
        assert_eq!(table.len(), 2);
        assert!(table.iter().all(|p| p.policy.max_capacity == 4));
    }

    #[test]
    fn test_selection() {
        let env = env();
        assert!(env.selection(&[]).unwrap().is_none());

        let selection = env.selection(&["Service01".to_string()]).unwrap().unwrap();
        assert_eq!(selection, vec![StackId::new("Service01")]);

        let err = env.selection(&["Nope".to_string()]).unwrap_err();
        assert!(matches!(err, EnvError::Core(CoreError::UnknownStack(name)) if name == "Nope"));
    }
}
