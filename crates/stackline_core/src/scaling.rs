//! Scaling policy binder.
//!
//! Records utilization-based autoscaling rules for scalable resources. The
//! binder only validates and records; the policies are handed to the
//! provisioning backend together with the owning stack, and enforcement is
//! left to the runtime behind it.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{CoreError, CoreResult};
use crate::stack::StackId;

/// A scalable dimension of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScalableDimension {
    /// Number of running tasks of a service.
    TaskCount,
    /// Provisioned read capacity of a table.
    ReadCapacity,
    /// Provisioned write capacity of a table.
    WriteCapacity,
    Custom(String),
}

impl ScalableDimension {
    pub fn as_str(&self) -> &str {
        match self {
            Self::TaskCount => "task-count",
            Self::ReadCapacity => "read-capacity",
            Self::WriteCapacity => "write-capacity",
            Self::Custom(s) => s.as_str(),
        }
    }
}

impl std::fmt::Display for ScalableDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The metric a policy tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UtilizationMetric {
    #[default]
    Cpu,
    Memory,
    /// Consumed over provisioned capacity, for tables.
    Capacity,
}

/// A resource inside a stack, addressed by logical id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub stack: StackId,
    pub logical_id: String,
}

impl ResourceRef {
    pub fn new(stack: impl Into<StackId>, logical_id: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            logical_id: logical_id.into(),
        }
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.stack, self.logical_id)
    }
}

/// Target-tracking autoscaling rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub min_capacity: u32,
    pub max_capacity: u32,
    pub target_utilization_percent: f64,
    #[serde(default)]
    pub metric: UtilizationMetric,
    #[serde(default)]
    pub scale_in_cooldown_secs: u64,
    #[serde(default)]
    pub scale_out_cooldown_secs: u64,
}

impl ScalingPolicy {
    /// A policy with no cooldowns, tracking CPU.
    pub fn new(min_capacity: u32, max_capacity: u32, target_utilization_percent: f64) -> Self {
        Self {
            min_capacity,
            max_capacity,
            target_utilization_percent,
            metric: UtilizationMetric::default(),
            scale_in_cooldown_secs: 0,
            scale_out_cooldown_secs: 0,
        }
    }

    pub fn with_metric(mut self, metric: UtilizationMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_cooldowns(mut self, scale_in: Duration, scale_out: Duration) -> Self {
        self.scale_in_cooldown_secs = scale_in.as_secs();
        self.scale_out_cooldown_secs = scale_out.as_secs();
        self
    }

    pub fn scale_in_cooldown(&self) -> Duration {
        Duration::from_secs(self.scale_in_cooldown_secs)
    }

    pub fn scale_out_cooldown(&self) -> Duration {
        Duration::from_secs(self.scale_out_cooldown_secs)
    }

    /// Check capacity bounds and target utilization.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_capacity > self.max_capacity {
            return Err(format!(
                "min capacity {} exceeds max capacity {}",
                self.min_capacity, self.max_capacity
            ));
        }
        let target = self.target_utilization_percent;
        if !(target > 0.0 && target <= 100.0) {
            return Err(format!("target utilization {} is outside (0, 100]", target));
        }
        Ok(())
    }
}

/// A recorded policy with the resource and dimension it is bound to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundPolicy {
    pub resource: ResourceRef,
    pub dimension: ScalableDimension,
    pub policy: ScalingPolicy,
}

/// Records at most one scaling policy per (resource, dimension).
#[derive(Debug, Clone, Default)]
pub struct ScalingPolicyBinder {
    policies: BTreeMap<(ResourceRef, ScalableDimension), ScalingPolicy>,
}

impl ScalingPolicyBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and record a policy.
    pub fn attach(
        &mut self,
        resource: ResourceRef,
        dimension: ScalableDimension,
        policy: ScalingPolicy,
    ) -> CoreResult<()> {
        if let Err(reason) = policy.validate() {
            return Err(CoreError::InvalidPolicy {
                resource: resource.to_string(),
                dimension: dimension.to_string(),
                reason,
            });
        }

        let key = (resource, dimension);
        if self.policies.contains_key(&key) {
            return Err(CoreError::DuplicatePolicy {
                resource: key.0.to_string(),
                dimension: key.1.to_string(),
            });
        }

        info!(
            "Scaling {} {} between {} and {} at {}% {:?}",
            key.0,
            key.1,
            policy.min_capacity,
            policy.max_capacity,
            policy.target_utilization_percent,
            policy.metric
        );
        self.policies.insert(key, policy);
        Ok(())
    }

    pub fn get(&self, resource: &ResourceRef, dimension: &ScalableDimension) -> Option<&ScalingPolicy> {
        self.policies.get(&(resource.clone(), dimension.clone()))
    }

    /// All policies bound to resources of `stack`.
    pub fn for_stack(&self, stack: &StackId) -> Vec<BoundPolicy> {
        self.policies
            .iter()
            .filter(|((resource, _), _)| &resource.stack == stack)
            .map(|((resource, dimension), policy)| BoundPolicy {
                resource: resource.clone(),
                dimension: dimension.clone(),
                policy: policy.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
