//! Provisioning backend trait and types.
//!
//! The engine never creates resources itself. For every stack it hands a
//! [`ProvisionRequest`] to a backend, which performs the create/update and
//! reports the output values the stack's exports are built from.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CoreResult;
use crate::registry::REDACTED;
use crate::scaling::BoundPolicy;
use crate::stack::{Stack, StackId};

/// Everything a backend needs to create or update one stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub stack: Stack,
    /// Resolved imports, keyed by export name.
    pub imports: HashMap<String, String>,
    /// Imports whose values must not be written anywhere readable.
    #[serde(default)]
    pub sensitive_imports: BTreeSet<String>,
    /// Parameter values, defaults applied.
    pub parameters: HashMap<String, String>,
    /// Scaling policies bound to resources of this stack.
    pub scaling: Vec<BoundPolicy>,
}

impl ProvisionRequest {
    pub fn id(&self) -> &StackId {
        &self.stack.id
    }

    /// Imports with every sensitive value replaced by [`REDACTED`].
    pub fn redacted_imports(&self) -> HashMap<String, String> {
        self.imports
            .iter()
            .map(|(name, value)| {
                let value = if self.sensitive_imports.contains(name) {
                    REDACTED.to_string()
                } else {
                    value.clone()
                };
                (name.clone(), value)
            })
            .collect()
    }
}

/// What a backend reports after provisioning a stack.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionOutcome {
    /// Output values keyed by `LogicalId.Attribute`.
    pub outputs: HashMap<String, String>,
    /// Physical identifiers of created resources, keyed by logical id.
    #[serde(default)]
    pub physical_ids: HashMap<String, String>,
}

impl ProvisionOutcome {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }
}

/// A request to delete one stack's resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeardownRequest {
    pub stack: Stack,
}

/// External collaborator that creates and deletes stack resources.
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        "backend"
    }

    /// Create or update the resources of a stack.
    ///
    /// Errors are reported as provisioning failures of that stack.
    async fn provision(&self, request: &ProvisionRequest) -> CoreResult<ProvisionOutcome>;

    /// Delete the resources of a stack.
    async fn destroy(&self, request: &TeardownRequest) -> CoreResult<()>;
}
