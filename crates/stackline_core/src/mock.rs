//! Mock provisioning backend for testing.
//!
//! Provides a configurable implementation of [`ProvisioningBackend`] that
//! returns scripted outputs, simulates failures and captures every call, so
//! orchestration can be tested without creating anything.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::backend::{ProvisionOutcome, ProvisionRequest, ProvisioningBackend, TeardownRequest};
use crate::error::{CoreError, CoreResult};
use crate::registry::ReferenceRegistry;
use crate::stack::StackId;

/// Captured call information for verification.
#[derive(Debug, Clone)]
pub struct CapturedCall {
    pub method: String,
    pub stack: StackId,
    pub imports: HashMap<String, String>,
    pub parameters: HashMap<String, String>,
    pub policies: usize,
}

#[derive(Clone)]
struct Probe {
    registry: ReferenceRegistry,
    names: Vec<String>,
}

/// Mock backend for testing.
#[derive(Clone, Default)]
pub struct MockBackend {
    /// Scripted outputs per stack.
    outputs: Arc<RwLock<HashMap<StackId, HashMap<String, String>>>>,
    /// Stacks whose provisioning fails, with the reported cause.
    failures: Arc<RwLock<HashMap<StackId, String>>>,
    /// Stacks whose teardown fails.
    teardown_failures: Arc<RwLock<HashMap<StackId, String>>>,
    captured_calls: Arc<RwLock<Vec<CapturedCall>>>,
    /// Registry values seen at the start of each provision call.
    observed: Arc<RwLock<Vec<(StackId, HashMap<String, Option<String>>)>>>,
    probe: Arc<RwLock<Option<Probe>>>,
    delay: Arc<RwLock<Option<Duration>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockBackend {
    /// Create a new mock backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script an output the backend reports after provisioning `stack`.
    pub fn with_output(
        self,
        stack: impl Into<StackId>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.outputs
            .write()
            .entry(stack.into())
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    /// Make provisioning of `stack` fail with `cause`.
    pub fn fail_on(self, stack: impl Into<StackId>, cause: impl Into<String>) -> Self {
        self.failures.write().insert(stack.into(), cause.into());
        self
    }

    /// Make teardown of `stack` fail with `cause`.
    pub fn fail_teardown_on(self, stack: impl Into<StackId>, cause: impl Into<String>) -> Self {
        self.teardown_failures.write().insert(stack.into(), cause.into());
        self
    }

    /// Record the value of each of `names` in `registry` whenever a stack
    /// starts provisioning.
    pub fn with_probe(self, registry: ReferenceRegistry, names: &[&str]) -> Self {
        *self.probe.write() = Some(Probe {
            registry,
            names: names.iter().map(|n| n.to_string()).collect(),
        });
        self
    }

    /// Sleep this long inside every provision call.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.write() = Some(delay);
        self
    }

    /// All captured calls.
    pub fn get_calls(&self) -> Vec<CapturedCall> {
        self.captured_calls.read().clone()
    }

    /// Captured calls for a specific method.
    pub fn get_method_calls(&self, method: &str) -> Vec<CapturedCall> {
        self.captured_calls
            .read()
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    /// Stacks passed to `method`, in call order.
    pub fn stacks_called(&self, method: &str) -> Vec<String> {
        self.get_method_calls(method)
            .into_iter()
            .map(|c| c.stack.to_string())
            .collect()
    }

    /// Probe results recorded when `stack` started provisioning.
    pub fn observed_for(&self, stack: &str) -> Option<HashMap<String, Option<String>>> {
        self.observed
            .read()
            .iter()
            .find(|(id, _)| id.as_str() == stack)
            .map(|(_, seen)| seen.clone())
    }

    /// Highest number of concurrent provision calls seen.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Clear captured calls.
    pub fn clear_calls(&self) {
        self.captured_calls.write().clear();
        self.observed.write().clear();
    }

    fn capture(&self, method: &str, request: Option<&ProvisionRequest>, stack: &StackId) {
        let call = CapturedCall {
            method: method.to_string(),
            stack: stack.clone(),
            imports: request.map(|r| r.imports.clone()).unwrap_or_default(),
            parameters: request.map(|r| r.parameters.clone()).unwrap_or_default(),
            policies: request.map_or(0, |r| r.scaling.len()),
        };
        self.captured_calls.write().push(call);
    }
}

#[async_trait]
impl ProvisioningBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn provision(&self, request: &ProvisionRequest) -> CoreResult<ProvisionOutcome> {
        let stack = request.id().clone();
        self.capture("provision", Some(request), &stack);

        let probe = self.probe.read().clone();
        if let Some(probe) = probe {
            let seen = probe
                .names
                .iter()
                .map(|n| (n.clone(), probe.registry.resolve(n).ok()))
                .collect();
            self.observed.write().push((stack.clone(), seen));
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(cause) = self.failures.read().get(&stack) {
            return Err(CoreError::Provisioning {
                stack,
                cause: cause.clone(),
            });
        }

        let outputs = self.outputs.read().get(&stack).cloned().unwrap_or_default();
        Ok(ProvisionOutcome {
            outputs,
            physical_ids: request
                .stack
                .resources
                .iter()
                .map(|r| (r.logical_id.clone(), format!("mock-{}-{}", stack, r.logical_id)))
                .collect(),
        })
    }

    async fn destroy(&self, request: &TeardownRequest) -> CoreResult<()> {
        self.capture("destroy", None, &request.stack.id);

        if let Some(cause) = self.teardown_failures.read().get(&request.stack.id) {
            return Err(CoreError::Provisioning {
                stack: request.stack.id.clone(),
                cause: cause.clone(),
            });
        }
        Ok(())
    }
}
