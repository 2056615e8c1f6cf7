//! File-backed provisioning backend.
//!
//! Nothing is created in a cloud. Provisioning a stack writes its resolved
//! template to `<output_dir>/<Stack>.template.json` and records the stack in
//! `<state_dir>/state.json`, together with resource attributes derived
//! deterministically from the declarations. Destroying a stack removes both.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use stackline_core::{
    output_key, substitute_imports, BoundPolicy, CoreResult, ProvisionOutcome, ProvisionRequest,
    ProvisioningBackend, ResourceDecl, TeardownRequest, REDACTED,
};

use crate::config::EnvironmentConfig;
use crate::error::{EnvError, EnvResult};

const STATE_FILE: &str = "state.json";
const ACCOUNT: &str = "000000000000";

/// A stack recorded as deployed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployedStack {
    pub deployed_at: DateTime<Utc>,
    pub outputs: BTreeMap<String, String>,
    pub physical_ids: BTreeMap<String, String>,
    #[serde(default)]
    pub scaling: Vec<BoundPolicy>,
}

/// Contents of the state file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalState {
    pub stacks: BTreeMap<String, DeployedStack>,
}

impl LocalState {
    pub fn load(path: &Path) -> EnvResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| EnvError::State(format!("{}: {}", path.display(), e)))
    }

    fn save(&self, path: &Path) -> EnvResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Backend that materializes stacks as files.
pub struct LocalBackend {
    region: String,
    output_dir: PathBuf,
    state_path: PathBuf,
    /// Write templates without recording anything as deployed.
    synth_only: bool,
    state: Mutex<LocalState>,
}

impl LocalBackend {
    /// Open the backend for `config`, loading any existing state.
    pub fn new(config: &EnvironmentConfig) -> EnvResult<Self> {
        let state_path = config.state_dir.join(STATE_FILE);
        let state = LocalState::load(&state_path)?;
        debug!(
            "Local backend: {} deployed stack(s) in {:?}",
            state.stacks.len(),
            state_path
        );
        Ok(Self {
            region: config.region.clone(),
            output_dir: config.output_dir.clone(),
            state_path,
            synth_only: false,
            state: Mutex::new(state),
        })
    }

    pub fn synth_only(mut self) -> Self {
        self.synth_only = true;
        self
    }

    /// Snapshot of the recorded state.
    pub fn state(&self) -> LocalState {
        self.state.lock().clone()
    }

    pub fn is_deployed(&self, stack: &str) -> bool {
        self.state.lock().stacks.contains_key(stack)
    }

    pub fn template_path(&self, stack: &str) -> PathBuf {
        self.output_dir.join(format!("{}.template.json", stack))
    }

    /// The template of one stack with imports substituted.
    pub fn render(&self, request: &ProvisionRequest) -> EnvResult<Value> {
        let stack = &request.stack;
        let imports = request.redacted_imports();
        let resources = stack
            .resources
            .iter()
            .map(|r| {
                let properties = substitute_imports(&r.properties, &imports)?;
                Ok(json!({
                    "logicalId": r.logical_id,
                    "kind": r.kind,
                    "properties": properties,
                }))
            })
            .collect::<EnvResult<Vec<_>>>()?;

        let parameters: BTreeMap<_, _> = stack
            .parameters
            .iter()
            .map(|p| {
                let value = match request.parameters.get(&p.name) {
                    Some(_) if p.no_echo => Value::from(REDACTED),
                    Some(v) => Value::from(v.as_str()),
                    None => Value::Null,
                };
                (p.name.clone(), value)
            })
            .collect();

        Ok(json!({
            "stack": stack.id,
            "kind": stack.kind.as_str(),
            "description": stack.description,
            "region": self.region,
            "parameters": parameters,
            "resources": resources,
            "exports": stack.exports,
            "scaling": request.scaling,
        }))
    }

    fn attributes(&self, stack: &str, resource: &ResourceDecl) -> Vec<(&'static str, String)> {
        let id = short_id(stack, &resource.logical_id);
        let prop = |key: &str| {
            resource.properties[key]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| resource.logical_id.to_lowercase())
        };
        let arn = |service: &str, name: &str| {
            format!("arn:aws:{}:{}:{}:{}", service, self.region, ACCOUNT, name)
        };

        match resource.kind.as_str() {
            "vpc" => vec![("Id", format!("vpc-{}", id))],
            "ecs-cluster" => {
                let name = prop("clusterName");
                vec![("Arn", arn("ecs", &format!("cluster/{}", name))), ("Name", name)]
            }
            "database-instance" => {
                let port = resource.properties["port"].as_u64().unwrap_or(3306);
                vec![
                    (
                        "Endpoint",
                        format!(
                            "{}.{}.{}.rds.amazonaws.com",
                            prop("instanceIdentifier"),
                            id,
                            self.region
                        ),
                    ),
                    ("Port", port.to_string()),
                ]
            }
            "sns-topic" => {
                let name = format!("{}-{}-{}", stack, resource.logical_id, id);
                vec![("Arn", arn("sns", &name)), ("Name", name)]
            }
            "dynamodb-table" => {
                let name = prop("tableName");
                vec![("Arn", arn("dynamodb", &format!("table/{}", name))), ("Name", name)]
            }
            "sqs-queue" => {
                let name = prop("queueName");
                vec![
                    ("Arn", arn("sqs", &name)),
                    (
                        "Url",
                        format!("https://sqs.{}.amazonaws.com/{}/{}", self.region, ACCOUNT, name),
                    ),
                    ("Name", name),
                ]
            }
            "load-balanced-service" => vec![
                ("ServiceName", prop("serviceName")),
                (
                    "LoadBalancerDns",
                    format!("{}-{}.{}.elb.amazonaws.com", stack, id, self.region).to_lowercase(),
                ),
            ],
            _ => vec![("Id", id)],
        }
    }

    fn write_template(&self, stack: &str, template: &Value) -> EnvResult<PathBuf> {
        fs::create_dir_all(&self.output_dir)?;
        let path = self.template_path(stack);
        fs::write(&path, serde_json::to_string_pretty(template)?)?;
        Ok(path)
    }

    fn apply(&self, request: &ProvisionRequest) -> EnvResult<ProvisionOutcome> {
        let stack = request.id().as_str();
        let template = self.render(request)?;
        let path = self.write_template(stack, &template)?;
        debug!("Wrote {:?}", path);

        let mut outcome = ProvisionOutcome::new();
        for resource in &request.stack.resources {
            let attributes = self.attributes(stack, resource);
            if let Some((_, primary)) = attributes.first() {
                outcome
                    .physical_ids
                    .insert(resource.logical_id.clone(), primary.clone());
            }
            for (attr, value) in attributes {
                outcome
                    .outputs
                    .insert(output_key(&resource.logical_id, attr), value);
            }
        }

        if self.synth_only {
            info!("Synthesized {} to {:?}", stack, path);
            return Ok(outcome);
        }

        let mut state = self.state.lock();
        state.stacks.insert(
            stack.to_string(),
            DeployedStack {
                deployed_at: Utc::now(),
                outputs: outcome.outputs.clone().into_iter().collect(),
                physical_ids: outcome.physical_ids.clone().into_iter().collect(),
                scaling: request.scaling.clone(),
            },
        );
        state.save(&self.state_path)?;
        info!(
            "Provisioned {} ({} resource(s))",
            stack,
            request.stack.resources.len()
        );
        Ok(outcome)
    }

    fn remove(&self, stack: &str) -> EnvResult<()> {
        let mut state = self.state.lock();
        if state.stacks.remove(stack).is_none() {
            warn!("{} is not deployed; nothing to destroy", stack);
            return Ok(());
        }
        state.save(&self.state_path)?;

        let template = self.template_path(stack);
        if template.exists() {
            fs::remove_file(&template)?;
        }
        info!("Destroyed {}", stack);
        Ok(())
    }
}

/// Short identifier for a resource, stable across runs and builds.
fn short_id(stack: &str, logical_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stack.as_bytes());
    hasher.update(b"/");
    hasher.update(logical_id.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..8].to_string()
}

#[async_trait]
impl ProvisioningBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn provision(&self, request: &ProvisionRequest) -> CoreResult<ProvisionOutcome> {
        self.apply(request).map_err(EnvError::into_core)
    }

    async fn destroy(&self, request: &TeardownRequest) -> CoreResult<()> {
        if self.synth_only {
            return Ok(());
        }
        self.remove(request.stack.id.as_str())
            .map_err(EnvError::into_core)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use stackline_core::{import_value, Stack, StackKind};
    use tempfile::TempDir;

    fn config(dir: &Path) -> EnvironmentConfig {
        EnvironmentConfig::default().rooted_at(dir)
    }

    fn request(stack: Stack, imports: &[(&str, &str)]) -> ProvisionRequest {
        ProvisionRequest {
            stack,
            imports: imports
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            sensitive_imports: Default::default(),
            parameters: HashMap::new(),
            scaling: Vec::new(),
        }
    }

    fn table_stack() -> Stack {
        Stack::new("Ddb", StackKind::Table).resource(ResourceDecl::new(
            "ProductEventsDdb",
            "dynamodb-table",
            json!({ "tableName": "product-events", "owner": import_value("team") }),
        ))
    }

    #[tokio::test]
    async fn test_provision_writes_template_and_state() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(&config(temp_dir.path())).unwrap();

        let outcome = backend
            .provision(&request(table_stack(), &[("team", "catalog")]))
            .await
            .unwrap();
        assert_eq!(outcome.outputs["ProductEventsDdb.Name"], "product-events");
        assert!(outcome.outputs["ProductEventsDdb.Arn"].ends_with("table/product-events"));

        let template: Value =
            serde_json::from_str(&fs::read_to_string(backend.template_path("Ddb")).unwrap()).unwrap();
        assert_eq!(template["resources"][0]["properties"]["owner"], "catalog");

        // A fresh backend sees the recorded state.
        let reopened = LocalBackend::new(&config(temp_dir.path())).unwrap();
        assert!(reopened.is_deployed("Ddb"));
    }

    #[tokio::test]
    async fn test_sensitive_imports_are_redacted_in_template() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(&config(temp_dir.path())).unwrap();
        let stack = Stack::new("Service01", StackKind::Service).resource(ResourceDecl::new(
            "ALB01",
            "load-balanced-service",
            json!({
                "serviceName": "service-01",
                "password": import_value("rds-password"),
                "endpoint": import_value("rds-endpoint"),
            }),
        ));
        let mut request = request(
            stack,
            &[("rds-password", "secret123"), ("rds-endpoint", "db.example.internal")],
        );
        request.sensitive_imports.insert("rds-password".to_string());

        backend.provision(&request).await.unwrap();

        let content = fs::read_to_string(backend.template_path("Service01")).unwrap();
        assert!(!content.contains("secret123"));
        let template: Value = serde_json::from_str(&content).unwrap();
        let properties = &template["resources"][0]["properties"];
        assert_eq!(properties["password"], REDACTED);
        assert_eq!(properties["endpoint"], "db.example.internal");
    }

    #[tokio::test]
    async fn test_unresolved_token_fails() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(&config(temp_dir.path())).unwrap();

        let err = backend.provision(&request(table_stack(), &[])).await.unwrap_err();
        assert!(matches!(err, stackline_core::CoreError::UnresolvedImport(name) if name == "team"));
        assert!(!backend.is_deployed("Ddb"));
    }

    #[tokio::test]
    async fn test_attributes_are_stable() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(&config(temp_dir.path())).unwrap();
        let stack = Stack::new("Sns", StackKind::Messaging).resource(ResourceDecl::new(
            "ProductEventsTopic",
            "sns-topic",
            json!({ "subscriptions": [] }),
        ));

        let first = backend.provision(&request(stack.clone(), &[])).await.unwrap();
        let second = backend.provision(&request(stack, &[])).await.unwrap();
        assert_eq!(first.outputs, second.outputs);
        assert!(first.outputs["ProductEventsTopic.Arn"].starts_with("arn:aws:sns:us-east-1:"));
    }

    #[test]
    fn test_short_id_is_fixed() {
        // sha256("Sns/ProductEventsTopic"), first 8 hex digits.
        assert_eq!(short_id("Sns", "ProductEventsTopic"), "41d1619c");
        assert_ne!(short_id("Sns", "ProductEventsTopic"), short_id("SnsP", "roductEventsTopic"));
    }

    #[tokio::test]
    async fn test_destroy_removes_stack() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(&config(temp_dir.path())).unwrap();
        let stack = table_stack();
        backend
            .provision(&request(stack.clone(), &[("team", "catalog")]))
            .await
            .unwrap();

        backend.destroy(&TeardownRequest { stack: stack.clone() }).await.unwrap();
        assert!(!backend.is_deployed("Ddb"));
        assert!(!backend.template_path("Ddb").exists());

        // Destroying again is a no-op.
        backend.destroy(&TeardownRequest { stack }).await.unwrap();
    }

    #[tokio::test]
    async fn test_synth_only_records_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(&config(temp_dir.path())).unwrap().synth_only();

        backend
            .provision(&request(table_stack(), &[("team", "catalog")]))
            .await
            .unwrap();
        assert!(backend.template_path("Ddb").exists());
        assert!(backend.state().stacks.is_empty());
    }
}
