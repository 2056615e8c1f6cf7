//! Stack declarations.
//!
//! A stack is a named unit of resource declarations. It can depend on other
//! stacks, export named values once its resources exist, and import values
//! exported by stacks deployed before it.
//!
//! Resource declarations are opaque to the engine: they are handed to the
//! provisioning backend as JSON. Imports are referenced inside declarations
//! through [`import_value`] tokens which the backend replaces with the
//! resolved values (see [`substitute_imports`]).

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Stable stack identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StackId(String);

impl StackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StackId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for StackId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// What a stack provides to the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StackKind {
    Network,
    Cluster,
    Database,
    Messaging,
    Table,
    Service,
    Custom(String),
}

impl StackKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Network => "network",
            Self::Cluster => "cluster",
            Self::Database => "database",
            Self::Messaging => "messaging",
            Self::Table => "table",
            Self::Service => "service",
            Self::Custom(s) => s.as_str(),
        }
    }
}

impl std::fmt::Display for StackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single resource declaration inside a stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDecl {
    /// Logical id, unique within the stack (e.g. `Rds01`).
    pub logical_id: String,
    /// Resource type understood by the backend (e.g. `database-instance`).
    pub kind: String,
    /// Backend-specific properties.
    pub properties: serde_json::Value,
}

impl ResourceDecl {
    pub fn new(logical_id: impl Into<String>, kind: impl Into<String>, properties: serde_json::Value) -> Self {
        Self {
            logical_id: logical_id.into(),
            kind: kind.into(),
            properties,
        }
    }

    /// Key of a backend output attribute of this resource, e.g. `Rds01.Endpoint`.
    pub fn attribute(&self, name: &str) -> String {
        output_key(&self.logical_id, name)
    }
}

/// Key under which a backend reports an attribute of a resource.
pub fn output_key(logical_id: &str, attribute: &str) -> String {
    format!("{}.{}", logical_id, attribute)
}

/// Where the value of an export comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportSource {
    /// An output key returned by the backend after provisioning.
    Output(String),
    /// A parameter supplied to the stack at deploy time.
    Parameter(String),
}

/// A named value a stack publishes once its resources exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSpec {
    pub name: String,
    pub source: ExportSource,
    /// Sensitive values are redacted from logs and reports.
    #[serde(default)]
    pub sensitive: bool,
}

/// A deploy-time parameter a stack accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDecl {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub default: Option<String>,
    /// Value must never be echoed in logs.
    #[serde(default)]
    pub no_echo: bool,
}

impl ParameterDecl {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            default: None,
            no_echo: false,
        }
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn no_echo(mut self) -> Self {
        self.no_echo = true;
        self
    }

    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

/// A stack: a named, typed unit of resource declarations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stack {
    pub id: StackId,
    pub kind: StackKind,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub resources: Vec<ResourceDecl>,
    #[serde(default)]
    pub exports: Vec<ExportSpec>,
    /// Export names this stack requires, in declaration order.
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterDecl>,
}

impl Stack {
    pub fn new(id: impl Into<StackId>, kind: StackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            description: None,
            resources: Vec::new(),
            exports: Vec::new(),
            imports: Vec::new(),
            parameters: Vec::new(),
        }
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    pub fn resource(mut self, resource: ResourceDecl) -> Self {
        self.resources.push(resource);
        self
    }

    /// Export a backend output under a global export name.
    pub fn export_output(self, name: impl Into<String>, output: impl Into<String>) -> CoreResult<Self> {
        self.export(ExportSpec {
            name: name.into(),
            source: ExportSource::Output(output.into()),
            sensitive: false,
        })
    }

    /// Export the value of one of this stack's parameters.
    ///
    /// The export is sensitive when the parameter is `no_echo`.
    pub fn export_parameter(self, name: impl Into<String>, parameter: &str) -> CoreResult<Self> {
        let sensitive = self
            .parameters
            .iter()
            .find(|p| p.name == parameter)
            .map(|p| p.no_echo)
            .ok_or_else(|| {
                CoreError::InvalidParameter(format!(
                    "{} exports undeclared parameter '{}'",
                    self.id, parameter
                ))
            })?;
        self.export(ExportSpec {
            name: name.into(),
            source: ExportSource::Parameter(parameter.to_string()),
            sensitive,
        })
    }

    /// Add an export, validating its name.
    pub fn export(mut self, spec: ExportSpec) -> CoreResult<Self> {
        validate_export_name(&spec.name)?;
        if self.exports.iter().any(|e| e.name == spec.name) {
            return Err(CoreError::InvalidExportName(format!(
                "'{}' exported twice by {}",
                spec.name, self.id
            )));
        }
        self.exports.push(spec);
        Ok(self)
    }

    /// Declare an import. Duplicates are ignored.
    pub fn import(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.imports.contains(&name) {
            self.imports.push(name);
        }
        self
    }

    pub fn parameter(mut self, parameter: ParameterDecl) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Find a declared export by name.
    pub fn find_export(&self, name: &str) -> Option<&ExportSpec> {
        self.exports.iter().find(|e| e.name == name)
    }

    pub fn find_parameter(&self, name: &str) -> Option<&ParameterDecl> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

fn export_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9:\-]{0,254}$").expect("export name pattern is valid")
    })
}

/// Export names are alphanumeric with `-` and `:`, at most 255 characters.
pub fn validate_export_name(name: &str) -> CoreResult<()> {
    if export_name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(CoreError::InvalidExportName(name.to_string()))
    }
}

const IMPORT_PREFIX: &str = "${Import:";

/// Token that refers to an imported value inside a resource declaration.
pub fn import_value(name: &str) -> String {
    format!("{}{}}}", IMPORT_PREFIX, name)
}

/// Replace every [`import_value`] token in `value` with its resolved import.
///
/// Tokens naming an import that is not in `imports` are reported as
/// unresolved.
pub fn substitute_imports(
    value: &serde_json::Value,
    imports: &HashMap<String, String>,
) -> CoreResult<serde_json::Value> {
    use serde_json::Value;

    Ok(match value {
        Value::String(s) => Value::String(substitute_str(s, imports)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| substitute_imports(v, imports))
                .collect::<CoreResult<_>>()?,
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), substitute_imports(v, imports)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

fn substitute_str(s: &str, imports: &HashMap<String, String>) -> CoreResult<String> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find(IMPORT_PREFIX) {
        out.push_str(&rest[..start]);
        let after = &rest[start + IMPORT_PREFIX.len()..];
        let end = after
            .find('}')
            .ok_or_else(|| CoreError::UnresolvedImport(after.to_string()))?;
        let name = &after[..end];
        let value = imports
            .get(name)
            .ok_or_else(|| CoreError::UnresolvedImport(name.to_string()))?;
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
