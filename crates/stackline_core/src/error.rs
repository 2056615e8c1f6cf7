//! Error types for the core engine.

use thiserror::Error;

use crate::stack::StackId;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// The phase of a deployment run in which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// Pre-flight checks over the selected closure (parameters, import lint).
    Validate,
    ResolveImports,
    Provision,
    PublishExports,
    Teardown,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Validate => "validate",
            Phase::ResolveImports => "resolve-imports",
            Phase::Provision => "provision",
            Phase::PublishExports => "publish-exports",
            Phase::Teardown => "teardown",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn format_path(path: &[StackId]) -> String {
    path.iter().map(StackId::as_str).collect::<Vec<_>>().join(" -> ")
}

/// Errors that can occur while building or deploying a topology.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Cyclic dependency: {}", format_path(.path))]
    CyclicDependency { path: Vec<StackId> },

    #[error("Unknown stack: {0}")]
    UnknownStack(String),

    #[error("Stack already declared: {0}")]
    DuplicateStack(StackId),

    #[error("Export '{name}' already published by {owner}")]
    DuplicateExport { name: String, owner: StackId },

    #[error("Unresolved import: {0}")]
    UnresolvedImport(String),

    #[error("Import '{import}' of {stack} is produced by {producer}, which is not a dependency")]
    ImportNotInAncestry {
        stack: StackId,
        import: String,
        producer: StackId,
    },

    #[error("Invalid export name: {0}")]
    InvalidExportName(String),

    #[error("Invalid scaling policy for {resource} ({dimension}): {reason}")]
    InvalidPolicy {
        resource: String,
        dimension: String,
        reason: String,
    },

    #[error("Scaling policy already attached to {resource} ({dimension})")]
    DuplicatePolicy { resource: String, dimension: String },

    #[error("Provisioning failed for {stack}: {cause}")]
    Provisioning { stack: StackId, cause: String },

    #[error("Export '{export}' of {stack} needs output '{output}', which the backend did not return")]
    MissingOutput {
        stack: StackId,
        export: String,
        output: String,
    },

    #[error("Missing parameter {stack}:{parameter}")]
    MissingParameter { stack: StackId, parameter: String },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Run cancelled before {0}")]
    Cancelled(StackId),

    #[error("{stack} failed during {phase}: {source}")]
    StageFailed {
        stack: StackId,
        phase: Phase,
        #[source]
        source: Box<CoreError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Wrap an error with the stack and phase it happened in.
    pub fn at(self, stack: &StackId, phase: Phase) -> Self {
        CoreError::StageFailed {
            stack: stack.clone(),
            phase,
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping stage wrappers.
    pub fn root(&self) -> &CoreError {
        match self {
            CoreError::StageFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// The stack a run failed on, if the error carries one.
    pub fn failing_stack(&self) -> Option<&StackId> {
        match self {
            CoreError::StageFailed { stack, .. }
            | CoreError::Provisioning { stack, .. }
            | CoreError::MissingOutput { stack, .. }
            | CoreError::MissingParameter { stack, .. }
            | CoreError::ImportNotInAncestry { stack, .. } => Some(stack),
            _ => None,
        }
    }

    /// Whether this error comes from building the topology or its policies
    /// rather than from a deployment run.
    pub fn is_validation(&self) -> bool {
        matches!(
            self.root(),
            CoreError::CyclicDependency { .. }
                | CoreError::UnknownStack(_)
                | CoreError::DuplicateStack(_)
                | CoreError::InvalidExportName(_)
                | CoreError::InvalidPolicy { .. }
                | CoreError::DuplicatePolicy { .. }
                | CoreError::MissingParameter { .. }
                | CoreError::InvalidParameter(_)
                | CoreError::ImportNotInAncestry { .. }
        )
    }
}
