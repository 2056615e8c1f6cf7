//! Reference registry for cross-stack exports.
//!
//! Export names form one flat namespace. Each name is published once, by the
//! stack that owns it, and can then be resolved any number of times by stacks
//! deployed later. The registry is shared across a run and is cleared only
//! when a new full run starts.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::stack::StackId;

/// Placeholder shown instead of a sensitive value.
pub const REDACTED: &str = "****";

/// A published export.
#[derive(Clone, Serialize, Deserialize)]
pub struct ExportRecord {
    pub name: String,
    pub value: String,
    pub producer: StackId,
    pub sensitive: bool,
    pub published_at: DateTime<Utc>,
}

impl ExportRecord {
    /// The value as it may appear in logs and reports.
    pub fn display_value(&self) -> &str {
        if self.sensitive {
            REDACTED
        } else {
            &self.value
        }
    }
}

impl std::fmt::Debug for ExportRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportRecord")
            .field("name", &self.name)
            .field("value", &self.display_value())
            .field("producer", &self.producer)
            .field("sensitive", &self.sensitive)
            .finish()
    }
}

impl std::fmt::Display for ExportRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} = {} (from {})", self.name, self.display_value(), self.producer)
    }
}

/// Process-wide store of export values.
///
/// Cloning is cheap and yields a handle to the same store.
#[derive(Clone, Default)]
pub struct ReferenceRegistry {
    exports: Arc<RwLock<HashMap<String, ExportRecord>>>,
}

impl ReferenceRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    ///
    /// Handles returned here all share one store.
    pub fn global() -> &'static ReferenceRegistry {
        static GLOBAL: OnceLock<ReferenceRegistry> = OnceLock::new();
        GLOBAL.get_or_init(ReferenceRegistry::new)
    }

    /// Publish an export.
    ///
    /// Fails if the name was already published; the first value is kept.
    pub fn publish(
        &self,
        name: impl Into<String>,
        value: impl Into<String>,
        producer: &StackId,
        sensitive: bool,
    ) -> CoreResult<()> {
        let name = name.into();
        let mut exports = self.exports.write();
        if let Some(existing) = exports.get(&name) {
            return Err(CoreError::DuplicateExport {
                name,
                owner: existing.producer.clone(),
            });
        }

        let record = ExportRecord {
            name: name.clone(),
            value: value.into(),
            producer: producer.clone(),
            sensitive,
            published_at: Utc::now(),
        };
        debug!("Published export {}", record);
        exports.insert(name, record);
        Ok(())
    }

    /// Resolve an export to its published value.
    pub fn resolve(&self, name: &str) -> CoreResult<String> {
        self.exports
            .read()
            .get(name)
            .map(|r| r.value.clone())
            .ok_or_else(|| CoreError::UnresolvedImport(name.to_string()))
    }

    /// Get the full record of a published export.
    pub fn get(&self, name: &str) -> Option<ExportRecord> {
        self.exports.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.exports.read().contains_key(name)
    }

    /// Resolve several imports at once, failing on the first missing one.
    pub fn resolve_all<'a>(
        &self,
        names: impl IntoIterator<Item = &'a String>,
    ) -> CoreResult<HashMap<String, String>> {
        let exports = self.exports.read();
        names
            .into_iter()
            .map(|name| {
                exports
                    .get(name)
                    .map(|r| (name.clone(), r.value.clone()))
                    .ok_or_else(|| CoreError::UnresolvedImport(name.clone()))
            })
            .collect()
    }

    /// All records, sorted by export name.
    pub fn records(&self) -> Vec<ExportRecord> {
        let mut records: Vec<_> = self.exports.read().values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub fn len(&self) -> usize {
        self.exports.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.exports.read().is_empty()
    }

    /// Drop every export. Only done at the start of a full new run.
    pub fn clear(&self) {
        debug!("Clearing reference registry");
        self.exports.write().clear();
    }
}

impl std::fmt::Debug for ReferenceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let exports = self.exports.read();
        let mut names: Vec<_> = exports.keys().collect();
        names.sort();
        f.debug_struct("ReferenceRegistry")
            .field("exports", &names)
            .finish()
    }
}
