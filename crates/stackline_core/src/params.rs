//! Deploy-time parameters.
//!
//! Parameters are given as `Stack:name=value` to target one stack, or as
//! `name=value` to apply to every stack that declares `name`. A scoped value
//! wins over an unscoped one.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::registry::REDACTED;
use crate::stack::{Stack, StackId};

/// One parsed parameter assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterAssignment {
    pub stack: Option<StackId>,
    pub name: String,
    pub value: String,
}

impl FromStr for ParameterAssignment {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| CoreError::InvalidParameter(format!("expected NAME=VALUE, got '{}'", s)))?;

        let (stack, name) = match key.split_once(':') {
            Some((stack, name)) => (Some(stack.trim()), name.trim()),
            None => (None, key.trim()),
        };

        if name.is_empty() || stack.map_or(false, str::is_empty) {
            return Err(CoreError::InvalidParameter(format!("malformed parameter '{}'", s)));
        }

        Ok(Self {
            stack: stack.map(StackId::new),
            name: name.to_string(),
            value: value.to_string(),
        })
    }
}

/// Parameter values for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Parameters {
    scoped: HashMap<StackId, HashMap<String, String>>,
    global: HashMap<String, String>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a list of `[Stack:]name=value` strings.
    pub fn parse<I, S>(items: I) -> CoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut params = Self::new();
        for item in items {
            params.insert(item.as_ref().parse()?);
        }
        Ok(params)
    }

    pub fn insert(&mut self, assignment: ParameterAssignment) {
        match assignment.stack {
            Some(stack) => {
                self.scoped
                    .entry(stack)
                    .or_default()
                    .insert(assignment.name, assignment.value);
            }
            None => {
                self.global.insert(assignment.name, assignment.value);
            }
        }
    }

    /// Set a value for one stack.
    pub fn with(mut self, stack: impl Into<StackId>, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(ParameterAssignment {
            stack: Some(stack.into()),
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Explicitly supplied value for `stack`, scoped first.
    pub fn get(&self, stack: &StackId, name: &str) -> Option<&str> {
        self.scoped
            .get(stack)
            .and_then(|m| m.get(name))
            .or_else(|| self.global.get(name))
            .map(String::as_str)
    }

    /// Fill every unset `no_echo` parameter of `stacks` with [`REDACTED`].
    ///
    /// Lets template synthesis run without deploy-time secrets. Values that
    /// were given explicitly are kept.
    pub fn with_placeholders<'a>(mut self, stacks: impl IntoIterator<Item = &'a Stack>) -> Self {
        for stack in stacks {
            for decl in &stack.parameters {
                if decl.no_echo && decl.default.is_none() && self.get(&stack.id, &decl.name).is_none() {
                    self.insert(ParameterAssignment {
                        stack: Some(stack.id.clone()),
                        name: decl.name.clone(),
                        value: REDACTED.to_string(),
                    });
                }
            }
        }
        self
    }

    /// Stacks named by scoped parameters.
    pub fn scoped_stacks(&self) -> impl Iterator<Item = &StackId> {
        self.scoped.keys()
    }

    /// Values for every parameter `stack` declares, falling back to defaults.
    ///
    /// Fails on the first declared parameter with neither a value nor a
    /// default.
    pub fn resolve_for(&self, stack: &Stack) -> CoreResult<HashMap<String, String>> {
        let mut values = HashMap::new();
        for decl in &stack.parameters {
            let value = self
                .get(&stack.id, &decl.name)
                .map(str::to_string)
                .or_else(|| decl.default.clone())
                .ok_or_else(|| CoreError::MissingParameter {
                    stack: stack.id.clone(),
                    parameter: decl.name.clone(),
                })?;
            values.insert(decl.name.clone(), value);
        }
        Ok(values)
    }
}
