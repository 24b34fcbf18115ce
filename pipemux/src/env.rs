//! Effective environment for spawned processes.
//!
//! | diff            | result                               |
//! |-----------------|--------------------------------------|
//! | `None`          | worker environment, untouched        |
//! | `Some(empty)`   | empty environment                    |
//! | `{k: Set(v)}`   | worker environment with `k=v`        |
//! | `{k: Unset}`    | worker environment without `k`       |
//!
//! Variable names are opaque platform strings; nothing is normalized.

use std::collections::BTreeMap;
use std::ffi::OsString;

use serde::{Deserialize, Serialize};

/// Change applied to one variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvValue {
    Set(String),
    Unset,
}

/// Per-variable overrides and removals, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvDiff {
    entries: BTreeMap<String, EnvValue>,
}

impl EnvDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries
            .insert(name.into(), EnvValue::Set(value.into()));
        self
    }

    pub fn unset(&mut self, name: impl Into<String>) -> &mut Self {
        self.entries.insert(name.into(), EnvValue::Unset);
        self
    }

    pub fn with_set(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn with_unset(mut self, name: impl Into<String>) -> Self {
        self.unset(name);
        self
    }

    pub fn get(&self, name: &str) -> Option<&EnvValue> {
        self.entries.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &EnvValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, EnvValue)> for EnvDiff {
    fn from_iter<I: IntoIterator<Item = (String, EnvValue)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Compute the environment a process should see, given the ambient one.
///
/// Returns `None` when the ambient environment should be inherited as-is.
pub fn effective_environment<I>(
    ambient: I,
    diff: Option<&EnvDiff>,
) -> Option<BTreeMap<OsString, OsString>>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let diff = diff?;
    if diff.is_empty() {
        return Some(BTreeMap::new());
    }

    let mut vars: BTreeMap<OsString, OsString> = ambient.into_iter().collect();
    for (name, value) in diff.iter() {
        match value {
            EnvValue::Set(v) => {
                vars.insert(OsString::from(name), OsString::from(v));
            }
            EnvValue::Unset => {
                vars.remove(&OsString::from(name));
            }
        }
    }
    Some(vars)
}

/// Apply `diff` to a command about to be spawned, using the worker's own
/// environment as the ambient one.
pub fn apply_environment(command: &mut tokio::process::Command, diff: Option<&EnvDiff>) {
    if let Some(vars) = effective_environment(std::env::vars_os(), diff) {
        command.env_clear();
        command.envs(vars);
    }
}
