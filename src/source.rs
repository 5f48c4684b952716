use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// One named piece of submitted source text
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourceUnit {
    pub name: String,
    pub text: String,
    #[serde(default)]
    pub entry_point: bool,
}

impl SourceUnit {
    pub fn new(name: impl Into<String>, text: impl Into<String>, entry_point: bool) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
            entry_point,
        }
    }

    pub fn entry(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(name, text, true)
    }

    pub fn library(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(name, text, false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("no source units submitted")]
    Empty,
    #[error("source unit name must not be empty")]
    EmptyName,
    #[error("duplicate source unit name '{0}'")]
    DuplicateName(String),
    #[error("no source unit is marked as entry point")]
    NoEntryPoint,
    #[error("more than one source unit is marked as entry point ('{0}' and '{1}')")]
    MultipleEntryPoints(String, String),
}

/// Checks the structural constraints of a submission and returns the entry unit
pub fn validate_units(units: &[SourceUnit]) -> Result<&SourceUnit, SourceError> {
    if units.is_empty() {
        return Err(SourceError::Empty);
    }

    let mut names = HashSet::with_capacity(units.len());
    let mut entry: Option<&SourceUnit> = None;

    for unit in units {
        if unit.name.trim().is_empty() {
            return Err(SourceError::EmptyName);
        }
        if !names.insert(unit.name.as_str()) {
            return Err(SourceError::DuplicateName(unit.name.clone()));
        }
        if unit.entry_point {
            if let Some(first) = entry {
                return Err(SourceError::MultipleEntryPoints(
                    first.name.clone(),
                    unit.name.clone(),
                ));
            }
            entry = Some(unit);
        }
    }

    entry.ok_or(SourceError::NoEntryPoint)
}

/// Total size of the submitted source text in bytes
pub fn total_size(units: &[SourceUnit]) -> usize {
    units.iter().map(|u| u.text.len()).sum()
}
