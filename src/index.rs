//! Formula repository index - in-memory lookup over a set of formulae.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::error::{EngineError, Result};
use crate::formula::Formula;

/// Immutable index over one repository snapshot of formulae, supporting
/// lookup by name and reverse-dependency queries.
#[derive(Debug)]
pub struct FormulaIndex {
    formulae: BTreeMap<String, Formula>,
    /// name -> names of formulae that declare a dependency on it
    dependents: BTreeMap<String, BTreeSet<String>>,
}

impl FormulaIndex {
    /// Build an index, rejecting duplicate formula names.
    pub fn build(formulae: Vec<Formula>) -> Result<Self> {
        let mut map = BTreeMap::new();
        let mut dependents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for formula in formulae {
            let name = formula.name.clone();
            for dep in &formula.dependencies {
                dependents
                    .entry(dep.name.clone())
                    .or_default()
                    .insert(name.clone());
            }
            if map.insert(name.clone(), formula).is_some() {
                return Err(EngineError::DuplicateFormula(name));
            }
        }

        Ok(Self {
            formulae: map,
            dependents,
        })
    }

    /// Load every `*.json` formula declaration in a directory.
    ///
    /// Deserialization is the only "parsing" the engine does; recipe syntax
    /// itself is the loading front end's concern.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut formulae = Vec::new();
        let mut entries: Vec<_> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = std::fs::read_to_string(&path)?;
            let formula: Formula = serde_json::from_str(&contents)?;
            formulae.push(formula);
        }

        Self::build(formulae)
    }

    /// Look up a formula by name
    pub fn lookup(&self, name: &str) -> Result<&Formula> {
        self.formulae
            .get(name)
            .ok_or_else(|| EngineError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.formulae.contains_key(name)
    }

    /// Formulae that declare a dependency (of any kind) on `name`
    pub fn dependents_of(&self, name: &str) -> Vec<&Formula> {
        self.dependents
            .get(name)
            .into_iter()
            .flatten()
            .filter_map(|n| self.formulae.get(n))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.formulae.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formulae.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Formula> {
        self.formulae.values()
    }
}
