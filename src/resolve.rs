//! Version and variant resolution.
//!
//! Given a set of requests (package names with optional version pins and
//! option selections), computes one consistent [`ResolvedPackage`] per name
//! satisfying every dependency and conflict declaration transitively.
//!
//! The algorithm is constraint propagation over the dependency declarations:
//! a worklist expands the closure in `BTreeMap` order, recording for every
//! package the requirement chain that pulled it in. When a `conflicts`
//! declaration is violated, the resolver backtracks by disabling a
//! default-enabled option along the offending chain (explicitly requested
//! options are never dropped) and re-propagates. If no assignment exists the
//! failure carries the contradictory constraint set.
//!
//! Determinism: identical requests against an unchanged index always produce
//! the identical mapping. All iteration is over ordered maps and the
//! backtrack candidate choice is chain-order deterministic.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{EngineError, Result};
use crate::formula::{DependencyKind, ResolvedPackage};
use crate::index::FormulaIndex;
use crate::platform::PlatformFingerprint;

/// One user request: a package, an optional exact-version pin, and options
/// to enable on top of the formula defaults.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub name: String,
    pub pin: Option<String>,
    pub options: Vec<String>,
}

impl Request {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Output of one resolution session
#[derive(Debug, Clone)]
pub struct Resolution {
    pub packages: BTreeMap<String, ResolvedPackage>,
}

/// Propagation state for one attempt
struct Propagation {
    packages: BTreeMap<String, ResolvedPackage>,
    /// child -> parent that first required it (None for roots)
    required_by: BTreeMap<String, Option<String>>,
    /// (owner, option, dependency) for every optional edge taken
    optional_edges: Vec<(String, String, String)>,
}

pub fn resolve(
    index: &FormulaIndex,
    platform: &PlatformFingerprint,
    requests: &[Request],
) -> Result<Resolution> {
    let explicit = validate_requests(index, requests)?;

    // Backtracking loop: each failed attempt disables one default-enabled
    // option along a conflict chain, so the loop is bounded by the number of
    // optional edges in the repository slice we touch.
    let mut disabled: BTreeSet<(String, String)> = BTreeSet::new();
    loop {
        let state = propagate(index, platform, requests, &explicit, &disabled)?;

        let Some((owner, conflictee)) = find_conflict(index, &state) else {
            return Ok(Resolution {
                packages: state.packages,
            });
        };

        if let Some(candidate) = backtrack_candidate(&state, &owner, &conflictee, &explicit) {
            tracing::debug!(
                "conflict between {owner} and {conflictee}: retrying without option {} on {}",
                candidate.1,
                candidate.0
            );
            disabled.insert(candidate);
            continue;
        }

        return Err(EngineError::ResolutionConflict {
            constraints: vec![
                format!("{owner} conflicts with {conflictee}"),
                format!("{owner} required via {}", chain(&state, &owner)),
                format!("{conflictee} required via {}", chain(&state, &conflictee)),
            ],
        });
    }
}

/// Check each request against the index: the package must exist, a pin must
/// match the declared version, and selected options must be declared.
fn validate_requests(
    index: &FormulaIndex,
    requests: &[Request],
) -> Result<BTreeMap<String, BTreeSet<String>>> {
    let mut explicit: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for request in requests {
        let formula = index.lookup(&request.name)?;

        if let Some(pin) = &request.pin {
            if pin != &formula.version && pin != &formula.effective_version() {
                return Err(EngineError::ResolutionConflict {
                    constraints: vec![format!(
                        "{} pinned to {pin} but repository provides {}",
                        request.name,
                        formula.effective_version()
                    )],
                });
            }
        }

        let declared: BTreeSet<&str> = formula.options.iter().map(|o| o.name.as_str()).collect();
        for option in &request.options {
            if !declared.contains(option.as_str()) {
                return Err(EngineError::ResolutionConflict {
                    constraints: vec![format!(
                        "{} has no option named {option}",
                        request.name
                    )],
                });
            }
        }

        explicit
            .entry(request.name.clone())
            .or_default()
            .extend(request.options.iter().cloned());
    }

    Ok(explicit)
}

fn propagate(
    index: &FormulaIndex,
    platform: &PlatformFingerprint,
    requests: &[Request],
    explicit: &BTreeMap<String, BTreeSet<String>>,
    disabled: &BTreeSet<(String, String)>,
) -> Result<Propagation> {
    let requested: BTreeSet<&str> = requests.iter().map(|r| r.name.as_str()).collect();

    let mut state = Propagation {
        packages: BTreeMap::new(),
        required_by: BTreeMap::new(),
        optional_edges: Vec::new(),
    };

    // (name, parent) worklist, seeded in request order
    let mut worklist: Vec<(String, Option<String>)> = requests
        .iter()
        .map(|r| (r.name.clone(), None))
        .collect();

    while let Some((name, parent)) = worklist.pop() {
        if state.packages.contains_key(&name) {
            continue;
        }
        let formula = index.lookup(&name)?;

        let mut options = formula.default_options();
        if let Some(extra) = explicit.get(&name) {
            options.extend(extra.iter().cloned());
        }
        options.retain(|opt| !disabled.contains(&(name.clone(), opt.clone())));

        state.required_by.entry(name.clone()).or_insert(parent);
        state.packages.insert(
            name.clone(),
            ResolvedPackage {
                name: name.clone(),
                version: formula.effective_version(),
                options: options.clone(),
                requested: requested.contains(name.as_str()),
            },
        );

        for dep in formula.install_dependencies(platform, &options) {
            // A formula referencing itself is unbuildable; fail fast here
            // rather than waiting for the graph builder.
            if dep.name == name {
                return Err(EngineError::CyclicDependency {
                    members: vec![name.clone()],
                });
            }
            if dep.kind == DependencyKind::Optional {
                if let Some(option) = &dep.option {
                    state
                        .optional_edges
                        .push((name.clone(), option.clone(), dep.name.clone()));
                }
            }
            if !state.packages.contains_key(&dep.name) {
                worklist.push((dep.name.clone(), Some(name.clone())));
            }
        }
    }

    Ok(state)
}

/// First violated `conflicts` declaration in deterministic order, as
/// (declaring package, package it conflicts with).
fn find_conflict(index: &FormulaIndex, state: &Propagation) -> Option<(String, String)> {
    for name in state.packages.keys() {
        let Ok(formula) = index.lookup(name) else {
            continue;
        };
        let mut conflicts = formula.conflicts.clone();
        conflicts.sort();
        for other in conflicts {
            if other != *name && state.packages.contains_key(&other) {
                return Some((name.clone(), other));
            }
        }
    }
    None
}

/// Find a default-enabled option along either conflict chain whose removal
/// might break the conflict. Explicitly requested options are off limits.
fn backtrack_candidate(
    state: &Propagation,
    a: &str,
    b: &str,
    explicit: &BTreeMap<String, BTreeSet<String>>,
) -> Option<(String, String)> {
    for end in [b, a] {
        let mut cursor = Some(end.to_string());
        while let Some(name) = cursor {
            for (owner, option, dep) in &state.optional_edges {
                let requested_explicitly = explicit
                    .get(owner)
                    .is_some_and(|opts| opts.contains(option));
                if dep == &name && !requested_explicitly {
                    return Some((owner.clone(), option.clone()));
                }
            }
            cursor = state.required_by.get(&name).cloned().flatten();
        }
    }
    None
}

/// Render the requirement chain that pulled `name` into the set
fn chain(state: &Propagation, name: &str) -> String {
    let mut parts = vec![name.to_string()];
    let mut cursor = state.required_by.get(name).cloned().flatten();
    while let Some(parent) = cursor {
        cursor = state.required_by.get(&parent).cloned().flatten();
        parts.push(parent);
    }
    parts.reverse();
    parts.join(" -> ")
}
