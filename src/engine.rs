//! High-level engine API: plan, execute, query.
//!
//! [`Engine`] wires the index, resolver, graph builder, artifact decision
//! engine, build executor, and state store into the three operations a front
//! end consumes: `resolve(requests) -> InstallPlan`,
//! `execute(plan) -> outcome per node`, and `query(name)`.
//!
//! Execution schedules independent DAG nodes in parallel: a node starts only
//! once every one of its dependencies has a committed record, and a failed
//! node marks its transitive dependents `Skipped` while unrelated subtrees
//! continue. Planning errors, by contrast, abort before anything runs.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::artifact::{self, ArtifactDecision};
use crate::error::{EngineError, Result};
use crate::executor::{self, BuildConfig, CancelToken, cancel_pair};
use crate::formula::{Formula, ResolvedPackage};
use crate::graph::DependencyGraph;
use crate::index::FormulaIndex;
use crate::platform::{CompatibilityPolicy, DefaultPolicy, PlatformFingerprint};
use crate::resolve::{Request, Resolution, resolve};
use crate::store::{InstalledRecord, RecordedDependency, StateStore};

/// One node of an install plan
#[derive(Debug, Clone)]
pub struct PlanNode {
    pub pkg: ResolvedPackage,
    pub decision: ArtifactDecision,
}

/// Output of the planning phase: a DAG, its build order, and the per-node
/// artifact decisions. Consumed exactly once by [`Engine::execute`].
#[derive(Debug, Clone)]
pub struct InstallPlan {
    pub order: Vec<String>,
    pub nodes: BTreeMap<String, PlanNode>,
    pub graph: DependencyGraph,
}

/// Per-node result of executing a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeOutcome {
    Installed {
        version: String,
        poured_from_bottle: bool,
    },
    /// Same version and variant already had a committed record
    AlreadyInstalled { version: String },
    Failed { error: String },
    /// Not attempted because a dependency failed
    Skipped { failed_dependency: String },
}

impl NodeOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(
            self,
            NodeOutcome::Installed { .. } | NodeOutcome::AlreadyInstalled { .. }
        )
    }
}

/// The dependency resolution and build-orchestration engine
pub struct Engine {
    index: FormulaIndex,
    platform: PlatformFingerprint,
    policy: Arc<dyn CompatibilityPolicy>,
    store: Arc<StateStore>,
    config: BuildConfig,
}

impl Engine {
    pub fn new(index: FormulaIndex, platform: PlatformFingerprint, config: BuildConfig) -> Self {
        let store = Arc::new(StateStore::new(config.install_root.clone()));
        Self {
            index,
            platform,
            policy: Arc::new(DefaultPolicy),
            store,
            config,
        }
    }

    /// Replace the bottle compatibility relation
    pub fn with_policy(mut self, policy: Arc<dyn CompatibilityPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn platform(&self) -> &PlatformFingerprint {
        &self.platform
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Planning phase: resolve versions and variants, build the DAG and its
    /// order, and decide bottle-vs-source per node. Any error here aborts
    /// before a single build starts.
    pub fn resolve(&self, requests: &[Request]) -> Result<InstallPlan> {
        let resolution: Resolution = resolve(&self.index, &self.platform, requests)?;
        let graph = DependencyGraph::build(&self.index, &self.platform, &resolution)?;
        let order = graph.topo_order()?;

        let mut nodes = BTreeMap::new();
        for (name, pkg) in &resolution.packages {
            let formula = self.index.lookup(name)?;
            let decision = artifact::decide(formula, &self.platform, self.policy.as_ref());
            nodes.insert(
                name.clone(),
                PlanNode {
                    pkg: pkg.clone(),
                    decision,
                },
            );
        }

        tracing::info!(
            "planned {} packages ({} from bottles)",
            order.len(),
            nodes.values().filter(|n| n.decision.is_bottle()).count()
        );

        Ok(InstallPlan { order, nodes, graph })
    }

    /// Execute a plan to completion, installing every node or explaining why
    /// it was not installed.
    pub async fn execute(&self, plan: InstallPlan) -> Result<BTreeMap<String, NodeOutcome>> {
        let (_handle, cancel) = cancel_pair();
        self.execute_with_cancel(plan, cancel).await
    }

    /// Like [`execute`](Self::execute) but abortable: cancelling terminates
    /// running toolchain processes and commits no further records.
    pub async fn execute_with_cancel(
        &self,
        plan: InstallPlan,
        cancel: CancelToken,
    ) -> Result<BTreeMap<String, NodeOutcome>> {
        // Dependency bookkeeping restricted to plan members
        let mut waiting_on: BTreeMap<String, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for name in &plan.order {
            let deps = plan.graph.dependencies_of(name);
            waiting_on.insert(name.clone(), deps.len());
            for dep in deps {
                dependents
                    .entry(dep.to_string())
                    .or_default()
                    .insert(name.clone());
            }
        }

        let limiter = Arc::new(tokio::sync::Semaphore::new(self.config.max_parallel));
        let mut outcomes: BTreeMap<String, NodeOutcome> = BTreeMap::new();
        let mut tasks: JoinSet<(String, NodeOutcome)> = JoinSet::new();

        for name in &plan.order {
            if waiting_on[name] == 0 {
                self.spawn_node(&mut tasks, &plan, name, &limiter, &cancel)?;
            }
        }

        while let Some(joined) = tasks.join_next().await {
            let (name, outcome) =
                joined.map_err(|e| EngineError::Other(anyhow::anyhow!("task panicked: {e}")))?;
            let succeeded = outcome.succeeded();
            outcomes.insert(name.clone(), outcome);

            if succeeded {
                // Release dependents whose last dependency just committed
                for dependent in dependents.get(&name).cloned().unwrap_or_default() {
                    if outcomes.contains_key(&dependent) {
                        continue;
                    }
                    let count = waiting_on.get_mut(&dependent).expect("plan member");
                    *count -= 1;
                    if *count == 0 {
                        self.spawn_node(&mut tasks, &plan, &dependent, &limiter, &cancel)?;
                    }
                }
            } else {
                // Mark the whole dependent subtree Skipped; unrelated
                // subtrees keep building.
                let mut frontier = vec![name.clone()];
                while let Some(failed) = frontier.pop() {
                    for dependent in dependents.get(&failed).cloned().unwrap_or_default() {
                        if outcomes.contains_key(&dependent) {
                            continue;
                        }
                        tracing::warn!("skipping {dependent}: dependency {name} failed");
                        outcomes.insert(
                            dependent.clone(),
                            NodeOutcome::Skipped {
                                failed_dependency: name.clone(),
                            },
                        );
                        frontier.push(dependent);
                    }
                }
            }
        }

        Ok(outcomes)
    }

    fn spawn_node(
        &self,
        tasks: &mut JoinSet<(String, NodeOutcome)>,
        plan: &InstallPlan,
        name: &str,
        limiter: &Arc<tokio::sync::Semaphore>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let node = plan.nodes.get(name).expect("plan member").clone();
        let formula = self.index.lookup(name)?.clone();
        let dependencies: Vec<RecordedDependency> = plan
            .graph
            .edges
            .iter()
            .filter(|e| e.from == name)
            .map(|e| RecordedDependency {
                name: e.to.clone(),
                version: plan.nodes[&e.to].pkg.version.clone(),
                kind: e.kind,
            })
            .collect();

        let config = self.config.clone();
        let platform = self.platform.clone();
        let store = Arc::clone(&self.store);
        let limiter = Arc::clone(limiter);
        let cancel = cancel.clone();
        let name = name.to_string();

        tasks.spawn(async move {
            let _permit = limiter.acquire_owned().await.expect("limiter closed");
            let outcome = install_node(
                &formula,
                &node,
                dependencies,
                &config,
                &platform,
                &store,
                &cancel,
            )
            .await;
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(err) => NodeOutcome::Failed {
                    error: err.to_string(),
                },
            };
            (name, outcome)
        });
        Ok(())
    }

    /// Current installed record for a package
    pub fn query(&self, name: &str) -> Result<InstalledRecord> {
        self.store.query(name)
    }

    /// Remove an installed package; refused while dependents reference it
    pub fn remove(&self, name: &str) -> Result<InstalledRecord> {
        self.store.remove(name)
    }
}

/// Install a single node: verify + pour a bottle, or run a source build,
/// then apply fixups and commit the record. The record is the last act; any
/// failure before it leaves no trace of the node.
async fn install_node(
    formula: &Formula,
    node: &PlanNode,
    dependencies: Vec<RecordedDependency>,
    config: &BuildConfig,
    platform: &PlatformFingerprint,
    store: &StateStore,
    cancel: &CancelToken,
) -> Result<NodeOutcome> {
    let pkg = &node.pkg;

    if let Ok(existing) = store.query(&pkg.name) {
        if existing.version == pkg.version && existing.variant == pkg.variant_fingerprint() {
            tracing::debug!("{} {} already installed", pkg.name, pkg.version);
            return Ok(NodeOutcome::AlreadyInstalled {
                version: existing.version,
            });
        }
    }

    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled(pkg.name.clone()));
    }

    let (keg, poured, skip_relocation) = match &node.decision {
        ArtifactDecision::Bottle(bottle) => {
            let archive = artifact::bottle_archive_path(
                &config.bottle_cache,
                &pkg.name,
                &pkg.version,
                &bottle.tag,
            );
            // Hash check is mandatory and fatal on mismatch; both it and the
            // unpack are blocking IO, so run them off the async runtime.
            let name = pkg.name.clone();
            let version = pkg.version.clone();
            let expected = bottle.sha256.clone();
            let skip = matches!(
                bottle.cellar,
                crate::formula::CellarClass::AnySkipRelocation
            );
            let cfg = config.clone();
            let keg = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
                artifact::verify_archive(&name, &archive, &expected)?;
                executor::pour_bottle(&archive, &name, &version, &cfg)
            })
            .await
            .map_err(|e| EngineError::Other(anyhow::anyhow!("pour task panicked: {e}")))??;
            (keg, true, skip)
        }
        ArtifactDecision::SourceBuild => {
            let (keg, log) =
                executor::build_from_source(formula, pkg, config, platform, cancel).await?;
            tracing::debug!("built {} from source, {} bytes of log", pkg.name, log.len());
            (keg, false, false)
        }
    };

    let linked = executor::apply_fixups(&keg, config, skip_relocation)?;
    let record =
        InstalledRecord::for_install(pkg, &keg, &config.install_root, dependencies, &linked, poured)?;
    store.record(&record)?;

    Ok(NodeOutcome::Installed {
        version: pkg.version.clone(),
        poured_from_bottle: poured,
    })
}
