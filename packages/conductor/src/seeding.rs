//! Startup seeding: turn the workflow discovery list into stored manifests
//! and groups, then validate the dependency DAG.
//!
//! Seeding is idempotent. Groups resolve by unique name and manifests by
//! external id, so a redeploy updates definitions in place without touching
//! scheduling state. A cyclic dependency graph is fatal — the scheduler
//! refuses to start.

use std::collections::HashMap;

use junction::WorkflowRegistry;
use tracing::{info, warn};

use crate::dag::{self, DagError, DagLayout};
use crate::schedule;
use crate::store::{Manifest, ManifestGroup, SharedStore, Store, StoreError};

/// A manifest definition plus its symbolic references: group by name,
/// dependency by external id. Symbolic references survive re-seeding, where
/// raw ids would not.
#[derive(Debug, Clone)]
pub struct ManifestSeed {
    pub manifest: Manifest,
    pub group: Option<String>,
    pub depends_on: Option<String>,
}

impl ManifestSeed {
    pub fn new(manifest: Manifest) -> Self {
        Self {
            manifest,
            group: None,
            depends_on: None,
        }
    }

    pub fn in_group(mut self, name: &str) -> Self {
        self.group = Some(name.to_string());
        self
    }

    pub fn depends_on(mut self, external_id: &str) -> Self {
        self.depends_on = Some(external_id.to_string());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    /// The discovery list references a workflow nobody registered.
    #[error("manifest {external_id} names unregistered workflow {name}")]
    UnknownWorkflow { external_id: String, name: String },

    /// A seed references a group or dependency that is not in the list.
    #[error("manifest {external_id} references unknown {kind} {reference}")]
    UnknownReference {
        external_id: String,
        kind: &'static str,
        reference: String,
    },

    #[error(transparent)]
    Dag(#[from] DagError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of a seeding pass.
#[derive(Debug)]
pub struct SeedReport {
    pub groups: usize,
    pub manifests: usize,
    /// External ids disabled for invalid schedules.
    pub disabled: Vec<String>,
    /// Validated topological layout, for the dashboard.
    pub layout: DagLayout,
}

/// Seed groups and manifests, then validate the DAG.
pub async fn seed(
    store: &SharedStore,
    registry: &WorkflowRegistry,
    groups: Vec<ManifestGroup>,
    seeds: Vec<ManifestSeed>,
) -> Result<SeedReport, SeedError> {
    let mut stored_groups: HashMap<String, ManifestGroup> = HashMap::new();
    for group in groups {
        let stored = store.upsert_group(group).await?;
        stored_groups.insert(stored.name.clone(), stored);
    }

    // First pass: upsert every manifest so dependency targets exist.
    let mut disabled = Vec::new();
    let mut stored_manifests: HashMap<String, Manifest> = HashMap::new();
    for seed in &seeds {
        let mut manifest = seed.manifest.clone();

        if !registry.contains(&manifest.name) {
            return Err(SeedError::UnknownWorkflow {
                external_id: manifest.external_id,
                name: manifest.name,
            });
        }

        manifest.manifest_group_id = match &seed.group {
            Some(name) => Some(
                stored_groups
                    .get(name)
                    .ok_or_else(|| SeedError::UnknownReference {
                        external_id: manifest.external_id.clone(),
                        kind: "group",
                        reference: name.clone(),
                    })?
                    .id,
            ),
            None => None,
        };
        manifest.depends_on_manifest_id = None;

        if let Err(e) = schedule::validate_schedule(&manifest) {
            warn!(manifest = %manifest.external_id, error = %e,
                  "seeding manifest with invalid schedule as disabled");
            manifest.is_enabled = false;
            manifest.disabled_note = Some(format!("invalid schedule: {e}"));
            disabled.push(manifest.external_id.clone());
        }

        let stored = store.upsert_manifest(manifest).await?;
        stored_manifests.insert(stored.external_id.clone(), stored);
    }

    // Second pass: wire dependencies by external id.
    for seed in &seeds {
        let Some(depends_on) = &seed.depends_on else {
            continue;
        };
        let parent_id = stored_manifests
            .get(depends_on)
            .map(|m| m.id)
            .or(store
                .get_manifest_by_external_id(depends_on)
                .await?
                .map(|m| m.id))
            .ok_or_else(|| SeedError::UnknownReference {
                external_id: seed.manifest.external_id.clone(),
                kind: "dependency",
                reference: depends_on.clone(),
            })?;

        let external_id = &seed.manifest.external_id;
        if let Some(stored) = stored_manifests.get_mut(external_id) {
            stored.depends_on_manifest_id = Some(parent_id);
            let updated = store.upsert_manifest(stored.clone()).await?;
            stored_manifests.insert(updated.external_id.clone(), updated);
        }
    }

    // The DAG over the *whole* store must stay acyclic, including manifests
    // from earlier deployments.
    let all_groups = store.list_groups().await?;
    let all_manifests = store.list_manifests().await?;
    let graph = dag::build_graph(&all_groups, &all_manifests)?;
    let layers = dag::validate(&graph)?;
    let layout = dag::layout(&graph, layers);

    let report = SeedReport {
        groups: stored_groups.len(),
        manifests: stored_manifests.len(),
        disabled,
        layout,
    };
    info!(
        groups = report.groups,
        manifests = report.manifests,
        disabled = report.disabled.len(),
        "seeding finished"
    );
    Ok(report)
}
