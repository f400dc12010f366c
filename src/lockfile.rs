use std::fs::File;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::recipe::{Recipe, StepSpec};
use crate::registry::Registry;
use crate::resolver::{self, Closure};

/// Advisory record of what a build of one recipe would do: the resolved
/// order, each recipe's sources and hashes, and a digest of every step's
/// parameters. Not consumed by `build`.
#[derive(Debug, Serialize)]
pub struct BuildLock {
    pub recipe: String,
    pub version: String,
    pub generated_at: DateTime<Utc>,
    pub order: Vec<LockedRecipe>,
}

#[derive(Debug, Serialize)]
pub struct LockedRecipe {
    pub name: String,
    pub version: String,
    pub sources: Vec<LockedSource>,
    pub steps: Vec<StepLock>,
}

#[derive(Debug, Serialize)]
pub struct LockedSource {
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StepLock {
    pub kind: String,
    pub params_hash: String,
}

pub fn generate_lock(registry: &Registry, name: &str, path: &Path) -> Result<()> {
    let order = resolver::resolve(registry, name, Closure::Build, false)?;
    let root = registry.lookup(name)?;

    let locked = order
        .iter()
        .map(|entry| {
            let recipe = registry.lookup(entry)?;
            Ok(lock_recipe(recipe))
        })
        .collect::<Result<Vec<_>>>()?;

    let lock = BuildLock {
        recipe: root.name.clone(),
        version: root.version.clone(),
        generated_at: Utc::now(),
        order: locked,
    };

    let file = File::create(path)?;
    serde_yaml::to_writer(file, &lock).map_err(|err| Error::Recipe {
        path: path.display().to_string(),
        reason: format!("failed to write lockfile: {err}"),
    })?;
    Ok(())
}

fn lock_recipe(recipe: &Recipe) -> LockedRecipe {
    let mut sources = vec![LockedSource {
        location: recipe.source.location().to_string(),
        sha256: recipe.source.sha256().map(str::to_string),
    }];
    for resource in &recipe.resources {
        sources.push(LockedSource {
            location: resource.source.location().to_string(),
            sha256: resource.source.sha256().map(str::to_string),
        });
    }

    LockedRecipe {
        name: recipe.name.clone(),
        version: recipe.version.clone(),
        sources,
        steps: recipe.build.iter().map(hash_step).collect(),
    }
}

fn hash_step(spec: &StepSpec) -> StepLock {
    let mut hasher = Sha256::new();
    let value = serde_json::to_value(spec.params.clone().unwrap_or_default()).unwrap_or_default();
    let serialized = serde_json::to_vec(&value).unwrap_or_default();
    hasher.update(spec.step.as_bytes());
    hasher.update(serialized);
    StepLock {
        kind: spec.step.clone(),
        params_hash: format!("{:x}", hasher.finalize()),
    }
}
