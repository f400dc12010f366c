use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;

use glob::glob;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::recipe::Recipe;

/// Read-only catalog mapping recipe names to recipes.
///
/// Built once from a recipe directory and then shared; it is an explicit,
/// injected value, never ambient state.
#[derive(Debug, Default)]
pub struct Registry {
    recipes: BTreeMap<String, Recipe>,
}

impl Registry {
    pub fn from_recipes(recipes: Vec<Recipe>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for recipe in recipes {
            let name = recipe.name.clone();
            if map.insert(name.clone(), recipe).is_some() {
                return Err(Error::Recipe {
                    path: name.clone(),
                    reason: "duplicate recipe name".to_string(),
                });
            }
        }
        Ok(Self { recipes: map })
    }

    /// Load every `*.yaml`/`*.yml` recipe under `dir`.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut recipes = Vec::new();
        for pattern in ["*.yaml", "*.yml"] {
            let full = dir.join(pattern);
            let matches = glob(&full.to_string_lossy()).map_err(|err| Error::Recipe {
                path: dir.display().to_string(),
                reason: format!("invalid recipe glob: {err}"),
            })?;
            for entry in matches {
                let path = entry.map_err(|err| Error::Recipe {
                    path: dir.display().to_string(),
                    reason: err.to_string(),
                })?;
                recipes.push(Recipe::load(&path)?);
            }
        }
        debug!(dir = %dir.display(), count = recipes.len(), "loaded recipe directory");
        Self::from_recipes(recipes)
    }

    pub fn lookup(&self, name: &str) -> Result<&Recipe> {
        self.recipes
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.recipes.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.recipes.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Recipe> {
        self.recipes.values()
    }

    pub fn len(&self) -> usize {
        self.recipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }

    /// Best-effort check for a newer upstream version. Advisory only: any
    /// failure logs a warning and yields `None`; a build never calls this.
    pub fn livecheck(&self, recipe: &Recipe) -> Option<String> {
        let spec = recipe.livecheck.as_ref()?;
        let pattern = match Regex::new(&spec.pattern) {
            Ok(pattern) => pattern,
            Err(err) => {
                warn!(recipe = recipe.name.as_str(), error = %err, "livecheck pattern invalid");
                return None;
            }
        };

        let body = match fetch_listing(&spec.url) {
            Ok(body) => body,
            Err(reason) => {
                warn!(
                    recipe = recipe.name.as_str(),
                    url = spec.url.as_str(),
                    reason,
                    "livecheck fetch failed"
                );
                return None;
            }
        };

        let latest = pattern
            .captures_iter(&body)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
            .max_by(|a, b| compare_versions(a, b));
        if latest.is_none() {
            warn!(
                recipe = recipe.name.as_str(),
                url = spec.url.as_str(),
                "livecheck pattern matched nothing"
            );
        }
        latest
    }
}

fn fetch_listing(url: &str) -> std::result::Result<String, String> {
    let response = reqwest::blocking::get(url).map_err(|err| err.to_string())?;
    if !response.status().is_success() {
        return Err(format!("HTTP {}", response.status()));
    }
    response.text().map_err(|err| err.to_string())
}

/// Numeric-aware version comparison: dotted components compare as numbers
/// when both sides are numeric, as strings otherwise.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let split = |v: &str| -> Vec<String> {
        v.split(['.', '-', '_'])
            .map(str::to_string)
            .collect()
    };
    let left = split(a);
    let right = split(b);

    for (l, r) in left.iter().zip(right.iter()) {
        let ordering = match (l.parse::<u64>(), r.parse::<u64>()) {
            (Ok(ln), Ok(rn)) => ln.cmp(&rn),
            _ => l.cmp(r),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.len().cmp(&right.len())
}
