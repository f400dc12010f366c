use std::collections::{BTreeMap, BTreeSet};

use clap::ValueEnum;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::platform;
use crate::recipe::DependencyScope;
use crate::registry::Registry;

/// Which transitive closure to compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Closure {
    /// Everything needed to produce the artifact: build- and runtime-scoped
    /// dependencies.
    Build,
    /// Runtime-scoped dependencies only.
    Runtime,
}

impl Closure {
    fn includes(&self, scope: DependencyScope) -> bool {
        match self {
            Closure::Build => matches!(scope, DependencyScope::Build | DependencyScope::Runtime),
            Closure::Runtime => scope == DependencyScope::Runtime,
        }
    }
}

/// Topologically order the transitive dependency closure of `name`:
/// dependencies strictly before dependents, the root last.
///
/// Host-scoped dependencies are excluded from the ordering but, when
/// `probe_host` is set, validated to exist on the host.
pub fn resolve(
    registry: &Registry,
    name: &str,
    closure: Closure,
    probe_host: bool,
) -> Result<Vec<String>> {
    // Forward edges: recipe -> the dependencies it needs.
    let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut pending = vec![name.to_string()];

    while let Some(current) = pending.pop() {
        if edges.contains_key(&current) {
            continue;
        }
        let recipe = registry.lookup(&current).map_err(|_| {
            if current == name {
                Error::NotFound(current.clone())
            } else {
                Error::UnresolvedDependency {
                    dependency: current.clone(),
                    requirer: requirer_of(&edges, &current).unwrap_or_else(|| name.to_string()),
                }
            }
        })?;

        let mut deps = BTreeSet::new();
        for dep in &recipe.dependencies {
            if dep.scope == DependencyScope::Host {
                if probe_host && !platform::host_provides(&dep.name, dep.probe.as_deref()) {
                    return Err(Error::UnresolvedDependency {
                        dependency: dep.name.clone(),
                        requirer: current.clone(),
                    });
                }
                continue;
            }
            if !closure.includes(dep.scope) {
                continue;
            }
            deps.insert(dep.name.clone());
            pending.push(dep.name.clone());
        }
        edges.insert(current, deps);
    }

    topological_order(&edges)
}

fn requirer_of(edges: &BTreeMap<String, BTreeSet<String>>, dependency: &str) -> Option<String> {
    edges
        .iter()
        .find(|(_, deps)| deps.contains(dependency))
        .map(|(name, _)| name.clone())
}

/// Kahn's algorithm with sorted tie-breaking so the order is deterministic.
fn topological_order(edges: &BTreeMap<String, BTreeSet<String>>) -> Result<Vec<String>> {
    let mut in_degree: BTreeMap<&str, usize> = edges
        .iter()
        .map(|(name, deps)| (name.as_str(), deps.len()))
        .collect();
    let mut dependents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for (name, deps) in edges {
        for dep in deps {
            dependents
                .entry(dep.as_str())
                .or_default()
                .insert(name.as_str());
        }
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|&(_, degree)| *degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(edges.len());

    while let Some(&next) = ready.iter().next() {
        ready.remove(next);
        order.push(next.to_string());
        if let Some(children) = dependents.get(next) {
            for child in children {
                let degree = in_degree
                    .get_mut(child)
                    .expect("dependent tracked without degree");
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    ready.insert(child);
                }
            }
        }
    }

    if order.len() != edges.len() {
        let remaining: Vec<&str> = edges
            .keys()
            .map(String::as_str)
            .filter(|name| !order.iter().any(|done| done == name))
            .collect();
        return Err(Error::Cycle(remaining.join(", ")));
    }

    debug!(order = ?order, "resolved build order");
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{DependencySpec, Recipe, ResourceSpec};

    fn recipe(name: &str, deps: &[(&str, DependencyScope)]) -> Recipe {
        Recipe {
            name: name.to_string(),
            version: "1.0".to_string(),
            description: None,
            homepage: None,
            license: None,
            source: ResourceSpec::Archive {
                url: format!("https://example.org/{name}-1.0.tar.gz"),
                sha256: Some("0".repeat(64)),
                mirrors: Vec::new(),
            },
            head: None,
            keg_only: None,
            dependencies: deps
                .iter()
                .map(|(dep, scope)| DependencySpec {
                    name: dep.to_string(),
                    scope: *scope,
                    probe: None,
                })
                .collect(),
            resources: Vec::new(),
            build: Vec::new(),
            test: Vec::new(),
            livecheck: None,
        }
    }

    fn registry(recipes: Vec<Recipe>) -> Registry {
        Registry::from_recipes(recipes).unwrap()
    }

    #[test]
    fn orders_dependencies_before_dependents() {
        let registry = registry(vec![
            recipe("app", &[("libb", DependencyScope::Runtime), ("tool", DependencyScope::Build)]),
            recipe("libb", &[("liba", DependencyScope::Runtime)]),
            recipe("liba", &[]),
            recipe("tool", &[]),
        ]);

        let order = resolve(&registry, "app", Closure::Build, false).unwrap();
        let position = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert_eq!(order.len(), 4);
        assert!(position("liba") < position("libb"));
        assert!(position("libb") < position("app"));
        assert!(position("tool") < position("app"));
        assert_eq!(order.last().map(String::as_str), Some("app"));
    }

    #[test]
    fn runtime_closure_skips_build_only_deps() {
        let registry = registry(vec![
            recipe("app", &[("libb", DependencyScope::Runtime), ("tool", DependencyScope::Build)]),
            recipe("libb", &[]),
            recipe("tool", &[]),
        ]);

        let order = resolve(&registry, "app", Closure::Runtime, false).unwrap();
        assert_eq!(order, vec!["libb".to_string(), "app".to_string()]);
    }

    #[test]
    fn detects_cycles_without_hanging() {
        let registry = registry(vec![
            recipe("a", &[("b", DependencyScope::Runtime)]),
            recipe("b", &[("a", DependencyScope::Runtime)]),
        ]);

        let err = resolve(&registry, "a", Closure::Build, false).unwrap_err();
        assert!(matches!(err, Error::Cycle(_)), "got {err:?}");
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let registry = registry(vec![recipe("a", &[("a", DependencyScope::Runtime)])]);
        let err = resolve(&registry, "a", Closure::Build, false).unwrap_err();
        assert!(matches!(err, Error::Cycle(_)));
    }

    #[test]
    fn missing_dependency_is_named() {
        let registry = registry(vec![recipe("app", &[("ghost", DependencyScope::Runtime)])]);
        let err = resolve(&registry, "app", Closure::Build, false).unwrap_err();
        match err {
            Error::UnresolvedDependency { dependency, .. } => assert_eq!(dependency, "ghost"),
            other => panic!("expected UnresolvedDependency, got {other:?}"),
        }
    }

    #[test]
    fn host_deps_are_probed_not_ordered() {
        let mut host_dep = recipe("app", &[]);
        host_dep.dependencies.push(DependencySpec {
            name: "posix-shell".to_string(),
            scope: DependencyScope::Host,
            probe: Some("sh".to_string()),
        });
        let registry = registry(vec![host_dep]);

        let order = resolve(&registry, "app", Closure::Build, true).unwrap();
        assert_eq!(order, vec!["app".to_string()]);
    }

    #[test]
    fn missing_host_dep_fails_when_probed() {
        let mut host_dep = recipe("app", &[]);
        host_dep.dependencies.push(DependencySpec {
            name: "no-such-host-lib".to_string(),
            scope: DependencyScope::Host,
            probe: None,
        });
        let registry = registry(vec![host_dep]);

        assert!(resolve(&registry, "app", Closure::Build, false).is_ok());
        let err = resolve(&registry, "app", Closure::Build, true).unwrap_err();
        assert!(matches!(err, Error::UnresolvedDependency { .. }));
    }
}
