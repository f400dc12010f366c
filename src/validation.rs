use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::recipe::{DependencyScope, Recipe, ResourceSpec, StepSpec};
use crate::registry::Registry;
use crate::steps::{StepRegistry, scan_placeholders};

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Check a recipe before anything is fetched or run. `registry` enables
/// cross-recipe checks (dependency resolvability) when available.
pub fn validate_recipe(
    recipe: &Recipe,
    registry: Option<&Registry>,
    build_steps: &StepRegistry,
    test_steps: &StepRegistry,
) -> ValidationReport {
    let mut report = ValidationReport::default();

    if recipe.name.trim().is_empty() {
        report.errors.push("recipe name cannot be empty".into());
    }
    if recipe.version.trim().is_empty() {
        report.errors.push("recipe version cannot be empty".into());
    }

    report.merge(validate_source("source", &recipe.source));
    if let Some(head) = &recipe.head {
        if matches!(head, ResourceSpec::Archive { .. }) {
            report
                .warnings
                .push("head source is an archive; head builds usually track a repository".into());
        }
        report.merge(validate_source("head", head));
    }
    for resource in &recipe.resources {
        report.merge(validate_source(
            &format!("resource '{}'", resource.name),
            &resource.source,
        ));
    }

    if recipe.build.is_empty() {
        report.warnings.push("recipe declares no build steps".into());
    }

    let mut seen_deps = std::collections::BTreeSet::new();
    for dep in &recipe.dependencies {
        if !seen_deps.insert(dep.name.as_str()) {
            report
                .warnings
                .push(format!("dependency '{}' is declared twice", dep.name));
        }
        if dep.scope != DependencyScope::Host
            && let Some(registry) = registry
            && !registry.contains(&dep.name)
        {
            report.errors.push(format!(
                "dependency '{}' is not in the registry and not host-provided",
                dep.name
            ));
        }
    }

    for (idx, step) in recipe.build.iter().enumerate() {
        report.merge(validate_step(recipe, "build", idx, step, build_steps));
    }
    for (idx, step) in recipe.test.iter().enumerate() {
        report.merge(validate_step(recipe, "test", idx, step, test_steps));
    }

    if let Some(livecheck) = &recipe.livecheck {
        match Regex::new(&livecheck.pattern) {
            Ok(pattern) => {
                if pattern.captures_len() < 2 {
                    report.warnings.push(
                        "livecheck pattern has no capture group; no version can be extracted"
                            .into(),
                    );
                }
            }
            Err(err) => report
                .errors
                .push(format!("livecheck pattern does not compile: {err}")),
        }
    }

    report
}

fn validate_source(label: &str, source: &ResourceSpec) -> ValidationReport {
    let mut report = ValidationReport::default();
    match source {
        ResourceSpec::Archive { url, sha256, .. } => {
            if url.trim().is_empty() {
                report.errors.push(format!("{label}: URL cannot be empty"));
            }
            match sha256 {
                Some(hash) => {
                    if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                        report.errors.push(format!(
                            "{label}: sha256 must be 64 hex characters, got '{hash}'"
                        ));
                    }
                }
                None => {
                    if url.starts_with("http://") || url.starts_with("https://") {
                        report.errors.push(format!(
                            "{label}: remote archives must declare a sha256"
                        ));
                    } else {
                        report
                            .warnings
                            .push(format!("{label}: no sha256 declared; integrity unchecked"));
                    }
                }
            }
        }
        ResourceSpec::Git { git, .. } => {
            if git.trim().is_empty() {
                report
                    .errors
                    .push(format!("{label}: repository URL cannot be empty"));
            }
        }
    }
    report
}

fn validate_step(
    recipe: &Recipe,
    phase: &str,
    idx: usize,
    step: &StepSpec,
    registry: &StepRegistry,
) -> ValidationReport {
    let mut report = ValidationReport::default();
    let index = idx + 1;

    if let Err(err) = registry.create(&step.step, step.params.clone().unwrap_or_default()) {
        report
            .errors
            .push(format!("{phase} step {index}: {err}"));
        return report;
    }

    // Template references must point at declared resources and non-host
    // dependencies; a dangling reference would only surface mid-build.
    for value in step.params.iter().flat_map(|params| params.values()) {
        for template in strings_in(value) {
            for (key, arg) in scan_placeholders(&template) {
                match (key.as_str(), arg) {
                    ("prefix" | "workdir" | "jobs" | "os", None) => {}
                    ("resource", Some(name)) => {
                        if !recipe.resources.iter().any(|r| r.name == name) {
                            report.errors.push(format!(
                                "{phase} step {index}: references undeclared resource '{name}'"
                            ));
                        }
                    }
                    ("dep", Some(name)) => {
                        match recipe.dependencies.iter().find(|d| d.name == name) {
                            None => report.errors.push(format!(
                                "{phase} step {index}: references undeclared dependency '{name}'"
                            )),
                            Some(dep) if dep.scope == DependencyScope::Host => {
                                report.errors.push(format!(
                                    "{phase} step {index}: '{name}' is host-provided and has no install prefix"
                                ));
                            }
                            Some(_) => {}
                        }
                    }
                    (other, _) => report.errors.push(format!(
                        "{phase} step {index}: unknown template placeholder '{{{other}}}'"
                    )),
                }
            }
        }
    }

    report
}

fn strings_in(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(values) => values.iter().flat_map(strings_in).collect(),
        Value::Object(map) => map.values().flat_map(strings_in).collect(),
        _ => Vec::new(),
    }
}
