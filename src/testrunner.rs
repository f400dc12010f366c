use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, instrument};

use crate::error::{Error, Result};
use crate::observability::MetricsCollector;
use crate::platform::HostPlatform;
use crate::recipe::{DependencyScope, Recipe};
use crate::registry::Registry;
use crate::steps::{ExecContext, StepRegistry};

/// Runs a recipe's post-install verification steps in a scratch directory.
///
/// Install and test are separate phases with independent failure domains: a
/// test failure is reported, the installed artifact stays where it is.
pub struct TestRunner<'a> {
    registry: &'a Registry,
    steps: &'a StepRegistry,
    metrics: MetricsCollector,
    platform: HostPlatform,
    prefix_root: PathBuf,
    jobs: u32,
}

impl<'a> TestRunner<'a> {
    pub fn new(
        registry: &'a Registry,
        steps: &'a StepRegistry,
        platform: HostPlatform,
        prefix_root: PathBuf,
        jobs: u32,
    ) -> Self {
        Self {
            registry,
            steps,
            metrics: MetricsCollector::new(),
            platform,
            prefix_root,
            jobs,
        }
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    #[instrument(skip_all, fields(recipe = %recipe.name))]
    pub fn run(&self, recipe: &Recipe, scratch: &Path) -> Result<()> {
        if recipe.test.is_empty() {
            info!("recipe declares no test steps");
            return Ok(());
        }

        let testpath = scratch.join("test");
        fs::create_dir_all(&testpath)?;

        let mut deps = BTreeMap::new();
        for dep in &recipe.dependencies {
            if dep.scope == DependencyScope::Host {
                continue;
            }
            let dep_recipe = self.registry.lookup(&dep.name)?;
            deps.insert(
                dep.name.clone(),
                self.prefix_root
                    .join(&dep_recipe.name)
                    .join(&dep_recipe.version),
            );
        }

        let ctx = ExecContext {
            prefix: self.prefix_root.join(&recipe.name).join(&recipe.version),
            workdir: testpath,
            resources: BTreeMap::new(),
            deps,
            platform: self.platform,
            jobs: self.jobs,
        };

        for (idx, spec) in recipe.test.iter().enumerate() {
            let index = idx + 1;
            let step = self
                .steps
                .create(&spec.step, spec.params.clone().unwrap_or_default())?;
            let label = format!("test:{index}:{}", spec.step);
            let _timer = self.metrics.start_phase(&label);
            info!(step = index, kind = spec.step.as_str(), "executing test step");
            if let Err(failure) = step.execute(&ctx) {
                self.metrics.record_test_failure();
                return Err(Error::TestFailure {
                    index,
                    reason: format!(
                        "{} ({}): {}",
                        failure.command, failure.status, failure.stderr
                    ),
                });
            }
            self.metrics.record_test_pass();
        }

        info!("all test steps passed");
        Ok(())
    }
}
