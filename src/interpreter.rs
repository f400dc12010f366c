use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, instrument};

use crate::error::{Error, Result};
use crate::fetcher::Fetcher;
use crate::observability::MetricsCollector;
use crate::platform::HostPlatform;
use crate::recipe::{DependencyScope, Recipe, StepSpec};
use crate::registry::Registry;
use crate::steps::{ExecContext, Step, StepRegistry};

pub struct BuildOptions {
    /// Build from the version-control head resource instead of the release
    /// archive.
    pub head: bool,
    /// Render the templated step list without fetching or executing.
    pub dry_run: bool,
    pub jobs: u32,
}

#[derive(Debug)]
pub struct BuildOutcome {
    pub recipe: String,
    pub version: String,
    pub prefix: PathBuf,
    pub steps_run: usize,
    /// Rendered step descriptions (dry runs only).
    pub rendered: Vec<String>,
}

/// Executes one recipe's build-step sequence against a work directory, after
/// its dependencies have been resolved and built.
pub struct Interpreter<'a> {
    registry: &'a Registry,
    steps: &'a StepRegistry,
    fetcher: Fetcher,
    metrics: MetricsCollector,
    platform: HostPlatform,
    prefix_root: PathBuf,
}

impl<'a> Interpreter<'a> {
    pub fn new(
        registry: &'a Registry,
        steps: &'a StepRegistry,
        platform: HostPlatform,
        prefix_root: PathBuf,
    ) -> Result<Self> {
        Ok(Self {
            registry,
            steps,
            fetcher: Fetcher::new()?,
            metrics: MetricsCollector::new(),
            platform,
            prefix_root,
        })
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    /// Install prefix for one recipe: `<root>/<name>/<version>`.
    pub fn recipe_prefix(&self, recipe: &Recipe) -> PathBuf {
        self.prefix_root.join(&recipe.name).join(&recipe.version)
    }

    /// Build `recipe` in `scratch`. Steps run strictly in declaration order;
    /// the first failure aborts the recipe with the 1-based step index.
    #[instrument(skip_all, fields(recipe = %recipe.name))]
    pub fn build(
        &self,
        recipe: &Recipe,
        scratch: &Path,
        opts: &BuildOptions,
    ) -> Result<BuildOutcome> {
        let prefix = self.recipe_prefix(recipe);
        let steps = self.instantiate(&recipe.build)?;

        if opts.dry_run {
            let ctx = self.context(recipe, predicted_layout(recipe, scratch), prefix.clone(), opts)?;
            let mut rendered = Vec::with_capacity(steps.len());
            for step in &steps {
                rendered.push(step.describe(&ctx)?);
            }
            return Ok(BuildOutcome {
                recipe: recipe.name.clone(),
                version: recipe.version.clone(),
                prefix,
                steps_run: 0,
                rendered,
            });
        }

        let layout = self.stage_sources(recipe, scratch, opts)?;
        let ctx = self.context(recipe, layout, prefix.clone(), opts)?;
        fs::create_dir_all(&ctx.prefix)?;

        for (idx, (spec, step)) in recipe.build.iter().zip(&steps).enumerate() {
            let index = idx + 1;
            let label = format!("build:{index}:{}", spec.step);
            let _timer = self.metrics.start_phase(&label);
            info!(step = index, kind = spec.step.as_str(), "executing build step");
            step.execute(&ctx).map_err(|failure| Error::BuildStep {
                index,
                command: failure.command,
                status: failure.status,
                stderr: failure.stderr,
            })?;
            self.metrics.record_step_run();
        }

        info!(prefix = %ctx.prefix.display(), "recipe installed");
        Ok(BuildOutcome {
            recipe: recipe.name.clone(),
            version: recipe.version.clone(),
            prefix,
            steps_run: steps.len(),
            rendered: Vec::new(),
        })
    }

    /// All steps are instantiated before anything runs, so an unknown kind or
    /// bad parameters surface before the first command is spawned.
    fn instantiate(&self, specs: &[StepSpec]) -> Result<Vec<Box<dyn Step>>> {
        let mut steps = Vec::with_capacity(specs.len());
        for spec in specs {
            steps.push(
                self.steps
                    .create(&spec.step, spec.params.clone().unwrap_or_default())?,
            );
        }
        Ok(steps)
    }

    fn stage_sources(
        &self,
        recipe: &Recipe,
        scratch: &Path,
        opts: &BuildOptions,
    ) -> Result<SourceLayout> {
        let _timer = self.metrics.start_phase("fetch");
        let source = recipe.source_for(opts.head);
        let primary = self
            .fetcher
            .stage(&recipe.name, source, &scratch.join("src"))?;
        self.metrics.record_resource_staged();

        let mut resources = BTreeMap::new();
        for resource in &recipe.resources {
            let staged = self.fetcher.stage(
                &resource.name,
                &resource.source,
                &scratch.join("resources").join(&resource.name),
            )?;
            self.metrics.record_resource_staged();
            resources.insert(resource.name.clone(), staged.root);
        }

        Ok(SourceLayout {
            workdir: primary.root,
            resources,
        })
    }

    fn context(
        &self,
        recipe: &Recipe,
        layout: SourceLayout,
        prefix: PathBuf,
        opts: &BuildOptions,
    ) -> Result<ExecContext> {
        let mut deps = BTreeMap::new();
        for dep in &recipe.dependencies {
            if dep.scope == DependencyScope::Host {
                continue;
            }
            let dep_recipe = self.registry.lookup(&dep.name)?;
            deps.insert(dep.name.clone(), self.recipe_prefix(dep_recipe));
        }

        Ok(ExecContext {
            prefix,
            workdir: layout.workdir,
            resources: layout.resources,
            deps,
            platform: self.platform,
            jobs: opts.jobs,
        })
    }
}

struct SourceLayout {
    workdir: PathBuf,
    resources: BTreeMap<String, PathBuf>,
}

/// Where sources would be staged, for dry-run rendering. No fetching happens.
fn predicted_layout(recipe: &Recipe, scratch: &Path) -> SourceLayout {
    let resources = recipe
        .resources
        .iter()
        .map(|resource| {
            (
                resource.name.clone(),
                scratch.join("resources").join(&resource.name),
            )
        })
        .collect();
    SourceLayout {
        workdir: scratch.join("src"),
        resources,
    }
}
