use std::fs::{self, File};
use std::io;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, anyhow, bail};
use cauldron::interpreter::{BuildOptions, Interpreter};
use cauldron::observability::{MetricsCollector, log_snapshot};
use cauldron::platform::{self, HostPlatform, PlatformPolicy};
use cauldron::recipe::Recipe;
use cauldron::registry::{Registry, compare_versions};
use cauldron::resolver::{self, Closure};
use cauldron::steps::{StepRegistry, register_build_defaults, register_test_defaults};
use cauldron::testrunner::TestRunner;
use cauldron::validation::validate_recipe;
use cauldron::{lockfile, sbom};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde_json::to_writer_pretty;
use tempfile::TempDir;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_tracing()?;

    match cli.command {
        Commands::Build {
            name,
            recipes,
            prefix,
            head,
            dry_run,
            skip_deps,
            test,
            workdir,
            keep_workdir,
            platform,
            jobs,
            print_metrics,
            metrics_json,
            metrics_prometheus,
        } => run_build(BuildArgs {
            name,
            recipes,
            prefix,
            head,
            dry_run,
            skip_deps,
            test,
            workdir,
            keep_workdir,
            platform,
            jobs,
            print_metrics,
            metrics_json,
            metrics_prometheus,
        }),
        Commands::Test {
            name,
            recipes,
            prefix,
            platform,
        } => run_test(name, recipes, prefix, platform),
        Commands::Validate { recipe, recipes } => validate_cmd(recipe, recipes),
        Commands::Lint { recipes_files, recipes } => lint_cmd(&recipes_files, recipes),
        Commands::Deps {
            name,
            recipes,
            closure,
        } => deps_cmd(name, recipes, closure),
        Commands::Info { name, recipes } => info_cmd(name, recipes),
        Commands::Livecheck { names, recipes } => livecheck_cmd(names, recipes),
        Commands::Lock {
            name,
            recipes,
            output,
        } => lock_cmd(name, recipes, output),
        Commands::Sbom {
            name,
            recipes,
            output,
        } => sbom_cmd(name, recipes, output),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "cauldron", &mut io::stdout());
            Ok(())
        }
    }
}

fn configure_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(())
}

struct BuildArgs {
    name: String,
    recipes: PathBuf,
    prefix: PathBuf,
    head: bool,
    dry_run: bool,
    skip_deps: bool,
    test: bool,
    workdir: Option<PathBuf>,
    keep_workdir: bool,
    platform: PlatformPolicy,
    jobs: Option<u32>,
    print_metrics: bool,
    metrics_json: Option<PathBuf>,
    metrics_prometheus: Option<PathBuf>,
}

fn run_build(args: BuildArgs) -> Result<()> {
    let registry = Registry::load_dir(&args.recipes)
        .with_context(|| format!("failed to load recipe directory {}", args.recipes.display()))?;
    registry.lookup(&args.name)?;

    let platform = HostPlatform::from_policy(&args.platform);
    let jobs = args.jobs.unwrap_or_else(platform::default_jobs);
    let opts = BuildOptions {
        head: args.head,
        dry_run: args.dry_run,
        jobs,
    };

    // Host capability probes are skipped for dry runs so a recipe can be
    // inspected on machines that could not build it.
    let order = if args.skip_deps {
        vec![args.name.clone()]
    } else {
        resolver::resolve(&registry, &args.name, Closure::Build, !args.dry_run)?
    };
    info!(order = ?order, "build order resolved");

    let mut step_registry = StepRegistry::new();
    register_build_defaults(&mut step_registry);
    let interpreter = Interpreter::new(&registry, &step_registry, platform, args.prefix.clone())?;
    let metrics = interpreter.metrics();

    let mut temp_guard: Option<TempDir> = None;
    let scratch_root = match &args.workdir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create work directory {}", dir.display()))?;
            dir.clone()
        }
        None => {
            let temp = tempfile::Builder::new()
                .prefix("cauldron-")
                .tempdir()
                .context("failed to create scratch directory")?;
            let path = temp.path().to_path_buf();
            temp_guard = Some(temp);
            path
        }
    };

    let total_start = Instant::now();
    let result = (|| -> Result<()> {
        for entry in &order {
            let recipe = registry.lookup(entry)?;
            let outcome = interpreter.build(recipe, &scratch_root.join(entry), &opts)?;
            if args.dry_run {
                println!("{} {} (dry run):", outcome.recipe, outcome.version);
                for line in &outcome.rendered {
                    println!("  {line}");
                }
            } else {
                info!(
                    recipe = outcome.recipe.as_str(),
                    version = outcome.version.as_str(),
                    prefix = %outcome.prefix.display(),
                    steps = outcome.steps_run,
                    "build completed"
                );
            }
        }
        Ok(())
    })();
    metrics.record_total_duration(total_start.elapsed());

    match &result {
        Ok(()) => {
            if args.keep_workdir
                && let Some(temp) = temp_guard.take()
            {
                let kept = temp.keep();
                info!(workdir = %kept.display(), "work directory kept");
            }
        }
        Err(err) => {
            // Partial state is evidence; keep it rather than cleaning up.
            if let Some(temp) = temp_guard.take() {
                let kept = temp.keep();
                warn!(workdir = %kept.display(), "work directory retained after failure");
            }
            error!(error = %err, "build failed");
        }
    }

    write_metrics(
        &metrics,
        args.print_metrics,
        args.metrics_json.as_deref(),
        args.metrics_prometheus.as_deref(),
    )?;
    result?;

    if args.test && !args.dry_run {
        run_recipe_tests(&registry, &args.name, platform, &args.prefix, jobs)?;
    }

    Ok(())
}

fn run_test(
    name: String,
    recipes: PathBuf,
    prefix: PathBuf,
    platform: PlatformPolicy,
) -> Result<()> {
    let registry = Registry::load_dir(&recipes)
        .with_context(|| format!("failed to load recipe directory {}", recipes.display()))?;
    registry.lookup(&name)?;
    let platform = HostPlatform::from_policy(&platform);
    run_recipe_tests(&registry, &name, platform, &prefix, platform::default_jobs())
}

fn run_recipe_tests(
    registry: &Registry,
    name: &str,
    platform: HostPlatform,
    prefix: &PathBuf,
    jobs: u32,
) -> Result<()> {
    let recipe = registry.lookup(name)?;
    let mut step_registry = StepRegistry::new();
    register_test_defaults(&mut step_registry);
    let runner = TestRunner::new(registry, &step_registry, platform, prefix.clone(), jobs);

    let scratch = tempfile::Builder::new()
        .prefix("cauldron-test-")
        .tempdir()
        .context("failed to create test scratch directory")?;
    match runner.run(recipe, scratch.path()) {
        Ok(()) => {
            info!(recipe = name, "test phase passed");
            Ok(())
        }
        Err(err) => {
            // Verification failure does not undo the install; the phases have
            // independent failure domains.
            let kept = scratch.keep();
            warn!(
                recipe = name,
                scratch = %kept.display(),
                "test phase failed; installed artifact left in place"
            );
            Err(err.into())
        }
    }
}

fn load_registry_if_present(recipes: &PathBuf) -> Option<Registry> {
    if !recipes.is_dir() {
        return None;
    }
    match Registry::load_dir(recipes) {
        Ok(registry) => Some(registry),
        Err(err) => {
            warn!(dir = %recipes.display(), error = %err, "registry unavailable for cross-recipe checks");
            None
        }
    }
}

fn step_registries() -> (StepRegistry, StepRegistry) {
    let mut build = StepRegistry::new();
    register_build_defaults(&mut build);
    let mut test = StepRegistry::new();
    register_test_defaults(&mut test);
    (build, test)
}

fn validate_cmd(recipe_path: PathBuf, recipes: PathBuf) -> Result<()> {
    let recipe = Recipe::load(&recipe_path)?;
    let registry = load_registry_if_present(&recipes);
    let (build_steps, test_steps) = step_registries();
    let report = validate_recipe(&recipe, registry.as_ref(), &build_steps, &test_steps);

    for warning in &report.warnings {
        warn!(file = %recipe_path.display(), "{warning}");
    }

    if report.is_ok() {
        info!(file = %recipe_path.display(), "recipe validation passed");
        Ok(())
    } else {
        for error_msg in &report.errors {
            error!(file = %recipe_path.display(), "{error_msg}");
        }
        Err(anyhow!(
            "recipe validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn lint_cmd(recipe_files: &[PathBuf], recipes: PathBuf) -> Result<()> {
    if recipe_files.is_empty() {
        bail!("no recipe files supplied for linting");
    }

    let registry = load_registry_if_present(&recipes);
    let (build_steps, test_steps) = step_registries();
    let mut failures = 0usize;

    for recipe_path in recipe_files {
        match Recipe::load(recipe_path) {
            Ok(recipe) => {
                let report =
                    validate_recipe(&recipe, registry.as_ref(), &build_steps, &test_steps);
                for warning in &report.warnings {
                    warn!(file = %recipe_path.display(), "{warning}");
                }
                if report.is_ok() {
                    info!(file = %recipe_path.display(), "lint passed");
                } else {
                    failures += 1;
                    for error_msg in &report.errors {
                        error!(file = %recipe_path.display(), "{error_msg}");
                    }
                }
            }
            Err(err) => {
                failures += 1;
                error!(file = %recipe_path.display(), "failed to load recipe: {err}");
            }
        }
    }

    if failures > 0 {
        bail!("lint failed for {failures} recipe(s)");
    }

    info!("all recipe lint checks passed");
    Ok(())
}

fn deps_cmd(name: String, recipes: PathBuf, closure: Closure) -> Result<()> {
    let registry = Registry::load_dir(&recipes)?;
    let order = resolver::resolve(&registry, &name, closure, false)?;
    for entry in &order {
        let recipe = registry.lookup(entry)?;
        println!("{} {}", recipe.name, recipe.version);
    }
    Ok(())
}

fn info_cmd(name: String, recipes: PathBuf) -> Result<()> {
    let registry = Registry::load_dir(&recipes)?;
    let recipe = registry.lookup(&name)?;

    println!("{} {}", recipe.name, recipe.version);
    if let Some(description) = &recipe.description {
        println!("{description}");
    }
    if let Some(homepage) = &recipe.homepage {
        println!("homepage: {homepage}");
    }
    if let Some(license) = &recipe.license {
        println!("license: {license}");
    }
    println!("source: {}", recipe.source.location());
    if let Some(head) = &recipe.head {
        println!("head: {}", head.location());
    }
    if let Some(reason) = &recipe.keg_only {
        println!("keg-only: {reason}");
    }
    if !recipe.dependencies.is_empty() {
        println!("dependencies:");
        for dep in &recipe.dependencies {
            println!("  {} ({:?})", dep.name, dep.scope);
        }
    }
    if let Some(livecheck) = &recipe.livecheck {
        println!("livecheck: {}", livecheck.url);
    }
    Ok(())
}

fn livecheck_cmd(names: Vec<String>, recipes: PathBuf) -> Result<()> {
    let registry = Registry::load_dir(&recipes)?;
    let names = if names.is_empty() {
        registry.names().map(str::to_string).collect()
    } else {
        names
    };

    for name in &names {
        let recipe = registry.lookup(name)?;
        if recipe.livecheck.is_none() {
            println!("{name}: no livecheck declared");
            continue;
        }
        match registry.livecheck(recipe) {
            Some(latest) => {
                if compare_versions(&latest, &recipe.version) == std::cmp::Ordering::Greater {
                    println!("{name}: {} -> {latest}", recipe.version);
                } else {
                    println!("{name}: up to date ({})", recipe.version);
                }
            }
            None => println!("{name}: no result"),
        }
    }
    Ok(())
}

fn lock_cmd(name: String, recipes: PathBuf, output: PathBuf) -> Result<()> {
    let registry = Registry::load_dir(&recipes)?;
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create lockfile directory {}", parent.display()))?;
    }
    lockfile::generate_lock(&registry, &name, &output)?;
    info!(lockfile = %output.display(), "lockfile generated");
    Ok(())
}

fn sbom_cmd(name: String, recipes: PathBuf, output: PathBuf) -> Result<()> {
    let registry = Registry::load_dir(&recipes)?;
    sbom::generate_sbom(&registry, &name, &output)?;
    info!(sbom = %output.display(), "SBOM generated");
    Ok(())
}

fn write_metrics(
    metrics: &MetricsCollector,
    print: bool,
    json: Option<&std::path::Path>,
    prometheus: Option<&std::path::Path>,
) -> Result<()> {
    if !print && json.is_none() && prometheus.is_none() {
        return Ok(());
    }
    let snapshot = metrics.snapshot();
    if print {
        log_snapshot(&snapshot);
    }
    if let Some(path) = json {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create metrics directory {}", parent.display())
            })?;
        }
        let file = File::create(path)
            .with_context(|| format!("failed to create metrics file {}", path.display()))?;
        to_writer_pretty(file, &snapshot)
            .with_context(|| format!("failed to write metrics JSON {}", path.display()))?;
        info!(metrics = %path.display(), "metrics JSON written");
    }
    if let Some(path) = prometheus {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create metrics directory {}", parent.display())
            })?;
        }
        fs::write(path, snapshot.to_prometheus())
            .with_context(|| format!("failed to write Prometheus metrics {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "cauldron",
    version,
    about = "Declarative build-recipe executor"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve, fetch, and build a recipe into the install prefix
    Build {
        name: String,
        #[arg(long, default_value = "recipes")]
        recipes: PathBuf,
        #[arg(long, default_value = "cellar")]
        prefix: PathBuf,
        /// Build from the version-control head instead of the release archive
        #[arg(long)]
        head: bool,
        /// Render the resolved step list without fetching or executing
        #[arg(long)]
        dry_run: bool,
        /// Build only the named recipe, assuming dependencies are installed
        #[arg(long)]
        skip_deps: bool,
        /// Run the recipe's test steps after a successful install
        #[arg(long)]
        test: bool,
        /// Use this work directory instead of a scratch one
        #[arg(long)]
        workdir: Option<PathBuf>,
        /// Keep the scratch work directory after a successful build
        #[arg(long)]
        keep_workdir: bool,
        #[arg(long, value_enum, default_value_t = PlatformPolicy::Auto)]
        platform: PlatformPolicy,
        /// Parallelism for tools that accept it via {jobs}
        #[arg(long)]
        jobs: Option<u32>,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
    },
    /// Run a recipe's verification steps against an existing install
    Test {
        name: String,
        #[arg(long, default_value = "recipes")]
        recipes: PathBuf,
        #[arg(long, default_value = "cellar")]
        prefix: PathBuf,
        #[arg(long, value_enum, default_value_t = PlatformPolicy::Auto)]
        platform: PlatformPolicy,
    },
    /// Validate a single recipe file
    Validate {
        recipe: PathBuf,
        #[arg(long, default_value = "recipes")]
        recipes: PathBuf,
    },
    /// Validate many recipe files, reporting every failure
    Lint {
        #[arg(required = true)]
        recipes_files: Vec<PathBuf>,
        #[arg(long, default_value = "recipes")]
        recipes: PathBuf,
    },
    /// Print the resolved dependency order for a recipe
    Deps {
        name: String,
        #[arg(long, default_value = "recipes")]
        recipes: PathBuf,
        #[arg(long, value_enum, default_value_t = Closure::Build)]
        closure: Closure,
    },
    /// Show a recipe's metadata
    Info {
        name: String,
        #[arg(long, default_value = "recipes")]
        recipes: PathBuf,
    },
    /// Check upstream for newer versions (advisory)
    Livecheck {
        names: Vec<String>,
        #[arg(long, default_value = "recipes")]
        recipes: PathBuf,
    },
    /// Write a lockfile describing the resolved build order
    Lock {
        name: String,
        #[arg(long, default_value = "recipes")]
        recipes: PathBuf,
        #[arg(long, default_value = "cauldron.lock")]
        output: PathBuf,
    },
    /// Write a CycloneDX-style SBOM for a recipe's runtime closure
    Sbom {
        name: String,
        #[arg(long, default_value = "recipes")]
        recipes: PathBuf,
        #[arg(long, default_value = "sbom.json")]
        output: PathBuf,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}
