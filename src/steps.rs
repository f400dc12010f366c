use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use glob::glob;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::info;

use crate::error::{Error, Result};
use crate::fetcher::{Fetcher, filename_from_url, sha256_file};
use crate::platform::HostPlatform;
use crate::recipe::StepParameters;

/// Values resolved at execution time and substituted into step arguments.
#[derive(Debug, Clone)]
pub struct ExecContext {
    /// Install prefix of the recipe being built or tested.
    pub prefix: PathBuf,
    /// Staged root of the primary source; the scratch directory for tests.
    pub workdir: PathBuf,
    /// Staged roots of named sub-resources.
    pub resources: BTreeMap<String, PathBuf>,
    /// Install prefixes of resolved dependencies.
    pub deps: BTreeMap<String, PathBuf>,
    pub platform: HostPlatform,
    pub jobs: u32,
}

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([a-z_]+)(?::([A-Za-z0-9@_.+-]+))?\}").unwrap());

impl ExecContext {
    /// Expand `{prefix}`, `{workdir}`, `{jobs}`, `{os}`, `{resource:NAME}`,
    /// and `{dep:NAME}` placeholders. Unknown placeholders are an error, not
    /// silently passed through.
    pub fn substitute(&self, input: &str) -> Result<String> {
        let mut out = String::with_capacity(input.len());
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(input) {
            let whole = caps.get(0).expect("capture 0 always present");
            out.push_str(&input[last..whole.start()]);
            let key = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let arg = caps.get(2).map(|m| m.as_str());
            let value = match (key, arg) {
                ("prefix", None) => self.prefix.display().to_string(),
                ("workdir", None) => self.workdir.display().to_string(),
                ("jobs", None) => self.jobs.to_string(),
                ("os", None) => self.platform.key().to_string(),
                ("resource", Some(name)) => self
                    .resources
                    .get(name)
                    .ok_or_else(|| Error::Template(format!("resource:{name}")))?
                    .display()
                    .to_string(),
                ("dep", Some(name)) => self
                    .deps
                    .get(name)
                    .ok_or_else(|| Error::Template(format!("dep:{name}")))?
                    .display()
                    .to_string(),
                _ => return Err(Error::Template(whole.as_str().to_string())),
            };
            out.push_str(&value);
            last = whole.end();
        }
        out.push_str(&input[last..]);
        Ok(out)
    }

    /// Resolve a path parameter: absolute stays as-is, relative is anchored
    /// at the work directory.
    pub fn resolve_path(&self, input: &str) -> Result<PathBuf> {
        let substituted = self.substitute(input)?;
        let path = PathBuf::from(&substituted);
        if path.is_absolute() {
            Ok(path)
        } else {
            Ok(self.workdir.join(path))
        }
    }
}

/// Placeholders referenced by a template string: (key, optional argument).
/// Used by recipe validation to check references before anything runs.
pub fn scan_placeholders(input: &str) -> Vec<(String, Option<String>)> {
    PLACEHOLDER
        .captures_iter(input)
        .map(|caps| {
            (
                caps[1].to_string(),
                caps.get(2).map(|m| m.as_str().to_string()),
            )
        })
        .collect()
}

/// How a step failed: the command (or step kind) that ran, the exit status
/// ("-" when nothing was spawned), and captured diagnostics.
#[derive(Debug)]
pub struct StepFailure {
    pub command: String,
    pub status: String,
    pub stderr: String,
}

impl StepFailure {
    fn internal(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            status: "-".to_string(),
            stderr: reason.into(),
        }
    }
}

pub trait Step: Send + Sync {
    fn kind(&self) -> &'static str;
    /// Rendered form for dry runs and logs.
    fn describe(&self, ctx: &ExecContext) -> Result<String>;
    fn execute(&self, ctx: &ExecContext) -> std::result::Result<(), StepFailure>;
}

type StepConstructor = Arc<dyn Fn(StepParameters) -> Result<Box<dyn Step>> + Send + Sync>;

/// Catalog of step kinds a recipe may declare.
pub struct StepRegistry {
    factories: HashMap<String, StepConstructor>,
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, constructor: F)
    where
        F: Fn(StepParameters) -> Result<Box<dyn Step>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(constructor));
    }

    pub fn create(&self, kind: &str, params: StepParameters) -> Result<Box<dyn Step>> {
        let factory = self.factories.get(kind).ok_or_else(|| Error::StepParams {
            kind: kind.to_string(),
            reason: format!(
                "unknown step kind (available: {})",
                self.known_kinds().join(", ")
            ),
        })?;
        factory(params)
    }

    pub fn known_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

/// Step kinds available in build sequences.
pub fn register_build_defaults(registry: &mut StepRegistry) {
    registry.register("run", |params| Ok(Box::new(RunStep::from_params(params)?)));
    registry.register("substitute", |params| {
        Ok(Box::new(SubstituteStep::from_params(params)?))
    });
    registry.register("install_glob", |params| {
        Ok(Box::new(InstallGlobStep::from_params(params)?))
    });
}

/// Step kinds available in test sequences.
pub fn register_test_defaults(registry: &mut StepRegistry) {
    registry.register("run", |params| Ok(Box::new(RunStep::from_params(params)?)));
    registry.register("fetch_check", |params| {
        Ok(Box::new(FetchCheckStep::from_params(params)?))
    });
    registry.register("checksum", |params| {
        Ok(Box::new(ChecksumStep::from_params(params)?))
    });
    registry.register("assert_exists", |params| {
        Ok(Box::new(AssertExistsStep::from_params(params)?))
    });
}

struct RunStep {
    command: String,
    args: Vec<String>,
    dir: Option<String>,
    platform_args: BTreeMap<String, Vec<String>>,
}

impl RunStep {
    fn from_params(mut params: StepParameters) -> Result<Self> {
        let command = require_string(&mut params, "command", "run")?;
        let args = take_string_list(&mut params, "args", "run")?;
        let dir = take_string(&mut params, "dir");
        let platform_args = take_platform_args(&mut params)?;
        Ok(Self {
            command,
            args,
            dir,
            platform_args,
        })
    }

    fn rendered(&self, ctx: &ExecContext) -> Result<(String, Vec<String>, PathBuf)> {
        let command = ctx.substitute(&self.command)?;
        let mut args = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            args.push(ctx.substitute(arg)?);
        }
        if let Some(extra) = self.platform_args.get(ctx.platform.key()) {
            for arg in extra {
                args.push(ctx.substitute(arg)?);
            }
        }
        let cwd = match &self.dir {
            Some(dir) => ctx.resolve_path(dir)?,
            None => ctx.workdir.clone(),
        };
        Ok((command, args, cwd))
    }
}

impl Step for RunStep {
    fn kind(&self) -> &'static str {
        "run"
    }

    fn describe(&self, ctx: &ExecContext) -> Result<String> {
        let (command, args, cwd) = self.rendered(ctx)?;
        Ok(format!(
            "run: {} {} (in {})",
            command,
            args.join(" "),
            cwd.display()
        ))
    }

    fn execute(&self, ctx: &ExecContext) -> std::result::Result<(), StepFailure> {
        let (command, args, cwd) = self
            .rendered(ctx)
            .map_err(|err| StepFailure::internal(self.command.clone(), err.to_string()))?;
        let command_line = if args.is_empty() {
            command.clone()
        } else {
            format!("{} {}", command, args.join(" "))
        };
        info!(command = %command_line, dir = %cwd.display(), "running build command");

        let output = Command::new(&command)
            .args(&args)
            .current_dir(&cwd)
            .output()
            .map_err(|err| StepFailure::internal(command_line.clone(), err.to_string()))?;
        if !output.status.success() {
            return Err(StepFailure {
                command: command_line,
                status: output.status.to_string(),
                stderr: tail(&String::from_utf8_lossy(&output.stderr)),
            });
        }
        Ok(())
    }
}

/// In-place text substitution against a staged file, applied before compile
/// steps so vendored sources can be adapted without touching the upstream
/// archive.
struct SubstituteStep {
    file: String,
    pattern: Regex,
    replace: String,
}

impl SubstituteStep {
    fn from_params(mut params: StepParameters) -> Result<Self> {
        let file = require_string(&mut params, "file", "substitute")?;
        let pattern_src = require_string(&mut params, "pattern", "substitute")?;
        let replace = require_string(&mut params, "replace", "substitute")?;
        let pattern = Regex::new(&pattern_src).map_err(|err| Error::StepParams {
            kind: "substitute".to_string(),
            reason: format!("invalid pattern '{pattern_src}': {err}"),
        })?;
        Ok(Self {
            file,
            pattern,
            replace,
        })
    }
}

impl Step for SubstituteStep {
    fn kind(&self) -> &'static str {
        "substitute"
    }

    fn describe(&self, ctx: &ExecContext) -> Result<String> {
        let path = ctx.resolve_path(&self.file)?;
        Ok(format!(
            "substitute: s/{}/{}/ in {}",
            self.pattern.as_str(),
            self.replace,
            path.display()
        ))
    }

    fn execute(&self, ctx: &ExecContext) -> std::result::Result<(), StepFailure> {
        let path = ctx
            .resolve_path(&self.file)
            .map_err(|err| StepFailure::internal("substitute", err.to_string()))?;
        let content = fs::read_to_string(&path).map_err(|err| {
            StepFailure::internal("substitute", format!("{}: {err}", path.display()))
        })?;
        if !self.pattern.is_match(&content) {
            return Err(StepFailure::internal(
                "substitute",
                format!(
                    "pattern '{}' matched nothing in {}",
                    self.pattern.as_str(),
                    path.display()
                ),
            ));
        }
        let rewritten = self.pattern.replace_all(&content, self.replace.as_str());
        fs::write(&path, rewritten.as_bytes()).map_err(|err| {
            StepFailure::internal("substitute", format!("{}: {err}", path.display()))
        })?;
        Ok(())
    }
}

/// Copy files matching a glob into a destination directory.
struct InstallGlobStep {
    src: String,
    dest: String,
}

impl InstallGlobStep {
    fn from_params(mut params: StepParameters) -> Result<Self> {
        let src = require_string(&mut params, "src", "install_glob")?;
        let dest = require_string(&mut params, "dest", "install_glob")?;
        Ok(Self { src, dest })
    }
}

impl Step for InstallGlobStep {
    fn kind(&self) -> &'static str {
        "install_glob"
    }

    fn describe(&self, ctx: &ExecContext) -> Result<String> {
        Ok(format!(
            "install_glob: {} -> {}",
            ctx.resolve_path(&self.src)?.display(),
            ctx.resolve_path(&self.dest)?.display()
        ))
    }

    fn execute(&self, ctx: &ExecContext) -> std::result::Result<(), StepFailure> {
        let pattern = ctx
            .resolve_path(&self.src)
            .map_err(|err| StepFailure::internal("install_glob", err.to_string()))?;
        let dest = ctx
            .resolve_path(&self.dest)
            .map_err(|err| StepFailure::internal("install_glob", err.to_string()))?;
        fs::create_dir_all(&dest)
            .map_err(|err| StepFailure::internal("install_glob", err.to_string()))?;

        let pattern_str = pattern.to_string_lossy().to_string();
        let matches = glob(&pattern_str)
            .map_err(|err| StepFailure::internal("install_glob", err.to_string()))?;
        let mut copied = 0usize;
        for entry in matches {
            let path =
                entry.map_err(|err| StepFailure::internal("install_glob", err.to_string()))?;
            if !path.is_file() {
                continue;
            }
            let name = path
                .file_name()
                .ok_or_else(|| StepFailure::internal("install_glob", "unnamed file"))?;
            fs::copy(&path, dest.join(name))
                .map_err(|err| StepFailure::internal("install_glob", err.to_string()))?;
            copied += 1;
        }
        if copied == 0 {
            return Err(StepFailure::internal(
                "install_glob",
                format!("no files matched '{pattern_str}'"),
            ));
        }
        info!(pattern = %pattern_str, dest = %dest.display(), copied, "installed files");
        Ok(())
    }
}

/// Download a URL into the scratch directory and verify its sha256.
struct FetchCheckStep {
    url: String,
    sha256: String,
}

impl FetchCheckStep {
    fn from_params(mut params: StepParameters) -> Result<Self> {
        let url = require_string(&mut params, "url", "fetch_check")?;
        let sha256 = require_string(&mut params, "sha256", "fetch_check")?;
        Ok(Self { url, sha256 })
    }
}

impl Step for FetchCheckStep {
    fn kind(&self) -> &'static str {
        "fetch_check"
    }

    fn describe(&self, ctx: &ExecContext) -> Result<String> {
        let url = ctx.substitute(&self.url)?;
        Ok(format!("fetch_check: {url} (sha256 {})", self.sha256))
    }

    fn execute(&self, ctx: &ExecContext) -> std::result::Result<(), StepFailure> {
        let url = ctx
            .substitute(&self.url)
            .map_err(|err| StepFailure::internal("fetch_check", err.to_string()))?;
        let dest = ctx.workdir.join(filename_from_url(&url));
        let fetcher = Fetcher::new()
            .map_err(|err| StepFailure::internal("fetch_check", err.to_string()))?;
        fetcher
            .download_file(&url, &dest)
            .map_err(|err| StepFailure::internal("fetch_check", err.to_string()))?;
        verify_local(&dest, &self.sha256, "fetch_check")
    }
}

/// Verify the sha256 of a file produced by earlier test steps.
struct ChecksumStep {
    path: String,
    sha256: String,
}

impl ChecksumStep {
    fn from_params(mut params: StepParameters) -> Result<Self> {
        let path = require_string(&mut params, "path", "checksum")?;
        let sha256 = require_string(&mut params, "sha256", "checksum")?;
        Ok(Self { path, sha256 })
    }
}

impl Step for ChecksumStep {
    fn kind(&self) -> &'static str {
        "checksum"
    }

    fn describe(&self, ctx: &ExecContext) -> Result<String> {
        Ok(format!(
            "checksum: {} == {}",
            ctx.resolve_path(&self.path)?.display(),
            self.sha256
        ))
    }

    fn execute(&self, ctx: &ExecContext) -> std::result::Result<(), StepFailure> {
        let path = ctx
            .resolve_path(&self.path)
            .map_err(|err| StepFailure::internal("checksum", err.to_string()))?;
        verify_local(&path, &self.sha256, "checksum")
    }
}

struct AssertExistsStep {
    path: String,
}

impl AssertExistsStep {
    fn from_params(mut params: StepParameters) -> Result<Self> {
        let path = require_string(&mut params, "path", "assert_exists")?;
        Ok(Self { path })
    }
}

impl Step for AssertExistsStep {
    fn kind(&self) -> &'static str {
        "assert_exists"
    }

    fn describe(&self, ctx: &ExecContext) -> Result<String> {
        Ok(format!(
            "assert_exists: {}",
            ctx.resolve_path(&self.path)?.display()
        ))
    }

    fn execute(&self, ctx: &ExecContext) -> std::result::Result<(), StepFailure> {
        let path = ctx
            .resolve_path(&self.path)
            .map_err(|err| StepFailure::internal("assert_exists", err.to_string()))?;
        if path.exists() {
            Ok(())
        } else {
            Err(StepFailure::internal(
                "assert_exists",
                format!("{} does not exist", path.display()),
            ))
        }
    }
}

fn verify_local(
    path: &std::path::Path,
    expected: &str,
    kind: &'static str,
) -> std::result::Result<(), StepFailure> {
    let actual =
        sha256_file(path).map_err(|err| StepFailure::internal(kind, err.to_string()))?;
    if actual != expected {
        return Err(StepFailure::internal(
            kind,
            format!(
                "sha256 mismatch for {}: expected {expected}, got {actual}",
                path.display()
            ),
        ));
    }
    Ok(())
}

fn tail(text: &str) -> String {
    const LIMIT: usize = 2000;
    let trimmed = text.trim_end();
    if trimmed.len() <= LIMIT {
        trimmed.to_string()
    } else {
        let mut start = trimmed.len() - LIMIT;
        while !trimmed.is_char_boundary(start) {
            start += 1;
        }
        format!("...{}", &trimmed[start..])
    }
}

fn require_string(params: &mut StepParameters, key: &str, kind: &str) -> Result<String> {
    match params.remove(key) {
        Some(Value::String(value)) => Ok(value),
        Some(other) => Err(Error::StepParams {
            kind: kind.to_string(),
            reason: format!("'{key}' must be a string, got {other}"),
        }),
        None => Err(Error::StepParams {
            kind: kind.to_string(),
            reason: format!("missing required parameter '{key}'"),
        }),
    }
}

fn take_string(params: &mut StepParameters, key: &str) -> Option<String> {
    match params.remove(key) {
        Some(Value::String(value)) => Some(value),
        _ => None,
    }
}

fn take_string_list(params: &mut StepParameters, key: &str, kind: &str) -> Result<Vec<String>> {
    match params.remove(key) {
        None => Ok(Vec::new()),
        Some(Value::Array(values)) => values
            .into_iter()
            .map(|value| match value {
                Value::String(s) => Ok(s),
                other => Err(Error::StepParams {
                    kind: kind.to_string(),
                    reason: format!("'{key}' entries must be strings, got {other}"),
                }),
            })
            .collect(),
        Some(other) => Err(Error::StepParams {
            kind: kind.to_string(),
            reason: format!("'{key}' must be a list, got {other}"),
        }),
    }
}

fn take_platform_args(params: &mut StepParameters) -> Result<BTreeMap<String, Vec<String>>> {
    let mut table = BTreeMap::new();
    match params.remove("platform_args") {
        None => Ok(table),
        Some(Value::Object(map)) => {
            for (platform, value) in map {
                match value {
                    Value::Array(values) => {
                        let args = values
                            .into_iter()
                            .map(|v| match v {
                                Value::String(s) => Ok(s),
                                other => Err(Error::StepParams {
                                    kind: "run".to_string(),
                                    reason: format!(
                                        "platform_args entries must be strings, got {other}"
                                    ),
                                }),
                            })
                            .collect::<Result<Vec<_>>>()?;
                        table.insert(platform, args);
                    }
                    other => {
                        return Err(Error::StepParams {
                            kind: "run".to_string(),
                            reason: format!("platform_args values must be lists, got {other}"),
                        });
                    }
                }
            }
            Ok(table)
        }
        Some(other) => Err(Error::StepParams {
            kind: "run".to_string(),
            reason: format!("platform_args must be a table, got {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn context(workdir: PathBuf) -> ExecContext {
        let mut deps = BTreeMap::new();
        deps.insert("krb5".to_string(), PathBuf::from("/opt/krb5"));
        let mut resources = BTreeMap::new();
        resources.insert("quiche".to_string(), PathBuf::from("/stage/quiche"));
        ExecContext {
            prefix: PathBuf::from("/cellar/demo/1.0"),
            workdir,
            resources,
            deps,
            platform: HostPlatform::Linux,
            jobs: 4,
        }
    }

    #[test]
    fn substitutes_known_placeholders() {
        let ctx = context(PathBuf::from("/work"));
        assert_eq!(
            ctx.substitute("--prefix={prefix}").unwrap(),
            "--prefix=/cellar/demo/1.0"
        );
        assert_eq!(
            ctx.substitute("--with-gssapi={dep:krb5}").unwrap(),
            "--with-gssapi=/opt/krb5"
        );
        assert_eq!(
            ctx.substitute("{resource:quiche}/target").unwrap(),
            "/stage/quiche/target"
        );
        assert_eq!(ctx.substitute("-j{jobs}").unwrap(), "-j4");
        assert_eq!(ctx.substitute("{os}").unwrap(), "linux");
    }

    #[test]
    fn rejects_unknown_placeholders() {
        let ctx = context(PathBuf::from("/work"));
        assert!(matches!(
            ctx.substitute("{dep:missing}"),
            Err(Error::Template(_))
        ));
        assert!(matches!(
            ctx.substitute("{bogus}"),
            Err(Error::Template(_))
        ));
    }

    #[test]
    fn run_step_reports_exit_status() {
        let temp = tempdir().unwrap();
        let ctx = context(temp.path().to_path_buf());
        let mut registry = StepRegistry::new();
        register_build_defaults(&mut registry);

        let mut params = StepParameters::new();
        params.insert("command".to_string(), json!("sh"));
        params.insert("args".to_string(), json!(["-c", "exit 3"]));
        let step = registry.create("run", params).unwrap();

        let failure = step.execute(&ctx).unwrap_err();
        assert!(failure.status.contains('3'), "status: {}", failure.status);
    }

    #[test]
    fn platform_args_extend_base_args() {
        let mut params = StepParameters::new();
        params.insert("command".to_string(), json!("./configure"));
        params.insert("args".to_string(), json!(["--prefix={prefix}"]));
        params.insert(
            "platform_args".to_string(),
            json!({"linux": ["--with-gssapi={dep:krb5}"], "macos": ["--with-gssapi"]}),
        );
        let step = RunStep::from_params(params).unwrap();
        let ctx = context(PathBuf::from("/work"));
        let (_, args, _) = step.rendered(&ctx).unwrap();
        assert_eq!(
            args,
            vec![
                "--prefix=/cellar/demo/1.0".to_string(),
                "--with-gssapi=/opt/krb5".to_string()
            ]
        );
    }

    #[test]
    fn substitute_step_rewrites_file() {
        let temp = tempdir().unwrap();
        let manifest = temp.path().join("Cargo.toml");
        fs::write(&manifest, "[lib]\ncrate-type = [\"lib\", \"cdylib\"]\n").unwrap();

        let mut params = StepParameters::new();
        params.insert("file".to_string(), json!("Cargo.toml"));
        params.insert("pattern".to_string(), json!("(?m)^crate-type = .*"));
        params.insert(
            "replace".to_string(),
            json!("crate-type = [\"staticlib\"]"),
        );
        let step = SubstituteStep::from_params(params).unwrap();

        let ctx = context(temp.path().to_path_buf());
        step.execute(&ctx).unwrap();
        let rewritten = fs::read_to_string(&manifest).unwrap();
        assert!(rewritten.contains("crate-type = [\"staticlib\"]"));
    }

    #[test]
    fn substitute_step_fails_when_pattern_matches_nothing() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("notes.txt"), "nothing here\n").unwrap();

        let mut params = StepParameters::new();
        params.insert("file".to_string(), json!("notes.txt"));
        params.insert("pattern".to_string(), json!("^crate-type"));
        params.insert("replace".to_string(), json!("x"));
        let step = SubstituteStep::from_params(params).unwrap();

        let ctx = context(temp.path().to_path_buf());
        assert!(step.execute(&ctx).is_err());
    }

    #[test]
    fn missing_required_parameter_is_rejected() {
        let registry = {
            let mut registry = StepRegistry::new();
            register_build_defaults(&mut registry);
            registry
        };
        let result = registry.create("run", StepParameters::new());
        assert!(matches!(result, Err(Error::StepParams { .. })));
    }
}
