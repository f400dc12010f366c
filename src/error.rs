use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by any phase of a recipe build.
///
/// Every phase is fail-fast: the first error aborts the remaining steps of
/// that phase and the recipe as a whole.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level failure while fetching a resource.
    #[error("failed to fetch '{url}': {reason}")]
    Fetch { url: String, reason: String },

    /// Fetched bytes do not match the declared content hash.
    #[error(
        "integrity mismatch for resource '{resource}': expected sha256 {expected}, got {actual}"
    )]
    Integrity {
        resource: String,
        expected: String,
        actual: String,
    },

    /// The dependency graph contains a cycle within the requested scope.
    #[error("dependency cycle detected among: {0}")]
    Cycle(String),

    /// A declared dependency is neither in the registry nor provided by the host.
    #[error("unresolved dependency '{dependency}' required by '{requirer}'")]
    UnresolvedDependency {
        dependency: String,
        requirer: String,
    },

    /// A build step exited non-zero (or could not run at all).
    #[error("build step {index} ({command}) failed with {status}: {stderr}")]
    BuildStep {
        index: usize,
        command: String,
        status: String,
        stderr: String,
    },

    /// A post-install verification step failed. The install is not undone.
    #[error("test step {index} failed: {reason}")]
    TestFailure { index: usize, reason: String },

    /// No recipe with this name in the registry.
    #[error("no recipe named '{0}' in the registry")]
    NotFound(String),

    /// A recipe file could not be loaded or parsed.
    #[error("recipe '{path}': {reason}")]
    Recipe { path: String, reason: String },

    /// Step parameters are missing or have the wrong shape.
    #[error("invalid step parameters for '{kind}': {reason}")]
    StepParams { kind: String, reason: String },

    /// An argument template references an unknown placeholder.
    #[error("unknown template placeholder '{0}'")]
    Template(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
