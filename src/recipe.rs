use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Parameters for one build or test step, as declared in the recipe.
pub type StepParameters = Map<String, Value>;

/// A declarative build recipe: how to fetch, build, install, and verify one
/// package. Immutable once loaded; owned by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    /// Primary source location for release builds.
    pub source: ResourceSpec,
    /// Alternative source for version-control head builds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<ResourceSpec>,
    /// Reason this package is not linked into the default prefix, when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keg_only: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DependencySpec>,
    /// Named sub-resources staged into the work directory before build steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<NamedResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub build: Vec<StepSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub test: Vec<StepSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub livecheck: Option<LivecheckSpec>,
}

impl Recipe {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| Error::Recipe {
            path: path.display().to_string(),
            reason: format!("failed to read: {err}"),
        })?;
        let recipe: Recipe = serde_yaml::from_str(&content).map_err(|err| Error::Recipe {
            path: path.display().to_string(),
            reason: format!("failed to parse YAML: {err}"),
        })?;
        Ok(recipe)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|err| Error::Recipe {
            path: self.name.clone(),
            reason: format!("failed to serialize: {err}"),
        })
    }

    /// Source to stage for this build: the head resource when requested and
    /// declared, the release source otherwise.
    pub fn source_for(&self, head: bool) -> &ResourceSpec {
        if head {
            self.head.as_ref().unwrap_or(&self.source)
        } else {
            &self.source
        }
    }

}

/// Where a dependency is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyScope {
    /// Needed only to build the package.
    Build,
    /// Needed to build and at runtime.
    Runtime,
    /// Provided by the host OS; probed, never built.
    Host,
}

impl Default for DependencyScope {
    fn default() -> Self {
        DependencyScope::Runtime
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub name: String,
    #[serde(default)]
    pub scope: DependencyScope,
    /// Executable probed for host-scoped dependencies. Defaults to the
    /// dependency name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<String>,
}

/// A source location: an archive URL (with optional mirrors) or a git
/// repository plus ref.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceSpec {
    Archive {
        url: String,
        /// Required for http(s) archives; verified before the stage is usable.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sha256: Option<String>,
        /// Tried in order when the primary URL fails at the transport level.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        mirrors: Vec<String>,
    },
    Git {
        git: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
    },
}

impl ResourceSpec {
    pub fn location(&self) -> &str {
        match self {
            ResourceSpec::Archive { url, .. } => url,
            ResourceSpec::Git { git, .. } => git,
        }
    }

    pub fn sha256(&self) -> Option<&str> {
        match self {
            ResourceSpec::Archive { sha256, .. } => sha256.as_deref(),
            ResourceSpec::Git { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedResource {
    pub name: String,
    pub source: ResourceSpec,
}

/// One build or test step: a registered kind plus its parameters, executed
/// strictly in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<StepParameters>,
}

/// Advisory newer-upstream-version check. Never consulted during a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivecheckSpec {
    pub url: String,
    /// Regex with one capture group yielding a version string.
    pub pattern: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_and_git_sources_deserialize() {
        let archive: ResourceSpec =
            serde_yaml::from_str("url: https://example.org/pkg-1.0.tar.gz\nsha256: abc123\n")
                .unwrap();
        assert_eq!(archive.location(), "https://example.org/pkg-1.0.tar.gz");
        assert_eq!(archive.sha256(), Some("abc123"));

        let git: ResourceSpec =
            serde_yaml::from_str("git: https://example.org/pkg.git\nbranch: main\n").unwrap();
        assert_eq!(git.location(), "https://example.org/pkg.git");
        assert_eq!(git.sha256(), None);
    }

    #[test]
    fn dependency_scope_defaults_to_runtime() {
        let dep: DependencySpec = serde_yaml::from_str("name: zstd\n").unwrap();
        assert_eq!(dep.scope, DependencyScope::Runtime);
    }

    #[test]
    fn head_source_falls_back_to_release() {
        let recipe: Recipe = serde_yaml::from_str(
            "name: demo\nversion: '1.0'\nsource:\n  url: https://example.org/demo.tar.gz\n  sha256: feed\n",
        )
        .unwrap();
        assert_eq!(
            recipe.source_for(true).location(),
            "https://example.org/demo.tar.gz"
        );
    }
}
