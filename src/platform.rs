use std::path::PathBuf;
use std::process::Command;

use clap::ValueEnum;
use serde::Deserialize;
use tracing::debug;

/// Platform selection requested on the command line.
#[derive(Debug, Clone, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PlatformPolicy {
    Auto,
    Macos,
    Linux,
}

impl Default for PlatformPolicy {
    fn default() -> Self {
        PlatformPolicy::Auto
    }
}

/// The host platform a recipe is built on.
///
/// Consulted once per step to select platform-conditional arguments; recipes
/// never branch on this themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPlatform {
    MacOs,
    Linux,
}

impl HostPlatform {
    pub fn detect() -> Self {
        if cfg!(target_os = "macos") {
            HostPlatform::MacOs
        } else {
            HostPlatform::Linux
        }
    }

    pub fn from_policy(policy: &PlatformPolicy) -> Self {
        match policy {
            PlatformPolicy::Auto => Self::detect(),
            PlatformPolicy::Macos => HostPlatform::MacOs,
            PlatformPolicy::Linux => HostPlatform::Linux,
        }
    }

    /// Key used for platform-conditional argument tables in recipes.
    pub fn key(&self) -> &'static str {
        match self {
            HostPlatform::MacOs => "macos",
            HostPlatform::Linux => "linux",
        }
    }
}

/// Default `-j` parallelism handed to build tools via the `{jobs}` template.
pub fn default_jobs() -> u32 {
    std::thread::available_parallelism()
        .map(|p| p.get() as u32)
        .unwrap_or(4)
}

/// Locate an executable on the host PATH.
pub fn find_executable(name: &str) -> Option<PathBuf> {
    which::which(name).ok()
}

/// Check whether a host-provided dependency is actually present.
///
/// Two tiers: an executable lookup on the probe name, then a
/// `pkg-config --exists` query for library-only dependencies that ship no
/// binary of their own.
pub fn host_provides(name: &str, probe: Option<&str>) -> bool {
    let executable = probe.unwrap_or(name);
    if find_executable(executable).is_some() {
        debug!(dependency = name, executable, "host probe found executable");
        return true;
    }

    if find_executable("pkg-config").is_some() {
        let found = Command::new("pkg-config")
            .args(["--exists", name])
            .status()
            .map(|status| status.success())
            .unwrap_or(false);
        if found {
            debug!(dependency = name, "host probe satisfied via pkg-config");
        }
        return found;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_a_platform() {
        let platform = HostPlatform::detect();
        assert!(matches!(
            platform,
            HostPlatform::MacOs | HostPlatform::Linux
        ));
    }

    #[test]
    fn policy_overrides_detection() {
        assert_eq!(
            HostPlatform::from_policy(&PlatformPolicy::Macos),
            HostPlatform::MacOs
        );
        assert_eq!(
            HostPlatform::from_policy(&PlatformPolicy::Linux),
            HostPlatform::Linux
        );
    }

    #[test]
    fn probe_finds_a_shell() {
        assert!(host_provides("sh", None));
    }

    #[test]
    fn probe_rejects_nonsense() {
        assert!(!host_provides("definitely-not-a-real-host-dependency", None));
    }
}
