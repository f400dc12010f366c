use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::Command;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::recipe::ResourceSpec;

/// Marker written when staging begins and removed only after verification and
/// unpack succeed. A directory carrying it must never be treated as usable.
pub const INCOMPLETE_MARKER: &str = ".cauldron-incomplete";

/// A staged, verified local copy of upstream source content.
#[derive(Debug, Clone)]
pub struct StagedResource {
    pub name: String,
    /// Root of the usable source tree. For archives with a single top-level
    /// directory this is that directory.
    pub root: PathBuf,
    /// Directory the marker lives in while the stage is incomplete.
    staging: PathBuf,
}

impl StagedResource {
    pub fn is_complete(&self) -> bool {
        !self.staging.join(INCOMPLETE_MARKER).exists()
    }
}

/// Resolves resource descriptors to staged local directories.
pub struct Fetcher {
    client: reqwest::blocking::Client,
}

impl Fetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("cauldron/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| Error::Fetch {
                url: String::new(),
                reason: format!("failed to build HTTP client: {err}"),
            })?;
        Ok(Self { client })
    }

    /// Stage a resource into `staging`, verifying integrity when a hash is
    /// declared. The staging directory is created if needed and keeps an
    /// incomplete marker until the stage is usable.
    pub fn stage(&self, name: &str, spec: &ResourceSpec, staging: &Path) -> Result<StagedResource> {
        fs::create_dir_all(staging)?;
        let marker = staging.join(INCOMPLETE_MARKER);
        fs::write(&marker, b"staging in progress\n")?;

        let root = match spec {
            ResourceSpec::Archive {
                url,
                sha256,
                mirrors,
            } => self.stage_archive(name, url, mirrors, sha256.as_deref(), staging)?,
            ResourceSpec::Git { git, branch } => {
                stage_git(git, branch.as_deref(), staging)?
            }
        };

        fs::remove_file(&marker)?;
        info!(resource = name, root = %root.display(), "resource staged");
        Ok(StagedResource {
            name: name.to_string(),
            root,
            staging: staging.to_path_buf(),
        })
    }

    fn stage_archive(
        &self,
        name: &str,
        url: &str,
        mirrors: &[String],
        sha256: Option<&str>,
        staging: &Path,
    ) -> Result<PathBuf> {
        let filename = filename_from_url(url);
        let dest = staging.join(&filename);

        // Mirrors cover transport failures only. An integrity mismatch means
        // we received complete-but-wrong bytes and must surface that, not
        // mask it by retrying elsewhere.
        let mut last_err = None;
        let mut fetched = false;
        for candidate in std::iter::once(url).chain(mirrors.iter().map(String::as_str)) {
            match self.download_file(candidate, &dest) {
                Ok(()) => {
                    fetched = true;
                    break;
                }
                Err(err) => {
                    warn!(url = candidate, error = %err, "download failed");
                    last_err = Some(err);
                }
            }
        }
        if !fetched {
            return Err(last_err.unwrap_or_else(|| Error::Fetch {
                url: url.to_string(),
                reason: "no URL candidates".to_string(),
            }));
        }

        if let Some(expected) = sha256 {
            let actual = sha256_file(&dest)?;
            if actual != expected {
                let _ = fs::remove_file(&dest);
                return Err(Error::Integrity {
                    resource: name.to_string(),
                    expected: expected.to_string(),
                    actual,
                });
            }
            debug!(resource = name, sha256 = expected, "integrity verified");
        }

        if is_tar_archive(&filename) {
            let unpacked = staging.join("unpacked");
            fs::create_dir_all(&unpacked)?;
            extract_tar(&dest, &unpacked)?;
            Ok(strip_single_root(&unpacked))
        } else {
            Ok(staging.to_path_buf())
        }
    }

    /// Download a URL to `dest`. `http(s)` goes through the HTTP client;
    /// `file:` is a local copy. Writes to a temp path first and renames into
    /// place, so a failed transfer never leaves a plausible-looking file.
    pub fn download_file(&self, url: &str, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp = dest.with_extension("part");

        if let Some(local) = url.strip_prefix("file://") {
            fs::copy(local, &temp).map_err(|err| Error::Fetch {
                url: url.to_string(),
                reason: format!("local copy failed: {err}"),
            })?;
            fs::rename(&temp, dest)?;
            return Ok(());
        }

        info!(url, dest = %dest.display(), "downloading");
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|err| Error::Fetch {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(Error::Fetch {
                url: url.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        let mut file = File::create(&temp)?;
        if let Err(err) = io::copy(&mut response, &mut file) {
            drop(file);
            let _ = fs::remove_file(&temp);
            return Err(Error::Fetch {
                url: url.to_string(),
                reason: format!("transfer failed: {err}"),
            });
        }
        fs::rename(&temp, dest)?;
        Ok(())
    }
}

fn stage_git(url: &str, branch: Option<&str>, staging: &Path) -> Result<PathBuf> {
    let checkout = staging.join("checkout");
    if checkout.exists() {
        fs::remove_dir_all(&checkout)?;
    }

    let mut cmd = Command::new("git");
    cmd.args(["clone", "--depth", "1"]);
    if let Some(branch) = branch {
        cmd.args(["--branch", branch]);
    }
    cmd.arg(url).arg(&checkout);

    info!(url, branch = branch.unwrap_or("HEAD"), "cloning");
    let output = cmd.output().map_err(|err| Error::Fetch {
        url: url.to_string(),
        reason: format!("git failed to start: {err}"),
    })?;
    if !output.status.success() {
        return Err(Error::Fetch {
            url: url.to_string(),
            reason: format!(
                "git clone exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(checkout)
}

/// Extract a tar archive by shelling out to `tar`, which handles the usual
/// compression formats uniformly.
fn extract_tar(archive: &Path, dest: &Path) -> Result<()> {
    let output = Command::new("tar")
        .arg("-xf")
        .arg(archive)
        .arg("-C")
        .arg(dest)
        .output()
        .map_err(|err| Error::Fetch {
            url: archive.display().to_string(),
            reason: format!("tar failed to start: {err}"),
        })?;
    if !output.status.success() {
        return Err(Error::Fetch {
            url: archive.display().to_string(),
            reason: format!(
                "tar exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(())
}

/// Source tarballs conventionally unpack to a single versioned directory;
/// when that holds, that directory is the staged root.
fn strip_single_root(unpacked: &Path) -> PathBuf {
    let entries: Vec<_> = match fs::read_dir(unpacked) {
        Ok(read) => read.filter_map(|e| e.ok()).collect(),
        Err(_) => return unpacked.to_path_buf(),
    };
    if entries.len() == 1 && entries[0].path().is_dir() {
        entries[0].path()
    } else {
        unpacked.to_path_buf()
    }
}

pub fn is_tar_archive(filename: &str) -> bool {
    const SUFFIXES: &[&str] = &[
        ".tar.gz", ".tgz", ".tar.bz2", ".tbz2", ".tar.xz", ".txz", ".tar.zst", ".tar",
    ];
    SUFFIXES.iter().any(|s| filename.ends_with(s))
}

pub fn filename_from_url(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or("download")
        .to_string()
}

/// Compute the SHA256 digest of the file at `path` as a hex string.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn sha256_file_is_stable() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("digest.bin");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"cauldron").unwrap();

        let digest = sha256_file(&path).unwrap();
        assert_eq!(
            digest,
            "04424a9646bc5e1ba00dbcce5a87a3478d2ba30eccedad72e85f0e850413d03c"
        );
    }

    #[test]
    fn recognizes_tar_archives() {
        assert!(is_tar_archive("curl-8.18.0.tar.bz2"));
        assert!(is_tar_archive("pkg.tar.gz"));
        assert!(!is_tar_archive("mk-ca-bundle.pl"));
    }

    #[test]
    fn filename_from_url_takes_last_segment() {
        assert_eq!(
            filename_from_url("https://curl.se/download/curl-8.18.0.tar.bz2"),
            "curl-8.18.0.tar.bz2"
        );
        assert_eq!(filename_from_url("https://example.org/"), "example.org");
    }
}
