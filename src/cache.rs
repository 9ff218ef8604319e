//! Monitor binary acquisition.
//!
//! Resolves the release asset for the host, keeps a verified copy in the cache
//! directory, and re-downloads whenever the cached copy fails its hash check.

mod http;

use std::env;
use std::fmt::Write as _;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
pub use http::HttpFetcher;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// The only operating system the monitor ships for.
const SUPPORTED_OS: &str = "linux";

/// Suffix counter for partial download files, unique within this process.
static PARTIAL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Rendezvous socket file inside the cache directory.
pub const SOCKET_NAME: &str = "wayafknext.sock";

/// Errors that can occur while acquiring the monitor binary.
#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Binary hash mismatch (expected {expected}, got {actual})")]
    Integrity { expected: String, actual: String },

    #[error("Cache I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl AcquisitionError {
    /// Whether retrying cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedPlatform(_) | Self::UnsupportedArchitecture(_) | Self::Integrity { .. }
        )
    }
}

/// Source of release assets.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Download `url` into memory.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, AcquisitionError>;
}

/// Host operating system and CPU architecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// The platform this process runs on.
    pub fn host() -> Self {
        Self::new(env::consts::OS, env::consts::ARCH)
    }
}

/// A pinned monitor release: where assets live and which hashes are accepted.
#[derive(Debug, Clone)]
pub struct MonitorRelease {
    /// Release download prefix, without trailing slash.
    pub base_url: String,

    /// Asset name before the `.{arch}` suffix.
    pub asset_stem: String,

    /// Accepted SHA-256 (hex) per architecture.
    pub hashes: Vec<(String, String)>,
}

impl MonitorRelease {
    /// The release this supervisor is built against.
    pub fn pinned() -> Self {
        Self {
            base_url: "https://github.com/MuffinTastic/wayafknext-monitor/releases/download/v0.2.3"
                .to_string(),
            asset_stem: "wayafknext-monitor".to_string(),
            hashes: vec![
                (
                    "aarch64".to_string(),
                    "2fba12f3d73cae986ac54670fcef6fe3b509449595658afda7f87a00630cebe4".to_string(),
                ),
                (
                    "x86_64".to_string(),
                    "bc83de4b5819ad9a8ec645705dc59bfd506e33c8134c2a978805494652a4f5d0".to_string(),
                ),
            ],
        }
    }

    /// Resolve the asset for a platform.
    pub fn binary_for(&self, platform: &Platform) -> Result<MonitorBinary, AcquisitionError> {
        if platform.os != SUPPORTED_OS {
            return Err(AcquisitionError::UnsupportedPlatform(platform.os.clone()));
        }

        let Some((_, sha256)) = self.hashes.iter().find(|(arch, _)| *arch == platform.arch) else {
            return Err(AcquisitionError::UnsupportedArchitecture(
                platform.arch.clone(),
            ));
        };

        let file_name = format!("{}.{}", self.asset_stem, platform.arch);

        Ok(MonitorBinary {
            url: format!("{}/{}", self.base_url, file_name),
            file_name,
            sha256: sha256.clone(),
        })
    }
}

impl Default for MonitorRelease {
    fn default() -> Self {
        Self::pinned()
    }
}

/// A resolved release asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorBinary {
    /// Download URL.
    pub url: String,

    /// Asset file name, also the cached executable's name.
    pub file_name: String,

    /// Expected SHA-256, hex encoded.
    pub sha256: String,
}

/// Local cache of the verified monitor executable.
pub struct BinaryCache {
    dir: PathBuf,
    release: MonitorRelease,
    platform: Platform,
    fetcher: Arc<dyn Fetch>,
}

impl BinaryCache {
    /// Create a cache for the host platform.
    pub fn new(dir: PathBuf, release: MonitorRelease, fetcher: Arc<dyn Fetch>) -> Self {
        Self::for_platform(dir, release, Platform::host(), fetcher)
    }

    /// Create a cache for an explicit platform.
    pub fn for_platform(
        dir: PathBuf,
        release: MonitorRelease,
        platform: Platform,
        fetcher: Arc<dyn Fetch>,
    ) -> Self {
        Self {
            dir,
            release,
            platform,
            fetcher,
        }
    }

    /// Cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rendezvous socket path.
    pub fn socket_path(&self) -> PathBuf {
        self.dir.join(SOCKET_NAME)
    }

    /// Resolve the asset for this cache's platform.
    pub fn binary(&self) -> Result<MonitorBinary, AcquisitionError> {
        self.release.binary_for(&self.platform)
    }

    /// Make sure a verified executable is present and return its path.
    ///
    /// A cached copy with the right hash is used as-is without touching the
    /// network. Anything else is replaced by a fresh, verified download.
    pub async fn ensure(&self) -> Result<PathBuf, AcquisitionError> {
        let binary = self.binary()?;
        let path = self.dir.join(&binary.file_name);

        match tokio::fs::read(&path).await {
            Ok(existing) => {
                let actual = sha256_hex(&existing);
                if actual.eq_ignore_ascii_case(&binary.sha256) {
                    debug!("Monitor binary found: {}", path.display());
                    return Ok(path);
                }
                warn!(
                    "Cached monitor binary failed verification (got {}), downloading again",
                    actual
                );
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No cached monitor binary at {}", path.display());
            }
            Err(e) => warn!("Failed to read cached monitor binary: {}", e),
        }

        info!("Downloading monitor binary: {}", binary.url);
        tokio::fs::create_dir_all(&self.dir).await?;

        let bytes = self.fetcher.fetch(&binary.url).await?;
        let actual = sha256_hex(&bytes);
        if !actual.eq_ignore_ascii_case(&binary.sha256) {
            return Err(AcquisitionError::Integrity {
                expected: binary.sha256,
                actual,
            });
        }

        let partial = self.dir.join(format!(
            "{}.{}-{}.part",
            binary.file_name,
            std::process::id(),
            PARTIAL_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        if let Err(e) = install(&partial, &path, &bytes).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.into());
        }

        info!("Downloaded monitor binary to {}", path.display());
        Ok(path)
    }
}

/// Write `bytes` to `partial`, make it executable and move it over `path`.
async fn install(partial: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    tokio::fs::write(partial, bytes).await?;
    tokio::fs::set_permissions(partial, std::fs::Permissions::from_mode(0o755)).await?;
    tokio::fs::rename(partial, path).await
}

/// Hex-encoded SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut hex, "{byte:02x}");
    }
    hex
}
