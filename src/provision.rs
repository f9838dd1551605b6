use crate::error::ProvisionError;
use clap::ValueEnum;
use flate2::read::GzDecoder;
use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Maximum redirects followed per download.
const MAX_REDIRECTS: usize = 5;
const SELF_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Processor flavour an artifact is built for.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ArchKey {
    /// x86-64 with AVX-class extensions
    Amd64V3,
    Amd64,
    Arm64,
    Armv7,
    I386,
    Riscv64,
    S390x,
}

impl fmt::Display for ArchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArchKey::Amd64V3 => "amd64-v3",
            ArchKey::Amd64 => "amd64",
            ArchKey::Arm64 => "arm64",
            ArchKey::Armv7 => "armv7",
            ArchKey::I386 => "386",
            ArchKey::Riscv64 => "riscv64",
            ArchKey::S390x => "s390x",
        };
        f.write_str(s)
    }
}

/// Rank the artifact flavours usable on `arch`, best first.
///
/// On x86-64 the cpuinfo flags decide whether the optimized build is tried
/// before the baseline one.
pub fn detect_arch_keys(arch: &str, cpuinfo: Option<&str>) -> Vec<ArchKey> {
    match arch {
        "x86_64" => {
            let flags = cpuinfo.map(cpu_flags).unwrap_or_default();
            if flags.contains("avx2") || flags.contains("avx") {
                vec![ArchKey::Amd64V3, ArchKey::Amd64]
            } else {
                vec![ArchKey::Amd64]
            }
        }
        "aarch64" => vec![ArchKey::Arm64],
        "arm" => vec![ArchKey::Armv7],
        "x86" => vec![ArchKey::I386],
        "riscv64" => vec![ArchKey::Riscv64],
        "s390x" => vec![ArchKey::S390x],
        _ => Vec::new(),
    }
}

/// Flag words from the first `flags` line of /proc/cpuinfo.
fn cpu_flags(cpuinfo: &str) -> HashSet<String> {
    cpuinfo
        .lines()
        .find(|l| l.starts_with("flags"))
        .and_then(|l| l.split_once(':'))
        .map(|(_, flags)| {
            flags
                .split_whitespace()
                .map(|f| f.to_ascii_lowercase())
                .collect()
        })
        .unwrap_or_default()
}

/// Architecture ranking for the machine we are running on.
pub fn host_arch_keys() -> Result<Vec<ArchKey>, ProvisionError> {
    let arch = std::env::consts::ARCH;
    let cpuinfo = if arch == "x86_64" {
        fs::read_to_string("/proc/cpuinfo").ok()
    } else {
        None
    };
    let keys = detect_arch_keys(arch, cpuinfo.as_deref());
    if keys.is_empty() {
        return Err(ProvisionError::UnsupportedArch(arch.to_string()));
    }
    Ok(keys)
}

/// Known release layouts of the backend.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum AssetCatalog {
    /// XTLS/Xray-core release zips
    Xray,
    /// Hysteria raw release binaries
    Hysteria,
}

impl AssetCatalog {
    pub fn binary_name(&self) -> &'static str {
        match self {
            AssetCatalog::Xray => "xray",
            AssetCatalog::Hysteria => "hysteria",
        }
    }

    pub fn default_url_template(&self) -> &'static str {
        match self {
            AssetCatalog::Xray => {
                "https://github.com/XTLS/Xray-core/releases/latest/download/{asset}"
            }
            AssetCatalog::Hysteria => "https://download.hysteria.network/app/latest/{asset}",
        }
    }

    /// Default backend argument template; `{config}` is the config path.
    pub fn default_args(&self) -> &'static str {
        match self {
            AssetCatalog::Xray => "run -c {config}",
            AssetCatalog::Hysteria => "server -c {config}",
        }
    }

    pub fn asset(&self, arch: ArchKey) -> Option<&'static str> {
        match (self, arch) {
            (AssetCatalog::Xray, ArchKey::Amd64) => Some("Xray-linux-64.zip"),
            (AssetCatalog::Xray, ArchKey::Arm64) => Some("Xray-linux-arm64-v8a.zip"),
            (AssetCatalog::Xray, ArchKey::Armv7) => Some("Xray-linux-arm32-v7a.zip"),
            (AssetCatalog::Xray, ArchKey::I386) => Some("Xray-linux-32.zip"),
            (AssetCatalog::Xray, ArchKey::Riscv64) => Some("Xray-linux-riscv64.zip"),
            (AssetCatalog::Xray, ArchKey::S390x) => Some("Xray-linux-s390x.zip"),
            (AssetCatalog::Xray, ArchKey::Amd64V3) => None,
            (AssetCatalog::Hysteria, ArchKey::Amd64V3) => Some("hysteria-linux-amd64-avx"),
            (AssetCatalog::Hysteria, ArchKey::Amd64) => Some("hysteria-linux-amd64"),
            (AssetCatalog::Hysteria, ArchKey::Arm64) => Some("hysteria-linux-arm64"),
            (AssetCatalog::Hysteria, ArchKey::Armv7) => Some("hysteria-linux-arm"),
            (AssetCatalog::Hysteria, ArchKey::I386) => Some("hysteria-linux-386"),
            (AssetCatalog::Hysteria, ArchKey::Riscv64) => Some("hysteria-linux-riscv64"),
            (AssetCatalog::Hysteria, ArchKey::S390x) => Some("hysteria-linux-s390x"),
        }
    }

    /// Candidates for `keys` in rank order; flavours without an asset are
    /// skipped.
    pub fn candidates(
        &self,
        keys: &[ArchKey],
        url_template: &str,
        install_dir: &Path,
    ) -> Vec<ArtifactCandidate> {
        let installed_path = install_dir.join(self.binary_name());
        keys.iter()
            .filter_map(|&arch| {
                self.asset(arch).map(|asset| ArtifactCandidate {
                    arch,
                    source_url: url_template.replace("{asset}", asset),
                    installed_path: installed_path.clone(),
                    executable_mode: 0o700,
                    binary_name: self.binary_name().to_string(),
                })
            })
            .collect()
    }
}

/// One downloadable variant of the backend executable.
#[derive(Clone, Debug)]
pub struct ArtifactCandidate {
    pub arch: ArchKey,
    pub source_url: String,
    pub installed_path: PathBuf,
    pub executable_mode: u32,
    /// Entry looked up inside archives.
    pub binary_name: String,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum ArchiveFormat {
    Zip,
    TarGz,
    Raw,
}

impl ArchiveFormat {
    fn from_url(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
        if path.ends_with(".zip") {
            ArchiveFormat::Zip
        } else if path.ends_with(".tar.gz") || path.ends_with(".tgz") {
            ArchiveFormat::TarGz
        } else {
            ArchiveFormat::Raw
        }
    }
}

/// Downloads, unpacks and validates the backend executable.
pub struct ArtifactProvisioner {
    work_dir: PathBuf,
    client: reqwest::Client,
    self_check_args: Vec<String>,
}

impl ArtifactProvisioner {
    pub fn new(work_dir: impl Into<PathBuf>) -> Result<Self, ProvisionError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(300))
            .user_agent(concat!("wstun/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProvisionError::Io(io::Error::new(io::ErrorKind::Other, e)))?;
        Ok(Self {
            work_dir: work_dir.into(),
            client,
            self_check_args: vec!["version".to_string()],
        })
    }

    /// Return a runnable executable, installing the first candidate that
    /// passes its self-check if no valid cached copy exists.
    pub async fn ensure_artifact(
        &self,
        candidates: &[ArtifactCandidate],
    ) -> Result<PathBuf, ProvisionError> {
        let mut seen = HashSet::new();
        for candidate in candidates {
            let path = &candidate.installed_path;
            if !seen.insert(path.clone()) || !path.exists() {
                continue;
            }
            if self.self_check(path).await {
                info!("Using cached backend {}", path.display());
                return Ok(path.clone());
            }
            warn!("Cached backend {} failed self-check, removing", path.display());
            remove_if_exists(path)?;
        }

        fs::create_dir_all(&self.work_dir)?;
        for candidate in candidates {
            info!(
                "Installing backend ({}) from {}",
                candidate.arch, candidate.source_url
            );
            match self.install(candidate).await {
                Ok(path) => {
                    info!("Backend installed at {}", path.display());
                    return Ok(path);
                }
                Err(e) => warn!("Candidate {} rejected: {}", candidate.arch, e),
            }
        }

        Err(ProvisionError::NoUsableArtifact {
            tried: candidates.len(),
        })
    }

    async fn install(&self, candidate: &ArtifactCandidate) -> Result<PathBuf, ProvisionError> {
        let archive = self.work_dir.join(format!(".download-{}", candidate.arch));
        let unpacked = self.fetch_and_unpack(candidate, &archive).await;
        // The archive never outlives the attempt.
        remove_if_exists(&archive)?;
        unpacked?;

        let path = &candidate.installed_path;
        if self.self_check(path).await {
            Ok(path.clone())
        } else {
            remove_if_exists(path)?;
            Err(ProvisionError::SelfCheckFailed(path.clone()))
        }
    }

    async fn fetch_and_unpack(
        &self,
        candidate: &ArtifactCandidate,
        archive: &Path,
    ) -> Result<(), ProvisionError> {
        self.download(&candidate.source_url, archive).await?;

        let format = ArchiveFormat::from_url(&candidate.source_url);
        let archive = archive.to_path_buf();
        let dest = candidate.installed_path.clone();
        let binary_name = candidate.binary_name.clone();
        let mode = candidate.executable_mode;
        tokio::task::spawn_blocking(move || unpack(&archive, format, &binary_name, &dest, mode))
            .await
            .map_err(|e| ProvisionError::Io(io::Error::new(io::ErrorKind::Other, e)))?
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), ProvisionError> {
        let failed = |reason: String| ProvisionError::DownloadFailed {
            url: url.to_string(),
            reason,
        };

        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(failed(format!("HTTP {}", resp.status())));
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = resp.chunk().await.map_err(|e| failed(e.to_string()))? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        if written == 0 {
            return Err(failed("empty body".to_string()));
        }
        debug!("Downloaded {} bytes from {}", written, url);
        Ok(())
    }

    /// Run `<path> version`; only a zero exit within the timeout passes.
    pub async fn self_check(&self, path: &Path) -> bool {
        // A freshly written file can still be open in a forked child for a
        // moment, which makes exec fail with ETXTBSY.
        for _ in 0..5 {
            let mut cmd = Command::new(path);
            cmd.args(&self.self_check_args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true);

            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) if e.raw_os_error() == Some(nix::errno::Errno::ETXTBSY as i32) => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
                Err(e) => {
                    debug!("Self-check spawn of {} failed: {}", path.display(), e);
                    return false;
                }
            };

            return match tokio::time::timeout(SELF_CHECK_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => status.success(),
                Ok(Err(e)) => {
                    debug!("Self-check wait failed: {}", e);
                    false
                }
                Err(_) => {
                    warn!("Self-check of {} timed out", path.display());
                    false
                }
            };
        }
        false
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn unpack(
    archive: &Path,
    format: ArchiveFormat,
    binary_name: &str,
    dest: &Path,
    mode: u32,
) -> Result<(), ProvisionError> {
    if let Some(dir) = dest.parent() {
        fs::create_dir_all(dir)?;
    }
    let staged = dest.with_extension("new");

    let installed = extract_entry(archive, format, binary_name, &staged).and_then(|found| {
        if !found {
            return Err(ProvisionError::ExtractFailed {
                archive: archive.to_path_buf(),
                reason: format!("no {binary_name:?} entry in archive"),
            });
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&staged, fs::Permissions::from_mode(mode))?;
        }
        #[cfg(not(unix))]
        let _ = mode;

        fs::rename(&staged, dest)?;
        Ok(())
    });

    // A half-written staged file must never linger next to the install path.
    if installed.is_err() {
        let _ = remove_if_exists(&staged);
    }
    installed
}

/// Write the `binary_name` entry of `archive` to `staged`. `false` when the
/// archive has no such entry.
fn extract_entry(
    archive: &Path,
    format: ArchiveFormat,
    binary_name: &str,
    staged: &Path,
) -> Result<bool, ProvisionError> {
    let extract_failed = |reason: String| ProvisionError::ExtractFailed {
        archive: archive.to_path_buf(),
        reason,
    };

    match format {
        ArchiveFormat::Raw => {
            fs::copy(archive, staged)?;
            Ok(true)
        }
        ArchiveFormat::Zip => {
            let mut zip = zip::ZipArchive::new(File::open(archive)?)
                .map_err(|e| extract_failed(e.to_string()))?;
            for i in 0..zip.len() {
                let mut entry = zip.by_index(i).map_err(|e| extract_failed(e.to_string()))?;
                if entry.is_file() && entry_matches(entry.name(), binary_name) {
                    write_staged(&mut entry, archive, staged)?;
                    return Ok(true);
                }
            }
            Ok(false)
        }
        ArchiveFormat::TarGz => {
            let mut tar = tar::Archive::new(GzDecoder::new(File::open(archive)?));
            for entry in tar.entries().map_err(|e| extract_failed(e.to_string()))? {
                let mut entry = entry.map_err(|e| extract_failed(e.to_string()))?;
                if !entry.header().entry_type().is_file() {
                    continue;
                }
                let name = entry
                    .path()
                    .map_err(|e| extract_failed(e.to_string()))?
                    .to_string_lossy()
                    .into_owned();
                if entry_matches(&name, binary_name) {
                    write_staged(&mut entry, archive, staged)?;
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

fn write_staged<R: io::Read + ?Sized>(
    entry: &mut R,
    archive: &Path,
    staged: &Path,
) -> Result<(), ProvisionError> {
    let mut out = File::create(staged)?;
    io::copy(entry, &mut out).map_err(|e| ProvisionError::ExtractFailed {
        archive: archive.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(())
}

/// Archive entry names may carry a directory prefix.
fn entry_matches(entry_name: &str, binary_name: &str) -> bool {
    entry_name.rsplit('/').next() == Some(binary_name)
}
