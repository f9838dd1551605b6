use std::path::PathBuf;

/// Errors raised while acquiring the backend executable.
///
/// Every variant is fatal for startup: without a runnable artifact there is
/// nothing to supervise.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("no usable artifact among {tried} candidate(s)")]
    NoUsableArtifact { tried: usize },

    #[error("download of {url} failed: {reason}")]
    DownloadFailed { url: String, reason: String },

    #[error("extracting {} failed: {}", .archive.display(), .reason)]
    ExtractFailed { archive: PathBuf, reason: String },

    #[error("self-check of {} failed", .0.display())]
    SelfCheckFailed(PathBuf),

    #[error("unsupported architecture: {0}")]
    UnsupportedArch(String),

    #[error("artifact I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors seen while running the backend child.
///
/// These never leave the supervisor; they are logged and turned into a
/// backoff restart.
#[derive(Debug, thiserror::Error)]
pub enum SupervisionError {
    #[error("failed to spawn {}: {}", .program.display(), .source)]
    SpawnFailed {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("backend exited unexpectedly ({0})")]
    UnexpectedExit(String),
}

/// Per-connection routing failures. The affected client connection is
/// closed; nothing else is touched.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("no route for {0}")]
    NoMatch(String),

    #[error("backend {addr} unreachable: {reason}")]
    BackendUnreachable {
        addr: std::net::SocketAddr,
        reason: String,
    },

    #[error("backend handshake failed: {0}")]
    Handshake(String),

    #[error("tunnel limit reached ({0} active)")]
    Overloaded(usize),
}

/// Invalid startup configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid route {0:?}: {1}")]
    InvalidRoute(String, String),

    #[error("duplicate route path {0}")]
    DuplicatePath(String),

    #[error("backend port {0} is used by more than one route")]
    DuplicatePort(u16),

    #[error("invalid {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },

    #[error("invalid watch pattern {0:?}: {1}")]
    InvalidWatch(String, String),

    #[error("state file {}: {}", .path.display(), .reason)]
    State { path: PathBuf, reason: String },
}
