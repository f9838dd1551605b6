use crate::error::ConfigError;
use crate::forward::Forwarder;
use crate::logsink::WatchPattern;
use crate::provision::AssetCatalog;
use crate::routes::{RouteSpec, RouteTable, ShareTarget};
use clap::{ArgAction, Parser};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// SIGTERM to SIGKILL grace for the backend child.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);
/// How long the readiness probe keeps trying the backend ports.
const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "WebSocket tunnel front end for a supervised proxy backend",
    long_about = "wstun downloads a proxy backend, writes its config, keeps it running and \
routes WebSocket upgrades on configured paths to the backend's loopback listeners.\n\n\
Every option can also be set through the environment variable shown next to it."
)]
pub struct Cli {
    /// Public port of the HTTP router
    #[arg(short, long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// IP address to bind the router
    #[arg(long, env = "LISTEN_IP", default_value = "0.0.0.0")]
    pub listen_ip: IpAddr,

    /// Directory for the backend binary, config, state and lock files
    #[arg(long, env = "WORK_DIR", default_value = ".wstun")]
    pub work_dir: PathBuf,

    /// Client credential shared by all routes (generated and persisted when unset)
    #[arg(long, env = "UUID")]
    pub uuid: Option<String>,

    /// Routes as kind:path:backend_port, comma separated
    #[arg(
        long,
        env = "ROUTES",
        value_delimiter = ',',
        default_value = "vless:/vless:10000,vmess:/vmess:10001"
    )]
    pub routes: Vec<RouteSpec>,

    /// Release catalog used to pick the backend download
    #[arg(long, env = "ARTIFACT_CATALOG", value_enum, default_value_t = AssetCatalog::Xray)]
    pub artifact_catalog: AssetCatalog,

    /// Download URL template; `{asset}` is replaced by the asset name
    #[arg(long, env = "ARTIFACT_URL")]
    pub artifact_url: Option<String>,

    /// Backend arguments; `{config}` is replaced by the config path
    #[arg(long, env = "BACKEND_ARGS")]
    pub backend_args: Option<String>,

    /// How upgrades are carried to the backend
    #[arg(long, env = "FORWARD_MODE", value_enum, default_value_t = Forwarder::Proxy)]
    pub forward_mode: Forwarder,

    /// Idle timeout in seconds for tunnels (0 disables)
    #[arg(long, env = "IDLE_TIMEOUT", default_value_t = 540)]
    pub idle_timeout: u64,

    /// Maximum concurrent tunnels
    #[arg(long, env = "MAX_TUNNELS", default_value_t = 4096)]
    pub max_tunnels: usize,

    /// Seconds open tunnels get to finish after a shutdown signal
    #[arg(long, env = "SHUTDOWN_GRACE", default_value_t = 30)]
    pub shutdown_grace: u64,

    /// Seconds between checks while another instance holds the lock
    #[arg(long, env = "LOCK_POLL_SECS", default_value_t = 30)]
    pub lock_poll_secs: u64,

    /// First restart delay in seconds
    #[arg(long, env = "BACKOFF_INITIAL", default_value_t = 2)]
    pub backoff_initial: u64,

    /// Longest restart delay in seconds
    #[arg(long, env = "BACKOFF_CAP", default_value_t = 30)]
    pub backoff_cap: u64,

    /// Uptime in seconds after which the restart delay starts over
    #[arg(long, env = "BACKOFF_RESET_AFTER", default_value_t = 300)]
    pub backoff_reset_after: u64,

    /// Log level written into the backend config
    #[arg(long, env = "BACKEND_LOG_LEVEL", default_value = "warning")]
    pub backend_log_level: String,

    /// Also append raw backend output to this file
    #[arg(long, env = "LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Report backend output matching name=regex (repeatable; ';' separated in env)
    #[arg(long, env = "WATCH", value_delimiter = ';')]
    pub watch: Vec<WatchPattern>,

    /// Public host used in share links (looked up when unset)
    #[arg(long, env = "NODE_HOST")]
    pub node_host: Option<String>,

    /// Public port used in share links (defaults to 443 with TLS, else --port)
    #[arg(long, env = "PUBLIC_PORT")]
    pub public_port: Option<u16>,

    /// Whether clients reach the router through TLS
    #[arg(long, env = "PUBLIC_TLS", default_value_t = true, action = ArgAction::Set)]
    pub public_tls: bool,
}

/// Identity that must survive restarts: the generated credential and the
/// name clients see in share links.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunnerState {
    pub client_id: String,
    pub node_name: String,
}

impl RunnerState {
    fn generate() -> Self {
        let suffix: u32 = rand::thread_rng().gen_range(0..0x100_0000);
        Self {
            client_id: random_uuid(),
            node_name: format!("wstun-{:06x}", suffix),
        }
    }

    /// Read `path`, or create it with fresh values when missing.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        let state_err = |reason: String| ConfigError::State {
            path: path.to_path_buf(),
            reason,
        };

        match std::fs::read(path) {
            Ok(bytes) => {
                let state: RunnerState =
                    serde_json::from_slice(&bytes).map_err(|e| state_err(e.to_string()))?;
                if state.client_id.trim().is_empty() {
                    return Err(state_err("client_id is empty".to_string()));
                }
                Ok(state)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let state = Self::generate();
                let mut bytes =
                    serde_json::to_vec_pretty(&state).map_err(|e| state_err(e.to_string()))?;
                bytes.push(b'\n');
                crate::synth::write_config(path, &bytes).map_err(|e| state_err(e.to_string()))?;
                Ok(state)
            }
            Err(e) => Err(state_err(e.to_string())),
        }
    }
}

/// Random version 4 UUID in canonical text form.
pub fn random_uuid() -> String {
    Uuid::new_v4().to_string()
}

/// Runtime configuration derived from CLI arguments. Built once, then shared
/// read-only.
#[derive(Clone, Debug)]
pub struct TunnelConfig {
    pub listen_addr: SocketAddr,
    pub work_dir: PathBuf,
    pub routes: Arc<RouteTable>,
    pub catalog: AssetCatalog,
    pub url_template: String,
    pub backend_args: String,
    pub forwarder: Forwarder,
    pub idle_timeout: Option<Duration>,
    pub max_tunnels: usize,
    pub shutdown_grace: Duration,
    pub lock_poll: Duration,
    pub backoff_initial: Duration,
    pub backoff_cap: Duration,
    pub backoff_reset_after: Duration,
    pub stop_timeout: Duration,
    pub ready_timeout: Duration,
    pub backend_log_level: String,
    pub log_file: Option<PathBuf>,
    pub watch: Vec<WatchPattern>,
    pub node_host: Option<String>,
    pub public_port: u16,
    pub public_tls: bool,
    pub node_name: String,
}

impl TunnelConfig {
    /// Create TunnelConfig from CLI arguments. Creates the work directory and
    /// the state file when needed.
    pub fn from_cli(args: Cli) -> Result<Self, ConfigError> {
        if args.routes.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "--routes",
                reason: "at least one route is required".to_string(),
            });
        }
        if args.max_tunnels == 0 {
            return Err(ConfigError::InvalidValue {
                name: "--max-tunnels",
                reason: "must be at least 1".to_string(),
            });
        }

        std::fs::create_dir_all(&args.work_dir).map_err(|e| ConfigError::State {
            path: args.work_dir.clone(),
            reason: e.to_string(),
        })?;
        let state = RunnerState::load_or_create(&args.work_dir.join("state.json"))?;

        let client_id = match args.uuid.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => state.client_id.clone(),
        };
        let routes = RouteTable::from_specs(&args.routes, &client_id)?;

        let node_host = args
            .node_host
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty());
        let public_port = args
            .public_port
            .unwrap_or(if args.public_tls { 443 } else { args.port });

        Ok(Self {
            listen_addr: SocketAddr::new(args.listen_ip, args.port),
            work_dir: args.work_dir,
            routes: Arc::new(routes),
            catalog: args.artifact_catalog,
            url_template: args
                .artifact_url
                .unwrap_or_else(|| args.artifact_catalog.default_url_template().to_string()),
            backend_args: args
                .backend_args
                .unwrap_or_else(|| args.artifact_catalog.default_args().to_string()),
            forwarder: args.forward_mode,
            idle_timeout: (args.idle_timeout > 0).then(|| Duration::from_secs(args.idle_timeout)),
            max_tunnels: args.max_tunnels,
            shutdown_grace: Duration::from_secs(args.shutdown_grace),
            lock_poll: Duration::from_secs(args.lock_poll_secs.max(1)),
            backoff_initial: Duration::from_secs(args.backoff_initial),
            backoff_cap: Duration::from_secs(args.backoff_cap.max(args.backoff_initial)),
            backoff_reset_after: Duration::from_secs(args.backoff_reset_after),
            stop_timeout: STOP_TIMEOUT,
            ready_timeout: READY_TIMEOUT,
            backend_log_level: args.backend_log_level,
            log_file: args.log_file,
            watch: args.watch,
            node_host,
            public_port,
            public_tls: args.public_tls,
            node_name: state.node_name,
        })
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.work_dir.join("bin")
    }

    pub fn config_path(&self) -> PathBuf {
        self.work_dir.join("config.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.work_dir.join("runner.lock")
    }

    /// Backend argv with `{config}` expanded.
    pub fn backend_argv(&self, config_path: &Path) -> Vec<String> {
        let config = config_path.display().to_string();
        self.backend_args
            .split_whitespace()
            .map(|arg| arg.replace("{config}", &config))
            .collect()
    }

    pub fn share_target(&self, host: String) -> ShareTarget {
        ShareTarget {
            host,
            port: self.public_port,
            tls: self.public_tls,
            node_name: self.node_name.clone(),
        }
    }
}
