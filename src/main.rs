mod config;
mod connection;
mod error;
mod forward;
mod lock;
mod logsink;
mod provision;
mod router;
mod routes;
mod splice;
mod supervisor;
mod synth;
mod traffic;

use crate::config::{Cli, TunnelConfig};
use crate::connection::{BackendHealth, TunnelTracker};
use crate::forward::TunnelContext;
use crate::lock::InstanceLock;
use crate::logsink::{BackendEvent, LogSink, LogWatcher};
use crate::provision::{host_arch_keys, ArtifactProvisioner};
use crate::router::TunnelRouter;
use crate::supervisor::{ProcessSupervisor, SupervisorSettings};
use crate::synth::{synthesize, write_config};
use crate::traffic::TrafficRegistry;
use clap::Parser;
use color_eyre::eyre::Result;

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Used in share links when the public host cannot be determined.
const FALLBACK_HOST: &str = "your_host";

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wstun=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    // Everything we write (config, state, binary) is private to this user.
    #[cfg(unix)]
    let _ = nix::sys::stat::umask(nix::sys::stat::Mode::from_bits_truncate(0o077));

    let args = Cli::parse();
    let config = Arc::new(TunnelConfig::from_cli(args)?);

    let lock = InstanceLock::acquire(&config.lock_path(), config.lock_poll).await?;
    info!("Runner lock held (pid={})", lock.pid());

    let keys = host_arch_keys()?;
    let candidates = config
        .catalog
        .candidates(&keys, &config.url_template, &config.bin_dir());
    let provisioner = ArtifactProvisioner::new(&config.work_dir)?;
    let executable = provisioner.ensure_artifact(&candidates).await?;

    let config_path = config.config_path();
    write_config(
        &config_path,
        &synthesize(&config.routes, &config.backend_log_level),
    )?;
    info!("Backend config written to {}", config_path.display());

    publish_share_links(&config).await;

    let health = BackendHealth::new();
    let sink = Arc::new(match &config.log_file {
        Some(path) => LogSink::with_file(path).await?,
        None => LogSink::console(),
    });
    let (backend_tx, mut backend_rx) = mpsc::unbounded_channel();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let supervisor = ProcessSupervisor::new(
        SupervisorSettings {
            executable,
            args: config.backend_argv(&config_path),
            backoff_initial: config.backoff_initial,
            backoff_cap: config.backoff_cap,
            backoff_reset_after: config.backoff_reset_after,
            stop_timeout: config.stop_timeout,
            ready_addrs: config.routes.backend_addrs(),
            ready_timeout: config.ready_timeout,
        },
        health.clone(),
        sink,
    )
    .with_watcher(LogWatcher::new(config.watch.clone()), backend_tx)
    .with_events(event_tx);

    tokio::task::spawn(async move {
        while let Some(event) = backend_rx.recv().await {
            match event {
                BackendEvent::PatternMatched { name, value } => {
                    info!("Backend reported {}: {}", name, value)
                }
            }
        }
    });

    tokio::task::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            debug!("Supervisor: {:?}", event);
        }
    });

    let shutdown = CancellationToken::new();
    let supervisor_task = tokio::task::spawn(supervisor.run(shutdown.clone()));

    let tracker = TunnelTracker::new(config.max_tunnels);
    let traffic = Arc::new(TrafficRegistry::for_routes(&config.routes));
    let router = Arc::new(TunnelRouter::new(
        config.routes.clone(),
        config.forwarder,
        Arc::new(TunnelContext {
            tracker: tracker.clone(),
            health,
            traffic: traffic.clone(),
            idle_timeout: config.idle_timeout,
        }),
    ));

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!("Router listening on http://{}", config.listen_addr);
    for route in config.routes.entries() {
        info!(
            "Route {} -> {} ({})",
            route.path,
            route.backend_addr(),
            route.kind
        );
    }

    spawn_monitor(tracker, traffic, shutdown.clone());
    let server = tokio::task::spawn(router.clone().serve(listener, shutdown.clone()));

    shutdown_signal().await?;
    info!("Shutdown signal received");
    shutdown.cancel();

    if let Err(e) = server.await {
        warn!("Router task failed: {}", e);
    }
    let (_, supervisor_res) = tokio::join!(router.drain(config.shutdown_grace), supervisor_task);
    if let Err(e) = supervisor_res {
        error!("Supervisor task failed: {}", e);
    }

    drop(lock);
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}

/// Log the client URIs once so operators can copy them.
async fn publish_share_links(config: &TunnelConfig) {
    let host = match &config.node_host {
        Some(host) => host.clone(),
        None => lookup_public_host().await.unwrap_or_else(|| {
            warn!("Could not determine public host, set NODE_HOST for usable links");
            FALLBACK_HOST.to_string()
        }),
    };

    for (kind, uri) in config.routes.share_links(&config.share_target(host)) {
        info!("[{}] {}", kind, uri);
    }
}

async fn lookup_public_host() -> Option<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .ok()?;
    let body = client
        .get("https://api.ipify.org")
        .send()
        .await
        .ok()?
        .error_for_status()
        .ok()?
        .text()
        .await
        .ok()?;
    let host = body.trim();
    (!host.is_empty()).then(|| host.to_string())
}

/// Periodic tunnel and traffic report.
fn spawn_monitor(
    tracker: Arc<TunnelTracker>,
    traffic: Arc<TrafficRegistry>,
    shutdown: CancellationToken,
) {
    tokio::task::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300)); // 5 minutes
        interval.tick().await;
        let mut last_active_count = 0;
        let mut stable_count_intervals = 0;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let active = tracker.active_count();
            if active > 0 && active != last_active_count {
                info!("Active tunnels: {}", active);
            }

            // Detect potential tunnel leaks by monitoring stable high counts
            if active == last_active_count && tracker.is_backlog_threshold_exceeded() {
                stable_count_intervals += 1;
                if stable_count_intervals >= 3 {
                    warn!(
                        "Potential tunnel leak detected: {} tunnels stable for {} intervals",
                        active, stable_count_intervals
                    );
                }
            } else {
                stable_count_intervals = 0;
            }

            for (path, tunnels, rx, tx) in traffic.snapshot() {
                if tunnels > 0 {
                    info!(
                        "Traffic {}: {} tunnels, {} bytes in, {} bytes out",
                        path, tunnels, rx, tx
                    );
                }
            }

            last_active_count = active;
        }
    });
}
