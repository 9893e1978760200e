//! corral-daemon - sandbox execution daemon with pooled environments
//!
//! Startup builds the mount plan, container template and cgroup template
//! once, validating each against the host; a failure there is fatal by
//! design, the operator must fix the environment before the service runs.
//! Per-request failures are contained and always release their resources.

use anyhow::{Context, Result};
use clap::Parser;
use corral_core::cgroup::CgroupTemplateBuilder;
use corral_core::template::ContainerTemplateBuilder;
use corral_core::{Dispatcher, MountPlan, SandboxSettings};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::signal::unix::{SignalKind, signal};
use tracing_subscriber::EnvFilter;

mod config;
mod executor;
mod server;

use config::DaemonConfig;

#[derive(Parser, Debug)]
#[command(name = "corral-daemon")]
#[command(author, version, about = "Sandbox execution daemon with pooled environments")]
struct Args {
    /// Unix socket path (defaults to CORRAL_SOCKET or /run/corral/corral.sock)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Number of simultaneous executions
    #[arg(long, default_value = "4")]
    parallelism: usize,

    /// tmpfs mount data for work and tmp directories
    #[arg(long, default_value = "size=8m,nr_inodes=4k")]
    tmpfs: String,

    /// Share the host network namespace instead of unsharing it
    #[arg(long)]
    net: bool,

    /// Container root directory (defaults to a fresh temp directory)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Only log warnings and errors
    #[arg(long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.quiet { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("corral_core={level}").parse()?)
                .add_directive(format!("corral_daemon={level}").parse()?),
        )
        .init();

    tracing::info!("corral-daemon starting");

    let mut builder = SandboxSettings::builder()
        .parallelism(args.parallelism)
        .tmpfs_data(args.tmpfs)
        .share_net(args.net);
    if let Some(root) = args.root {
        builder = builder.root(root);
    }
    let settings = builder.build();

    let config = DaemonConfig {
        socket_path: args
            .socket
            .unwrap_or_else(corral_core::config::default_socket_path),
        settings,
    };

    // Keep the tempdir guard alive for the life of the daemon.
    let mut root_guard = None;
    let root = match &config.settings.root {
        Some(path) => path.clone(),
        None => {
            let dir = tempfile::Builder::new()
                .prefix("corral")
                .tempdir()
                .context("failed to create container root tempdir")?;
            let path = dir.path().to_path_buf();
            root_guard = Some(dir);
            path
        }
    };
    tracing::info!(root = ?root, "container root prepared");

    // Startup-time validation: mount sources, root, host cgroup support.
    // Any failure here terminates the process.
    let mounts = MountPlan::defaults(&config.settings.tmpfs_data)
        .context("invalid default mount plan")?;
    let template = ContainerTemplateBuilder::new(&root, mounts)
        .share_net(config.settings.share_net)
        .build()
        .context("failed to build container template")?;
    let cgroups = CgroupTemplateBuilder::new("corral")
        .cpu_acct()
        .memory()
        .pids()
        .filter_host()
        .context("host cgroup controllers inadequate")?;

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(template),
        Arc::new(cgroups),
        config.settings.parallelism,
    ));
    tracing::info!(
        parallelism = config.settings.parallelism,
        "dispatcher and pools initialized"
    );

    // Create socket directory if needed
    if let Some(parent) = config.socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Remove existing socket
    let _ = std::fs::remove_file(&config.socket_path);

    let listener = UnixListener::bind(&config.socket_path)?;
    tracing::info!(socket = ?config.socket_path, "listening");

    let executor = Arc::new(executor::ProcessExecutor);
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        res = server::run(listener, dispatcher, executor) => {
            res.map_err(|e| anyhow::anyhow!("{e}"))?;
        }
        _ = sigterm.recv() => {
            tracing::info!("SIGTERM received, shutting down");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
        }
    }

    let _ = std::fs::remove_file(&config.socket_path);
    drop(root_guard);
    Ok(())
}
