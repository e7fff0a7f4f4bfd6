//! # Barrow
//!
//! Storage management daemon for DaemonOS - publishes a live object
//! model of the host's block devices over IPC.
//!
//! ## Features
//!
//! - **Device Discovery**: Netlink uevent monitoring with a probe worker
//! - **Object Model**: Blocks, drives (VPD-keyed), RAID arrays, sessions
//! - **Operations**: mount, format, unlock, partition, eject, power-off
//! - **Modules**: Compiled-in extensions (iSCSI) loaded on demand
//! - **Crash Recovery**: State journal reconciled after restarts

use anyhow::Result;
use barrow::auth::AuthGate;
use barrow::bus::BusHub;
use barrow::config::{DaemonConfig, ModuleLoadMode, DEFAULT_CONFIG_DIR, DEFAULT_SOCKET, DEFAULT_STATE_DIR};
use barrow::housekeeping::Housekeeping;
use barrow::ipc::{IpcClient, IpcRequest, IpcServer};
use barrow::jobs::JobRegistry;
use barrow::modules::builtin_modules;
use barrow::nvme::NvmeManager;
use barrow::ops::OpContext;
use barrow::probe::{KnownPaths, ProbeWorker};
use barrow::registry::Registry;
use barrow::state::StateJournal;
use barrow::uevent::UeventSource;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Barrow - Storage Management Daemon
#[derive(Parser, Debug)]
#[command(name = "barrowd", version, about)]
struct Args {
    /// Drive configuration directory
    #[arg(long, default_value = DEFAULT_CONFIG_DIR)]
    config_dir: PathBuf,

    /// State journal directory
    #[arg(long, default_value = DEFAULT_STATE_DIR)]
    state_dir: PathBuf,

    /// Socket path
    #[arg(short, long, default_value = DEFAULT_SOCKET)]
    socket: PathBuf,

    /// Load all modules during startup
    #[arg(long)]
    force_load_modules: bool,

    /// Never load modules
    #[arg(long, conflicts_with = "force_load_modules")]
    disable_modules: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List exported objects
    List {
        /// Filter by path prefix (block_devices, drives, mdraid, iscsi)
        #[arg(short, long)]
        prefix: Option<String>,
    },
    /// Show one object
    Info { path: String },
    /// Stream object-manager signals
    Monitor,
    /// List in-flight jobs
    Jobs,
    /// Mount a filesystem
    Mount {
        path: String,
        /// Comma-separated mount options
        #[arg(short, long, default_value = "")]
        options: String,
    },
    /// Unmount a filesystem
    Unmount { path: String },
    /// Load modules now
    EnableModules,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    if let Some(command) = args.command {
        return handle_client_command(&args.socket, command).await;
    }

    run_daemon(args).await
}

async fn handle_client_command(socket: &PathBuf, command: Commands) -> Result<()> {
    let client = IpcClient::new(socket.clone());

    match command {
        Commands::List { prefix } => {
            let objects = client.managed_objects().await?;
            let wanted = prefix.map(|p| format!("/barrow/{}/", p.trim_matches('/')));
            println!("{:<55} {}", "PATH", "FACETS");
            println!("{}", "-".repeat(80));
            for (path, facets) in objects {
                if let Some(wanted) = &wanted {
                    if !path.starts_with(wanted) {
                        continue;
                    }
                }
                let names: Vec<&str> = facets.keys().map(String::as_str).collect();
                println!("{:<55} {}", path, names.join(","));
            }
        }
        Commands::Info { path } => {
            let facets = client.object(&path).await?;
            println!("{}", path);
            for (facet, properties) in facets {
                println!("  [{}]", facet);
                if let Some(map) = properties.as_object() {
                    for (key, value) in map {
                        println!("    {:<24} {}", key, value);
                    }
                }
            }
        }
        Commands::Monitor => {
            println!("Monitoring (Ctrl+C to exit)...");
            client
                .monitor(|signal| {
                    println!("{}", signal);
                })
                .await?;
        }
        Commands::Jobs => {
            let jobs = client.op(IpcRequest::ListJobs).await?;
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }
        Commands::Mount { path, options } => {
            let result = client
                .op(IpcRequest::Mount {
                    path,
                    options: json!({ "options": options }),
                })
                .await?;
            if let Some(mount_point) = result.get("mount_point").and_then(|v| v.as_str()) {
                println!("Mounted at {}", mount_point);
            }
        }
        Commands::Unmount { path } => {
            client
                .op(IpcRequest::Unmount {
                    path,
                    options: json!({}),
                })
                .await?;
            println!("Unmounted");
        }
        Commands::EnableModules => {
            let result = client.op(IpcRequest::EnableModules).await?;
            println!("{}", result);
        }
    }

    Ok(())
}

async fn run_daemon(args: Args) -> Result<()> {
    info!("Barrow v{} starting", env!("CARGO_PKG_VERSION"));

    let config = DaemonConfig {
        config_dir: args.config_dir.clone(),
        state_dir: args.state_dir.clone(),
        socket: args.socket.clone(),
        module_mode: if args.disable_modules {
            ModuleLoadMode::Disabled
        } else if args.force_load_modules {
            ModuleLoadMode::Force
        } else {
            ModuleLoadMode::Lazy
        },
    };

    let hub = Arc::new(BusHub::new());
    let state = Arc::new(StateJournal::open(&config.state_dir)?);
    let known = KnownPaths::new();
    let registry = Registry::new(
        Arc::clone(&hub),
        Arc::clone(&state),
        known.clone(),
        config.config_dir.clone(),
        config.module_mode,
        builtin_modules(),
    );

    // Root manager object.
    let mut manager_facets = barrow::bus::FacetMap::new();
    manager_facets.insert(
        "manager".into(),
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "module_mode": format!("{:?}", config.module_mode),
        }),
    );
    hub.export(&barrow::paths::manager(), manager_facets);

    // Deferred drive work (initial housekeeping, config re-apply).
    let (drive_task_tx, drive_task_rx) = tokio::sync::mpsc::unbounded_channel();
    registry.set_drive_task_sender(drive_task_tx);
    tokio::spawn(barrow::housekeeping::run_drive_tasks(
        Arc::clone(&registry),
        drive_task_rx,
    ));

    if config.module_mode == ModuleLoadMode::Force {
        registry.enable_modules();
    }

    // Reconcile whatever a previous instance left behind, then replay
    // the existing device set.
    state.check();
    registry.coldplug();
    info!(
        "coldplug done: {} blocks, {} drives",
        registry.block_count(),
        registry.drive_count()
    );

    // Probe worker pulls raw uevents, settles and enriches them; the
    // dispatch task feeds the registry.
    let (probed_tx, mut probed_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut probe = ProbeWorker::start(known.clone(), probed_tx);

    // Kernel uevent source on its own thread.
    let stop = Arc::new(AtomicBool::new(false));
    let (uevent_tx, uevent_rx) = std::sync::mpsc::channel();
    let uevent_thread = {
        let stop = Arc::clone(&stop);
        std::thread::Builder::new()
            .name("barrow-uevent".into())
            .spawn(move || match UeventSource::new() {
                Ok(source) => source.run(uevent_tx, stop),
                Err(e) => error!("uevent source unavailable: {}", e),
            })?
    };

    // Bridge the uevent thread into the probe queue.
    let probe_enqueue = {
        let probe_tx = probe.sender();
        std::thread::Builder::new()
            .name("barrow-uevent-bridge".into())
            .spawn(move || {
                while let Ok(event) = uevent_rx.recv() {
                    if probe_tx.send(barrow::probe::ProbeRequest::Probe(event)).is_err() {
                        break;
                    }
                }
            })?
    };

    // Dispatch loop.
    let dispatch_registry = Arc::clone(&registry);
    let dispatch = tokio::spawn(async move {
        while let Some(probed) = probed_rx.recv().await {
            dispatch_registry.dispatch(probed.action, probed.record);
        }
    });

    // Configuration-directory watcher synthesizes reconfigure events.
    let (reconfigure_tx, mut reconfigure_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    let _config_watcher = spawn_config_watcher(&config.config_dir, reconfigure_tx);
    let reconfigure_registry = Arc::clone(&registry);
    tokio::spawn(async move {
        while reconfigure_rx.recv().await.is_some() {
            info!("drive configuration changed, re-evaluating");
            reconfigure_registry.synthesize_reconfigure();
        }
    });

    // Periodic housekeeping.
    let housekeeping = Housekeeping::new(Arc::clone(&registry));
    tokio::spawn(Arc::clone(&housekeeping).run());

    // IPC server.
    let ctx = Arc::new(OpContext {
        registry: Arc::clone(&registry),
        jobs: Arc::new(JobRegistry::new(Arc::clone(&hub))),
        auth: Arc::new(AuthGate::new()),
        state: Arc::clone(&state),
    });
    let server = IpcServer::new(config.socket.clone(), ctx, Arc::new(NvmeManager::new()));

    info!("Barrow ready on {:?}", config.socket);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("IPC server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
        }
        _ = sigterm.recv() => {
            info!("terminated, shutting down");
        }
    }

    // Orderly shutdown: stop the kernel source, drain the probe queue.
    stop.store(true, Ordering::Relaxed);
    probe.shutdown();
    dispatch.abort();
    let _ = uevent_thread.join();
    let _ = probe_enqueue.join();
    info!("Barrow stopped");
    Ok(())
}

fn spawn_config_watcher(
    config_dir: &PathBuf,
    tx: tokio::sync::mpsc::UnboundedSender<()>,
) -> Option<notify::RecommendedWatcher> {
    use notify::Watcher;

    let _ = std::fs::create_dir_all(config_dir);
    let mut watcher = match notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        if let Ok(event) = event {
            if event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove() {
                let _ = tx.send(());
            }
        }
    }) {
        Ok(watcher) => watcher,
        Err(e) => {
            warn!("cannot watch configuration directory: {}", e);
            return None;
        }
    };

    if let Err(e) = watcher.watch(config_dir, notify::RecursiveMode::NonRecursive) {
        warn!("cannot watch {}: {}", config_dir.display(), e);
        return None;
    }
    Some(watcher)
}
