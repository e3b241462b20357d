use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use ethtop::aggregator::Aggregator;
use ethtop::config::{self, Config};
use ethtop::source::NodeSource;
use ethtop::supervisor::Supervisor;
use ethtop::ui::{self, Dashboard};

/// Live terminal dashboard for beacon chain slots and epochs.
#[derive(Parser)]
#[command(name = "ethtop", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity; overrides `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Write a config template to the resolved config path.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Print version information and exit.
    Version,
}

mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Version) => {
            println!("ethtop {}", version::full());
            return Ok(());
        }
        Some(Command::Init { force }) => {
            let path = config::resolve_path(cli.config)?;
            config::write_template(&path, force)?;
            println!("wrote {}", path.display());
            return Ok(());
        }
        None => {}
    }

    let config_path = config::resolve_path(cli.config)?;
    let cfg = Config::load(&config_path).with_context(|| {
        format!(
            "loading config from {} (run `ethtop init` to create one)",
            config_path.display()
        )
    })?;

    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    init_logging(level, &cfg.log.path)?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        config = %config_path.display(),
        "starting ethtop",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

/// Log to a file; the terminal belongs to the dashboard.
fn init_logging(level: &str, path: &Path) -> Result<()> {
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating log directory {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {}", path.display()))?;

    fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .with_target(true)
        .init();

    Ok(())
}

async fn run(cfg: Config) -> Result<()> {
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let source = Arc::new(NodeSource::new(&cfg).context("creating node clients")?);
    let (supervisor, mut subs) =
        Supervisor::start(source, &cfg.subscription, cancel.child_token()).await?;

    let mut dashboard = Dashboard::new(Aggregator::with_retention(cfg.history.retain_epochs));
    let result = ui::run(&mut dashboard, &mut subs, &cancel).await;

    // Producers stop before the queues they send into are dropped.
    supervisor.stop().await;
    drop(subs);

    let state = dashboard.aggregator().state();
    tracing::info!(
        latest_epoch = state.latest_epoch(),
        slots = state.total_slots(),
        heads = dashboard.heads_seen(),
        "ethtop stopped"
    );

    result
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
                        _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                        _ = cancel.cancelled() => return,
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to register SIGTERM handler");
                    tokio::select! {
                        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
                        _ = cancel.cancelled() => return,
                    }
                }
            }
        }

        #[cfg(not(unix))]
        tokio::select! {
            _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
            _ = cancel.cancelled() => return,
        }

        cancel.cancel();
    });
}
