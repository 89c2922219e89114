use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use davmirror::{Conflict, Engine, Resolution, Store, SyncConfig, SyncMode};

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Path to the state database
    #[arg(long, default_value = "sync.db")]
    db: PathBuf,

    /// How to answer conflicts in this headless run
    #[arg(long, value_enum, default_value = "ignore")]
    on_conflict: ConflictPolicy,

    /// WebDAV endpoint URL (persisted)
    #[arg(long)]
    url: Option<String>,

    /// WebDAV user (persisted)
    #[arg(long)]
    user: Option<String>,

    /// WebDAV password (persisted)
    #[arg(long)]
    pass: Option<String>,

    /// Local sync root (persisted)
    #[arg(long)]
    local_dir: Option<PathBuf>,

    /// Remote collection to mirror (persisted)
    #[arg(long)]
    remote_dir: Option<String>,

    /// Sync direction: bidirectional, source-to-target or target-to-source
    /// (persisted)
    #[arg(long)]
    mode: Option<SyncMode>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ConflictPolicy {
    Local,
    Remote,
    Ignore,
}

impl From<ConflictPolicy> for Resolution {
    fn from(policy: ConflictPolicy) -> Self {
        match policy {
            ConflictPolicy::Local => Resolution::Local,
            ConflictPolicy::Remote => Resolution::Remote,
            ConflictPolicy::Ignore => Resolution::Ignore,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let store = Arc::new(
        Store::open(&cli.db)
            .await
            .with_context(|| format!("opening state database {}", cli.db.display()))?,
    );

    let mut config = SyncConfig::load(&store).await?;
    let overridden = apply_overrides(&mut config, &cli);
    if overridden {
        config.save(&store).await?;
    }
    config.validate()?;

    let engine = Engine::new(config, store)?;
    let conflicts = engine
        .conflicts()
        .expect("conflict stream taken before start");
    spawn_conflict_policy(conflicts, cli.on_conflict);

    let cancel = CancellationToken::new();
    engine.start(cancel.clone()).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    cancel.cancel();
    Ok(())
}

fn apply_overrides(config: &mut SyncConfig, cli: &Cli) -> bool {
    let mut changed = false;
    if let Some(url) = &cli.url {
        config.url = url.clone();
        changed = true;
    }
    if let Some(user) = &cli.user {
        config.user = user.clone();
        changed = true;
    }
    if let Some(pass) = &cli.pass {
        config.pass = pass.clone();
        changed = true;
    }
    if let Some(local_dir) = &cli.local_dir {
        config.local_dir = local_dir.clone();
        changed = true;
    }
    if let Some(remote_dir) = &cli.remote_dir {
        config.remote_dir = remote_dir.clone();
        changed = true;
    }
    if let Some(mode) = cli.mode {
        config.mode = mode;
        changed = true;
    }
    changed
}

/// Answer every conflict with the configured policy.
fn spawn_conflict_policy(
    mut conflicts: tokio::sync::mpsc::Receiver<Conflict>,
    policy: ConflictPolicy,
) {
    tokio::spawn(async move {
        while let Some(conflict) = conflicts.recv().await {
            warn!(
                "conflict on {} (local mtime {}, remote mtime {}), answering {:?}",
                conflict.file.path,
                conflict.file.local_mtime,
                conflict.file.remote_mtime,
                policy
            );
            conflict.answer(policy.into());
        }
    });
}
