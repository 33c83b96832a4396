use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use replica_core::{
    channel, serve, DirectoryPath, LocalFileSystem, Pattern, ReplicationManager,
    ReplicatorTarget, SourceOptions,
};
use serde::Deserialize;
use std::{fs, path::Path, path::PathBuf, sync::Arc};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "replica", version, about = "replica – one-way directory replication")]
struct Cli {
    /// Path to config file (YAML / JSON)
    #[arg(short, long, conflicts_with_all = ["source", "target"])]
    config: Option<PathBuf>,
    /// Directory to replicate
    #[arg(long, requires = "target")]
    source: Option<PathBuf>,
    /// Directory that receives the replica
    #[arg(long, requires = "source")]
    target: Option<PathBuf>,
    /// Glob of paths to keep out of the replica (repeatable)
    #[arg(long)]
    exclude: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ReplicaConfig {
    name: String,
    source: PathBuf,
    target: PathBuf,
    #[serde(flatten)]
    options: SourceOptions,
}

fn parse_config(path: &Path, text: &str) -> Result<Vec<ReplicaConfig>> {
    // Detect format by extension
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    let pairs: Vec<ReplicaConfig> = match ext {
        "json" => serde_json::from_str(text)?,
        _ => serde_yaml::from_str(text)?, // default to yaml
    };
    Ok(pairs)
}

fn load_pairs(cli: &Cli) -> Result<Vec<ReplicaConfig>> {
    if let (Some(source), Some(target)) = (&cli.source, &cli.target) {
        return Ok(vec![ReplicaConfig {
            name: "default".to_string(),
            source: source.clone(),
            target: target.clone(),
            options: SourceOptions {
                exclude: cli.exclude.iter().map(|s| Pattern(s.clone())).collect(),
                ..SourceOptions::default()
            },
        }]);
    }
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("replica.yaml"));
    let text = fs::read_to_string(&path)
        .map_err(|e| anyhow!("read config {} failed: {e}", path.display()))?;
    parse_config(&path, &text)
}

/// Canonical source and target directories, refusing a target inside its own source.
fn prepare_dirs(cfg: &ReplicaConfig) -> Result<(PathBuf, PathBuf)> {
    let source = cfg
        .source
        .canonicalize()
        .with_context(|| format!("source {}", cfg.source.display()))?;
    fs::create_dir_all(&cfg.target)
        .with_context(|| format!("create target {}", cfg.target.display()))?;
    let target = cfg.target.canonicalize()?;
    if target.starts_with(&source) || source.starts_with(&target) {
        bail!(
            "{}: source {} and target {} overlap",
            cfg.name,
            source.display(),
            target.display()
        );
    }
    Ok((source, target))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let pairs = load_pairs(&cli)?;
    if pairs.is_empty() {
        return Err(anyhow!("no replication pairs defined in config"));
    }

    let mut manager = ReplicationManager::new();
    for cfg in pairs {
        let (source_dir, target_dir) = prepare_dirs(&cfg)?;
        let target = Arc::new(ReplicatorTarget::new(
            Arc::new(LocalFileSystem::new(&target_dir)),
            DirectoryPath::root(),
        ));
        let (tx, rx) = channel(256);
        tokio::spawn(serve(target, rx));
        manager
            .start(
                cfg.name.clone(),
                Arc::new(LocalFileSystem::new(&source_dir)),
                DirectoryPath::root(),
                Arc::new(tx),
                cfg.options,
            )
            .await
            .with_context(|| format!("start {}", cfg.name))?;
        info!(name = %cfg.name, source = %source_dir.display(), target = %target_dir.display(), "replicating");
    }

    info!("replica running... press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("stopping");
    manager.stop_all().await;
    Ok(())
}
