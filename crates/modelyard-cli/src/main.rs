//! Modelyard CLI - inspect, resolve, and fetch local LLM weight files
//!
//! Examples:
//!   myard list                      # Catalog the models under the configured roots
//!   myard info mistralai/mistral-7b # Show parsed weight metadata
//!   myard resolve bare-model        # Print the resolved weight file path
//!   myard pull acme/model-x         # Download the best variant for this machine

use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::{mpsc, watch};

use modelyard_core::{
    config, gguf, rank, resolve, scan, DiskMetadataStore, DownloadProgress, Error, Fetcher,
    GgufValue, ModelId,
    ModelSummary, RegistryClient, RemoteVariant, ResolutionConfig, ScanReport, SystemFacts,
};

/// Modelyard - local model weight toolkit
///
/// Discovers, inspects, and fetches LLM weight files for offline inference.
/// Models live under `<root>/<namespace>/<name>/`; roots come from the
/// config file, the environment, and a built-in fallback.
#[derive(Parser)]
#[command(
    name = "myard",
    about = "Local model weight discovery and retrieval",
    version = env!("CARGO_PKG_VERSION"),
    arg_required_else_help = true,
    propagate_version = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Root directory for model weights
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        env = modelyard_core::MODELS_DIR_ENV
    )]
    models_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List models discovered under the configured roots
    #[command(name = "list", alias = "ls")]
    List {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show metadata for a model identifier or a weight file path
    Info {
        /// Model identifier (`namespace/name`) or path to a weight file
        target: String,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Resolve a model identifier to a weight file on disk
    Resolve {
        /// Model identifier (`namespace/name`, or a bare name)
        model: String,
    },

    /// Download a model from the registry
    ///
    /// Looks the identifier up on the registry, picks the best quantization
    /// for this machine, and streams it into the highest-precedence root.
    #[command(name = "pull", alias = "fetch")]
    Pull {
        /// Model identifier (`namespace/name`, or a bare name)
        model: String,

        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        if let Some(Error::ModelNotFound { searched, .. }) = e.downcast_ref::<Error>() {
            for path in searched {
                eprintln!("  searched: {}", path.display());
            }
        }
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let file_config = match &cli.config {
        Some(path) => Some(modelyard_core::FileConfig::load(path)?),
        None => modelyard_core::FileConfig::load_if_present(&config::default_config_path())?,
    };
    let resolution = ResolutionConfig::from_sources(
        file_config.as_ref(),
        cli.models_dir.clone(),
        config::fallback_models_dir(),
    )?;

    match cli.command {
        Commands::List { json } => cmd_list(&resolution, json),
        Commands::Info { target, json } => cmd_info(&resolution, &target, json),
        Commands::Resolve { model } => cmd_resolve(&resolution, &model),
        Commands::Pull { model, yes } => cmd_pull(&resolution, &model, yes).await,
    }
}

fn parse_id(raw: &str) -> Result<ModelId> {
    Ok(raw.parse::<ModelId>()?)
}

fn metadata_store() -> Option<DiskMetadataStore> {
    match DiskMetadataStore::new(config::cache_dir().join("metadata")) {
        Ok(store) => Some(store),
        Err(e) => {
            tracing::warn!(error = %e, "metadata cache unavailable");
            None
        }
    }
}

fn cmd_list(resolution: &ResolutionConfig, json: bool) -> Result<()> {
    let store = metadata_store();
    let report = scan(
        &resolution.roots,
        store.as_ref().map(|s| s as &dyn modelyard_core::MetadataStore),
    );

    if json {
        println!("{}", serde_json::to_string_pretty(&list_json(&report))?);
        return Ok(());
    }

    if report.models.is_empty() {
        println!("No models found.");
        println!(
            "Place weights under <root>/<namespace>/<name>/, or run 'myard pull <model>'."
        );
        return Ok(());
    }

    println!(
        "{:<36} {:<12} {:<9} {:>10}  {}",
        "MODEL", "QUANT", "CONTEXT", "SIZE", "TIER"
    );
    for (id, entry) in &report.models {
        let (quant, context) = match &entry.metadata {
            Some(meta) => (
                meta.quantization.clone(),
                meta.context_length
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
            None => (entry.format.to_string(), "-".to_string()),
        };
        println!(
            "{:<36} {:<12} {:<9} {:>10}  {}",
            id.to_string(),
            quant,
            context,
            format_size(entry.file_size),
            entry.tier,
        );
    }

    for shadowed in &report.shadowed {
        eprintln!(
            "note: {} at {} is shadowed by {}",
            shadowed.id,
            shadowed.path.display(),
            shadowed.winner.display()
        );
    }
    for warning in &report.warnings {
        eprintln!("warning: {}: {}", warning.path.display(), warning.message);
    }
    Ok(())
}

fn list_json(report: &ScanReport) -> serde_json::Value {
    let models: Vec<serde_json::Value> = report
        .models
        .values()
        .map(|entry| {
            serde_json::json!({
                "model": entry.id.to_string(),
                "path": entry.path,
                "format": entry.format.to_string(),
                "tier": entry.tier.to_string(),
                "size_bytes": entry.file_size,
                "metadata": entry.metadata,
            })
        })
        .collect();
    serde_json::json!({ "models": models })
}

fn cmd_info(resolution: &ResolutionConfig, target: &str, json: bool) -> Result<()> {
    let path = Path::new(target);
    if path.is_file() {
        if !gguf::is_gguf_file(path) {
            return Err(Error::InvalidFormat(format!(
                "'{target}' is not a GGUF file; structured metadata is only available for GGUF weights"
            ))
            .into());
        }
        let meta = gguf::parse_file(path)?;
        return print_metadata(&meta, json);
    }

    let id = parse_id(target)?;
    let resolved = resolve(&id, resolution)?;
    match &resolved.metadata {
        Some(meta) => print_metadata(meta, json),
        None => {
            println!("Model:  {}", resolved.id);
            println!("File:   {}", resolved.file.display());
            println!("Format: {}", resolved.format);
            println!("Size:   {}", format_size(resolved.file_size));
            Ok(())
        }
    }
}

fn print_metadata(meta: &modelyard_core::ModelMetadata, json: bool) -> Result<()> {
    if json {
        let summary = ModelSummary::from(meta);
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    println!("Name:         {}", meta.display_name);
    println!("Architecture: {}", meta.architecture);
    println!("Quantization: {}", meta.quantization);
    if let Some(params) = meta.parameter_count {
        println!("Parameters:   {}", format_count(params));
    }
    if let Some(context) = meta.context_length {
        println!("Context:      {context}");
    }
    println!("Size:         {}", format_size(meta.file_size));
    println!("Tensors:      {}", meta.tensors.len());
    println!();
    for (key, value) in &meta.entries {
        println!("  {key} = {}", render_value(value));
    }
    Ok(())
}

fn render_value(value: &GgufValue) -> String {
    match value {
        GgufValue::U8(n) => n.to_string(),
        GgufValue::I8(n) => n.to_string(),
        GgufValue::U16(n) => n.to_string(),
        GgufValue::I16(n) => n.to_string(),
        GgufValue::U32(n) => n.to_string(),
        GgufValue::I32(n) => n.to_string(),
        GgufValue::F32(n) => n.to_string(),
        GgufValue::Bool(b) => b.to_string(),
        GgufValue::String(s) => s.clone(),
        GgufValue::Array(items) => format!("[{} items]", items.len()),
        GgufValue::U64(n) => n.to_string(),
        GgufValue::I64(n) => n.to_string(),
        GgufValue::F64(n) => n.to_string(),
    }
}

fn cmd_resolve(resolution: &ResolutionConfig, model: &str) -> Result<()> {
    let id = parse_id(model)?;
    let resolved = resolve(&id, resolution)?;
    println!("{}", resolved.file.display());
    Ok(())
}

async fn cmd_pull(resolution: &ResolutionConfig, model: &str, yes: bool) -> Result<()> {
    let id = parse_id(model)?;

    if let Ok(existing) = resolve(&id, resolution) {
        println!("Model already available at {}", existing.file.display());
        return Ok(());
    }

    let registry = RegistryClient::new(Some(config::cache_dir().join("registry")))?;
    println!("Searching the registry for '{id}'...");
    let repo = registry.lookup(&id).await?;
    let variants = registry.list_gguf_files(&repo.id).await?;
    if variants.is_empty() {
        return Err(Error::RegistryError(format!(
            "no GGUF files available for '{}'",
            repo.id
        ))
        .into());
    }

    let facts = SystemFacts::detect();
    let ranked = rank(&variants, &facts);
    let Some(choice) = ranked.first() else {
        return Err(Error::DownloadFailed(format!(
            "none of the {} available variants fit within this machine's memory budget",
            variants.len()
        ))
        .into());
    };

    println!(
        "Selected {} ({}) from {}",
        choice.filename,
        format_size(choice.size),
        repo.id
    );
    confirm_download(choice, yes)?;

    let dest_dir = resolution.model_dir(&id);
    let fetcher = Fetcher::new()?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    });

    let (progress_tx, mut progress_rx) = mpsc::channel::<DownloadProgress>(64);
    let bar = ProgressBar::new(choice.size);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{bar:40} {bytes}/{total_bytes} ({eta})")
            .unwrap(),
    );
    let bar_task = {
        let bar = bar.clone();
        tokio::spawn(async move {
            while let Some(update) = progress_rx.recv().await {
                bar.set_position(update.downloaded_bytes);
            }
        })
    };

    let result = fetcher
        .download(choice, &dest_dir, Some(progress_tx), cancel_rx)
        .await;
    let _ = bar_task.await;

    match result {
        Ok(path) => {
            bar.finish_and_clear();
            println!("Downloaded to {}", path.display());
            Ok(())
        }
        Err(e) => {
            bar.abandon();
            Err(e.into())
        }
    }
}

fn confirm_download(variant: &RemoteVariant, assume_yes: bool) -> Result<()> {
    if assume_yes {
        return Ok(());
    }
    if !io::stdin().is_terminal() {
        // Fail closed instead of blocking on input that cannot arrive.
        return Err(Error::DownloadFailed(
            "confirmation required; re-run with --yes in non-interactive mode".to_string(),
        )
        .into());
    }
    print!(
        "Download {} ({})? [Y/n]: ",
        variant.filename,
        format_size(variant.size)
    );
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let answer = line.trim().to_ascii_lowercase();
    if answer.is_empty() || answer == "y" || answer == "yes" {
        Ok(())
    } else {
        Err(Error::DownloadFailed("download declined".to_string()).into())
    }
}

fn format_size(bytes: u64) -> String {
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    const KIB: f64 = 1024.0;
    let bytes = bytes as f64;
    if bytes >= GIB {
        format!("{:.2} GiB", bytes / GIB)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes / MIB)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes / KIB)
    } else {
        format!("{bytes} B")
    }
}

fn format_count(count: u64) -> String {
    if count >= 1_000_000_000 {
        format!("{:.1}B", count as f64 / 1e9)
    } else if count >= 1_000_000 {
        format!("{:.1}M", count as f64 / 1e6)
    } else {
        count.to_string()
    }
}
