use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sdprov::adapters::{self, Adapters};
use sdprov::config::{self, AppConfig, SettingsUpdate};
use sdprov::context::AppContext;
use sdprov::core::{
    Event, EventSink, Orchestrator, TransferOutcome, VersionCatalog, VolumeDescriptor, VolumeMonitor,
    list_removable_volumes, validate_volume,
};
use sdprov::logging::{self, LogConfig};

#[derive(Parser)]
#[command(name = "sdprov")]
#[command(about = "Provision SD cards with versions from a source library", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file
    #[arg(long, global = true, default_value = config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[arg(long, global = true)]
    verbose: bool,

    /// Print events and logs as JSON lines
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List removable volumes
    Volumes,
    /// List the versions found in the source folder
    Versions,
    /// Edit the description and function of a version
    Describe {
        version: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        function: Option<String>,
    },
    /// Run the safety checks against a volume without touching it
    Validate(VolumeArgs),
    /// Wipe a volume and write a version onto it
    Write {
        /// Defaults to the last used version
        version: Option<String>,
        #[command(flatten)]
        target: VolumeArgs,
    },
    /// Format a volume
    Format {
        #[command(flatten)]
        target: VolumeArgs,
        /// Confirm that all data on the volume may be erased
        #[arg(long)]
        yes: bool,
    },
    /// Change settings
    Settings(SettingsArgs),
    /// Watch for volumes and optionally write automatically on insert
    Watch(WatchArgs),
}

#[derive(Args)]
struct VolumeArgs {
    /// Mount path or drive letter; defaults to the first removable volume
    #[arg(long)]
    volume: Option<String>,
}

#[derive(Args)]
struct SettingsArgs {
    #[arg(long)]
    source_dir: Option<String>,
    /// Comma separated; empty allows every extension
    #[arg(long)]
    extensions: Option<String>,
    #[arg(long)]
    max_files: Option<String>,
    #[arg(long)]
    max_drive_gb: Option<String>,
    #[arg(long)]
    allow_subdirs: Option<bool>,
    #[arg(long)]
    auto_format_corrupt: Option<bool>,
}

#[derive(Args)]
struct WatchArgs {
    /// Write the selected version to every newly inserted volume
    #[arg(long)]
    auto_start: bool,
    #[arg(long)]
    version: Option<String>,
    /// Read 'add <dir> [gb]' / 'rm <dir>' from stdin instead of real devices
    #[arg(long)]
    simulation: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(LogConfig {
        json: cli.json,
        verbose: cli.verbose,
    });

    let config = AppConfig::load(&cli.config);
    let (events, rx) = EventSink::channel();
    let printer = tokio::spawn(print_events(rx, cli.json));
    let ctx = AppContext::new(cli.config.clone(), config, events);

    let simulation = matches!(&cli.command, Commands::Watch(args) if args.simulation);
    let adapters = adapters::get_adapters(simulation);

    let result = run(cli.command, ctx, adapters).await;
    // All senders are gone once `run` returns, which ends the printer.
    let _ = printer.await;
    result
}

async fn run(command: Commands, ctx: AppContext, adapters: Adapters) -> Result<()> {
    match command {
        Commands::Volumes => run_volumes(&adapters).await,
        Commands::Versions => run_versions(&ctx),
        Commands::Describe {
            version,
            description,
            function,
        } => run_describe(&ctx, &version, description, function),
        Commands::Validate(target) => run_validate(&ctx, &adapters, target).await,
        Commands::Write { version, target } => run_write(ctx, adapters, version, target).await,
        Commands::Format { target, yes } => run_format(ctx, adapters, target, yes).await,
        Commands::Settings(args) => run_settings(ctx, args),
        Commands::Watch(args) => run_watch(ctx, adapters, args).await,
    }
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<Event>, json: bool) {
    while let Some(event) = rx.recv().await {
        if json {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{line}");
            }
        } else {
            println!(
                "[{}] {:<7} {}",
                event.timestamp.format("%H:%M:%S"),
                event.severity.as_str(),
                event.message
            );
        }
    }
}

fn source_root(config: &AppConfig) -> Result<PathBuf> {
    config
        .source_root()
        .context("Source folder is not set or does not exist (use `sdprov settings --source-dir`)")
}

async fn pick_volume(adapters: &Adapters, requested: Option<&str>) -> Result<VolumeDescriptor> {
    let volumes = list_removable_volumes(&adapters.providers).await;
    match requested {
        Some(id) => volumes
            .into_iter()
            .find(|v| v.id == id)
            .with_context(|| format!("{id} is not a removable volume")),
        None => volumes.into_iter().next().context("No removable volume found"),
    }
}

async fn run_volumes(adapters: &Adapters) -> Result<()> {
    let volumes = list_removable_volumes(&adapters.providers).await;
    if volumes.is_empty() {
        println!("No removable volume found.");
    }
    for volume in volumes {
        println!("{volume}");
    }
    Ok(())
}

fn run_versions(ctx: &AppContext) -> Result<()> {
    let catalog = VersionCatalog::load(&source_root(&ctx.config)?)?;
    if catalog.is_empty() {
        println!("No subfolders found.");
    }
    let preferred = catalog.preferred(&ctx.config.last_version);
    for name in catalog.names() {
        let marker = if Some(name) == preferred { "*" } else { " " };
        let summary = catalog
            .get(name)
            .and_then(|record| record.summary())
            .unwrap_or_else(|| "No description.".to_string());
        println!("{marker} {name:<24} {summary}");
    }
    Ok(())
}

fn run_describe(
    ctx: &AppContext,
    version: &str,
    description: Option<String>,
    function: Option<String>,
) -> Result<()> {
    let mut catalog = VersionCatalog::load(&source_root(&ctx.config)?)?;
    let current = catalog.get(version).cloned().unwrap_or_default();
    catalog.update(
        version,
        description.unwrap_or(current.description),
        function.unwrap_or(current.function),
    )?;
    ctx.events.info(format!("Info for {version} saved."));
    Ok(())
}

async fn run_validate(ctx: &AppContext, adapters: &Adapters, target: VolumeArgs) -> Result<()> {
    let volume = pick_volume(adapters, target.volume.as_deref()).await?;
    let policy = ctx.config.validation_policy();
    let id = volume.id.clone();
    let size_gb = Some(volume.capacity_gb());
    let verdict = tokio::task::spawn_blocking(move || validate_volume(&id, &policy, size_gb)).await?;

    if verdict.ok {
        ctx.events.success(format!("{volume} passed validation."));
        Ok(())
    } else {
        let corrupt = if verdict.is_corrupt { " (possibly corrupt)" } else { "" };
        ctx.events.error(format!("{volume}: {}{corrupt}", verdict.reason));
        bail!("Validation failed")
    }
}

async fn run_write(
    ctx: AppContext,
    adapters: Adapters,
    version: Option<String>,
    target: VolumeArgs,
) -> Result<()> {
    let volume = pick_volume(&adapters, target.volume.as_deref()).await?;

    let mut orchestrator = Orchestrator::new(ctx, adapters.formatter);
    let version = version
        .or_else(|| orchestrator.preferred_version())
        .unwrap_or_else(|| orchestrator.ctx().config.last_version.clone());
    let handle = orchestrator.request_transfer_remembered(&version, Some(&volume))?;
    match handle.await? {
        TransferOutcome::Done(_) => Ok(()),
        TransferOutcome::Failed { stage, reason } => bail!("Transfer failed while {stage}: {reason}"),
    }
}

async fn run_format(ctx: AppContext, adapters: Adapters, target: VolumeArgs, yes: bool) -> Result<()> {
    let volume = pick_volume(&adapters, target.volume.as_deref()).await?;
    if !yes {
        bail!(
            "Formatting erases all data on {volume} ({:.1} GB). Re-run with --yes to confirm.",
            volume.capacity_gb()
        );
    }

    let orchestrator = Orchestrator::new(ctx, adapters.formatter);
    let outcome = orchestrator.start_format(&volume)?.await?;
    if !outcome.success {
        bail!("Format failed: {}", outcome.diagnostic);
    }
    Ok(())
}

fn run_settings(mut ctx: AppContext, args: SettingsArgs) -> Result<()> {
    let update = SettingsUpdate {
        source_dir: args.source_dir,
        extensions: args.extensions,
        max_files: args.max_files,
        max_drive_gb: args.max_drive_gb,
        allow_subdirs: args.allow_subdirs,
        auto_format_corrupt: args.auto_format_corrupt,
    };

    if !update.is_empty() {
        update.apply(&mut ctx.config);
        ctx.save_config()?;
        ctx.events.info("Settings saved.");
    }

    println!("{}", serde_json::to_string_pretty(&ctx.config)?);
    Ok(())
}

async fn run_watch(mut ctx: AppContext, adapters: Adapters, args: WatchArgs) -> Result<()> {
    if let Some(version) = args.version {
        ctx.config.last_version = version;
    }
    if args.auto_start {
        ctx.config.auto_start = true;
    }
    ctx.save_config()?;

    let monitor = VolumeMonitor::new(adapters.providers);
    let mut orchestrator = Orchestrator::new(ctx, adapters.formatter);

    let token = CancellationToken::new();
    let ctrl_c = token.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        ctrl_c.cancel();
    });

    orchestrator.ctx().events.info("Watching for removable volumes (Ctrl-C to stop)...");
    orchestrator.watch(&monitor, token).await;
    Ok(())
}
