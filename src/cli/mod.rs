/*
* vm-balancer command line
* ------------------------
* vm-balancer [--config DIR]
* ├── serve [--host] [--port]             // HTTP API
* ├── analyze [--previous FILE] [--save FILE] [--json]
* ├── execute [--apply] [--json]          // dry run unless --apply
* ├── migrations
* │   ├── list [--status] [--limit]
* │   └── show ID
* ├── best-node --cpu --memory-gib --disk-gib
* ├── config                              // effective balancing config
* └── init [--force]                      // writes <config dir>/default.toml
*
* Every command that touches a cluster takes --cluster; the default comes from
* collector.default_cluster.
*/

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::{self, AppState};
use crate::cluster::{Analysis, Balancer, ExecutionOutcome, FileCollector};
use crate::config::{generate_default_config, OverrideStore, Settings};
use crate::core::resources::{Resources, GIB};
use crate::migration::{CommandRelocator, MigrationLedger, MigrationRecord, MigrationStatus};

#[derive(Parser)]
#[command(name = "vm-balancer")]
#[command(about = "Cluster resource balancer for virtual machines and containers", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration directory (default: $CONFIG_PATH or ./config)
    #[arg(short, long, value_name = "DIR", global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Plan a balancing pass without moving anything
    Analyze {
        #[arg(long)]
        cluster: Option<String>,
        /// Earlier analysis (as written by --save or --json) to diff against
        #[arg(long, value_name = "FILE")]
        previous: Option<PathBuf>,
        /// Write the analysis as JSON
        #[arg(long, value_name = "FILE")]
        save: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Plan and run a balancing pass
    Execute {
        #[arg(long)]
        cluster: Option<String>,
        /// Relocate guests; without it the pass is a dry run
        #[arg(long)]
        apply: bool,
        #[arg(long)]
        json: bool,
    },
    /// Inspect migration history
    Migrations {
        #[command(subcommand)]
        command: MigrationCommands,
    },
    /// Suggest a node for a new guest
    BestNode {
        #[arg(long)]
        cluster: Option<String>,
        #[arg(long, default_value_t = 1.0)]
        cpu: f64,
        #[arg(long, default_value_t = 1.0)]
        memory_gib: f64,
        #[arg(long, default_value_t = 0.0)]
        disk_gib: f64,
    },
    /// Print the effective balancing configuration
    Config,
    /// Generate default configuration
    Init {
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum MigrationCommands {
    /// List migration records, newest first
    List {
        #[arg(long)]
        status: Option<MigrationStatus>,
        #[arg(long, default_value_t = 100)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Show one migration record
    Show { id: u64 },
}

impl Cli {
    pub fn config_dir(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(|| {
            PathBuf::from(std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string()))
        })
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // A subscriber may already be installed, e.g. when run from tests.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

async fn open_ledger(settings: &Settings) -> anyhow::Result<Arc<MigrationLedger>> {
    let ledger = match &settings.ledger.journal_path {
        Some(path) => MigrationLedger::open(path)
            .await
            .with_context(|| format!("opening ledger journal {}", path.display()))?,
        None => MigrationLedger::in_memory(),
    };
    Ok(Arc::new(ledger))
}

async fn build_balancer(settings: &Settings) -> anyhow::Result<Balancer> {
    let collector = Arc::new(FileCollector::new(settings.collector.inventory_dir.clone()));
    let relocator = Arc::new(CommandRelocator::new(settings.relocation.clone()));
    let ledger = open_ledger(settings).await?;
    Ok(Balancer::new(settings, collector, relocator, ledger))
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let dir = cli.config_dir();

    if let Commands::Init { force } = cli.command {
        return handle_init_command(&dir, force);
    }

    // The server reads persisted overrides per request; every other command applies them now.
    let settings = match cli.command {
        Commands::Serve { .. } => Settings::layered(&dir)?,
        _ => Settings::from_dir(&dir)?,
    };
    init_logging(&settings.logging.level);

    match cli.command {
        Commands::Serve { host, port } => handle_serve_command(settings, &dir, host, port).await?,
        Commands::Analyze {
            cluster,
            previous,
            save,
            json,
        } => handle_analyze_command(&settings, cluster, previous, save, json).await?,
        Commands::Execute { cluster, apply, json } => {
            handle_execute_command(&settings, cluster, apply, json).await?
        }
        Commands::Migrations { command } => handle_migrations_command(&settings, command).await?,
        Commands::BestNode {
            cluster,
            cpu,
            memory_gib,
            disk_gib,
        } => {
            let balancer = build_balancer(&settings).await?;
            let cluster = cluster.unwrap_or_else(|| settings.collector.default_cluster.clone());
            let demand = Resources::new(cpu, memory_gib * GIB, disk_gib * GIB);
            match balancer.best_node(&cluster, &settings.balancing, demand).await? {
                Some(node) => println!("{} {}", "✓".green(), node.bold()),
                None => println!("{} no node can host the requested guest", "✗".red()),
            }
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&settings.balancing)?);
        }
        Commands::Init { .. } => {}
    }

    Ok(())
}

async fn handle_serve_command(
    settings: Settings,
    dir: &Path,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let host = host.unwrap_or_else(|| settings.server.host.clone());
    let port = port.unwrap_or(settings.server.port);
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", host, port))?;

    let balancer = Arc::new(build_balancer(&settings).await?);
    let state = AppState {
        balancer,
        settings: Arc::new(settings),
        overrides: OverrideStore::new(dir),
        shutdown: CancellationToken::new(),
    };
    info!("Starting server on {}", addr);
    api::serve(state, addr).await?;
    Ok(())
}

async fn handle_analyze_command(
    settings: &Settings,
    cluster: Option<String>,
    previous: Option<PathBuf>,
    save: Option<PathBuf>,
    json: bool,
) -> anyhow::Result<()> {
    let balancer = build_balancer(settings).await?;
    let cluster = cluster.unwrap_or_else(|| settings.collector.default_cluster.clone());

    let previous: Option<Analysis> = match previous {
        Some(path) => {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading previous analysis {}", path.display()))?;
            Some(serde_json::from_str(&raw).context("parsing previous analysis")?)
        }
        None => None,
    };

    let analysis = balancer
        .analyze(&cluster, &settings.balancing, previous.as_ref())
        .await?;

    if let Some(path) = save {
        tokio::fs::write(&path, serde_json::to_string_pretty(&analysis)?)
            .await
            .with_context(|| format!("writing analysis to {}", path.display()))?;
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&analysis)?);
    } else {
        print_analysis(&cluster, &analysis);
    }
    Ok(())
}

async fn handle_execute_command(
    settings: &Settings,
    cluster: Option<String>,
    apply: bool,
    json: bool,
) -> anyhow::Result<()> {
    let balancer = build_balancer(settings).await?;
    let cluster = cluster.unwrap_or_else(|| settings.collector.default_cluster.clone());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, no further moves will be dispatched");
            on_signal.cancel();
        }
    });

    let outcome = balancer
        .execute(&cluster, &settings.balancing, !apply, cancel)
        .await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_outcome(&outcome);
    }
    Ok(())
}

async fn handle_migrations_command(settings: &Settings, command: MigrationCommands) -> anyhow::Result<()> {
    if settings.ledger.journal_path.is_none() {
        warn!("No ledger.journal_path configured, history is empty");
    }
    let ledger = open_ledger(settings).await?;

    match command {
        MigrationCommands::List { status, limit, json } => {
            let records = ledger.list(status, Some(limit)).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                println!("{}", "Migrations:".bold());
                for record in &records {
                    print_record(record);
                }
            }
        }
        MigrationCommands::Show { id } => {
            let record = ledger.get(id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
    }
    Ok(())
}

fn handle_init_command(dir: &Path, force: bool) -> anyhow::Result<()> {
    let target = dir.join("default.toml");
    if target.exists() && !force {
        eprintln!(
            "{} {} already exists. Use --force to overwrite.",
            "✗".red(),
            target.display()
        );
        return Ok(());
    }

    std::fs::create_dir_all(dir)?;
    let default_config = generate_default_config();
    let config_str = toml::to_string_pretty(&default_config)?;
    std::fs::write(&target, config_str)?;

    println!("{} Default configuration written to {}", "✓".green(), target.display());
    Ok(())
}

fn status_label(status: MigrationStatus) -> colored::ColoredString {
    let label = status.to_string();
    match status {
        MigrationStatus::Completed => label.green(),
        MigrationStatus::Failed => label.red(),
        MigrationStatus::Skipped => label.yellow(),
        MigrationStatus::Proposed | MigrationStatus::Executing => label.cyan(),
    }
}

fn print_record(record: &MigrationRecord) {
    let dry = if record.dry_run { " (dry run)" } else { "" };
    println!(
        "- #{} {} ({}) {} -> {} [{}] {}{}",
        record.id,
        record.guest_name,
        record.guest,
        record.source,
        record.target,
        record.reason,
        status_label(record.status),
        dry
    );
    if let Some(error) = &record.error {
        println!("    {}", error.dimmed());
    }
}

fn print_analysis(cluster: &str, analysis: &Analysis) {
    let balance = &analysis.plan.balance;
    println!("{} {}", "Cluster".bold(), cluster);
    let verdict = if balance.balanced {
        "balanced".green()
    } else {
        "unbalanced".yellow()
    };
    println!(
        "Spread {:.1} (balanciness {:.1}): {} ({})",
        balance.spread, balance.balanciness, verdict, balance.reason
    );
    for (node, load) in &balance.node_loads {
        let after = analysis.plan.projected.node_loads.get(node).copied().unwrap_or(*load);
        println!("  {:<16} {:>6.1}% -> {:>6.1}%", node, load, after);
    }

    if analysis.plan.moves.is_empty() {
        println!("{}", "No moves proposed".dimmed());
    } else {
        println!("{}", "Proposed moves:".bold());
        for m in &analysis.plan.moves {
            println!(
                "- {} ({}) {} -> {} [{}]",
                m.guest_name,
                m.guest,
                m.source,
                m.target.green(),
                m.reason
            );
        }
    }
    for u in &analysis.plan.unplaceable {
        println!("{} {} on {}: {}", "✗".red(), u.guest_name, u.node, u.reason);
    }
    for conflict in &analysis.conflicts {
        println!("{} {}", "!".yellow(), conflict);
    }
    if let Some(drift) = &analysis.drift {
        if drift.is_empty() {
            println!("No change since pass {}", drift.previous_pass);
        } else {
            println!(
                "Since pass {}: {} added, {} dropped, {} retargeted, spread {:+.1}",
                drift.previous_pass,
                drift.added.len(),
                drift.dropped.len(),
                drift.retargeted.len(),
                drift.spread_delta
            );
        }
    }
}

fn print_outcome(outcome: &ExecutionOutcome) {
    for note in &outcome.notes {
        println!("{} {}", "!".yellow(), note);
    }
    let mode = if outcome.dry_run { "dry run" } else { "applied" };
    println!("{} pass {} ({})", "Balancing".bold(), outcome.pass_id, mode);
    for record in &outcome.records {
        print_record(record);
    }
    for u in &outcome.plan.unplaceable {
        println!("{} {} on {}: {}", "✗".red(), u.guest_name, u.node, u.reason);
    }
    let s = outcome.summary;
    println!(
        "{} proposed, {} completed, {} failed, {} skipped",
        s.proposed,
        s.completed.to_string().green(),
        s.failed.to_string().red(),
        s.skipped.to_string().yellow()
    );
}
