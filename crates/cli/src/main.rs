//! Treewatch CLI - tw command

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use owo_colors::OwoColorize;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::Level;
use watcher::{EventKind, EventKinds, WatchService, WatchStats};

mod config;

use config::CliConfig;

/// Treewatch - recursive file system change notifications
#[derive(Parser)]
#[command(name = "tw")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch directories and print changes until interrupted
    Watch {
        /// Directories to watch (defaults to the config file roots)
        roots: Vec<PathBuf>,

        /// Only watch the given directories, not their subdirectories
        #[arg(long)]
        non_recursive: bool,

        /// Event kinds to report (default: all)
        #[arg(short, long, value_enum, value_delimiter = ',')]
        kinds: Vec<KindArg>,

        /// Coalescing window in milliseconds
        #[arg(long)]
        debounce_ms: Option<u64>,

        /// Additional ignore pattern (repeatable)
        #[arg(short, long)]
        ignore: Vec<String>,

        /// Print one JSON object per event
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Created,
    Modified,
    Deleted,
}

impl From<KindArg> for EventKind {
    fn from(arg: KindArg) -> Self {
        match arg {
            KindArg::Created => EventKind::Created,
            KindArg::Modified => EventKind::Modified,
            KindArg::Deleted => EventKind::Deleted,
        }
    }
}

#[derive(Serialize)]
struct EventLine<'a> {
    kind: EventKind,
    path: &'a Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let config = CliConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Watch {
            roots,
            non_recursive,
            kinds,
            debounce_ms,
            ignore,
            json,
        } => {
            let mut config = config;
            if !roots.is_empty() {
                config.roots = roots;
            }
            if let Some(ms) = debounce_ms {
                config.watch.debounce_ms = ms;
            }
            config.watch.ignore.extend(ignore);

            let kinds = if kinds.is_empty() {
                EventKinds::all()
            } else {
                kinds.into_iter().map(EventKind::from).collect()
            };
            run_watch(config, !non_recursive, kinds, json).await
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn run_watch(config: CliConfig, recursive: bool, kinds: EventKinds, json: bool) -> Result<()> {
    if config.roots.is_empty() {
        bail!("No directories to watch (pass them as arguments or set `roots` in the config file)");
    }

    let service = WatchService::new(config.watch.clone()).context("Failed to create watcher")?;
    for root in &config.roots {
        let registered = service
            .register_path(root, recursive, kinds)
            .with_context(|| format!("Failed to watch {}", root.display()))?;
        if !json {
            println!(
                "{} {} {}",
                "Watching".bold(),
                registered.root.display().to_string().cyan(),
                format!("({} directories)", registered.directories).dimmed()
            );
        }
    }

    if json {
        service.add_listener(print_json);
    } else {
        service.add_listener(print_event);
    }
    service.start()?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    service.close();
    if !json {
        print_stats(&service.stats());
    }
    Ok(())
}

fn print_event(path: &Path, kind: EventKind) {
    let label = match kind {
        EventKind::Created => format!("{:<8}", kind.as_str()).green().to_string(),
        EventKind::Modified => format!("{:<8}", kind.as_str()).yellow().to_string(),
        EventKind::Deleted => format!("{:<8}", kind.as_str()).red().to_string(),
    };
    println!("{} {}", label, path.display());
}

fn print_json(path: &Path, kind: EventKind) {
    match serde_json::to_string(&EventLine { kind, path }) {
        Ok(line) => println!("{}", line),
        Err(e) => tracing::warn!("failed to encode event for {}: {}", path.display(), e),
    }
}

fn print_stats(stats: &WatchStats) {
    println!();
    println!("{}", "Summary".bold());
    println!("  Delivered:   {}", stats.delivered);
    println!("  Suppressed:  {}", stats.suppressed.dimmed());
    println!("  Discarded:   {}", stats.discarded.dimmed());
    if stats.overflows > 0 {
        println!("  Overflows:   {}", stats.overflows.yellow());
    }
    if stats.rearm_failures > 0 {
        println!("  Lost watches: {}", stats.rearm_failures.red());
    }
}
