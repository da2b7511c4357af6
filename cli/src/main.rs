use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ordinal_kernel::config::NodeConfig;
use ordinal_kernel::lifecycle::{DryRunEngine, EngineContext, InMemoryTopicClient};
use ordinal_kernel::log::{Command, CommandKind, CommandLog, FileLogStore, SequenceNumber};
use ordinal_kernel::producer::CommandProducer;
use ordinal_kernel::replay::replay_log;
use ordinal_kernel::state::{CommandStatus, DataSource, PersistentQuery};

/// Ordinal command log tool
#[derive(Parser, Debug)]
#[command(name = "ordinal")]
#[command(about = "Inspect and replay an Ordinal command log (dry-run)", long_about = None)]
struct Cli {
    /// Log filter, e.g. `info` or `ordinal_kernel=debug`
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Append commands from a JSON file to the log
    Submit {
        #[arg(long)]
        log_dir: PathBuf,

        /// JSON array of commands
        #[arg(long)]
        commands: PathBuf,

        /// Path to node config JSON
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Replay the log with dry-run collaborators and print the final state
    Replay {
        #[arg(long)]
        log_dir: PathBuf,

        #[arg(long)]
        config: Option<PathBuf>,

        /// Make query startup fail for this sink
        #[arg(long)]
        fail_sink: Vec<String>,
    },

    /// Print decoded entries up to the latest sequence
    Tail {
        #[arg(long)]
        log_dir: PathBuf,

        #[arg(long, default_value_t = 1)]
        from: SequenceNumber,
    },
}

/// A command as written in the input file.
#[derive(Debug, Deserialize)]
struct CommandInput {
    kind: CommandKind,
    target: String,
    statement: String,
    #[serde(default)]
    properties: BTreeMap<String, String>,
    #[serde(default)]
    sources: Vec<String>,
}

impl CommandInput {
    fn into_command(self) -> Command {
        let mut command = Command::new(self.kind, self.target, self.statement)
            .with_sources(self.sources);
        command.properties = self.properties;
        command
    }
}

#[derive(Debug, Serialize)]
struct SubmitOutput {
    command_id: String,
    sequence: SequenceNumber,
}

#[derive(Debug, Serialize)]
struct ReplayOutput {
    last_applied: SequenceNumber,
    sources: Vec<DataSource>,
    queries: Vec<PersistentQuery>,
    statuses: Vec<CommandStatus>,
}

#[derive(Debug, Serialize)]
struct TailOutput {
    sequence: SequenceNumber,
    command: Command,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Commands::Submit {
            log_dir,
            commands,
            config,
        } => submit(&log_dir, &commands, config.as_deref()),
        Commands::Replay {
            log_dir,
            config,
            fail_sink,
        } => replay(&log_dir, config.as_deref(), &fail_sink),
        Commands::Tail { log_dir, from } => tail(&log_dir, from),
    }
}

fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
    match path {
        Some(path) => NodeConfig::load(path).context("loading node config"),
        None => Ok(NodeConfig::default()),
    }
}

fn open_log(dir: &Path) -> Result<CommandLog<FileLogStore>> {
    let store = FileLogStore::open(dir)
        .with_context(|| format!("opening command log in {}", dir.display()))?;
    Ok(CommandLog::new(store))
}

fn submit(log_dir: &Path, commands: &Path, config: Option<&Path>) -> Result<()> {
    let config = load_config(config)?;
    let data = fs::read_to_string(commands)
        .with_context(|| format!("reading {}", commands.display()))?;
    let inputs: Vec<CommandInput> = serde_json::from_str(&data).context("parsing commands")?;

    let producer = CommandProducer::new(open_log(log_dir)?, config.retry.policy());
    let mut output = Vec::with_capacity(inputs.len());
    for input in inputs {
        let submission = producer.submit(&input.into_command())?;
        output.push(SubmitOutput {
            command_id: submission.command_id.to_string(),
            sequence: submission.sequence,
        });
    }

    info!(appended = output.len(), "commands submitted");
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn replay(log_dir: &Path, config: Option<&Path>, fail_sinks: &[String]) -> Result<()> {
    let config = load_config(config)?;
    let log = open_log(log_dir)?;

    let engine = DryRunEngine::default();
    for sink in fail_sinks {
        engine.fail_sink(sink.as_str());
    }
    let context = EngineContext::new(Arc::new(engine), Arc::new(InMemoryTopicClient::default()));

    let report = replay_log(&log, context, config.query_shutdown_timeout())
        .context("replaying command log")?;

    let output = ReplayOutput {
        last_applied: report.last_applied,
        sources: report.store.sources().cloned().collect(),
        queries: report.store.queries().cloned().collect(),
        statuses: report.store.statuses().into_iter().cloned().collect(),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn tail(log_dir: &Path, from: SequenceNumber) -> Result<()> {
    let log = open_log(log_dir)?;
    let latest = log.latest_sequence()?;
    if from > latest {
        return Ok(());
    }

    let stop = Arc::new(AtomicBool::new(false));
    for item in log.tail_from(from, stop) {
        let entry = item?;
        let output = TailOutput {
            sequence: entry.sequence,
            command: entry.command,
        };
        println!("{}", serde_json::to_string(&output)?);
        if output.sequence >= latest {
            break;
        }
    }
    Ok(())
}
