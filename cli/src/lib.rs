use std::fmt::Write as _;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use chrono::DateTime;
use chrono::Utc;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use owo_colors::OwoColorize;
use pipelines_flows::FlowKind;
use pipelines_flows::FlowRegistry;
use pipelines_flows::FlowRunner;
use pipelines_flows::FlowsConfig;
use pipelines_flows::RunOptions;
use pipelines_flows::registry::FlowDefinition;
use serde_json::json;
use serde_json::to_string_pretty;

#[derive(Debug, Parser)]
#[command(name = "pipelines", about = "Batch data flows of the municipal data office", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List registered flows and their schedules.
    List {
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Print the next scheduled runs of a flow.
    Schedule(ScheduleArgs),

    /// Run a flow once.
    Run(RunArgs),

    /// Write the default configuration file.
    Init {
        /// Overwrite an existing configuration.
        #[arg(long)]
        force: bool,
    },

    /// Report problems with the configuration.
    Check,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
pub struct ScheduleArgs {
    /// Flow name, e.g. `healthcheck`.
    pub flow: String,

    /// Number of runs to print.
    #[arg(short = 'n', long, default_value_t = 5)]
    pub count: usize,

    /// Reference instant (RFC 3339); defaults to now.
    #[arg(long)]
    pub after: Option<DateTime<Utc>>,
}

#[derive(Debug, Parser)]
pub struct RunArgs {
    /// Flow name, e.g. `tables-bindings`.
    pub flow: String,

    /// Keep state in memory and staged files local.
    #[arg(long)]
    pub dry_run: bool,

    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

pub async fn run(cli: Cli) -> Result<()> {
    let Cli {
        command, config, ..
    } = cli;

    match command {
        Command::List { format } => list_flows(format),
        Command::Schedule(args) => show_schedule(&args),
        Command::Run(args) => run_flow(config.as_deref(), args).await,
        Command::Init { force } => init_config(config.as_deref(), force).await,
        Command::Check => check_config(config.as_deref()).await,
    }
}

fn parse_flow(name: &str) -> Result<FlowKind> {
    name.parse::<FlowKind>().with_context(|| {
        let known: Vec<&str> = FlowKind::ALL.iter().map(|kind| kind.as_str()).collect();
        format!("known flows: {}", known.join(", "))
    })
}

fn describe_schedule(flow: &FlowDefinition) -> String {
    match &flow.schedule {
        Some(schedule) => {
            let minutes = schedule.interval.num_minutes();
            let every = if minutes % (24 * 60) == 0 {
                format!("every {} day(s)", minutes / (24 * 60))
            } else {
                format!("every {minutes} minute(s)")
            };
            format!("{every} from {} ({})", schedule.start, schedule.timezone.name())
        }
        None => "on demand".to_string(),
    }
}

fn list_flows(format: OutputFormat) -> Result<()> {
    let registry = FlowRegistry::builtin();
    match format {
        OutputFormat::Json => {
            println!("{}", to_string_pretty(&json!({ "flows": registry.list() }))?);
        }
        OutputFormat::Text => {
            println!("Registered flows:\n");
            for flow in registry.list() {
                let mut line = String::new();
                let _ = write!(line, "- {}: {}", flow.kind.as_str().green(), flow.title);
                let _ = write!(
                    line,
                    " ({}, parallelism {})",
                    describe_schedule(flow),
                    flow.parallelism
                );
                println!("{line}");
            }
        }
    }
    Ok(())
}

fn show_schedule(args: &ScheduleArgs) -> Result<()> {
    let kind = parse_flow(&args.flow)?;
    let registry = FlowRegistry::builtin();
    let Some(schedule) = registry.get(kind).and_then(|flow| flow.schedule.as_ref()) else {
        println!("{kind} has no schedule; run it on demand.");
        return Ok(());
    };
    let after = args.after.unwrap_or_else(Utc::now);
    for run in schedule.next_runs(after, args.count)? {
        println!("{}", run.to_rfc3339());
    }
    Ok(())
}

async fn load_config(path: Option<&Path>) -> Result<FlowsConfig> {
    let config = FlowsConfig::load(path)
        .await
        .context("failed to load configuration")?;
    let issues = config.validate();
    if !issues.is_empty() {
        for issue in &issues {
            eprintln!("  - {}", issue.red());
        }
        bail!("configuration has {} problem(s)", issues.len());
    }
    Ok(config)
}

async fn run_flow(config_path: Option<&Path>, args: RunArgs) -> Result<()> {
    let kind = parse_flow(&args.flow)?;
    let config = load_config(config_path).await?;
    let runner = FlowRunner::new(
        config,
        RunOptions {
            dry_run: args.dry_run,
        },
    );
    let report = runner
        .run(kind)
        .await
        .with_context(|| format!("flow {kind} failed"))?;

    match args.format {
        OutputFormat::Json => println!("{}", to_string_pretty(&report)?),
        OutputFormat::Text => {
            println!(
                "{} {kind}: {} row(s)",
                "Finished".green(),
                report.rows
            );
            for output in &report.outputs {
                println!("  {output}");
            }
        }
    }
    Ok(())
}

async fn init_config(config_path: Option<&Path>, force: bool) -> Result<()> {
    let path = match config_path {
        Some(path) => path.to_path_buf(),
        None => FlowsConfig::default_config_dir()?.join(pipelines_flows::config::CONFIG_FILE_NAME),
    };
    if path.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite it",
            path.display()
        );
    }
    let config_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    FlowsConfig::default_in(config_dir)
        .save_to(&path)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("{} {}", "Wrote".green(), path.display());
    Ok(())
}

async fn check_config(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path).await?;
    println!("{} configuration is valid ({} mode)", "OK".green(), config.mode);
    println!("  state: {}", config.state_path.display());
    println!("  staging: {}", config.output_dir.display());
    match &config.gcs_bucket {
        Some(bucket) => println!("  bucket: gs://{bucket}"),
        None => println!("  bucket: none, staged files stay local"),
    }
    Ok(())
}
