//! Binary entry point for the Sombra algebra CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use sombra_algebra::query::{
    config::CompilerConfig, dataset::InMemoryDataset, profile::query_profile_snapshot, Binding,
    ExecutionContext, Executor, Op,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "sombra-algebra",
    version,
    about = "Compile and evaluate SPARQL algebra over in-memory datasets",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "FILE",
        env = "SOMBRA_ALGEBRA_CONFIG",
        help = "Compiler configuration (TOML); defaults to the user config file"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct PlanArgs {
    #[arg(value_name = "ALGEBRA", help = "Algebra tree as JSON")]
    algebra: PathBuf,

    #[arg(long, help = "Force materializing joins and left-joins")]
    materialize: bool,
}

impl PlanArgs {
    fn apply(&self, config: CompilerConfig) -> CompilerConfig {
        if self.materialize {
            CompilerConfig {
                streamed_joins: false,
                streamed_left_joins: false,
                ..config
            }
        } else {
            config
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Evaluate an algebra tree and print its solutions")]
    Run {
        #[command(flatten)]
        plan: PlanArgs,

        #[arg(long, value_name = "FILE", help = "Dataset as JSON")]
        data: Option<PathBuf>,
    },
    #[command(about = "Print the stage tree an algebra tree compiles to")]
    Explain {
        #[command(flatten)]
        plan: PlanArgs,
    },
    #[command(about = "Print the effective compiler configuration")]
    Config,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct RunReport {
    rows: Vec<Binding>,
    count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    profile: Option<sombra_algebra::query::profile::QueryProfileSnapshot>,
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = CompilerConfig::load_or_default(cli.config.as_deref())?;
    debug!(?config, "loaded compiler configuration");

    match cli.command {
        Command::Run { plan, data } => {
            let op = load_algebra(&plan.algebra)?;
            let dataset = match data {
                Some(path) => load_dataset(&path)?,
                None => InMemoryDataset::new(),
            };
            let config = plan.apply(config);
            let ctx = ExecutionContext::new(Arc::new(dataset)).with_config(config);
            let executor = Executor::new(Arc::new(ctx));
            let result = executor.execute(&op, None)?;
            let report = RunReport {
                count: result.rows.len(),
                rows: result.rows,
                profile: query_profile_snapshot(true),
            };
            emit(&cli.format, &report, |_| {
                for row in &report.rows {
                    println!("{row}");
                }
                println!("({} rows)", report.count);
            })?;
        }
        Command::Explain { plan } => {
            let op = load_algebra(&plan.algebra)?;
            let config = plan.apply(config);
            let explain = sombra_algebra::query::explain(&op, &config);
            emit(&cli.format, &explain, |_| print!("{explain}"))?;
        }
        Command::Config => {
            emit(&cli.format, &config, |_| match config.to_toml_string() {
                Ok(text) => print!("{text}"),
                Err(err) => eprintln!("error: {err}"),
            })?;
        }
    }

    Ok(())
}

fn load_algebra(path: &Path) -> Result<Op, Box<dyn Error>> {
    let text = fs::read_to_string(path)
        .map_err(|err| format!("failed to read {}: {err}", path.display()))?;
    let op = serde_json::from_str(&text)
        .map_err(|err| format!("failed to parse algebra {}: {err}", path.display()))?;
    Ok(op)
}

fn load_dataset(path: &Path) -> Result<InMemoryDataset, Box<dyn Error>> {
    let text = fs::read_to_string(path)
        .map_err(|err| format!("failed to read {}: {err}", path.display()))?;
    let dataset = serde_json::from_str(&text)
        .map_err(|err| format!("failed to parse dataset {}: {err}", path.display()))?;
    Ok(dataset)
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(OutputFormat),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(OutputFormat::Text),
    }
    Ok(())
}
