use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use mlua::{LuaSerdeExt, MultiValue};
use tracing_subscriber::EnvFilter;

use crate::bench::{display_report, run_benchmark, BenchParams};
use crate::config::{Config, LoggingConfig};
use crate::error::CallOutcome;
use crate::vm::Vm;

#[derive(Parser)]
#[command(name = "luapool")]
#[command(about = "luapool - concurrent calls into a shared Lua state", long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default search)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load a script and call one of its global functions
    Run {
        /// Lua script to load
        script: PathBuf,

        /// Global function to call
        function: String,

        /// Arguments as a JSON array
        #[arg(short = 'a', long = "args", default_value = "[]")]
        args: String,

        /// Number of return values to collect
        #[arg(short = 'n', long = "returns", default_value = "1")]
        returns: usize,
    },

    /// Issue many concurrent calls and report pool behaviour
    Bench {
        /// Total number of calls
        #[arg(long, default_value = "200000")]
        calls: usize,

        /// Number of concurrent callers
        #[arg(long, default_value = "256")]
        concurrency: usize,
    },

    /// Print the effective configuration
    Config,
}

/// Run the CLI by parsing process arguments
pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    run_cli_with_args(cli).await
}

/// Run the CLI with provided arguments
pub async fn run_cli_from_args(args: Vec<String>) -> Result<()> {
    let cli = Cli::parse_from(args);
    run_cli_with_args(cli).await
}

async fn run_cli_with_args(cli: Cli) -> Result<()> {
    // Load config before anything else so config errors surface first
    let config = Config::builder()
        .config_path(cli.config)
        .build()
        .context("Failed to load configuration")?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Run {
            script,
            function,
            args,
            returns,
        } => {
            let output = run_script(&config, &script, &function, &args, returns)?;
            println!("{}", output);
        }
        Commands::Bench { calls, concurrency } => {
            println!("🚀 Starting luapool benchmark");
            println!("   Calls: {}", calls);
            println!("   Concurrency: {}", concurrency);
            println!("   Pool capacity: {}", config.pool.capacity);

            let report = run_benchmark(&config, BenchParams { calls, concurrency }).await?;
            display_report(&report);

            if report.succeeded != report.calls {
                return Err(anyhow!(
                    "{} of {} calls did not echo their input",
                    report.calls - report.succeeded,
                    report.calls
                ));
            }
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

/// Load `script`, call `function` with JSON arguments and render the results as JSON.
pub fn run_script(
    config: &Config,
    script: &std::path::Path,
    function: &str,
    args: &str,
    returns: usize,
) -> Result<String> {
    let vm = Vm::from_config(config)?;
    vm.load_file(script)?;

    let args: serde_json::Value =
        serde_json::from_str(args).context("Arguments must be valid JSON")?;
    let args = match args {
        serde_json::Value::Array(items) => items,
        _ => return Err(anyhow!("Arguments must be a JSON array")),
    };
    let args = args
        .iter()
        .map(|arg| vm.lua().to_value(arg))
        .collect::<mlua::Result<Vec<_>>>()
        .context("Failed to convert arguments")?;

    match vm.invoke(function, MultiValue::from_vec(args), returns) {
        CallOutcome::Success(values) => {
            let json = serde_json::to_string_pretty(&values)
                .context("Results cannot be represented as JSON")?;
            Ok(json)
        }
        CallOutcome::Failed(err) => Err(err.into()),
        CallOutcome::Fault(fault) => Err(fault.into()),
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    // Already installed when embedded in a host that set up tracing
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
