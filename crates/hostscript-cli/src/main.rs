use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hostscript_runtime::{Arg, HostValue, RuntimeConfig, ScriptRuntime, digest, parse_result};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "hostscript", about = "hostscript: run and check embedded guest scripts")]
struct Cli {
    /// Runtime configuration file (defaults to ~/.hostscript/config.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a script's handler once and print its result as JSON
    Run {
        /// Path to the script file
        script: PathBuf,

        /// Cache identity (defaults to the script's content digest)
        #[arg(long)]
        id: Option<String>,

        /// Handler argument as JSON; repeat for several arguments
        #[arg(long = "arg")]
        args: Vec<String>,

        /// Parse the result into records before printing
        #[arg(long)]
        parse: bool,
    },
    /// Compile a script and verify it defines `handler`
    Check {
        /// Path to the script file
        script: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so results on stdout stay machine-readable
    fmt()
        .with_env_filter(EnvFilter::from_env("HOSTSCRIPT_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    // Guest calls block, keep them off the async workers.
    let output = tokio::task::spawn_blocking(move || execute(cli.command, config)).await??;
    println!("{output}");
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    if let Some(path) = path {
        return Ok(RuntimeConfig::from_file(path)?);
    }
    match dirs::home_dir().map(|home| home.join(".hostscript").join("config.toml")) {
        Some(default) if default.exists() => {
            tracing::debug!(path = %default.display(), "Using default config");
            Ok(RuntimeConfig::from_file(&default)?)
        }
        _ => Ok(RuntimeConfig::default()),
    }
}

fn read_script(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read script {}", path.display()))
}

fn execute(command: Command, config: RuntimeConfig) -> Result<String> {
    let runtime = ScriptRuntime::new(config)?;

    match command {
        Command::Run {
            script,
            id,
            args,
            parse,
        } => {
            let text = read_script(&script)?;
            let identity = id.unwrap_or_else(|| digest(&text));
            let args = args
                .iter()
                .map(|raw| {
                    serde_json::from_str::<serde_json::Value>(raw)
                        .map(Arg::host)
                        .with_context(|| format!("--arg is not valid JSON: {raw}"))
                })
                .collect::<Result<Vec<_>>>()?;

            tracing::info!(identity, script = %script.display(), "Running script");
            let result = runtime.run_by_id_and_script(&identity, &text, args)?;

            if parse {
                let records = parse_result(&result)?;
                Ok(serde_json::to_string_pretty(&records)?)
            } else {
                let value = HostValue::from_dynamic(&result)?;
                Ok(serde_json::to_string_pretty(&value)?)
            }
        }
        Command::Check { script } => {
            let text = read_script(&script)?;
            runtime.acquire(&digest(&text), &text)?;
            Ok(format!("{}: ok", script.display()))
        }
    }
}
