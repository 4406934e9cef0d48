//! The `lmql` command: runs query files.
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lmql_runtime::{Config, JsonLinesSink, QueryOutcome, Runtime};

#[derive(Parser)]
#[command(name = "lmql")]
#[command(about = "Run constrained language model queries")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the first query of a query file and print its results as JSON
    Run {
        file: PathBuf,
        /// Run on this model instead of the one named by the query
        #[arg(long)]
        model: Option<String>,
        /// Seed of the sampling decoders; without --model, also runs on random(seed=SEED)
        #[arg(long)]
        seed: Option<u64>,
        /// Print JSON lines while the query runs
        #[arg(long)]
        stream: bool,
    },
    /// Print the version
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Version => {
            println!("lmql {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        Commands::Run {
            file,
            model,
            seed,
            stream,
        } => match run(file, model, seed, stream).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("error: {:#}", e);
                ExitCode::FAILURE
            }
        },
    }
}

async fn run(
    file: PathBuf,
    model: Option<String>,
    seed: Option<u64>,
    stream: bool,
) -> Result<()> {
    let source = std::fs::read_to_string(&file)
        .with_context(|| format!("cannot read {}", file.display()))?;
    let mut config = Config::from_env();
    if let Some(seed) = seed {
        config.decoder.seed = seed;
    }
    let forced = model.or_else(|| seed.map(|seed| format!("random(seed={})", seed)));
    let mut runtime = Runtime::new(config);
    if let Some(model) = forced {
        runtime.force_model(model);
    }
    if stream {
        runtime.set_sink(Arc::new(JsonLinesSink::new(std::io::stdout())));
    }
    let cancel = runtime.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted; cancelling the run.");
            cancel.cancel();
        }
    });
    match runtime.run_source(&source, vec![]).await {
        Ok(QueryOutcome::Completed(results)) => {
            let json = serde_json::to_string_pretty(&results)?;
            if !stream {
                println!("{}", json);
            }
            Ok(())
        }
        Ok(QueryOutcome::Cancelled) => anyhow::bail!("the run was cancelled"),
        Err(e) => Err(e).context("the query failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_files_are_reported_with_context() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("missing.lmql");
        let error = run(file, None, None, false).await.unwrap_err();
        assert!(format!("{:#}", error).starts_with("cannot read"), "{:#}", error);
    }
}
