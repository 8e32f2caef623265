use std::{fs::File, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use peer_ledger::{bin_utils::Service, config::LedgerConfig, processor::ErrorKind};
use tracing_subscriber::EnvFilter;

/// Replays a CSV file of ledger commands and prints the resulting balances.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// CSV file with one command per line
    input: PathBuf,

    /// JSON file overriding the ledger configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print this account's transaction history instead of the balances
    #[arg(long, value_name = "ACCOUNT")]
    history: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("Failed to open `{}`", path.display()))?;
            LedgerConfig::from_reader(file)
                .with_context(|| format!("Failed to parse `{}`", path.display()))?
        }
        None => LedgerConfig::default(),
    };
    let file = File::open(&args.input)
        .with_context(|| format!("Failed to open `{}`", args.input.display()))?;

    let service = Service {
        input: file,
        output: &mut std::io::stdout(),
        config,
        history: args.history.as_deref().map(Into::into),
        error_printer: Box::new(|line, err| {
            match &err {
                peer_ledger::bin_utils::RowError::Ledger(ledger)
                    if matches!(
                        ledger.kind(),
                        ErrorKind::InsufficientFunds | ErrorKind::Expired
                    ) =>
                {
                    // business outcomes, not input problems
                    tracing::info!(line, %err, "command declined");
                }
                _ => eprintln!("Error at line {line}: {err}"),
            }
        }),
    };
    service.run()
}
