use std::env;
use std::error::Error;
use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use deal_escrow::clock::SystemClock;
use deal_escrow::csv::{read_commands, write_wallets};
use deal_escrow::store::MemoryStore;
use deal_escrow::{AppConfig, WalletEngine};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// Replays a wallet ledger and prints the resulting balances.
///
/// usage: deal-escrow <ledger.csv> [config.toml]
#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .from_env_lossy(),
        )
        .with_writer(io::stderr)
        .init();

    match replay().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn replay() -> Result<(), Box<dyn Error>> {
    let mut args = env::args().skip(1);
    let path = args
        .next()
        .ok_or("usage: deal-escrow <ledger.csv> [config.toml]")?;
    let config = match args.next() {
        Some(config_path) => AppConfig::load(config_path)?,
        None => AppConfig::default(),
    };

    if !path.ends_with(".csv") {
        warn!(path, "input file seems to not be a csv file");
    }

    let mut engine = WalletEngine::new(
        Arc::new(MemoryStore::new()),
        Arc::new(SystemClock),
        config.policy,
    );
    if let Some(attempts) = config.store_attempts {
        engine = engine.with_attempts(attempts);
    }

    let commands = read_commands(path)?;
    let (command_sender, command_receiver) = tokio::sync::mpsc::channel(16);

    let reader = tokio::task::spawn_blocking(move || {
        for result in commands {
            match result {
                Ok(command) => {
                    if command_sender.blocking_send(command).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    engine.run(ReceiverStream::new(command_receiver)).await;
    reader.await?;

    let wallets = engine.wallets().await?;
    write_wallets(io::stdout().lock(), &wallets)?;
    Ok(())
}
