use clap::Parser;
use log::{error, info};
use manager::store::JsonLinesStore;
use manager::{ServerInstance, Settings, StopCaller};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Instance settings file (TOML)
    #[arg(short, long, default_value = "manager.toml")]
    config: PathBuf,

    /// Rcon host, overrides the settings file
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Server port, overrides the settings file
    #[arg(short, long)]
    port: Option<u16>,

    /// File that receives the JSON-lines event history
    #[arg(long, default_value = "history.jsonl")]
    history: PathBuf,

    /// Stop without asking even when players are connected
    #[arg(short, long)]
    force: bool,
}

/// Asks on the terminal whether to stop a populated server
fn confirm_stop(players: usize) -> bool {
    print!("{} players are connected. Stop anyway? [y/N] ", players);
    if std::io::stdout().flush().is_err() {
        return false;
    }

    let mut answer = String::new();
    match std::io::stdin().lock().read_line(&mut answer) {
        Ok(_) => matches!(answer.trim(), "y" | "Y" | "yes"),
        Err(_) => false,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let mut settings = Settings::load(&args.config)?;
    if let Some(host) = args.host {
        settings.server.host = host;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }

    let store = Arc::new(JsonLinesStore::open(&args.history)?);
    info!("Recording history to {}", store.path().display());
    let instance = ServerInstance::new(settings, store, Vec::new());

    info!("Starting instance {}...", instance.name());
    instance.start().await?;

    tokio::select! {
        result = instance.serve() => {
            if let Err(e) = result {
                error!("Control loop failed: {}", e);
            }
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            println!("Received Ctrl+C, shutting down...");
        }
    }

    let stopped = instance
        .stop(args.force, StopCaller::Interactive(Box::new(confirm_stop)))
        .await;
    if let Err(e) = stopped {
        println!("{}. Press Ctrl+C again to force a stop.", e);
        tokio::signal::ctrl_c().await?;
        instance.stop(true, StopCaller::Programmatic).await?;
    }

    Ok(())
}
