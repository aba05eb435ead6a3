use clap::{command, Parser};
use dogma::{builtin, Agent, AgentConfig, Error};
use std::{path::PathBuf, sync::Arc};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "dogma.json")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

async fn run(cli: &Cli) -> Result<(), Error> {
    let config = if cli.config.exists() {
        AgentConfig::from_file(&cli.config)?
    } else {
        warn!("{:?} not found, using defaults", cli.config);
        AgentConfig::default()
    };

    info!("config loaded.");
    debug!("config: {:?}", config);

    let programs = config.programs.clone();
    let agent = Arc::new(Agent::with_config(builtin::catalog(), config));
    let imported = agent.import_list(&programs).await?;
    info!("{} programs imported", imported);

    let signal_agent = agent.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                println!("Shutdown signal received, unloading programs...");
                signal_agent.shutdown();
            }
            Err(e) => warn!("Failed to wait for Ctrl+C: {}", e),
        }
    });

    println!("Agent started. Press Ctrl+C to shutdown.");
    agent.init().await?;

    for record in agent.faults() {
        warn!("{} faulted at {}: {}", record.path, record.at, record.fault);
    }
    println!("Agent stopped.");

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
