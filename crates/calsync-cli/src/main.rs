use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "calsync", version, about = "Offline-tolerant calendar sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Local event management
    Event {
        #[command(subcommand)]
        action: commands::event::EventAction,
    },
    /// Run one sync cycle now
    Sync {
        /// Pull the whole calendar instead of the incremental window
        #[arg(long)]
        full: bool,
    },
    /// Sync periodically until interrupted
    Daemon,
    /// Show sync state
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List actions waiting to be pushed
    Queue {
        #[arg(long)]
        json: bool,
    },
    /// List actions that gave up
    DeadLetters {
        #[arg(long)]
        json: bool,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("CALSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Event { action } => commands::event::run(action),
        Commands::Sync { full } => commands::sync::run_sync(full),
        Commands::Daemon => commands::sync::run_daemon(),
        Commands::Status { json } => commands::sync::run_status(json),
        Commands::Queue { json } => commands::queue::run_pending(json),
        Commands::DeadLetters { json } => commands::queue::run_dead_letters(json),
        Commands::Config { action } => commands::config::run(action),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
