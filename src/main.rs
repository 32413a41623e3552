use anyhow::Result;
use clap::{Parser, Subcommand};
use deckhand::cmd;
use deckhand::config::Config;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "deckhand")]
#[command(version, about = "Run coordinator for AI agents on a markdown kanban board")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project directory holding the board (defaults to the current dir)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Enqueue an agent run for a card and follow it to completion
    Run {
        /// Path to the card file
        card: PathBuf,

        /// Flow to run: implement, review, research or plan
        #[arg(short, long, default_value = "implement")]
        flow: String,
    },
    /// List every card on the board
    List,
    /// Show board counts, active agent runs and lock records
    Status,
    /// Parse one card and report what an agent run would see
    Validate { card: PathBuf },
    /// Show run lock records
    Locks {
        /// Remove stale records and mark their cards failed
        #[arg(long)]
        clean: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let root = cli
        .project_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    let config = Config::new(root, cli.verbose)?;

    match cli.command {
        Commands::Run { card, flow } => cmd::cmd_run(&config, card, &flow).await,
        Commands::List => cmd::cmd_list(&config),
        Commands::Status => cmd::cmd_status(&config),
        Commands::Validate { card } => cmd::cmd_validate(&config, card),
        Commands::Locks { clean } => cmd::cmd_locks(&config, clean),
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "deckhand=debug" } else { "deckhand=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
