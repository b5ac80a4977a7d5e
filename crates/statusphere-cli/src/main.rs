use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use statusphere_cli::cli::commands;
use statusphere_cli::cli::{print_json, App, CliConfig};
use statusphere_core::constants::DEFAULT_STATUS_LIMIT;
use statusphere_core::tracing_setup::init_tracing;

#[derive(Parser)]
#[command(name = "statusphere")]
#[command(about = "Statusphere status cache and Jetstream ingester")]
struct Cli {
    /// Pretty-print JSON output
    #[arg(long, short)]
    pretty: bool,

    /// Path to JSON config file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume the event stream into the local cache until Ctrl-C
    Ingest,

    /// List the most recently indexed statuses
    Statuses {
        /// Maximum number of statuses
        #[arg(long, short = 'l', default_value_t = DEFAULT_STATUS_LIMIT)]
        limit: usize,
    },

    /// Fetch a user's statuses from their PDS into the cache and list them
    User {
        /// Handle, with or without a leading @
        handle: String,
    },

    /// Show the configured account's profile and latest status
    Me,

    /// Publish a new status for the configured account
    Send {
        /// A single emoji
        status: String,
    },

    /// Show the stored stream cursor
    Cursor,
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cli)) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = CliConfig::resolve(cli.config.as_deref())?;
    let app = App::open(config)?;

    let output = match cli.command {
        Commands::Ingest => commands::ingest(&app).await?,
        Commands::Statuses { limit } => commands::statuses(&app, limit).await?,
        Commands::User { handle } => commands::user(&app, &handle).await?,
        Commands::Me => commands::me(&app).await?,
        Commands::Send { status } => commands::send(&app, &status).await?,
        Commands::Cursor => commands::cursor(&app.db, &app.config.core.cursor_stream)?,
    };
    print_json(&output, cli.pretty)
}
