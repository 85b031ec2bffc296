use std::path::PathBuf;

use clap::{Parser, Subcommand};
use status_sync::{Result, cmd, config::Config};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the status-sync application
#[derive(Parser)]
#[command(name = "status-sync")]
#[command(about = "Keep a status table fresh against redundant HTTP backends")]
#[command(version)]
struct Cli {
   #[arg(long, global = true, help = "Extra config file merged over the global one")]
   config: Option<PathBuf>,

   #[command(subcommand)]
   command: Cmd,
}

/// Available subcommands for status-sync
#[derive(Subcommand)]
enum Cmd {
   #[command(about = "Poll continuously and print changes and alerts")]
   Watch {
      #[arg(long, help = "JSON lines output")]
      json: bool,

      #[arg(long, help = "Keep polling while the host is hidden")]
      allow_background: bool,
   },

   #[command(about = "Run one manual sync cycle")]
   Sync {
      #[arg(long, help = "JSON output")]
      json: bool,
   },

   #[command(about = "Show persisted endpoint health")]
   Endpoints {
      #[arg(long, help = "JSON output")]
      json: bool,
   },

   #[command(about = "Show the cached snapshot")]
   Snapshot {
      #[arg(long, help = "JSON output")]
      json: bool,
   },
}

#[tokio::main]
async fn main() {
   tracing_subscriber::fmt()
      .with_env_filter(EnvFilter::from_default_env().add_directive(Level::WARN.into()))
      .with_writer(std::io::stderr)
      .init();

   let cli = Cli::parse();
   if let Err(err) = run(cli).await {
      eprintln!("{err}");
      std::process::exit(err.exit_code());
   }
}

async fn run(cli: Cli) -> Result<()> {
   let cfg = Config::load(cli.config.as_deref());

   match cli.command {
      Cmd::Watch { json, allow_background } => {
         cfg.validate()?;
         cmd::watch::execute(&cfg, json, allow_background).await
      },
      Cmd::Sync { json } => {
         cfg.validate()?;
         cmd::sync::execute(&cfg, json).await
      },
      Cmd::Endpoints { json } => cmd::endpoints::execute(&cfg, json),
      Cmd::Snapshot { json } => cmd::snapshot::execute(&cfg, json),
   }
}
