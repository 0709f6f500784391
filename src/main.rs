use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use beadwork::config::Settings;
use beadwork::logging::{LogFormat, init_tracing};

mod cmd;

#[derive(Parser)]
#[command(name = "beadwork")]
#[command(version, about = "Run a coding agent against a bead with timeouts, cancellation and quality gates")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the config file. Defaults to $BEADWORK_CONFIG, then ./beadwork.toml.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log output format: text or json
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Address to bind (overrides [server] host)
        #[arg(long)]
        host: Option<String>,

        /// Port to serve on (overrides [server] port)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run one bead in the foreground and stream the agent's output
    Run {
        /// Project directory to run in
        project_path: PathBuf,

        /// Bead to work on
        bead_id: String,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_format, cli.verbose)?;
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => cmd::cmd_serve(settings, host, port).await?,
        Commands::Run {
            project_path,
            bead_id,
        } => {
            let code = cmd::cmd_run(settings, &project_path, &bead_id).await?;
            std::process::exit(code);
        }
        Commands::Config => cmd::cmd_config(&settings)?,
    }

    Ok(())
}
