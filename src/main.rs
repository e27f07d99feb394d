use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod cmd;

#[derive(Parser)]
#[command(name = "sandsmith")]
#[command(version, about = "Turn a prompt into a working app inside an ephemeral sandbox")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Write logs to daily-rotated files in this directory instead of stderr
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default .sandsmith/sandsmith.toml and create the database
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Start the HTTP intake server
    Serve {
        /// Port to listen on (defaults to server.port from the config)
        #[arg(long)]
        port: Option<u16>,
        /// Bind to all interfaces and allow cross-origin requests
        #[arg(long)]
        dev: bool,
    },
    /// Run the coding agent once and print the result as JSON
    Run {
        /// Existing project id; a new project is created when omitted
        #[arg(long)]
        project: Option<String>,
        /// What to build
        prompt: String,
    },
}

fn init_logging(
    verbose: bool,
    format: LogFormat,
    log_dir: Option<&Path>,
) -> Result<Option<WorkerGuard>> {
    let default_level = if verbose { "sandsmith=debug" } else { "sandsmith=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (writer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "sandsmith.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_writer(writer)).try_init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_ansi(log_dir.is_none()).with_writer(writer))
            .try_init(),
    }
    .context("Failed to initialize logging")?;

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.verbose, cli.log_format, cli.log_dir.as_deref())?;

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Init { force } => {
            cmd::cmd_init(&project_dir, *force)?;
        }
        Commands::Serve { port, dev } => {
            cmd::cmd_serve(&project_dir, cli.verbose, *port, *dev).await?;
        }
        Commands::Run { project, prompt } => {
            cmd::cmd_run(&project_dir, cli.verbose, project.as_deref(), prompt).await?;
        }
    }

    Ok(())
}
