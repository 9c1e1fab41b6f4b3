//! Vigil CLI - run detector modules in isolated worker processes.

mod colors;
mod inspect;
mod pack;
mod run;
mod state;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use vigil_core::VigilDirs;

#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Run detector modules in isolated worker processes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding the .vigil runtime directories
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a detector package once against a request
    Run {
        /// Package directory or .tar.gz archive
        package: PathBuf,

        /// JSON file holding the analysis request
        #[arg(long)]
        request: PathBuf,

        /// Run-scope id the detector's state belongs to
        #[arg(long)]
        scope: String,

        /// Seconds a canceled worker gets to exit before it is killed
        #[arg(long)]
        grace: Option<u64>,

        /// Cancel the run after this many seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Worker executable to use instead of the discovered one
        #[arg(long)]
        worker: Option<PathBuf>,

        /// Worker heartbeat interval in milliseconds (0 disables)
        #[arg(long, default_value = "0")]
        heartbeat_ms: u64,
    },

    /// Build a package archive from a directory
    Pack {
        /// Directory holding manifest.json and the code units
        dir: PathBuf,

        /// Output archive (default: the installed packages directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show a package's manifest and contents
    Inspect {
        /// Package directory or .tar.gz archive
        package: PathBuf,
    },

    /// Read or remove stored detector state
    State {
        #[command(subcommand)]
        command: StateCommand,
    },

    /// Remove working directories left behind by crashed workers
    Clean,
}

#[derive(Subcommand)]
enum StateCommand {
    /// Print the value stored under a key
    Get {
        module: String,
        scope: String,
        key: String,
    },

    /// Remove the value stored under a key
    Delete {
        module: String,
        scope: String,
        key: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Name the failure category of vigil-core errors
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(vigil_err) = err.downcast_ref::<vigil_core::Error>() {
            anyhow::anyhow!("{} [{}]", vigil_err, run::outcome_label(vigil_err.outcome()))
        } else {
            err
        }
    };

    let base_dir = cli.base_dir.clone();
    let dirs = || vigil_dirs(base_dir.as_deref());

    match cli.command {
        Commands::Run {
            package,
            request,
            scope,
            grace,
            timeout,
            worker,
            heartbeat_ms,
        } => {
            let options = run::RunOptions {
                package,
                request,
                scope,
                grace,
                timeout,
                worker,
                heartbeat_ms,
            };
            run::execute(&dirs()?, options).await.map_err(format_error)?;
        }

        Commands::Pack { dir, output } => {
            let output = match output {
                Some(output) => output,
                None => pack::default_output(&dirs()?, &dir)?,
            };
            pack::execute(&dir, &output).map_err(format_error)?;
        }

        Commands::Inspect { package } => inspect::execute(&package).map_err(format_error)?,

        Commands::State { command } => match command {
            StateCommand::Get { module, scope, key } => {
                state::get(&dirs()?, &module, &scope, &key).map_err(format_error)?;
            }
            StateCommand::Delete { module, scope, key } => {
                state::delete(&dirs()?, &module, &scope, &key).map_err(format_error)?;
            }
        },

        Commands::Clean => {
            let dirs = dirs()?;
            dirs.clean_work()?;
            println!("Cleaned {}", dirs.work_dir.display());
        }
    }

    Ok(())
}

/// Runtime directories under `base`, or under the user's data directory.
fn vigil_dirs(base: Option<&Path>) -> anyhow::Result<VigilDirs> {
    let base = match base {
        Some(base) => base.to_path_buf(),
        None => match dirs::data_local_dir() {
            Some(data) => data.join("vigil"),
            None => std::env::current_dir()?,
        },
    };
    Ok(VigilDirs::from_base_dir(&base)?)
}
