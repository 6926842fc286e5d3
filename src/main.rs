//! OpenSASE Shaper - Main Entry Point
//!
//! ```bash
//! sase-shaper apply-base
//! sase-shaper autotune
//! sase-shaper status --format json
//! sase-shaper run
//! sase-shaper install --unit-dir /etc/systemd/system
//! ```

use clap::{Parser, Subcommand};
use opensase_shaper::commands::{self, Context, OutputFormat};
use opensase_shaper::config::DEFAULT_CONFIG_PATH;
use opensase_shaper::schedule::{ServiceInstaller, DEFAULT_UNIT_DIR};
use opensase_shaper::{AutotuneOutcome, ShaperConfig, ShaperError};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sase-shaper")]
#[command(author = "OpenSASE")]
#[command(version)]
#[command(about = "Adaptive WAN shaping for latency-sensitive traffic", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, env = "SASE_SHAPER_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the state directory
    #[arg(long)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the classifier and configure the shaper from persisted state
    ApplyBase,
    /// Run one measurement cycle
    Autotune,
    /// Show current state without changing anything
    Status {
        #[arg(long, short, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Run the mode loop and scheduled measurements until stopped
    Run,
    /// Install and start the systemd service
    Install {
        #[arg(long, default_value = DEFAULT_UNIT_DIR)]
        unit_dir: PathBuf,
    },
    /// Stop and remove the systemd service
    Uninstall {
        #[arg(long, default_value = DEFAULT_UNIT_DIR)]
        unit_dir: PathBuf,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = match ShaperConfig::load_or_default(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            return ExitCode::from(2);
        }
    };
    if let Some(dir) = cli.state_dir {
        config.state.dir = dir;
    }

    match execute(cli.command, cli.config, config).await {
        Ok(code) => code,
        // Already logged when the command was abandoned
        Err(ShaperError::Interrupted) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn execute(command: Commands, config_path: PathBuf, config: ShaperConfig) -> opensase_shaper::Result<ExitCode> {
    match command {
        Commands::ApplyBase => {
            let ctx = Context::system(config);
            if let Some(rates) = commands::apply_base(&ctx, commands::shutdown_signal()).await? {
                println!("applied {}", rates);
            }
        }
        Commands::Autotune => {
            let ctx = Context::system(config);
            if let Some(outcome) = commands::autotune(&ctx, commands::shutdown_signal()).await? {
                println!("{}", outcome);
                if matches!(outcome, AutotuneOutcome::ApplyFailed { .. }) {
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
        Commands::Status { format } => {
            let report = commands::status(&Context::system(config)).await;
            println!("{}", report.render(format)?);
        }
        Commands::Run => {
            tracing::info!("OpenSASE Shaper v{}", env!("CARGO_PKG_VERSION"));
            commands::run(&Context::system(config), commands::shutdown_signal()).await?;
        }
        Commands::Install { unit_dir } => {
            let binary = std::env::current_exe()?;
            let path = ServiceInstaller::new(binary, config_path, unit_dir).install().await?;
            println!("installed {}", path.display());
        }
        Commands::Uninstall { unit_dir } => {
            let binary = std::env::current_exe()?;
            ServiceInstaller::new(binary, config_path, unit_dir).uninstall().await?;
            println!("uninstalled");
        }
    }
    Ok(ExitCode::SUCCESS)
}
