//! The fluid-settings daemon binary.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use fluid_settings::config::Config;
use fluid_settings::daemon::run_daemon;

#[derive(Parser, Debug)]
#[command(
    name = "fluid-settingsd",
    version,
    about = "Distributed configuration service daemon"
)]
struct Cli {
    /// Configuration file; flags and environment variables override it.
    #[arg(long, short = 'c', env = "FLUID_SETTINGS_CONFIG")]
    config: Option<PathBuf>,

    /// Bus endpoint to register with.
    #[arg(long, env = "FLUID_SETTINGS_BUS")]
    bus: Option<String>,

    /// IP:port other fluid-settings daemons connect to.
    #[arg(long, env = "FLUID_SETTINGS_LISTEN")]
    listen: Option<String>,

    /// Full path to the settings file.
    #[arg(long, env = "FLUID_SETTINGS_SETTINGS")]
    settings: Option<PathBuf>,

    /// Colon-separated list of definition directories.
    #[arg(long, env = "FLUID_SETTINGS_DEFINITIONS")]
    definitions: Option<String>,

    /// Seconds to wait before saving the latest changes.
    #[arg(long, env = "FLUID_SETTINGS_SAVE_TIMEOUT")]
    save_timeout: Option<u64>,

    /// Seconds between two gossip broadcasts.
    #[arg(long, env = "FLUID_SETTINGS_GOSSIP_TIMEOUT")]
    gossip_timeout: Option<u64>,

    /// More logging; repeat for debug output.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match run_daemon(config) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

fn build_config(cli: &Cli) -> Result<Config, fluid_settings::Error> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };

    if let Some(bus) = &cli.bus {
        config.bus = bus.clone();
    }
    if let Some(listen) = &cli.listen {
        config.listen = listen.clone();
    }
    if let Some(settings) = &cli.settings {
        config.settings = settings.clone();
    }
    if let Some(definitions) = &cli.definitions {
        config.definitions = definitions.clone();
    }
    if let Some(save_timeout) = cli.save_timeout {
        config.save_timeout = save_timeout;
    }
    if let Some(gossip_timeout) = cli.gossip_timeout {
        config.gossip_timeout = gossip_timeout;
    }
    config.validate()?;
    Ok(config)
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("FLUID_SETTINGS_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
