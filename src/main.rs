//! Main entry point for the power management daemon

use clap::Parser;
use power_profile_daemon::{
    args::{Args, Commands},
    client::PowerProfilesClient,
    config::DaemonConfig,
    daemon::PowerDaemon,
    logging,
};
use std::path::PathBuf;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Print version and build metadata for binary identity verification
    let pkg_version = env!("CARGO_PKG_VERSION");
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    let git_desc = option_env!("GIT_DESC").unwrap_or("unknown");
    let build_time = option_env!("BUILD_TIME").unwrap_or("unknown");
    eprintln!(
        "power-profile-daemon v{} (git {} / {}) built {}",
        pkg_version, git_hash, git_desc, build_time
    );

    let args = Args::parse();
    logging::setup(args.verbose)?;

    match args.command {
        Some(Commands::Daemon) => {
            let config_path = args
                .config
                .map(PathBuf::from)
                .unwrap_or_else(DaemonConfig::config_path);
            let config = DaemonConfig::load_or_default(&config_path)?;
            let daemon = PowerDaemon::new(config)?;
            daemon.run().await?;
        }
        Some(Commands::Profile { command }) => {
            let client = PowerProfilesClient::new().await?;
            client.handle_command(command).await?;
        }
        None => {
            eprintln!("no command specified, try --help");
            std::process::exit(2);
        }
    }

    Ok(())
}
