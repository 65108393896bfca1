//! Command line argument parsing for the power management daemon

use clap::{Parser, Subcommand};

/// Laptop Power Management Daemon
///
/// Automatic governor/turbo/frequency control with an
/// org.freedesktop.UPower.PowerProfiles-compatible DBus interface.
#[derive(Parser)]
#[command(name = "power-profile-daemon")]
#[command(about = "Laptop power management daemon")]
#[command(version)]
pub struct Args {
    /// Increase verbosity (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Path to the daemon configuration file
    #[arg(long)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the daemon
    Daemon,
    /// Power profile management
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },
}

#[derive(Subcommand)]
pub enum ProfileCommands {
    /// Get the active power profile
    Get,
    /// Set the active power profile
    Set {
        /// One of power-saver, balanced, performance
        profile: String,
    },
    /// List active profile holds
    Holds,
    /// Hold a profile until interrupted (Ctrl+C releases it)
    Hold {
        /// One of power-saver, balanced, performance
        profile: String,
        /// Reason for the hold
        #[arg(default_value = "held from command line")]
        reason: String,
        /// Application identifier reported to the daemon
        #[arg(default_value = "power-profile-daemon-cli")]
        application_id: String,
    },
    /// Release a profile hold by cookie
    Release {
        /// Cookie returned by a previous hold
        cookie: u32,
    },
}
