//! DBus client for the served power-profiles interface
//!
//! Backs the `profile ...` CLI subcommands, mostly useful for scripting
//! and for poking the daemon without powerprofilesctl installed.

use log::debug;
use std::collections::HashMap;
use zbus::Connection;
use zvariant::OwnedValue;

use crate::args::ProfileCommands;
use crate::errors::Result;

#[zbus::dbus_proxy(
    interface = "org.freedesktop.UPower.PowerProfiles",
    default_service = "org.freedesktop.UPower.PowerProfiles",
    default_path = "/org/freedesktop/UPower/PowerProfiles"
)]
trait PowerProfiles {
    /// HoldProfile method
    fn hold_profile(&self, profile: &str, reason: &str, application_id: &str)
        -> zbus::Result<u32>;

    /// ReleaseProfile method
    fn release_profile(&self, cookie: u32) -> zbus::Result<()>;

    /// ActiveProfile property
    #[dbus_proxy(property)]
    fn active_profile(&self) -> zbus::Result<String>;

    #[dbus_proxy(property)]
    fn set_active_profile(&self, profile: &str) -> zbus::Result<()>;

    /// ActiveProfileHolds property
    #[dbus_proxy(property)]
    fn active_profile_holds(&self) -> zbus::Result<Vec<HashMap<String, OwnedValue>>>;

    /// Version property
    #[dbus_proxy(property)]
    fn version(&self) -> zbus::Result<String>;

    /// ProfileReleased signal
    #[dbus_proxy(signal)]
    fn profile_released(&self, cookie: u32) -> zbus::Result<()>;
}

/// Client for communicating with the power management daemon
pub struct PowerProfilesClient {
    proxy: PowerProfilesProxy<'static>,
}

impl PowerProfilesClient {
    pub async fn new() -> Result<Self> {
        let connection = Connection::system().await?;
        let proxy = PowerProfilesProxy::new(&connection).await?;
        Ok(Self { proxy })
    }

    pub async fn handle_command(&self, command: ProfileCommands) -> Result<()> {
        match command {
            ProfileCommands::Get => {
                println!("{}", self.proxy.active_profile().await?);
            }
            ProfileCommands::Set { profile } => {
                debug!("setting active profile to {}", profile);
                self.proxy.set_active_profile(&profile).await?;
                println!("active profile set to {}", profile);
            }
            ProfileCommands::Holds => {
                let holds = self.proxy.active_profile_holds().await?;
                if holds.is_empty() {
                    println!("no active profile holds");
                }
                for hold in holds {
                    println!(
                        "{} held by {} ({})",
                        string_field(&hold, "Profile"),
                        string_field(&hold, "ApplicationId"),
                        string_field(&hold, "Reason"),
                    );
                }
            }
            ProfileCommands::Hold {
                profile,
                reason,
                application_id,
            } => {
                let cookie = self
                    .proxy
                    .hold_profile(&profile, &reason, &application_id)
                    .await?;
                println!(
                    "holding profile {} (cookie {}), press Ctrl+C to release",
                    profile, cookie
                );
                tokio::signal::ctrl_c().await?;
                self.proxy.release_profile(cookie).await?;
                println!("released");
            }
            ProfileCommands::Release { cookie } => {
                self.proxy.release_profile(cookie).await?;
                println!("released hold {}", cookie);
            }
        }
        Ok(())
    }
}

fn string_field(map: &HashMap<String, OwnedValue>, key: &str) -> String {
    map.get(key)
        .and_then(|value| String::try_from(value.clone()).ok())
        .unwrap_or_default()
}
