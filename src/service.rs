//! org.freedesktop.UPower.PowerProfiles compatibility interface
//!
//! Serves the exact member surface desktop environments and
//! `powerprofilesctl` expect, backed by the hold registry and the same
//! actuation primitives the automatic control loop uses.

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use zbus::{dbus_interface, SignalContext};

use crate::controller::PowerController;
use crate::daemon::PowerDaemon;
use crate::errors::zbus_error_from_display;
use crate::handler::PowerEventHandler;
use crate::profile::{GovernorOverride, PowerProfile};
use crate::DBUS_OBJECT_PATH;

/// Actuate a power profile.
///
/// The governor override is written before the turbo policy; if the turbo
/// write then fails the override stays in place and the failure is only
/// logged. Balanced returns the daemon to automatic AC/battery switching
/// and leaves turbo to the load handler.
pub(crate) fn apply_profile(
    controller: &PowerController,
    handler: &PowerEventHandler,
    profile: PowerProfile,
) {
    info!("applying power profile {}", profile);
    match profile {
        PowerProfile::Performance => {
            controller.set_gov_override(GovernorOverride::Performance);
            controller.set_performance_gov(true);
            controller.set_turbo(true);
        }
        PowerProfile::PowerSaver => {
            controller.set_gov_override(GovernorOverride::Powersave);
            controller.set_powersave_gov(true);
            controller.set_turbo(false);
        }
        PowerProfile::Balanced => {
            controller.set_gov_override(GovernorOverride::Default);
            handler.reapply_power_mode();
        }
    }
}

pub struct UPowerPowerProfiles(pub Arc<PowerDaemon>);

#[dbus_interface(name = "org.freedesktop.UPower.PowerProfiles")]
impl UPowerPowerProfiles {
    #[dbus_interface(out_args("cookie"))]
    async fn hold_profile(
        &mut self,
        profile: &str,
        reason: &str,
        application_id: &str,
        #[zbus(header)] header: zbus::MessageHeader<'_>,
    ) -> zbus::fdo::Result<u32> {
        let sender = header
            .sender()
            .ok()
            .flatten()
            .map(|s| s.to_string())
            .unwrap_or_default();

        let cookie = self
            .0
            .holds
            .hold_profile(profile, reason, application_id, &sender)
            .map_err(zbus_error_from_display)?;

        // Apply right away instead of waiting for the async change callback
        let effective = self.0.holds.effective();
        apply_profile(&self.0.controller, &self.0.handler, effective);
        self.0.emit_active_profile_changed().await;

        Ok(cookie)
    }

    async fn release_profile(
        &mut self,
        cookie: u32,
        #[zbus(signal_context)] ctxt: SignalContext<'_>,
    ) -> zbus::fdo::Result<()> {
        if !self.0.holds.release_profile(cookie) {
            warn!("release of unknown profile hold cookie {}", cookie);
            return Ok(());
        }

        // With no holds left this resolves to the base profile
        let effective = self.0.holds.effective();
        apply_profile(&self.0.controller, &self.0.handler, effective);

        if let Err(e) = Self::profile_released(&ctxt, cookie).await {
            warn!("failed to emit ProfileReleased: {}", e);
        }
        self.0.emit_active_profile_changed().await;
        Ok(())
    }

    /// Accepted for protocol compatibility; actions are not implemented.
    async fn set_action_enabled(&self, action: &str, enabled: bool) {
        debug!("SetActionEnabled({}, {}) ignored", action, enabled);
    }

    #[dbus_interface(signal)]
    async fn profile_released(ctxt: &SignalContext<'_>, cookie: u32) -> zbus::Result<()>;

    #[dbus_interface(property)]
    async fn active_profile(&self) -> String {
        self.0.holds.effective().to_string()
    }

    /// Applies the requested profile directly, bypassing the hold
    /// mechanism. Existing holds stay registered and untouched.
    #[dbus_interface(property)]
    async fn set_active_profile(&mut self, profile: &str) {
        let profile = match profile.parse::<PowerProfile>() {
            Ok(profile) => profile,
            Err(e) => {
                warn!("rejecting ActiveProfile write: {}", e);
                return;
            }
        };

        self.0.holds.set_base(profile);
        apply_profile(&self.0.controller, &self.0.handler, profile);
        self.0.emit_active_profile_changed().await;
    }

    #[dbus_interface(property)]
    async fn profiles(&self) -> Vec<HashMap<&'static str, zvariant::Value>> {
        ["power-saver", "balanced", "performance"]
            .into_iter()
            .map(|profile| {
                let mut map = HashMap::new();
                map.insert("Profile", zvariant::Value::Str(zvariant::Str::from(profile)));
                map.insert("CpuDriver", zvariant::Value::Str(zvariant::Str::from("multiple")));
                map.insert("Driver", zvariant::Value::Str(zvariant::Str::from("multiple")));
                map
            })
            .collect()
    }

    #[dbus_interface(property)]
    async fn performance_inhibited(&self) -> &str {
        ""
    }

    #[dbus_interface(property)]
    async fn performance_degraded(&self) -> &str {
        ""
    }

    #[dbus_interface(property)]
    async fn actions(&self) -> Vec<String> {
        vec![]
    }

    #[dbus_interface(property)]
    async fn actions_info(&self) -> Vec<HashMap<String, zvariant::Value>> {
        Vec::new()
    }

    #[dbus_interface(property)]
    async fn active_profile_holds(&self) -> Vec<HashMap<&'static str, zvariant::Value>> {
        self.0
            .holds
            .get_active_holds()
            .into_iter()
            .map(|hold| {
                let mut map = HashMap::new();
                map.insert(
                    "ApplicationId",
                    zvariant::Value::Str(zvariant::Str::from(hold.application_id)),
                );
                map.insert(
                    "Profile",
                    zvariant::Value::Str(zvariant::Str::from(hold.profile.as_str())),
                );
                map.insert(
                    "Reason",
                    zvariant::Value::Str(zvariant::Str::from(hold.reason)),
                );
                map
            })
            .collect()
    }

    #[dbus_interface(property)]
    async fn version(&self) -> String {
        format!("power-profile-daemon {}", env!("CARGO_PKG_VERSION"))
    }

    #[dbus_interface(property)]
    async fn battery_aware(&self) -> bool {
        self.0.battery_aware.load(Ordering::SeqCst)
    }

    /// Stored and reported; carries no behavioral effect.
    #[dbus_interface(property)]
    async fn set_battery_aware(&mut self, value: bool) {
        self.0.battery_aware.store(value, Ordering::SeqCst);
    }
}

/// Watch the bus for departing peers and drop their holds.
///
/// Every hold records its caller's unique bus name; when that name loses
/// its owner the holds are cleaned up in one sweep, a ProfileReleased
/// signal is emitted per dropped cookie, and the effective profile is
/// re-applied.
pub async fn watch_peer_disconnects(daemon: Arc<PowerDaemon>, connection: zbus::Connection) {
    let proxy = match zbus::fdo::DBusProxy::new(&connection).await {
        Ok(proxy) => proxy,
        Err(e) => {
            error!("cannot watch bus name changes: {}", e);
            return;
        }
    };
    let mut stream = match proxy.receive_name_owner_changed().await {
        Ok(stream) => stream,
        Err(e) => {
            error!("cannot subscribe to NameOwnerChanged: {}", e);
            return;
        }
    };

    while let Some(signal) = stream.next().await {
        let Ok(args) = signal.args() else { continue };
        let name = args.name().to_string();
        // Only unique names vanishing for good are interesting
        if !name.starts_with(':') || args.new_owner().is_some() {
            continue;
        }
        if !daemon.holds.has_sender_holds(&name) {
            continue;
        }

        info!("profile holder {} disconnected, releasing its holds", name);
        // Actuation happens through the manager's change callback; this
        // task only handles the protocol side.
        let released = daemon.holds.cleanup_sender_holds(&name);

        match SignalContext::new(&connection, DBUS_OBJECT_PATH) {
            Ok(ctxt) => {
                for cookie in released {
                    if let Err(e) = UPowerPowerProfiles::profile_released(&ctxt, cookie).await {
                        warn!("failed to emit ProfileReleased({}): {}", cookie, e);
                    }
                }
            }
            Err(e) => warn!("no signal context for ProfileReleased: {}", e),
        }
        daemon.emit_active_profile_changed().await;
    }
}
