//! Daemon wiring
//!
//! Owns the shared hardware gateway, the control-loop components, and the
//! DBus connection, and runs them until a termination signal arrives.

use anyhow::Context;
use log::{info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use zbus::{ConnectionBuilder, Interface};

use crate::config::{DaemonConfig, STATE_DIR};
use crate::controller::PowerController;
use crate::errors::Result;
use crate::handler::PowerEventHandler;
use crate::holds::ProfileHoldManager;
use crate::monitor::PowerMonitor;
use crate::profile::{GovernorOverride, PowerProfile};
use crate::service::{self, UPowerPowerProfiles};
use crate::sysfs::{SharedHardware, SysfsHardware};
use crate::{DBUS_OBJECT_PATH, DBUS_SERVICE_NAME};

/// Shared daemon context constructed once at startup and passed to every
/// component; there are no module-level singletons.
pub struct PowerDaemon {
    pub config: Arc<DaemonConfig>,
    pub controller: Arc<PowerController>,
    pub monitor: Arc<PowerMonitor>,
    pub handler: Arc<PowerEventHandler>,
    pub holds: Arc<ProfileHoldManager>,
    pub battery_aware: AtomicBool,
    connection: StdMutex<Option<zbus::Connection>>,
}

impl PowerDaemon {
    /// Create a daemon instance backed by the real sysfs gateway.
    pub fn new(config: DaemonConfig) -> Result<Arc<Self>> {
        let hw: SharedHardware = Arc::new(StdMutex::new(SysfsHardware::new()));
        Self::with_hardware(config, hw, PathBuf::from(STATE_DIR))
    }

    /// Create a daemon instance with an explicit gateway and state
    /// directory. Tests inject a mock gateway through this.
    pub fn with_hardware(
        config: DaemonConfig,
        hw: SharedHardware,
        state_dir: PathBuf,
    ) -> Result<Arc<Self>> {
        let base: PowerProfile = config.base_profile.parse()?;
        let config = Arc::new(config);

        let controller = Arc::new(PowerController::new(
            hw.clone(),
            config.clone(),
            state_dir,
        ));
        let monitor = Arc::new(PowerMonitor::new(
            hw,
            Duration::from_millis(config.poll_interval_ms),
        ));
        let handler = Arc::new(PowerEventHandler::new(
            controller.clone(),
            monitor.clone(),
            Duration::from_secs(config.turbo_debounce_secs),
        ));
        let holds = Arc::new(ProfileHoldManager::new(base));

        let daemon = Arc::new(Self {
            config,
            controller,
            monitor,
            handler,
            holds,
            battery_aware: AtomicBool::new(true),
            connection: StdMutex::new(None),
        });

        // Effective-profile changes that do not come through a DBus method
        // (disconnect cleanup in particular) still reach the hardware.
        {
            let controller = daemon.controller.clone();
            let handler = daemon.handler.clone();
            daemon.holds.set_on_change(move |profile| {
                service::apply_profile(&controller, &handler, profile);
            });
        }

        Ok(daemon)
    }

    pub fn set_connection(&self, connection: zbus::Connection) {
        *self.connection.lock().unwrap() = Some(connection);
    }

    pub fn connection(&self) -> Option<zbus::Connection> {
        self.connection.lock().unwrap().clone()
    }

    /// Emit PropertiesChanged for ActiveProfile on the served interface.
    pub async fn emit_active_profile_changed(&self) {
        let Some(connection) = self.connection() else {
            return;
        };

        let profile = self.holds.effective();
        let value = zvariant::Value::Str(zvariant::Str::from(profile.as_str()));
        let changed = HashMap::from_iter(std::iter::once(("ActiveProfile", &value)));
        let invalidated = &[];

        if let Ok(ctxt) = zbus::SignalContext::new(&connection, DBUS_OBJECT_PATH) {
            let _res = zbus::fdo::Properties::properties_changed(
                &ctxt,
                UPowerPowerProfiles::name(),
                &changed,
                invalidated,
            )
            .await;
        }
    }

    /// Run the daemon until SIGINT/SIGHUP/SIGTERM.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        info!("starting power management daemon");

        if let Some(threshold) = self.config.battery_charge_threshold {
            self.controller.apply_battery_threshold(threshold);
        }

        // Honor a governor override persisted by a previous run
        match self.controller.gov_override() {
            GovernorOverride::Performance => {
                info!("restoring persisted performance governor override");
                self.controller.set_performance_gov(true);
            }
            GovernorOverride::Powersave => {
                info!("restoring persisted powersave governor override");
                self.controller.set_powersave_gov(true);
            }
            GovernorOverride::Default => {}
        }

        self.handler.init();
        self.handler.register(&self.monitor);
        let monitor_handle = self.monitor.start();

        let connection = ConnectionBuilder::system()
            .context("failed to create zbus connection builder")?
            .name(DBUS_SERVICE_NAME)
            .context("unable to register name")?
            .serve_at(DBUS_OBJECT_PATH, UPowerPowerProfiles(self.clone()))
            .context("unable to serve")?
            .build()
            .await
            .context("unable to create system service for org.freedesktop.UPower.PowerProfiles")?;

        self.set_connection(connection.clone());
        info!("daemon started, listening on DBus");

        let watcher = tokio::spawn(service::watch_peer_disconnects(
            self.clone(),
            connection.clone(),
        ));

        signal_handling().await;

        // Teardown: no poller may keep reading and no timer may fire
        // against hardware access that is going away.
        watcher.abort();
        monitor_handle.stop().await;
        self.handler.shutdown();
        if let Err(e) = connection.release_name(DBUS_SERVICE_NAME).await {
            warn!("failed to release bus name: {}", e);
        }

        info!("daemon exited");
        Ok(())
    }
}

async fn signal_handling() {
    let mut int = signal(SignalKind::interrupt()).unwrap();
    let mut hup = signal(SignalKind::hangup()).unwrap();
    let mut term = signal(SignalKind::terminate()).unwrap();

    let sig = tokio::select! {
        _ = int.recv() => "SIGINT",
        _ = hup.recv() => "SIGHUP",
        _ = term.recv() => "SIGTERM"
    };

    info!("caught signal: {}", sig);
}
