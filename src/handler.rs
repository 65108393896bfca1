//! Decision engine
//!
//! Subscribes to the monitor's transition events and drives the
//! controller. Load-driven turbo changes are debounced so short spikes
//! never reach the hardware; thermal protection bypasses the debounce
//! and cuts turbo immediately.

use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::controller::PowerController;
use crate::monitor::{CpuLoadState, PowerMonitor, PowerState, TempState};

pub struct PowerEventHandler {
    controller: Arc<PowerController>,
    monitor: Arc<PowerMonitor>,
    debounce: Duration,
    last_power: Mutex<Option<PowerState>>,
    last_load: Mutex<Option<CpuLoadState>>,
    last_temp: Mutex<Option<TempState>>,
    debounce_task: Mutex<Option<JoinHandle<()>>>,
}

impl PowerEventHandler {
    pub fn new(
        controller: Arc<PowerController>,
        monitor: Arc<PowerMonitor>,
        debounce: Duration,
    ) -> Self {
        Self {
            controller,
            monitor,
            debounce,
            last_power: Mutex::new(None),
            last_load: Mutex::new(None),
            last_temp: Mutex::new(None),
            debounce_task: Mutex::new(None),
        }
    }

    /// Take one snapshot of all three dimensions and apply the matching
    /// modes immediately, without waiting for the first transition.
    pub fn init(&self) {
        match self.monitor.sys_power_source() {
            Ok(power) => {
                *self.last_power.lock().unwrap() = Some(power);
                self.apply_power_mode(power);
            }
            Err(e) => warn!("initial power source read failed: {}", e),
        }

        match self.monitor.sys_load_state() {
            Ok(load) => {
                *self.last_load.lock().unwrap() = Some(load);
                self.apply_load_policy(load);
            }
            Err(e) => warn!("initial load read failed: {}", e),
        }

        match self.monitor.sys_temp_state() {
            Ok(temp) => {
                *self.last_temp.lock().unwrap() = Some(temp);
                if temp == TempState::High && self.controller.turbo_enabled() {
                    warn!("CPU already hot at startup, disabling turbo");
                    self.controller.set_turbo(false);
                }
            }
            Err(e) => warn!("initial temperature read failed: {}", e),
        }
    }

    /// Register this handler's listeners with the monitor.
    pub fn register(self: &Arc<Self>, monitor: &PowerMonitor) {
        let handler = Arc::clone(self);
        monitor.listen_power_source(move |state| {
            handler.handle_power_source(state);
            Ok(())
        });

        let handler = Arc::clone(self);
        monitor.listen_sys_load(move |state| {
            handler.handle_sys_load(state);
            Ok(())
        });

        let handler = Arc::clone(self);
        monitor.listen_sys_temp(move |state| {
            handler.handle_sys_temp(state);
            Ok(())
        });
    }

    pub fn handle_power_source(&self, state: PowerState) {
        {
            let mut last = self.last_power.lock().unwrap();
            if *last == Some(state) {
                return;
            }
            *last = Some(state);
        }
        self.apply_power_mode(state);
    }

    /// Debounced turbo control. Each confirmed transition replaces any
    /// pending timer; only a state sustained for the full window reaches
    /// the hardware.
    pub fn handle_sys_load(&self, state: CpuLoadState) {
        {
            let mut last = self.last_load.lock().unwrap();
            if *last == Some(state) {
                return;
            }
            *last = Some(state);
        }

        let controller = Arc::clone(&self.controller);
        let delay = self.debounce;
        let mut pending = self.debounce_task.lock().unwrap();
        if let Some(prev) = pending.take() {
            prev.abort();
        }
        *pending = Some(tokio::spawn(async move {
            sleep(delay).await;
            // Decides on the state captured at scheduling time; the newest
            // transition always owns the only live timer.
            if state == CpuLoadState::High {
                controller.set_turbo(true);
            } else if controller.turbo_enabled() {
                controller.set_turbo(false);
            }
        }));
    }

    /// Thermal protection. Cuts turbo immediately when the CPU runs hot;
    /// never re-enables it on cooldown, that is the load handler's call.
    pub fn handle_sys_temp(&self, state: TempState) {
        {
            let mut last = self.last_temp.lock().unwrap();
            if *last == Some(state) {
                return;
            }
            *last = Some(state);
        }

        if state == TempState::High && self.controller.turbo_enabled() {
            warn!("CPU temperature high, disabling turbo");
            self.controller.set_turbo(false);
        }
    }

    /// Re-read the power source and apply the matching mode. Used when the
    /// daemon returns to automatic profile switching.
    pub fn reapply_power_mode(&self) {
        match self.monitor.sys_power_source() {
            Ok(power) => {
                *self.last_power.lock().unwrap() = Some(power);
                self.apply_power_mode(power);
            }
            Err(e) => warn!("power source read failed, mode not reapplied: {}", e),
        }
    }

    /// Cancel any outstanding debounce timer. Called on daemon shutdown so
    /// a timer cannot fire against torn-down hardware access.
    pub fn shutdown(&self) {
        if let Some(task) = self.debounce_task.lock().unwrap().take() {
            task.abort();
        }
    }

    fn apply_power_mode(&self, state: PowerState) {
        match state {
            PowerState::Ac => self.performance_mode(),
            PowerState::Battery => self.powersaving_mode(),
        }
    }

    fn apply_load_policy(&self, state: CpuLoadState) {
        if state == CpuLoadState::High {
            self.controller.set_turbo(true);
        } else if self.controller.turbo_enabled() {
            self.controller.set_turbo(false);
        }
    }

    /// AC mode: each actuation is independent; one failing knob never
    /// prevents the others from being applied.
    fn performance_mode(&self) {
        info!("on AC power, applying performance mode");
        let results = [
            self.controller.set_performance_gov(false),
            self.controller.set_frequencies(PowerState::Ac),
            self.controller.set_energy_perf_bias(PowerState::Ac),
            self.controller.set_platform_profile(PowerState::Ac),
        ];
        let skipped = results.iter().filter(|ok| !**ok).count();
        if skipped > 0 {
            debug!("performance mode applied, {} actuations skipped", skipped);
        }
    }

    fn powersaving_mode(&self) {
        info!("on battery power, applying powersaving mode");
        let results = [
            self.controller.set_powersave_gov(false),
            self.controller.set_frequencies(PowerState::Battery),
            self.controller.set_energy_perf_bias(PowerState::Battery),
            self.controller.set_platform_profile(PowerState::Battery),
        ];
        let skipped = results.iter().filter(|ok| !**ok).count();
        if skipped > 0 {
            debug!("powersaving mode applied, {} actuations skipped", skipped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::sysfs::mock::MockHardware;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static TEST_DIR_SEQ: AtomicUsize = AtomicUsize::new(0);

    fn temp_state_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "power-handler-test-{}-{}",
            std::process::id(),
            TEST_DIR_SEQ.fetch_add(1, Ordering::SeqCst)
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn handler_with(
        mock_setup: impl FnOnce(&mut MockHardware),
        debounce: Duration,
    ) -> (
        std::sync::Arc<std::sync::Mutex<MockHardware>>,
        Arc<PowerEventHandler>,
    ) {
        let mut mock = MockHardware::new();
        mock_setup(&mut mock);
        let (mock, hw) = mock.shared();
        let config = Arc::new(DaemonConfig::default());
        let controller = Arc::new(PowerController::new(
            hw.clone(),
            config,
            temp_state_dir(),
        ));
        let monitor = Arc::new(PowerMonitor::new(hw, Duration::from_millis(10)));
        let handler = Arc::new(PowerEventHandler::new(controller, monitor, debounce));
        (mock, handler)
    }

    #[tokio::test]
    async fn test_debounce_suppresses_flapping() {
        let (mock, handler) = handler_with(|_| {}, Duration::from_millis(50));

        handler.handle_sys_load(CpuLoadState::High);
        sleep(Duration::from_millis(10)).await;
        handler.handle_sys_load(CpuLoadState::Normal);
        sleep(Duration::from_millis(10)).await;
        handler.handle_sys_load(CpuLoadState::High);

        // Flapping inside the window: no actuation yet
        sleep(Duration::from_millis(20)).await;
        assert_eq!(mock.lock().unwrap().turbo_writes, 0);

        // The last scheduled state survives the window: exactly one write
        sleep(Duration::from_millis(80)).await;
        let mock = mock.lock().unwrap();
        assert_eq!(mock.turbo_writes, 1);
        assert!(mock.turbo);
    }

    #[tokio::test]
    async fn test_debounce_normal_with_turbo_off_writes_nothing() {
        let (mock, handler) = handler_with(|_| {}, Duration::from_millis(20));

        handler.handle_sys_load(CpuLoadState::Normal);
        sleep(Duration::from_millis(60)).await;
        assert_eq!(mock.lock().unwrap().turbo_writes, 0);
    }

    #[tokio::test]
    async fn test_sustained_states_actuate_once_each() {
        let (mock, handler) = handler_with(|_| {}, Duration::from_millis(20));

        handler.handle_sys_load(CpuLoadState::High);
        sleep(Duration::from_millis(60)).await;
        assert_eq!(mock.lock().unwrap().turbo_writes, 1);
        assert!(mock.lock().unwrap().turbo);

        handler.handle_sys_load(CpuLoadState::Normal);
        sleep(Duration::from_millis(60)).await;
        assert_eq!(mock.lock().unwrap().turbo_writes, 2);
        assert!(!mock.lock().unwrap().turbo);

        // Repeated identical state is a no-op
        handler.handle_sys_load(CpuLoadState::Normal);
        sleep(Duration::from_millis(60)).await;
        assert_eq!(mock.lock().unwrap().turbo_writes, 2);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_debounce() {
        let (mock, handler) = handler_with(|_| {}, Duration::from_millis(30));

        handler.handle_sys_load(CpuLoadState::High);
        handler.shutdown();
        sleep(Duration::from_millis(80)).await;
        assert_eq!(mock.lock().unwrap().turbo_writes, 0);
    }

    #[test]
    fn test_temp_high_disables_turbo_immediately() {
        let (mock, handler) = handler_with(|m| m.turbo = true, Duration::from_secs(10));

        handler.handle_sys_temp(TempState::High);
        let writes = mock.lock().unwrap().turbo_writes;
        assert_eq!(writes, 1);
        assert!(!mock.lock().unwrap().turbo);

        // Unchanged state: no further action
        handler.handle_sys_temp(TempState::High);
        assert_eq!(mock.lock().unwrap().turbo_writes, 1);
    }

    #[test]
    fn test_temp_high_with_turbo_off_is_silent() {
        let (mock, handler) = handler_with(|_| {}, Duration::from_secs(10));
        handler.handle_sys_temp(TempState::High);
        assert_eq!(mock.lock().unwrap().turbo_writes, 0);
    }

    #[test]
    fn test_temp_drop_never_reenables_turbo() {
        let (mock, handler) = handler_with(|m| m.turbo = true, Duration::from_secs(10));

        handler.handle_sys_temp(TempState::High);
        assert!(!mock.lock().unwrap().turbo);

        handler.handle_sys_temp(TempState::Normal);
        handler.handle_sys_temp(TempState::Low);
        let mock = mock.lock().unwrap();
        assert_eq!(mock.turbo_writes, 1);
        assert!(!mock.turbo);
    }

    #[test]
    fn test_power_source_transition_applies_mode() {
        let (mock, handler) =
            handler_with(|m| m.governor = "performance".to_string(), Duration::from_secs(10));

        handler.handle_power_source(PowerState::Battery);
        {
            let mock = mock.lock().unwrap();
            assert_eq!(mock.governor, "powersave");
            assert_eq!(mock.energy_perf_bias.as_deref(), Some("balance_power"));
            assert_eq!(mock.platform_profile.as_deref(), Some("low-power"));
        }

        // Same state again: nothing re-applied
        let writes_before = mock.lock().unwrap().governor_writes;
        handler.handle_power_source(PowerState::Battery);
        assert_eq!(mock.lock().unwrap().governor_writes, writes_before);

        handler.handle_power_source(PowerState::Ac);
        let mock = mock.lock().unwrap();
        assert_eq!(mock.governor, "performance");
        assert_eq!(
            mock.energy_perf_bias.as_deref(),
            Some("balance_performance")
        );
    }

    #[test]
    fn test_init_applies_snapshot() {
        let (mock, handler) = handler_with(
            |m| {
                m.governor = "powersave".to_string();
                m.usage = 50.0;
            },
            Duration::from_secs(10),
        );

        handler.init();
        let mock = mock.lock().unwrap();
        // AC snapshot: performance governor; high load: turbo on without debounce
        assert_eq!(mock.governor, "performance");
        assert!(mock.turbo);
        assert_eq!(mock.turbo_writes, 1);
    }
}
