//! System state monitoring
//!
//! Three independent polling loops watch the power source, CPU load, and
//! CPU temperature, and notify registered listeners on state transitions
//! only. Each dimension keeps its own last-seen state; a repeated
//! identical reading never reaches a listener.

use log::{debug, error};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::errors::Result;
use crate::sysfs::SharedHardware;

/// Current power source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Ac,
    Battery,
}

/// Classified CPU load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuLoadState {
    Low,
    Normal,
    High,
}

/// Classified CPU temperature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempState {
    Low,
    Normal,
    High,
}

/// Which monitored dimension an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverEvent {
    PowerSource,
    SysLoad,
    SysTemp,
}

impl fmt::Display for ObserverEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObserverEvent::PowerSource => f.write_str("power source"),
            ObserverEvent::SysLoad => f.write_str("system load"),
            ObserverEvent::SysTemp => f.write_str("system temperature"),
        }
    }
}

// Load classification thresholds
const LOW_USAGE_PERCENT: f32 = 10.0;
const HIGH_USAGE_PERCENT: f32 = 20.0;
const LOW_LOAD_THRESHOLD: f32 = 10.0;
const HIGH_LOAD_THRESHOLD: f32 = 20.0;

// Temperature classification thresholds, degrees Celsius
const TEMP_NORMAL_DEGREES: f32 = 60.0;
const TEMP_HIGH_DEGREES: f32 = 85.0;

/// Classify CPU load from usage percent and the 1-minute load average.
pub fn classify_load(usage_percent: f32, load_average: f32) -> CpuLoadState {
    if usage_percent >= HIGH_USAGE_PERCENT || load_average >= HIGH_LOAD_THRESHOLD {
        CpuLoadState::High
    } else if usage_percent < LOW_USAGE_PERCENT && load_average <= LOW_LOAD_THRESHOLD {
        CpuLoadState::Low
    } else {
        CpuLoadState::Normal
    }
}

/// Classify the averaged core temperature.
pub fn classify_temp(average_celsius: f32) -> TempState {
    if average_celsius >= TEMP_HIGH_DEGREES {
        TempState::High
    } else if average_celsius >= TEMP_NORMAL_DEGREES {
        TempState::Normal
    } else {
        TempState::Low
    }
}

/// Identifier returned by `listen_*`, used to unregister the listener.
pub type ListenerId = usize;

type Callback<T> = Arc<dyn Fn(T) -> Result<()> + Send + Sync>;

/// Handle for the running polling tasks.
///
/// Dropping the handle without calling `stop` leaves the pollers running
/// until the runtime shuts down; `stop` requests cancellation and waits
/// for all three tasks to finish.
pub struct MonitorHandle {
    stop: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl MonitorHandle {
    pub async fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

/// Polls the hardware and delivers per-dimension transition events.
pub struct PowerMonitor {
    hw: SharedHardware,
    interval: Duration,
    next_listener_id: AtomicUsize,
    power_listeners: Mutex<Vec<(ListenerId, Callback<PowerState>)>>,
    load_listeners: Mutex<Vec<(ListenerId, Callback<CpuLoadState>)>>,
    temp_listeners: Mutex<Vec<(ListenerId, Callback<TempState>)>>,
}

impl PowerMonitor {
    pub fn new(hw: SharedHardware, interval: Duration) -> Self {
        Self {
            hw,
            interval,
            next_listener_id: AtomicUsize::new(1),
            power_listeners: Mutex::new(Vec::new()),
            load_listeners: Mutex::new(Vec::new()),
            temp_listeners: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot query: current power source.
    pub fn sys_power_source(&self) -> Result<PowerState> {
        Ok(self.hw.lock().unwrap().read_power_state()?)
    }

    /// Snapshot query: current classified CPU load.
    pub fn sys_load_state(&self) -> Result<CpuLoadState> {
        let mut hw = self.hw.lock().unwrap();
        let usage = hw.read_cpu_usage()?;
        let load = hw.read_load_average()?;
        Ok(classify_load(usage, load))
    }

    /// Snapshot query: current classified CPU temperature.
    pub fn sys_temp_state(&self) -> Result<TempState> {
        let temps = self.hw.lock().unwrap().read_core_temperatures()?;
        let avg = temps.iter().sum::<f32>() / temps.len() as f32;
        Ok(classify_temp(avg))
    }

    pub fn listen_power_source(
        &self,
        callback: impl Fn(PowerState) -> Result<()> + Send + Sync + 'static,
    ) -> ListenerId {
        Self::register(&self.power_listeners, &self.next_listener_id, callback)
    }

    pub fn listen_sys_load(
        &self,
        callback: impl Fn(CpuLoadState) -> Result<()> + Send + Sync + 'static,
    ) -> ListenerId {
        Self::register(&self.load_listeners, &self.next_listener_id, callback)
    }

    pub fn listen_sys_temp(
        &self,
        callback: impl Fn(TempState) -> Result<()> + Send + Sync + 'static,
    ) -> ListenerId {
        Self::register(&self.temp_listeners, &self.next_listener_id, callback)
    }

    pub fn unlisten_power_source(&self, id: ListenerId) -> bool {
        Self::unregister(&self.power_listeners, id)
    }

    pub fn unlisten_sys_load(&self, id: ListenerId) -> bool {
        Self::unregister(&self.load_listeners, id)
    }

    pub fn unlisten_sys_temp(&self, id: ListenerId) -> bool {
        Self::unregister(&self.temp_listeners, id)
    }

    fn register<T>(
        listeners: &Mutex<Vec<(ListenerId, Callback<T>)>>,
        next_id: &AtomicUsize,
        callback: impl Fn(T) -> Result<()> + Send + Sync + 'static,
    ) -> ListenerId {
        let id = next_id.fetch_add(1, Ordering::SeqCst);
        listeners.lock().unwrap().push((id, Arc::new(callback)));
        id
    }

    fn unregister<T>(listeners: &Mutex<Vec<(ListenerId, Callback<T>)>>, id: ListenerId) -> bool {
        let mut listeners = listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Invoke every listener of one dimension with the new state.
    ///
    /// Callbacks run outside the registry lock so a listener may register
    /// or unregister from within its own invocation. A failing listener is
    /// logged and does not suppress the remaining ones.
    fn notify<T: Copy + fmt::Debug>(
        event: ObserverEvent,
        listeners: &Mutex<Vec<(ListenerId, Callback<T>)>>,
        state: T,
    ) {
        let snapshot: Vec<(ListenerId, Callback<T>)> = listeners.lock().unwrap().clone();
        for (id, callback) in snapshot {
            if let Err(err) = callback(state) {
                error!(
                    "{} listener {} failed on {:?}: {}",
                    event, id, state, err
                );
            }
        }
    }

    fn notify_power(&self, state: PowerState) {
        Self::notify(ObserverEvent::PowerSource, &self.power_listeners, state);
    }

    fn notify_load(&self, state: CpuLoadState) {
        Self::notify(ObserverEvent::SysLoad, &self.load_listeners, state);
    }

    fn notify_temp(&self, state: TempState) {
        Self::notify(ObserverEvent::SysTemp, &self.temp_listeners, state);
    }

    /// Start the three polling loops. The first read of each dimension
    /// primes the last-seen state without notifying; initial actuation is
    /// the event handler's `init` responsibility.
    pub fn start(self: &Arc<Self>) -> MonitorHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let tasks = vec![
            self.spawn_poller(
                stop.clone(),
                ObserverEvent::PowerSource,
                PowerMonitor::sys_power_source,
                PowerMonitor::notify_power,
            ),
            self.spawn_poller(
                stop.clone(),
                ObserverEvent::SysLoad,
                PowerMonitor::sys_load_state,
                PowerMonitor::notify_load,
            ),
            self.spawn_poller(
                stop.clone(),
                ObserverEvent::SysTemp,
                PowerMonitor::sys_temp_state,
                PowerMonitor::notify_temp,
            ),
        ];

        MonitorHandle { stop, tasks }
    }

    fn spawn_poller<T>(
        self: &Arc<Self>,
        stop: Arc<AtomicBool>,
        event: ObserverEvent,
        read: fn(&PowerMonitor) -> Result<T>,
        notify: fn(&PowerMonitor, T),
    ) -> JoinHandle<()>
    where
        T: PartialEq + Copy + fmt::Debug + Send + 'static,
    {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut last = match read(&monitor) {
                Ok(state) => Some(state),
                Err(err) => {
                    debug!("{}: initial read failed: {}", event, err);
                    None
                }
            };

            while !stop.load(Ordering::SeqCst) {
                sleep(monitor.interval).await;
                if stop.load(Ordering::SeqCst) {
                    break;
                }

                match read(&monitor) {
                    Ok(state) => {
                        if last != Some(state) {
                            debug!("{} transition: {:?} -> {:?}", event, last, state);
                            last = Some(state);
                            notify(&monitor, state);
                        }
                    }
                    // Transient read hiccup: keep the previous state and
                    // retry next cycle.
                    Err(err) => debug!("{}: read failed, state retained: {}", event, err),
                }
            }

            debug!("{} poller stopped", event);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysfs::mock::MockHardware;

    #[test]
    fn test_classify_load_table() {
        assert_eq!(classify_load(5.0, 5.0), CpuLoadState::Low);
        assert_eq!(classify_load(25.0, 0.0), CpuLoadState::High);
        assert_eq!(classify_load(25.0, 50.0), CpuLoadState::High);
        assert_eq!(classify_load(15.0, 12.0), CpuLoadState::Normal);
        // Low usage but a high run queue still counts as high load
        assert_eq!(classify_load(5.0, 25.0), CpuLoadState::High);
        // Low usage with a moderate run queue is not low
        assert_eq!(classify_load(5.0, 12.0), CpuLoadState::Normal);
    }

    #[test]
    fn test_classify_load_boundaries() {
        assert_eq!(classify_load(10.0, 0.0), CpuLoadState::Normal);
        assert_eq!(classify_load(20.0, 0.0), CpuLoadState::High);
        assert_eq!(classify_load(0.0, 10.0), CpuLoadState::Low);
        assert_eq!(classify_load(0.0, 20.0), CpuLoadState::High);
    }

    #[test]
    fn test_classify_temp_table() {
        assert_eq!(classify_temp(45.0), TempState::Low);
        assert_eq!(classify_temp(60.0), TempState::Normal);
        assert_eq!(classify_temp(84.9), TempState::Normal);
        assert_eq!(classify_temp(85.0), TempState::High);
        assert_eq!(classify_temp(90.0), TempState::High);
    }

    #[test]
    fn test_snapshot_queries() {
        let (mock, hw) = MockHardware::new().shared();
        let monitor = PowerMonitor::new(hw, Duration::from_millis(10));

        assert_eq!(monitor.sys_power_source().unwrap(), PowerState::Ac);
        assert_eq!(monitor.sys_load_state().unwrap(), CpuLoadState::Low);
        assert_eq!(monitor.sys_temp_state().unwrap(), TempState::Low);

        mock.lock().unwrap().temps = vec![88.0, 92.0];
        assert_eq!(monitor.sys_temp_state().unwrap(), TempState::High);
    }

    #[tokio::test]
    async fn test_transition_only_delivery() {
        let (mock, hw) = MockHardware::new().shared();
        let monitor = Arc::new(PowerMonitor::new(hw, Duration::from_millis(10)));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        monitor.listen_power_source(move |state| {
            sink.lock().unwrap().push(state);
            Ok(())
        });

        let handle = monitor.start();
        // Several poll cycles with no change: nothing delivered
        sleep(Duration::from_millis(60)).await;
        assert!(seen.lock().unwrap().is_empty());

        mock.lock().unwrap().power = PowerState::Battery;
        sleep(Duration::from_millis(80)).await;
        handle.stop().await;

        // One transition, one notification, despite many identical reads
        assert_eq!(*seen.lock().unwrap(), vec![PowerState::Battery]);
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_block_others() {
        let (mock, hw) = MockHardware::new().shared();
        let monitor = Arc::new(PowerMonitor::new(hw, Duration::from_millis(10)));

        monitor.listen_sys_load(|_| {
            Err(crate::errors::PowerError::Unknown("listener exploded".to_string()))
        });
        let count = Arc::new(Mutex::new(0));
        let sink = count.clone();
        monitor.listen_sys_load(move |_| {
            *sink.lock().unwrap() += 1;
            Ok(())
        });

        let handle = monitor.start();
        mock.lock().unwrap().usage = 50.0;
        sleep(Duration::from_millis(80)).await;
        mock.lock().unwrap().usage = 0.0;
        sleep(Duration::from_millis(80)).await;
        handle.stop().await;

        assert_eq!(*count.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_read_failure_retains_state() {
        let (mock, hw) = MockHardware::new().shared();
        let monitor = Arc::new(PowerMonitor::new(hw, Duration::from_millis(10)));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        monitor.listen_sys_temp(move |state| {
            sink.lock().unwrap().push(state);
            Ok(())
        });

        let handle = monitor.start();
        sleep(Duration::from_millis(40)).await;
        // Sensor vanishes for a few cycles: no notification, loop survives
        mock.lock().unwrap().temps = vec![];
        sleep(Duration::from_millis(40)).await;
        assert!(seen.lock().unwrap().is_empty());

        // Sensor returns with a new state: exactly one transition delivered
        mock.lock().unwrap().temps = vec![90.0];
        sleep(Duration::from_millis(80)).await;
        handle.stop().await;

        assert_eq!(*seen.lock().unwrap(), vec![TempState::High]);
    }

    #[tokio::test]
    async fn test_unlisten_stops_delivery() {
        let (mock, hw) = MockHardware::new().shared();
        let monitor = Arc::new(PowerMonitor::new(hw, Duration::from_millis(10)));

        let count = Arc::new(Mutex::new(0));
        let sink = count.clone();
        let id = monitor.listen_power_source(move |_| {
            *sink.lock().unwrap() += 1;
            Ok(())
        });
        assert!(monitor.unlisten_power_source(id));
        assert!(!monitor.unlisten_power_source(id));

        let handle = monitor.start();
        mock.lock().unwrap().power = PowerState::Battery;
        sleep(Duration::from_millis(60)).await;
        handle.stop().await;

        assert_eq!(*count.lock().unwrap(), 0);
    }
}
