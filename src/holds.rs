//! Profile hold registry
//!
//! External applications pin a power profile by taking a hold; the
//! registry resolves the effective profile among all live holds. A single
//! mutex guards every read-modify-write sequence; the change callback is
//! dispatched on its own thread after the lock is released, so a callback
//! may safely call back into the manager.

use log::{debug, info};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::errors::Result;
use crate::profile::PowerProfile;

/// A single live hold. Owned exclusively by the manager.
#[derive(Debug, Clone)]
pub struct ProfileHold {
    pub cookie: u32,
    pub profile: PowerProfile,
    pub reason: String,
    pub application_id: String,
    /// Opaque bus identity of the caller, used for disconnect cleanup.
    pub sender: String,
    pub since: SystemTime,
}

type ChangeCallback = Arc<dyn Fn(PowerProfile) + Send + Sync>;

struct Registry {
    holds: Vec<ProfileHold>,
    next_cookie: u32,
    last_notified: Option<PowerProfile>,
}

pub struct ProfileHoldManager {
    registry: Mutex<Registry>,
    base: Mutex<PowerProfile>,
    on_change: Mutex<Option<ChangeCallback>>,
}

impl ProfileHoldManager {
    pub fn new(base: PowerProfile) -> Self {
        Self {
            registry: Mutex::new(Registry {
                holds: Vec::new(),
                next_cookie: 1,
                last_notified: Some(base),
            }),
            base: Mutex::new(base),
            on_change: Mutex::new(None),
        }
    }

    /// Install the callback invoked when the effective profile changes.
    pub fn set_on_change(&self, callback: impl Fn(PowerProfile) + Send + Sync + 'static) {
        *self.on_change.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Profile applied when no hold is active.
    pub fn base(&self) -> PowerProfile {
        *self.base.lock().unwrap()
    }

    pub fn set_base(&self, profile: PowerProfile) {
        *self.base.lock().unwrap() = profile;
    }

    /// Register a hold. Cookies start at 1 and strictly increase for the
    /// lifetime of the daemon; a released cookie is never handed out again.
    pub fn hold_profile(
        &self,
        profile: &str,
        reason: &str,
        application_id: &str,
        sender: &str,
    ) -> Result<u32> {
        let profile: PowerProfile = profile.parse()?;
        let base = self.base();

        let (cookie, changed) = {
            let mut registry = self.registry.lock().unwrap();
            let cookie = registry.next_cookie;
            registry.next_cookie += 1;
            registry.holds.push(ProfileHold {
                cookie,
                profile,
                reason: reason.to_string(),
                application_id: application_id.to_string(),
                sender: sender.to_string(),
                since: SystemTime::now(),
            });
            (cookie, Self::recompute(&mut registry, base))
        };

        info!(
            "profile hold {}: {} for '{}' ({})",
            cookie, profile, application_id, reason
        );
        self.dispatch(changed);
        Ok(cookie)
    }

    /// Remove a hold by cookie. Returns false when the cookie is unknown.
    pub fn release_profile(&self, cookie: u32) -> bool {
        let base = self.base();
        let changed = {
            let mut registry = self.registry.lock().unwrap();
            let Some(pos) = registry.holds.iter().position(|h| h.cookie == cookie) else {
                return false;
            };
            // remove, not swap_remove: registration order is the tie-break
            // when holds of equal priority compete
            let hold = registry.holds.remove(pos);
            debug!("released hold {} ({})", cookie, hold.application_id);
            Self::recompute(&mut registry, base)
        };

        self.dispatch(changed);
        true
    }

    /// Atomically drop every hold owned by a sender. Returns the removed
    /// cookies so the caller can emit release signals; notifies at most
    /// once regardless of how many holds were dropped.
    pub fn cleanup_sender_holds(&self, sender: &str) -> Vec<u32> {
        let base = self.base();
        let (removed, changed) = {
            let mut registry = self.registry.lock().unwrap();
            let mut removed = Vec::new();
            registry.holds.retain(|h| {
                if h.sender == sender {
                    removed.push(h.cookie);
                    false
                } else {
                    true
                }
            });
            let changed = if removed.is_empty() {
                None
            } else {
                Self::recompute(&mut registry, base)
            };
            (removed, changed)
        };

        if !removed.is_empty() {
            info!("dropped {} hold(s) of departed sender {}", removed.len(), sender);
        }
        self.dispatch(changed);
        removed
    }

    /// Resolve the effective profile against an explicit base.
    pub fn get_effective_profile(&self, base: PowerProfile) -> PowerProfile {
        Self::resolve(&self.registry.lock().unwrap().holds, base)
    }

    /// Resolve the effective profile against the stored base.
    pub fn effective(&self) -> PowerProfile {
        self.get_effective_profile(self.base())
    }

    /// Snapshot of all live holds, in registration order.
    pub fn get_active_holds(&self) -> Vec<ProfileHold> {
        self.registry.lock().unwrap().holds.clone()
    }

    pub fn has_holds(&self) -> bool {
        !self.registry.lock().unwrap().holds.is_empty()
    }

    pub fn has_sender_holds(&self, sender: &str) -> bool {
        self.registry
            .lock()
            .unwrap()
            .holds
            .iter()
            .any(|h| h.sender == sender)
    }

    /// Highest-priority hold wins; among equal priorities the earliest
    /// registration wins because only a strictly greater priority
    /// displaces the current best.
    fn resolve(holds: &[ProfileHold], base: PowerProfile) -> PowerProfile {
        let mut best: Option<PowerProfile> = None;
        for hold in holds {
            match best {
                Some(current) if hold.profile.priority() <= current.priority() => {}
                _ => best = Some(hold.profile),
            }
        }
        best.unwrap_or(base)
    }

    /// Recompute the effective profile under the lock; returns the new
    /// value only when it differs from the previously notified one.
    fn recompute(registry: &mut Registry, base: PowerProfile) -> Option<PowerProfile> {
        let effective = Self::resolve(&registry.holds, base);
        if registry.last_notified == Some(effective) {
            None
        } else {
            registry.last_notified = Some(effective);
            Some(effective)
        }
    }

    /// Invoke the change callback outside the lock, on its own thread.
    fn dispatch(&self, changed: Option<PowerProfile>) {
        let Some(profile) = changed else { return };
        let callback = self.on_change.lock().unwrap().clone();
        if let Some(callback) = callback {
            std::thread::spawn(move || callback(profile));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn manager() -> ProfileHoldManager {
        ProfileHoldManager::new(PowerProfile::Balanced)
    }

    #[test]
    fn test_priority_resolution() {
        let holds = manager();

        let perf = holds
            .hold_profile("performance", "compiling", "builder", ":1.10")
            .unwrap();
        let saver = holds
            .hold_profile("power-saver", "low battery", "shell", ":1.11")
            .unwrap();
        assert_eq!(holds.effective(), PowerProfile::Performance);

        assert!(holds.release_profile(perf));
        assert_eq!(holds.effective(), PowerProfile::PowerSaver);

        assert!(holds.release_profile(saver));
        assert_eq!(holds.effective(), PowerProfile::Balanced);
    }

    #[test]
    fn test_effective_with_explicit_base() {
        let holds = manager();
        assert_eq!(
            holds.get_effective_profile(PowerProfile::PowerSaver),
            PowerProfile::PowerSaver
        );
        holds
            .hold_profile("balanced", "meeting", "video", ":1.2")
            .unwrap();
        assert_eq!(
            holds.get_effective_profile(PowerProfile::PowerSaver),
            PowerProfile::Balanced
        );
    }

    #[test]
    fn test_cookie_monotonicity_across_releases() {
        let holds = manager();
        let mut cookies = Vec::new();
        for i in 0..3 {
            cookies.push(
                holds
                    .hold_profile("balanced", "r", &format!("app{}", i), ":1.1")
                    .unwrap(),
            );
        }
        assert!(holds.release_profile(cookies[0]));
        assert!(holds.release_profile(cookies[2]));
        for _ in 0..3 {
            cookies.push(
                holds
                    .hold_profile("balanced", "r", "app", ":1.1")
                    .unwrap(),
            );
        }

        assert_eq!(cookies[0], 1);
        for pair in cookies.windows(2) {
            assert!(pair[1] > pair[0], "cookies must strictly increase");
        }
    }

    #[test]
    fn test_invalid_profile_rejected() {
        let holds = manager();
        assert!(holds
            .hold_profile("hyperspeed", "r", "app", ":1.1")
            .is_err());
        assert!(!holds.has_holds());
    }

    #[test]
    fn test_release_unknown_cookie() {
        let holds = manager();
        assert!(!holds.release_profile(42));
    }

    #[test]
    fn test_active_holds_mirror_registry() {
        let holds = manager();
        let a = holds
            .hold_profile("performance", "render", "blender", ":1.3")
            .unwrap();
        let b = holds
            .hold_profile("power-saver", "battery", "shell", ":1.4")
            .unwrap();

        let active = holds.get_active_holds();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].cookie, a);
        assert_eq!(active[0].application_id, "blender");
        assert_eq!(active[1].cookie, b);

        holds.release_profile(a);
        let active = holds.get_active_holds();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].cookie, b);
    }

    #[test]
    fn test_registration_order_survives_release() {
        let holds = manager();
        for app in ["first", "second", "third"] {
            holds
                .hold_profile("performance", "r", app, ":1.5")
                .unwrap();
        }
        holds.release_profile(2);

        let order: Vec<String> = holds
            .get_active_holds()
            .into_iter()
            .map(|h| h.application_id)
            .collect();
        assert_eq!(order, vec!["first", "third"]);
    }

    #[test]
    fn test_notify_once_per_effective_change() {
        let holds = manager();
        let (tx, rx) = mpsc::channel();
        holds.set_on_change(move |profile| {
            tx.send(profile).unwrap();
        });

        let first = holds
            .hold_profile("performance", "r", "a", ":1.6")
            .unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            PowerProfile::Performance
        );

        // Second performance hold: effective unchanged, no notification
        let second = holds
            .hold_profile("performance", "r", "b", ":1.7")
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err());

        // Releasing one of two performance holds: still no change
        holds.release_profile(first);
        std::thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err());

        holds.release_profile(second);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            PowerProfile::Balanced
        );
    }

    #[test]
    fn test_cleanup_sender_holds() {
        let holds = manager();
        let (tx, rx) = mpsc::channel();
        holds.set_on_change(move |profile| {
            tx.send(profile).unwrap();
        });

        let a1 = holds
            .hold_profile("performance", "r", "a", ":1.8")
            .unwrap();
        let a2 = holds
            .hold_profile("performance", "r", "a", ":1.8")
            .unwrap();
        holds
            .hold_profile("power-saver", "r", "b", ":1.9")
            .unwrap();
        // drain the notification from the first performance hold
        rx.recv_timeout(Duration::from_secs(1)).unwrap();

        let removed = holds.cleanup_sender_holds(":1.8");
        assert_eq!(removed, vec![a1, a2]);
        assert!(!holds.has_sender_holds(":1.8"));
        assert!(holds.has_sender_holds(":1.9"));
        assert_eq!(holds.effective(), PowerProfile::PowerSaver);

        // Exactly one notification for the whole cleanup
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            PowerProfile::PowerSaver
        );
        std::thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err());

        // Cleaning up a sender with no holds does nothing
        assert!(holds.cleanup_sender_holds(":1.999").is_empty());
    }

    #[test]
    fn test_callback_may_reenter_manager() {
        let holds = Arc::new(manager());
        let (tx, rx) = mpsc::channel();
        let reentrant = Arc::clone(&holds);
        holds.set_on_change(move |_| {
            // Calling back into the manager must not deadlock
            tx.send(reentrant.has_holds()).unwrap();
        });

        holds
            .hold_profile("performance", "r", "a", ":1.12")
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());
    }
}
