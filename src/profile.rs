//! Power profile and governor override vocabulary shared across the daemon

use std::fmt;
use std::str::FromStr;

use crate::errors::PowerError;

/// A power profile as exposed over the UPower.PowerProfiles protocol.
///
/// The ordering is load-bearing: `Performance` outranks `Balanced`, which
/// outranks `PowerSaver` when resolving competing profile holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PowerProfile {
    PowerSaver,
    Balanced,
    Performance,
}

impl PowerProfile {
    /// Protocol string for this profile.
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerProfile::PowerSaver => "power-saver",
            PowerProfile::Balanced => "balanced",
            PowerProfile::Performance => "performance",
        }
    }

    /// Priority used when resolving concurrent holds.
    pub fn priority(&self) -> u8 {
        match self {
            PowerProfile::PowerSaver => 0,
            PowerProfile::Balanced => 1,
            PowerProfile::Performance => 2,
        }
    }
}

impl fmt::Display for PowerProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PowerProfile {
    type Err = PowerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "power-saver" => Ok(PowerProfile::PowerSaver),
            "balanced" => Ok(PowerProfile::Balanced),
            "performance" => Ok(PowerProfile::Performance),
            _ => Err(PowerError::InvalidArgument(format!(
                "unknown power profile: {}",
                s
            ))),
        }
    }
}

/// Manual governor override persisted across daemon restarts.
///
/// `Default` means no override: the daemon picks the governor from the
/// power source automatically. The override is stored as a one-line file
/// in the daemon state directory; `Default` is the absence of that file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorOverride {
    Powersave,
    Performance,
    Default,
}

impl GovernorOverride {
    pub fn as_str(&self) -> &'static str {
        match self {
            GovernorOverride::Powersave => "powersave",
            GovernorOverride::Performance => "performance",
            GovernorOverride::Default => "default",
        }
    }

    /// Parse the persisted representation. Unknown content is treated as
    /// `Default` so a corrupt state file cannot wedge the daemon.
    pub fn from_persisted(s: &str) -> Self {
        match s.trim() {
            "powersave" => GovernorOverride::Powersave,
            "performance" => GovernorOverride::Performance,
            _ => GovernorOverride::Default,
        }
    }
}

impl fmt::Display for GovernorOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_round_trip() {
        for s in ["power-saver", "balanced", "performance"] {
            assert_eq!(s.parse::<PowerProfile>().unwrap().as_str(), s);
        }
        assert!("ludicrous".parse::<PowerProfile>().is_err());
    }

    #[test]
    fn test_profile_priority_order() {
        assert!(PowerProfile::PowerSaver.priority() < PowerProfile::Balanced.priority());
        assert!(PowerProfile::Balanced.priority() < PowerProfile::Performance.priority());
    }

    #[test]
    fn test_override_persisted_round_trip() {
        assert_eq!(
            GovernorOverride::from_persisted("powersave\n"),
            GovernorOverride::Powersave
        );
        assert_eq!(
            GovernorOverride::from_persisted("performance"),
            GovernorOverride::Performance
        );
        assert_eq!(
            GovernorOverride::from_persisted("garbage"),
            GovernorOverride::Default
        );
    }
}
