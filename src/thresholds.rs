//! Four-level analog threshold alarm state machine
//!
//! Every analog channel on a device carries four signed thresholds
//! (AH, WH, WL, AL) that divide the reading axis into five bands. Each new
//! reading drives a per-channel health transition, and the device-wide
//! state is the worst per-channel outcome. Devices boot UNINITIALISED and
//! stay there regardless of readings until the MCCS writes `SYS_STATUS`,
//! which triggers re-evaluation from the current readings.
//!
//! Health gates the ports: only OK and WARNING permit output power; in
//! ALARM, RECOVERY and UNINITIALISED every port is forced off.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{PasdError, PasdResult};
use crate::registers::status_code;

/// Device or channel health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthState {
    Uninitialised,
    Ok,
    Warning,
    Alarm,
    Recovery,
}

impl HealthState {
    /// Decode a SYS_STATUS register value; POWERUP (5) is a command code,
    /// not a health state, and decodes to `None` like any unknown value
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            status_code::OK => Some(HealthState::Ok),
            status_code::WARNING => Some(HealthState::Warning),
            status_code::ALARM => Some(HealthState::Alarm),
            status_code::RECOVERY => Some(HealthState::Recovery),
            status_code::UNINITIALISED => Some(HealthState::Uninitialised),
            _ => None,
        }
    }

    /// The SYS_STATUS register encoding of this state
    pub fn to_code(self) -> u16 {
        match self {
            HealthState::Ok => status_code::OK,
            HealthState::Warning => status_code::WARNING,
            HealthState::Alarm => status_code::ALARM,
            HealthState::Recovery => status_code::RECOVERY,
            HealthState::Uninitialised => status_code::UNINITIALISED,
        }
    }

    /// Severity rank used for device-wide aggregation
    fn severity(self) -> u8 {
        match self {
            HealthState::Ok => 0,
            HealthState::Warning => 1,
            HealthState::Recovery => 2,
            HealthState::Alarm => 3,
            // Never produced by readings, but gates harder than ALARM
            HealthState::Uninitialised => 4,
        }
    }

    /// May ports be driven in this state?
    pub fn ports_enabled(self) -> bool {
        matches!(self, HealthState::Ok | HealthState::Warning)
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(status_code::name(self.to_code()))
    }
}

/// Which band a reading falls into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    AlarmHigh,
    WarningHigh,
    Healthy,
    WarningLow,
    AlarmLow,
}

/// The four per-channel thresholds, in register order (AH, WH, WL, AL)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdSet {
    pub ah: i16,
    pub wh: i16,
    pub wl: i16,
    pub al: i16,
}

impl ThresholdSet {
    pub const fn new(ah: i16, wh: i16, wl: i16, al: i16) -> Self {
        Self { ah, wh, wl, al }
    }

    /// Enforce `AL <= WL <= WH <= AH`; a violating set is a configuration
    /// error and must be rejected before any frame is sent
    pub fn validate(&self) -> PasdResult<()> {
        if self.al <= self.wl && self.wl <= self.wh && self.wh <= self.ah {
            Ok(())
        } else {
            Err(PasdError::invalid_range(format!(
                "threshold ordering violated: AL={} WL={} WH={} AH={}",
                self.al, self.wl, self.wh, self.ah
            )))
        }
    }

    /// Register encoding, in the wire order (AH, WH, WL, AL)
    pub fn to_words(&self) -> [u16; 4] {
        [self.ah as u16, self.wh as u16, self.wl as u16, self.al as u16]
    }

    /// Decode from four registers in wire order
    pub fn from_words(words: &[u16]) -> Self {
        Self::new(words[0] as i16, words[1] as i16, words[2] as i16, words[3] as i16)
    }

    /// Classify a reading into its band
    pub fn classify(&self, reading: i16) -> Band {
        if reading > self.ah {
            Band::AlarmHigh
        } else if reading > self.wh {
            Band::WarningHigh
        } else if reading >= self.wl {
            Band::Healthy
        } else if reading >= self.al {
            Band::WarningLow
        } else {
            Band::AlarmLow
        }
    }

    /// Drive one per-channel transition from a new reading
    ///
    /// UNINITIALISED is sticky: readings never move a device out of it,
    /// only a `SYS_STATUS` write does (the controllers re-evaluate then).
    pub fn step(&self, state: HealthState, reading: i16) -> HealthState {
        if state == HealthState::Uninitialised {
            return HealthState::Uninitialised;
        }
        match self.classify(reading) {
            Band::AlarmHigh | Band::AlarmLow => HealthState::Alarm,
            Band::WarningHigh | Band::WarningLow => {
                if state == HealthState::Alarm {
                    HealthState::Recovery
                } else {
                    HealthState::Warning
                }
            }
            Band::Healthy => HealthState::Ok,
        }
    }
}

/// Worst-severity aggregation over per-channel outcomes
///
/// An empty iterator aggregates to OK: a device with no analog channels in
/// distress is healthy.
pub fn aggregate<I: IntoIterator<Item = HealthState>>(states: I) -> HealthState {
    states
        .into_iter()
        .max_by_key(|s| s.severity())
        .unwrap_or(HealthState::Ok)
}
