//! Per-port state bitfields and the port power state machine
//!
//! One 16-bit `P<NN>_STATE` register per port packs six logical fields,
//! MSB first:
//!
//! | bits  | field      | notes                                    |
//! |-------|------------|------------------------------------------|
//! | 15    | ENABLE     | device-wide health gate, read-only       |
//! | 14    | ONLINE     | device-wide comms freshness, read-only   |
//! | 13-12 | DSON       | desired state when online, two-bit R/W   |
//! | 11-10 | DSOFF      | desired state when offline, two-bit R/W  |
//! | 9-8   | TO         | technician override, two-bit R/W         |
//! | 7     | BREAKER    | SMARTbox breaker latch (FNDH: PWRSENSE)  |
//! | 6     | POWER      | observed output power, read-only         |
//! | 5-0   | reserved   | zero                                     |
//!
//! Writing `00` to any two-bit field leaves the firmware value unchanged,
//! so writes are built as masked updates ([`PortWrite`]) rather than full
//! register replacements.

use log::warn;
use serde::{Deserialize, Serialize};

const BIT_ENABLE: u16 = 1 << 15;
const BIT_ONLINE: u16 = 1 << 14;
const SHIFT_DSON: u16 = 12;
const SHIFT_DSOFF: u16 = 10;
const SHIFT_TO: u16 = 8;
const BIT_BREAKER: u16 = 1 << 7;
const BIT_POWER: u16 = 1 << 6;

/// Two-bit desired-state write field for DSON / DSOFF
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DesireField {
    /// `00`: do not modify the firmware value
    Unchanged,
    /// `10`: port desired off
    Off,
    /// `11`: port desired on
    On,
}

impl DesireField {
    fn bits(self) -> u16 {
        match self {
            DesireField::Unchanged => 0b00,
            DesireField::Off => 0b10,
            DesireField::On => 0b11,
        }
    }

    /// From an operator intent
    pub fn from_intent(on: Option<bool>) -> Self {
        match on {
            None => DesireField::Unchanged,
            Some(false) => DesireField::Off,
            Some(true) => DesireField::On,
        }
    }
}

/// Two-bit technician-override write field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverrideField {
    /// `00`: do not modify the override
    Unchanged,
    /// `01`: clear any override
    Clear,
    /// `10`: force the port off
    ForceOff,
    /// `11`: force the port on
    ForceOn,
}

impl OverrideField {
    fn bits(self) -> u16 {
        match self {
            OverrideField::Unchanged => 0b00,
            OverrideField::Clear => 0b01,
            OverrideField::ForceOff => 0b10,
            OverrideField::ForceOn => 0b11,
        }
    }
}

/// Decoded technician-override state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Forcing {
    NotForced,
    ForcedOff,
    ForcedOn,
}

/// Decoded contents of one `P<NN>_STATE` register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PortBitmap {
    /// Device-wide health gate, replicated into every port register
    pub enabled: bool,
    /// Device-wide comms freshness, replicated into every port register
    pub online: bool,
    /// Desired state while online; `None` when the firmware reported
    /// "unchanged" (00) or the reserved 01 encoding
    pub desire_on: Option<bool>,
    /// Desired state while offline
    pub desire_off: Option<bool>,
    /// Technician override; `None` when the field read back as 00
    pub forcing: Option<Forcing>,
    /// Breaker latch on SMARTbox ports, PWRSENSE on FNDH ports
    pub breaker: bool,
    /// Observed output power
    pub power: bool,
}

fn decode_desire(bits: u16, field: &str) -> Option<bool> {
    match bits {
        0b11 => Some(true),
        0b10 => Some(false),
        0b00 => None,
        _ => {
            // Reserved encoding; treated as unchanged
            warn!("reserved {} encoding 01 read back, treating as unset", field);
            None
        }
    }
}

impl PortBitmap {
    /// Decode a `P<NN>_STATE` register value
    pub fn decode(word: u16) -> Self {
        let forcing = match (word >> SHIFT_TO) & 0b11 {
            0b11 => Some(Forcing::ForcedOn),
            0b10 => Some(Forcing::ForcedOff),
            0b01 => Some(Forcing::NotForced),
            _ => None,
        };
        Self {
            enabled: word & BIT_ENABLE != 0,
            online: word & BIT_ONLINE != 0,
            desire_on: decode_desire((word >> SHIFT_DSON) & 0b11, "DSON"),
            desire_off: decode_desire((word >> SHIFT_DSOFF) & 0b11, "DSOFF"),
            forcing,
            breaker: word & BIT_BREAKER != 0,
            power: word & BIT_POWER != 0,
        }
    }

    /// Full register encoding of the observed state, for device simulators
    /// and round-trip tests
    pub fn encode(&self) -> u16 {
        let mut word = 0u16;
        if self.enabled {
            word |= BIT_ENABLE;
        }
        if self.online {
            word |= BIT_ONLINE;
        }
        word |= DesireField::from_intent(self.desire_on).bits() << SHIFT_DSON;
        word |= DesireField::from_intent(self.desire_off).bits() << SHIFT_DSOFF;
        word |= match self.forcing {
            None => 0b00,
            Some(Forcing::NotForced) => 0b01,
            Some(Forcing::ForcedOff) => 0b10,
            Some(Forcing::ForcedOn) => 0b11,
        } << SHIFT_TO;
        if self.breaker {
            word |= BIT_BREAKER;
        }
        if self.power {
            word |= BIT_POWER;
        }
        word
    }

    /// The desired power the port should derive from its fields
    ///
    /// A technician override wins outright. Otherwise the online intent
    /// applies while the device is online, the offline intent while it is
    /// not; an unset intent means off.
    pub fn derived_on(&self) -> bool {
        match self.forcing {
            Some(Forcing::ForcedOn) => return true,
            Some(Forcing::ForcedOff) => return false,
            _ => {}
        }
        let intent = if self.online { self.desire_on } else { self.desire_off };
        intent.unwrap_or(false)
    }

    /// The power state the firmware must report: desired, enabled by
    /// device health, and not held off by a latched breaker
    pub fn expected_power(&self) -> bool {
        self.derived_on() && self.enabled && !self.breaker
    }
}

/// Masked update for one port register
///
/// Fields left at their defaults write `00` (or breaker 0) and leave the
/// firmware state alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortWrite {
    pub desire_on: DesireField,
    pub desire_off: DesireField,
    pub technician: OverrideField,
    pub reset_breaker: bool,
}

impl Default for PortWrite {
    fn default() -> Self {
        Self {
            desire_on: DesireField::Unchanged,
            desire_off: DesireField::Unchanged,
            technician: OverrideField::Unchanged,
            reset_breaker: false,
        }
    }
}

impl PortWrite {
    /// A write that modifies nothing
    pub fn unchanged() -> Self {
        Self::default()
    }

    /// Set both desired-state intents
    pub fn with_intents(online: Option<bool>, offline: Option<bool>) -> Self {
        Self {
            desire_on: DesireField::from_intent(online),
            desire_off: DesireField::from_intent(offline),
            ..Self::default()
        }
    }

    /// Set the technician override field
    pub fn with_override(technician: OverrideField) -> Self {
        Self { technician, ..Self::default() }
    }

    /// A breaker reset pulse, everything else untouched
    pub fn breaker_reset() -> Self {
        Self { reset_breaker: true, ..Self::default() }
    }

    /// Register value to send; read-only bits stay zero
    pub fn word(&self) -> u16 {
        let mut word = 0u16;
        word |= self.desire_on.bits() << SHIFT_DSON;
        word |= self.desire_off.bits() << SHIFT_DSOFF;
        word |= self.technician.bits() << SHIFT_TO;
        if self.reset_breaker {
            word |= BIT_BREAKER;
        }
        word
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_bit_positions() {
        // ENABLE | ONLINE | DSON=11 | TO=11 | POWER
        let word = BIT_ENABLE | BIT_ONLINE | (0b11 << SHIFT_DSON) | (0b11 << SHIFT_TO) | BIT_POWER;
        let p = PortBitmap::decode(word);
        assert!(p.enabled && p.online && p.power);
        assert_eq!(p.desire_on, Some(true));
        assert_eq!(p.desire_off, None);
        assert_eq!(p.forcing, Some(Forcing::ForcedOn));
        assert!(!p.breaker);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let p = PortBitmap {
            enabled: true,
            online: false,
            desire_on: Some(true),
            desire_off: Some(false),
            forcing: Some(Forcing::NotForced),
            breaker: true,
            power: false,
        };
        assert_eq!(PortBitmap::decode(p.encode()), p);
    }

    #[test]
    fn test_reserved_desire_encoding_reads_as_unset() {
        let word = 0b01 << SHIFT_DSON;
        assert_eq!(PortBitmap::decode(word).desire_on, None);
    }

    #[test]
    fn test_override_precedence() {
        // TO wins over both intents and the online flag
        for online in [false, true] {
            let p = PortBitmap {
                online,
                desire_on: Some(false),
                desire_off: Some(false),
                forcing: Some(Forcing::ForcedOn),
                ..Default::default()
            };
            assert!(p.derived_on());

            let p = PortBitmap {
                online,
                desire_on: Some(true),
                desire_off: Some(true),
                forcing: Some(Forcing::ForcedOff),
                ..Default::default()
            };
            assert!(!p.derived_on());
        }
    }

    #[test]
    fn test_intent_selection_follows_online() {
        let p = PortBitmap {
            online: true,
            desire_on: Some(true),
            desire_off: Some(false),
            ..Default::default()
        };
        assert!(p.derived_on());

        let p = PortBitmap { online: false, ..p };
        assert!(!p.derived_on());
    }

    #[test]
    fn test_unset_intent_means_off() {
        let p = PortBitmap { online: true, desire_on: None, ..Default::default() };
        assert!(!p.derived_on());
    }

    #[test]
    fn test_power_requires_enable_and_breaker_clear() {
        let mut p = PortBitmap {
            enabled: true,
            online: true,
            desire_on: Some(true),
            ..Default::default()
        };
        assert!(p.expected_power());

        p.enabled = false;
        assert!(!p.expected_power());

        p.enabled = true;
        p.breaker = true;
        assert!(!p.expected_power());
    }

    #[test]
    fn test_override_clear_restores_intents() {
        // A port forced on, then cleared with TO=01, derives from DSON again
        let mut p = PortBitmap {
            online: true,
            desire_on: Some(false),
            forcing: Some(Forcing::ForcedOn),
            ..Default::default()
        };
        assert!(p.derived_on());

        p.forcing = Some(Forcing::NotForced);
        assert!(!p.derived_on());

        p.desire_on = Some(true);
        assert!(p.derived_on());
    }

    #[test]
    fn test_write_masking() {
        assert_eq!(PortWrite::unchanged().word(), 0);

        let w = PortWrite::with_intents(Some(true), None);
        assert_eq!(w.word(), 0b11 << SHIFT_DSON);

        let w = PortWrite::with_override(OverrideField::Clear);
        assert_eq!(w.word(), 0b01 << SHIFT_TO);

        let w = PortWrite::breaker_reset();
        assert_eq!(w.word(), BIT_BREAKER);
    }
}
