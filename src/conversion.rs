//! Calibration between raw ADU register values and engineering units
//!
//! The microcontrollers report every analog channel as a raw ADC count.
//! The scale and offset for each channel kind depend on the PCB revision,
//! so the table is injected rather than hard-coded at the call sites; the
//! defaults here correspond to PCB revision 1 hardware.
//!
//! Port currents are deliberately left opaque: the register documentation
//! for `P*_CURRENT` units is known to be wrong, so nothing in the control
//! plane interprets them except through this table.

use serde::{Deserialize, Serialize};

/// Analog channel families sharing one calibration each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    /// 48 VDC incoming/outgoing supply rails
    Voltage48,
    /// 5 V / PSU output rail
    Voltage5,
    /// All temperature sensors (PSU, PCB, outside, FEM enclosures)
    Temperature,
    /// Per-port FEM current and the 48 V bus current
    Current,
}

/// Linear calibration: engineering = raw * scale + offset
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub scale: f32,
    pub offset: f32,
}

impl Calibration {
    pub const fn new(scale: f32, offset: f32) -> Self {
        Self { scale, offset }
    }

    /// Raw ADU to engineering units
    pub fn to_engineering(&self, raw: i16) -> f32 {
        f32::from(raw) * self.scale + self.offset
    }

    /// Engineering units back to a raw ADU, for threshold pushes
    pub fn to_raw(&self, value: f32) -> i16 {
        ((value - self.offset) / self.scale).round() as i16
    }
}

/// Calibration table for one PCB revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTable {
    pub voltage_48: Calibration,
    pub voltage_5: Calibration,
    pub temperature: Calibration,
    pub current: Calibration,
}

impl CalibrationTable {
    /// Look up the calibration for a channel kind
    pub fn for_kind(&self, kind: ChannelKind) -> Calibration {
        match kind {
            ChannelKind::Voltage48 => self.voltage_48,
            ChannelKind::Voltage5 => self.voltage_5,
            ChannelKind::Temperature => self.temperature,
            ChannelKind::Current => self.current,
        }
    }

    /// Convert a raw register value on the given channel kind
    pub fn to_engineering(&self, kind: ChannelKind, raw: i16) -> f32 {
        self.for_kind(kind).to_engineering(raw)
    }

    /// Convert an engineering value to the raw register encoding
    pub fn to_raw(&self, kind: ChannelKind, value: f32) -> i16 {
        self.for_kind(kind).to_raw(value)
    }
}

impl Default for CalibrationTable {
    /// PCB revision 1: 12-bit ADC, 0-100 V / 0-10 V / -10..+90 degC spans
    fn default() -> Self {
        Self {
            voltage_48: Calibration::new(100.0 / 4096.0, 0.0),
            voltage_5: Calibration::new(10.0 / 4096.0, 0.0),
            temperature: Calibration::new(150.0 / 4096.0, -10.0),
            current: Calibration::new(100.0 / 4096.0, 0.0),
        }
    }
}
