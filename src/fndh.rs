//! FNDH device controller
//!
//! The Field Node Distribution Hub switches 48 VDC onto 28 PDoC ports, one
//! SMARTbox hanging off each populated port. Its register model is the
//! SMARTbox's with two differences: the polled block is 54 registers with
//! no per-port current telemetry, and port current limiting is done in
//! hardware, so the breaker bit position reads back as PWRSENSE and the
//! only software recovery is a desired-state OFF→ON cycle.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::conversion::{CalibrationTable, ChannelKind};
use crate::error::{PasdError, PasdResult};
use crate::ports::{OverrideField, PortBitmap, PortWrite};
use crate::registers::{Access, RegisterDef, RegisterImage};
use crate::thresholds::{HealthState, ThresholdSet};
use crate::transport::{AsciiMaster, ByteStream};
use crate::utils::Clock;
use crate::PDOC_PORT_COUNT;

/// Registers in the polled block (1..=54)
pub const POLL_BLOCK_LEN: u16 = 54;

/// Analog channels carrying threshold sets, in config-block order
pub const THRESHOLD_CHANNELS: usize = 8;

/// Consecutive poll failures before the mirror goes stale
pub const STALE_AFTER_FAILURES: u8 = 3;

/// Register numbers in the FNDH polled block
pub mod reg {
    pub const MBRV: u16 = 1;
    pub const PCBREV: u16 = 2;
    pub const CPUID: u16 = 3;
    pub const CHIPID: u16 = 5;
    pub const FIRMVER: u16 = 13;
    pub const UPTIME: u16 = 14;
    pub const ADDRESS: u16 = 16;
    pub const V48_1: u16 = 17;
    pub const V48_2: u16 = 18;
    pub const V5: u16 = 19;
    pub const I48: u16 = 20;
    pub const TEMP48: u16 = 21;
    pub const TEMP5: u16 = 22;
    pub const PCBTEMP: u16 = 23;
    pub const OUTTEMP: u16 = 24;
    pub const STATUS: u16 = 25;
    pub const LIGHTS: u16 = 26;
    pub const PORT_STATE_BASE: u16 = 27;

    /// First register of the configuration block
    pub const CONF_BASE: u16 = 1001;
}

/// Polled-block schema, for validation and operator tooling
pub const POLL_SCHEMA: &[RegisterDef] = &[
    RegisterDef::new("SYS_MBRV", reg::MBRV, 1, false, Access::ReadOnly, None),
    RegisterDef::new("SYS_PCBREV", reg::PCBREV, 1, false, Access::ReadOnly, None),
    RegisterDef::new("SYS_CPUID", reg::CPUID, 2, false, Access::ReadOnly, None),
    RegisterDef::new("SYS_CHIPID", reg::CHIPID, 8, false, Access::ReadOnly, None),
    RegisterDef::new("SYS_FIRMVER", reg::FIRMVER, 1, false, Access::ReadOnly, None),
    RegisterDef::new("SYS_UPTIME", reg::UPTIME, 2, false, Access::ReadOnly, None),
    RegisterDef::new("SYS_ADDRESS", reg::ADDRESS, 1, false, Access::ReadOnly, None),
    RegisterDef::new("SYS_48V1_V", reg::V48_1, 1, false, Access::ReadOnly, Some(ChannelKind::Voltage48)),
    RegisterDef::new("SYS_48V2_V", reg::V48_2, 1, false, Access::ReadOnly, Some(ChannelKind::Voltage48)),
    RegisterDef::new("SYS_5V_V", reg::V5, 1, false, Access::ReadOnly, Some(ChannelKind::Voltage5)),
    RegisterDef::new("SYS_48V_I", reg::I48, 1, true, Access::ReadOnly, Some(ChannelKind::Current)),
    RegisterDef::new("SYS_48V_TEMP", reg::TEMP48, 1, true, Access::ReadOnly, Some(ChannelKind::Temperature)),
    RegisterDef::new("SYS_5V_TEMP", reg::TEMP5, 1, true, Access::ReadOnly, Some(ChannelKind::Temperature)),
    RegisterDef::new("SYS_PCBTEMP", reg::PCBTEMP, 1, true, Access::ReadOnly, Some(ChannelKind::Temperature)),
    RegisterDef::new("SYS_OUTTEMP", reg::OUTTEMP, 1, true, Access::ReadOnly, Some(ChannelKind::Temperature)),
    RegisterDef::new("SYS_STATUS", reg::STATUS, 1, false, Access::ReadWrite, None),
    RegisterDef::new("SYS_LIGHTS", reg::LIGHTS, 1, false, Access::ReadWriteMasked, None),
    RegisterDef::new("P01_STATE", reg::PORT_STATE_BASE, 28, false, Access::ReadWrite, None),
];

/// Threshold configuration for the FNDH
///
/// Channel order matches the config block (1001..=1032): 48V1_V, 48V2_V,
/// 5V_V, 48V_I, 48V_TEMP, 5V_TEMP, PCBTEMP, OUTTEMP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FndhThresholds {
    pub channels: [ThresholdSet; THRESHOLD_CHANNELS],
}

impl Default for FndhThresholds {
    fn default() -> Self {
        Self {
            channels: [ThresholdSet::new(i16::MAX, i16::MAX - 1, i16::MIN + 1, i16::MIN); THRESHOLD_CHANNELS],
        }
    }
}

impl FndhThresholds {
    pub fn validate(&self) -> PasdResult<()> {
        for (i, ch) in self.channels.iter().enumerate() {
            ch.validate().map_err(|e| {
                PasdError::invalid_range(format!("channel {}: {}", i + 1, e))
            })?;
        }
        Ok(())
    }

    /// The configuration block, registers 1001..=1032 in order
    pub fn to_words(&self) -> Vec<u16> {
        self.channels.iter().flat_map(|ch| ch.to_words()).collect()
    }
}

/// Operator intent for one PDoC port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdocIntent {
    pub online_on: bool,
    pub offline_on: bool,
}

/// Decoded state of one PDoC port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PdocPort {
    pub bitmap: PortBitmap,
    /// 48 V detected on the port output; occupies the breaker bit position
    pub power_sense: bool,
    /// SMARTbox wired to this port, 0 until discovery assigns one
    pub smartbox_address: u8,
}

impl PdocPort {
    fn update(&mut self, word: u16) {
        let bitmap = PortBitmap::decode(word);
        self.power_sense = bitmap.breaker;
        self.bitmap = PortBitmap { breaker: false, ..bitmap };
    }
}

/// Decoded snapshot of the FNDH polled block
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FndhMirror {
    pub mbrv: u16,
    pub pcbrev: u16,
    pub cpuid: u32,
    pub chipid: [u8; 16],
    pub firmware_version: u16,
    pub uptime: u32,
    pub address_value: u16,
    pub psu48v1_voltage: f32,
    pub psu48v2_voltage: f32,
    pub psu5v_voltage: f32,
    pub psu48v_current: f32,
    pub psu48v_temp: f32,
    pub psu5v_temp: f32,
    pub pcb_temp: f32,
    pub outside_temp: f32,
    pub status_code: u16,
    pub health: Option<HealthState>,
    pub service_led: bool,
    pub indicator_code: u8,
}

impl FndhMirror {
    pub fn decode(image: &RegisterImage, cal: &CalibrationTable) -> Self {
        let mut chipid = [0u8; 16];
        chipid.copy_from_slice(&image.get_bytes(reg::CHIPID, 8));
        let lights = image.get_word(reg::LIGHTS);
        let status_code = image.get_word(reg::STATUS);

        Self {
            mbrv: image.get_word(reg::MBRV),
            pcbrev: image.get_word(reg::PCBREV),
            cpuid: image.get_u32(reg::CPUID),
            chipid,
            firmware_version: image.get_word(reg::FIRMVER),
            uptime: image.get_u32(reg::UPTIME),
            address_value: image.get_word(reg::ADDRESS),
            psu48v1_voltage: cal.to_engineering(ChannelKind::Voltage48, image.get_i16(reg::V48_1)),
            psu48v2_voltage: cal.to_engineering(ChannelKind::Voltage48, image.get_i16(reg::V48_2)),
            psu5v_voltage: cal.to_engineering(ChannelKind::Voltage5, image.get_i16(reg::V5)),
            psu48v_current: cal.to_engineering(ChannelKind::Current, image.get_i16(reg::I48)),
            psu48v_temp: cal.to_engineering(ChannelKind::Temperature, image.get_i16(reg::TEMP48)),
            psu5v_temp: cal.to_engineering(ChannelKind::Temperature, image.get_i16(reg::TEMP5)),
            pcb_temp: cal.to_engineering(ChannelKind::Temperature, image.get_i16(reg::PCBTEMP)),
            outside_temp: cal.to_engineering(ChannelKind::Temperature, image.get_i16(reg::OUTTEMP)),
            status_code,
            health: HealthState::from_code(status_code),
            service_led: (lights >> 8) != 0,
            indicator_code: (lights & 0xFF) as u8,
        }
    }
}

/// The FNDH controller
pub struct Fndh {
    pub address: u8,
    pub mirror: FndhMirror,
    pub ports: [PdocPort; PDOC_PORT_COUNT],
    pub thresholds: FndhThresholds,
    pub intents: [PdocIntent; PDOC_PORT_COUNT],
    /// Unix timestamp of the last successful poll
    pub readtime: i64,
    pub stale: bool,
    consecutive_failures: u8,
}

impl Fndh {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            mirror: FndhMirror::default(),
            ports: [PdocPort::default(); PDOC_PORT_COUNT],
            thresholds: FndhThresholds::default(),
            intents: [PdocIntent::default(); PDOC_PORT_COUNT],
            readtime: 0,
            stale: false,
            consecutive_failures: 0,
        }
    }

    /// Register number of a PDoC port state register (`port` is 0-based)
    pub fn port_state_regnum(port: usize) -> u16 {
        assert!(port < PDOC_PORT_COUNT);
        reg::PORT_STATE_BASE + port as u16
    }

    /// Read the whole polled block in one 0x03 transaction and decode it
    pub async fn poll<S: ByteStream>(
        &mut self,
        master: &AsciiMaster<S>,
        clock: &dyn Clock,
        cal: &CalibrationTable,
    ) -> PasdResult<()> {
        match master.read_holding(self.address, 1, POLL_BLOCK_LEN).await {
            Ok(words) => {
                let image = RegisterImage::from_words(1, words);
                self.mirror = FndhMirror::decode(&image, cal);
                for (i, port) in self.ports.iter_mut().enumerate() {
                    port.update(image.get_word(reg::PORT_STATE_BASE + i as u16));
                }
                self.readtime = clock.now_unix();
                self.consecutive_failures = 0;
                self.stale = false;
                debug!("FNDH polled: status {}", self.mirror.status_code);
                Ok(())
            }
            Err(err) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures == STALE_AFTER_FAILURES {
                    self.stale = true;
                    warn!(
                        "FNDH mirror stale after {} failed polls (last good poll {})",
                        STALE_AFTER_FAILURES, self.readtime
                    );
                }
                Err(err)
            }
        }
    }

    /// Push the threshold block in one 0x10 transaction
    pub async fn write_thresholds<S: ByteStream>(&self, master: &AsciiMaster<S>) -> PasdResult<()> {
        self.thresholds.validate()?;
        master.write_registers(self.address, reg::CONF_BASE, &self.thresholds.to_words()).await
    }

    /// Write all 28 port registers from the given per-port writes
    pub async fn write_ports<S: ByteStream>(
        &self,
        master: &AsciiMaster<S>,
        writes: &[PortWrite; PDOC_PORT_COUNT],
    ) -> PasdResult<()> {
        let words: Vec<u16> = writes.iter().map(|w| w.word()).collect();
        master.write_registers(self.address, reg::PORT_STATE_BASE, &words).await
    }

    /// Write the desired-state fields of every port from the stored intents
    pub async fn push_intents<S: ByteStream>(&self, master: &AsciiMaster<S>) -> PasdResult<()> {
        let mut writes = [PortWrite::unchanged(); PDOC_PORT_COUNT];
        for (i, it) in self.intents.iter().enumerate() {
            writes[i] = PortWrite::with_intents(Some(it.online_on), Some(it.offline_on));
        }
        self.write_ports(master, &writes).await
    }

    /// First configuration phase, run before discovery: thresholds in,
    /// every port desired off with overrides cleared, then a SYS_STATUS
    /// write to leave UNINITIALISED with the outputs safely dark
    pub async fn configure_all_off<S: ByteStream>(&mut self, master: &AsciiMaster<S>) -> PasdResult<()> {
        self.write_thresholds(master).await?;

        let mut writes = [PortWrite::unchanged(); PDOC_PORT_COUNT];
        for w in writes.iter_mut() {
            *w = PortWrite {
                technician: OverrideField::Clear,
                ..PortWrite::with_intents(Some(false), Some(false))
            };
        }
        self.write_ports(master, &writes).await?;

        master.write_register(self.address, reg::STATUS, 1).await?;
        debug!("FNDH configured with all PDoC ports off");
        Ok(())
    }

    /// Final configuration phase, run after discovery: apply the operator's
    /// real port intents
    pub async fn configure_final<S: ByteStream>(&self, master: &AsciiMaster<S>) -> PasdResult<()> {
        self.push_intents(master).await?;
        debug!("FNDH port intents applied");
        Ok(())
    }

    /// Turn one PDoC port on or off immediately, online and offline intent
    /// together (used port-by-port during discovery)
    pub async fn set_port<S: ByteStream>(
        &mut self,
        master: &AsciiMaster<S>,
        port: usize,
        on: bool,
    ) -> PasdResult<()> {
        let word = PortWrite::with_intents(Some(on), Some(on)).word();
        master.write_register(self.address, Self::port_state_regnum(port), word).await
    }

    /// Force one PDoC port off with the technician-override field, used
    /// when the attached SMARTbox requests a local powerdown
    pub async fn force_port_off<S: ByteStream>(
        &self,
        master: &AsciiMaster<S>,
        port: usize,
    ) -> PasdResult<()> {
        let word = PortWrite::with_override(OverrideField::ForceOff).word();
        master.write_register(self.address, Self::port_state_regnum(port), word).await
    }

    /// The stale-mirror condition as an error, for operator surfaces
    pub fn stale_error(&self) -> Option<PasdError> {
        self.stale.then(|| PasdError::StaleMirror { address: self.address, readtime: self.readtime })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_schema_covers_block_exactly() {
        let mut covered = [false; POLL_BLOCK_LEN as usize];
        for def in POLL_SCHEMA {
            for r in def.regnum..def.regnum + def.count {
                covered[(r - 1) as usize] = true;
            }
        }
        assert!(covered.iter().all(|&c| c), "polled block has unnamed registers");
    }

    #[test]
    fn test_threshold_block_is_32_registers() {
        assert_eq!(FndhThresholds::default().to_words().len(), 32);
    }

    #[test]
    fn test_mirror_decode() {
        let cal = CalibrationTable::default();
        let mut img = RegisterImage::new(1, POLL_BLOCK_LEN as usize);
        img.set_word(reg::V48_1, 1966);
        img.set_word(reg::V48_2, 1970);
        img.set_word(reg::STATUS, 4);
        let mirror = FndhMirror::decode(&img, &cal);
        assert!((mirror.psu48v1_voltage - 48.0).abs() < 0.1);
        assert_eq!(mirror.health, Some(HealthState::Uninitialised));
    }

    #[test]
    fn test_pdoc_port_power_sense_aliases_breaker_bit() {
        let mut port = PdocPort::default();
        port.update(1 << 7);
        assert!(port.power_sense);
        assert!(!port.bitmap.breaker);
        assert!(!port.bitmap.power);
    }

    #[test]
    fn test_port_regnum_range() {
        assert_eq!(Fndh::port_state_regnum(0), 27);
        assert_eq!(Fndh::port_state_regnum(27), 54);
    }
}
