//! SMARTbox device controller
//!
//! A SMARTbox drives 12 antenna front-end modules from 48 VDC arriving over
//! its PDoC link. The controller mirrors the device's 59-register polled
//! block, pushes the threshold configuration block, applies operator port
//! intents, and keeps the breaker-retry bookkeeping the station's reset
//! policy runs on.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::conversion::{CalibrationTable, ChannelKind};
use crate::error::{PasdError, PasdResult};
use crate::ports::{PortBitmap, PortWrite};
use crate::registers::{Access, RegisterDef, RegisterImage};
use crate::thresholds::{HealthState, ThresholdSet};
use crate::transport::{AsciiMaster, ByteStream};
use crate::utils::Clock;
use crate::FEM_PORT_COUNT;

/// Registers in the polled block (1..=59)
pub const POLL_BLOCK_LEN: u16 = 59;

/// Analog channels carrying threshold sets, in config-block order
pub const THRESHOLD_CHANNELS: usize = 17;

/// Consecutive poll failures before the mirror goes stale
pub const STALE_AFTER_FAILURES: u8 = 3;

/// Breaker resets attempted before giving up on a port
pub const BREAKER_RESET_BUDGET: u8 = 3;

/// Minimum spacing between breaker reset attempts
pub const BREAKER_RESET_SPACING: Duration = Duration::from_secs(3);

/// Register numbers in the SMARTbox polled block
pub mod reg {
    pub const MBRV: u16 = 1;
    pub const PCBREV: u16 = 2;
    pub const CPUID: u16 = 3;
    pub const CHIPID: u16 = 5;
    pub const FIRMVER: u16 = 13;
    pub const UPTIME: u16 = 14;
    pub const ADDRESS: u16 = 16;
    pub const V48: u16 = 17;
    pub const PSU_V: u16 = 18;
    pub const PSUTEMP: u16 = 19;
    pub const PCBTEMP: u16 = 20;
    pub const OUTTEMP: u16 = 21;
    pub const STATUS: u16 = 22;
    pub const LIGHTS: u16 = 23;
    pub const SENSE_BASE: u16 = 24;
    pub const PORT_STATE_BASE: u16 = 36;
    pub const PORT_CURRENT_BASE: u16 = 48;

    /// First register of the configuration block
    pub const CONF_BASE: u16 = 1001;
    /// First per-port current-trip threshold register
    pub const CURRENT_TRIP_BASE: u16 = 1069;
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
    RegisterDef::new("SYS_48V_V", reg::V48, 1, false, Access::ReadOnly, Some(ChannelKind::Voltage48)),
    RegisterDef::new("SYS_PSU_V", reg::PSU_V, 1, false, Access::ReadOnly, Some(ChannelKind::Voltage5)),
    RegisterDef::new("SYS_PSUTEMP", reg::PSUTEMP, 1, true, Access::ReadOnly, Some(ChannelKind::Temperature)),
    RegisterDef::new("SYS_PCBTEMP", reg::PCBTEMP, 1, true, Access::ReadOnly, Some(ChannelKind::Temperature)),
    RegisterDef::new("SYS_OUTTEMP", reg::OUTTEMP, 1, true, Access::ReadOnly, Some(ChannelKind::Temperature)),
    RegisterDef::new("SYS_STATUS", reg::STATUS, 1, false, Access::ReadWrite, None),
    RegisterDef::new("SYS_LIGHTS", reg::LIGHTS, 1, false, Access::ReadWriteMasked, None),
    RegisterDef::new("SYS_SENSE01", reg::SENSE_BASE, 12, true, Access::ReadOnly, Some(ChannelKind::Temperature)),
    RegisterDef::new("P01_STATE", reg::PORT_STATE_BASE, 12, false, Access::ReadWrite, None),
    RegisterDef::new("P01_CURRENT", reg::PORT_CURRENT_BASE, 12, true, Access::ReadOnly, Some(ChannelKind::Current)),
];

/// Threshold configuration for one SMARTbox
///
/// Channel order matches the config block: 48V, PSU_V, PSUTEMP, PCBTEMP,
/// OUTTEMP, then SENSE01..12. Registers 1001..1068 carry the channel
/// thresholds, 1069..1080 the per-port current trip points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmartboxThresholds {
    pub channels: [ThresholdSet; THRESHOLD_CHANNELS],
    pub port_trip: [i16; FEM_PORT_COUNT],
}

impl Default for SmartboxThresholds {
    /// Wide-open defaults: alarms at the ADC rails, warnings just inside
    fn default() -> Self {
        Self {
            channels: [ThresholdSet::new(i16::MAX, i16::MAX - 1, i16::MIN + 1, i16::MIN); THRESHOLD_CHANNELS],
            port_trip: [i16::MAX; FEM_PORT_COUNT],
        }
    }
}

impl SmartboxThresholds {
    /// Reject any channel violating `AL <= WL <= WH <= AH`
    pub fn validate(&self) -> PasdResult<()> {
        for (i, ch) in self.channels.iter().enumerate() {
            ch.validate().map_err(|e| {
                PasdError::invalid_range(format!("channel {}: {}", i + 1, e))
            })?;
        }
        Ok(())
    }

    /// The full configuration block, registers 1001..=1080 in order
    pub fn to_words(&self) -> Vec<u16> {
        let mut words = Vec::with_capacity(THRESHOLD_CHANNELS * 4 + FEM_PORT_COUNT);
        for ch in &self.channels {
            words.extend_from_slice(&ch.to_words());
        }
        for trip in &self.port_trip {
            words.push(*trip as u16);
        }
        words
    }
}

/// Operator intent for one FEM port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortIntent {
    /// Power this port while the device is online
    pub online_on: bool,
    /// Power this port while the device is offline
    pub offline_on: bool,
}

/// Decoded snapshot of the polled block
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SmartboxMirror {
    pub mbrv: u16,
    pub pcbrev: u16,
    pub cpuid: u32,
    pub chipid: [u8; 16],
    pub firmware_version: u16,
    pub uptime: u32,
    pub address_value: u16,
    pub incoming_voltage: f32,
    pub psu_voltage: f32,
    pub psu_temp: f32,
    pub pcb_temp: f32,
    pub outside_temp: f32,
    pub status_code: u16,
    pub health: Option<HealthState>,
    pub service_led: bool,
    pub indicator_code: u8,
    pub sense: [i16; FEM_PORT_COUNT],
    pub ports: [PortBitmap; FEM_PORT_COUNT],
    pub currents: [i16; FEM_PORT_COUNT],
}

impl SmartboxMirror {
    /// Decode a freshly polled block
    pub fn decode(image: &RegisterImage, cal: &CalibrationTable) -> Self {
        let mut chipid = [0u8; 16];
        chipid.copy_from_slice(&image.get_bytes(reg::CHIPID, 8));

        let lights = image.get_word(reg::LIGHTS);
        let status_code = image.get_word(reg::STATUS);

        let mut mirror = Self {
            mbrv: image.get_word(reg::MBRV),
            pcbrev: image.get_word(reg::PCBREV),
            cpuid: image.get_u32(reg::CPUID),
            chipid,
            firmware_version: image.get_word(reg::FIRMVER),
            uptime: image.get_u32(reg::UPTIME),
            address_value: image.get_word(reg::ADDRESS),
            incoming_voltage: cal.to_engineering(ChannelKind::Voltage48, image.get_i16(reg::V48)),
            psu_voltage: cal.to_engineering(ChannelKind::Voltage5, image.get_i16(reg::PSU_V)),
            psu_temp: cal.to_engineering(ChannelKind::Temperature, image.get_i16(reg::PSUTEMP)),
            pcb_temp: cal.to_engineering(ChannelKind::Temperature, image.get_i16(reg::PCBTEMP)),
            outside_temp: cal.to_engineering(ChannelKind::Temperature, image.get_i16(reg::OUTTEMP)),
            status_code,
            health: HealthState::from_code(status_code),
            service_led: (lights >> 8) != 0,
            indicator_code: (lights & 0xFF) as u8,
            ..Default::default()
        };
        for i in 0..FEM_PORT_COUNT {
            mirror.sense[i] = image.get_i16(reg::SENSE_BASE + i as u16);
            mirror.ports[i] = PortBitmap::decode(image.get_word(reg::PORT_STATE_BASE + i as u16));
            mirror.currents[i] = image.get_i16(reg::PORT_CURRENT_BASE + i as u16);
        }
        mirror
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BreakerRetry {
    attempts: u8,
    last_attempt: Option<Instant>,
}

/// What the station's breaker policy should do next for a tripped port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerAction {
    /// Send a reset pulse now
    Reset,
    /// Inside the spacing window, try again later
    Wait,
    /// Budget spent; surface `BreakerPersistent` and drop the intent
    Persistent,
}

/// One SMARTbox on the station bus
pub struct Smartbox {
    pub address: u8,
    pub mirror: SmartboxMirror,
    pub thresholds: SmartboxThresholds,
    pub intents: [PortIntent; FEM_PORT_COUNT],
    /// Unix timestamp of the last successful poll
    pub readtime: i64,
    /// Set after [`STALE_AFTER_FAILURES`] consecutive poll failures
    pub stale: bool,
    consecutive_failures: u8,
    breaker: [BreakerRetry; FEM_PORT_COUNT],
}

impl Smartbox {
    /// Create a controller; no traffic is generated until it is polled
    pub fn new(address: u8) -> Self {
        Self {
            address,
            mirror: SmartboxMirror::default(),
            thresholds: SmartboxThresholds::default(),
            intents: [PortIntent::default(); FEM_PORT_COUNT],
            readtime: 0,
            stale: false,
            consecutive_failures: 0,
            breaker: [BreakerRetry::default(); FEM_PORT_COUNT],
        }
    }

    /// Register number of a port's state register (`port` is 0-based)
    pub fn port_state_regnum(port: usize) -> u16 {
        assert!(port < FEM_PORT_COUNT);
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
                self.mirror = SmartboxMirror::decode(&image, cal);
                self.readtime = clock.now_unix();
                self.consecutive_failures = 0;
                self.stale = false;
                // A clear breaker forgets the retry history for that port
                for (i, retry) in self.breaker.iter_mut().enumerate() {
                    if !self.mirror.ports[i].breaker {
                        *retry = BreakerRetry::default();
                    }
                }
                debug!("SMARTbox {} polled: status {}", self.address, self.mirror.status_code);
                Ok(())
            }
            Err(err) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures == STALE_AFTER_FAILURES {
                    self.stale = true;
                    warn!(
                        "SMARTbox {} mirror stale after {} failed polls (last good poll {})",
                        self.address, STALE_AFTER_FAILURES, self.readtime
                    );
                }
                Err(err)
            }
        }
    }

    /// Read just SYS_UPTIME, used by the discovery procedure
    pub async fn read_uptime<S: ByteStream>(&self, master: &AsciiMaster<S>) -> PasdResult<u32> {
        let words = master.read_holding(self.address, reg::UPTIME, 2).await?;
        Ok((u32::from(words[0]) << 16) | u32::from(words[1]))
    }

    /// Push the full configuration and bring the device out of
    /// UNINITIALISED
    ///
    /// The threshold block (channel thresholds plus port current trips,
    /// registers 1001..=1080) goes in one 0x10 transaction, the port
    /// desired-state bits in a second, and a SYS_STATUS write triggers the
    /// firmware's re-evaluation from current readings.
    pub async fn configure<S: ByteStream>(&mut self, master: &AsciiMaster<S>) -> PasdResult<()> {
        self.thresholds.validate()?;

        let words = self.thresholds.to_words();
        master.write_registers(self.address, reg::CONF_BASE, &words).await?;
        self.push_intents(master).await?;
        master.write_register(self.address, reg::STATUS, 1).await?;
        debug!("SMARTbox {} configured", self.address);
        Ok(())
    }

    /// Write the desired-state fields of every port from the stored intents
    pub async fn push_intents<S: ByteStream>(&self, master: &AsciiMaster<S>) -> PasdResult<()> {
        let words: Vec<u16> = self
            .intents
            .iter()
            .map(|it| PortWrite::with_intents(Some(it.online_on), Some(it.offline_on)).word())
            .collect();
        master.write_registers(self.address, reg::PORT_STATE_BASE, &words).await
    }

    /// Ports whose firmware desired-state no longer matches the stored
    /// intent (after an operator change, or a device power cycle)
    pub fn divergent_ports(&self) -> Vec<usize> {
        (0..FEM_PORT_COUNT)
            .filter(|&i| {
                let p = &self.mirror.ports[i];
                p.desire_on != Some(self.intents[i].online_on)
                    || p.desire_off != Some(self.intents[i].offline_on)
            })
            .collect()
    }

    /// Decide the next move for a tripped breaker on `port` (0-based)
    pub fn breaker_action(&mut self, port: usize, now: Instant) -> BreakerAction {
        let retry = &mut self.breaker[port];
        if retry.attempts >= BREAKER_RESET_BUDGET {
            return BreakerAction::Persistent;
        }
        if let Some(last) = retry.last_attempt {
            if now.duration_since(last) < BREAKER_RESET_SPACING {
                return BreakerAction::Wait;
            }
        }
        retry.attempts += 1;
        retry.last_attempt = Some(now);
        BreakerAction::Reset
    }

    /// Number of reset attempts already spent on `port`
    pub fn breaker_attempts(&self, port: usize) -> u8 {
        self.breaker[port].attempts
    }

    /// Send a breaker reset pulse to one port
    pub async fn send_breaker_reset<S: ByteStream>(
        &self,
        master: &AsciiMaster<S>,
        port: usize,
    ) -> PasdResult<()> {
        master
            .write_register(self.address, Self::port_state_regnum(port), PortWrite::breaker_reset().word())
            .await
    }

    /// The stale-mirror condition as an error, for operator surfaces
    pub fn stale_error(&self) -> Option<PasdError> {
        self.stale.then(|| PasdError::StaleMirror { address: self.address, readtime: self.readtime })
    }
}
