//! Station orchestrator
//!
//! One [`Station`] instance owns the master side of the bus for a whole
//! station: it discovers which SMARTbox hangs off which FNDH PDoC port,
//! pushes configuration, polls every device round-robin, tracks
//! online/offline state, and runs the breaker-reset policy. The antenna
//! and PDoC maps it maintains are shared with the SID-facing slave surface
//! through a single mutex region; critical sections are map lookups and
//! mirror updates only, never bus I/O.

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::conversion::CalibrationTable;
use crate::error::{PasdError, PasdResult};
use crate::fndh::Fndh;
use crate::ports::PortWrite;
use crate::smartbox::{BreakerAction, Smartbox};
use crate::store::{DeviceThresholds, StationStore};
use crate::transport::{AsciiMaster, ByteStream};
use crate::utils::{Clock, OperationTimer, PollMetrics, SystemClock};
use crate::{
    registers::status_code, ANTENNA_COUNT, FEM_PORT_COUNT, FNDH_ADDRESS, MAX_CANDIDATE_ADDRESS,
    MAX_SMARTBOX_ADDRESS, PDOC_PORT_COUNT,
};

/// Station orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    /// Station identifier, unique across the telescope
    pub station_id: u16,
    /// Modbus address of the FNDH microcontroller
    pub fndh_address: u8,
    /// Full-station poll cadence
    pub poll_interval_secs: u64,
    /// Minimum quiet gap between master transactions, to leave room for
    /// the SID on the shared bus
    pub transaction_gap_ms: u64,
    /// Wait after powering each PDoC port during discovery
    pub discovery_delay_secs: u64,
    /// Two candidate SMARTboxes with uptimes closer than this tie the
    /// discovery and abort it
    pub discovery_tie_secs: u32,
    /// Extra attempts after a transaction timeout before the device is
    /// declared unreachable for this cycle
    pub timeout_retries: u8,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            station_id: 1,
            fndh_address: FNDH_ADDRESS,
            poll_interval_secs: 60,
            transaction_gap_ms: 10,
            discovery_delay_secs: 10,
            discovery_tie_secs: 1,
            timeout_retries: 2,
        }
    }
}

/// Antenna number to (SMARTbox, port) map
///
/// A partial injection: each register holds SMARTbox address in the high
/// byte and port number in the low byte, `0x0000` meaning disconnected.
/// No two antennas may share a non-zero pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AntennaMap {
    entries: Vec<u16>,
}

impl Default for AntennaMap {
    fn default() -> Self {
        Self::new()
    }
}

impl AntennaMap {
    /// An empty map: every antenna disconnected
    pub fn new() -> Self {
        Self { entries: vec![0; ANTENNA_COUNT] }
    }

    /// Mapping for one antenna (1-based), `None` when disconnected
    pub fn get(&self, antenna: u16) -> Option<(u8, u8)> {
        let value = *self.entries.get(antenna.checked_sub(1)? as usize)?;
        if value == 0 {
            None
        } else {
            Some(((value >> 8) as u8, (value & 0xFF) as u8))
        }
    }

    /// Assign one antenna, enforcing encoding ranges and injectivity
    pub fn set(&mut self, antenna: u16, smartbox: u8, port: u8) -> PasdResult<()> {
        let value = (u16::from(smartbox) << 8) | u16::from(port);
        let updated = self.with_write(antenna, &[value])?;
        *self = updated;
        Ok(())
    }

    /// Disconnect one antenna
    pub fn clear(&mut self, antenna: u16) {
        if let Some(index) = antenna.checked_sub(1) {
            if let Some(slot) = self.entries.get_mut(index as usize) {
                *slot = 0;
            }
        }
    }

    /// The raw register contents, one word per antenna
    pub fn words(&self) -> &[u16] {
        &self.entries
    }

    /// Apply a register write starting at antenna number `start`,
    /// returning the resulting map
    ///
    /// Validation is atomic: a malformed encoding or an injectivity
    /// violation anywhere in the window leaves the original map untouched.
    pub fn with_write(&self, start: u16, values: &[u16]) -> PasdResult<AntennaMap> {
        if start == 0 || (start as usize) + values.len() - 1 > ANTENNA_COUNT {
            return Err(PasdError::invalid_range(format!(
                "antenna window {}..{} outside 1..={}",
                start,
                start as usize + values.len() - 1,
                ANTENNA_COUNT
            )));
        }

        let mut updated = self.clone();
        for (i, &value) in values.iter().enumerate() {
            let antenna = start + i as u16;
            if value != 0 {
                let smartbox = (value >> 8) as u8;
                let port = (value & 0xFF) as u8;
                if smartbox == 0
                    || smartbox > MAX_SMARTBOX_ADDRESS
                    || port == 0
                    || port as usize > FEM_PORT_COUNT
                {
                    return Err(PasdError::invalid_range(format!(
                        "antenna {}: ({}, {}) outside SMARTbox 1..={} port 1..={}",
                        antenna, smartbox, port, MAX_SMARTBOX_ADDRESS, FEM_PORT_COUNT
                    )));
                }
            }
            updated.entries[(antenna - 1) as usize] = value;
        }

        updated.check_injective()?;
        Ok(updated)
    }

    /// No two antennas may claim the same non-zero (SMARTbox, port)
    fn check_injective(&self) -> PasdResult<()> {
        let mut seen: BTreeMap<u16, u16> = BTreeMap::new();
        for (i, &value) in self.entries.iter().enumerate() {
            if value == 0 {
                continue;
            }
            if seen.insert(value, i as u16 + 1).is_some() {
                return Err(PasdError::MapInconsistent {
                    register: i as u16 + 1,
                    smartbox: (value >> 8) as u8,
                    port: (value & 0xFF) as u8,
                });
            }
        }
        Ok(())
    }
}

/// PDoC port to SMARTbox address map, total over all 28 ports
///
/// Zero means no SMARTbox was detected on that port. Populated only by
/// the discovery procedure; nothing else writes it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdocMap {
    pub ports: [u8; PDOC_PORT_COUNT],
}

impl PdocMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// SMARTbox on a PDoC port (1-based), `None` when empty
    pub fn get(&self, port: u8) -> Option<u8> {
        match self.ports.get((port as usize).checked_sub(1)?) {
            Some(0) | None => None,
            Some(&addr) => Some(addr),
        }
    }

    /// The PDoC port a SMARTbox was found on
    pub fn port_of(&self, smartbox: u8) -> Option<u8> {
        self.ports.iter().position(|&a| a == smartbox).map(|i| i as u8 + 1)
    }

    /// Register window contents for the slave surface
    pub fn words(&self) -> [u16; PDOC_PORT_COUNT] {
        let mut out = [0u16; PDOC_PORT_COUNT];
        for (i, &addr) in self.ports.iter().enumerate() {
            out[i] = u16::from(addr);
        }
        out
    }
}

/// State shared between the orchestrator and the SID slave surface
///
/// Guarded by one mutex; hold it only for lookups and updates, never
/// across bus I/O.
#[derive(Debug, Default)]
pub struct StationState {
    pub antennas: AntennaMap,
    pub pdoc: PdocMap,
}

impl StationState {
    pub fn new() -> Self {
        Self { antennas: AntennaMap::new(), pdoc: PdocMap::new() }
    }
}

/// Handle to the shared station state
pub type SharedState = Arc<Mutex<StationState>>;

/// The station orchestrator
pub struct Station<S: ByteStream> {
    config: StationConfig,
    master: AsciiMaster<S>,
    store: Arc<dyn StationStore>,
    clock: Arc<dyn Clock>,
    cal: CalibrationTable,
    pub fndh: Fndh,
    pub smartboxes: BTreeMap<u8, Smartbox>,
    state: SharedState,
    quiet: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    pub metrics: PollMetrics,
    /// `Some(true)` once startup completed, `Some(false)` after shutdown,
    /// `None` while the station state is unknown (mid-procedure failure)
    online: Option<bool>,
}

impl<S: ByteStream> Station<S> {
    /// Create a station with the system wall clock
    pub fn new(config: StationConfig, master: AsciiMaster<S>, store: Arc<dyn StationStore>) -> Self {
        Self::with_clock(config, master, store, Arc::new(SystemClock))
    }

    /// Create a station with an injected clock
    pub fn with_clock(
        config: StationConfig,
        master: AsciiMaster<S>,
        store: Arc<dyn StationStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let fndh = Fndh::new(config.fndh_address);
        Self {
            config,
            master,
            store,
            clock,
            cal: CalibrationTable::default(),
            fndh,
            smartboxes: BTreeMap::new(),
            state: Arc::new(Mutex::new(StationState::new())),
            quiet: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(false)),
            metrics: PollMetrics::new(),
            online: None,
        }
    }

    /// Shared state handle for the slave surface
    pub fn shared_state(&self) -> SharedState {
        self.state.clone()
    }

    /// Quiet-mode flag: while set, the poll loop leaves the bus alone so a
    /// technician's SID can use it freely
    pub fn quiet_flag(&self) -> Arc<AtomicBool> {
        self.quiet.clone()
    }

    /// Cooperative stop flag, observed at every sleep boundary
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// `Some(true)` when the station completed startup
    pub fn online(&self) -> Option<bool> {
        self.online
    }

    /// Minimum inter-transaction gap on the shared bus
    async fn gap(&self) {
        sleep(Duration::from_millis(self.config.transaction_gap_ms)).await;
    }

    /// Sleep in one-second slices; false means a stop was requested
    async fn sleep_cancellable(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.stop.load(Ordering::SeqCst) {
                return false;
            }
            let slice = remaining.min(Duration::from_secs(1));
            sleep(slice).await;
            remaining -= slice;
        }
        !self.stop.load(Ordering::SeqCst)
    }

    /// Load persisted maps and threshold sets
    pub async fn load_persisted(&mut self) -> PasdResult<()> {
        if let Some(map) = self.store.load_antenna_map().await? {
            self.state.lock().unwrap().antennas = map.clone();
            // Make sure a controller exists for every mapped SMARTbox
            for antenna in 1..=ANTENNA_COUNT as u16 {
                if let Some((addr, _)) = map.get(antenna) {
                    self.smartboxes.entry(addr).or_insert_with(|| Smartbox::new(addr));
                }
            }
        }
        if let Some(pdoc) = self.store.load_pdoc_map().await? {
            for (i, &addr) in pdoc.ports.iter().enumerate() {
                self.fndh.ports[i].smartbox_address = addr;
            }
            self.state.lock().unwrap().pdoc = pdoc;
        }
        if let Some(DeviceThresholds::Fndh(t)) = self.store.load_thresholds(self.config.fndh_address).await? {
            self.fndh.thresholds = t;
        }
        let addresses: Vec<u8> = self.smartboxes.keys().copied().collect();
        for addr in addresses {
            if let Some(DeviceThresholds::Smartbox(t)) = self.store.load_thresholds(addr).await? {
                self.smartboxes.get_mut(&addr).unwrap().thresholds = t;
            }
        }
        Ok(())
    }

    /// Poll the FNDH, retrying timeouts per the configured budget
    async fn poll_fndh(&mut self) -> PasdResult<()> {
        let mut last = PasdError::internal("no poll attempted");
        for attempt in 0..=self.config.timeout_retries {
            match self.fndh.poll(&self.master, self.clock.as_ref(), &self.cal).await {
                Ok(()) => return Ok(()),
                Err(err @ PasdError::Timeout { .. }) if attempt < self.config.timeout_retries => {
                    last = err;
                    self.gap().await;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last)
    }

    /// Poll one known SMARTbox, retrying timeouts per the configured budget
    async fn poll_smartbox(&mut self, address: u8) -> PasdResult<()> {
        let mut last = PasdError::internal("no poll attempted");
        for attempt in 0..=self.config.timeout_retries {
            let smartbox = self.smartboxes.get_mut(&address).expect("known SMARTbox");
            match smartbox.poll(&self.master, self.clock.as_ref(), &self.cal).await {
                Ok(()) => return Ok(()),
                Err(err @ PasdError::Timeout { .. }) if attempt < self.config.timeout_retries => {
                    last = err;
                    self.gap().await;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last)
    }

    /// Full startup: bring the FNDH to a healthy all-off state, run the
    /// PDoC discovery procedure, persist the map, then apply the real port
    /// configuration
    pub async fn startup(&mut self) -> PasdResult<()> {
        self.online = None;
        info!("station {} startup", self.config.station_id);

        self.load_persisted().await?;

        self.poll_fndh().await?;
        self.gap().await;

        self.fndh.configure_all_off(&self.master).await?;
        self.gap().await;

        self.discover().await?;

        self.fndh.configure_final(&self.master).await?;

        let pdoc = self.state.lock().unwrap().pdoc.clone();
        self.store.save_pdoc_map(&pdoc).await?;

        self.online = Some(true);
        info!("station {} online, {} SMARTboxes mapped", self.config.station_id, self.smartboxes.len());
        Ok(())
    }

    /// The PDoC -> SMARTbox discovery procedure
    ///
    /// Each port is powered in turn with a settle delay; any candidate
    /// address whose uptime reads back below twice the delay booted when
    /// this port came up. The lowest uptime wins; two candidates inside
    /// the tie window abort discovery for operator intervention.
    async fn discover(&mut self) -> PasdResult<()> {
        let delay = Duration::from_secs(self.config.discovery_delay_secs);
        let mut assigned: BTreeMap<u8, u8> = BTreeMap::new(); // smartbox -> port

        for port in 0..PDOC_PORT_COUNT {
            self.fndh.set_port(&self.master, port, true).await?;
            info!("discovery: PDoC port {} on", port + 1);
            if !self.sleep_cancellable(delay).await {
                return Err(PasdError::internal("discovery cancelled"));
            }

            let mut candidates: Vec<(u8, u32)> = Vec::new();
            for address in 1..=MAX_CANDIDATE_ADDRESS {
                if assigned.contains_key(&address) {
                    continue;
                }
                let probe = Smartbox::new(address);
                match probe.read_uptime(&self.master).await {
                    Ok(uptime) if u64::from(uptime) < 2 * self.config.discovery_delay_secs => {
                        candidates.push((address, uptime));
                    }
                    Ok(_) => {} // Was already up before this port, not ours
                    Err(_) => {} // Silent address
                }
                self.gap().await;
            }

            candidates.sort_by_key(|&(_, uptime)| uptime);
            if candidates.len() >= 2 {
                let (first, t0) = candidates[0];
                let (second, t1) = candidates[1];
                if t1 - t0 < self.config.discovery_tie_secs {
                    error!(
                        "discovery: SMARTboxes {} and {} both booted on PDoC port {} ({}s apart)",
                        first,
                        second,
                        port + 1,
                        t1 - t0
                    );
                    return Err(PasdError::AmbiguousMapping { port: port as u8 + 1, first, second });
                }
            }

            if let Some(&(address, uptime)) = candidates.first() {
                info!(
                    "discovery: SMARTbox {} on PDoC port {} (uptime {}s)",
                    address,
                    port + 1,
                    uptime
                );
                assigned.insert(address, port as u8 + 1);
                self.fndh.ports[port].smartbox_address = address;
                self.smartboxes.entry(address).or_insert_with(|| Smartbox::new(address));
            }
        }

        let mut state = self.state.lock().unwrap();
        state.pdoc = PdocMap::new();
        for (&address, &port) in &assigned {
            state.pdoc.ports[(port - 1) as usize] = address;
        }
        Ok(())
    }

    /// One full poll cycle: FNDH, then every candidate SMARTbox address
    pub async fn poll_cycle(&mut self) -> PasdResult<()> {
        if self.quiet.load(Ordering::SeqCst) {
            info!("quiet mode: skipping poll cycle");
            return Ok(());
        }

        let timer = OperationTimer::start("poll cycle");
        let mut polls = 0u64;
        let mut failures = 0u64;

        match self.poll_fndh().await {
            Ok(()) => {
                polls += 1;
                match self.fndh.mirror.status_code {
                    status_code::UNINITIALISED => {
                        warn!("FNDH is UNINITIALISED (power cycled?), running startup");
                        self.startup().await?;
                    }
                    status_code::POWERUP => {
                        warn!("FNDH requests a full power-up sequence (service button)");
                        self.startup().await?;
                    }
                    _ => {}
                }
            }
            Err(err) => {
                polls += 1;
                failures += 1;
                error!("FNDH poll failed: {}", err);
            }
        }
        self.gap().await;

        for address in 1..=MAX_CANDIDATE_ADDRESS {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            if self.smartboxes.contains_key(&address) {
                polls += 1;
                match self.poll_smartbox(address).await {
                    Ok(()) => self.service_smartbox(address).await?,
                    Err(err) => {
                        failures += 1;
                        warn!("SMARTbox {} poll failed: {}", address, err);
                    }
                }
            } else {
                // Probe unknown addresses once per cycle so boxes added in
                // the field get adopted without a restart
                let mut probe = Smartbox::new(address);
                if probe.poll(&self.master, self.clock.as_ref(), &self.cal).await.is_ok() {
                    info!("adopted SMARTbox at address {}", address);
                    self.smartboxes.insert(address, probe);
                    self.service_smartbox(address).await?;
                }
            }
            self.gap().await;
        }

        self.metrics.record_cycle(timer.stop(), polls, failures);
        Ok(())
    }

    /// Post-poll housekeeping for one SMARTbox: configuration pickup,
    /// powerdown requests, breaker policy, intent divergence
    async fn service_smartbox(&mut self, address: u8) -> PasdResult<()> {
        let status = self.smartboxes[&address].mirror.status_code;

        if status == status_code::UNINITIALISED {
            info!("SMARTbox {} is UNINITIALISED, configuring", address);
            if let Some(DeviceThresholds::Smartbox(t)) = self.store.load_thresholds(address).await? {
                self.smartboxes.get_mut(&address).unwrap().thresholds = t;
            }
            let smartbox = self.smartboxes.get_mut(&address).unwrap();
            if let Err(err) = smartbox.configure(&self.master).await {
                error!("SMARTbox {} configuration failed: {}", address, err);
            }
            self.gap().await;
            return Ok(());
        }

        if status == status_code::POWERDOWN {
            // Technician long-press: hold the feeding PDoC port off until
            // the override is cleared at the FNDH
            let port = self.state.lock().unwrap().pdoc.port_of(address);
            if let Some(port) = port {
                warn!("SMARTbox {} requests powerdown, forcing PDoC port {} off", address, port);
                self.fndh.force_port_off(&self.master, (port - 1) as usize).await?;
                self.gap().await;
            } else {
                warn!("SMARTbox {} requests powerdown but is not on any known PDoC port", address);
            }
            return Ok(());
        }

        self.run_breaker_policy(address).await?;

        let divergent = self.smartboxes[&address].divergent_ports();
        if !divergent.is_empty() {
            info!("SMARTbox {} ports {:?} diverge from intent, rewriting", address, divergent);
            let smartbox = &self.smartboxes[&address];
            smartbox.push_intents(&self.master).await?;
            self.gap().await;
        }
        Ok(())
    }

    /// Up to three spaced reset pulses per tripped breaker, then give up,
    /// clear the online-ON intent, and surface the condition
    async fn run_breaker_policy(&mut self, address: u8) -> PasdResult<()> {
        let now = Instant::now();
        for port in 0..FEM_PORT_COUNT {
            let (tripped, wanted_on) = {
                let smartbox = &self.smartboxes[&address];
                (smartbox.mirror.ports[port].breaker, smartbox.intents[port].online_on)
            };
            if !tripped || !wanted_on {
                continue;
            }
            let action = self.smartboxes.get_mut(&address).unwrap().breaker_action(port, now);
            match action {
                BreakerAction::Reset => {
                    let smartbox = &self.smartboxes[&address];
                    info!(
                        "resetting breaker on SMARTbox {} port {} (attempt {})",
                        address,
                        port + 1,
                        smartbox.breaker_attempts(port)
                    );
                    smartbox.send_breaker_reset(&self.master, port).await?;
                    self.gap().await;
                }
                BreakerAction::Wait => {}
                BreakerAction::Persistent => {
                    let smartbox = self.smartboxes.get_mut(&address).unwrap();
                    let attempts = smartbox.breaker_attempts(port);
                    smartbox.intents[port].online_on = false;
                    error!(
                        "{}",
                        PasdError::BreakerPersistent { address, port: port as u8 + 1, attempts }
                    );
                    // Write the dropped intent so the firmware stops
                    // re-closing onto the fault
                    let word = PortWrite::with_intents(Some(false), None).word();
                    self.master
                        .write_register(address, Smartbox::port_state_regnum(port), word)
                        .await?;
                    self.gap().await;
                }
            }
        }
        Ok(())
    }

    /// Power down every PDoC port
    pub async fn shutdown(&mut self) -> PasdResult<()> {
        info!("station {} shutdown: all PDoC ports off", self.config.station_id);
        for intent in self.fndh.intents.iter_mut() {
            intent.online_on = false;
            intent.offline_on = false;
        }
        match self.fndh.push_intents(&self.master).await {
            Ok(()) => {
                self.online = Some(false);
                Ok(())
            }
            Err(err) => {
                // We no longer know what state the ports are in
                self.online = None;
                Err(err)
            }
        }
    }

    /// Poll forever at the configured cadence until the stop flag is set
    pub async fn mainloop(&mut self) -> PasdResult<()> {
        let interval = Duration::from_secs(self.config.poll_interval_secs);
        loop {
            if let Err(err) = self.poll_cycle().await {
                error!("poll cycle failed: {}", err);
            }
            if !self.sleep_cancellable(interval).await {
                info!("station {} mainloop stopped", self.config.station_id);
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_antenna_map_set_get() {
        let mut map = AntennaMap::new();
        map.set(7, 3, 5).unwrap();
        assert_eq!(map.get(7), Some((3, 5)));
        assert_eq!(map.get(8), None);
        map.clear(7);
        assert_eq!(map.get(7), None);
    }

    #[test]
    fn test_antenna_map_rejects_duplicate_pair() {
        let mut map = AntennaMap::new();
        map.set(7, 3, 5).unwrap();
        let err = map.set(42, 3, 5).unwrap_err();
        assert!(matches!(err, PasdError::MapInconsistent { smartbox: 3, port: 5, .. }));
        // Atomic: antenna 7 still holds the pair, antenna 42 untouched
        assert_eq!(map.get(7), Some((3, 5)));
        assert_eq!(map.get(42), None);
    }

    #[test]
    fn test_antenna_map_rejects_bad_encoding() {
        let map = AntennaMap::new();
        // Port 13 does not exist
        assert!(matches!(
            map.with_write(1, &[0x030D]),
            Err(PasdError::InvalidRange { .. })
        ));
        // SMARTbox 25 is outside the production range
        assert!(matches!(
            map.with_write(1, &[0x1901]),
            Err(PasdError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_antenna_map_multi_write_is_atomic() {
        let mut map = AntennaMap::new();
        map.set(7, 3, 5).unwrap();
        // Second value in the window collides with antenna 7
        let err = map.with_write(41, &[0x0101, 0x0305]).unwrap_err();
        assert!(matches!(err, PasdError::MapInconsistent { .. }));
        assert_eq!(map.get(41), None);
    }

    #[test]
    fn test_antenna_map_move_within_one_write() {
        let mut map = AntennaMap::new();
        map.set(7, 3, 5).unwrap();
        // Moving the pair from antenna 7 to antenna 8 in one window is
        // consistent in the resulting map
        let updated = map.with_write(7, &[0x0000, 0x0305]).unwrap();
        assert_eq!(updated.get(7), None);
        assert_eq!(updated.get(8), Some((3, 5)));
    }

    #[test]
    fn test_pdoc_map() {
        let mut map = PdocMap::new();
        map.ports[3] = 17;
        assert_eq!(map.get(4), Some(17));
        assert_eq!(map.get(5), None);
        assert_eq!(map.port_of(17), Some(4));
        assert_eq!(map.words()[3], 17);
    }

    #[test]
    fn test_config_defaults() {
        let config = StationConfig::default();
        assert_eq!(config.fndh_address, FNDH_ADDRESS);
        assert_eq!(config.poll_interval_secs, 60);
        assert_eq!(config.transaction_gap_ms, 10);
        assert_eq!(config.timeout_retries, 2);
    }

    #[test]
    fn test_config_deserialises_with_defaults() {
        let config: StationConfig = serde_json::from_str(r#"{"station_id": 42}"#).unwrap();
        assert_eq!(config.station_id, 42);
        assert_eq!(config.discovery_delay_secs, 10);
    }
}
