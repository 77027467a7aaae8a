//! Persistence seam for station state
//!
//! The MCCS itself is stateless across restarts except for what lives
//! behind [`StationStore`]: the antenna map, the discovered PDoC map,
//! per-device threshold sets, and the append-only service log. In the
//! field these records belong to a site-wide database; [`MemoryStore`] is
//! the reference implementation used by tests and the simulator rig, with
//! a JSON snapshot for simple file-backed deployments.
//!
//! Service-log entries persist the filter predicate they were filed under
//! (antenna number, chip ID, or neither for station-wide), and queries are
//! answered in two distinct modes rather than conflating "station-wide
//! entries only" with "everything at this station".

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{PasdError, PasdResult};
use crate::fndh::FndhThresholds;
use crate::smartbox::SmartboxThresholds;
use crate::station::{AntennaMap, PdocMap};

/// Longest service-log message text, leaving room for the NUL terminator
/// inside the 123-register message window
pub const MAX_MESSAGE_LEN: usize = 245;

/// One service-log entry
///
/// `antenna` and `chipid` record the predicate the entry was filed under:
/// at most one of them is non-zero, and both zero means station-wide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLogEntry {
    pub antenna: u16,
    pub chipid: [u8; 16],
    pub timestamp: i64,
    pub message: String,
}

impl ServiceLogEntry {
    /// True if this entry was filed station-wide (no antenna, no chip ID)
    pub fn is_station_wide(&self) -> bool {
        self.antenna == 0 && self.chipid == [0u8; 16]
    }
}

/// Filter predicate for reading or filing log entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilter {
    pub antenna: u16,
    pub chipid: [u8; 16],
}

impl LogFilter {
    /// Station-wide filter (both fields zero)
    pub fn station() -> Self {
        Self { antenna: 0, chipid: [0; 16] }
    }

    /// Filter by physical antenna number
    pub fn antenna(antenna: u16) -> Self {
        Self { antenna, chipid: [0; 16] }
    }

    /// Filter by device chip ID
    pub fn chipid(chipid: [u8; 16]) -> Self {
        Self { antenna: 0, chipid }
    }

    /// Enforce the mutual-exclusion constraint: at most one of antenna and
    /// chip ID may be non-zero
    pub fn validate(&self) -> PasdResult<()> {
        if self.antenna != 0 && self.chipid != [0u8; 16] {
            return Err(PasdError::invalid_range(
                "log filter sets both antenna and chip ID",
            ));
        }
        Ok(())
    }

    /// Does an entry satisfy this filter under the given mode?
    pub fn matches(&self, entry: &ServiceLogEntry, mode: LogQueryMode) -> bool {
        if self.antenna != 0 {
            entry.antenna == self.antenna
        } else if self.chipid != [0u8; 16] {
            entry.chipid == self.chipid
        } else {
            match mode {
                LogQueryMode::StationOnly => entry.is_station_wide(),
                LogQueryMode::AnyScope => true,
            }
        }
    }
}

/// How a station-wide filter (antenna and chip ID both zero) is answered
///
/// The source register documentation leaves this unresolved, so both
/// interpretations are first-class instead of being conflated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogQueryMode {
    /// Only entries that were themselves filed station-wide
    StationOnly,
    /// Every entry at this station, whatever it was filed against
    AnyScope,
}

/// Threshold configuration for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceThresholds {
    Smartbox(SmartboxThresholds),
    Fndh(FndhThresholds),
}

/// Station persistence interface
///
/// Implementations must make each call atomic with respect to the others;
/// callers hold no lock across calls.
#[async_trait]
pub trait StationStore: Send + Sync {
    async fn load_antenna_map(&self) -> PasdResult<Option<AntennaMap>>;
    async fn save_antenna_map(&self, map: &AntennaMap) -> PasdResult<()>;

    async fn load_pdoc_map(&self) -> PasdResult<Option<PdocMap>>;
    async fn save_pdoc_map(&self, map: &PdocMap) -> PasdResult<()>;

    async fn load_thresholds(&self, address: u8) -> PasdResult<Option<DeviceThresholds>>;
    async fn save_thresholds(&self, address: u8, thresholds: &DeviceThresholds) -> PasdResult<()>;

    /// Append one entry; the message is truncated to [`MAX_MESSAGE_LEN`]
    async fn append_log(&self, entry: ServiceLogEntry) -> PasdResult<()>;

    /// Fetch the `lognum`-th entry matching `filter`, newest first
    /// (`lognum` 0 is the most recent)
    async fn query_log(
        &self,
        filter: &LogFilter,
        lognum: u32,
        mode: LogQueryMode,
    ) -> PasdResult<Option<ServiceLogEntry>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoryInner {
    antenna_map: Option<AntennaMap>,
    pdoc_map: Option<PdocMap>,
    thresholds: HashMap<u8, DeviceThresholds>,
    log: Vec<ServiceLogEntry>,
}

/// In-memory store with a JSON snapshot
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialise the whole store to JSON
    pub fn to_json(&self) -> PasdResult<String> {
        let inner = self.inner.read().unwrap();
        Ok(serde_json::to_string_pretty(&*inner)?)
    }

    /// Restore a store from a JSON snapshot
    pub fn from_json(json: &str) -> PasdResult<Self> {
        let inner: MemoryInner = serde_json::from_str(json)?;
        Ok(Self { inner: RwLock::new(inner) })
    }

    /// Number of log entries held
    pub fn log_len(&self) -> usize {
        self.inner.read().unwrap().log.len()
    }
}

#[async_trait]
impl StationStore for MemoryStore {
    async fn load_antenna_map(&self) -> PasdResult<Option<AntennaMap>> {
        Ok(self.inner.read().unwrap().antenna_map.clone())
    }

    async fn save_antenna_map(&self, map: &AntennaMap) -> PasdResult<()> {
        self.inner.write().unwrap().antenna_map = Some(map.clone());
        Ok(())
    }

    async fn load_pdoc_map(&self) -> PasdResult<Option<PdocMap>> {
        Ok(self.inner.read().unwrap().pdoc_map.clone())
    }

    async fn save_pdoc_map(&self, map: &PdocMap) -> PasdResult<()> {
        self.inner.write().unwrap().pdoc_map = Some(map.clone());
        Ok(())
    }

    async fn load_thresholds(&self, address: u8) -> PasdResult<Option<DeviceThresholds>> {
        Ok(self.inner.read().unwrap().thresholds.get(&address).cloned())
    }

    async fn save_thresholds(&self, address: u8, thresholds: &DeviceThresholds) -> PasdResult<()> {
        self.inner.write().unwrap().thresholds.insert(address, thresholds.clone());
        Ok(())
    }

    async fn append_log(&self, mut entry: ServiceLogEntry) -> PasdResult<()> {
        if entry.message.len() > MAX_MESSAGE_LEN {
            let mut cut = MAX_MESSAGE_LEN;
            while !entry.message.is_char_boundary(cut) {
                cut -= 1;
            }
            entry.message.truncate(cut);
        }
        self.inner.write().unwrap().log.push(entry);
        Ok(())
    }

    async fn query_log(
        &self,
        filter: &LogFilter,
        lognum: u32,
        mode: LogQueryMode,
    ) -> PasdResult<Option<ServiceLogEntry>> {
        filter.validate()?;
        let inner = self.inner.read().unwrap();
        Ok(inner
            .log
            .iter()
            .rev()
            .filter(|e| filter.matches(e, mode))
            .nth(lognum as usize)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(antenna: u16, chip: u8, ts: i64, msg: &str) -> ServiceLogEntry {
        let mut chipid = [0u8; 16];
        chipid[0] = chip;
        ServiceLogEntry { antenna, chipid, timestamp: ts, message: msg.to_string() }
    }

    #[tokio::test]
    async fn test_filter_mutual_exclusion() {
        let mut f = LogFilter::antenna(7);
        assert!(f.validate().is_ok());
        f.chipid[3] = 1;
        assert!(f.validate().is_err());
    }

    #[tokio::test]
    async fn test_query_newest_first() {
        let store = MemoryStore::new();
        store.append_log(entry(7, 0, 100, "old")).await.unwrap();
        store.append_log(entry(7, 0, 200, "new")).await.unwrap();

        let got = store
            .query_log(&LogFilter::antenna(7), 0, LogQueryMode::AnyScope)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.message, "new");

        let got = store
            .query_log(&LogFilter::antenna(7), 1, LogQueryMode::AnyScope)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.message, "old");
    }

    #[tokio::test]
    async fn test_station_wide_query_modes() {
        let store = MemoryStore::new();
        store.append_log(entry(0, 0, 100, "station note")).await.unwrap();
        store.append_log(entry(12, 0, 200, "antenna note")).await.unwrap();
        store.append_log(entry(0, 9, 300, "chip note")).await.unwrap();

        // StationOnly sees entries filed with neither antenna nor chip ID
        let got = store
            .query_log(&LogFilter::station(), 0, LogQueryMode::StationOnly)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.message, "station note");
        assert!(store
            .query_log(&LogFilter::station(), 1, LogQueryMode::StationOnly)
            .await
            .unwrap()
            .is_none());

        // AnyScope sees all three
        let got = store
            .query_log(&LogFilter::station(), 0, LogQueryMode::AnyScope)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.message, "chip note");
        assert!(store
            .query_log(&LogFilter::station(), 2, LogQueryMode::AnyScope)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_message_truncated_on_append() {
        let store = MemoryStore::new();
        store.append_log(entry(0, 0, 1, &"x".repeat(400))).await.unwrap();
        let got = store
            .query_log(&LogFilter::station(), 0, LogQueryMode::StationOnly)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.message.len(), MAX_MESSAGE_LEN);
    }

    #[tokio::test]
    async fn test_json_round_trip() {
        let store = MemoryStore::new();
        store.append_log(entry(3, 0, 50, "note")).await.unwrap();
        let mut map = AntennaMap::new();
        map.set(1, 3, 5).unwrap();
        store.save_antenna_map(&map).await.unwrap();

        let restored = MemoryStore::from_json(&store.to_json().unwrap()).unwrap();
        assert_eq!(restored.log_len(), 1);
        let map = restored.load_antenna_map().await.unwrap().unwrap();
        assert_eq!(map.get(1), Some((3, 5)));
    }
}
