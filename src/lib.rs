//! # PaSD MCCS - Station Monitor & Control
//!
//! Local Monitor & Control subsystem (MCCS) for one Power and Signal
//! Distribution (PaSD) station of a low-frequency radio telescope. A station
//! is one Field Node Distribution Hub (FNDH) plus up to 24 SMARTboxes on a
//! shared half-duplex Modbus-ASCII multidrop bus, reached through an
//! ethernet-serial bridge inside the FNDH.
//!
//! ## What this crate does
//!
//! - **Master side**: polls telemetry from every SMARTbox and the FNDH,
//!   pushes threshold configuration, drives antenna-feed ports on and off,
//!   and discovers which SMARTbox hangs off which FNDH PDoC port by timing
//!   power-up against uptime counters.
//! - **Slave side**: answers Modbus requests from a technician's hand-held
//!   Service Interface Device (SID) at station address 63, exposing the
//!   antenna ↔ (SMARTbox, port) map, the PDoC map, and a service-log
//!   read/write cursor.
//!
//! ## Supported function codes
//!
//! | Code | Function | Master | Slave |
//! |------|----------|--------|-------|
//! | 0x03 | Read Holding Registers | yes | yes |
//! | 0x06 | Write Single Register | yes | yes |
//! | 0x10 | Write Multiple Registers | yes | yes |
//!
//! Broadcast is not used on this bus.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use pasd_mccs::station::{Station, StationConfig};
//! use pasd_mccs::store::MemoryStore;
//! use pasd_mccs::transport::{AsciiMaster, TcpEndpoint};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> pasd_mccs::PasdResult<()> {
//!     // Connect to the ethernet-serial bridge in the FNDH
//!     let endpoint = TcpEndpoint::connect("134.7.50.185:5000").await?;
//!     let master = AsciiMaster::new(endpoint);
//!
//!     let store = Arc::new(MemoryStore::new());
//!     let mut station = Station::new(StationConfig::default(), master, store);
//!
//!     // Discover the PDoC -> SMARTbox wiring, then poll forever
//!     station.startup().await?;
//!     station.mainloop().await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐      ┌──────────────────┐
//! │     Station      │      │    SID server    │
//! │  (orchestrator)  │      │  (slave surface) │
//! └──────────────────┘      └──────────────────┘
//!          │                         │
//! ┌──────────────────┐      ┌──────────────────┐
//! │Device controllers│      │  Shared station  │
//! │ (SMARTbox, FNDH) │◄────►│  state + store   │
//! └──────────────────┘      └──────────────────┘
//!          │                         │
//! ┌──────────────────┐      ┌──────────────────┐
//! │   AsciiMaster    │      │   FrameDecoder   │
//! │  (transactions)  │      │ (slave endpoint) │
//! └──────────────────┘      └──────────────────┘
//!          │                         │
//!        serial bus            network listener
//! ```

/// Error types and result handling
pub mod error;

/// Modbus-ASCII frame codec and protocol definitions
pub mod protocol;

/// Byte-stream endpoints and the master-side transaction layer
pub mod transport;

/// Typed register images and device schema tables
pub mod registers;

/// Four-level analog threshold alarm state machine
pub mod thresholds;

/// Per-port desired/override/power bitfield state machine
pub mod ports;

/// Raw ADU to engineering-unit calibration
pub mod conversion;

/// SMARTbox device controller
pub mod smartbox;

/// FNDH device controller
pub mod fndh;

/// Station orchestrator: discovery, polling, breaker policy
pub mod station;

/// Persistence seam: antenna map, PDoC map, service log
pub mod store;

/// MCCS slave surface for the technician's SID
pub mod server;

/// Clock seam, poll metrics, formatting helpers
pub mod utils;

// Re-export main types for convenience
pub use error::{PasdError, PasdResult};
pub use protocol::{Decoded, ExceptionCode, Frame, FrameDecoder, FunctionCode};
pub use transport::{AsciiMaster, ByteStream, TcpEndpoint, TransportStats};
pub use registers::RegisterImage;
pub use thresholds::{HealthState, ThresholdSet};
pub use ports::PortBitmap;
pub use smartbox::Smartbox;
pub use fndh::Fndh;
pub use station::{Station, StationConfig};
pub use store::{MemoryStore, ServiceLogEntry, StationStore};
pub use server::{SidServer, SidServerConfig};
pub use utils::{Clock, SystemClock};

/// Modbus address of the FNDH microcontroller
pub const FNDH_ADDRESS: u8 = 31;

/// Modbus address the MCCS listens on for SID traffic
pub const MCCS_ADDRESS: u8 = 63;

/// Highest SMARTbox address assigned in production stations
pub const MAX_SMARTBOX_ADDRESS: u8 = 24;

/// Highest SMARTbox address probed during discovery (lab units included)
pub const MAX_CANDIDATE_ADDRESS: u8 = 30;

/// Number of PDoC ports on the FNDH
pub const PDOC_PORT_COUNT: usize = 28;

/// Number of FEM ports on a SMARTbox
pub const FEM_PORT_COUNT: usize = 12;

/// Number of physical antennas a station can map
pub const ANTENNA_COUNT: usize = 256;

/// Maximum registers in a single 0x03 read
pub const MAX_READ_REGISTERS: u16 = 125;

/// Maximum registers in a single 0x10 write (byte count must fit)
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Default per-transaction deadline in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 500;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
