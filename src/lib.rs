//! A cyclic EtherCAT MainDevice runtime.
//!
//! `etherweave` drives an EtherCAT segment over raw Ethernet frames: it owns frame
//! scheduling, SubDevice enumeration and configuration, cyclic process data exchange through
//! logical-address domains, and the mailbox protocols (CoE, FoE) used for acyclic services.
//!
//! The design is deliberately synchronous. An application thread steps the master once per
//! real-time cycle; between application PDUs the internal master state machine appends one
//! PDU per cycle of its own to make progress on scanning, configuration, distributed clocks
//! and queued requests. Before the application takes over, an idle thread performs the same
//! cycle.
//!
//! ```no_run
//! use etherweave::{
//!     Domain, EthernetDevice, MainDevice, MainDeviceConfig, PdoEntryDef, SmDirection,
//!     SmWatchdog,
//! };
//!
//! # fn nic() -> Box<dyn EthernetDevice> { unimplemented!() }
//! # fn main() -> Result<(), etherweave::error::Error> {
//! let mut master = MainDevice::new(nic(), MainDeviceConfig::default());
//!
//! master.start()?;
//!
//! // Describe the first SubDevice: one output byte in PDO 0x1600
//! let config = master.subdevice_config(0, 0, 0x0000_0002, 0x07d4_3052)?;
//!
//! config.sync_manager(2, SmDirection::Output, SmWatchdog::Default)?;
//! config.pdo_assignment(2, &[0x1600])?;
//! config.pdo_mapping(0x1600, &[PdoEntryDef::new(0x7000, 1, 8)])?;
//!
//! let domain: Domain = master.domain()?;
//!
//! let output_offset = domain.register_pdo_entry(&config, 0x7000, 1)?;
//!
//! master.activate()?;
//!
//! loop {
//!     master.receive()?;
//!     domain.process()?;
//!
//!     domain.data()[output_offset] ^= 0x01;
//!
//!     domain.queue()?;
//!     master.send()?;
//!
//!     // Sleep until the next cycle boundary
//! }
//! # }
//! ```

// This mod must come first so the others see its macros.
pub(crate) mod fmt;

mod al_control;
mod al_status_code;
mod command;
mod dc;
mod dl_status;
mod domain;
mod eeprom;
pub mod error;
mod ethernet;
mod fmmu;
mod foe;
mod mailbox;
mod maindevice;
mod pdu;
mod register;
mod request;
mod sii;
mod subdevice;
mod subdevice_config;
mod subdevice_state;
mod sync_manager_channel;

pub(crate) mod coe;

pub use al_control::{AlControl, AlStatus};
pub use al_status_code::AlStatusCode;
pub use coe::info::{SdoDictionary, SdoEntry, SdoEntryAccess, SdoObject};
pub use command::{Command, Reads, Writes};
pub use dl_status::DlStatus;
pub use domain::{DomainState, WcState};
pub use eeprom::{EepromImage, ParsedCategories, SubDeviceIdentity};
pub use ethernet::{DeviceStats, EthernetAddress, EthernetDevice, EthernetFrame};
pub use fmmu::Fmmu;
pub use foe::FoeStatus;
pub use mailbox::{MailboxHeader, MailboxProtocols, MailboxType};
pub use maindevice::{
    Domain, DomainDataGuard, MainDevice, MainDeviceConfig, MainDeviceStatus, Request,
    SubDeviceConfig,
};
pub use register::{RegisterAddress, SupportFlags};
pub use request::RequestState;
pub use subdevice::{BaseInfo, SubDeviceInfo};
pub use subdevice_config::{DcConfig, PdoEntryDef, SmDirection, SmWatchdog, WatchdogConfig};
pub use subdevice_state::SubDeviceState;
pub use sync_manager_channel::SyncManagerChannel;

/// Mask of the 11-bit length field shared by frame and PDU headers.
pub(crate) const LEN_MASK: u16 = 0b0000_0111_1111_1111;

/// EtherCAT frames are identified by this Ethertype.
pub(crate) const ETHERCAT_ETHERTYPE: u16 = 0x88a4;

/// The locally administered MAC address every frame is sent from.
///
/// The first SubDevice sets the U/L bit of this address when it returns a frame, which lets
/// the receive path drop our own outgoing broadcasts.
pub(crate) const MAINDEVICE_ADDR: EthernetAddress =
    EthernetAddress([0x10, 0x10, 0x10, 0x10, 0x10, 0x10]);
