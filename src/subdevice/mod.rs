//! The MainDevice-side record of one SubDevice on the ring.

pub(crate) mod config;
pub(crate) mod scan;

use crate::{
    al_status_code::AlStatusCode,
    coe::info::SdoDictionary,
    dl_status::DlStatus,
    eeprom::{EepromImage, ParsedCategories, SubDeviceIdentity},
    mailbox::{MailboxGeometry, MailboxProtocols},
    register::SupportFlags,
    subdevice_state::SubDeviceState,
};
use std::time::Instant;

/// ESC base information from registers `0x0000..0x000a`.
#[derive(Debug, Default, Copy, Clone, PartialEq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 10)]
pub struct BaseInfo {
    /// ESC type.
    #[wire(bytes = 1)]
    pub kind: u8,
    /// ESC revision.
    #[wire(bytes = 1)]
    pub revision: u8,
    /// ESC build number.
    #[wire(bytes = 2)]
    pub build: u16,
    /// Number of supported FMMU entities (at most 16).
    #[wire(bytes = 1)]
    pub fmmu_count: u8,
    /// Number of supported sync manager channels (at most 16).
    #[wire(bytes = 1)]
    pub sync_manager_count: u8,
    /// RAM size in KiB.
    #[wire(bytes = 1)]
    pub ram_size: u8,
    /// Port descriptor nibbles.
    #[wire(bytes = 1)]
    pub port_descriptors: u8,
    /// Feature support word.
    #[wire(bytes = 2)]
    pub support: SupportFlags,
}

impl BaseInfo {
    /// Clamp the advertised FMMU count to the register region's capacity.
    pub fn usable_fmmus(&self) -> u8 {
        self.fmmu_count.min(16)
    }

    /// Clamp the advertised SM count to the register region's capacity.
    pub fn usable_sync_managers(&self) -> u8 {
        self.sync_manager_count.min(16)
    }
}

/// One SubDevice as discovered by the bus scan.
///
/// Created when the topology scan observes a new SubDevice, destroyed when it disappears.
#[derive(Debug)]
pub(crate) struct SubDevice {
    /// Zero-based index in the forwarding order.
    pub ring_position: u16,
    /// Station address written during scan, `ring_position + 1`.
    pub configured_address: u16,
    /// Station alias from EEPROM word `0x0004`.
    pub alias: u16,
    pub identity: SubDeviceIdentity,
    pub base: BaseInfo,
    pub dl_status: DlStatus,
    /// Last AL state read back.
    pub state: SubDeviceState,
    /// Status code captured from the last refused state change.
    pub al_status_code: Option<AlStatusCode>,
    /// Latched on any fatal FSM failure. The SubDevice is skipped until the next rescan.
    pub error_flag: bool,
    /// Raw EEPROM image.
    pub eeprom: EepromImage,
    /// Parsed SII categories.
    pub sii: ParsedCategories,
    /// Standard mailbox geometry, when the SubDevice has one.
    pub mailbox: Option<MailboxGeometry>,
    /// Bootstrap mailbox geometry.
    pub bootstrap_mailbox: Option<MailboxGeometry>,
    pub mailbox_protocols: MailboxProtocols,
    /// Rolling mailbox counter, shared by all mailbox protocols.
    pub mailbox_counter: u8,
    /// CoE object dictionary, fetched in the idle phase.
    pub dictionary: Option<SdoDictionary>,
    /// When the SubDevice reached PREOP, for the dictionary fetch idle budget.
    pub preop_since: Option<Instant>,
    /// Index into the master's config arena once attached.
    pub config_index: Option<usize>,
    /// The state the master wants this SubDevice in.
    pub requested_state: SubDeviceState,
    /// DC receive time of each port from the last delay measurement latch.
    pub dc_receive_times: [u32; 4],
    /// Propagation delay from the MainDevice to this SubDevice in ns.
    pub propagation_delay: u32,
}

impl SubDevice {
    pub(crate) fn new(ring_position: u16) -> Self {
        Self {
            ring_position,
            configured_address: ring_position + 1,
            alias: 0,
            identity: SubDeviceIdentity::default(),
            base: BaseInfo::default(),
            dl_status: DlStatus::default(),
            state: SubDeviceState::None,
            al_status_code: None,
            error_flag: false,
            eeprom: EepromImage::default(),
            sii: ParsedCategories::default(),
            mailbox: None,
            bootstrap_mailbox: None,
            mailbox_protocols: MailboxProtocols::empty(),
            mailbox_counter: 0,
            dictionary: None,
            preop_since: None,
            config_index: None,
            requested_state: SubDeviceState::PreOp,
            dc_receive_times: [0; 4],
            propagation_delay: 0,
        }
    }

    /// Device name from the SII strings, if any.
    pub(crate) fn name(&self) -> Option<&str> {
        self.sii.name()
    }

    /// Whether the SubDevice supports CoE.
    pub(crate) fn has_coe(&self) -> bool {
        self.mailbox_protocols.contains(MailboxProtocols::COE) && self.mailbox.is_some()
    }

    /// Whether the SubDevice supports FoE.
    pub(crate) fn has_foe(&self) -> bool {
        self.mailbox_protocols.contains(MailboxProtocols::FOE) && self.mailbox.is_some()
    }

    /// Whether the SubDevice has a DC unit.
    pub(crate) fn has_dc(&self) -> bool {
        self.base.support.dc_supported
    }

    /// Mailbox geometry, or an error for mailbox-less devices.
    pub(crate) fn mailbox_geometry(&self) -> Result<MailboxGeometry, crate::error::Error> {
        self.mailbox
            .ok_or(crate::error::Error::Mailbox(
                crate::error::MailboxError::NoMailbox,
            ))
    }
}

/// Point-in-time public snapshot of a SubDevice.
#[derive(Debug, Clone)]
pub struct SubDeviceInfo {
    /// Zero-based position in the forwarding order.
    pub ring_position: u16,
    /// Configured station address.
    pub configured_address: u16,
    /// Station alias.
    pub alias: u16,
    /// Identity from the EEPROM.
    pub identity: SubDeviceIdentity,
    /// Current AL state.
    pub state: SubDeviceState,
    /// Status code of the last refused state change.
    pub al_status_code: Option<AlStatusCode>,
    /// Whether the SubDevice has latched an error.
    pub error_flag: bool,
    /// Device name from the SII strings.
    pub name: Option<heapless::String<64>>,
    /// Supported mailbox protocols.
    pub mailbox_protocols: MailboxProtocols,
    /// Propagation delay from the MainDevice in ns.
    pub propagation_delay: u32,
}

impl SubDevice {
    pub(crate) fn info(&self) -> SubDeviceInfo {
        SubDeviceInfo {
            ring_position: self.ring_position,
            configured_address: self.configured_address,
            alias: self.alias,
            identity: self.identity,
            state: self.state,
            al_status_code: self.al_status_code,
            error_flag: self.error_flag,
            name: self.name().map(|name| {
                let mut out = heapless::String::new();
                let _ = out.push_str(name);
                out
            }),
            mailbox_protocols: self.mailbox_protocols,
            propagation_delay: self.propagation_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::EtherCrabWireRead;

    #[test]
    fn base_info_decode() {
        // EK1100-ish: 8 FMMUs, 8 SMs, DC supported
        let raw = [0x11, 0x00, 0x02, 0x00, 0x08, 0x08, 0x01, 0x0f, 0x0c, 0x00];

        let base = BaseInfo::unpack_from_slice(&raw).unwrap();

        assert_eq!(base.fmmu_count, 8);
        assert_eq!(base.sync_manager_count, 8);
        assert!(base.support.dc_supported);
        assert!(base.support.has_64bit_dc);
    }

    #[test]
    fn counts_clamped() {
        let base = BaseInfo {
            fmmu_count: 255,
            sync_manager_count: 200,
            ..BaseInfo::default()
        };

        assert_eq!(base.usable_fmmus(), 16);
        assert_eq!(base.usable_sync_managers(), 16);
    }
}
