//! SII category payload types.

use crate::sync_manager_channel;
use core::fmt;

/// TxPDO object index range.
pub const TX_PDO_RANGE: core::ops::RangeInclusive<u16> = 0x1a00..=0x1bff;
/// RxPDO object index range.
pub const RX_PDO_RANGE: core::ops::RangeInclusive<u16> = 0x1600..=0x17ff;

/// Defined in ETG1000.6 Table 19.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u16)]
pub enum CategoryType {
    Nop = 0,
    #[wire(alternatives = [2, 3, 4, 5, 6, 7, 8, 9])]
    DeviceSpecific = 1,
    Strings = 10,
    DataTypes = 20,
    General = 30,
    Fmmu = 40,
    SyncManager = 41,
    FmmuExtended = 42,
    SyncUnit = 43,
    TxPdo = 50,
    RxPdo = 51,
    DistributedClock = 60,
    End = 0xffff,
    /// Device specific categories in `0x1000..=0xfffe`, and anything else unrecognised.
    #[wire(catch_all)]
    Other(u16) = 61,
}

/// ETG1000.6 Table 23.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u8)]
pub enum FmmuUsage {
    #[default]
    #[wire(alternatives = [0xff])]
    Unused = 0x00,
    Outputs = 0x01,
    Inputs = 0x02,
    SyncManagerStatus = 0x03,
    #[wire(catch_all)]
    Other(u8),
}

bitflags::bitflags! {
    /// SII general category flags.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct GeneralFlags: u8 {
        const ENABLE_SAFE_OP = 0x01;
        const ENABLE_NOT_LRW = 0x02;
        const MAILBOX_DLL = 0x04;
        const IDENT_AL_STATUS = 0x08;
        const IDENT_PHY_M = 0x10;
    }
}

bitflags::bitflags! {
    /// CoE feature bits from the SII general category.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct CoeDetails: u8 {
        /// Bit 0: Enable SDO.
        const ENABLE_SDO = 0x01;
        /// Bit 1: Enable SDO Info.
        const ENABLE_SDO_INFO = 0x02;
        /// Bit 2: Enable PDO Assign.
        const ENABLE_PDO_ASSIGN = 0x04;
        /// Bit 3: Enable PDO Configuration.
        const ENABLE_PDO_CONFIG = 0x08;
        /// Bit 4: Enable Upload at startup.
        const ENABLE_STARTUP_UPLOAD = 0x10;
        /// Bit 5: Enable SDO complete access.
        const ENABLE_COMPLETE_ACCESS = 0x20;
    }
}

/// SII "General" category.
///
/// Defined in ETG1000.6 Table 21.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SiiGeneral {
    pub group_string_idx: u8,
    pub image_string_idx: u8,
    pub order_string_idx: u8,
    pub name_string_idx: u8,
    pub coe_details: CoeDetails,
    pub foe_enabled: bool,
    pub eoe_enabled: bool,
    pub flags: GeneralFlags,
    /// EBus current consumption in mA; negative values feed in current.
    pub ebus_current: i16,
    /// Physical port configuration nibbles.
    pub ports: u16,
}

impl SiiGeneral {
    /// Parse from a general category payload.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        // Mandatory fields cover 18 bytes; the category itself is 32
        if raw.len() < 18 {
            return None;
        }

        Some(Self {
            group_string_idx: raw[0],
            image_string_idx: raw[1],
            order_string_idx: raw[2],
            name_string_idx: raw[3],
            // raw[4] reserved
            coe_details: CoeDetails::from_bits_truncate(raw[5]),
            foe_enabled: raw[6] != 0,
            eoe_enabled: raw[7] != 0,
            // raw[8..11] reserved (SoE channels, DS402 channels, SysMan class)
            flags: GeneralFlags::from_bits_truncate(raw[11]),
            ebus_current: i16::from_le_bytes([raw[12], raw[13]]),
            ports: u16::from_le_bytes([raw[14], raw[15]]),
        })
    }
}

bitflags::bitflags! {
    /// Sync manager enable word from the SII SM category.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct SiiSyncManagerEnable: u8 {
        /// Bit 0: enable.
        const ENABLE = 0x01;
        /// Bit 1: fixed content.
        const IS_FIXED = 0x02;
        /// Bit 2: virtual sync manager.
        const IS_VIRTUAL = 0x04;
        /// Bit 3: only enabled in OP state.
        const OP_ONLY = 0x08;
    }
}

/// Intended use of a sync manager, from the SII SM category.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u8)]
pub enum SyncManagerType {
    /// Not used or unknown.
    #[default]
    Unknown = 0x00,
    /// Used for writes from the MainDevice (mailbox out).
    MailboxOut = 0x01,
    /// Used for reads by the MainDevice (mailbox in).
    MailboxIn = 0x02,
    /// Process data outputs from the MainDevice.
    ProcessDataOut = 0x03,
    /// Process data inputs to the MainDevice.
    ProcessDataIn = 0x04,
    #[wire(catch_all)]
    Other(u8),
}

/// One 8-byte entry of the SII sync manager category.
#[derive(Default, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 8)]
pub struct SiiSyncManager {
    #[wire(bytes = 2)]
    pub start_address: u16,
    #[wire(bytes = 2)]
    pub length: u16,
    #[wire(bytes = 1)]
    pub control: sync_manager_channel::Control,
    // Status byte is unused in the EEPROM image
    #[wire(bytes = 1)]
    pub status: u8,
    #[wire(bytes = 1)]
    pub enable: u8,
    #[wire(bytes = 1)]
    pub usage_type: SyncManagerType,
}

impl SiiSyncManager {
    pub fn enable_flags(&self) -> SiiSyncManagerEnable {
        SiiSyncManagerEnable::from_bits_truncate(self.enable)
    }
}

impl fmt::Debug for SiiSyncManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SiiSyncManager")
            .field("start_address", &format_args!("{:#06x}", self.start_address))
            .field("length", &format_args!("{:#06x}", self.length))
            .field("control", &self.control)
            .field("enable", &self.enable_flags())
            .field("usage_type", &self.usage_type)
            .finish()
    }
}

bitflags::bitflags! {
    /// ETG2010 PDO flags word.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct PdoFlags: u16 {
        /// PdoMandatory [Esi:RTxPdo@Mandatory]
        const PDO_MANDATORY = 0x0001;
        /// PdoDefault [Esi:RTxPdo@Sm]
        const PDO_DEFAULT = 0x0002;
        /// Reserved (PdoOversample)
        const PDO_OVERSAMPLE = 0x0004;
        /// PdoFixedContent [Esi:RTxPdo@Fixed]
        const PDO_FIXED_CONTENT = 0x0010;
        /// PdoVirtualContent [Esi:RTxPdo@Virtual]
        const PDO_VIRTUAL_CONTENT = 0x0020;
    }
}

/// An SII PDO descriptor header, one per PDO in the TxPDO/RxPDO categories.
#[derive(Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 8)]
pub struct SiiPdo {
    #[wire(bytes = 2)]
    pub index: u16,
    #[wire(bytes = 1)]
    pub num_entries: u8,
    /// Index of the sync manager this PDO is assigned to, `0xff` when unassigned.
    #[wire(bytes = 1)]
    pub sync_manager: u8,
    #[wire(bytes = 1)]
    pub dc_sync: u8,
    /// Index into the strings category for this PDO's name.
    #[wire(bytes = 1)]
    pub name_string_idx: u8,
    #[wire(bytes = 2)]
    pub flags: u16,
}

impl fmt::Debug for SiiPdo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SiiPdo")
            .field("index", &format_args!("{:#06x}", self.index))
            .field("num_entries", &self.num_entries)
            .field("sync_manager", &self.sync_manager)
            .field("flags", &PdoFlags::from_bits_truncate(self.flags))
            .finish()
    }
}

/// An SII PDO entry descriptor, following its [`SiiPdo`] header.
#[derive(Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 8)]
pub struct SiiPdoEntry {
    #[wire(bytes = 2)]
    pub index: u16,
    #[wire(bytes = 1)]
    pub sub_index: u8,
    #[wire(bytes = 1)]
    pub name_string_idx: u8,
    /// CoE base data type index.
    #[wire(bytes = 1)]
    pub data_type: u8,
    #[wire(bytes = 1)]
    pub bit_length: u8,
    #[wire(bytes = 2)]
    pub flags: u16,
}

impl fmt::Debug for SiiPdoEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SiiPdoEntry")
            .field("index", &format_args!("{:#06x}", self.index))
            .field("sub_index", &self.sub_index)
            .field("bit_length", &self.bit_length)
            .finish()
    }
}

/// A PDO with its entries, as assembled from the SII TxPDO/RxPDO categories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdo {
    pub descriptor: SiiPdo,
    pub entries: Vec<SiiPdoEntry>,
}

impl Pdo {
    /// Total size of this PDO's entries in bits.
    pub fn bit_len(&self) -> u16 {
        self.entries
            .iter()
            .map(|entry| u16::from(entry.bit_length))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::EtherCrabWireRead;

    #[test]
    fn category_type_device_specific_range() {
        assert_eq!(CategoryType::from(3u16), CategoryType::DeviceSpecific);
        assert_eq!(CategoryType::from(50u16), CategoryType::TxPdo);
        assert_eq!(CategoryType::from(0x1234u16), CategoryType::Other(0x1234));
        assert_eq!(CategoryType::from(0xffffu16), CategoryType::End);
    }

    #[test]
    fn parse_general() {
        // From an EK1100 EEPROM dump
        let raw = [
            0x02, 0x00, 0x01, 0x03, // string indices
            0x00, // reserved
            0x00, // CoE details: none
            0x00, // FoE
            0x00, // EoE
            0x00, 0x00, 0x00, // reserved
            0x00, // flags
            0xe8, 0x03, // 1000 mA ebus current
            0x00, 0x00, // ports
            0x00, 0x00,
        ];

        let general = SiiGeneral::parse(&raw).unwrap();

        assert_eq!(general.name_string_idx, 3);
        assert_eq!(general.ebus_current, 1000);
        assert!(!general.coe_details.contains(CoeDetails::ENABLE_SDO));
    }

    #[test]
    fn parse_sync_manager() {
        // Mailbox out SM: start 0x1000, 128 bytes, mailbox control, enabled
        let raw = [0x00, 0x10, 0x80, 0x00, 0x26, 0x00, 0x01, 0x01];

        let sm = SiiSyncManager::unpack_from_slice(&raw).unwrap();

        assert_eq!(sm.start_address, 0x1000);
        assert_eq!(sm.length, 128);
        assert!(sm.enable_flags().contains(SiiSyncManagerEnable::ENABLE));
        assert_eq!(sm.usage_type, SyncManagerType::MailboxOut);
    }

    #[test]
    fn pdo_bit_len_sums_entries() {
        let pdo = Pdo {
            descriptor: SiiPdo {
                index: 0x1a00,
                num_entries: 2,
                sync_manager: 3,
                dc_sync: 0,
                name_string_idx: 0,
                flags: 0,
            },
            entries: vec![
                SiiPdoEntry {
                    index: 0x6000,
                    sub_index: 1,
                    name_string_idx: 0,
                    data_type: 0x01,
                    bit_length: 1,
                    flags: 0,
                },
                SiiPdoEntry {
                    index: 0x6000,
                    sub_index: 2,
                    name_string_idx: 0,
                    data_type: 0x03,
                    bit_length: 15,
                    flags: 0,
                },
            ],
        };

        assert_eq!(pdo.bit_len(), 16);
    }
}
