//! SubDevice register address abstraction.

/// Named SubDevice (ESC) register addresses.
///
/// Only the registers this MainDevice actually touches are listed. Defined in ETG1000.4 Table 31.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum RegisterAddress {
    /// Type, `u8`.
    Type = 0x0000u16,
    /// EtherCAT revision, `u8`.
    Revision = 0x0001,
    /// SubDevice build, `u16`.
    Build = 0x0002,
    /// Number of supported FMMU entities, `u8`.
    FmmuCount = 0x0004,
    /// Number of supported sync manager channels, `u8`.
    SyncManagerChannels = 0x0005,
    /// RAM size in kilo-octets (1024 octets), `u8`.
    RamSize = 0x0006,
    /// EtherCAT port descriptors 0-3, `u8`.
    PortDescriptors = 0x0007,
    /// Feature bits supported by the SubDevice, `u16`.
    SupportFlags = 0x0008,
    /// The SubDevice's configured station address, `u16`.
    ConfiguredStationAddress = 0x0010,
    /// The SubDevice's station alias, `u16`.
    ConfiguredStationAlias = 0x0012,

    /// ESC reset register; accepts the `R`, `E`, `S` byte sequence.
    EscReset = 0x0040,

    /// DL status, `u16`. Defined in ETG1000.4 Table 34.
    DlStatus = 0x0110,

    /// Application Layer (AL) control register, `u16`. See ETG1000.4 Table 35.
    AlControl = 0x0120,
    /// Application Layer (AL) status register, `u16`. See ETG1000.4 Table 35.
    AlStatus = 0x0130,
    /// Application Layer (AL) status code register, `u16`.
    AlStatusCode = 0x0134,

    /// Watchdog divider, `u16`.
    ///
    /// See ETG1000.4 section 6.3 Watchdogs.
    WatchdogDivider = 0x0400,

    /// PDI watchdog timeout, `u16`.
    PdiWatchdog = 0x0410,

    /// Sync manager watchdog timeout, `u16`.
    SyncManagerWatchdog = 0x0420,

    /// EEPROM (SII) config register, `u16`.
    SiiConfig = 0x0500,

    /// EEPROM (SII) control/status register, `u16`.
    SiiControl = 0x0502,

    /// EEPROM (SII) word address register, `u16`.
    SiiAddress = 0x0504,

    /// Start of 4 bytes (read) or 2 bytes (write) of SII transfer data.
    SiiData = 0x0508,

    /// Start of the FMMU register region (16 bytes per FMMU).
    ///
    /// Defined in ETG1000.4 Table 57.
    Fmmu0 = 0x0600,

    /// Start of the sync manager register region (8 bytes per SM).
    ///
    /// Defined in ETG1000.4 Table 59.
    Sm0 = 0x0800,

    /// Distributed clock (DC) port 0 receive time in ns; a write latches all port times.
    ///
    /// Distributed clock registers are defined in ETG1000.4 Table 60.
    DcTimePort0 = 0x0900,
    /// DC port 1 receive time in ns.
    DcTimePort1 = 0x0904,
    /// DC port 2 receive time in ns.
    DcTimePort2 = 0x0908,
    /// DC port 3 receive time in ns.
    DcTimePort3 = 0x090c,
    /// DC system time, `u64`.
    DcSystemTime = 0x0910,
    /// DC system time offset, `u64`.
    DcSystemTimeOffset = 0x0920,
    /// DC transmission (propagation) delay, `u32`.
    DcSystemTimeTransmissionDelay = 0x0928,

    /// DC sync unit assign/activate word, `u16`.
    DcSyncActivation = 0x0980,
    /// DC cyclic operation start time, `u64`.
    DcSyncStartTime = 0x0990,
    /// DC SYNC0 cycle time in ns, `u32`.
    DcSync0CycleTime = 0x09a0,
    /// DC SYNC1 cycle time in ns, `u32`.
    DcSync1CycleTime = 0x09a4,
}

impl From<RegisterAddress> for u16 {
    fn from(reg: RegisterAddress) -> Self {
        reg as u16
    }
}

impl RegisterAddress {
    /// Bytes per FMMU register entity.
    pub const FMMU_STRIDE: u16 = 16;

    /// Bytes per sync manager register entity.
    pub const SYNC_MANAGER_STRIDE: u16 = 8;

    /// FMMU register start by index.
    pub fn fmmu(index: u8) -> u16 {
        debug_assert!(index < 16, "bad FMMU index {}", index);

        u16::from(Self::Fmmu0) + u16::from(index) * Self::FMMU_STRIDE
    }

    /// Sync manager register start by index.
    pub fn sync_manager(index: u8) -> u16 {
        debug_assert!(index < 16, "bad SM index {}", index);

        u16::from(Self::Sm0) + u16::from(index) * Self::SYNC_MANAGER_STRIDE
    }

    /// Sync manager status register by SM index.
    ///
    /// The status register is the 5th byte after the start of the SM.
    pub fn sync_manager_status(index: u8) -> u16 {
        Self::sync_manager(index) + 5
    }
}

/// Feature support word read from [`RegisterAddress::SupportFlags`].
#[derive(Default, Copy, Clone, Debug, PartialEq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 2)]
pub struct SupportFlags {
    /// FMMUs support bit granular mappings.
    #[wire(bits = 1)]
    pub fmmu_supports_bit_ops: bool,
    #[wire(bits = 1)]
    pub reserved_register_support: bool,
    /// The SubDevice has a distributed clock unit.
    #[wire(bits = 1)]
    pub dc_supported: bool,
    /// The DC unit is 64 bits wide rather than 32.
    #[wire(bits = 1)]
    pub has_64bit_dc: bool,
    #[wire(bits = 1)]
    pub low_jitter: bool,
    #[wire(bits = 1)]
    pub ebus_enhanced_link_detection: bool,
    #[wire(bits = 1)]
    pub mii_enhanced_link_detection: bool,
    #[wire(bits = 1)]
    pub separate_fcs_error_handling: bool,
    #[wire(bits = 1)]
    pub enhanced_dc_sync: bool,
    #[wire(bits = 1)]
    pub lrw_supported: bool,
    #[wire(bits = 1)]
    pub brw_aprw_fprw_supported: bool,
    #[wire(bits = 1, post_skip = 4)]
    pub special_fmmu: bool,
}

impl core::fmt::Display for SupportFlags {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("DC: ")?;

        if self.dc_supported {
            f.write_str("yes")?;

            if self.has_64bit_dc {
                f.write_str(" (64 bit)")?;
            } else {
                f.write_str(" (32 bit)")?;
            }
        } else {
            f.write_str("no")?;
        }

        if self.enhanced_dc_sync {
            f.write_str(", enhanced sync")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::EtherCrabWireRead;

    #[test]
    fn fmmu_and_sm_strides() {
        assert_eq!(RegisterAddress::fmmu(0), 0x0600);
        assert_eq!(RegisterAddress::fmmu(15), 0x06f0);
        assert_eq!(RegisterAddress::sync_manager(1), 0x0808);
        assert_eq!(RegisterAddress::sync_manager_status(1), 0x080d);
    }

    #[test]
    fn decode_support_flags() {
        // DC supported, 64 bit range
        let raw = [0b0000_1100u8, 0x00];

        let flags = SupportFlags::unpack_from_slice(&raw).unwrap();

        assert!(flags.dc_supported);
        assert!(flags.has_64bit_dc);
        assert!(!flags.lrw_supported);
    }
}
