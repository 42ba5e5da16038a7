//! User-supplied SubDevice configuration: sync managers, PDO assignment and mapping, startup
//! SDOs, distributed clock parameters and watchdogs.
//!
//! A configuration is created before activation, selects its SubDevice by (alias, position)
//! and expected identity, and is applied by the configuration FSM whenever the matching
//! SubDevice needs (re)configuring.

use crate::{fmmu::Fmmu, sync_manager_channel::Direction};
use smallvec::SmallVec;

/// Process data direction of a sync manager, as seen from the MainDevice.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SmDirection {
    /// TxPDO data: the SubDevice produces, the MainDevice reads.
    Input,
    /// RxPDO data: the MainDevice writes, the SubDevice consumes.
    Output,
}

impl SmDirection {
    pub(crate) fn channel_direction(self) -> Direction {
        match self {
            Self::Input => Direction::MainDeviceRead,
            Self::Output => Direction::MainDeviceWrite,
        }
    }
}

/// Watchdog behaviour of a sync manager.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum SmWatchdog {
    /// Keep whatever the SII declares.
    #[default]
    Default,
    /// Force the SM watchdog on.
    Enable,
    /// Force the SM watchdog off.
    Disable,
}

/// One entry of a PDO mapping: object index, subindex and size in bits.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PdoEntryDef {
    /// Mapped object index.
    pub index: u16,
    /// Mapped object subindex.
    pub sub_index: u8,
    /// Entry size in bits.
    pub bit_length: u8,
}

impl PdoEntryDef {
    /// A new PDO entry definition.
    pub const fn new(index: u16, sub_index: u8, bit_length: u8) -> Self {
        Self {
            index,
            sub_index,
            bit_length,
        }
    }

    /// The `0x1600`/`0x1a00` family mapping word for this entry.
    pub(crate) fn mapping_value(&self) -> u32 {
        u32::from(self.index) << 16
            | u32::from(self.sub_index) << 8
            | u32::from(self.bit_length)
    }
}

/// Desired configuration of one sync manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SmConfig {
    pub index: u8,
    pub direction: SmDirection,
    pub watchdog: SmWatchdog,
    /// PDOs assigned to this SM, in order. `None` trusts the SII assignment.
    pub pdo_assignment: Option<Vec<u16>>,
}

/// Explicit mapping for one PDO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PdoMappingConfig {
    pub pdo_index: u16,
    pub entries: Vec<PdoEntryDef>,
}

/// An SDO write applied during PREOP, before process data configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SdoConfig {
    pub index: u16,
    pub sub_index: u8,
    pub data: Vec<u8>,
}

/// Distributed clock parameters for one SubDevice.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct DcConfig {
    /// The `0x0980` assign/activate word, device specific.
    pub assign_activate: u16,
    /// SYNC0 cycle time in ns.
    pub sync0_cycle: u32,
    /// SYNC0 shift relative to the cycle start in ns.
    pub sync0_shift: i32,
    /// SYNC1 cycle time in ns.
    pub sync1_cycle: u32,
    /// SYNC1 shift in ns.
    pub sync1_shift: i32,
}

/// Watchdog timing for one SubDevice.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// Divider for the 40 ns base interval, register `0x0400`.
    pub divider: u16,
    /// SM watchdog interval in divider ticks, register `0x0420`.
    pub sm_interval: u16,
}

/// An FMMU projection computed at activation from a domain registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FmmuAllocation {
    /// Which domain this projection belongs to.
    pub domain: usize,
    /// Sync manager holding the physical data.
    pub sync_manager: u8,
    pub direction: SmDirection,
    /// Physical start address, the SM's start.
    pub physical_start: u16,
    /// Offset of this projection inside the domain image.
    pub domain_offset: usize,
    pub length_bytes: u16,
}

impl FmmuAllocation {
    /// The register image for this projection, given the domain's logical base address.
    pub(crate) fn register_image(&self, domain_base: u32) -> Fmmu {
        Fmmu::byte_aligned(
            domain_base + self.domain_offset as u32,
            self.physical_start,
            self.length_bytes,
            matches!(self.direction, SmDirection::Input),
            matches!(self.direction, SmDirection::Output),
        )
    }

    /// This projection's contribution to the expected working counter of an LRW exchange.
    ///
    /// A read adds 1, a write adds 2; a SubDevice mapped in both directions therefore adds 3.
    pub(crate) fn working_counter_increment(&self) -> u16 {
        match self.direction {
            SmDirection::Input => 1,
            SmDirection::Output => 2,
        }
    }
}

/// The accumulated configuration for one (alias, position) SubDevice selector.
#[derive(Debug, Clone)]
pub(crate) struct SubDeviceConfigData {
    /// Alias selector; 0 selects by absolute ring position.
    pub alias: u16,
    /// Ring position, relative to the aliased SubDevice when `alias` is non-zero.
    pub position: u16,
    pub vendor_id: u32,
    pub product_id: u32,
    pub sync_managers: Vec<SmConfig>,
    pub pdo_mappings: Vec<PdoMappingConfig>,
    pub startup_sdos: Vec<SdoConfig>,
    pub dc: Option<DcConfig>,
    pub watchdog: Option<WatchdogConfig>,
    /// FMMU projections, filled in by domain registration. ESCs rarely have more than 8
    /// FMMUs, so these stay inline.
    pub fmmus: SmallVec<[FmmuAllocation; 8]>,
}

impl SubDeviceConfigData {
    pub(crate) fn new(alias: u16, position: u16, vendor_id: u32, product_id: u32) -> Self {
        Self {
            alias,
            position,
            vendor_id,
            product_id,
            sync_managers: Vec::new(),
            pdo_mappings: Vec::new(),
            startup_sdos: Vec::new(),
            dc: None,
            watchdog: None,
            fmmus: SmallVec::new(),
        }
    }

    /// The explicit or implicit mapping of `pdo_index`.
    pub(crate) fn mapping_for(&self, pdo_index: u16) -> Option<&PdoMappingConfig> {
        self.pdo_mappings
            .iter()
            .find(|mapping| mapping.pdo_index == pdo_index)
    }

    /// The sync manager config carrying `pdo_index` in its assignment.
    pub(crate) fn sync_manager_for_pdo(&self, pdo_index: u16) -> Option<&SmConfig> {
        self.sync_managers.iter().find(|sm| {
            sm.pdo_assignment
                .as_ref()
                .is_some_and(|pdos| pdos.contains(&pdo_index))
        })
    }

    /// Whether this configuration matches a SubDevice's identity.
    pub(crate) fn matches_identity(&self, vendor_id: u32, product_id: u32) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_value_layout() {
        // 0x6000:01, 8 bits -> 0x60000108
        assert_eq!(PdoEntryDef::new(0x6000, 1, 8).mapping_value(), 0x6000_0108);
    }

    #[test]
    fn fmmu_wkc_increments() {
        let input = FmmuAllocation {
            domain: 0,
            sync_manager: 3,
            direction: SmDirection::Input,
            physical_start: 0x1100,
            domain_offset: 0,
            length_bytes: 2,
        };

        let output = FmmuAllocation {
            direction: SmDirection::Output,
            ..input.clone()
        };

        assert_eq!(input.working_counter_increment(), 1);
        assert_eq!(output.working_counter_increment(), 2);
    }

    #[test]
    fn fmmu_register_image_direction() {
        let alloc = FmmuAllocation {
            domain: 0,
            sync_manager: 2,
            direction: SmDirection::Output,
            physical_start: 0x1000,
            domain_offset: 4,
            length_bytes: 2,
        };

        let fmmu = alloc.register_image(0x0001_0000);

        assert_eq!(fmmu.logical_start_address, 0x0001_0004);
        assert!(fmmu.write_enable);
        assert!(!fmmu.read_enable);
        assert!(fmmu.enable);
    }
}
