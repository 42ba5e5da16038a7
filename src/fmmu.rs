//! Fieldbus Memory Management Unit (FMMU).
//!
//! Projects ranges of the logical process data image onto physical SM memory in a SubDevice.

use core::fmt;

/// ETG1000.4 Table 56 – Fieldbus memory management unit (FMMU) entity.
#[derive(Default, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 16)]
pub struct Fmmu {
    /// Start address in octets of the translation window in the logical memory area.
    #[wire(bytes = 4)]
    pub logical_start_address: u32,

    #[wire(bytes = 2)]
    pub length_bytes: u16,

    #[wire(bits = 3, post_skip = 5)]
    pub logical_start_bit: u8,

    #[wire(bits = 3, post_skip = 5)]
    pub logical_end_bit: u8,

    #[wire(bytes = 2)]
    pub physical_start_address: u16,

    #[wire(bits = 3, post_skip = 5)]
    pub physical_start_bit: u8,

    #[wire(bits = 1)]
    pub read_enable: bool,

    #[wire(bits = 1, post_skip = 6)]
    pub write_enable: bool,

    #[wire(bits = 1, post_skip = 31)]
    pub enable: bool,
    // Three spare bytes at the end
}

impl Fmmu {
    /// A byte-aligned projection of `length_bytes` bytes.
    ///
    /// `read` maps inputs (SubDevice to MainDevice), `write` maps outputs.
    pub fn byte_aligned(
        logical_start_address: u32,
        physical_start_address: u16,
        length_bytes: u16,
        read: bool,
        write: bool,
    ) -> Self {
        Self {
            logical_start_address,
            length_bytes,
            logical_start_bit: 0,
            logical_end_bit: 7,
            physical_start_address,
            physical_start_bit: 0,
            read_enable: read,
            write_enable: write,
            enable: true,
        }
    }
}

impl fmt::Debug for Fmmu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Fmmu")
            .field(
                "logical_start_address",
                &format_args!("{:#010x}", self.logical_start_address),
            )
            .field("length_bytes", &self.length_bytes)
            .field("logical_start_bit", &self.logical_start_bit)
            .field("logical_end_bit", &self.logical_end_bit)
            .field(
                "physical_start_address",
                &format_args!("{:#06x}", self.physical_start_address),
            )
            .field("physical_start_bit", &self.physical_start_bit)
            .field("read_enable", &self.read_enable)
            .field("write_enable", &self.write_enable)
            .field("enable", &self.enable)
            .finish()
    }
}

impl fmt::Display for Fmmu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "logical start {:#010x}:{}, size {}, physical start {:#06x}:{}, {}{}, {}",
            self.logical_start_address,
            self.logical_start_bit,
            self.length_bytes,
            self.physical_start_address,
            self.physical_start_bit,
            if self.read_enable { "R" } else { "" },
            if self.write_enable { "W" } else { "" },
            if self.enable { "enabled" } else { "disabled" },
        ))
    }
}
