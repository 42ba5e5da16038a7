//! The 10-byte PDU header and its packed flags word.

use crate::LEN_MASK;
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireSized, EtherCrabWireWrite, WireError};

/// PDU fields placed after ADP and ADO, e.g. `LEN`, `C` and `NEXT` fields in ETG1000.4 5.4.1.2
/// Table 14 – Auto increment physical read (APRD).
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct PduFlags {
    /// Data length of this PDU, excluding the working counter.
    pub length: u16,
    /// Circulating frame.
    ///
    /// 0: Frame is not circulating, 1: Frame has circulated once
    pub circulated: bool,
    /// 0: last EtherCAT PDU in EtherCAT frame, 1: EtherCAT PDU in EtherCAT frame follows
    pub more_follows: bool,
}

impl PduFlags {
    pub const fn with_len(len: u16) -> Self {
        Self {
            length: len,
            circulated: false,
            more_follows: false,
        }
    }
}

impl EtherCrabWireSized for PduFlags {
    const PACKED_LEN: usize = 2;

    type Buffer = [u8; 2];

    fn buffer() -> Self::Buffer {
        [0u8; 2]
    }
}

impl EtherCrabWireWrite for PduFlags {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        let raw = self.length & LEN_MASK
            | (self.circulated as u16) << 14
            | (self.more_follows as u16) << 15;

        raw.pack_to_slice_unchecked(buf)
    }

    fn packed_len(&self) -> usize {
        Self::PACKED_LEN
    }
}

impl EtherCrabWireRead for PduFlags {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        let raw = u16::unpack_from_slice(buf)?;

        Ok(Self {
            length: raw & LEN_MASK,
            circulated: (raw >> 14) & 0x01 == 0x01,
            more_follows: (raw >> 15) & 0x01 == 0x01,
        })
    }
}

/// A single PDU header: command, index, address, flags and IRQ.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 10)]
pub struct PduHeader {
    /// Raw command code.
    #[wire(bytes = 1)]
    pub command_code: u8,

    /// Rolling index assigned at send time.
    #[wire(bytes = 1)]
    pub index: u8,

    /// Raw command address.
    ///
    /// This represents 2x `u16` or 1x `u32` depending on the command.
    #[wire(bytes = 4)]
    pub address: [u8; 4],

    /// PDU flags.
    #[wire(bytes = 2)]
    pub flags: PduFlags,

    /// IRQ.
    #[wire(bytes = 2)]
    pub irq: u16,
}
