//! The EtherCAT frame header and whole-frame encode/decode.
//!
//! An EtherCAT frame is `[2-byte header][one or more PDUs]`, each PDU being
//! `[10-byte header][payload][2-byte working counter]`. Every PDU except the last has the
//! "more follows" flag set.

use crate::{
    LEN_MASK,
    error::{Error, PduError},
    pdu::{
        Pdu,
        header::{PduFlags, PduHeader},
    },
};
use ethercrab_wire::{
    EtherCrabWireRead, EtherCrabWireSized, EtherCrabWireWrite, EtherCrabWireWriteSized, WireError,
};

/// Overhead of one PDU: header plus working counter footer.
pub(crate) const PDU_OVERHEAD: usize = PduHeader::PACKED_LEN + 2;

/// Maximum EtherCAT payload (frame header + PDUs) in one Ethernet frame.
pub(crate) const MAX_ETHERCAT_PAYLOAD: usize = 1500;

/// Maximum total size of all PDUs in one frame.
pub(crate) const MAX_PDU_AREA: usize = MAX_ETHERCAT_PAYLOAD - EthercatFrameHeader::PACKED_LEN;

/// Maximum payload carried by a single PDU.
pub(crate) const MAX_PDU_DATA: usize = MAX_PDU_AREA - PDU_OVERHEAD;

/// Minimum PDU area; shorter frames are padded with zeros to reach the Ethernet minimum of 60
/// bytes on the wire.
pub(crate) const MIN_PDU_AREA: usize = 44;

/// An EtherCAT frame header.
///
/// The only protocol type sent or accepted is `1` (DL PDUs); the decoder keeps the raw nibble so
/// the caller can reject everything else.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct EthercatFrameHeader {
    /// Length in bytes of the PDU area following this header.
    pub payload_len: u16,
    /// Protocol type nibble.
    pub protocol: u8,
}

const PROTOCOL_DL_PDU: u8 = 0x01;

impl EthercatFrameHeader {
    /// A header describing `payload_len` bytes of DL PDUs.
    pub(crate) fn pdu(payload_len: u16) -> Self {
        Self {
            payload_len,
            protocol: PROTOCOL_DL_PDU,
        }
    }
}

impl EtherCrabWireSized for EthercatFrameHeader {
    const PACKED_LEN: usize = 2;

    type Buffer = [u8; 2];

    fn buffer() -> Self::Buffer {
        [0u8; 2]
    }
}

impl EtherCrabWireWrite for EthercatFrameHeader {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        debug_assert!(self.payload_len <= LEN_MASK);

        let raw = (self.payload_len & LEN_MASK) | u16::from(self.protocol) << 12;

        raw.pack_to_slice_unchecked(buf)
    }

    fn packed_len(&self) -> usize {
        Self::PACKED_LEN
    }
}

impl EtherCrabWireRead for EthercatFrameHeader {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        let raw = u16::unpack_from_slice(buf)?;

        Ok(Self {
            payload_len: raw & LEN_MASK,
            protocol: (raw >> 12) as u8,
        })
    }
}

/// Serialise `pdus` into `buf` as one EtherCAT frame, padding the PDU area to the Ethernet
/// minimum.
///
/// Returns the number of bytes written. The caller guarantees the PDUs fit; see
/// [`pdu_area_len`].
pub(crate) fn write_frame(pdus: &[&Pdu], buf: &mut [u8]) -> Result<usize, Error> {
    let area_len: usize = pdus
        .iter()
        .map(|pdu| pdu.data.len() + PDU_OVERHEAD)
        .sum();

    if area_len > MAX_PDU_AREA {
        return Err(Error::Pdu(PduError::TooLong));
    }

    let padded_area = area_len.max(MIN_PDU_AREA);

    let buf = buf
        .get_mut(..EthercatFrameHeader::PACKED_LEN + padded_area)
        .ok_or(Error::Pdu(PduError::TooLong))?;

    EthercatFrameHeader::pdu(area_len as u16).pack_to_slice_unchecked(&mut buf[0..2]);

    let mut offset = EthercatFrameHeader::PACKED_LEN;

    for (position, pdu) in pdus.iter().enumerate() {
        let is_last = position == pdus.len() - 1;

        let mut address = [0u8; 4];

        pdu.command.pack_to_slice_unchecked(&mut address);

        let pdu_header = PduHeader {
            command_code: pdu.command.code(),
            index: pdu.index,
            address,
            flags: PduFlags {
                length: pdu.data.len() as u16,
                circulated: false,
                more_follows: !is_last,
            },
            irq: 0,
        };

        pdu_header.pack_to_slice_unchecked(&mut buf[offset..]);
        offset += PduHeader::PACKED_LEN;

        buf[offset..offset + pdu.data.len()].copy_from_slice(&pdu.data);
        offset += pdu.data.len();

        // Working counter starts at zero
        buf[offset..offset + 2].fill(0);
        offset += 2;
    }

    // Pad to the Ethernet minimum
    buf[offset..].fill(0);

    Ok(buf.len())
}

/// Space one frame's PDU area needs for the given payload length.
pub(crate) const fn pdu_area_len(payload_len: usize) -> usize {
    payload_len + PDU_OVERHEAD
}

/// One PDU parsed out of a received frame.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ReceivedPdu<'buf> {
    pub header: PduHeader,
    pub payload: &'buf [u8],
    pub working_counter: u16,
}

/// Iterator over the PDUs of a received EtherCAT frame payload (everything after the Ethernet
/// header).
pub(crate) struct PduIter<'buf> {
    buf: &'buf [u8],
    /// Remaining bytes of the declared PDU area.
    remaining: usize,
    finished: bool,
}

impl<'buf> PduIter<'buf> {
    /// Parse the frame header and position the iterator at the first PDU.
    ///
    /// Fails if the declared length overruns the received bytes.
    pub(crate) fn new(ethercat_payload: &'buf [u8]) -> Result<Self, Error> {
        let header = EthercatFrameHeader::unpack_from_slice(ethercat_payload)
            .map_err(|_| Error::Pdu(PduError::Decode))?;

        if header.protocol != PROTOCOL_DL_PDU {
            return Err(Error::Pdu(PduError::Decode));
        }

        let rest = &ethercat_payload[EthercatFrameHeader::PACKED_LEN..];

        if usize::from(header.payload_len) > rest.len() {
            return Err(Error::Pdu(PduError::Decode));
        }

        Ok(Self {
            buf: rest,
            remaining: usize::from(header.payload_len),
            finished: header.payload_len == 0,
        })
    }
}

impl<'buf> Iterator for PduIter<'buf> {
    type Item = Result<ReceivedPdu<'buf>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        if self.remaining < PDU_OVERHEAD {
            self.finished = true;

            return Some(Err(Error::Pdu(PduError::Decode)));
        }

        let header = match PduHeader::unpack_from_slice(self.buf) {
            Ok(header) => header,
            Err(_) => {
                self.finished = true;

                return Some(Err(Error::Pdu(PduError::Decode)));
            }
        };

        let payload_len = usize::from(header.flags.length);
        let pdu_len = PduHeader::PACKED_LEN + payload_len + 2;

        if pdu_len > self.remaining {
            self.finished = true;

            return Some(Err(Error::Pdu(PduError::Decode)));
        }

        let payload = &self.buf[PduHeader::PACKED_LEN..][..payload_len];

        let working_counter =
            u16::from_le_bytes([self.buf[pdu_len - 2], self.buf[pdu_len - 1]]);

        self.buf = &self.buf[pdu_len..];
        self.remaining -= pdu_len;

        if !header.flags.more_follows {
            self.finished = true;
        }

        Some(Ok(ReceivedPdu {
            header,
            payload,
            working_counter,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    #[test]
    fn header_pack() {
        let header = EthercatFrameHeader::pdu(0x28);

        let mut buf = [0u8; 2];

        let packed = header.pack_to_slice_unchecked(&mut buf);

        assert_eq!(packed, &0b0001_0000_0010_1000u16.to_le_bytes());
    }

    #[test]
    fn header_parse() {
        // Header from a SOEM slaveinfo capture
        let raw = [0x3cu8, 0x10];

        let header = EthercatFrameHeader::unpack_from_slice(&raw).unwrap();

        assert_eq!(header.payload_len, 0x3c);
        assert_eq!(header.protocol, 0x01);
    }

    #[test]
    fn non_pdu_protocol_rejected() {
        // Network variables protocol in an otherwise valid frame
        let raw = (0x3c | (0x04u16 << 12)).to_le_bytes();

        assert!(PduIter::new(&raw).is_err());
    }

    #[test]
    fn single_brd_frame_is_padded() {
        let mut pdu = Pdu::read(Command::brd(0x0130), 2);
        pdu.index = 0x05;

        let mut buf = [0xaau8; 128];

        let written = write_frame(&[&pdu], &mut buf).unwrap();

        // 2 byte frame header + 44 byte minimum PDU area
        assert_eq!(written, 46);

        // Declared length is the real PDU area, not the padded one
        assert_eq!(buf[0], 14);
        assert_eq!(buf[1], 0x10);

        // BRD, index 5, address 0, register 0x0130, len 2, last PDU
        assert_eq!(
            &buf[2..14],
            &[0x07, 0x05, 0x00, 0x00, 0x30, 0x01, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00]
        );

        // Padding is zeroed
        assert!(buf[16..written].iter().all(|b| *b == 0));
    }

    #[test]
    fn two_pdus_chained() {
        let mut first = Pdu::write(Command::fpwr(0x1001, 0x0120), vec![0x02, 0x00]);
        first.index = 1;

        let mut second = Pdu::read(Command::fprd(0x1001, 0x0130), 2);
        second.index = 2;

        let mut buf = [0u8; 128];

        write_frame(&[&first, &second], &mut buf).unwrap();

        let parsed = PduIter::new(&buf)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert_eq!(parsed.len(), 2);
        assert!(parsed[0].header.flags.more_follows);
        assert!(!parsed[1].header.flags.more_follows);
        assert_eq!(parsed[0].payload, &[0x02, 0x00]);
        assert_eq!(parsed[1].header.index, 2);
    }

    #[test]
    fn round_trip_with_working_counter() {
        let mut pdu = Pdu::read(Command::brd(0x0130), 2);
        pdu.index = 9;

        let mut buf = [0u8; 128];

        write_frame(&[&pdu], &mut buf).unwrap();

        // Simulate two responding SubDevices
        buf[2 + 10 + 2] = 0x02;

        let parsed = PduIter::new(&buf)
            .unwrap()
            .next()
            .unwrap()
            .unwrap();

        assert_eq!(parsed.working_counter, 2);
        assert_eq!(parsed.header.index, 9);
    }

    #[test]
    fn overrun_length_rejected() {
        // Claims 100 bytes of PDUs but carries none
        let raw = [0x64u8, 0x10, 0x00, 0x00];

        assert!(PduIter::new(&raw).is_err());
    }

    #[test]
    fn truncated_pdu_is_an_error_item() {
        // 12 byte area declared, but PDU header says 20 byte payload
        let mut buf = [0u8; 64];
        buf[0] = 12;
        buf[1] = 0x10;
        buf[2] = 0x07;
        buf[8] = 20;

        let mut iter = PduIter::new(&buf).unwrap();

        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
    }
}
