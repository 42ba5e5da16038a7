//! Constructors for the CoE mailbox frames this MainDevice sends.

use crate::{
    coe::{CoeHeader, CoeService, InitSdoFlags, InitSdoHeader, SegmentSdoHeader},
    mailbox::{MailboxHeader, MailboxType, Priority},
};
use ethercrab_wire::{EtherCrabWireSized, EtherCrabWireWrite};

/// Body length of an initiate request/response: CoE header + SDO header + 4 data bytes.
pub(crate) const INIT_FRAME_LEN: u16 = 10;

fn mailbox_header(counter: u8, length: u16) -> MailboxHeader {
    MailboxHeader {
        length,
        address: 0x0000,
        priority: Priority::Lowest,
        mailbox_type: MailboxType::Coe,
        counter,
    }
}

fn sdo_frame(counter: u8, length: u16, service: CoeService, sdo: InitSdoHeader) -> Vec<u8> {
    let mut buf = vec![0u8; MailboxHeader::PACKED_LEN + usize::from(length)];

    let mut offset = 0;

    mailbox_header(counter, length).pack_to_slice_unchecked(&mut buf[offset..]);
    offset += MailboxHeader::PACKED_LEN;

    CoeHeader::new(service).pack_to_slice_unchecked(&mut buf[offset..]);
    offset += CoeHeader::PACKED_LEN;

    sdo.pack_to_slice_unchecked(&mut buf[offset..]);

    buf
}

/// SDO upload (read) initiate request.
pub(crate) fn upload_request(counter: u8, index: u16, sub_index: u8) -> Vec<u8> {
    sdo_frame(
        counter,
        INIT_FRAME_LEN,
        CoeService::SdoRequest,
        InitSdoHeader {
            flags: InitSdoFlags {
                size_indicator: false,
                expedited_transfer: false,
                size: 0,
                complete_access: false,
                command: InitSdoFlags::UPLOAD_REQUEST,
            },
            index,
            sub_index,
        },
    )
}

/// SDO upload segment request.
pub(crate) fn upload_segment_request(counter: u8, toggle: bool) -> Vec<u8> {
    let mut buf = vec![0u8; MailboxHeader::PACKED_LEN + usize::from(INIT_FRAME_LEN)];

    let mut offset = 0;

    mailbox_header(counter, INIT_FRAME_LEN).pack_to_slice_unchecked(&mut buf[offset..]);
    offset += MailboxHeader::PACKED_LEN;

    CoeHeader::new(CoeService::SdoRequest).pack_to_slice_unchecked(&mut buf[offset..]);
    offset += CoeHeader::PACKED_LEN;

    SegmentSdoHeader {
        is_last_segment: false,
        segment_data_size: 0,
        toggle,
        command: SegmentSdoHeader::UPLOAD_SEGMENT_REQUEST,
    }
    .pack_to_slice_unchecked(&mut buf[offset..]);

    buf
}

/// Expedited SDO download request carrying 1-4 bytes inline.
pub(crate) fn download_expedited_request(
    counter: u8,
    index: u16,
    sub_index: u8,
    data: &[u8],
) -> Vec<u8> {
    debug_assert!(!data.is_empty() && data.len() <= 4);

    let mut buf = sdo_frame(
        counter,
        INIT_FRAME_LEN,
        CoeService::SdoRequest,
        InitSdoHeader {
            flags: InitSdoFlags {
                size_indicator: true,
                expedited_transfer: true,
                size: 4u8.saturating_sub(data.len() as u8),
                complete_access: false,
                command: InitSdoFlags::DOWNLOAD_REQUEST,
            },
            index,
            sub_index,
        },
    );

    let data_start = MailboxHeader::PACKED_LEN + CoeHeader::PACKED_LEN + InitSdoHeader::PACKED_LEN;

    buf[data_start..data_start + data.len()].copy_from_slice(data);

    buf
}

/// Normal SDO download initiate request: complete size plus the first chunk of data.
pub(crate) fn download_normal_request(
    counter: u8,
    index: u16,
    sub_index: u8,
    complete_size: u32,
    data: &[u8],
) -> Vec<u8> {
    let length = INIT_FRAME_LEN + data.len() as u16;

    let mut buf = sdo_frame(
        counter,
        length,
        CoeService::SdoRequest,
        InitSdoHeader {
            flags: InitSdoFlags {
                size_indicator: true,
                expedited_transfer: false,
                size: 0,
                complete_access: false,
                command: InitSdoFlags::DOWNLOAD_REQUEST,
            },
            index,
            sub_index,
        },
    );

    let size_start = MailboxHeader::PACKED_LEN + CoeHeader::PACKED_LEN + InitSdoHeader::PACKED_LEN;

    buf[size_start..size_start + 4].copy_from_slice(&complete_size.to_le_bytes());
    buf.extend_from_slice(data);

    buf
}

/// SDO download segment request.
///
/// Segments shorter than the 7 byte minimum are zero padded, with the pad length recorded in
/// the segment header.
pub(crate) fn download_segment_request(
    counter: u8,
    toggle: bool,
    is_last_segment: bool,
    data: &[u8],
) -> Vec<u8> {
    let padded = data.len().max(SegmentSdoHeader::MIN_SEGMENT_DATA);

    // CoE header + segment header + data
    let length = (CoeHeader::PACKED_LEN + 1 + padded) as u16;

    let mut buf = vec![0u8; MailboxHeader::PACKED_LEN + usize::from(length)];

    let mut offset = 0;

    mailbox_header(counter, length).pack_to_slice_unchecked(&mut buf[offset..]);
    offset += MailboxHeader::PACKED_LEN;

    CoeHeader::new(CoeService::SdoRequest).pack_to_slice_unchecked(&mut buf[offset..]);
    offset += CoeHeader::PACKED_LEN;

    SegmentSdoHeader {
        is_last_segment,
        segment_data_size: (padded - data.len()) as u8,
        toggle,
        command: SegmentSdoHeader::DOWNLOAD_SEGMENT_REQUEST,
    }
    .pack_to_slice_unchecked(&mut buf[offset..]);
    offset += 1;

    buf[offset..offset + data.len()].copy_from_slice(data);

    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_request_layout() {
        let frame = upload_request(3, 0x1018, 1);

        assert_eq!(
            frame,
            vec![
                // Mailbox header: length 10, CoE, counter 3
                0x0a, 0x00, 0x00, 0x00, 0x00, 0x33, //
                // CoE header: SDO request
                0x00, 0x20, //
                // Upload initiate request for 0x1018:01
                0x40, 0x18, 0x10, 0x01, //
                // Unused data area
                0x00, 0x00, 0x00, 0x00,
            ]
        );
    }

    #[test]
    fn expedited_u8_download() {
        let frame = download_expedited_request(1, 0x8000, 2, &[0xfe]);

        // Size indicator + expedited + 3 unused bytes + download request
        assert_eq!(frame[8], 0x2f);
        assert_eq!(&frame[9..12], &[0x00, 0x80, 0x02]);
        assert_eq!(frame[12], 0xfe);
    }

    #[test]
    fn short_download_segment_is_padded() {
        let frame = download_segment_request(2, true, true, &[0xab, 0xcd]);

        // Mailbox length = 2 (CoE) + 1 (segment header) + 7 (padded data)
        assert_eq!(frame[0], 10);

        // Last segment, 5 pad bytes, toggle set, download segment request
        assert_eq!(frame[8], 0b0001_1011);

        assert_eq!(&frame[9..11], &[0xab, 0xcd]);
        assert_eq!(frame.len(), 6 + 10);
    }
}
