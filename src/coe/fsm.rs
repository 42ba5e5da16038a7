//! The SDO upload/download state machine, layered on the mailbox exchange.

use crate::{
    coe::{
        CoeHeader, CoeService, InitSdoFlags, InitSdoHeader, SegmentSdoHeader, services,
    },
    error::{Error, MailboxError},
    fmt,
    mailbox::{self, MailboxExchange, MailboxGeometry, MailboxStep, MailboxType},
    pdu::Pdu,
};
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireSized};
use std::time::Instant;

/// Terminal result of an SDO transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SdoOutcome {
    /// Upload finished; the object's bytes.
    UploadOk(Vec<u8>),
    /// Download finished.
    DownloadOk,
    /// The SubDevice aborted the transfer. The 32-bit code is passed through verbatim.
    Aborted(u32),
}

/// Outcome of one FSM step.
pub(crate) enum SdoStep {
    /// Enqueue this PDU and call [`SdoFsm::advance`] with the completed response.
    Send(Pdu),
    /// Transfer finished.
    Done(SdoOutcome),
}

enum Direction {
    Upload,
    Download {
        data: Vec<u8>,
        /// Bytes already delivered by the initiate request or previous segments.
        offset: usize,
    },
}

enum State {
    /// Initiate request in flight.
    Init(MailboxExchange),
    /// Upload segment request in flight.
    UploadSegment(MailboxExchange),
    /// Download segment request in flight.
    DownloadSegment(MailboxExchange),
}

/// Mailbox-framed SDO upload/download, expedited and segmented.
pub(crate) struct SdoFsm {
    station: u16,
    geometry: MailboxGeometry,
    index: u16,
    sub_index: u8,
    counter: u8,
    deadline: Instant,
    direction: Direction,
    state: State,
    /// Upload reassembly buffer.
    buffer: Vec<u8>,
    /// Complete size announced by the SubDevice, if any.
    announced_size: Option<usize>,
    toggle: bool,
}

/// Advance a mailbox counter: 1 to 7 inclusive, 0 is reserved.
pub(crate) fn next_counter(counter: u8) -> u8 {
    if counter >= 7 { 1 } else { counter + 1 }
}

impl SdoFsm {
    /// Start an SDO upload of `index:sub_index`.
    pub(crate) fn upload(
        station: u16,
        geometry: MailboxGeometry,
        counter: u8,
        index: u16,
        sub_index: u8,
        deadline: Instant,
    ) -> Result<(Self, Pdu), Error> {
        let counter = next_counter(counter);

        let request = services::upload_request(counter, index, sub_index);

        let (exchange, pdu) = MailboxExchange::start(station, geometry, request, deadline)?;

        Ok((
            Self {
                station,
                geometry,
                index,
                sub_index,
                counter,
                deadline,
                direction: Direction::Upload,
                state: State::Init(exchange),
                buffer: Vec::new(),
                announced_size: None,
                toggle: false,
            },
            pdu,
        ))
    }

    /// Start an SDO download of `data` to `index:sub_index`.
    ///
    /// 1-4 bytes go expedited, anything larger uses a normal initiate request followed by
    /// segments when the mailbox cannot take it all at once.
    pub(crate) fn download(
        station: u16,
        geometry: MailboxGeometry,
        counter: u8,
        index: u16,
        sub_index: u8,
        data: Vec<u8>,
        deadline: Instant,
    ) -> Result<(Self, Pdu), Error> {
        let counter = next_counter(counter);

        let (request, offset) = if !data.is_empty() && data.len() <= 4 {
            (
                services::download_expedited_request(counter, index, sub_index, &data),
                data.len(),
            )
        } else {
            let capacity = geometry
                .rx_payload_capacity()
                .saturating_sub(usize::from(services::INIT_FRAME_LEN));

            let first = data.len().min(capacity);

            (
                services::download_normal_request(
                    counter,
                    index,
                    sub_index,
                    data.len() as u32,
                    &data[..first],
                ),
                first,
            )
        };

        let (exchange, pdu) = MailboxExchange::start(station, geometry, request, deadline)?;

        Ok((
            Self {
                station,
                geometry,
                index,
                sub_index,
                counter,
                deadline,
                direction: Direction::Download { data, offset },
                state: State::Init(exchange),
                buffer: Vec::new(),
                announced_size: None,
                toggle: false,
            },
            pdu,
        ))
    }

    /// The mailbox counter after this transfer, to be stored back on the SubDevice.
    pub(crate) fn counter(&self) -> u8 {
        self.counter
    }

    fn invalid_response(&self) -> Error {
        Error::Mailbox(MailboxError::SdoResponseInvalid {
            index: self.index,
            sub_index: self.sub_index,
        })
    }

    /// Validate a fetched mailbox region and return the CoE payload (service + body).
    ///
    /// Emergency frames are consumed and reported via the returned `None`, upon which the
    /// caller restarts the receive poll.
    fn coe_payload<'raw>(&self, raw: &'raw [u8]) -> Result<Option<(CoeService, &'raw [u8])>, Error> {
        let (header, payload) = mailbox::parse_response(raw)?;

        if header.mailbox_type != MailboxType::Coe {
            fmt::warn!(
                "SubDevice {:#06x} answered SDO request with mailbox type {:?}",
                self.station,
                header.mailbox_type
            );

            return Err(self.invalid_response());
        }

        let coe = CoeHeader::unpack_from_slice(payload)?;

        let body = &payload[CoeHeader::PACKED_LEN..];

        if coe.service == CoeService::Emergency {
            // ETG1000.6 Table 38: error code, error register, diagnostic data
            if body.len() >= 3 {
                fmt::warn!(
                    "SubDevice {:#06x} emergency: code {:#06x}, register {:#04x}",
                    self.station,
                    u16::from_le_bytes([body[0], body[1]]),
                    body[2]
                );
            }

            return Ok(None);
        }

        Ok(Some((coe.service, body)))
    }

    /// Feed a completed PDU in, get the next one (or the terminal result) out.
    pub(crate) fn advance(&mut self, response: Pdu, now: Instant) -> Result<SdoStep, Error> {
        match &mut self.state {
            State::Init(exchange) => match exchange.advance(response, now)? {
                MailboxStep::Send(pdu) => Ok(SdoStep::Send(pdu)),
                MailboxStep::Done(raw) => self.on_init_response(&raw, now),
            },
            State::UploadSegment(exchange) => match exchange.advance(response, now)? {
                MailboxStep::Send(pdu) => Ok(SdoStep::Send(pdu)),
                MailboxStep::Done(raw) => self.on_upload_segment_response(&raw, now),
            },
            State::DownloadSegment(exchange) => match exchange.advance(response, now)? {
                MailboxStep::Send(pdu) => Ok(SdoStep::Send(pdu)),
                MailboxStep::Done(raw) => self.on_download_segment_response(&raw, now),
            },
        }
    }

    /// Re-arm the response poll, e.g. after consuming an emergency frame.
    fn repoll(&mut self, wrap: fn(MailboxExchange) -> State) -> Result<SdoStep, Error> {
        let (exchange, pdu) = MailboxExchange::receive(self.station, self.geometry, self.deadline)?;

        self.state = wrap(exchange);

        Ok(SdoStep::Send(pdu))
    }

    fn check_abort(&self, sdo: &InitSdoHeader, body: &[u8]) -> Option<u32> {
        if sdo.flags.command != InitSdoFlags::ABORT_REQUEST {
            return None;
        }

        let code = body
            .get(InitSdoHeader::PACKED_LEN..InitSdoHeader::PACKED_LEN + 4)
            .map(|raw| u32::from_le_bytes(raw.try_into().expect("4 byte slice")))
            .unwrap_or(0);

        fmt::debug!(
            "SDO {:#06x}:{} aborted: {}",
            self.index,
            self.sub_index,
            crate::coe::abort_code::CoeAbortCode::from(code)
        );

        Some(code)
    }

    fn on_init_response(&mut self, raw: &[u8], _now: Instant) -> Result<SdoStep, Error> {
        let Some((service, body)) = self.coe_payload(raw)? else {
            return self.repoll(State::Init);
        };

        if service != CoeService::SdoResponse {
            return Err(self.invalid_response());
        }

        let sdo = InitSdoHeader::unpack_from_slice(body)?;

        if let Some(code) = self.check_abort(&sdo, body) {
            return Ok(SdoStep::Done(SdoOutcome::Aborted(code)));
        }

        if sdo.index != self.index || sdo.sub_index != self.sub_index {
            return Err(self.invalid_response());
        }

        let data = &body[InitSdoHeader::PACKED_LEN..];

        match &self.direction {
            Direction::Upload => {
                if sdo.flags.command != InitSdoFlags::UPLOAD_RESPONSE {
                    return Err(self.invalid_response());
                }

                if sdo.flags.expedited_transfer {
                    let len = if sdo.flags.size_indicator {
                        4 - usize::from(sdo.flags.size)
                    } else {
                        4
                    };

                    let data = data.get(..len).ok_or(self.invalid_response())?;

                    return Ok(SdoStep::Done(SdoOutcome::UploadOk(data.to_vec())));
                }

                // Normal upload: 4 byte complete size, then as much data as fits the mailbox
                let complete_size = data
                    .get(..4)
                    .map(|raw| u32::from_le_bytes(raw.try_into().expect("4 byte slice")))
                    .ok_or(self.invalid_response())? as usize;

                self.announced_size = Some(complete_size);

                let first = &data[4..];

                self.buffer.extend_from_slice(&first[..first.len().min(complete_size)]);

                if self.buffer.len() >= complete_size {
                    self.buffer.truncate(complete_size);

                    return Ok(SdoStep::Done(SdoOutcome::UploadOk(core::mem::take(
                        &mut self.buffer,
                    ))));
                }

                // More to come: start the segment chain
                self.counter = next_counter(self.counter);

                let request = services::upload_segment_request(self.counter, self.toggle);

                let (exchange, pdu) =
                    MailboxExchange::start(self.station, self.geometry, request, self.deadline)?;

                self.state = State::UploadSegment(exchange);

                Ok(SdoStep::Send(pdu))
            }
            Direction::Download { data: all, offset } => {
                if sdo.flags.command != InitSdoFlags::DOWNLOAD_RESPONSE {
                    return Err(self.invalid_response());
                }

                if *offset >= all.len() {
                    return Ok(SdoStep::Done(SdoOutcome::DownloadOk));
                }

                self.send_download_segment()
            }
        }
    }

    fn send_download_segment(&mut self) -> Result<SdoStep, Error> {
        let Direction::Download { data, offset } = &mut self.direction else {
            return Err(Error::Internal);
        };

        let capacity = self
            .geometry
            .rx_payload_capacity()
            .saturating_sub(CoeHeader::PACKED_LEN + 1);

        let chunk_len = (data.len() - *offset).min(capacity);
        let chunk = &data[*offset..*offset + chunk_len];

        *offset += chunk_len;

        let is_last = *offset >= data.len();

        self.counter = next_counter(self.counter);

        let request =
            services::download_segment_request(self.counter, self.toggle, is_last, chunk);

        let (exchange, pdu) =
            MailboxExchange::start(self.station, self.geometry, request, self.deadline)?;

        self.state = State::DownloadSegment(exchange);

        Ok(SdoStep::Send(pdu))
    }

    fn on_upload_segment_response(&mut self, raw: &[u8], _now: Instant) -> Result<SdoStep, Error> {
        let Some((service, body)) = self.coe_payload(raw)? else {
            return self.repoll(State::UploadSegment);
        };

        if service != CoeService::SdoResponse {
            return Err(self.invalid_response());
        }

        let seg = SegmentSdoHeader::unpack_from_slice(body)?;

        // Abort responses use the init header layout
        if body.first().copied().unwrap_or(0) >> 5 == InitSdoFlags::ABORT_REQUEST {
            let sdo = InitSdoHeader::unpack_from_slice(body)?;

            if let Some(code) = self.check_abort(&sdo, body) {
                return Ok(SdoStep::Done(SdoOutcome::Aborted(code)));
            }
        }

        if seg.command != SegmentSdoHeader::UPLOAD_SEGMENT_RESPONSE {
            return Err(self.invalid_response());
        }

        if seg.toggle != self.toggle {
            fmt::warn!(
                "SDO {:#06x}:{} upload segment toggle mismatch",
                self.index,
                self.sub_index
            );

            return Ok(SdoStep::Done(SdoOutcome::Aborted(u32::from(
                crate::coe::abort_code::CoeAbortCode::ToggleBit,
            ))));
        }

        let segment_area = &body[1..];

        // Segments shorter than the 7 byte minimum declare their pad length in the header
        let data_len = if segment_area.len() <= SegmentSdoHeader::MIN_SEGMENT_DATA {
            segment_area
                .len()
                .saturating_sub(usize::from(seg.segment_data_size))
        } else {
            segment_area.len()
        };

        self.buffer.extend_from_slice(&segment_area[..data_len]);

        if seg.is_last_segment {
            if let Some(announced) = self.announced_size {
                if self.buffer.len() > announced {
                    self.buffer.truncate(announced);
                } else if self.buffer.len() < announced {
                    fmt::warn!(
                        "SDO {:#06x}:{} upload ended short: {} of {} bytes",
                        self.index,
                        self.sub_index,
                        self.buffer.len(),
                        announced
                    );
                }
            }

            return Ok(SdoStep::Done(SdoOutcome::UploadOk(core::mem::take(
                &mut self.buffer,
            ))));
        }

        self.toggle = !self.toggle;
        self.counter = next_counter(self.counter);

        let request = services::upload_segment_request(self.counter, self.toggle);

        let (exchange, pdu) =
            MailboxExchange::start(self.station, self.geometry, request, self.deadline)?;

        self.state = State::UploadSegment(exchange);

        Ok(SdoStep::Send(pdu))
    }

    fn on_download_segment_response(
        &mut self,
        raw: &[u8],
        _now: Instant,
    ) -> Result<SdoStep, Error> {
        let Some((service, body)) = self.coe_payload(raw)? else {
            return self.repoll(State::DownloadSegment);
        };

        if service != CoeService::SdoResponse {
            return Err(self.invalid_response());
        }

        if body.first().copied().unwrap_or(0) >> 5 == InitSdoFlags::ABORT_REQUEST {
            let sdo = InitSdoHeader::unpack_from_slice(body)?;

            if let Some(code) = self.check_abort(&sdo, body) {
                return Ok(SdoStep::Done(SdoOutcome::Aborted(code)));
            }
        }

        let seg = SegmentSdoHeader::unpack_from_slice(body)?;

        if seg.command != SegmentSdoHeader::DOWNLOAD_SEGMENT_RESPONSE {
            return Err(self.invalid_response());
        }

        if seg.toggle != self.toggle {
            return Ok(SdoStep::Done(SdoOutcome::Aborted(u32::from(
                crate::coe::abort_code::CoeAbortCode::ToggleBit,
            ))));
        }

        let Direction::Download { data, offset } = &self.direction else {
            return Err(Error::Internal);
        };

        if *offset >= data.len() {
            return Ok(SdoStep::Done(SdoOutcome::DownloadOk));
        }

        self.toggle = !self.toggle;

        self.send_download_segment()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{command::Command, pdu::PduState};
    use core::time::Duration;

    const STATION: u16 = 0x1001;

    fn geometry() -> MailboxGeometry {
        MailboxGeometry {
            rx_offset: 0x1000,
            rx_size: 128,
            tx_offset: 0x1080,
            tx_size: 128,
        }
    }

    fn respond(mut pdu: Pdu, data: &[u8]) -> Pdu {
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.working_counter = 1;
        pdu.state = PduState::Received;
        pdu
    }

    fn complete(mut pdu: Pdu) -> Pdu {
        pdu.working_counter = 1;
        pdu.state = PduState::Received;
        pdu
    }

    /// Drive the write + status poll, answering "mailbox full" immediately, and return the
    /// fetch PDU.
    fn to_fetch(fsm: &mut SdoFsm, write_pdu: Pdu, now: Instant) -> Pdu {
        let check = match fsm.advance(complete(write_pdu), now).unwrap() {
            SdoStep::Send(pdu) => pdu,
            _ => panic!("expected check"),
        };

        match fsm.advance(respond(check, &[0x08]), now).unwrap() {
            SdoStep::Send(pdu) => pdu,
            _ => panic!("expected fetch"),
        }
    }

    fn coe_response(body: &[u8]) -> Vec<u8> {
        let mut raw = vec![0u8; 128];

        // Mailbox header: length = 2 + body, type CoE
        let length = (2 + body.len()) as u16;
        raw[0..2].copy_from_slice(&length.to_le_bytes());
        raw[5] = 0x03;

        // CoE header: SDO response
        raw[7] = 0x30;

        raw[8..8 + body.len()].copy_from_slice(body);

        raw
    }

    #[test]
    fn expedited_upload() {
        let now = Instant::now();
        let deadline = now + Duration::from_secs(1);

        let (mut fsm, write) =
            SdoFsm::upload(STATION, geometry(), 0, 0x1018, 1, deadline).unwrap();

        assert_eq!(write.command(), Command::fpwr(STATION, 0x1000));

        let fetch = to_fetch(&mut fsm, write, now);

        // Expedited upload response carrying a u32 vendor ID
        let response = coe_response(&[0x43, 0x18, 0x10, 0x01, 0xad, 0xde, 0x00, 0x00]);

        match fsm.advance(respond(fetch, &response), now).unwrap() {
            SdoStep::Done(SdoOutcome::UploadOk(data)) => {
                assert_eq!(data, vec![0xad, 0xde, 0x00, 0x00]);
            }
            _ => panic!("expected upload completion"),
        }
    }

    #[test]
    fn abort_code_passed_through() {
        let now = Instant::now();
        let deadline = now + Duration::from_secs(1);

        let (mut fsm, write) =
            SdoFsm::upload(STATION, geometry(), 0, 0x9999, 0, deadline).unwrap();

        let fetch = to_fetch(&mut fsm, write, now);

        // Abort: object does not exist
        let response = coe_response(&[0x80, 0x99, 0x99, 0x00, 0x00, 0x00, 0x02, 0x06]);

        match fsm.advance(respond(fetch, &response), now).unwrap() {
            SdoStep::Done(SdoOutcome::Aborted(code)) => assert_eq!(code, 0x06020000),
            _ => panic!("expected abort"),
        }
    }

    #[test]
    fn segmented_upload_reassembles() {
        let now = Instant::now();
        let deadline = now + Duration::from_secs(1);

        let (mut fsm, write) =
            SdoFsm::upload(STATION, geometry(), 0, 0x1008, 0, deadline).unwrap();

        let fetch = to_fetch(&mut fsm, write, now);

        // Normal upload response announcing 10 bytes, with 4 in the first response
        let mut body = vec![0x41, 0x08, 0x10, 0x00, 10, 0, 0, 0];
        body.extend_from_slice(b"EK11");

        let seg_request = match fsm.advance(respond(fetch, &coe_response(&body)), now).unwrap() {
            SdoStep::Send(pdu) => pdu,
            _ => panic!("expected segment request"),
        };

        let fetch = to_fetch(&mut fsm, seg_request, now);

        // Last segment, toggle clear: 6 more bytes padded to the 7 byte minimum, 1 pad byte
        // declared in the header
        let mut body = vec![0b0000_0011];
        body.extend_from_slice(b"00-000");
        body.push(0);

        match fsm.advance(respond(fetch, &coe_response(&body)), now).unwrap() {
            SdoStep::Done(SdoOutcome::UploadOk(data)) => {
                assert_eq!(data, b"EK1100-000");
            }
            other => {
                let _ = other;
                panic!("expected upload completion");
            }
        }
    }

    #[test]
    fn counter_wraps_one_to_seven() {
        assert_eq!(next_counter(0), 1);
        assert_eq!(next_counter(6), 7);
        assert_eq!(next_counter(7), 1);
    }
}
