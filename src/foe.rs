//! File Access over EtherCAT (FoE): a block-oriented transfer protocol on top of the mailbox.
//!
//! The client sends `RRQ` (read) or `WRQ` (write) with an ASCII filename. The server answers
//! with numbered `DATA` (read) or `ACK` (write) packets, the client alternating `ACK`/`DATA`
//! per packet. A `DATA` packet shorter than the block size terminates the transfer.

use crate::{
    error::{Error, FoeError, MailboxError},
    fmt,
    mailbox::{self, MailboxExchange, MailboxGeometry, MailboxHeader, MailboxStep, MailboxType,
        Priority},
    pdu::Pdu,
};
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireSized, EtherCrabWireWrite};
use std::time::Instant;

/// FoE operation codes. ETG1000.6 Table 50.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u8)]
pub enum FoeOpcode {
    /// Read request.
    Rrq = 0x01,
    /// Write request.
    Wrq = 0x02,
    /// File data.
    Data = 0x03,
    /// Acknowledge.
    Ack = 0x04,
    /// Error.
    Err = 0x05,
    /// Server busy, retry.
    Busy = 0x06,
}

/// The 6-byte header every FoE frame starts with.
///
/// `value` is a password (RRQ/WRQ), a packet number (DATA/ACK) or an error code (ERR).
#[derive(Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 6)]
pub struct FoeHeader {
    #[wire(bytes = 1, post_skip = 8)]
    pub opcode: FoeOpcode,
    // reserved8
    #[wire(bytes = 4)]
    pub value: u32,
}

/// Typed FoE transfer status.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum FoeStatus {
    /// Transfer in progress.
    #[default]
    Busy,
    /// Transfer finished successfully.
    Ready,
    /// No transfer active.
    Idle,
    /// A PDU working counter was wrong.
    WcError,
    /// The mailbox response could not be fetched.
    ReceiveError,
    /// The response violated the FoE protocol.
    ProtError,
    /// A DATA packet carried no data.
    NodataError,
    /// A packet arrived with an unexpected packet number.
    PacketNoError,
    /// The server answered with an unexpected opcode.
    OpcodeError,
    /// The transfer timed out.
    TimeoutError,
    /// The server sent an explicit `ERROR` packet; the code accompanies this status.
    Error,
}

/// Terminal result of an FoE transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FoeOutcome {
    /// Read finished; the file's bytes.
    ReadOk(Vec<u8>),
    /// Write finished.
    WriteOk,
    /// Transfer failed.
    Failed(FoeError),
}

/// Outcome of one FSM step.
pub(crate) enum FoeStep {
    /// Enqueue this PDU and call [`FoeFsm::advance`] with the completed response.
    Send(Pdu),
    /// Transfer finished.
    Done(FoeOutcome),
}

enum Direction {
    Read {
        buffer: Vec<u8>,
    },
    Write {
        data: Vec<u8>,
        /// Start of the chunk most recently sent, for BUSY retries.
        chunk_start: usize,
        /// End of the chunk most recently sent.
        chunk_end: usize,
    },
}

enum State {
    /// RRQ/WRQ or a subsequent DATA/ACK exchange in flight.
    Exchange(MailboxExchange),
    /// Fire-and-forget final ACK of a read.
    FinalAck(MailboxExchange),
}

/// Mailbox-framed FoE transfer FSM.
pub(crate) struct FoeFsm {
    station: u16,
    geometry: MailboxGeometry,
    counter: u8,
    deadline: Instant,
    direction: Direction,
    state: State,
    /// Number of the last packet successfully processed.
    packet_no: u32,
    /// Bytes of file data per full packet.
    block_size: usize,
}

fn foe_frame(counter: u8, header: FoeHeader, body: &[u8]) -> Vec<u8> {
    let length = (FoeHeader::PACKED_LEN + body.len()) as u16;

    let mut buf = vec![0u8; MailboxHeader::PACKED_LEN + usize::from(length)];

    MailboxHeader {
        length,
        address: 0x0000,
        priority: Priority::Lowest,
        mailbox_type: MailboxType::Foe,
        counter,
    }
    .pack_to_slice_unchecked(&mut buf);

    header.pack_to_slice_unchecked(&mut buf[MailboxHeader::PACKED_LEN..]);

    buf[MailboxHeader::PACKED_LEN + FoeHeader::PACKED_LEN..].copy_from_slice(body);

    buf
}

impl FoeFsm {
    /// Bytes of file data carried by one full mailbox frame.
    fn block_size(geometry: &MailboxGeometry) -> usize {
        usize::from(geometry.rx_size.min(geometry.tx_size))
            .saturating_sub(MailboxHeader::PACKED_LEN + FoeHeader::PACKED_LEN)
    }

    /// Start reading `file_name` from the SubDevice.
    pub(crate) fn read(
        station: u16,
        geometry: MailboxGeometry,
        counter: u8,
        file_name: &str,
        password: u32,
        deadline: Instant,
    ) -> Result<(Self, Pdu), Error> {
        let counter = crate::coe::fsm::next_counter(counter);

        let request = foe_frame(
            counter,
            FoeHeader {
                opcode: FoeOpcode::Rrq,
                value: password,
            },
            file_name.as_bytes(),
        );

        let (exchange, pdu) = MailboxExchange::start(station, geometry, request, deadline)?;

        Ok((
            Self {
                station,
                geometry,
                counter,
                deadline,
                direction: Direction::Read { buffer: Vec::new() },
                state: State::Exchange(exchange),
                packet_no: 0,
                block_size: Self::block_size(&geometry),
            },
            pdu,
        ))
    }

    /// Start writing `data` as `file_name` to the SubDevice.
    pub(crate) fn write(
        station: u16,
        geometry: MailboxGeometry,
        counter: u8,
        file_name: &str,
        password: u32,
        data: Vec<u8>,
        deadline: Instant,
    ) -> Result<(Self, Pdu), Error> {
        let counter = crate::coe::fsm::next_counter(counter);

        let request = foe_frame(
            counter,
            FoeHeader {
                opcode: FoeOpcode::Wrq,
                value: password,
            },
            file_name.as_bytes(),
        );

        let (exchange, pdu) = MailboxExchange::start(station, geometry, request, deadline)?;

        Ok((
            Self {
                station,
                geometry,
                counter,
                deadline,
                direction: Direction::Write {
                    data,
                    chunk_start: 0,
                    chunk_end: 0,
                },
                state: State::Exchange(exchange),
                packet_no: 0,
                block_size: Self::block_size(&geometry),
            },
            pdu,
        ))
    }

    /// The mailbox counter after this transfer, to be stored back on the SubDevice.
    pub(crate) fn counter(&self) -> u8 {
        self.counter
    }

    fn fail(&self, status: FoeStatus, code: u32) -> FoeStep {
        FoeStep::Done(FoeOutcome::Failed(FoeError { status, code }))
    }

    /// Feed a completed PDU in, get the next one (or the terminal result) out.
    pub(crate) fn advance(&mut self, response: Pdu, now: Instant) -> Result<FoeStep, Error> {
        match &mut self.state {
            State::Exchange(exchange) => match exchange.advance(response, now) {
                Ok(MailboxStep::Send(pdu)) => Ok(FoeStep::Send(pdu)),
                Ok(MailboxStep::Done(raw)) => self.on_response(&raw),
                Err(Error::Mailbox(MailboxError::NoResponse)) => {
                    Ok(self.fail(FoeStatus::TimeoutError, 0))
                }
                Err(Error::WorkingCounter { .. }) => Ok(self.fail(FoeStatus::WcError, 0)),
                Err(e) => Err(e),
            },
            State::FinalAck(exchange) => match exchange.advance(response, now) {
                Ok(MailboxStep::Send(pdu)) => Ok(FoeStep::Send(pdu)),
                Ok(MailboxStep::Done(_)) => {
                    let Direction::Read { buffer } = &mut self.direction else {
                        return Err(Error::Internal);
                    };

                    Ok(FoeStep::Done(FoeOutcome::ReadOk(core::mem::take(buffer))))
                }
                Err(Error::WorkingCounter { .. }) => Ok(self.fail(FoeStatus::WcError, 0)),
                Err(e) => Err(e),
            },
        }
    }

    fn on_response(&mut self, raw: &[u8]) -> Result<FoeStep, Error> {
        let (header, payload) = match mailbox::parse_response(raw) {
            Ok(parsed) => parsed,
            Err(_) => return Ok(self.fail(FoeStatus::ReceiveError, 0)),
        };

        if header.mailbox_type != MailboxType::Foe {
            fmt::warn!(
                "SubDevice {:#06x} answered FoE request with mailbox type {:?}",
                self.station,
                header.mailbox_type
            );

            return Ok(self.fail(FoeStatus::ProtError, 0));
        }

        let Ok(foe) = FoeHeader::unpack_from_slice(payload) else {
            return Ok(self.fail(FoeStatus::ProtError, 0));
        };

        let body = &payload[FoeHeader::PACKED_LEN..];

        match foe.opcode {
            FoeOpcode::Err => {
                fmt::warn!(
                    "SubDevice {:#06x} FoE error {:#010x}",
                    self.station,
                    foe.value
                );

                Ok(self.fail(FoeStatus::Error, foe.value))
            }
            FoeOpcode::Busy => self.retry_after_busy(),
            FoeOpcode::Data => self.on_data(foe.value, body),
            FoeOpcode::Ack => self.on_ack(foe.value),
            FoeOpcode::Rrq | FoeOpcode::Wrq => Ok(self.fail(FoeStatus::OpcodeError, 0)),
        }
    }

    fn retry_after_busy(&mut self) -> Result<FoeStep, Error> {
        match &self.direction {
            Direction::Write {
                data,
                chunk_start,
                chunk_end,
            } => {
                // Re-send the chunk the server refused
                let chunk = data[*chunk_start..*chunk_end].to_vec();

                self.counter = crate::coe::fsm::next_counter(self.counter);

                let request = foe_frame(
                    self.counter,
                    FoeHeader {
                        opcode: FoeOpcode::Data,
                        value: self.packet_no,
                    },
                    &chunk,
                );

                let (exchange, pdu) =
                    MailboxExchange::start(self.station, self.geometry, request, self.deadline)?;

                self.state = State::Exchange(exchange);

                Ok(FoeStep::Send(pdu))
            }
            Direction::Read { .. } => {
                // Re-acknowledge the last packet to ask for a resend
                self.counter = crate::coe::fsm::next_counter(self.counter);

                let request = foe_frame(
                    self.counter,
                    FoeHeader {
                        opcode: FoeOpcode::Ack,
                        value: self.packet_no,
                    },
                    &[],
                );

                let (exchange, pdu) =
                    MailboxExchange::start(self.station, self.geometry, request, self.deadline)?;

                self.state = State::Exchange(exchange);

                Ok(FoeStep::Send(pdu))
            }
        }
    }

    /// A DATA packet arrived while reading.
    fn on_data(&mut self, packet_no: u32, body: &[u8]) -> Result<FoeStep, Error> {
        let Direction::Read { buffer } = &mut self.direction else {
            return Ok(self.fail(FoeStatus::OpcodeError, 0));
        };

        if packet_no != self.packet_no + 1 {
            fmt::warn!(
                "FoE read from {:#06x}: expected packet {}, got {}",
                self.station,
                self.packet_no + 1,
                packet_no
            );

            return Ok(self.fail(FoeStatus::PacketNoError, 0));
        }

        if body.is_empty() && buffer.is_empty() {
            return Ok(self.fail(FoeStatus::NodataError, 0));
        }

        buffer.extend_from_slice(body);

        self.packet_no = packet_no;

        let is_last = body.len() < self.block_size;

        self.counter = crate::coe::fsm::next_counter(self.counter);

        let request = foe_frame(
            self.counter,
            FoeHeader {
                opcode: FoeOpcode::Ack,
                value: packet_no,
            },
            &[],
        );

        if is_last {
            let (exchange, pdu) =
                MailboxExchange::write_only(self.station, self.geometry, request)?;

            self.state = State::FinalAck(exchange);

            Ok(FoeStep::Send(pdu))
        } else {
            let (exchange, pdu) =
                MailboxExchange::start(self.station, self.geometry, request, self.deadline)?;

            self.state = State::Exchange(exchange);

            Ok(FoeStep::Send(pdu))
        }
    }

    /// An ACK arrived while writing.
    fn on_ack(&mut self, packet_no: u32) -> Result<FoeStep, Error> {
        let Direction::Write {
            data,
            chunk_start,
            chunk_end,
        } = &mut self.direction
        else {
            return Ok(self.fail(FoeStatus::OpcodeError, 0));
        };

        if packet_no != self.packet_no {
            return Ok(self.fail(FoeStatus::PacketNoError, 0));
        }

        // The previous chunk is acknowledged; was it the closing short packet?
        let finished =
            *chunk_end >= data.len() && (self.packet_no > 0) && (*chunk_end - *chunk_start) < self.block_size;

        if finished {
            return Ok(FoeStep::Done(FoeOutcome::WriteOk));
        }

        *chunk_start = *chunk_end;
        *chunk_end = (*chunk_start + self.block_size).min(data.len());

        let chunk = data[*chunk_start..*chunk_end].to_vec();

        self.packet_no += 1;

        self.counter = crate::coe::fsm::next_counter(self.counter);

        let request = foe_frame(
            self.counter,
            FoeHeader {
                opcode: FoeOpcode::Data,
                value: self.packet_no,
            },
            &chunk,
        );

        let (exchange, pdu) =
            MailboxExchange::start(self.station, self.geometry, request, self.deadline)?;

        self.state = State::Exchange(exchange);

        Ok(FoeStep::Send(pdu))
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
            rx_size: 268,
            tx_offset: 0x1200,
            tx_size: 268,
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

    fn foe_response(opcode: u8, value: u32, body: &[u8]) -> Vec<u8> {
        let mut raw = vec![0u8; 268];

        let length = (6 + body.len()) as u16;
        raw[0..2].copy_from_slice(&length.to_le_bytes());
        raw[5] = 0x04;

        raw[6] = opcode;
        raw[8..12].copy_from_slice(&value.to_le_bytes());
        raw[12..12 + body.len()].copy_from_slice(body);

        raw
    }

    fn to_fetch(fsm: &mut FoeFsm, write_pdu: Pdu, now: Instant) -> Pdu {
        let check = match fsm.advance(complete(write_pdu), now).unwrap() {
            FoeStep::Send(pdu) => pdu,
            _ => panic!("expected check"),
        };

        match fsm.advance(respond(check, &[0x08]), now).unwrap() {
            FoeStep::Send(pdu) => pdu,
            _ => panic!("expected fetch"),
        }
    }

    #[test]
    fn block_size_accounts_for_headers() {
        assert_eq!(FoeFsm::block_size(&geometry()), 256);
    }

    #[test]
    fn write_sends_numbered_data_after_ack() {
        let now = Instant::now();
        let deadline = now + Duration::from_secs(10);

        let data = vec![0x55u8; 300];

        let (mut fsm, wrq) = FoeFsm::write(
            STATION,
            geometry(),
            0,
            "firmware.bin",
            0,
            data,
            deadline,
        )
        .unwrap();

        assert_eq!(wrq.command(), Command::fpwr(STATION, 0x1000));

        let fetch = to_fetch(&mut fsm, wrq, now);

        // Server acknowledges the write request with packet number 0
        let data1 = match fsm
            .advance(respond(fetch, &foe_response(0x04, 0, &[])), now)
            .unwrap()
        {
            FoeStep::Send(pdu) => pdu,
            _ => panic!("expected first DATA"),
        };

        // First DATA packet: number 1, full 256 byte block
        assert_eq!(&data1.data()[6..12], &[0x03, 0x00, 0x01, 0x00, 0x00, 0x00]);

        let fetch = to_fetch(&mut fsm, data1, now);

        // ACK 1 -> short closing DATA packet number 2 (300 - 256 = 44 bytes)
        let data2 = match fsm
            .advance(respond(fetch, &foe_response(0x04, 1, &[])), now)
            .unwrap()
        {
            FoeStep::Send(pdu) => pdu,
            _ => panic!("expected second DATA"),
        };

        let fetch = to_fetch(&mut fsm, data2, now);

        // ACK 2 ends the transfer
        match fsm
            .advance(respond(fetch, &foe_response(0x04, 2, &[])), now)
            .unwrap()
        {
            FoeStep::Done(FoeOutcome::WriteOk) => {}
            _ => panic!("expected write completion"),
        }
    }

    #[test]
    fn read_terminates_on_short_data() {
        let now = Instant::now();
        let deadline = now + Duration::from_secs(10);

        let (mut fsm, rrq) =
            FoeFsm::read(STATION, geometry(), 0, "config.xml", 0, deadline).unwrap();

        let fetch = to_fetch(&mut fsm, rrq, now);

        // Single short DATA packet ends the file immediately
        let ack = match fsm
            .advance(respond(fetch, &foe_response(0x03, 1, b"<xml/>")), now)
            .unwrap()
        {
            FoeStep::Send(pdu) => pdu,
            _ => panic!("expected final ACK"),
        };

        match fsm.advance(complete(ack), now).unwrap() {
            FoeStep::Done(FoeOutcome::ReadOk(data)) => assert_eq!(data, b"<xml/>"),
            _ => panic!("expected read completion"),
        }
    }

    #[test]
    fn explicit_error_carries_code() {
        let now = Instant::now();
        let deadline = now + Duration::from_secs(10);

        let (mut fsm, rrq) =
            FoeFsm::read(STATION, geometry(), 0, "missing.bin", 0, deadline).unwrap();

        let fetch = to_fetch(&mut fsm, rrq, now);

        match fsm
            .advance(respond(fetch, &foe_response(0x05, 0x8001, &[])), now)
            .unwrap()
        {
            FoeStep::Done(FoeOutcome::Failed(e)) => {
                assert_eq!(e.status, FoeStatus::Error);
                assert_eq!(e.code, 0x8001);
            }
            _ => panic!("expected failure"),
        }
    }
}
