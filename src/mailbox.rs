//! Mailbox framing and the write/poll/fetch exchange that all mailbox protocols share.

use crate::{
    command::Command,
    error::{Error, MailboxError},
    fmt,
    pdu::Pdu,
    register::RegisterAddress,
    sync_manager_channel::Status,
};
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireSized, EtherCrabWireWrite};
use std::time::Instant;

/// Mailbox priority.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u8)]
pub enum Priority {
    #[default]
    Lowest = 0x00,
    Low = 0x01,
    High = 0x02,
    Highest = 0x03,
}

/// Mailbox protocol discriminator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u8)]
pub enum MailboxType {
    /// Error (ERR).
    Err = 0x00,
    /// ADS over EtherCAT (AoE).
    Aoe = 0x01,
    /// Ethernet over EtherCAT (EoE).
    Eoe = 0x02,
    /// CAN application protocol over EtherCAT (CoE).
    Coe = 0x03,
    /// File Access over EtherCAT (FoE).
    Foe = 0x04,
    /// Servo profile over EtherCAT (SoE).
    Soe = 0x05,
    // 0x06-0x0e: reserved
    /// Vendor specific (VoE).
    VendorSpecific = 0x0f,
}

bitflags::bitflags! {
    /// Mailbox protocols supported by a SubDevice, from EEPROM word `0x001C`.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct MailboxProtocols: u16 {
        /// ADS over EtherCAT.
        const AOE = 0x01;
        /// Ethernet over EtherCAT.
        const EOE = 0x02;
        /// CAN application protocol over EtherCAT.
        const COE = 0x04;
        /// File Access over EtherCAT.
        const FOE = 0x08;
        /// Servo profile over EtherCAT.
        const SOE = 0x10;
        /// Vendor specific.
        const VOE = 0x20;
    }
}

/// Mailbox header.
///
/// Defined in ETG1000.6 under either `TMBXHEADER` or `MbxHeader`, e.g. Table 29 – CoE Elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 6)]
pub struct MailboxHeader {
    /// Mailbox data payload length.
    #[wire(bytes = 2)]
    pub length: u16,
    #[wire(bytes = 2)]
    pub address: u16,
    // reserved6
    #[wire(pre_skip = 6, bits = 2)]
    pub priority: Priority,
    #[wire(bits = 4)]
    pub mailbox_type: MailboxType,
    /// Mailbox counter from 1 to 7 inclusive. Wraps around to 1 when the count exceeds 7. 0 is
    /// reserved.
    #[wire(bits = 3, post_skip = 1)]
    pub counter: u8,
    // reserved1
}

/// Mailbox sync manager geometry, taken from the SII or from an explicit SM configuration.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct MailboxGeometry {
    /// Write (MainDevice to SubDevice) mailbox physical start.
    pub rx_offset: u16,
    /// Write mailbox length in bytes.
    pub rx_size: u16,
    /// Read (SubDevice to MainDevice) mailbox physical start.
    pub tx_offset: u16,
    /// Read mailbox length in bytes.
    pub tx_size: u16,
}

impl MailboxGeometry {
    /// Whether both mailbox directions are usable.
    pub fn is_valid(&self) -> bool {
        self.rx_size > 0 && self.tx_size > 0
    }

    /// Payload bytes available per mailbox frame in the given direction, after the 6 byte
    /// header.
    pub fn rx_payload_capacity(&self) -> usize {
        usize::from(self.rx_size).saturating_sub(MailboxHeader::PACKED_LEN)
    }
}

/// Outcome of stepping a [`MailboxExchange`].
pub(crate) enum MailboxStep {
    /// Put this PDU on the wire and call [`MailboxExchange::advance`] with the completed
    /// response.
    Send(Pdu),
    /// The SubDevice's TX mailbox contents, starting with its [`MailboxHeader`].
    Done(Vec<u8>),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ExchangeState {
    /// FPWR of the request into the SubDevice's RX mailbox region.
    Write,
    /// As `Write`, but no response is expected.
    WriteOnly,
    /// FPRD of SM1's status byte, repeated until the "mailbox full" bit sets.
    CheckStatus,
    /// FPRD of the whole TX mailbox region.
    Fetch,
}

/// One mailbox interaction: optionally write a request, then poll for and fetch the response.
///
/// Every mailbox protocol (CoE, FoE, ...) layers on this sequence. The status poll repeats
/// every cycle until the response deadline passes.
pub(crate) struct MailboxExchange {
    station: u16,
    geometry: MailboxGeometry,
    state: ExchangeState,
    deadline: Instant,
}

impl MailboxExchange {
    /// Write `request` (a complete mailbox frame, header included) and poll for a response.
    ///
    /// The request is padded with zeros to the full RX mailbox size; ESCs only accept writes
    /// covering the whole sync manager buffer.
    pub(crate) fn start(
        station: u16,
        geometry: MailboxGeometry,
        mut request: Vec<u8>,
        deadline: Instant,
    ) -> Result<(Self, Pdu), Error> {
        if !geometry.is_valid() {
            return Err(Error::Mailbox(MailboxError::NoMailbox));
        }

        if request.len() > usize::from(geometry.rx_size) {
            return Err(Error::Mailbox(MailboxError::TooLong {
                index: 0,
                sub_index: 0,
            }));
        }

        request.resize(usize::from(geometry.rx_size), 0);

        let pdu = Pdu::write(Command::fpwr(station, geometry.rx_offset), request);

        Ok((
            Self {
                station,
                geometry,
                state: ExchangeState::Write,
                deadline,
            },
            pdu,
        ))
    }

    /// Write `request` without waiting for any response.
    ///
    /// Used for fire-and-forget frames such as the final FoE acknowledge.
    pub(crate) fn write_only(
        station: u16,
        geometry: MailboxGeometry,
        mut request: Vec<u8>,
    ) -> Result<(Self, Pdu), Error> {
        if !geometry.is_valid() {
            return Err(Error::Mailbox(MailboxError::NoMailbox));
        }

        request.resize(usize::from(geometry.rx_size), 0);

        let pdu = Pdu::write(Command::fpwr(station, geometry.rx_offset), request);

        Ok((
            Self {
                station,
                geometry,
                state: ExchangeState::WriteOnly,
                // Unused: the write completes in one step
                deadline: Instant::now(),
            },
            pdu,
        ))
    }

    /// Poll for and fetch a response without writing a request first.
    ///
    /// Used when a protocol expects multiple responses per request, e.g. FoE DATA streams.
    pub(crate) fn receive(
        station: u16,
        geometry: MailboxGeometry,
        deadline: Instant,
    ) -> Result<(Self, Pdu), Error> {
        if !geometry.is_valid() {
            return Err(Error::Mailbox(MailboxError::NoMailbox));
        }

        Ok((
            Self {
                station,
                geometry,
                state: ExchangeState::CheckStatus,
                deadline,
            },
            Self::check_pdu(station),
        ))
    }

    fn check_pdu(station: u16) -> Pdu {
        // The TX mailbox is always behind sync manager 1
        Pdu::read(
            Command::fprd(station, RegisterAddress::sync_manager_status(1)),
            1,
        )
    }

    /// Feed the completed PDU back in and get the next step.
    pub(crate) fn advance(&mut self, response: Pdu, now: Instant) -> Result<MailboxStep, Error> {
        match self.state {
            ExchangeState::Write => {
                response.check_wkc(1)?;

                self.state = ExchangeState::CheckStatus;

                Ok(MailboxStep::Send(Self::check_pdu(self.station)))
            }
            ExchangeState::WriteOnly => {
                response.check_wkc(1)?;

                Ok(MailboxStep::Done(Vec::new()))
            }
            ExchangeState::CheckStatus => {
                response.check_wkc(1)?;

                let status = Status::unpack_from_slice(response.data())?;

                if !status.mailbox_full {
                    if now > self.deadline {
                        fmt::warn!(
                            "Mailbox response from {:#06x} timed out",
                            self.station
                        );

                        return Err(Error::Mailbox(MailboxError::NoResponse));
                    }

                    // Poll again next cycle
                    return Ok(MailboxStep::Send(Self::check_pdu(self.station)));
                }

                self.state = ExchangeState::Fetch;

                Ok(MailboxStep::Send(Pdu::read(
                    Command::fprd(self.station, self.geometry.tx_offset),
                    usize::from(self.geometry.tx_size),
                )))
            }
            ExchangeState::Fetch => {
                response.check_wkc(1)?;

                Ok(MailboxStep::Done(response.data))
            }
        }
    }
}

/// Split a fetched TX mailbox region into its header and payload.
pub(crate) fn parse_response(raw: &[u8]) -> Result<(MailboxHeader, &[u8]), Error> {
    let header = MailboxHeader::unpack_from_slice(raw)?;

    let payload = raw
        .get(MailboxHeader::PACKED_LEN..MailboxHeader::PACKED_LEN + usize::from(header.length))
        .ok_or(Error::Mailbox(MailboxError::SdoResponseInvalid {
            index: 0,
            sub_index: 0,
        }))?;

    Ok((header, payload))
}

/// Pack a mailbox header followed by `body` into one buffer.
pub(crate) fn frame(header: MailboxHeader, body: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; MailboxHeader::PACKED_LEN + body.len()];

    header.pack_to_slice_unchecked(&mut buf);
    buf[MailboxHeader::PACKED_LEN..].copy_from_slice(body);

    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::PduState;
    use core::time::Duration;
    use ethercrab_wire::EtherCrabWireWriteSized;

    #[test]
    fn encode_header() {
        // From a wireshark capture
        let expected = [0x0a, 0x00, 0x00, 0x00, 0x00, 0x33];

        let packed = MailboxHeader {
            length: 10,
            priority: Priority::Lowest,
            address: 0x0000,
            counter: 3,
            mailbox_type: MailboxType::Coe,
        }
        .pack();

        assert_eq!(packed, expected);
    }

    #[test]
    fn decode_header() {
        // From Wireshark capture "soem-slaveinfo-akd.pcapng", packet #296
        let raw = [0x0a, 0x00, 0x00, 0x00, 0x00, 0x23];

        let expected = MailboxHeader {
            length: 10,
            address: 0x0000,
            priority: Priority::Lowest,
            mailbox_type: MailboxType::Coe,
            counter: 2,
        };

        assert_eq!(MailboxHeader::unpack_from_slice(&raw).unwrap(), expected);
    }

    fn geometry() -> MailboxGeometry {
        MailboxGeometry {
            rx_offset: 0x1000,
            rx_size: 128,
            tx_offset: 0x1080,
            tx_size: 128,
        }
    }

    fn complete(mut pdu: Pdu, data: &[u8], wkc: u16) -> Pdu {
        pdu.data.copy_from_slice(data);
        pdu.working_counter = wkc;
        pdu.state = PduState::Received;
        pdu
    }

    #[test]
    fn exchange_walks_write_check_fetch() {
        let now = Instant::now();
        let deadline = now + Duration::from_secs(1);

        let (mut exchange, write_pdu) =
            MailboxExchange::start(0x1001, geometry(), vec![0xaa; 16], deadline).unwrap();

        // Request is padded to the full RX mailbox
        assert_eq!(write_pdu.data().len(), 128);
        assert_eq!(write_pdu.command(), Command::fpwr(0x1001, 0x1000));

        let check = match exchange.advance(complete(write_pdu, &[0xaa; 128], 1), now) {
            Ok(MailboxStep::Send(pdu)) => pdu,
            _ => panic!("expected status check"),
        };

        // Wait: hold the check loop once with an empty mailbox
        let check = match exchange.advance(complete(check, &[0x00], 1), now) {
            Ok(MailboxStep::Send(pdu)) => pdu,
            _ => panic!("expected another status check"),
        };

        assert_eq!(check.command(), Command::fprd(0x1001, 0x080d));

        // Mailbox full bit set
        let fetch = match exchange.advance(complete(check, &[0x08], 1), now) {
            Ok(MailboxStep::Send(pdu)) => pdu,
            _ => panic!("expected fetch"),
        };

        assert_eq!(fetch.command(), Command::fprd(0x1001, 0x1080));
        assert_eq!(fetch.data().len(), 128);
    }

    #[test]
    fn empty_mailbox_past_deadline_errors() {
        let now = Instant::now();

        let (mut exchange, check) =
            MailboxExchange::receive(0x1001, geometry(), now - Duration::from_millis(1)).unwrap();

        assert_eq!(
            exchange
                .advance(complete(check, &[0x00], 1), now)
                .err(),
            Some(Error::Mailbox(MailboxError::NoResponse))
        );
    }

    #[test]
    fn missing_mailbox_rejected() {
        assert_eq!(
            MailboxExchange::start(
                1,
                MailboxGeometry::default(),
                vec![],
                Instant::now()
            )
            .err(),
            Some(Error::Mailbox(MailboxError::NoMailbox))
        );
    }
}
