//! The per-SubDevice scan FSM: station address assignment, base info, DL status, EEPROM
//! sizing and read, category parse, and the hop to PREOP.

use crate::{
    al_control::AlStatus,
    command::Command,
    eeprom::{EepromImage, SII_FIRST_CATEGORY},
    error::{EepromError, Error},
    fmt,
    pdu::Pdu,
    register::RegisterAddress,
    sii::{SiiAddressing, SiiFsm, SiiStep},
    subdevice::{BaseInfo, SubDevice, config::{AlStateFsm, AlStep}},
    subdevice_state::SubDeviceState,
};
use ethercrab_wire::EtherCrabWireRead;
use std::time::{Duration, Instant};

/// Guard against EEPROMs with a corrupt category chain.
const MAX_EEPROM_WORDS: u32 = 0x8000;

/// Outcome of one scan FSM step.
pub(crate) enum ScanStep {
    /// Enqueue this PDU and call [`ScanFsm::advance`] with the completed response.
    Send(Pdu),
    /// Scan finished; the fully populated SubDevice record.
    Done(Box<SubDevice>),
}

enum State {
    /// APWR of the station address.
    WriteAddress,
    /// FPRD of the AL status.
    ReadAlState,
    /// FPRD of the ESC base info.
    ReadBase,
    /// FPRD of the DL status.
    ReadDlStatus,
    /// Walking the category chain to size the EEPROM.
    SizeCategories { sii: SiiFsm, header_word: u16 },
    /// Reading the complete EEPROM image two words at a time.
    ReadEeprom {
        sii: SiiFsm,
        word_offset: u16,
        size_words: u16,
    },
    /// Requesting PREOP so the mailbox becomes available.
    RequestPreop(AlStateFsm),
}

/// Scans one newly discovered SubDevice at a given ring position.
pub(crate) struct ScanFsm {
    slave: Box<SubDevice>,
    state: State,
    image: Vec<u8>,
    state_timeout: Duration,
}

impl ScanFsm {
    /// Start a scan. The first PDU assigns station address `ring_position + 1`.
    pub(crate) fn start(ring_position: u16, state_timeout: Duration) -> (Self, Pdu) {
        let slave = Box::new(SubDevice::new(ring_position));

        let pdu = Pdu::write(
            Command::apwr(
                ring_position,
                RegisterAddress::ConfiguredStationAddress.into(),
            ),
            slave.configured_address.to_le_bytes().to_vec(),
        );

        (
            Self {
                slave,
                state: State::WriteAddress,
                image: Vec::new(),
                state_timeout,
            },
            pdu,
        )
    }

    fn addressing(&self) -> SiiAddressing {
        // Station addresses exist by now, but the initial scan stays on auto increment
        // addressing so a half-configured ring behaves the same as a fresh one
        SiiAddressing::AutoIncrement(self.slave.ring_position)
    }

    fn station(&self) -> u16 {
        self.slave.configured_address
    }

    /// Feed a completed PDU in, get the next one (or the scanned SubDevice) out.
    pub(crate) fn advance(&mut self, response: Pdu, now: Instant) -> Result<ScanStep, Error> {
        match &mut self.state {
            State::WriteAddress => {
                response.check_wkc(1)?;

                fmt::debug!(
                    "SubDevice {} assigned station address {:#06x}",
                    self.slave.ring_position,
                    self.slave.configured_address
                );

                self.state = State::ReadAlState;

                Ok(ScanStep::Send(Pdu::read(
                    Command::fprd(self.station(), RegisterAddress::AlStatus.into()),
                    2,
                )))
            }
            State::ReadAlState => {
                response.check_wkc(1)?;

                let status = AlStatus::unpack_from_slice(response.data())?;

                self.slave.state = status.state;

                self.state = State::ReadBase;

                Ok(ScanStep::Send(Pdu::read(
                    Command::fprd(self.station(), RegisterAddress::Type.into()),
                    10,
                )))
            }
            State::ReadBase => {
                response.check_wkc(1)?;

                self.slave.base = BaseInfo::unpack_from_slice(response.data())?;

                self.state = State::ReadDlStatus;

                Ok(ScanStep::Send(Pdu::read(
                    Command::fprd(self.station(), RegisterAddress::DlStatus.into()),
                    2,
                )))
            }
            State::ReadDlStatus => {
                response.check_wkc(1)?;

                self.slave.dl_status =
                    crate::dl_status::DlStatus::unpack_from_slice(response.data())?;

                // Walk the category chain starting at word 0x0040 to find the EEPROM size
                let (sii, pdu) = SiiFsm::read(self.addressing(), SII_FIRST_CATEGORY);

                self.state = State::SizeCategories {
                    sii,
                    header_word: SII_FIRST_CATEGORY,
                };

                Ok(ScanStep::Send(pdu))
            }
            State::SizeCategories { sii, header_word } => match sii.advance(response, now)? {
                SiiStep::Send(pdu) => Ok(ScanStep::Send(pdu)),
                SiiStep::DoneRead(value) => {
                    let category = u16::from_le_bytes([value[0], value[1]]);
                    let len_words = u16::from_le_bytes([value[2], value[3]]);

                    if category == 0xffff {
                        // Terminator found; the image spans everything up to and including it
                        let size_words = *header_word + 1;

                        fmt::debug!(
                            "SubDevice {} EEPROM size: {} words",
                            self.slave.ring_position,
                            size_words
                        );

                        self.image = Vec::with_capacity(usize::from(size_words) * 2);

                        let (sii, pdu) = SiiFsm::read(self.addressing(), 0);

                        self.state = State::ReadEeprom {
                            sii,
                            word_offset: 0,
                            size_words,
                        };

                        return Ok(ScanStep::Send(pdu));
                    }

                    let next = u32::from(*header_word) + 2 + u32::from(len_words);

                    if next >= MAX_EEPROM_WORDS {
                        fmt::error!(
                            "SubDevice {} EEPROM category chain is corrupt",
                            self.slave.ring_position
                        );

                        return Err(Error::Eeprom(EepromError::SectionOverrun));
                    }

                    *header_word = next as u16;

                    let (sii, pdu) = SiiFsm::read(self.addressing(), next as u16);

                    *sii_replace(&mut self.state) = sii;

                    Ok(ScanStep::Send(pdu))
                }
                SiiStep::DoneWrite => Err(Error::Internal),
            },
            State::ReadEeprom {
                sii,
                word_offset,
                size_words,
            } => match sii.advance(response, now)? {
                SiiStep::Send(pdu) => Ok(ScanStep::Send(pdu)),
                SiiStep::DoneRead(value) => {
                    self.image.extend_from_slice(&value);

                    *word_offset += 2;

                    if *word_offset < *size_words {
                        let offset = *word_offset;

                        let (sii, pdu) = SiiFsm::read(self.addressing(), offset);

                        *sii_replace(&mut self.state) = sii;

                        return Ok(ScanStep::Send(pdu));
                    }

                    self.image.truncate(usize::from(*size_words) * 2);

                    self.parse_image()?;

                    // PREOP makes the mailbox available for the idle-phase dictionary fetch
                    let (al, pdu) = AlStateFsm::request(
                        self.station(),
                        SubDeviceState::PreOp,
                        now + self.state_timeout,
                    );

                    self.state = State::RequestPreop(al);

                    Ok(ScanStep::Send(pdu))
                }
                SiiStep::DoneWrite => Err(Error::Internal),
            },
            State::RequestPreop(al) => match al.advance(response, now)? {
                AlStep::Send(pdu) => Ok(ScanStep::Send(pdu)),
                AlStep::Done => {
                    self.slave.state = SubDeviceState::PreOp;
                    self.slave.preop_since = Some(now);

                    fmt::info!(
                        "SubDevice {} ({}) scanned: {}",
                        self.slave.ring_position,
                        self.slave.name().unwrap_or("unnamed"),
                        self.slave.identity
                    );

                    Ok(ScanStep::Done(core::mem::replace(
                        &mut self.slave,
                        Box::new(SubDevice::new(0)),
                    )))
                }
            },
        }
    }

    /// Populate the SubDevice record from the raw EEPROM image.
    fn parse_image(&mut self) -> Result<(), Error> {
        let image = EepromImage::from_bytes(core::mem::take(&mut self.image));

        if !image.checksum_ok() {
            fmt::warn!(
                "SubDevice {} EEPROM configuration area checksum is inconsistent",
                self.slave.ring_position
            );
        }

        self.slave.alias = image.alias();
        self.slave.identity = image.identity()?;
        self.slave.mailbox_protocols = image.mailbox_protocols();

        if !self.slave.mailbox_protocols.is_empty() {
            let standard = image.standard_mailbox()?;

            if standard.is_valid() {
                self.slave.mailbox = Some(standard);
            }

            let bootstrap = image.bootstrap_mailbox()?;

            if bootstrap.is_valid() {
                self.slave.bootstrap_mailbox = Some(bootstrap);
            }
        }

        self.slave.sii = image.parse_categories();
        self.slave.eeprom = image;

        Ok(())
    }
}

/// Project the SII FSM slot out of the states that hold one.
fn sii_replace(state: &mut State) -> &mut SiiFsm {
    match state {
        State::SizeCategories { sii, .. } | State::ReadEeprom { sii, .. } => sii,
        _ => unreachable!("state holds no SII FSM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::PduState;

    fn complete(mut pdu: Pdu, data: &[u8], wkc: u16) -> Pdu {
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.working_counter = wkc;
        pdu.state = PduState::Received;
        pdu
    }

    #[test]
    fn scan_starts_with_address_assignment() {
        let (_, pdu) = ScanFsm::start(2, Duration::from_secs(1));

        assert_eq!(pdu.command(), Command::apwr(2, 0x0010));
        assert_eq!(pdu.data(), &[0x03, 0x00]);
    }

    #[test]
    fn scan_reads_state_then_base_then_ports() {
        let now = Instant::now();

        let (mut fsm, address) = ScanFsm::start(0, Duration::from_secs(1));

        let al_read = match fsm.advance(complete(address, &[0x01, 0x00], 1), now).unwrap() {
            ScanStep::Send(pdu) => pdu,
            _ => panic!("expected AL read"),
        };

        assert_eq!(al_read.command(), Command::fprd(1, 0x0130));

        let base_read = match fsm.advance(complete(al_read, &[0x01, 0x00], 1), now).unwrap() {
            ScanStep::Send(pdu) => pdu,
            _ => panic!("expected base info read"),
        };

        assert_eq!(base_read.command(), Command::fprd(1, 0x0000));
        assert_eq!(base_read.data().len(), 10);

        let base = [0x11, 0x00, 0x02, 0x00, 0x08, 0x08, 0x01, 0x0f, 0x0c, 0x00];

        let dl_read = match fsm.advance(complete(base_read, &base, 1), now).unwrap() {
            ScanStep::Send(pdu) => pdu,
            _ => panic!("expected DL status read"),
        };

        assert_eq!(dl_read.command(), Command::fprd(1, 0x0110));

        // First SII request for the category walk
        let sii_start = match fsm.advance(complete(dl_read, &[0x05, 0x00], 1), now).unwrap() {
            ScanStep::Send(pdu) => pdu,
            _ => panic!("expected SII setup"),
        };

        assert_eq!(sii_start.command(), Command::apwr(0, 0x0502));
    }
}
