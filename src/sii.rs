//! The Slave Information Interface (SII) sub-FSM: one 16-bit EEPROM word read or written
//! through the ESC registers at `0x0502..0x050a`.

use crate::{
    command::Command,
    error::{EepromError, Error},
    fmt,
    pdu::{Pdu, PduState},
    register::RegisterAddress,
};
use std::time::{Duration, Instant};

/// Busy-poll budget. The ESC signals busy while the physical EEPROM access runs.
const BUSY_BUDGET: Duration = Duration::from_millis(10);

/// Datagram retries before a timed out access is fatal.
const RETRIES: u8 = 3;

/// Consecutive zero working counter polls before the SubDevice is considered gone.
const MAX_WKC_ZERO_POLLS: u8 = 3;

/// How SII PDUs address the SubDevice.
///
/// During the initial scan station addresses do not exist yet, so access goes by ring
/// position; afterwards by configured station address.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum SiiAddressing {
    /// Auto increment addressing by ring position.
    AutoIncrement(u16),
    /// Configured station addressing.
    Configured(u16),
}

impl SiiAddressing {
    fn read(&self, register: u16, len: usize) -> Pdu {
        match self {
            Self::AutoIncrement(position) => Pdu::read(Command::aprd(*position, register), len),
            Self::Configured(station) => Pdu::read(Command::fprd(*station, register), len),
        }
    }

    fn write(&self, register: u16, data: Vec<u8>) -> Pdu {
        match self {
            Self::AutoIncrement(position) => Pdu::write(Command::apwr(*position, register), data),
            Self::Configured(station) => Pdu::write(Command::fpwr(*station, register), data),
        }
    }
}

/// Outcome of one FSM step.
pub(crate) enum SiiStep {
    /// Enqueue this PDU and call [`SiiFsm::advance`] with the completed response.
    Send(Pdu),
    /// Read finished: the four data bytes (two EEPROM words) starting at the requested
    /// address.
    DoneRead([u8; 4]),
    /// Write finished.
    DoneWrite,
}

#[derive(Copy, Clone)]
enum State {
    /// Read request issued.
    StartRead,
    /// Busy-polling the control/status and data registers.
    FetchRead,
    /// Write request issued.
    StartWrite,
    /// Busy-polling the control/status register.
    PollWrite,
}

/// Read or write one EEPROM location via the SII registers with a busy-poll budget.
pub(crate) struct SiiFsm {
    addressing: SiiAddressing,
    state: State,
    /// Wall clock start of the busy poll.
    poll_started: Option<Instant>,
    /// One more poll is allowed after the budget expires.
    check_once_more: bool,
    retries: u8,
    wkc_zero_polls: u8,
}

impl SiiFsm {
    /// Start reading two EEPROM words at `word_address`.
    pub(crate) fn read(addressing: SiiAddressing, word_address: u16) -> (Self, Pdu) {
        // Control word: read-only access, request read; then the word address
        let mut request = vec![0u8; 4];
        request[1] = 0x01;
        request[2..4].copy_from_slice(&word_address.to_le_bytes());

        let pdu = addressing.write(RegisterAddress::SiiControl.into(), request);

        (
            Self {
                addressing,
                state: State::StartRead,
                poll_started: None,
                check_once_more: true,
                retries: RETRIES,
                wkc_zero_polls: 0,
            },
            pdu,
        )
    }

    /// Start writing one EEPROM word at `word_address`.
    pub(crate) fn write(addressing: SiiAddressing, word_address: u16, value: u16) -> (Self, Pdu) {
        // Control word: enable write access, request write; the (32 bit) word address; the data
        let mut request = vec![0u8; 8];
        request[0] = 0x01;
        request[1] = 0x02;
        request[2..4].copy_from_slice(&word_address.to_le_bytes());
        request[6..8].copy_from_slice(&value.to_le_bytes());

        let pdu = addressing.write(RegisterAddress::SiiControl.into(), request);

        (
            Self {
                addressing,
                state: State::StartWrite,
                poll_started: None,
                check_once_more: true,
                retries: RETRIES,
                wkc_zero_polls: 0,
            },
            pdu,
        )
    }

    fn read_poll_pdu(&self) -> Pdu {
        // Control/status, address and data registers in one go
        self.addressing.read(RegisterAddress::SiiControl.into(), 10)
    }

    fn write_poll_pdu(&self) -> Pdu {
        self.addressing.read(RegisterAddress::SiiControl.into(), 2)
    }

    /// Retry policy shared by every state: re-issue on timeout, bounded by [`RETRIES`].
    fn check_response(&mut self, response: &Pdu, retry: &Pdu) -> Result<Option<Pdu>, Error> {
        if response.state == PduState::TimedOut {
            if self.retries > 0 {
                self.retries -= 1;

                return Ok(Some(retry.clone()));
            }

            return Err(Error::Timeout);
        }

        response.check_received()?;

        Ok(None)
    }

    /// Feed a completed PDU in, get the next one (or the result) out.
    pub(crate) fn advance(&mut self, response: Pdu, now: Instant) -> Result<SiiStep, Error> {
        match self.state {
            State::StartRead => {
                let retry = {
                    let mut pdu = response.clone();
                    pdu.state = PduState::Init;
                    pdu
                };

                if let Some(pdu) = self.check_response(&response, &retry)? {
                    return Ok(SiiStep::Send(pdu));
                }

                response.check_wkc(1)?;

                self.state = State::FetchRead;
                self.poll_started = Some(now);
                self.retries = RETRIES;

                Ok(SiiStep::Send(self.read_poll_pdu()))
            }
            State::FetchRead => {
                let retry = self.read_poll_pdu();

                if let Some(pdu) = self.check_response(&response, &retry)? {
                    return Ok(SiiStep::Send(pdu));
                }

                if response.working_counter() == 0 {
                    self.wkc_zero_polls += 1;

                    if self.wkc_zero_polls >= MAX_WKC_ZERO_POLLS {
                        fmt::warn!("SII read: no response after repeated polls");

                        return Err(Error::Eeprom(EepromError::Access));
                    }

                    return Ok(SiiStep::Send(self.read_poll_pdu()));
                }

                self.wkc_zero_polls = 0;

                response.check_wkc(1)?;

                // Busy or read request still pending
                if response.data()[1] & 0x81 != 0 {
                    return self.busy_poll(now, Self::read_poll_pdu);
                }

                let mut value = [0u8; 4];
                value.copy_from_slice(&response.data()[6..10]);

                Ok(SiiStep::DoneRead(value))
            }
            State::StartWrite => {
                let retry = {
                    let mut pdu = response.clone();
                    pdu.state = PduState::Init;
                    pdu
                };

                if let Some(pdu) = self.check_response(&response, &retry)? {
                    return Ok(SiiStep::Send(pdu));
                }

                response.check_wkc(1)?;

                self.state = State::PollWrite;
                self.poll_started = Some(now);
                self.retries = RETRIES;

                Ok(SiiStep::Send(self.write_poll_pdu()))
            }
            State::PollWrite => {
                let retry = self.write_poll_pdu();

                if let Some(pdu) = self.check_response(&response, &retry)? {
                    return Ok(SiiStep::Send(pdu));
                }

                if response.working_counter() == 0 {
                    self.wkc_zero_polls += 1;

                    if self.wkc_zero_polls >= MAX_WKC_ZERO_POLLS {
                        fmt::warn!("SII write: no response after repeated polls");

                        return Err(Error::Eeprom(EepromError::Access));
                    }

                    return Ok(SiiStep::Send(self.write_poll_pdu()));
                }

                self.wkc_zero_polls = 0;

                response.check_wkc(1)?;

                // Busy or write request still pending
                if response.data()[1] & 0x82 != 0 {
                    return self.busy_poll(now, Self::write_poll_pdu);
                }

                // Write error flag
                if response.data()[1] & 0x40 != 0 {
                    fmt::error!("SII write operation failed");

                    return Err(Error::Eeprom(EepromError::Access));
                }

                Ok(SiiStep::DoneWrite)
            }
        }
    }

    /// Re-poll while busy; one extra poll is allowed after the budget runs out.
    fn busy_poll(&mut self, now: Instant, poll: fn(&Self) -> Pdu) -> Result<SiiStep, Error> {
        let started = self.poll_started.unwrap_or(now);

        if now.saturating_duration_since(started) >= BUSY_BUDGET {
            if !self.check_once_more {
                fmt::error!("SII access timed out");

                return Err(Error::Eeprom(EepromError::Access));
            }

            self.check_once_more = false;
        }

        self.retries = RETRIES;

        Ok(SiiStep::Send(poll(self)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn respond(mut pdu: Pdu, data: &[u8], wkc: u16) -> Pdu {
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.working_counter = wkc;
        pdu.state = PduState::Received;
        pdu
    }

    #[test]
    fn read_uses_auto_increment_before_addresses_exist() {
        let (_, pdu) = SiiFsm::read(SiiAddressing::AutoIncrement(2), 0x0040);

        assert_eq!(pdu.command(), Command::apwr(2, 0x0502));
        assert_eq!(pdu.data(), &[0x00, 0x01, 0x40, 0x00]);
    }

    #[test]
    fn read_round_trip() {
        let now = Instant::now();

        let (mut fsm, start) = SiiFsm::read(SiiAddressing::Configured(0x1001), 0x0008);

        let poll = match fsm.advance(respond(start, &[0, 1, 8, 0], 1), now).unwrap() {
            SiiStep::Send(pdu) => pdu,
            _ => panic!("expected poll"),
        };

        assert_eq!(poll.command(), Command::fprd(0x1001, 0x0502));
        assert_eq!(poll.data().len(), 10);

        // Not busy, value in bytes 6..10
        let mut data = [0u8; 10];
        data[6..10].copy_from_slice(&[0x02, 0x00, 0x00, 0x00]);

        match fsm.advance(respond(poll, &data, 1), now).unwrap() {
            SiiStep::DoneRead(value) => assert_eq!(value, [0x02, 0x00, 0x00, 0x00]),
            _ => panic!("expected read completion"),
        }
    }

    #[test]
    fn busy_repolls_within_budget() {
        let now = Instant::now();

        let (mut fsm, start) = SiiFsm::read(SiiAddressing::Configured(0x1001), 0x0000);

        let poll = match fsm.advance(respond(start, &[0, 1, 0, 0], 1), now).unwrap() {
            SiiStep::Send(pdu) => pdu,
            _ => panic!("expected poll"),
        };

        // Busy bit set
        let mut busy = [0u8; 10];
        busy[1] = 0x80;

        let again = match fsm.advance(respond(poll, &busy, 1), now).unwrap() {
            SiiStep::Send(pdu) => pdu,
            _ => panic!("expected re-poll"),
        };

        // Past the budget: one more poll is allowed, then it is fatal
        let last = match fsm
            .advance(
                respond(again, &busy, 1),
                now + Duration::from_millis(20),
            )
            .unwrap()
        {
            SiiStep::Send(pdu) => pdu,
            _ => panic!("expected final poll"),
        };

        assert_eq!(
            fsm.advance(respond(last, &busy, 1), now + Duration::from_millis(30))
                .err(),
            Some(Error::Eeprom(EepromError::Access))
        );
    }

    #[test]
    fn write_sets_enable_and_value() {
        let (_, pdu) = SiiFsm::write(SiiAddressing::Configured(0x1001), 0x0004, 0xbeef);

        assert_eq!(pdu.command(), Command::fpwr(0x1001, 0x0502));
        assert_eq!(
            pdu.data(),
            &[0x01, 0x02, 0x04, 0x00, 0x00, 0x00, 0xef, 0xbe]
        );
    }

    #[test]
    fn three_zero_wkc_polls_fatal() {
        let now = Instant::now();

        let (mut fsm, start) = SiiFsm::write(SiiAddressing::Configured(0x1001), 0x0004, 0x1234);

        let mut poll = match fsm.advance(respond(start, &[0u8; 8], 1), now).unwrap() {
            SiiStep::Send(pdu) => pdu,
            _ => panic!("expected poll"),
        };

        for _ in 0..2 {
            poll = match fsm.advance(respond(poll, &[0u8; 2], 0), now).unwrap() {
                SiiStep::Send(pdu) => pdu,
                _ => panic!("expected re-poll"),
            };
        }

        assert_eq!(
            fsm.advance(respond(poll, &[0u8; 2], 0), now).err(),
            Some(Error::Eeprom(EepromError::Access))
        );
    }
}
