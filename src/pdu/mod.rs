//! PDUs (datagrams) and the queue/dispatch machinery that carries them.

pub(crate) mod frame;
pub(crate) mod header;
pub(crate) mod queue;

use crate::{
    command::Command,
    error::{Error, PduError},
};
use std::time::Instant;

/// Lifecycle state of a [`Pdu`].
///
/// A PDU sits in the queue if and only if it is `Queued` or `Sent`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum PduState {
    /// Initialised but not yet handed to the queue.
    #[default]
    Init,
    /// Waiting in the queue for the next frame.
    Queued,
    /// On the wire; a matching response is outstanding.
    Sent,
    /// A response was matched and its payload/working counter copied back.
    Received,
    /// No response arrived within the timeout budget.
    TimedOut,
    /// The response was malformed.
    Error,
}

/// A single EtherCAT command in flight: payload, rolling index, working counter and lifecycle
/// state.
#[derive(Debug, Clone)]
pub struct Pdu {
    pub(crate) command: Command,
    /// Assigned by the queue at send time.
    pub(crate) index: u8,
    pub(crate) data: Vec<u8>,
    /// Set from the response footer.
    pub(crate) working_counter: u16,
    pub(crate) state: PduState,
    pub(crate) queued_at: Option<Instant>,
    pub(crate) sent_at: Option<Instant>,
    pub(crate) received_at: Option<Instant>,
}

impl Pdu {
    /// A read command expecting `len` bytes back. The payload is sent zero-filled.
    pub(crate) fn read(command: Command, len: usize) -> Self {
        Self {
            command,
            index: 0,
            data: vec![0u8; len],
            working_counter: 0,
            state: PduState::Init,
            queued_at: None,
            sent_at: None,
            received_at: None,
        }
    }

    /// A write command carrying `data`.
    pub(crate) fn write(command: Command, data: Vec<u8>) -> Self {
        Self {
            command,
            index: 0,
            data,
            working_counter: 0,
            state: PduState::Init,
            queued_at: None,
            sent_at: None,
            received_at: None,
        }
    }

    /// The command this PDU carries.
    pub(crate) fn command(&self) -> Command {
        self.command
    }

    /// Response payload.
    pub(crate) fn data(&self) -> &[u8] {
        &self.data
    }

    /// The working counter of the response.
    pub(crate) fn working_counter(&self) -> u16 {
        self.working_counter
    }

    /// Check that the PDU was answered at all, regardless of working counter.
    pub(crate) fn check_received(&self) -> Result<(), Error> {
        match self.state {
            PduState::Received => Ok(()),
            PduState::TimedOut => Err(Error::Timeout),
            _ => Err(Error::Pdu(PduError::Decode)),
        }
    }

    /// Check the PDU was answered with the expected working counter.
    pub(crate) fn check_wkc(&self, expected: u16) -> Result<(), Error> {
        self.check_received()?;

        if self.working_counter != expected {
            return Err(Error::WorkingCounter {
                expected,
                received: self.working_counter,
            });
        }

        Ok(())
    }

    /// Consume the PDU, returning its payload after a working counter check.
    pub(crate) fn into_response(self, expected_wkc: u16) -> Result<Vec<u8>, Error> {
        self.check_wkc(expected_wkc)?;

        Ok(self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_is_zero_filled() {
        let pdu = Pdu::read(Command::brd(0x0130), 2);

        assert_eq!(pdu.data(), &[0, 0]);
        assert_eq!(pdu.state, PduState::Init);
    }

    #[test]
    fn wkc_mismatch_surfaces_both_values() {
        let mut pdu = Pdu::read(Command::fprd(0x1001, 0x0130), 2);

        pdu.state = PduState::Received;
        pdu.working_counter = 0;

        assert_eq!(
            pdu.check_wkc(1),
            Err(Error::WorkingCounter {
                expected: 1,
                received: 0
            })
        );
    }

    #[test]
    fn timeout_wins_over_wkc() {
        let mut pdu = Pdu::read(Command::fprd(0x1001, 0x0130), 2);

        pdu.state = PduState::TimedOut;

        assert_eq!(pdu.check_wkc(1), Err(Error::Timeout));
    }
}
