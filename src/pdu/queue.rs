//! The MainDevice-wide PDU queue and response dispatcher.
//!
//! All traffic, cyclic process data and the master FSM's own PDUs alike, goes through this
//! one queue and shares the same frames on the wire.

use crate::{
    error::Error,
    fmt,
    pdu::{
        Pdu, PduState,
        frame::{self, PDU_OVERHEAD},
    },
};
use smallvec::SmallVec;
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Claim ticket for a PDU handed to the queue.
///
/// The issuer polls with this until the PDU reaches a terminal state, then takes it back.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct PduToken(u32);

#[derive(Debug)]
struct Entry {
    token: PduToken,
    pdu: Pdu,
}

/// Dispatcher counters, flushed to the log by the statistics block.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub(crate) struct QueueCounters {
    /// Received PDUs with no matching sent PDU.
    pub unmatched: u64,
    /// Malformed frames or PDUs.
    pub corrupted: u64,
    /// PDUs that exceeded their round trip budget.
    pub timeouts: u64,
    /// Frames sent.
    pub tx_frames: u64,
    /// Frames received and parsed.
    pub rx_frames: u64,
}

pub(crate) struct PduQueue {
    /// PDUs in `Queued` or `Sent` state, in submission order.
    entries: VecDeque<Entry>,
    /// Terminal PDUs waiting to be claimed by their issuer.
    completed: Vec<Entry>,
    next_token: u32,
    /// Rolling frame index, wraps at 256.
    next_index: u8,
    timeout: Duration,
    counters: QueueCounters,
}

impl PduQueue {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            completed: Vec::new(),
            next_token: 0,
            next_index: 0,
            timeout,
            counters: QueueCounters::default(),
        }
    }

    pub(crate) fn counters(&self) -> QueueCounters {
        self.counters
    }

    /// Number of PDUs currently queued or in flight.
    pub(crate) fn pending(&self) -> usize {
        self.entries.len()
    }

    /// Hand a PDU to the queue.
    ///
    /// Ownership moves into the queue, so a PDU cannot be queued twice; re-submitting after a
    /// timeout therefore always goes through [`claim`](Self::claim) first and gets a fresh
    /// index.
    pub(crate) fn submit(&mut self, mut pdu: Pdu, now: Instant) -> PduToken {
        let token = PduToken(self.next_token);

        self.next_token = self.next_token.wrapping_add(1);

        pdu.state = PduState::Queued;
        pdu.queued_at = Some(now);
        pdu.working_counter = 0;
        pdu.received_at = None;

        self.entries.push_back(Entry { token, pdu });

        token
    }

    /// Pack all queued PDUs into as few frames as possible and emit them.
    ///
    /// Each PDU is assigned a fresh rolling index and marked `Sent`. `emit` receives one
    /// complete EtherCAT payload (frame header plus PDU area) per frame.
    pub(crate) fn send_queued(
        &mut self,
        now: Instant,
        frame_buf: &mut [u8],
        mut emit: impl FnMut(&[u8]) -> Result<(), Error>,
    ) -> Result<usize, Error> {
        let mut frames_sent = 0;

        loop {
            // Select the longest prefix of queued PDUs that fits one frame
            let mut batch: SmallVec<[usize; 16]> = SmallVec::new();
            let mut used = 0usize;

            for (position, entry) in self.entries.iter().enumerate() {
                if entry.pdu.state != PduState::Queued {
                    continue;
                }

                let needed = entry.pdu.data.len() + PDU_OVERHEAD;

                if used + needed > frame::MAX_PDU_AREA {
                    break;
                }

                used += needed;
                batch.push(position);
            }

            if batch.is_empty() {
                break;
            }

            for position in batch.iter() {
                let entry = &mut self.entries[*position];

                entry.pdu.index = self.next_index;
                self.next_index = self.next_index.wrapping_add(1);

                entry.pdu.state = PduState::Sent;
                entry.pdu.sent_at = Some(now);
            }

            let pdus = batch
                .iter()
                .map(|position| &self.entries[*position].pdu)
                .collect::<Vec<_>>();

            let written = frame::write_frame(&pdus, frame_buf)?;

            emit(&frame_buf[..written])?;

            self.counters.tx_frames += 1;
            frames_sent += 1;
        }

        Ok(frames_sent)
    }

    /// Dispatch a received EtherCAT frame payload back onto the sent PDUs it answers.
    ///
    /// Each contained PDU must match exactly one `Sent` entry by (command code, index, payload
    /// length). Unmatched or malformed data is counted, never fatal.
    pub(crate) fn on_frame_received(&mut self, ethercat_payload: &[u8], now: Instant) {
        let iter = match frame::PduIter::new(ethercat_payload) {
            Ok(iter) => iter,
            Err(_) => {
                self.counters.corrupted += 1;

                return;
            }
        };

        self.counters.rx_frames += 1;

        for received in iter {
            let received = match received {
                Ok(received) => received,
                Err(_) => {
                    self.counters.corrupted += 1;

                    return;
                }
            };

            let position = self.entries.iter().position(|entry| {
                entry.pdu.state == PduState::Sent
                    && entry.pdu.command.code() == received.header.command_code
                    && entry.pdu.index == received.header.index
                    && entry.pdu.data.len() == received.payload.len()
            });

            let Some(position) = position else {
                fmt::debug!(
                    "Unmatched PDU: command {:#04x}, index {}, len {}",
                    received.header.command_code,
                    received.header.index,
                    received.payload.len()
                );

                self.counters.unmatched += 1;

                continue;
            };

            let mut entry = self
                .entries
                .remove(position)
                .expect("position from entries scan");

            entry.pdu.data.copy_from_slice(received.payload);
            entry.pdu.working_counter = received.working_counter;
            entry.pdu.state = PduState::Received;
            entry.pdu.received_at = Some(now);

            self.completed.push(entry);
        }
    }

    /// Expire every queued or sent PDU older than the timeout budget.
    pub(crate) fn tick(&mut self, now: Instant) {
        let timeout = self.timeout;

        let mut position = 0;

        while position < self.entries.len() {
            let age = self.entries[position]
                .pdu
                .queued_at
                .map(|queued_at| now.saturating_duration_since(queued_at))
                .unwrap_or_default();

            if age > timeout {
                let mut entry = self
                    .entries
                    .remove(position)
                    .expect("position bound checked");

                fmt::debug!(
                    "PDU {} index {} timed out after {} us",
                    entry.pdu.command,
                    entry.pdu.index,
                    age.as_micros()
                );

                entry.pdu.state = PduState::TimedOut;

                self.counters.timeouts += 1;

                self.completed.push(entry);
            } else {
                position += 1;
            }
        }
    }

    /// Claim a terminal PDU back from the queue.
    ///
    /// Returns `None` while the PDU is still queued or in flight.
    pub(crate) fn claim(&mut self, token: PduToken) -> Option<Pdu> {
        let position = self
            .completed
            .iter()
            .position(|entry| entry.token == token)?;

        Some(self.completed.swap_remove(position).pdu)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    fn queue() -> PduQueue {
        PduQueue::new(Duration::from_millis(2))
    }

    #[test]
    fn send_assigns_unique_rolling_indices() {
        let mut queue = queue();
        let now = Instant::now();

        for _ in 0..3 {
            queue.submit(Pdu::read(Command::brd(0x0130), 2), now);
        }

        let mut frame_buf = [0u8; 1518];
        let mut frames = Vec::new();

        queue
            .send_queued(now, &mut frame_buf, |frame| {
                frames.push(frame.to_vec());
                Ok(())
            })
            .unwrap();

        assert_eq!(frames.len(), 1);

        let indices = frame::PduIter::new(&frames[0])
            .unwrap()
            .map(|pdu| pdu.unwrap().header.index)
            .collect::<Vec<_>>();

        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn overflow_splits_into_multiple_frames() {
        let mut queue = queue();
        let now = Instant::now();

        // Two PDUs of 1000 bytes each cannot share a 1498 byte PDU area
        queue.submit(Pdu::read(Command::lrd(0), 1000), now);
        queue.submit(Pdu::read(Command::lrd(1000), 1000), now);

        let mut frame_buf = [0u8; 1518];
        let mut frames = 0;

        let sent = queue
            .send_queued(now, &mut frame_buf, |_| {
                frames += 1;
                Ok(())
            })
            .unwrap();

        assert_eq!(sent, 2);
        assert_eq!(frames, 2);
    }

    #[test]
    fn response_is_matched_and_claimable() {
        let mut queue = queue();
        let now = Instant::now();

        let token = queue.submit(Pdu::read(Command::brd(0x0130), 2), now);

        let mut frame_buf = [0u8; 1518];
        let mut wire = Vec::new();

        queue
            .send_queued(now, &mut frame_buf, |frame| {
                wire = frame.to_vec();
                Ok(())
            })
            .unwrap();

        assert!(queue.claim(token).is_none());

        // One SubDevice answers with state INIT
        wire[12] = 0x01;
        wire[14] = 0x01;

        queue.on_frame_received(&wire, now);

        let pdu = queue.claim(token).expect("response matched");

        assert_eq!(pdu.state, PduState::Received);
        assert_eq!(pdu.working_counter(), 1);
        assert_eq!(pdu.data(), &[0x01, 0x00]);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn unmatched_response_counted() {
        let mut queue = queue();
        let now = Instant::now();

        let mut pdu = Pdu::read(Command::brd(0x0130), 2);
        pdu.index = 77;

        let mut frame_buf = [0u8; 1518];

        let written = frame::write_frame(&[&pdu], &mut frame_buf).unwrap();

        queue.on_frame_received(&frame_buf[..written], now);

        assert_eq!(queue.counters().unmatched, 1);
    }

    #[test]
    fn corrupt_frame_counted() {
        let mut queue = queue();

        queue.on_frame_received(&[0xff], Instant::now());

        assert_eq!(queue.counters().corrupted, 1);
    }

    #[test]
    fn stale_pdus_expire() {
        let mut queue = queue();
        let now = Instant::now();

        let token = queue.submit(Pdu::read(Command::brd(0x0130), 2), now);

        queue.tick(now + Duration::from_millis(10));

        let pdu = queue.claim(token).expect("expired PDU is claimable");

        assert_eq!(pdu.state, PduState::TimedOut);
        assert_eq!(queue.counters().timeouts, 1);
        assert_eq!(queue.pending(), 0);
    }

}
