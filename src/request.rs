//! Caller-visible acyclic request objects: SDO, FoE, raw register and SII jobs processed one
//! at a time by the master FSM.
//!
//! A request is `Queued` until the master FSM picks it up, `Busy` while its transfer FSM
//! runs, and terminal afterwards. Submitters block on the master condvar; a request may be
//! cancelled while still `Queued`, but once `Busy` it runs to completion even if abandoned.

use crate::error::{Error, FoeError};
use std::time::Instant;

/// Lifecycle of a request.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum RequestState {
    /// Created but not yet visible to the master FSM.
    #[default]
    Init,
    /// Waiting for the master FSM; cancellable.
    Queued,
    /// A transfer FSM is driving this request; runs to completion.
    Busy,
    /// Finished successfully; the result field is valid.
    Success,
    /// Finished with an error.
    Failure,
}

impl RequestState {
    /// Whether the request has finished, successfully or not.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

/// What a request asks the master to do.
#[derive(Debug, Clone)]
pub(crate) enum RequestKind {
    SdoUpload {
        index: u16,
        sub_index: u8,
    },
    SdoDownload {
        index: u16,
        sub_index: u8,
        data: Vec<u8>,
    },
    /// Fetch the SDO dictionary outside the automatic idle-phase fetch.
    SdoDictionary,
    FoeRead {
        file_name: String,
        password: u32,
    },
    FoeWrite {
        file_name: String,
        password: u32,
        data: Vec<u8>,
    },
    RegisterRead {
        register: u16,
        len: usize,
    },
    RegisterWrite {
        register: u16,
        data: Vec<u8>,
    },
    /// Write one EEPROM word.
    SiiWrite {
        word_address: u16,
        value: u16,
    },
    /// Write a new station alias, recomputing the configuration area checksum.
    WriteAlias {
        alias: u16,
    },
    /// Reset the ESC via the `R`, `E`, `S` sequence on register `0x0040`.
    Reboot,
}

/// Terminal payload of a successful request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RequestResult {
    /// Uploaded/read bytes.
    Data(Vec<u8>),
    /// A write completed.
    Written,
    /// The SDO transfer was aborted with this code.
    SdoAborted(u32),
    /// The FoE transfer failed with this status.
    FoeFailed(FoeError),
}

/// One slot in the request arena.
#[derive(Debug)]
pub(crate) struct RequestSlot {
    pub id: u64,
    /// Ring position of the target SubDevice.
    pub position: u16,
    pub kind: RequestKind,
    pub state: RequestState,
    pub result: Option<RequestResult>,
    pub error: Option<Error>,
    pub submitted_at: Instant,
    /// The submitter stopped waiting; drop the slot once terminal.
    pub abandoned: bool,
}

/// Master-owned arena of pending and running requests.
#[derive(Debug, Default)]
pub(crate) struct RequestArena {
    slots: Vec<RequestSlot>,
    next_id: u64,
}

impl RequestArena {
    /// Append a request for the SubDevice at `position` and return its id.
    pub(crate) fn submit(&mut self, position: u16, kind: RequestKind, now: Instant) -> u64 {
        let id = self.next_id;

        self.next_id = self.next_id.wrapping_add(1);

        self.slots.push(RequestSlot {
            id,
            position,
            kind,
            state: RequestState::Queued,
            result: None,
            error: None,
            submitted_at: now,
            abandoned: false,
        });

        id
    }

    pub(crate) fn get(&self, id: u64) -> Option<&RequestSlot> {
        self.slots.iter().find(|slot| slot.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: u64) -> Option<&mut RequestSlot> {
        self.slots.iter_mut().find(|slot| slot.id == id)
    }

    /// Remove a request that is still `Queued`. Returns false once it has started.
    pub(crate) fn cancel(&mut self, id: u64) -> bool {
        let Some(position) = self.slots.iter().position(|slot| slot.id == id) else {
            return false;
        };

        if self.slots[position].state != RequestState::Queued {
            return false;
        }

        self.slots.remove(position);

        true
    }

    /// Claim a terminal request, removing its slot.
    pub(crate) fn take_terminal(&mut self, id: u64) -> Option<RequestSlot> {
        let position = self
            .slots
            .iter()
            .position(|slot| slot.id == id && slot.state.is_terminal())?;

        Some(self.slots.remove(position))
    }

    /// Mark a request abandoned; it is dropped when (or if already) terminal.
    pub(crate) fn abandon(&mut self, id: u64) {
        if let Some(slot) = self.get_mut(id) {
            slot.abandoned = true;
        }

        self.collect_abandoned();
    }

    fn collect_abandoned(&mut self) {
        self.slots
            .retain(|slot| !(slot.abandoned && slot.state.is_terminal()));
    }

    /// Oldest queued request, preferring SubDevices after `after_position` for round-robin
    /// fairness across the ring.
    pub(crate) fn next_queued(&self, after_position: u16) -> Option<u64> {
        let queued = |slot: &&RequestSlot| slot.state == RequestState::Queued;

        self.slots
            .iter()
            .filter(queued)
            .filter(|slot| slot.position > after_position)
            .min_by_key(|slot| slot.submitted_at)
            .or_else(|| {
                self.slots
                    .iter()
                    .filter(queued)
                    .min_by_key(|slot| slot.submitted_at)
            })
            .map(|slot| slot.id)
    }

    /// Finish a request, storing its outcome.
    pub(crate) fn finish(
        &mut self,
        id: u64,
        outcome: Result<RequestResult, Error>,
    ) {
        let Some(slot) = self.get_mut(id) else {
            return;
        };

        match outcome {
            Ok(result @ (RequestResult::SdoAborted(_) | RequestResult::FoeFailed(_))) => {
                slot.state = RequestState::Failure;
                slot.result = Some(result);
            }
            Ok(result) => {
                slot.state = RequestState::Success;
                slot.result = Some(result);
            }
            Err(error) => {
                slot.state = RequestState::Failure;
                slot.error = Some(error);
            }
        }

        self.collect_abandoned();
    }

    /// Drop every request targeting SubDevices beyond the new ring length, e.g. after a
    /// topology change.
    pub(crate) fn drop_out_of_range(&mut self, slave_count: u16) {
        self.slots.retain(|slot| {
            let keep = slot.position < slave_count || slot.state == RequestState::Busy;

            if !keep {
                crate::fmt::debug!(
                    "Dropping request {} for vanished SubDevice {}",
                    slot.id,
                    slot.position
                );
            }

            keep
        });
    }
}
