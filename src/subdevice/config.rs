//! SubDevice configuration: the AL state change sub-FSM and the INIT → PREOP → SAFEOP → OP
//! configuration walk.

use crate::{
    al_control::{AlControl, AlStatus},
    al_status_code::AlStatusCode,
    coe::fsm::{SdoFsm, SdoOutcome, SdoStep},
    command::Command,
    eeprom::types::{CoeDetails, Pdo, SiiSyncManager, SyncManagerType},
    error::{Error, MailboxError},
    fmt,
    mailbox::MailboxGeometry,
    pdu::Pdu,
    register::RegisterAddress,
    subdevice_config::{SmConfig, SubDeviceConfigData},
    subdevice_state::SubDeviceState,
    sync_manager_channel::{Direction, SyncManagerChannel},
};
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireWriteSized};
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Outcome of one AL state FSM step.
pub(crate) enum AlStep {
    /// Enqueue this PDU and call [`AlStateFsm::advance`] with the completed response.
    Send(Pdu),
    /// The SubDevice reached the requested state.
    Done,
}

#[derive(Copy, Clone)]
enum AlState {
    /// AL control write in flight.
    Write,
    /// AL status poll in flight.
    Poll,
    /// AL status code read in flight after a refusal.
    ReadCode { refused_state: SubDeviceState },
    /// Acknowledge write in flight; terminates in failure.
    Acknowledge { code: AlStatusCode },
}

/// Walk a single AL state transition: write the request to `0x0120`, poll `0x0130`, and on
/// refusal surface the code from `0x0134` after acknowledging it.
pub(crate) struct AlStateFsm {
    station: u16,
    target: SubDeviceState,
    state: AlState,
    deadline: Instant,
}

impl AlStateFsm {
    pub(crate) fn request(
        station: u16,
        target: SubDeviceState,
        deadline: Instant,
    ) -> (Self, Pdu) {
        let pdu = Pdu::write(
            Command::fpwr(station, RegisterAddress::AlControl.into()),
            AlControl::new(target).pack().to_vec(),
        );

        (
            Self {
                station,
                target,
                state: AlState::Write,
                deadline,
            },
            pdu,
        )
    }

    fn poll_pdu(&self) -> Pdu {
        Pdu::read(Command::fprd(self.station, RegisterAddress::AlStatus.into()), 2)
    }

    pub(crate) fn advance(&mut self, response: Pdu, now: Instant) -> Result<AlStep, Error> {
        match self.state {
            AlState::Write => {
                response.check_wkc(1)?;

                self.state = AlState::Poll;

                Ok(AlStep::Send(self.poll_pdu()))
            }
            AlState::Poll => {
                response.check_wkc(1)?;

                let status = AlStatus::unpack_from_slice(response.data())?;

                if status.error {
                    fmt::warn!(
                        "SubDevice {:#06x} refused state change to {}",
                        self.station,
                        self.target
                    );

                    self.state = AlState::ReadCode {
                        refused_state: status.state,
                    };

                    return Ok(AlStep::Send(Pdu::read(
                        Command::fprd(self.station, RegisterAddress::AlStatusCode.into()),
                        2,
                    )));
                }

                if status.state == self.target {
                    return Ok(AlStep::Done);
                }

                if now > self.deadline {
                    fmt::warn!(
                        "SubDevice {:#06x} did not reach {} in time (currently {})",
                        self.station,
                        self.target,
                        status.state
                    );

                    return Err(Error::Timeout);
                }

                Ok(AlStep::Send(self.poll_pdu()))
            }
            AlState::ReadCode { refused_state } => {
                response.check_wkc(1)?;

                let code = AlStatusCode::unpack_from_slice(response.data())?;

                fmt::error!(
                    "SubDevice {:#06x} AL status code: {}",
                    self.station,
                    code
                );

                self.state = AlState::Acknowledge { code };

                // Re-request the state the SubDevice fell back to, with the acknowledge flag,
                // to clear the error indication
                Ok(AlStep::Send(Pdu::write(
                    Command::fpwr(self.station, RegisterAddress::AlControl.into()),
                    AlControl::acknowledge(refused_state).pack().to_vec(),
                )))
            }
            AlState::Acknowledge { code } => {
                response.check_wkc(1)?;

                Err(Error::StateTransition(code))
            }
        }
    }
}

/// Everything the configuration FSM needs, captured by value so the walk is self contained.
#[derive(Debug, Clone)]
pub(crate) struct ConfigJob {
    pub station: u16,
    pub target_state: SubDeviceState,
    pub fmmu_count: u8,
    pub sync_manager_count: u8,
    pub mailbox: Option<MailboxGeometry>,
    pub coe_details: CoeDetails,
    pub sii_sync_managers: Vec<SiiSyncManager>,
    pub sii_pdos: Vec<Pdo>,
    pub config: SubDeviceConfigData,
    /// Logical base address per domain index, for FMMU register images.
    pub domain_bases: Vec<u32>,
    pub mailbox_counter: u8,
    /// DC cyclic operation start time, ns of the reference clock.
    pub dc_start_time: u64,
    /// Budget for each AL state transition.
    pub state_timeout: Duration,
    /// Budget for each mailbox response.
    pub mailbox_timeout: Duration,
}

/// Outcome of one configuration FSM step.
pub(crate) enum ConfigStep {
    /// Enqueue this PDU and call [`ConfigFsm::advance`] with the completed response.
    Send(Pdu),
    /// The walk finished; the SubDevice is in the target state.
    Done {
        /// Mailbox counter to store back on the SubDevice.
        mailbox_counter: u8,
    },
}

/// One `0x1c1x` (assignment) or `0x1600`/`0x1a00` (mapping) rewrite via the documented
/// procedure: zero subindex 0, write subindices 1..=N, write subindex 0 = N.
struct ObjectArrayJob {
    object: u16,
    /// Pre-packed little-endian values for subindices 1..=N.
    values: Vec<Vec<u8>>,
    /// Skip the rewrite when the current subindex 0 count already matches.
    verify_first: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ArrayPhase {
    VerifyCount,
    ZeroCount,
    WriteValue(usize),
    WriteCount,
}

enum State {
    EnterInit(AlStateFsm),
    InitWrites,
    EnterPreop(AlStateFsm),
    StartupSdos(SdoFsm),
    ObjectArrays { fsm: SdoFsm, phase: ArrayPhase },
    PdWrites,
    EnterSafeop(AlStateFsm),
    EnterOp(AlStateFsm),
}

/// The INIT → PREOP → SAFEOP → OP configuration walk for one SubDevice.
///
/// Any `FPxx` answered with a working counter other than 1 aborts the walk; the master FSM
/// latches the SubDevice's error flag and retries after its next scan pass.
pub(crate) struct ConfigFsm {
    job: ConfigJob,
    state: State,
    /// Register writes applied in INIT.
    init_writes: VecDeque<(u16, Vec<u8>)>,
    /// Startup SDOs remaining.
    sdos: VecDeque<crate::subdevice_config::SdoConfig>,
    /// CoE object array rewrites remaining.
    arrays: VecDeque<ObjectArrayJob>,
    /// Register writes applied before SAFEOP.
    pd_writes: VecDeque<(u16, Vec<u8>)>,
    mailbox_counter: u8,
}

impl ConfigFsm {
    /// Build the walk and return the first PDU (the INIT state request).
    pub(crate) fn start(job: ConfigJob, now: Instant) -> (Self, Pdu) {
        let init_writes = Self::build_init_writes(&job);
        let pd_writes = Self::build_pd_writes(&job);
        let arrays = Self::build_object_arrays(&job);
        let sdos = job.config.startup_sdos.iter().cloned().collect();

        let (al, pdu) = AlStateFsm::request(
            job.station,
            SubDeviceState::Init,
            now + job.state_timeout,
        );

        let mailbox_counter = job.mailbox_counter;

        (
            Self {
                job,
                state: State::EnterInit(al),
                init_writes,
                sdos,
                arrays,
                pd_writes,
                mailbox_counter,
            },
            pdu,
        )
    }

    /// Register writes performed in INIT: clear FMMUs, clear SMs, watchdog setup, mailbox SMs.
    fn build_init_writes(job: &ConfigJob) -> VecDeque<(u16, Vec<u8>)> {
        let mut writes = VecDeque::new();

        if job.fmmu_count > 0 {
            writes.push_back((
                RegisterAddress::fmmu(0),
                vec![
                    0u8;
                    usize::from(job.fmmu_count.min(16)) * usize::from(RegisterAddress::FMMU_STRIDE)
                ],
            ));
        }

        if job.sync_manager_count > 0 {
            writes.push_back((
                RegisterAddress::sync_manager(0),
                vec![
                    0u8;
                    usize::from(job.sync_manager_count.min(16))
                        * usize::from(RegisterAddress::SYNC_MANAGER_STRIDE)
                ],
            ));
        }

        if let Some(watchdog) = job.config.watchdog {
            writes.push_back((
                RegisterAddress::WatchdogDivider.into(),
                watchdog.divider.to_le_bytes().to_vec(),
            ));
            writes.push_back((
                RegisterAddress::SyncManagerWatchdog.into(),
                watchdog.sm_interval.to_le_bytes().to_vec(),
            ));
        }

        // Mailbox SMs must exist before PREOP is requested. Prefer the SII sync manager
        // category; synthesize from the mailbox geometry words when it is absent.
        if let Some(geometry) = job.mailbox {
            let from_category = job
                .sii_sync_managers
                .iter()
                .enumerate()
                .filter(|(_, sm)| {
                    matches!(
                        sm.usage_type,
                        SyncManagerType::MailboxOut | SyncManagerType::MailboxIn
                    )
                })
                .map(|(index, sm)| {
                    let direction = if sm.usage_type == SyncManagerType::MailboxOut {
                        Direction::MainDeviceWrite
                    } else {
                        Direction::MainDeviceRead
                    };

                    (
                        index as u8,
                        SyncManagerChannel::mailbox(sm.start_address, sm.length, direction),
                    )
                })
                .collect::<Vec<_>>();

            if from_category.is_empty() {
                writes.push_back((
                    RegisterAddress::sync_manager(0),
                    SyncManagerChannel::mailbox(
                        geometry.rx_offset,
                        geometry.rx_size,
                        Direction::MainDeviceWrite,
                    )
                    .pack()
                    .to_vec(),
                ));
                writes.push_back((
                    RegisterAddress::sync_manager(1),
                    SyncManagerChannel::mailbox(
                        geometry.tx_offset,
                        geometry.tx_size,
                        Direction::MainDeviceRead,
                    )
                    .pack()
                    .to_vec(),
                ));
            } else {
                for (index, channel) in from_category {
                    writes.push_back((
                        RegisterAddress::sync_manager(index),
                        channel.pack().to_vec(),
                    ));
                }
            }
        }

        writes
    }

    /// Data size in bytes of one sync manager, from the configured mapping or the SII.
    fn sm_data_length(job: &ConfigJob, sm: &SmConfig) -> u16 {
        let assigned: Vec<u16> = match &sm.pdo_assignment {
            Some(pdos) => pdos.clone(),
            None => job
                .sii_pdos
                .iter()
                .filter(|pdo| pdo.descriptor.sync_manager == sm.index)
                .map(|pdo| pdo.descriptor.index)
                .collect(),
        };

        assigned
            .iter()
            .map(|pdo_index| {
                let bits = job
                    .config
                    .mapping_for(*pdo_index)
                    .map(|mapping| {
                        mapping
                            .entries
                            .iter()
                            .map(|entry| u16::from(entry.bit_length))
                            .sum::<u16>()
                    })
                    .or_else(|| {
                        job.sii_pdos
                            .iter()
                            .find(|pdo| pdo.descriptor.index == *pdo_index)
                            .map(Pdo::bit_len)
                    })
                    .unwrap_or(0);

                bits.div_ceil(8)
            })
            .sum()
    }

    /// Register writes performed after PDO configuration: process data SMs, FMMUs, DC.
    fn build_pd_writes(job: &ConfigJob) -> VecDeque<(u16, Vec<u8>)> {
        let mut writes = VecDeque::new();

        for sm in &job.config.sync_managers {
            let Some(sii_sm) = job.sii_sync_managers.get(usize::from(sm.index)) else {
                fmt::warn!(
                    "SubDevice {:#06x} has no SII descriptor for SM{}; skipping",
                    job.station,
                    sm.index
                );

                continue;
            };

            let length = Self::sm_data_length(job, sm);

            let watchdog_enable = match sm.watchdog {
                crate::subdevice_config::SmWatchdog::Default => sii_sm.control.watchdog_enable,
                crate::subdevice_config::SmWatchdog::Enable => true,
                crate::subdevice_config::SmWatchdog::Disable => false,
            };

            let channel = SyncManagerChannel::process_data(
                sii_sm.start_address,
                length,
                sm.direction.channel_direction(),
                watchdog_enable,
            );

            writes.push_back((
                RegisterAddress::sync_manager(sm.index),
                channel.pack().to_vec(),
            ));
        }

        for (position, allocation) in job.config.fmmus.iter().enumerate() {
            let Some(base) = job.domain_bases.get(allocation.domain).copied() else {
                continue;
            };

            writes.push_back((
                RegisterAddress::fmmu(position as u8),
                allocation.register_image(base).pack().to_vec(),
            ));
        }

        if let Some(dc) = job.config.dc {
            let mut cycle = [0u8; 8];
            cycle[0..4].copy_from_slice(&dc.sync0_cycle.to_le_bytes());
            cycle[4..8].copy_from_slice(&dc.sync1_cycle.to_le_bytes());

            writes.push_back((RegisterAddress::DcSync0CycleTime.into(), cycle.to_vec()));

            let start = job
                .dc_start_time
                .wrapping_add(dc.sync0_shift.unsigned_abs() as u64);

            writes.push_back((
                RegisterAddress::DcSyncStartTime.into(),
                start.to_le_bytes().to_vec(),
            ));

            writes.push_back((
                RegisterAddress::DcSyncActivation.into(),
                dc.assign_activate.to_le_bytes().to_vec(),
            ));
        }

        writes
    }

    /// PDO assignment and mapping rewrites, gated on the SII CoE details.
    fn build_object_arrays(job: &ConfigJob) -> VecDeque<ObjectArrayJob> {
        let mut arrays = VecDeque::new();

        if job.coe_details.contains(CoeDetails::ENABLE_PDO_ASSIGN) {
            for sm in &job.config.sync_managers {
                let Some(pdos) = &sm.pdo_assignment else {
                    continue;
                };

                arrays.push_back(ObjectArrayJob {
                    object: 0x1c10 + u16::from(sm.index),
                    values: pdos.iter().map(|pdo| pdo.to_le_bytes().to_vec()).collect(),
                    verify_first: true,
                });
            }
        }

        if job.coe_details.contains(CoeDetails::ENABLE_PDO_CONFIG) {
            for mapping in &job.config.pdo_mappings {
                arrays.push_back(ObjectArrayJob {
                    object: mapping.pdo_index,
                    values: mapping
                        .entries
                        .iter()
                        .map(|entry| entry.mapping_value().to_le_bytes().to_vec())
                        .collect(),
                    verify_first: false,
                });
            }
        }

        arrays
    }

    fn write_pdu(&self, register: u16, data: Vec<u8>) -> Pdu {
        Pdu::write(Command::fpwr(self.job.station, register), data)
    }

    /// Pop and send the next queued register write, if any remain.
    fn drain_writes(
        &mut self,
        queue: fn(&mut Self) -> &mut VecDeque<(u16, Vec<u8>)>,
    ) -> Option<ConfigStep> {
        queue(self)
            .pop_front()
            .map(|(register, data)| ConfigStep::Send(self.write_pdu(register, data)))
    }

    fn mailbox_geometry(&self) -> Result<MailboxGeometry, Error> {
        self.job
            .mailbox
            .ok_or(Error::Mailbox(MailboxError::NoMailbox))
    }

    /// Start the next startup SDO download, the next object array job, or fall through to the
    /// process data writes.
    fn next_coe_action(&mut self, now: Instant) -> Result<ConfigStep, Error> {
        if let Some(sdo) = self.sdos.pop_front() {
            let (fsm, pdu) = SdoFsm::download(
                self.job.station,
                self.mailbox_geometry()?,
                self.mailbox_counter,
                sdo.index,
                sdo.sub_index,
                sdo.data,
                now + self.job.mailbox_timeout,
            )?;

            self.state = State::StartupSdos(fsm);

            return Ok(ConfigStep::Send(pdu));
        }

        if let Some(array) = self.arrays.front() {
            let (fsm, pdu, phase) = if array.verify_first {
                let (fsm, pdu) = SdoFsm::upload(
                    self.job.station,
                    self.mailbox_geometry()?,
                    self.mailbox_counter,
                    array.object,
                    0,
                    now + self.job.mailbox_timeout,
                )?;

                (fsm, pdu, ArrayPhase::VerifyCount)
            } else {
                let (fsm, pdu) = SdoFsm::download(
                    self.job.station,
                    self.mailbox_geometry()?,
                    self.mailbox_counter,
                    array.object,
                    0,
                    vec![0u8],
                    now + self.job.mailbox_timeout,
                )?;

                (fsm, pdu, ArrayPhase::ZeroCount)
            };

            self.state = State::ObjectArrays { fsm, phase };

            return Ok(ConfigStep::Send(pdu));
        }

        self.enter_pd_writes(now)
    }

    fn enter_pd_writes(&mut self, now: Instant) -> Result<ConfigStep, Error> {
        self.state = State::PdWrites;

        match self.drain_writes(|fsm| &mut fsm.pd_writes) {
            Some(step) => Ok(step),
            None => self.enter_safeop(now),
        }
    }

    fn enter_safeop(&mut self, now: Instant) -> Result<ConfigStep, Error> {
        let (al, pdu) = AlStateFsm::request(
            self.job.station,
            SubDeviceState::SafeOp,
            now + self.job.state_timeout,
        );

        self.state = State::EnterSafeop(al);

        Ok(ConfigStep::Send(pdu))
    }

    fn finish(&self) -> ConfigStep {
        ConfigStep::Done {
            mailbox_counter: self.mailbox_counter,
        }
    }

    /// Feed a completed PDU in, get the next one (or completion) out.
    pub(crate) fn advance(&mut self, response: Pdu, now: Instant) -> Result<ConfigStep, Error> {
        match &mut self.state {
            State::EnterInit(al) => match al.advance(response, now)? {
                AlStep::Send(pdu) => Ok(ConfigStep::Send(pdu)),
                AlStep::Done => {
                    self.state = State::InitWrites;

                    match self.drain_writes(|fsm| &mut fsm.init_writes) {
                        Some(step) => Ok(step),
                        None => self.enter_preop(now),
                    }
                }
            },
            State::InitWrites => {
                response.check_wkc(1)?;

                match self.drain_writes(|fsm| &mut fsm.init_writes) {
                    Some(step) => Ok(step),
                    None => self.enter_preop(now),
                }
            }
            State::EnterPreop(al) => match al.advance(response, now)? {
                AlStep::Send(pdu) => Ok(ConfigStep::Send(pdu)),
                AlStep::Done => {
                    if self.job.target_state == SubDeviceState::PreOp {
                        return Ok(self.finish());
                    }

                    self.next_coe_action(now)
                }
            },
            State::StartupSdos(fsm) => match fsm.advance(response, now)? {
                SdoStep::Send(pdu) => Ok(ConfigStep::Send(pdu)),
                SdoStep::Done(outcome) => {
                    self.mailbox_counter = fsm.counter();

                    match outcome {
                        SdoOutcome::DownloadOk => self.next_coe_action(now),
                        SdoOutcome::Aborted(code) => {
                            fmt::error!(
                                "Startup SDO write to {:#06x} aborted: {}",
                                self.job.station,
                                crate::coe::abort_code::CoeAbortCode::from(code)
                            );

                            Err(Error::Mailbox(MailboxError::Aborted {
                                code: crate::coe::abort_code::CoeAbortCode::from(code),
                                index: 0,
                                sub_index: 0,
                            }))
                        }
                        SdoOutcome::UploadOk(_) => Err(Error::Internal),
                    }
                }
            },
            State::ObjectArrays { fsm, phase } => match fsm.advance(response, now)? {
                SdoStep::Send(pdu) => Ok(ConfigStep::Send(pdu)),
                SdoStep::Done(outcome) => {
                    self.mailbox_counter = fsm.counter();

                    let current_phase = *phase;

                    let array = self.arrays.front().ok_or(Error::Internal)?;

                    match (current_phase, outcome) {
                        (ArrayPhase::VerifyCount, SdoOutcome::UploadOk(data)) => {
                            let current = data.first().copied().unwrap_or(0);

                            if usize::from(current) == array.values.len() {
                                // Assignment already matches; leave it alone
                                self.arrays.pop_front();

                                return self.next_coe_action(now);
                            }

                            self.array_download(ArrayPhase::ZeroCount, now)
                        }
                        (ArrayPhase::ZeroCount, SdoOutcome::DownloadOk) => {
                            if array.values.is_empty() {
                                self.array_download(ArrayPhase::WriteCount, now)
                            } else {
                                self.array_download(ArrayPhase::WriteValue(0), now)
                            }
                        }
                        (ArrayPhase::WriteValue(position), SdoOutcome::DownloadOk) => {
                            let next = position + 1;

                            if next < array.values.len() {
                                self.array_download(ArrayPhase::WriteValue(next), now)
                            } else {
                                self.array_download(ArrayPhase::WriteCount, now)
                            }
                        }
                        (ArrayPhase::WriteCount, SdoOutcome::DownloadOk) => {
                            self.arrays.pop_front();

                            self.next_coe_action(now)
                        }
                        (_, SdoOutcome::Aborted(code)) => {
                            fmt::error!(
                                "PDO configuration of {:#06x} object {:#06x} aborted: {}",
                                self.job.station,
                                array.object,
                                crate::coe::abort_code::CoeAbortCode::from(code)
                            );

                            Err(Error::Mailbox(MailboxError::Aborted {
                                code: crate::coe::abort_code::CoeAbortCode::from(code),
                                index: array.object,
                                sub_index: 0,
                            }))
                        }
                        _ => Err(Error::Internal),
                    }
                }
            },
            State::PdWrites => {
                response.check_wkc(1)?;

                match self.drain_writes(|fsm| &mut fsm.pd_writes) {
                    Some(step) => Ok(step),
                    None => self.enter_safeop(now),
                }
            }
            State::EnterSafeop(al) => match al.advance(response, now)? {
                AlStep::Send(pdu) => Ok(ConfigStep::Send(pdu)),
                AlStep::Done => {
                    if self.job.target_state != SubDeviceState::Op {
                        return Ok(self.finish());
                    }

                    let (al, pdu) = AlStateFsm::request(
                        self.job.station,
                        SubDeviceState::Op,
                        now + self.job.state_timeout,
                    );

                    self.state = State::EnterOp(al);

                    Ok(ConfigStep::Send(pdu))
                }
            },
            State::EnterOp(al) => match al.advance(response, now)? {
                AlStep::Send(pdu) => Ok(ConfigStep::Send(pdu)),
                AlStep::Done => Ok(self.finish()),
            },
        }
    }

    fn enter_preop(&mut self, now: Instant) -> Result<ConfigStep, Error> {
        let (al, pdu) = AlStateFsm::request(
            self.job.station,
            SubDeviceState::PreOp,
            now + self.job.state_timeout,
        );

        self.state = State::EnterPreop(al);

        Ok(ConfigStep::Send(pdu))
    }

    /// Issue the download belonging to `phase` of the current object array job.
    fn array_download(&mut self, phase: ArrayPhase, now: Instant) -> Result<ConfigStep, Error> {
        let array = self.arrays.front().ok_or(Error::Internal)?;

        let (sub_index, data) = match &phase {
            // Subindex 0 is a u8 count
            ArrayPhase::ZeroCount => (0u8, vec![0u8]),
            ArrayPhase::WriteValue(position) => {
                ((position + 1) as u8, array.values[*position].clone())
            }
            ArrayPhase::WriteCount => (0u8, vec![array.values.len() as u8]),
            ArrayPhase::VerifyCount => return Err(Error::Internal),
        };

        let object = array.object;

        let (fsm, pdu) = SdoFsm::download(
            self.job.station,
            self.mailbox_geometry()?,
            self.mailbox_counter,
            object,
            sub_index,
            data,
            now + self.job.mailbox_timeout,
        )?;

        self.state = State::ObjectArrays { fsm, phase };

        Ok(ConfigStep::Send(pdu))
    }
}
