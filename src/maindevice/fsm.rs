//! The top level master FSM.
//!
//! Driven once per `send` cycle, it enqueues at most one PDU per cycle to make progress on
//! topology detection, scanning, configuration, distributed clocks and user requests. Cyclic
//! process data shares the same queue and frames but is driven by the application through its
//! domains.

use crate::{
    al_control::AlStatus,
    coe::{
        fsm::{SdoFsm, SdoOutcome, SdoStep},
        info::{InfoStep, SdoInfoFsm},
    },
    command::Command,
    dc::{DcFsm, DcPort, DcStep, DcSystem},
    domain::DomainData,
    eeprom::{SII_ALIAS_WORD, SII_CHECKSUM_WORD, sii_checksum},
    error::{Error, MailboxError},
    fmt,
    foe::{FoeFsm, FoeOutcome, FoeStep},
    pdu::{Pdu, queue::{PduQueue, PduToken}},
    register::RegisterAddress,
    request::{RequestArena, RequestKind, RequestResult, RequestState},
    sii::{SiiAddressing, SiiFsm, SiiStep},
    subdevice::{
        SubDevice,
        config::{ConfigFsm, ConfigJob, ConfigStep},
        scan::{ScanFsm, ScanStep},
    },
    subdevice_state::SubDeviceState,
};
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Timing knobs the FSM needs, lifted out of [`MainDeviceConfig`](crate::MainDeviceConfig).
#[derive(Debug, Clone, Copy)]
pub(crate) struct FsmTimeouts {
    pub state_transition: Duration,
    pub mailbox_response: Duration,
    /// Whole-transfer budget for one SDO upload/download.
    pub sdo_transfer: Duration,
    /// Whole-transfer budget for one FoE read/write.
    pub foe_transfer: Duration,
    /// Whole-fetch budget for one dictionary walk.
    pub dictionary_fetch: Duration,
    /// Idle time in PREOP before the SDO dictionary is fetched.
    pub dictionary_idle: Duration,
}

/// Everything the FSM may touch, borrowed from the master state for one step.
pub(crate) struct FsmContext<'a> {
    pub queue: &'a mut PduQueue,
    pub subdevices: &'a mut Vec<SubDevice>,
    pub configs: &'a mut [crate::subdevice_config::SubDeviceConfigData],
    pub domains: &'a [DomainData],
    pub requests: &'a mut RequestArena,
    pub dc: &'a mut DcSystem,
    pub timeouts: FsmTimeouts,
    pub activated: bool,
    pub now: Instant,
}

/// The transfer FSM servicing the current user request.
enum RequestFsm {
    Sdo(SdoFsm),
    Dictionary(SdoInfoFsm),
    Foe(FoeFsm),
    Sii {
        fsm: SiiFsm,
        /// Further words to write after the current one, e.g. the checksum after an alias.
        remaining: VecDeque<(u16, u16)>,
    },
    Register,
    /// The `R`, `E`, `S` sequence; the byte most recently written.
    Reboot(u8),
}

enum State {
    /// Broadcast AL status read, the topology heartbeat.
    Broadcast,
    /// Scanning the SubDevice at this ring position.
    Scan { position: u16, fsm: ScanFsm },
    /// Round-robin per-SubDevice AL status read.
    ReadAlStatus { position: u16 },
    /// Bus-wide DC delay measurement and static sync.
    DcMeasure { fsm: DcFsm },
    /// Applying a configuration to one SubDevice.
    Configure { position: u16, fsm: ConfigFsm },
    /// Fetching the SDO dictionary of an idle PREOP SubDevice.
    Dictionary { position: u16, fsm: SdoInfoFsm },
    /// Servicing a user request.
    Request { id: u64, position: u16, fsm: RequestFsm },
    /// Cyclic DC drift compensation PDU in flight.
    DcDrift,
}

/// The master FSM proper. One [`poll`](MasterFsm::poll) call per cycle.
pub(crate) struct MasterFsm {
    state: State,
    /// Claim ticket of the PDU currently in flight, if any.
    token: Option<PduToken>,
    /// Responding SubDevice count from the last broadcast.
    slave_count: u16,
    /// A topology change was observed; the ring is rebuilt on the next pass.
    rescan_required: bool,
    /// Round-robin cursor for AL status reads.
    read_cursor: u16,
    /// Round-robin cursor for request servicing.
    request_cursor: u16,
}

impl MasterFsm {
    pub(crate) fn new() -> Self {
        Self {
            state: State::Broadcast,
            token: None,
            slave_count: 0,
            rescan_required: true,
            read_cursor: 0,
            request_cursor: 0,
        }
    }

    pub(crate) fn slave_count(&self) -> u16 {
        self.slave_count
    }

    /// Step the FSM: feed a completed PDU into the active sub-FSM or pick the next action.
    ///
    /// At most one PDU is submitted to the queue per call.
    pub(crate) fn poll(&mut self, ctx: &mut FsmContext<'_>) {
        // One PDU in flight at a time
        if let Some(token) = self.token {
            let Some(pdu) = ctx.queue.claim(token) else {
                return;
            };

            self.token = None;

            self.handle_completion(pdu, ctx);

            return;
        }

        self.choose_action(ctx);
    }

    fn submit(&mut self, pdu: Pdu, ctx: &mut FsmContext<'_>) {
        self.token = Some(ctx.queue.submit(pdu, ctx.now));
    }

    /// Latch a SubDevice's error flag and resume the heartbeat.
    fn fail_subdevice(&mut self, position: u16, error: &Error, ctx: &mut FsmContext<'_>) {
        fmt::warn!("SubDevice {} failed: {}", position, error);

        if let Some(slave) = ctx.subdevices.get_mut(usize::from(position)) {
            slave.error_flag = true;

            if let Error::StateTransition(code) = error {
                slave.al_status_code = Some(*code);
            }
        }

        self.state = State::Broadcast;
    }

    /// Feed the completed PDU into whatever is running.
    fn handle_completion(&mut self, pdu: Pdu, ctx: &mut FsmContext<'_>) {
        match core::mem::replace(&mut self.state, State::Broadcast) {
            State::Broadcast => self.on_broadcast(pdu, ctx),
            State::Scan { position, mut fsm } => match fsm.advance(pdu, ctx.now) {
                Ok(ScanStep::Send(next)) => {
                    self.state = State::Scan { position, fsm };
                    self.submit(next, ctx);
                }
                Ok(ScanStep::Done(slave)) => {
                    ctx.subdevices.push(*slave);

                    self.continue_scan(position + 1, ctx);
                }
                Err(e) => {
                    fmt::warn!("Scan of SubDevice {} failed: {}", position, e);

                    // Keep a placeholder so ring positions stay aligned
                    let mut placeholder = SubDevice::new(position);
                    placeholder.error_flag = true;

                    ctx.subdevices.push(placeholder);

                    self.continue_scan(position + 1, ctx);
                }
            },
            State::ReadAlStatus { position } => {
                self.on_al_status(position, pdu, ctx);
            }
            State::DcMeasure { mut fsm } => match fsm.advance(pdu, ctx.now) {
                Ok(DcStep::Send(next)) => {
                    self.state = State::DcMeasure { fsm };
                    self.submit(next, ctx);
                }
                Ok(DcStep::Done {
                    measurements,
                    reference_time,
                }) => {
                    for (slave, measurement) in
                        ctx.subdevices.iter_mut().zip(measurements.iter())
                    {
                        slave.dc_receive_times = measurement.receive_times;
                        slave.propagation_delay = measurement.propagation_delay;
                    }

                    ctx.dc.reference_time = reference_time;
                    ctx.dc.synchronised = true;

                    fmt::info!("DC measurement complete");

                    self.state = State::Broadcast;
                }
                Err(e) => {
                    fmt::warn!("DC measurement failed: {}", e);

                    // Leave DC unsynchronised; it is retried after the next rescan
                    ctx.dc.synchronised = true;
                    ctx.dc.reference = None;

                    self.state = State::Broadcast;
                }
            },
            State::Configure { position, mut fsm } => match fsm.advance(pdu, ctx.now) {
                Ok(ConfigStep::Send(next)) => {
                    self.state = State::Configure { position, fsm };
                    self.submit(next, ctx);
                }
                Ok(ConfigStep::Done { mailbox_counter }) => {
                    if let Some(slave) = ctx.subdevices.get_mut(usize::from(position)) {
                        slave.state = slave.requested_state;
                        slave.mailbox_counter = mailbox_counter;
                        slave.al_status_code = None;

                        fmt::info!(
                            "SubDevice {} configured, now {}",
                            position,
                            slave.state
                        );
                    }

                    self.state = State::Broadcast;
                }
                Err(e) => self.fail_subdevice(position, &e, ctx),
            },
            State::Dictionary { position, mut fsm } => match fsm.advance(pdu, ctx.now) {
                Ok(InfoStep::Send(next)) => {
                    self.state = State::Dictionary { position, fsm };
                    self.submit(next, ctx);
                }
                Ok(InfoStep::Done(dictionary)) => {
                    if let Some(slave) = ctx.subdevices.get_mut(usize::from(position)) {
                        fmt::info!(
                            "SubDevice {} dictionary: {} objects",
                            position,
                            dictionary.objects.len()
                        );

                        slave.mailbox_counter = fsm.counter();
                        slave.dictionary = Some(dictionary);
                    }

                    self.state = State::Broadcast;
                }
                Err(e) => {
                    fmt::warn!(
                        "Dictionary fetch from SubDevice {} failed: {}",
                        position,
                        e
                    );

                    // Don't retry a device that can't answer; remember an empty dictionary
                    if let Some(slave) = ctx.subdevices.get_mut(usize::from(position)) {
                        slave.dictionary = Some(Default::default());
                    }

                    self.state = State::Broadcast;
                }
            },
            State::Request { id, position, fsm } => {
                self.on_request_progress(id, position, fsm, pdu, ctx);
            }
            State::DcDrift => {
                if pdu.check_wkc(self.slave_count).is_err() {
                    fmt::trace!("DC drift PDU incomplete");
                }

                self.state = State::Broadcast;
            }
        }
    }

    /// Handle a finished broadcast AL status read.
    fn on_broadcast(&mut self, pdu: Pdu, ctx: &mut FsmContext<'_>) {
        if pdu.check_received().is_err() {
            // No frame came back at all: link down or unterminated bus. Try again next cycle.
            return;
        }

        let responding = pdu.working_counter();

        if responding != self.slave_count || self.rescan_required {
            fmt::info!(
                "Topology change: {} SubDevices responding (previously {})",
                responding,
                self.slave_count
            );

            self.slave_count = responding;
            self.rescan_required = false;

            ctx.subdevices.clear();
            ctx.requests.drop_out_of_range(responding);
            ctx.dc.synchronised = false;
            ctx.dc.reference = None;

            if responding > 0 {
                self.continue_scan(0, ctx);
            }
        }
    }

    /// Start scanning `position`, or finish the scan pass.
    fn continue_scan(&mut self, position: u16, ctx: &mut FsmContext<'_>) {
        if position >= self.slave_count {
            fmt::info!("Bus scan complete: {} SubDevices", self.slave_count);

            self.pick_dc_reference(ctx);

            self.state = State::Broadcast;

            return;
        }

        let (fsm, pdu) = ScanFsm::start(position, ctx.timeouts.state_transition);

        self.state = State::Scan { position, fsm };
        self.submit(pdu, ctx);
    }

    fn pick_dc_reference(&mut self, ctx: &mut FsmContext<'_>) {
        ctx.dc.reference = ctx
            .subdevices
            .iter()
            .find(|slave| slave.has_dc() && !slave.error_flag)
            .map(|slave| slave.configured_address);
    }

    /// Handle a finished per-SubDevice AL status read.
    fn on_al_status(&mut self, position: u16, pdu: Pdu, ctx: &mut FsmContext<'_>) {
        match pdu
            .check_wkc(1)
            .and_then(|()| {
                use ethercrab_wire::EtherCrabWireRead;

                AlStatus::unpack_from_slice(pdu.data()).map_err(Error::from)
            }) {
            Ok(status) => {
                if let Some(slave) = ctx.subdevices.get_mut(usize::from(position)) {
                    if slave.state != status.state {
                        fmt::debug!(
                            "SubDevice {} changed state to {}",
                            position,
                            status.state
                        );
                    }

                    slave.state = status.state;
                }
            }
            Err(e) => {
                fmt::debug!("AL status read of SubDevice {} failed: {}", position, e);
            }
        }

        self.state = State::Broadcast;
    }

    /// Pick the next single action. Priority: heartbeat consistency first (scan), then DC,
    /// configuration, user requests, dictionary fetches, and finally the drift beat.
    fn choose_action(&mut self, ctx: &mut FsmContext<'_>) {
        // Scan is initiated from the broadcast handler; everything here assumes a stable ring
        if matches!(self.state, State::Broadcast) {
            // DC measurement once per (re)scan, before anything depends on it
            if ctx.dc.reference.is_some() && !ctx.dc.synchronised {
                let ports = ctx
                    .subdevices
                    .iter()
                    .map(|slave| DcPort {
                        station: slave.configured_address,
                        downstream_open: slave.dl_status.port_open(1),
                        supports_dc: slave.has_dc() && !slave.error_flag,
                    })
                    .collect::<Vec<_>>();

                if let Ok((fsm, pdu)) = DcFsm::start(ports, self.slave_count) {
                    self.state = State::DcMeasure { fsm };
                    self.submit(pdu, ctx);

                    return;
                }
            }

            // A SubDevice below its requested state gets reconfigured
            if let Some(position) = self.next_config_target(ctx) {
                self.start_configure(position, ctx);

                return;
            }

            // Oldest user request, round-robin across SubDevices
            if let Some(id) = ctx.requests.next_queued(self.request_cursor) {
                self.start_request(id, ctx);

                return;
            }

            // Idle-phase dictionary fetch
            if let Some(position) = self.next_dictionary_target(ctx) {
                self.start_dictionary(position, ctx);

                return;
            }

            // Cyclic drift compensation once everything else is quiet
            if ctx.activated && ctx.dc.synchronised {
                if let Some(pdu) = ctx.dc.drift_pdu() {
                    self.state = State::DcDrift;
                    self.submit(pdu, ctx);

                    return;
                }
            }

            // One pass of per-SubDevice status reads, then one broadcast heartbeat
            while self.read_cursor < self.slave_count {
                let position = self.read_cursor;

                self.read_cursor += 1;

                if let Some(slave) = ctx.subdevices.get(usize::from(position)) {
                    if !slave.error_flag {
                        let station = slave.configured_address;

                        self.state = State::ReadAlStatus { position };
                        self.submit(
                            Pdu::read(
                                Command::fprd(station, RegisterAddress::AlStatus.into()),
                                2,
                            ),
                            ctx,
                        );

                        return;
                    }
                }
            }

            self.read_cursor = 0;

            self.submit(
                Pdu::read(Command::brd(RegisterAddress::AlStatus.into()), 2),
                ctx,
            );
        }
    }

    /// The first SubDevice whose state lags its requested state.
    fn next_config_target(&self, ctx: &FsmContext<'_>) -> Option<u16> {
        ctx.subdevices
            .iter()
            .find(|slave| {
                !slave.error_flag
                    && slave.state != slave.requested_state
                    && slave.state != SubDeviceState::None
            })
            .map(|slave| slave.ring_position)
    }

    fn start_configure(&mut self, position: u16, ctx: &mut FsmContext<'_>) {
        let Some(slave) = ctx.subdevices.get(usize::from(position)) else {
            return;
        };

        let config = slave
            .config_index
            .and_then(|index| ctx.configs.get(index))
            .cloned()
            .unwrap_or_else(|| {
                crate::subdevice_config::SubDeviceConfigData::new(
                    slave.alias,
                    position,
                    slave.identity.vendor_id,
                    slave.identity.product_id,
                )
            });

        let sii_pdos = slave
            .sii
            .tx_pdos
            .iter()
            .chain(slave.sii.rx_pdos.iter())
            .cloned()
            .collect();

        let job = ConfigJob {
            station: slave.configured_address,
            target_state: slave.requested_state,
            fmmu_count: slave.base.usable_fmmus(),
            sync_manager_count: slave.base.usable_sync_managers(),
            mailbox: slave.mailbox,
            coe_details: slave
                .sii
                .general
                .as_ref()
                .map(|general| general.coe_details)
                .unwrap_or_default(),
            sii_sync_managers: slave.sii.sync_managers.clone(),
            sii_pdos,
            config,
            domain_bases: ctx.domains.iter().map(|domain| domain.base).collect(),
            mailbox_counter: slave.mailbox_counter,
            dc_start_time: ctx.dc.reference_time,
            state_timeout: ctx.timeouts.state_transition,
            mailbox_timeout: ctx.timeouts.mailbox_response,
        };

        let (fsm, pdu) = ConfigFsm::start(job, ctx.now);

        fmt::debug!(
            "Configuring SubDevice {} towards {}",
            position,
            ctx.subdevices[usize::from(position)].requested_state
        );

        self.state = State::Configure { position, fsm };
        self.submit(pdu, ctx);
    }

    /// The first CoE SubDevice whose dictionary is still unfetched after its idle budget.
    fn next_dictionary_target(&self, ctx: &FsmContext<'_>) -> Option<u16> {
        ctx.subdevices
            .iter()
            .find(|slave| {
                !slave.error_flag
                    && slave.has_coe()
                    && slave.dictionary.is_none()
                    && slave
                        .sii
                        .general
                        .as_ref()
                        .is_some_and(|general| {
                            general
                                .coe_details
                                .contains(crate::eeprom::types::CoeDetails::ENABLE_SDO_INFO)
                        })
                    && slave.preop_since.is_some_and(|since| {
                        ctx.now.saturating_duration_since(since) >= ctx.timeouts.dictionary_idle
                    })
            })
            .map(|slave| slave.ring_position)
    }

    fn start_dictionary(&mut self, position: u16, ctx: &mut FsmContext<'_>) {
        let Some(slave) = ctx.subdevices.get(usize::from(position)) else {
            return;
        };

        let Ok(geometry) = slave.mailbox_geometry() else {
            return;
        };

        match SdoInfoFsm::start(
            slave.configured_address,
            geometry,
            slave.mailbox_counter,
            ctx.now + ctx.timeouts.dictionary_fetch,
        ) {
            Ok((fsm, pdu)) => {
                self.state = State::Dictionary { position, fsm };
                self.submit(pdu, ctx);
            }
            Err(e) => {
                fmt::warn!("Cannot fetch dictionary of SubDevice {}: {}", position, e);
            }
        }
    }

    /// Spin up the transfer FSM for a queued request.
    fn start_request(&mut self, id: u64, ctx: &mut FsmContext<'_>) {
        let Some(slot) = ctx.requests.get(id) else {
            return;
        };

        let position = slot.position;
        let kind = slot.kind.clone();

        self.request_cursor = position;

        let Some(slave) = ctx.subdevices.get(usize::from(position)) else {
            ctx.requests.finish(
                id,
                Err(Error::NotFound {
                    item: crate::error::Item::SubDevice,
                    index: Some(usize::from(position)),
                }),
            );

            return;
        };

        if slave.error_flag {
            ctx.requests.finish(id, Err(Error::SubDeviceFailed));

            return;
        }

        if let Some(slot) = ctx.requests.get_mut(id) {
            slot.state = RequestState::Busy;
        }

        let station = slave.configured_address;
        let counter = slave.mailbox_counter;
        let sdo_deadline = ctx.now + ctx.timeouts.sdo_transfer;
        let foe_deadline = ctx.now + ctx.timeouts.foe_transfer;

        let started: Result<(RequestFsm, Pdu), Error> = match kind {
            RequestKind::SdoUpload { index, sub_index } => slave
                .mailbox_geometry()
                .and_then(|geometry| {
                    SdoFsm::upload(station, geometry, counter, index, sub_index, sdo_deadline)
                })
                .map(|(fsm, pdu)| (RequestFsm::Sdo(fsm), pdu)),
            RequestKind::SdoDownload {
                index,
                sub_index,
                data,
            } => slave
                .mailbox_geometry()
                .and_then(|geometry| {
                    SdoFsm::download(
                        station,
                        geometry,
                        counter,
                        index,
                        sub_index,
                        data,
                        sdo_deadline,
                    )
                })
                .map(|(fsm, pdu)| (RequestFsm::Sdo(fsm), pdu)),
            RequestKind::SdoDictionary => slave
                .mailbox_geometry()
                .and_then(|geometry| {
                    SdoInfoFsm::start(
                        station,
                        geometry,
                        counter,
                        ctx.now + ctx.timeouts.dictionary_fetch,
                    )
                })
                .map(|(fsm, pdu)| (RequestFsm::Dictionary(fsm), pdu)),
            RequestKind::FoeRead {
                file_name,
                password,
            } => {
                if !slave.has_foe() {
                    Err(Error::Mailbox(MailboxError::UnsupportedProtocol))
                } else {
                    slave
                        .mailbox_geometry()
                        .and_then(|geometry| {
                            FoeFsm::read(
                                station,
                                geometry,
                                counter,
                                &file_name,
                                password,
                                foe_deadline,
                            )
                        })
                        .map(|(fsm, pdu)| (RequestFsm::Foe(fsm), pdu))
                }
            }
            RequestKind::FoeWrite {
                file_name,
                password,
                data,
            } => {
                if !slave.has_foe() {
                    Err(Error::Mailbox(MailboxError::UnsupportedProtocol))
                } else {
                    slave
                        .mailbox_geometry()
                        .and_then(|geometry| {
                            FoeFsm::write(
                                station,
                                geometry,
                                counter,
                                &file_name,
                                password,
                                data,
                                foe_deadline,
                            )
                        })
                        .map(|(fsm, pdu)| (RequestFsm::Foe(fsm), pdu))
                }
            }
            RequestKind::RegisterRead { register, len } => Ok((
                RequestFsm::Register,
                Pdu::read(Command::fprd(station, register), len),
            )),
            RequestKind::RegisterWrite { register, data } => Ok((
                RequestFsm::Register,
                Pdu::write(Command::fpwr(station, register), data),
            )),
            RequestKind::SiiWrite {
                word_address,
                value,
            } => {
                let (fsm, pdu) =
                    SiiFsm::write(SiiAddressing::Configured(station), word_address, value);

                Ok((
                    RequestFsm::Sii {
                        fsm,
                        remaining: VecDeque::new(),
                    },
                    pdu,
                ))
            }
            RequestKind::WriteAlias { alias } => {
                // Recompute the configuration area checksum over the image with the new alias
                let mut config_area = [0u8; 16];

                let available = slave.eeprom.as_bytes().len().min(16);
                config_area[..available]
                    .copy_from_slice(&slave.eeprom.as_bytes()[..available]);

                config_area[8..10].copy_from_slice(&alias.to_le_bytes());

                let crc = sii_checksum(&config_area);

                // The upper byte of the checksum word is reserved and kept as read
                let checksum_word = u16::from(config_area[15]) << 8 | u16::from(crc);

                let (fsm, pdu) =
                    SiiFsm::write(SiiAddressing::Configured(station), SII_ALIAS_WORD, alias);

                Ok((
                    RequestFsm::Sii {
                        fsm,
                        remaining: VecDeque::from([(SII_CHECKSUM_WORD, checksum_word)]),
                    },
                    pdu,
                ))
            }
            RequestKind::Reboot => Ok((
                RequestFsm::Reboot(b'R'),
                Pdu::write(
                    Command::fpwr(station, RegisterAddress::EscReset.into()),
                    vec![b'R'],
                ),
            )),
        };

        match started {
            Ok((fsm, pdu)) => {
                self.state = State::Request { id, position, fsm };
                self.submit(pdu, ctx);
            }
            Err(e) => {
                ctx.requests.finish(id, Err(e));
            }
        }
    }

    /// Advance the transfer FSM behind a user request.
    fn on_request_progress(
        &mut self,
        id: u64,
        position: u16,
        fsm: RequestFsm,
        pdu: Pdu,
        ctx: &mut FsmContext<'_>,
    ) {
        let store_counter = |ctx: &mut FsmContext<'_>, counter: u8| {
            if let Some(slave) = ctx.subdevices.get_mut(usize::from(position)) {
                slave.mailbox_counter = counter;
            }
        };

        match fsm {
            RequestFsm::Sdo(mut sdo) => match sdo.advance(pdu, ctx.now) {
                Ok(SdoStep::Send(next)) => {
                    self.state = State::Request {
                        id,
                        position,
                        fsm: RequestFsm::Sdo(sdo),
                    };
                    self.submit(next, ctx);
                }
                Ok(SdoStep::Done(outcome)) => {
                    store_counter(ctx, sdo.counter());

                    let result = match outcome {
                        SdoOutcome::UploadOk(data) => Ok(RequestResult::Data(data)),
                        SdoOutcome::DownloadOk => Ok(RequestResult::Written),
                        SdoOutcome::Aborted(code) => Ok(RequestResult::SdoAborted(code)),
                    };

                    ctx.requests.finish(id, result);

                    self.state = State::Broadcast;
                }
                Err(e) => {
                    store_counter(ctx, sdo.counter());

                    ctx.requests.finish(id, Err(e));

                    self.state = State::Broadcast;
                }
            },
            RequestFsm::Dictionary(mut info) => match info.advance(pdu, ctx.now) {
                Ok(InfoStep::Send(next)) => {
                    self.state = State::Request {
                        id,
                        position,
                        fsm: RequestFsm::Dictionary(info),
                    };
                    self.submit(next, ctx);
                }
                Ok(InfoStep::Done(dictionary)) => {
                    store_counter(ctx, info.counter());

                    if let Some(slave) = ctx.subdevices.get_mut(usize::from(position)) {
                        slave.dictionary = Some(dictionary);
                    }

                    ctx.requests.finish(id, Ok(RequestResult::Written));

                    self.state = State::Broadcast;
                }
                Err(e) => {
                    store_counter(ctx, info.counter());

                    ctx.requests.finish(id, Err(e));

                    self.state = State::Broadcast;
                }
            },
            RequestFsm::Foe(mut foe) => match foe.advance(pdu, ctx.now) {
                Ok(FoeStep::Send(next)) => {
                    self.state = State::Request {
                        id,
                        position,
                        fsm: RequestFsm::Foe(foe),
                    };
                    self.submit(next, ctx);
                }
                Ok(FoeStep::Done(outcome)) => {
                    store_counter(ctx, foe.counter());

                    let result = match outcome {
                        FoeOutcome::ReadOk(data) => Ok(RequestResult::Data(data)),
                        FoeOutcome::WriteOk => Ok(RequestResult::Written),
                        FoeOutcome::Failed(error) => Ok(RequestResult::FoeFailed(error)),
                    };

                    ctx.requests.finish(id, result);

                    self.state = State::Broadcast;
                }
                Err(e) => {
                    store_counter(ctx, foe.counter());

                    ctx.requests.finish(id, Err(e));

                    self.state = State::Broadcast;
                }
            },
            RequestFsm::Sii { mut fsm, mut remaining } => match fsm.advance(pdu, ctx.now) {
                Ok(SiiStep::Send(next)) => {
                    self.state = State::Request {
                        id,
                        position,
                        fsm: RequestFsm::Sii { fsm, remaining },
                    };
                    self.submit(next, ctx);
                }
                Ok(SiiStep::DoneWrite) => {
                    if let Some((word_address, value)) = remaining.pop_front() {
                        let Some(station) = ctx
                            .subdevices
                            .get(usize::from(position))
                            .map(|slave| slave.configured_address)
                        else {
                            ctx.requests.finish(id, Err(Error::SubDeviceFailed));

                            return;
                        };

                        let (fsm, next) = SiiFsm::write(
                            SiiAddressing::Configured(station),
                            word_address,
                            value,
                        );

                        self.state = State::Request {
                            id,
                            position,
                            fsm: RequestFsm::Sii { fsm, remaining },
                        };
                        self.submit(next, ctx);

                        return;
                    }

                    // A changed alias is picked up on the next rescan; reflect it eagerly too
                    if let Some(slot) = ctx.requests.get(id) {
                        if let RequestKind::WriteAlias { alias } = slot.kind {
                            if let Some(slave) =
                                ctx.subdevices.get_mut(usize::from(position))
                            {
                                slave.alias = alias;
                            }
                        }
                    }

                    ctx.requests.finish(id, Ok(RequestResult::Written));

                    self.state = State::Broadcast;
                }
                Ok(SiiStep::DoneRead(_)) => {
                    ctx.requests.finish(id, Err(Error::Internal));

                    self.state = State::Broadcast;
                }
                Err(e) => {
                    ctx.requests.finish(id, Err(e));

                    self.state = State::Broadcast;
                }
            },
            RequestFsm::Register => {
                let result = pdu
                    .check_wkc(1)
                    .map(|()| match pdu.command() {
                        Command::Read(_) => RequestResult::Data(pdu.data().to_vec()),
                        _ => RequestResult::Written,
                    });

                ctx.requests.finish(id, result);

                self.state = State::Broadcast;
            }
            RequestFsm::Reboot(written) => match pdu.check_wkc(1) {
                Ok(()) => {
                    let next_byte = match written {
                        b'R' => Some(b'E'),
                        b'E' => Some(b'S'),
                        _ => None,
                    };

                    match next_byte {
                        Some(byte) => {
                            let Some(station) = ctx
                                .subdevices
                                .get(usize::from(position))
                                .map(|slave| slave.configured_address)
                            else {
                                ctx.requests.finish(id, Err(Error::SubDeviceFailed));

                                return;
                            };

                            self.state = State::Request {
                                id,
                                position,
                                fsm: RequestFsm::Reboot(byte),
                            };
                            self.submit(
                                Pdu::write(
                                    Command::fpwr(station, RegisterAddress::EscReset.into()),
                                    vec![byte],
                                ),
                                ctx,
                            );
                        }
                        None => {
                            // The device drops off the bus while resetting; force a rescan
                            self.rescan_required = true;

                            ctx.requests.finish(id, Ok(RequestResult::Written));

                            self.state = State::Broadcast;
                        }
                    }
                }
                Err(e) => {
                    ctx.requests.finish(id, Err(e));

                    self.state = State::Broadcast;
                }
            },
        }
    }
}
