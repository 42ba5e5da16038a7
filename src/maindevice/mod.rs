//! The MainDevice: the single initiator on the wire.
//!
//! Owns the PDU queue, the NIC binding, the SubDevice list, domains and pending requests. An
//! application thread drives `receive → process → queue → send` each cycle; before activation
//! an internal idle thread steps the same machinery so scanning and requests make progress
//! without an application cycle.

pub(crate) mod fsm;
pub(crate) mod stats;

pub use stats::MainDeviceStatus;

use crate::{
    coe::info::SdoDictionary,
    domain::{DomainData, DomainState},
    error::{Error, FoeError, Item, MailboxError},
    ethernet::{EthernetDevice, NetworkDevice},
    fmt,
    pdu::queue::PduQueue,
    request::{RequestArena, RequestKind, RequestResult, RequestState},
    subdevice::{SubDevice, SubDeviceInfo},
    subdevice_config::{
        DcConfig, PdoEntryDef, PdoMappingConfig, SdoConfig, SmConfig, SmDirection, SmWatchdog,
        SubDeviceConfigData, WatchdogConfig,
    },
    subdevice_state::SubDeviceState,
};
use fsm::{FsmContext, FsmTimeouts, MasterFsm};
use std::{
    ops::{Deref, DerefMut},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

/// Tunable timing behaviour of the MainDevice.
#[derive(Debug, Clone, Copy)]
pub struct MainDeviceConfig {
    /// Budget after which a queued or sent PDU is expired.
    pub pdu_timeout: Duration,
    /// Cycle interval of the internal idle thread.
    pub send_interval: Duration,
    /// Budget for one AL state transition.
    pub state_transition_timeout: Duration,
    /// Budget for one mailbox response.
    pub mailbox_response_timeout: Duration,
    /// Whole-transfer budget for one SDO upload/download.
    pub sdo_transfer_timeout: Duration,
    /// Whole-transfer budget for one FoE read/write.
    pub foe_transfer_timeout: Duration,
    /// Whole-fetch budget for one SDO dictionary walk.
    pub dictionary_fetch_timeout: Duration,
    /// Default deadline for blocking request wrappers.
    pub request_timeout: Duration,
    /// Idle time in PREOP before a SubDevice's SDO dictionary is fetched.
    pub dictionary_idle: Duration,
}

impl Default for MainDeviceConfig {
    fn default() -> Self {
        Self {
            pdu_timeout: Duration::from_millis(2),
            send_interval: Duration::from_millis(2),
            state_transition_timeout: Duration::from_secs(5),
            mailbox_response_timeout: Duration::from_secs(1),
            sdo_transfer_timeout: Duration::from_secs(10),
            foe_transfer_timeout: Duration::from_secs(60),
            dictionary_fetch_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            dictionary_idle: Duration::from_secs(5),
        }
    }
}

impl MainDeviceConfig {
    fn fsm_timeouts(&self) -> FsmTimeouts {
        FsmTimeouts {
            state_transition: self.state_transition_timeout,
            mailbox_response: self.mailbox_response_timeout,
            sdo_transfer: self.sdo_transfer_timeout,
            foe_transfer: self.foe_transfer_timeout,
            dictionary_fetch: self.dictionary_fetch_timeout,
            dictionary_idle: self.dictionary_idle,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Phase {
    /// The idle thread drives the cycle; no process data.
    Idle,
    /// The application drives the cycle; the idle thread is parked.
    Operation,
}

/// Everything behind the master mutex.
struct MasterState {
    device: NetworkDevice,
    queue: PduQueue,
    subdevices: Vec<SubDevice>,
    configs: Vec<SubDeviceConfigData>,
    domains: Vec<DomainData>,
    requests: RequestArena,
    fsm: MasterFsm,
    phase: Phase,
    /// Cleared to stop the idle thread.
    running: bool,
    dc: crate::dc::DcSystem,
    stats: stats::Stats,
    frame_buf: Vec<u8>,
}

impl MasterState {
    /// Drain the NIC and expire stale PDUs.
    fn receive(&mut self, now: Instant) -> Result<(), Error> {
        let MasterState { device, queue, .. } = self;

        device.poll_receive(now, |payload| queue.on_frame_received(payload, now))?;

        queue.tick(now);

        self.stats.maybe_flush(
            now,
            self.queue.counters(),
            self.device.stats(),
            self.device.link_up(),
        );

        Ok(())
    }

    /// Step the master FSM once and flush the queue to the wire.
    fn send(&mut self, timeouts: FsmTimeouts, now: Instant) -> Result<(), Error> {
        {
            let mut ctx = FsmContext {
                queue: &mut self.queue,
                subdevices: &mut self.subdevices,
                configs: &mut self.configs,
                domains: &self.domains,
                requests: &mut self.requests,
                dc: &mut self.dc,
                timeouts,
                activated: self.phase == Phase::Operation,
                now,
            };

            self.fsm.poll(&mut ctx);
        }

        let MasterState {
            device,
            queue,
            frame_buf,
            ..
        } = self;

        queue.send_queued(now, frame_buf, |frame| device.send_payload(frame, now))?;

        Ok(())
    }

    /// Ring index of the SubDevice selected by an (alias, position) pair.
    fn resolve_position(&self, alias: u16, position: u16) -> Option<usize> {
        let index = if alias == 0 {
            usize::from(position)
        } else {
            self.subdevices
                .iter()
                .position(|slave| slave.alias == alias)?
                + usize::from(position)
        };

        (index < self.subdevices.len()).then_some(index)
    }

    fn subdevice(&self, position: u16) -> Result<&SubDevice, Error> {
        self.subdevices
            .get(usize::from(position))
            .ok_or(Error::NotFound {
                item: Item::SubDevice,
                index: Some(usize::from(position)),
            })
    }
}

struct Inner {
    config: MainDeviceConfig,
    state: Mutex<MasterState>,
    cond: Condvar,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, MasterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A cyclic EtherCAT MainDevice.
///
/// Dropping the MainDevice stops the idle thread.
pub struct MainDevice {
    inner: Arc<Inner>,
    idle: Option<thread::JoinHandle<()>>,
}

impl MainDevice {
    /// Bind a MainDevice to a NIC abstraction.
    pub fn new(device: Box<dyn EthernetDevice>, config: MainDeviceConfig) -> Self {
        let state = MasterState {
            device: NetworkDevice::new(device),
            queue: PduQueue::new(config.pdu_timeout),
            subdevices: Vec::new(),
            configs: Vec::new(),
            domains: Vec::new(),
            requests: RequestArena::default(),
            fsm: MasterFsm::new(),
            phase: Phase::Idle,
            running: true,
            dc: crate::dc::DcSystem::default(),
            stats: stats::Stats::default(),
            frame_buf: vec![0u8; crate::pdu::frame::MAX_ETHERCAT_PAYLOAD],
        };

        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(state),
                cond: Condvar::new(),
            }),
            idle: None,
        }
    }

    /// Spawn the idle thread. It cycles the master until activation, scanning the bus and
    /// servicing requests, and resumes after deactivation.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.idle.is_some() {
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);

        let handle = thread::Builder::new()
            .name("ecat-idle".into())
            .spawn(move || {
                loop {
                    {
                        let mut state = inner.lock();

                        if !state.running {
                            break;
                        }

                        if state.phase == Phase::Idle {
                            let now = Instant::now();

                            let timeouts = inner.config.fsm_timeouts();

                            if let Err(e) = state
                                .receive(now)
                                .and_then(|()| state.send(timeouts, now))
                            {
                                fmt::warn!("Idle cycle failed: {}", e);
                            }
                        }
                    }

                    inner.cond.notify_all();

                    thread::sleep(inner.config.send_interval);
                }
            })
            .map_err(|_| Error::Internal)?;

        self.idle = Some(handle);

        Ok(())
    }

    /// Drain received frames from the NIC and dispatch them onto their PDUs.
    ///
    /// First half of the application's cyclic contract.
    pub fn receive(&self) -> Result<(), Error> {
        let mut state = self.inner.lock();

        let result = state.receive(Instant::now());

        drop(state);

        self.inner.cond.notify_all();

        result
    }

    /// Give the master FSM its cycle slot and push all queued PDUs out as frames.
    ///
    /// Second half of the application's cyclic contract.
    pub fn send(&self) -> Result<(), Error> {
        let mut state = self.inner.lock();

        let result = state.send(self.inner.config.fsm_timeouts(), Instant::now());

        drop(state);

        self.inner.cond.notify_all();

        result
    }

    /// Create (or fetch) the configuration handle for the SubDevice selected by
    /// `(alias, position)`, expecting the given identity.
    pub fn subdevice_config(
        &self,
        alias: u16,
        position: u16,
        vendor_id: u32,
        product_id: u32,
    ) -> Result<SubDeviceConfig, Error> {
        let mut state = self.inner.lock();

        if state.phase != Phase::Idle {
            return Err(Error::InvalidPhase);
        }

        let index = match state
            .configs
            .iter()
            .position(|config| config.alias == alias && config.position == position)
        {
            Some(index) => index,
            None => {
                state
                    .configs
                    .push(SubDeviceConfigData::new(alias, position, vendor_id, product_id));

                state.configs.len() - 1
            }
        };

        Ok(SubDeviceConfig {
            inner: Arc::clone(&self.inner),
            index,
        })
    }

    /// Create a new process data domain.
    pub fn domain(&self) -> Result<Domain, Error> {
        let mut state = self.inner.lock();

        if state.phase != Phase::Idle {
            return Err(Error::InvalidPhase);
        }

        state.domains.push(DomainData::default());

        Ok(Domain {
            inner: Arc::clone(&self.inner),
            index: state.domains.len() - 1,
        })
    }

    /// Finish configuration: allocate domain memory, bind configurations to their SubDevices
    /// and hand the cycle to the application.
    ///
    /// The actual SubDevice configuration walks run lazily through the master FSM during the
    /// following cycles; domains report incomplete working counters until their SubDevices
    /// reach OP.
    pub fn activate(&self) -> Result<(), Error> {
        let mut state = self.inner.lock();

        if state.phase != Phase::Idle {
            return Err(Error::InvalidPhase);
        }

        // Allocate the logical address space: domains pack contiguously from zero
        let mut base = 0u32;

        for domain in &mut state.domains {
            domain.finish(base);

            base += domain.size as u32;
        }

        // Bind configurations to the SubDevices they select
        for index in 0..state.configs.len() {
            let config = state.configs[index].clone();

            let Some(slave_index) = state.resolve_position(config.alias, config.position) else {
                fmt::warn!(
                    "No SubDevice at alias {} position {} for configuration",
                    config.alias,
                    config.position
                );

                continue;
            };

            let slave = &mut state.subdevices[slave_index];

            if !config.matches_identity(slave.identity.vendor_id, slave.identity.product_id) {
                fmt::error!(
                    "SubDevice {} is {}, expected vendor {:#010x} product {:#010x}",
                    slave_index,
                    slave.identity,
                    config.vendor_id,
                    config.product_id
                );

                slave.error_flag = true;

                continue;
            }

            slave.config_index = Some(index);

            let sii_sync_managers = slave.sii.sync_managers.clone();

            DomainData::resolve_physical_starts(&mut state.configs[index], &sii_sync_managers);
        }

        // Everything healthy is taken to OP
        for slave in &mut state.subdevices {
            if !slave.error_flag {
                slave.requested_state = SubDeviceState::Op;
            }
        }

        state.phase = Phase::Operation;

        fmt::info!(
            "Activated: {} SubDevices, {} domains",
            state.subdevices.len(),
            state.domains.len()
        );

        Ok(())
    }

    /// Stop process data exchange and return the bus to PREOP; the idle thread resumes.
    pub fn deactivate(&self) -> Result<(), Error> {
        let mut state = self.inner.lock();

        if state.phase != Phase::Operation {
            return Err(Error::InvalidPhase);
        }

        for slave in &mut state.subdevices {
            slave.requested_state = SubDeviceState::PreOp;
        }

        state.phase = Phase::Idle;

        Ok(())
    }

    /// Number of SubDevices found by the last topology scan.
    pub fn subdevice_count(&self) -> u16 {
        self.inner.lock().fsm.slave_count()
    }

    /// Snapshot of one SubDevice.
    pub fn subdevice_info(&self, position: u16) -> Result<SubDeviceInfo, Error> {
        let state = self.inner.lock();

        state.subdevice(position).map(SubDevice::info)
    }

    /// Raw EEPROM image of one SubDevice as read during the scan.
    pub fn subdevice_eeprom(&self, position: u16) -> Result<Vec<u8>, Error> {
        let state = self.inner.lock();

        state
            .subdevice(position)
            .map(|slave| slave.eeprom.as_bytes().to_vec())
    }

    /// The CoE object dictionary of one SubDevice, if it has been fetched.
    pub fn subdevice_dictionary(&self, position: u16) -> Result<Option<SdoDictionary>, Error> {
        let state = self.inner.lock();

        state.subdevice(position).map(|slave| slave.dictionary.clone())
    }

    /// Health snapshot of the whole master.
    pub fn status(&self) -> MainDeviceStatus {
        let state = self.inner.lock();

        let counters = state.queue.counters();
        let device = state.device.stats();

        MainDeviceStatus {
            subdevice_count: state.fsm.slave_count(),
            link_up: state.device.link_up(),
            activated: state.phase == Phase::Operation,
            tx_frames: device.tx_frames,
            rx_frames: device.rx_frames,
            pdu_timeouts: counters.timeouts,
            unmatched_pdus: counters.unmatched,
            corrupted_frames: counters.corrupted,
        }
    }

    /// Submit a request without blocking; the returned handle tracks its lifecycle.
    fn submit(&self, position: u16, kind: RequestKind) -> Request {
        let mut state = self.inner.lock();

        let id = state.requests.submit(position, kind, Instant::now());

        drop(state);

        self.inner.cond.notify_all();

        Request {
            inner: Arc::clone(&self.inner),
            id,
        }
    }

    /// Run a request to completion with a deadline.
    ///
    /// Blocks the calling thread; something else (the idle thread, or an application cycling
    /// on another thread) must be driving the master.
    fn run_request(
        &self,
        position: u16,
        kind: RequestKind,
        timeout: Option<Duration>,
    ) -> Result<RequestSlotOutcome, Error> {
        let request = self.submit(position, kind);

        request.wait(timeout.unwrap_or(self.inner.config.request_timeout))
    }

    /// Blocking expedited/segmented SDO upload.
    pub fn sdo_upload(
        &self,
        position: u16,
        index: u16,
        sub_index: u8,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, Error> {
        self.run_request(
            position,
            RequestKind::SdoUpload { index, sub_index },
            timeout,
        )?
        .into_data()
    }

    /// Blocking expedited/segmented SDO download.
    pub fn sdo_download(
        &self,
        position: u16,
        index: u16,
        sub_index: u8,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        self.run_request(
            position,
            RequestKind::SdoDownload {
                index,
                sub_index,
                data: data.to_vec(),
            },
            timeout,
        )?
        .into_written()
    }

    /// Blocking FoE file read.
    pub fn foe_read(
        &self,
        position: u16,
        file_name: &str,
        password: u32,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, Error> {
        self.run_request(
            position,
            RequestKind::FoeRead {
                file_name: file_name.to_string(),
                password,
            },
            timeout,
        )?
        .into_data()
    }

    /// Blocking FoE file write.
    pub fn foe_write(
        &self,
        position: u16,
        file_name: &str,
        password: u32,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        self.run_request(
            position,
            RequestKind::FoeWrite {
                file_name: file_name.to_string(),
                password,
                data: data.to_vec(),
            },
            timeout,
        )?
        .into_written()
    }

    /// Blocking raw register read.
    pub fn register_read(
        &self,
        position: u16,
        register: u16,
        len: usize,
    ) -> Result<Vec<u8>, Error> {
        self.run_request(position, RequestKind::RegisterRead { register, len }, None)?
            .into_data()
    }

    /// Blocking raw register write.
    pub fn register_write(
        &self,
        position: u16,
        register: u16,
        data: &[u8],
    ) -> Result<(), Error> {
        self.run_request(
            position,
            RequestKind::RegisterWrite {
                register,
                data: data.to_vec(),
            },
            None,
        )?
        .into_written()
    }

    /// Blocking single EEPROM word write.
    pub fn sii_write(&self, position: u16, word_address: u16, value: u16) -> Result<(), Error> {
        self.run_request(
            position,
            RequestKind::SiiWrite {
                word_address,
                value,
            },
            None,
        )?
        .into_written()
    }

    /// Write a new station alias, maintaining the configuration area checksum.
    pub fn write_alias(&self, position: u16, alias: u16) -> Result<(), Error> {
        self.run_request(position, RequestKind::WriteAlias { alias }, None)?
            .into_written()
    }

    /// Reset one SubDevice's ESC.
    pub fn reboot(&self, position: u16) -> Result<(), Error> {
        self.run_request(position, RequestKind::Reboot, None)?
            .into_written()
    }

    /// Fetch (or re-fetch) a SubDevice's object dictionary immediately.
    pub fn fetch_dictionary(&self, position: u16) -> Result<(), Error> {
        self.run_request(position, RequestKind::SdoDictionary, None)?
            .into_written()
    }
}

impl Drop for MainDevice {
    fn drop(&mut self) {
        {
            let mut state = self.inner.lock();

            state.running = false;
        }

        if let Some(handle) = self.idle.take() {
            let _ = handle.join();
        }
    }
}

/// Terminal payload of a request, with enough context to map aborts onto errors.
struct RequestSlotOutcome {
    kind: RequestKind,
    result: Result<RequestResult, Error>,
}

impl RequestSlotOutcome {
    fn into_result(self) -> Result<RequestResult, Error> {
        match self.result {
            Ok(RequestResult::SdoAborted(code)) => {
                let (index, sub_index) = match self.kind {
                    RequestKind::SdoUpload { index, sub_index }
                    | RequestKind::SdoDownload {
                        index, sub_index, ..
                    } => (index, sub_index),
                    _ => (0, 0),
                };

                Err(Error::Mailbox(MailboxError::Aborted {
                    code: crate::coe::abort_code::CoeAbortCode::from(code),
                    index,
                    sub_index,
                }))
            }
            Ok(RequestResult::FoeFailed(error)) => Err(Error::Foe(FoeError {
                status: error.status,
                code: error.code,
            })),
            other => other,
        }
    }

    fn into_data(self) -> Result<Vec<u8>, Error> {
        match self.into_result()? {
            RequestResult::Data(data) => Ok(data),
            _ => Err(Error::Internal),
        }
    }

    fn into_written(self) -> Result<(), Error> {
        self.into_result().map(|_| ())
    }
}

/// Handle to a submitted acyclic request.
pub struct Request {
    inner: Arc<Inner>,
    id: u64,
}

impl Request {
    /// Current lifecycle state.
    pub fn state(&self) -> RequestState {
        self.inner
            .lock()
            .requests
            .get(self.id)
            .map(|slot| slot.state)
            .unwrap_or(RequestState::Init)
    }

    /// Remove the request if it has not started yet.
    pub fn cancel(&self) -> bool {
        self.inner.lock().requests.cancel(self.id)
    }

    /// Abandon the request: it may still run to completion, but its result is dropped.
    pub fn abandon(&self) {
        self.inner.lock().requests.abandon(self.id);
    }

    /// Block until the request finishes or `timeout` elapses.
    fn wait(&self, timeout: Duration) -> Result<RequestSlotOutcome, Error> {
        let deadline = Instant::now() + timeout;

        let mut state = self.inner.lock();

        loop {
            if let Some(slot) = state.requests.take_terminal(self.id) {
                let result = match (slot.result, slot.error) {
                    (Some(result), _) => Ok(result),
                    (None, Some(error)) => Err(error),
                    (None, None) => Err(Error::Internal),
                };

                return Ok(RequestSlotOutcome {
                    kind: slot.kind,
                    result,
                });
            }

            let now = Instant::now();

            if now >= deadline {
                // Still queued: remove it outright. Already running: it finishes on its own
                // and is then dropped.
                if !state.requests.cancel(self.id) {
                    state.requests.abandon(self.id);
                }

                return Err(Error::Timeout);
            }

            let (guard, _) = self
                .inner
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);

            state = guard;
        }
    }
}

/// Configuration handle for one (alias, position) SubDevice selector.
///
/// All configuration must happen before [`MainDevice::activate`].
#[derive(Clone)]
pub struct SubDeviceConfig {
    inner: Arc<Inner>,
    index: usize,
}

impl SubDeviceConfig {
    fn with_config<T>(
        &self,
        f: impl FnOnce(&mut SubDeviceConfigData) -> T,
    ) -> Result<T, Error> {
        let mut state = self.inner.lock();

        if state.phase != Phase::Idle {
            return Err(Error::InvalidPhase);
        }

        let config = state
            .configs
            .get_mut(self.index)
            .ok_or(Error::NotFound {
                item: Item::SubDeviceConfig,
                index: Some(self.index),
            })?;

        Ok(f(config))
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Configure a sync manager's direction and watchdog behaviour.
    pub fn sync_manager(
        &self,
        index: u8,
        direction: SmDirection,
        watchdog: SmWatchdog,
    ) -> Result<(), Error> {
        self.with_config(|config| {
            if let Some(sm) = config
                .sync_managers
                .iter_mut()
                .find(|sm| sm.index == index)
            {
                sm.direction = direction;
                sm.watchdog = watchdog;
            } else {
                config.sync_managers.push(SmConfig {
                    index,
                    direction,
                    watchdog,
                    pdo_assignment: None,
                });
            }
        })
    }

    /// Assign PDOs to a previously configured sync manager.
    pub fn pdo_assignment(&self, sm_index: u8, pdos: &[u16]) -> Result<(), Error> {
        self.with_config(|config| {
            if let Some(sm) = config
                .sync_managers
                .iter_mut()
                .find(|sm| sm.index == sm_index)
            {
                sm.pdo_assignment = Some(pdos.to_vec());

                Ok(())
            } else {
                Err(Error::NotFound {
                    item: Item::SyncManager,
                    index: Some(usize::from(sm_index)),
                })
            }
        })?
    }

    /// Define the entry mapping of one PDO.
    pub fn pdo_mapping(&self, pdo_index: u16, entries: &[PdoEntryDef]) -> Result<(), Error> {
        self.with_config(|config| {
            if let Some(mapping) = config
                .pdo_mappings
                .iter_mut()
                .find(|mapping| mapping.pdo_index == pdo_index)
            {
                mapping.entries = entries.to_vec();
            } else {
                config.pdo_mappings.push(PdoMappingConfig {
                    pdo_index,
                    entries: entries.to_vec(),
                });
            }
        })
    }

    /// Queue an SDO write to apply while taking the SubDevice from PREOP to SAFEOP.
    pub fn add_startup_sdo(&self, index: u16, sub_index: u8, data: &[u8]) -> Result<(), Error> {
        self.with_config(|config| {
            config.startup_sdos.push(SdoConfig {
                index,
                sub_index,
                data: data.to_vec(),
            });
        })
    }

    /// Set the distributed clock parameters.
    pub fn configure_dc(&self, dc: DcConfig) -> Result<(), Error> {
        self.with_config(|config| {
            config.dc = Some(dc);
        })
    }

    /// Set the watchdog divider and SM watchdog interval.
    pub fn configure_watchdog(&self, watchdog: WatchdogConfig) -> Result<(), Error> {
        self.with_config(|config| {
            config.watchdog = Some(watchdog);
        })
    }
}

/// Borrow of a domain's process data image.
pub struct DomainDataGuard<'a> {
    guard: MutexGuard<'a, MasterState>,
    index: usize,
}

impl Deref for DomainDataGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.guard.domains[self.index].image
    }
}

impl DerefMut for DomainDataGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard.domains[self.index].image
    }
}

/// Handle to one process data domain.
#[derive(Clone)]
pub struct Domain {
    inner: Arc<Inner>,
    index: usize,
}

impl Domain {
    /// Register one PDO entry into this domain, returning its byte offset in the image.
    ///
    /// The entry must byte-align; use [`register_pdo_entry_bit`](Self::register_pdo_entry_bit)
    /// for bit-granular data.
    pub fn register_pdo_entry(
        &self,
        config: &SubDeviceConfig,
        index: u16,
        sub_index: u8,
    ) -> Result<usize, Error> {
        let mut state = self.inner.lock();

        if state.phase != Phase::Idle {
            return Err(Error::InvalidPhase);
        }

        let MasterState {
            domains, configs, ..
        } = &mut *state;

        domains[self.index].register_pdo_entry(
            self.index,
            configs,
            config.index(),
            index,
            sub_index,
            None,
        )
    }

    /// As [`register_pdo_entry`](Self::register_pdo_entry), also returning the bit position
    /// inside the byte.
    pub fn register_pdo_entry_bit(
        &self,
        config: &SubDeviceConfig,
        index: u16,
        sub_index: u8,
    ) -> Result<(usize, u32), Error> {
        let mut state = self.inner.lock();

        if state.phase != Phase::Idle {
            return Err(Error::InvalidPhase);
        }

        let MasterState {
            domains, configs, ..
        } = &mut *state;

        let mut bit = 0u32;

        let offset = domains[self.index].register_pdo_entry(
            self.index,
            configs,
            config.index(),
            index,
            sub_index,
            Some(&mut bit),
        )?;

        Ok((offset, bit))
    }

    /// Mark this domain's exchanges for the next [`MainDevice::send`].
    pub fn queue(&self) -> Result<(), Error> {
        let mut state = self.inner.lock();

        if state.phase != Phase::Operation {
            return Err(Error::InvalidPhase);
        }

        let MasterState { domains, queue, .. } = &mut *state;

        domains[self.index].queue(queue, Instant::now());

        Ok(())
    }

    /// Collect this domain's responses and evaluate the working counter.
    pub fn process(&self) -> Result<(), Error> {
        let mut state = self.inner.lock();

        if state.phase != Phase::Operation {
            return Err(Error::InvalidPhase);
        }

        let MasterState { domains, queue, .. } = &mut *state;

        domains[self.index].process(queue);

        Ok(())
    }

    /// Snapshot of the working counter state.
    pub fn state(&self) -> DomainState {
        self.inner.lock().domains[self.index].state
    }

    /// Size of the domain image in bytes.
    pub fn len(&self) -> usize {
        self.inner.lock().domains[self.index].size
    }

    /// Whether the domain has no registered data.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the process data image.
    ///
    /// The borrow holds the master mutex; release it before calling back into the MainDevice.
    pub fn data(&self) -> DomainDataGuard<'_> {
        DomainDataGuard {
            guard: self.inner.lock(),
            index: self.index,
        }
    }
}
