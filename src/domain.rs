//! Process data domains: contiguous logical-address windows aggregating PDO entries across
//! SubDevices into one or more LRW exchanges.

use crate::{
    command::Command,
    error::{Error, Item},
    fmt,
    pdu::{Pdu, frame::MAX_PDU_DATA, queue::{PduQueue, PduToken}},
    subdevice_config::{FmmuAllocation, SubDeviceConfigData},
};
use std::time::Instant;

/// Aggregate working counter interpretation for one domain cycle.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum WcState {
    /// No SubDevice responded.
    #[default]
    Zero,
    /// Some, but not all, expected exchanges happened.
    Incomplete,
    /// Every registered SubDevice exchanged its data.
    Complete,
}

/// Snapshot of a domain's cyclic health.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct DomainState {
    /// Sum of working counters over the domain's exchanges in the last processed cycle.
    pub working_counter: u16,
    /// The value `working_counter` takes when every SubDevice participates.
    pub expected_working_counter: u16,
    /// Interpretation of the two counters.
    pub wc_state: WcState,
}

/// One LRW exchange covering a sub-range of the domain image.
#[derive(Debug)]
struct Exchange {
    /// Byte offset inside the domain image.
    offset: usize,
    len: usize,
    /// Claim ticket while the PDU is with the queue.
    token: Option<PduToken>,
    /// The PDU between cycles; its buffer is reused.
    pdu: Option<Pdu>,
    /// Working counter of the last completed cycle.
    last_wkc: u16,
}

/// A master-owned process data domain.
#[derive(Debug, Default)]
pub(crate) struct DomainData {
    /// Logical base address, assigned at activation.
    pub base: u32,
    /// Image size in bytes, grown by entry registration.
    pub size: usize,
    pub expected_wkc: u16,
    /// The process data image. Empty until activation.
    pub image: Vec<u8>,
    exchanges: Vec<Exchange>,
    pub state: DomainState,
}

impl DomainData {
    /// Register one PDO entry of `configs[config_index]` into this domain.
    ///
    /// Resolution uses the explicit sync manager assignments and PDO mappings of the
    /// configuration. Returns the byte offset of the entry inside the domain image; a
    /// non-byte-aligned entry requires `bit_position` or fails.
    pub(crate) fn register_pdo_entry(
        &mut self,
        domain_index: usize,
        configs: &mut [SubDeviceConfigData],
        config_index: usize,
        index: u16,
        sub_index: u8,
        mut bit_position: Option<&mut u32>,
    ) -> Result<usize, Error> {
        let config = configs
            .get_mut(config_index)
            .ok_or(Error::NotFound {
                item: Item::SubDeviceConfig,
                index: Some(config_index),
            })?;

        let located = Self::locate_entry(config, index, sub_index)?;

        let entry_bit = located.entry_bit_offset;

        if entry_bit % 8 != 0 && bit_position.is_none() {
            return Err(Error::PdoEntryNotByteAligned { index, sub_index });
        }

        // One FMMU per (sync manager, domain) pair; the first registration claims the space
        let allocation = match config
            .fmmus
            .iter()
            .position(|fmmu| fmmu.domain == domain_index && fmmu.sync_manager == located.sync_manager)
        {
            Some(position) => &config.fmmus[position],
            None => {
                let allocation = FmmuAllocation {
                    domain: domain_index,
                    sync_manager: located.sync_manager,
                    direction: located.direction,
                    physical_start: 0,
                    domain_offset: self.size,
                    length_bytes: located.sync_manager_bytes,
                };

                self.size += usize::from(located.sync_manager_bytes);
                self.expected_wkc += allocation.working_counter_increment();

                config.fmmus.push(allocation);

                config.fmmus.last().expect("just pushed")
            }
        };

        let offset = allocation.domain_offset + usize::from(entry_bit / 8);

        if let Some(bit) = bit_position.take() {
            *bit = u32::from(entry_bit % 8);
        }

        Ok(offset)
    }

    /// Resolve `index:sub_index` to its sync manager and bit position within the SM data area.
    fn locate_entry(
        config: &SubDeviceConfigData,
        index: u16,
        sub_index: u8,
    ) -> Result<LocatedEntry, Error> {
        for sm in &config.sync_managers {
            let Some(assignment) = &sm.pdo_assignment else {
                continue;
            };

            let mut pdo_byte_offset = 0u16;

            for pdo_index in assignment {
                let Some(mapping) = config.mapping_for(*pdo_index) else {
                    fmt::warn!(
                        "PDO {:#06x} assigned to SM{} has no configured mapping",
                        pdo_index,
                        sm.index
                    );

                    continue;
                };

                let mut entry_bit = 0u16;

                for entry in &mapping.entries {
                    if entry.index == index && entry.sub_index == sub_index {
                        let sync_manager_bytes = Self::sm_bytes(config, assignment);

                        return Ok(LocatedEntry {
                            sync_manager: sm.index,
                            direction: sm.direction,
                            sync_manager_bytes,
                            entry_bit_offset: pdo_byte_offset * 8 + entry_bit,
                        });
                    }

                    entry_bit += u16::from(entry.bit_length);
                }

                pdo_byte_offset += entry_bit.div_ceil(8);
            }
        }

        Err(Error::NotFound {
            item: Item::PdoEntry,
            index: None,
        })
    }

    /// Data bytes of a sync manager: each PDO padded up to a byte boundary.
    fn sm_bytes(config: &SubDeviceConfigData, assignment: &[u16]) -> u16 {
        assignment
            .iter()
            .map(|pdo_index| {
                config
                    .mapping_for(*pdo_index)
                    .map(|mapping| {
                        mapping
                            .entries
                            .iter()
                            .map(|entry| u16::from(entry.bit_length))
                            .sum::<u16>()
                            .div_ceil(8)
                    })
                    .unwrap_or(0)
            })
            .sum()
    }

    /// Allocate the image and partition it into LRW exchanges.
    ///
    /// Called once at activation, after every registration has accumulated into `size`.
    pub(crate) fn finish(&mut self, base: u32) {
        self.base = base;
        self.image = vec![0u8; self.size];
        self.state.expected_working_counter = self.expected_wkc;

        self.exchanges.clear();

        let mut offset = 0;

        while offset < self.size {
            let len = (self.size - offset).min(MAX_PDU_DATA);

            self.exchanges.push(Exchange {
                offset,
                len,
                token: None,
                pdu: None,
                last_wkc: 0,
            });

            offset += len;
        }

        fmt::debug!(
            "Domain at {:#010x}: {} bytes in {} exchanges, expected WKC {}",
            self.base,
            self.size,
            self.exchanges.len(),
            self.expected_wkc
        );
    }

    /// Queue all owned exchanges for the next send.
    ///
    /// An exchange whose previous cycle has not been processed yet is left alone.
    pub(crate) fn queue(&mut self, queue: &mut PduQueue, now: Instant) {
        for exchange in &mut self.exchanges {
            if exchange.token.is_some() {
                continue;
            }

            let mut pdu = exchange.pdu.take().unwrap_or_else(|| {
                Pdu::read(
                    Command::lrw(self.base + exchange.offset as u32),
                    exchange.len,
                )
            });

            // LRW is a write on the wire even though data comes back
            pdu.command = Command::lrw(self.base + exchange.offset as u32);
            pdu.data
                .copy_from_slice(&self.image[exchange.offset..exchange.offset + exchange.len]);

            exchange.token = Some(queue.submit(pdu, now));
        }
    }

    /// Collect completed exchanges, copy their payloads back into the image and evaluate the
    /// aggregate working counter.
    pub(crate) fn process(&mut self, queue: &mut PduQueue) {
        let mut total = 0u16;

        for exchange in &mut self.exchanges {
            if let Some(token) = exchange.token {
                if let Some(pdu) = queue.claim(token) {
                    exchange.token = None;

                    if pdu.check_received().is_ok() {
                        self.image[exchange.offset..exchange.offset + exchange.len]
                            .copy_from_slice(pdu.data());

                        exchange.last_wkc = pdu.working_counter();
                    } else {
                        exchange.last_wkc = 0;
                    }

                    exchange.pdu = Some(pdu);
                }
            }

            total = total.saturating_add(exchange.last_wkc);
        }

        self.state.working_counter = total;

        self.state.wc_state = if total == 0 {
            WcState::Zero
        } else if total == self.expected_wkc {
            WcState::Complete
        } else {
            WcState::Incomplete
        };
    }

    /// Fill in the physical SM start addresses once the matching SubDevice is known.
    pub(crate) fn resolve_physical_starts(
        config: &mut SubDeviceConfigData,
        sii_sync_managers: &[crate::eeprom::types::SiiSyncManager],
    ) {
        for fmmu in &mut config.fmmus {
            if let Some(sm) = sii_sync_managers.get(usize::from(fmmu.sync_manager)) {
                fmmu.physical_start = sm.start_address;
            }
        }
    }
}

#[derive(Debug)]
struct LocatedEntry {
    sync_manager: u8,
    direction: crate::subdevice_config::SmDirection,
    sync_manager_bytes: u16,
    entry_bit_offset: u16,
}
