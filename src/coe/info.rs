//! SDO Information service: object dictionary discovery.
//!
//! Walks `Get OD List` (possibly fragmented), then `Get Object Description` per object, then
//! `Get Entry Description` per subindex, building a [`SdoDictionary`].

use crate::{
    coe::{CoeHeader, CoeService},
    error::{Error, MailboxError},
    fmt,
    mailbox::{self, MailboxExchange, MailboxGeometry, MailboxHeader, MailboxStep, MailboxType,
        Priority},
    pdu::Pdu,
};
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireSized, EtherCrabWireWrite};
use std::time::Instant;

const GET_OD_LIST_REQUEST: u8 = 0x01;
const GET_OD_LIST_RESPONSE: u8 = 0x02;
const GET_OBJECT_DESCRIPTION_REQUEST: u8 = 0x03;
const GET_OBJECT_DESCRIPTION_RESPONSE: u8 = 0x04;
const GET_ENTRY_DESCRIPTION_REQUEST: u8 = 0x05;
const GET_ENTRY_DESCRIPTION_RESPONSE: u8 = 0x06;
const SDO_INFO_ERROR: u8 = 0x07;

/// "Deliver all objects" OD list type.
const LIST_TYPE_ALL: u16 = 0x0001;

/// Per-AL-state access rights of a dictionary entry.
///
/// ETG1000.6 Table 44 – object access element.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 2)]
pub struct SdoEntryAccess {
    /// Readable in PREOP.
    #[wire(bits = 1)]
    pub read_preop: bool,
    /// Readable in SAFEOP.
    #[wire(bits = 1)]
    pub read_safeop: bool,
    /// Readable in OP.
    #[wire(bits = 1)]
    pub read_op: bool,
    /// Writeable in PREOP.
    #[wire(bits = 1)]
    pub write_preop: bool,
    /// Writeable in SAFEOP.
    #[wire(bits = 1)]
    pub write_safeop: bool,
    /// Writeable in OP.
    #[wire(bits = 1)]
    pub write_op: bool,
    /// Mappable into RxPDOs.
    #[wire(bits = 1)]
    pub rx_pdo_mappable: bool,
    /// Mappable into TxPDOs.
    #[wire(bits = 1, post_skip = 8)]
    pub tx_pdo_mappable: bool,
}

/// One subindex of a dictionary object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdoEntry {
    /// Subindex.
    pub sub_index: u8,
    /// CoE data type index.
    pub data_type: u16,
    /// Entry size in bits.
    pub bit_length: u16,
    /// Access rights per AL state.
    pub access: SdoEntryAccess,
    /// Entry name.
    pub name: heapless::String<64>,
}

/// One object of the SDO dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdoObject {
    /// Object index.
    pub index: u16,
    /// CoE data type index.
    pub data_type: u16,
    /// Highest subindex.
    pub max_sub_index: u8,
    /// Object code (variable, array, record, ...).
    pub object_code: u8,
    /// Object name.
    pub name: heapless::String<64>,
    /// Described entries. Zero bit length subindices are skipped.
    pub entries: Vec<SdoEntry>,
}

/// A SubDevice's object dictionary as reported by the SDO Information service.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SdoDictionary {
    /// All discovered objects, in index order as reported.
    pub objects: Vec<SdoObject>,
}

impl SdoDictionary {
    /// Find an object by index.
    pub fn object(&self, index: u16) -> Option<&SdoObject> {
        self.objects.iter().find(|object| object.index == index)
    }
}

fn truncated_name(raw: &[u8]) -> heapless::String<64> {
    let text = core::str::from_utf8(raw).unwrap_or("");

    let mut name = heapless::String::new();

    for c in text.chars() {
        if name.push(c).is_err() {
            break;
        }
    }

    name
}

/// Build one SDO Information request frame: mailbox + CoE + info headers + payload.
fn info_request(counter: u8, opcode: u8, payload: &[u8]) -> Vec<u8> {
    let length = (CoeHeader::PACKED_LEN + 4 + payload.len()) as u16;

    let mut buf = vec![0u8; MailboxHeader::PACKED_LEN + usize::from(length)];

    MailboxHeader {
        length,
        address: 0x0000,
        priority: Priority::Lowest,
        mailbox_type: MailboxType::Coe,
        counter,
    }
    .pack_to_slice_unchecked(&mut buf);

    let mut offset = MailboxHeader::PACKED_LEN;

    CoeHeader::new(CoeService::SdoInformation).pack_to_slice_unchecked(&mut buf[offset..]);
    offset += CoeHeader::PACKED_LEN;

    // Info header: opcode (incomplete flag clear), reserved, fragments left
    buf[offset] = opcode;
    offset += 4;

    buf[offset..offset + payload.len()].copy_from_slice(payload);

    buf
}

/// Outcome of one FSM step.
pub(crate) enum InfoStep {
    /// Enqueue this PDU and call [`SdoInfoFsm::advance`] with the completed response.
    Send(Pdu),
    /// Discovery finished.
    Done(SdoDictionary),
}

enum State {
    OdList(MailboxExchange),
    ObjectDescription(MailboxExchange),
    EntryDescription(MailboxExchange),
}

/// Object dictionary discovery FSM.
pub(crate) struct SdoInfoFsm {
    station: u16,
    geometry: MailboxGeometry,
    counter: u8,
    deadline: Instant,
    state: State,
    /// Indices collected from the (possibly fragmented) OD list.
    list: Vec<u16>,
    dictionary: SdoDictionary,
    /// Position in `list` of the object currently being described.
    current_object: usize,
    /// Subindex currently being described.
    current_entry: u8,
}

impl SdoInfoFsm {
    /// Kick off discovery with a `Get OD List` request for all objects.
    pub(crate) fn start(
        station: u16,
        geometry: MailboxGeometry,
        counter: u8,
        deadline: Instant,
    ) -> Result<(Self, Pdu), Error> {
        let counter = super::fsm::next_counter(counter);

        let request = info_request(counter, GET_OD_LIST_REQUEST, &LIST_TYPE_ALL.to_le_bytes());

        let (exchange, pdu) = MailboxExchange::start(station, geometry, request, deadline)?;

        Ok((
            Self {
                station,
                geometry,
                counter,
                deadline,
                state: State::OdList(exchange),
                list: Vec::new(),
                dictionary: SdoDictionary::default(),
                current_object: 0,
                current_entry: 0,
            },
            pdu,
        ))
    }

    /// The mailbox counter after this discovery, to be stored back on the SubDevice.
    pub(crate) fn counter(&self) -> u8 {
        self.counter
    }

    fn invalid(&self) -> Error {
        Error::Mailbox(MailboxError::SdoResponseInvalid {
            index: 0,
            sub_index: 0,
        })
    }

    /// Validate a fetched mailbox region down to the info service body.
    ///
    /// Returns `(opcode, incomplete, body after info header)`.
    fn info_payload<'raw>(&self, raw: &'raw [u8]) -> Result<(u8, bool, &'raw [u8]), Error> {
        let (header, payload) = mailbox::parse_response(raw)?;

        if header.mailbox_type != MailboxType::Coe {
            return Err(self.invalid());
        }

        let coe = CoeHeader::unpack_from_slice(payload)?;

        if coe.service != CoeService::SdoInformation {
            return Err(self.invalid());
        }

        let body = payload
            .get(CoeHeader::PACKED_LEN..)
            .ok_or(self.invalid())?;

        if body.len() < 4 {
            return Err(self.invalid());
        }

        let opcode = body[0] & 0x7f;
        let incomplete = body[0] & 0x80 != 0;

        if opcode == SDO_INFO_ERROR {
            let code = body
                .get(4..8)
                .map(|raw| u32::from_le_bytes(raw.try_into().expect("4 byte slice")))
                .unwrap_or(0);

            fmt::debug!(
                "SDO info error from {:#06x}: {}",
                self.station,
                crate::coe::abort_code::CoeAbortCode::from(code)
            );

            return Ok((SDO_INFO_ERROR, false, &body[4..]));
        }

        Ok((opcode, incomplete, &body[4..]))
    }

    fn request_next(&mut self) -> Result<InfoStep, Error> {
        // Skip objects until one needs describing, then entries until one needs describing
        while self.current_object < self.list.len() {
            let index = self.list[self.current_object];

            if self.dictionary.object(index).is_none() {
                self.counter = super::fsm::next_counter(self.counter);

                let request = info_request(
                    self.counter,
                    GET_OBJECT_DESCRIPTION_REQUEST,
                    &index.to_le_bytes(),
                );

                let (exchange, pdu) =
                    MailboxExchange::start(self.station, self.geometry, request, self.deadline)?;

                self.state = State::ObjectDescription(exchange);

                return Ok(InfoStep::Send(pdu));
            }

            let object = self
                .dictionary
                .object(index)
                .expect("just checked presence");

            if object.max_sub_index > 0 && self.current_entry <= object.max_sub_index {
                // Subindex 0 only counts the others; descriptions start at 1
                if self.current_entry == 0 {
                    self.current_entry = 1;
                }

                let mut payload = [0u8; 4];
                payload[0..2].copy_from_slice(&index.to_le_bytes());
                payload[2] = self.current_entry;
                // Value info: no values requested
                payload[3] = 0x00;

                self.counter = super::fsm::next_counter(self.counter);

                let request =
                    info_request(self.counter, GET_ENTRY_DESCRIPTION_REQUEST, &payload);

                let (exchange, pdu) =
                    MailboxExchange::start(self.station, self.geometry, request, self.deadline)?;

                self.state = State::EntryDescription(exchange);

                return Ok(InfoStep::Send(pdu));
            }

            self.current_object += 1;
            self.current_entry = 0;
        }

        fmt::debug!(
            "Dictionary of {:#06x} complete: {} objects",
            self.station,
            self.dictionary.objects.len()
        );

        Ok(InfoStep::Done(core::mem::take(&mut self.dictionary)))
    }

    /// Feed a completed PDU in, get the next one (or the finished dictionary) out.
    pub(crate) fn advance(&mut self, response: Pdu, now: Instant) -> Result<InfoStep, Error> {
        match &mut self.state {
            State::OdList(exchange) => match exchange.advance(response, now)? {
                MailboxStep::Send(pdu) => Ok(InfoStep::Send(pdu)),
                MailboxStep::Done(raw) => self.on_od_list(&raw),
            },
            State::ObjectDescription(exchange) => match exchange.advance(response, now)? {
                MailboxStep::Send(pdu) => Ok(InfoStep::Send(pdu)),
                MailboxStep::Done(raw) => self.on_object_description(&raw),
            },
            State::EntryDescription(exchange) => match exchange.advance(response, now)? {
                MailboxStep::Send(pdu) => Ok(InfoStep::Send(pdu)),
                MailboxStep::Done(raw) => self.on_entry_description(&raw),
            },
        }
    }

    fn on_od_list(&mut self, raw: &[u8]) -> Result<InfoStep, Error> {
        let (opcode, incomplete, body) = self.info_payload(raw)?;

        if opcode != GET_OD_LIST_RESPONSE {
            return Err(self.invalid());
        }

        // List type word precedes the indices in every fragment
        let indices = body.get(2..).ok_or(self.invalid())?;

        for chunk in indices.chunks_exact(2) {
            let index = u16::from_le_bytes([chunk[0], chunk[1]]);

            // Some devices pad the tail of the list with zeros
            if index != 0 {
                self.list.push(index);
            }
        }

        if incomplete {
            let (exchange, pdu) =
                MailboxExchange::receive(self.station, self.geometry, self.deadline)?;

            self.state = State::OdList(exchange);

            return Ok(InfoStep::Send(pdu));
        }

        fmt::debug!(
            "SubDevice {:#06x} reports {} dictionary objects",
            self.station,
            self.list.len()
        );

        self.request_next()
    }

    fn on_object_description(&mut self, raw: &[u8]) -> Result<InfoStep, Error> {
        let expected_index = self.list[self.current_object];

        let (opcode, _incomplete, body) = self.info_payload(raw)?;

        if opcode == SDO_INFO_ERROR {
            // Object not describable; drop it and move on
            self.current_object += 1;
            self.current_entry = 0;

            return self.request_next();
        }

        if opcode != GET_OBJECT_DESCRIPTION_RESPONSE || body.len() < 6 {
            return Err(self.invalid());
        }

        let index = u16::from_le_bytes([body[0], body[1]]);

        if index != expected_index {
            return Err(self.invalid());
        }

        self.dictionary.objects.push(SdoObject {
            index,
            data_type: u16::from_le_bytes([body[2], body[3]]),
            max_sub_index: body[4],
            object_code: body[5],
            name: truncated_name(&body[6..]),
            entries: Vec::new(),
        });

        self.current_entry = 0;

        self.request_next()
    }

    fn on_entry_description(&mut self, raw: &[u8]) -> Result<InfoStep, Error> {
        let expected_index = self.list[self.current_object];
        let expected_sub = self.current_entry;

        let (opcode, _incomplete, body) = self.info_payload(raw)?;

        if opcode == SDO_INFO_ERROR {
            // Entry not describable; skip it
            self.current_entry = self.current_entry.wrapping_add(1);

            return self.request_next();
        }

        if opcode != GET_ENTRY_DESCRIPTION_RESPONSE || body.len() < 10 {
            return Err(self.invalid());
        }

        let index = u16::from_le_bytes([body[0], body[1]]);
        let sub_index = body[2];

        if index != expected_index || sub_index != expected_sub {
            return Err(self.invalid());
        }

        let bit_length = u16::from_le_bytes([body[6], body[7]]);

        // Zero bit length subindices exist as padding; don't record them
        if bit_length > 0 {
            let entry = SdoEntry {
                sub_index,
                data_type: u16::from_le_bytes([body[4], body[5]]),
                bit_length,
                access: SdoEntryAccess::unpack_from_slice(&body[8..10])?,
                name: truncated_name(&body[10..]),
            };

            let object = self
                .dictionary
                .objects
                .iter_mut()
                .find(|object| object.index == index)
                .ok_or(Error::Internal)?;

            object.entries.push(entry);
        }

        self.current_entry = self.current_entry.wrapping_add(1);

        self.request_next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn od_list_request_layout() {
        let frame = info_request(1, GET_OD_LIST_REQUEST, &LIST_TYPE_ALL.to_le_bytes());

        assert_eq!(
            frame,
            vec![
                // Mailbox header: length 8, CoE, counter 1
                0x08, 0x00, 0x00, 0x00, 0x00, 0x13, //
                // CoE header: SDO information
                0x00, 0x80, //
                // Info header: Get OD List request, no fragments
                0x01, 0x00, 0x00, 0x00, //
                // List type: all objects
                0x01, 0x00,
            ]
        );
    }

    #[test]
    fn access_word_decode() {
        // Readable everywhere, writeable in PREOP only, TxPDO mappable
        let raw = [0b1000_1111u8, 0x00];

        let access = SdoEntryAccess::unpack_from_slice(&raw).unwrap();

        assert!(access.read_preop);
        assert!(access.read_safeop);
        assert!(access.read_op);
        assert!(access.write_preop);
        assert!(!access.write_safeop);
        assert!(access.tx_pdo_mappable);
    }
}
