//! A scripted EtherCAT segment behind the `EthernetDevice` trait.
//!
//! Each simulated SubDevice models the ESC behaviour the MainDevice relies on: station
//! address latch, AL state machine, SII EEPROM access, sync manager mailboxes with a small
//! CoE object dictionary and an FoE file server, and FMMU-mapped logical read/writes.

use etherweave::{EthernetDevice, error::Error};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

/// Mailbox geometry every simulated SubDevice advertises.
pub const MBX_RX_OFFSET: u16 = 0x1000;
pub const MBX_RX_SIZE: u16 = 128;
pub const MBX_TX_OFFSET: u16 = 0x1080;
pub const MBX_TX_SIZE: u16 = 128;

/// Process data SM start addresses.
pub const SM2_START: u16 = 0x1100;
pub const SM3_START: u16 = 0x1180;

const SPACE_SIZE: usize = 0x4000;

/// ETG SII checksum over the first 14 bytes: poly `x^8 + x^2 + x + 1`, init `0xff`.
pub fn sii_crc8(bytes: &[u8]) -> u8 {
    let mut crc = 0xffu8;

    for byte in &bytes[..14] {
        crc ^= byte;

        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x07
            } else {
                crc << 1
            };
        }
    }

    crc
}

/// Description of one simulated SubDevice.
pub struct SimConfig {
    pub alias: u16,
    pub vendor_id: u32,
    pub product_id: u32,
    pub name: &'static str,
    /// CoE details byte for the SII general category (0x04 = enable PDO assign).
    pub coe_details: u8,
    pub with_coe: bool,
    pub with_foe: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            alias: 0,
            vendor_id: 0x0000_0002,
            product_id: 0x07d4_3052,
            name: "SIM2004",
            coe_details: 0x05,
            with_coe: true,
            with_foe: true,
        }
    }
}

/// Build a believable EEPROM image for a simulated SubDevice.
pub fn build_eeprom(config: &SimConfig) -> Vec<u8> {
    let mut words = vec![0u16; 0x40];

    words[0x0004] = config.alias;

    words[0x0008] = (config.vendor_id & 0xffff) as u16;
    words[0x0009] = (config.vendor_id >> 16) as u16;
    words[0x000a] = (config.product_id & 0xffff) as u16;
    words[0x000b] = (config.product_id >> 16) as u16;
    words[0x000c] = 0x0001; // revision
    words[0x000e] = 0x1234; // serial

    // Bootstrap and standard mailboxes share the same windows here
    words[0x0014] = MBX_RX_OFFSET;
    words[0x0015] = MBX_RX_SIZE;
    words[0x0016] = MBX_TX_OFFSET;
    words[0x0017] = MBX_TX_SIZE;
    words[0x0018] = MBX_RX_OFFSET;
    words[0x0019] = MBX_RX_SIZE;
    words[0x001a] = MBX_TX_OFFSET;
    words[0x001b] = MBX_TX_SIZE;

    let mut protocols = 0u16;

    if config.with_coe {
        protocols |= 0x04;
    }

    if config.with_foe {
        protocols |= 0x08;
    }

    words[0x001c] = protocols;

    // Checksum over the configuration area
    let mut head = [0u8; 16];

    for (i, word) in words[..8].iter().enumerate() {
        head[i * 2..i * 2 + 2].copy_from_slice(&word.to_le_bytes());
    }

    words[0x0007] = u16::from(sii_crc8(&head));

    let mut push_bytes = |words: &mut Vec<u16>, bytes: &[u8]| {
        for chunk in bytes.chunks(2) {
            words.push(u16::from_le_bytes([chunk[0], *chunk.get(1).unwrap_or(&0)]));
        }
    };

    // Strings category: device name only
    let mut strings = vec![1u8, config.name.len() as u8];
    strings.extend_from_slice(config.name.as_bytes());
    if strings.len() % 2 != 0 {
        strings.push(0);
    }

    words.push(10);
    words.push((strings.len() / 2) as u16);
    push_bytes(&mut words, &strings);

    // General category
    let mut general = [0u8; 18];
    general[3] = 1; // name string index
    general[5] = config.coe_details;
    general[6] = config.with_foe as u8;

    words.push(30);
    words.push(9);
    push_bytes(&mut words, &general);

    // Sync manager category: mailbox out/in, process data out/in
    let sms: [(u16, u16, u8, u8); 4] = [
        (MBX_RX_OFFSET, MBX_RX_SIZE, 0x26, 1),
        (MBX_TX_OFFSET, MBX_TX_SIZE, 0x22, 2),
        (SM2_START, 0, 0x24, 3),
        (SM3_START, 0, 0x20, 4),
    ];

    let mut sm_bytes = Vec::new();

    for (start, len, control, usage) in sms {
        sm_bytes.extend_from_slice(&start.to_le_bytes());
        sm_bytes.extend_from_slice(&len.to_le_bytes());
        sm_bytes.push(control);
        sm_bytes.push(0);
        sm_bytes.push(0x01);
        sm_bytes.push(usage);
    }

    words.push(41);
    words.push((sm_bytes.len() / 2) as u16);
    push_bytes(&mut words, &sm_bytes);

    words.push(0xffff);

    words
        .iter()
        .flat_map(|word| word.to_le_bytes())
        .collect()
}

/// A segmented-upload CoE transfer in progress.
struct UploadState {
    remaining: Vec<u8>,
    toggle: bool,
}

/// A normal (multi-segment) CoE download in progress.
struct DownloadState {
    index: u16,
    sub_index: u8,
    data: Vec<u8>,
    expected: usize,
    toggle: bool,
}

/// An FoE read being served.
struct FoeReadState {
    data: Vec<u8>,
    offset: usize,
    packet: u32,
}

/// An FoE write being received.
struct FoeWriteState {
    file_name: String,
    data: Vec<u8>,
}

pub struct SimSubDevice {
    /// Flat ESC address space: registers below 0x1000, SM memory above.
    pub space: Vec<u8>,
    pub eeprom: Vec<u8>,
    /// SII data register contents after the last read operation.
    sii_data: [u8; 4],
    /// Pending mailbox response, already framed.
    tx_mailbox: Option<Vec<u8>>,
    /// CoE object dictionary: values by (index, subindex).
    pub objects: HashMap<(u16, u8), Vec<u8>>,
    upload: Option<UploadState>,
    download: Option<DownloadState>,
    /// FoE file store.
    pub files: HashMap<String, Vec<u8>>,
    foe_read: Option<FoeReadState>,
    foe_write: Option<FoeWriteState>,
    /// Reset register byte sequence progress.
    reset_progress: usize,
    pub reset_count: u32,
}

impl SimSubDevice {
    pub fn new(config: &SimConfig) -> Self {
        let mut space = vec![0u8; SPACE_SIZE];

        // Base info: type, revision, build, 8 FMMUs, 8 SMs, RAM, ports, features (no DC)
        space[0x0000] = 0x11;
        space[0x0002] = 0x02;
        space[0x0004] = 8;
        space[0x0005] = 8;
        space[0x0006] = 1;
        space[0x0007] = 0x0f;

        // DL status: PDI operational, links on ports 0 and 1
        space[0x0110] = 0b0011_0011;

        // AL status: INIT
        space[0x0130] = 0x01;

        let mut objects = HashMap::new();

        // Identity object mirrors the EEPROM
        objects.insert((0x1018, 1), config.vendor_id.to_le_bytes().to_vec());
        objects.insert((0x1018, 2), config.product_id.to_le_bytes().to_vec());

        // Device name: long enough to exercise segmented uploads
        objects.insert((0x1008, 0), b"SIM2004 simulated terminal".to_vec());

        // Empty default PDO assignments
        objects.insert((0x1c12, 0), vec![0]);
        objects.insert((0x1c13, 0), vec![0]);

        Self {
            space,
            eeprom: build_eeprom(config),
            sii_data: [0; 4],
            tx_mailbox: None,
            objects,
            upload: None,
            download: None,
            files: HashMap::new(),
            foe_read: None,
            foe_write: None,
            reset_progress: 0,
            reset_count: 0,
        }
    }

    pub fn station_address(&self) -> u16 {
        u16::from_le_bytes([self.space[0x0010], self.space[0x0011]])
    }

    pub fn al_state(&self) -> u8 {
        self.space[0x0130] & 0x0f
    }

    fn read(&mut self, offset: u16, out: &mut [u8]) {
        let offset = usize::from(offset);

        // Mailbox-full bit in SM1's status register
        self.space[0x080d] = if self.tx_mailbox.is_some() { 0x08 } else { 0x00 };

        // SII data register
        self.space[0x0508..0x050c].copy_from_slice(&self.sii_data);

        if offset == usize::from(MBX_TX_OFFSET) && out.len() >= usize::from(MBX_TX_SIZE) {
            if let Some(response) = self.tx_mailbox.take() {
                let mut framed = vec![0u8; usize::from(MBX_TX_SIZE)];

                framed[..response.len()].copy_from_slice(&response);

                out[..framed.len()].copy_from_slice(&framed);

                return;
            }
        }

        let end = (offset + out.len()).min(SPACE_SIZE);

        if offset < end {
            out[..end - offset].copy_from_slice(&self.space[offset..end]);
        }
    }

    fn write(&mut self, offset: u16, data: &[u8]) {
        let offset_usize = usize::from(offset);

        let end = (offset_usize + data.len()).min(SPACE_SIZE);

        if offset_usize < end {
            self.space[offset_usize..end].copy_from_slice(&data[..end - offset_usize]);
        }

        match offset {
            // AL control: accept every state change immediately
            0x0120 => {
                let requested = data[0] & 0x0f;

                self.space[0x0130] = requested;
            }
            // ESC reset sequence
            0x0040 => {
                const SEQUENCE: &[u8] = b"RES";

                if data[0] == SEQUENCE[self.reset_progress] {
                    self.reset_progress += 1;

                    if self.reset_progress == SEQUENCE.len() {
                        self.reset_progress = 0;
                        self.reset_count += 1;
                        self.space[0x0130] = 0x01;
                    }
                } else {
                    self.reset_progress = 0;
                }
            }
            // SII control/address/data
            0x0502 => {
                let op = data[1] & 0x03;

                if op == 0x01 && data.len() >= 4 {
                    // Read two words
                    let address = usize::from(u16::from_le_bytes([data[2], data[3]])) * 2;

                    let mut value = [0u8; 4];

                    for (i, byte) in value.iter_mut().enumerate() {
                        *byte = self.eeprom.get(address + i).copied().unwrap_or(0xff);
                    }

                    self.sii_data = value;
                } else if op == 0x02 && data.len() >= 8 {
                    // Write one word
                    let address = usize::from(u16::from_le_bytes([data[2], data[3]])) * 2;

                    if address + 2 <= self.eeprom.len() {
                        self.eeprom[address..address + 2].copy_from_slice(&data[6..8]);
                    }
                }

                // Never busy, never in error
                self.space[0x0502] = 0;
                self.space[0x0503] = 0;
            }
            _ if offset == MBX_RX_OFFSET => {
                self.on_mailbox_request(data.to_vec());
            }
            _ => (),
        }
    }

    /// Handle a mailbox frame written into the RX window.
    fn on_mailbox_request(&mut self, raw: Vec<u8>) {
        let length = usize::from(u16::from_le_bytes([raw[0], raw[1]]));
        let mailbox_type = raw[5] & 0x0f;

        let Some(body) = raw.get(6..6 + length) else {
            return;
        };

        let body = body.to_vec();

        match mailbox_type {
            0x03 => self.on_coe(&body),
            0x04 => self.on_foe(&body),
            _ => (),
        }
    }

    fn mailbox_response(&mut self, mailbox_type: u8, body: &[u8]) {
        let mut frame = vec![0u8; 6 + body.len()];

        frame[0..2].copy_from_slice(&(body.len() as u16).to_le_bytes());
        frame[5] = mailbox_type;
        frame[6..].copy_from_slice(body);

        self.tx_mailbox = Some(frame);
    }

    fn sdo_abort(&mut self, index: u16, sub_index: u8, code: u32) {
        let mut body = vec![0u8; 10];

        body[1] = 0x30; // SDO response service
        body[2] = 0x80; // abort
        body[3..5].copy_from_slice(&index.to_le_bytes());
        body[5] = sub_index;
        body[6..10].copy_from_slice(&code.to_le_bytes());

        self.mailbox_response(0x03, &body);
    }

    fn on_coe(&mut self, body: &[u8]) {
        let service = body[1] >> 4;

        // Only SDO requests are modelled
        if service != 0x02 {
            return;
        }

        let command_byte = body[2];
        let command = command_byte >> 5;

        match command {
            // Upload request
            0x02 => {
                let index = u16::from_le_bytes([body[3], body[4]]);
                let sub_index = body[5];

                let Some(value) = self.objects.get(&(index, sub_index)).cloned() else {
                    self.sdo_abort(index, sub_index, 0x0602_0000);

                    return;
                };

                if value.len() <= 4 {
                    let mut response = vec![0u8; 10];

                    response[1] = 0x30;
                    response[2] = 0x43 | ((4 - value.len() as u8) << 2);
                    response[3..5].copy_from_slice(&index.to_le_bytes());
                    response[5] = sub_index;
                    response[6..6 + value.len()].copy_from_slice(&value);

                    self.mailbox_response(0x03, &response);
                } else {
                    // Normal upload: complete size plus the first chunk
                    let capacity = usize::from(MBX_TX_SIZE) - 6 - 10;

                    let first = value.len().min(capacity);

                    let mut response = vec![0u8; 10 + first];

                    response[1] = 0x30;
                    response[2] = 0x41;
                    response[3..5].copy_from_slice(&index.to_le_bytes());
                    response[5] = sub_index;
                    response[6..10].copy_from_slice(&(value.len() as u32).to_le_bytes());
                    response[10..].copy_from_slice(&value[..first]);

                    self.upload = Some(UploadState {
                        remaining: value[first..].to_vec(),
                        toggle: false,
                    });

                    self.mailbox_response(0x03, &response);
                }
            }
            // Upload segment request
            0x03 => {
                let toggle = command_byte & 0x10 != 0;

                let Some(upload) = self.upload.as_mut() else {
                    self.sdo_abort(0, 0, 0x0800_0000);

                    return;
                };

                if toggle != upload.toggle {
                    self.sdo_abort(0, 0, 0x0503_0000);

                    return;
                }

                let capacity = usize::from(MBX_TX_SIZE) - 6 - 3;

                let chunk_len = upload.remaining.len().min(capacity);
                let chunk: Vec<u8> = upload.remaining.drain(..chunk_len).collect();
                let is_last = upload.remaining.is_empty();

                upload.toggle = !upload.toggle;

                let padded = chunk.len().max(7);

                let mut response = vec![0u8; 3 + padded];

                response[1] = 0x30;
                // Segment response: command 0, toggle echo, pad count, last flag
                response[2] = (toggle as u8) << 4
                    | ((padded - chunk.len()) as u8) << 1
                    | is_last as u8;
                response[3..3 + chunk.len()].copy_from_slice(&chunk);

                if is_last {
                    self.upload = None;
                }

                self.mailbox_response(0x03, &response);
            }
            // Download request
            0x01 => {
                let flags = command_byte;
                let index = u16::from_le_bytes([body[3], body[4]]);
                let sub_index = body[5];

                if flags & 0x02 != 0 {
                    // Expedited: 1-4 bytes inline
                    let len = 4 - usize::from((flags >> 2) & 0x03);

                    let value = body[6..6 + len].to_vec();

                    self.objects.insert((index, sub_index), value);

                    self.download_response(index, sub_index);
                } else {
                    // Normal: complete size then data
                    let expected =
                        u32::from_le_bytes([body[6], body[7], body[8], body[9]]) as usize;

                    let data = body[10..].to_vec();

                    if data.len() >= expected {
                        self.objects
                            .insert((index, sub_index), data[..expected].to_vec());

                        self.download_response(index, sub_index);
                    } else {
                        self.download = Some(DownloadState {
                            index,
                            sub_index,
                            data,
                            expected,
                            toggle: false,
                        });

                        self.download_response(index, sub_index);
                    }
                }
            }
            // Download segment request
            0x00 => {
                let toggle = command_byte & 0x10 != 0;
                let is_last = command_byte & 0x01 != 0;
                let pad = usize::from((command_byte >> 1) & 0x07);

                let Some(download) = self.download.as_mut() else {
                    self.sdo_abort(0, 0, 0x0800_0000);

                    return;
                };

                if toggle != download.toggle {
                    self.sdo_abort(0, 0, 0x0503_0000);

                    return;
                }

                download.toggle = !download.toggle;

                let payload = &body[3..];
                let data_len = if payload.len() <= 7 {
                    payload.len() - pad
                } else {
                    payload.len()
                };

                download.data.extend_from_slice(&payload[..data_len]);

                let mut response = vec![0u8; 10];

                response[1] = 0x30;
                response[2] = 0x20 | (toggle as u8) << 4;

                if is_last {
                    let download = self.download.take().expect("checked above");

                    let mut data = download.data;
                    data.truncate(download.expected);

                    self.objects.insert((download.index, download.sub_index), data);
                }

                self.mailbox_response(0x03, &response);
            }
            _ => self.sdo_abort(0, 0, 0x0504_0001),
        }
    }

    fn download_response(&mut self, index: u16, sub_index: u8) {
        let mut response = vec![0u8; 10];

        response[1] = 0x30;
        response[2] = 0x60;
        response[3..5].copy_from_slice(&index.to_le_bytes());
        response[5] = sub_index;

        self.mailbox_response(0x03, &response);
    }

    fn foe_error(&mut self, code: u32) {
        let mut body = vec![0u8; 6];

        body[0] = 0x05;
        body[2..6].copy_from_slice(&code.to_le_bytes());

        self.mailbox_response(0x04, &body);
    }

    fn foe_block_size() -> usize {
        usize::from(MBX_TX_SIZE) - 12
    }

    fn on_foe(&mut self, body: &[u8]) {
        let opcode = body[0];
        let value = u32::from_le_bytes([body[2], body[3], body[4], body[5]]);
        let payload = &body[6..];

        match opcode {
            // RRQ
            0x01 => {
                let file_name = String::from_utf8_lossy(payload).to_string();

                let Some(data) = self.files.get(&file_name).cloned() else {
                    self.foe_error(0x8001);

                    return;
                };

                self.foe_read = Some(FoeReadState {
                    data,
                    offset: 0,
                    packet: 0,
                });

                self.send_foe_data();
            }
            // WRQ
            0x02 => {
                let file_name = String::from_utf8_lossy(payload).to_string();

                self.foe_write = Some(FoeWriteState {
                    file_name,
                    data: Vec::new(),
                });

                self.foe_ack(0);
            }
            // DATA
            0x03 => {
                let Some(write) = self.foe_write.as_mut() else {
                    self.foe_error(0x8002);

                    return;
                };

                write.data.extend_from_slice(payload);

                let finished = payload.len() < Self::foe_block_size();

                self.foe_ack(value);

                if finished {
                    let write = self.foe_write.take().expect("checked above");

                    self.files.insert(write.file_name, write.data);
                }
            }
            // ACK of a DATA we served
            0x04 => {
                if self.foe_read.is_some() {
                    self.send_foe_data();
                }
            }
            _ => self.foe_error(0x8003),
        }
    }

    fn foe_ack(&mut self, packet: u32) {
        let mut body = vec![0u8; 6];

        body[0] = 0x04;
        body[2..6].copy_from_slice(&packet.to_le_bytes());

        self.mailbox_response(0x04, &body);
    }

    fn send_foe_data(&mut self) {
        let block = Self::foe_block_size();

        let Some(read) = self.foe_read.as_mut() else {
            return;
        };

        let chunk_len = (read.data.len() - read.offset).min(block);
        let chunk = read.data[read.offset..read.offset + chunk_len].to_vec();

        read.offset += chunk_len;
        read.packet += 1;

        let packet = read.packet;

        if chunk_len < block {
            self.foe_read = None;
        }

        let mut body = vec![0u8; 6 + chunk.len()];

        body[0] = 0x03;
        body[2..6].copy_from_slice(&packet.to_le_bytes());
        body[6..].copy_from_slice(&chunk);

        self.mailbox_response(0x04, &body);
    }

    /// Apply a logical read/write against this SubDevice's enabled FMMUs.
    ///
    /// Returns the working counter increment.
    fn logical_access(&mut self, logical: u32, payload: &mut [u8]) -> u16 {
        let mut increment = 0;

        for entry in 0..16usize {
            let base = 0x0600 + entry * 16;

            let raw: [u8; 16] = self.space[base..base + 16].try_into().expect("16 bytes");

            let enabled = raw[12] & 0x01 != 0;

            if !enabled {
                continue;
            }

            let fmmu_logical = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            let length = usize::from(u16::from_le_bytes([raw[4], raw[5]]));
            let physical = usize::from(u16::from_le_bytes([raw[8], raw[9]]));
            let read_enable = raw[11] & 0x01 != 0;
            let write_enable = raw[11] & 0x02 != 0;

            // Overlap of the PDU's window with this FMMU's window
            let pdu_start = logical as usize;
            let pdu_end = pdu_start + payload.len();
            let fmmu_start = fmmu_logical as usize;
            let fmmu_end = fmmu_start + length;

            let start = pdu_start.max(fmmu_start);
            let end = pdu_end.min(fmmu_end);

            if start >= end {
                continue;
            }

            let len = end - start;
            let payload_off = start - pdu_start;
            let physical_off = physical + (start - fmmu_start);

            if read_enable {
                payload[payload_off..payload_off + len]
                    .copy_from_slice(&self.space[physical_off..physical_off + len]);

                increment += 1;
            }

            if write_enable {
                self.space[physical_off..physical_off + len]
                    .copy_from_slice(&payload[payload_off..payload_off + len]);

                increment += 2;
            }
        }

        increment
    }
}

struct BusInner {
    slaves: Vec<SimSubDevice>,
    /// Frames waiting to be received by the MainDevice.
    pending: VecDeque<Vec<u8>>,
}

/// Shared handle so tests can inspect and mutate the simulated segment.
#[derive(Clone)]
pub struct BusHandle {
    inner: Arc<Mutex<BusInner>>,
}

impl BusHandle {
    /// Run a closure against one simulated SubDevice.
    pub fn with_slave<T>(&self, position: usize, f: impl FnOnce(&mut SimSubDevice) -> T) -> T {
        let mut inner = self.inner.lock().unwrap();

        f(&mut inner.slaves[position])
    }
}

/// The simulated segment, to be handed to `MainDevice::new`.
pub struct SimBus {
    inner: Arc<Mutex<BusInner>>,
}

impl SimBus {
    pub fn new(configs: &[SimConfig]) -> (Box<dyn EthernetDevice>, BusHandle) {
        let inner = Arc::new(Mutex::new(BusInner {
            slaves: configs.iter().map(SimSubDevice::new).collect(),
            pending: VecDeque::new(),
        }));

        (
            Box::new(SimBus {
                inner: Arc::clone(&inner),
            }),
            BusHandle { inner },
        )
    }
}

/// A started MainDevice bound to a simulated segment, with short timings for tests.
pub fn master_with(configs: &[SimConfig]) -> (etherweave::MainDevice, BusHandle) {
    let _ = env_logger::builder().is_test(true).try_init();

    let (device, handle) = SimBus::new(configs);

    let mut master = etherweave::MainDevice::new(
        device,
        etherweave::MainDeviceConfig {
            send_interval: std::time::Duration::from_micros(50),
            pdu_timeout: std::time::Duration::from_millis(10),
            ..etherweave::MainDeviceConfig::default()
        },
    );

    master.start().expect("spawn idle thread");

    (master, handle)
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: std::time::Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;

    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }

        std::thread::sleep(std::time::Duration::from_millis(1));
    }

    condition()
}

impl EthernetDevice for SimBus {
    fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();

        let mut response = frame.to_vec();

        // Mark the response as returned by the first SubDevice (U/L bit)
        response[6] = 0x12;

        // EtherCAT payload starts after the Ethernet header
        let payload = &mut response[14..];

        let declared = usize::from(u16::from_le_bytes([payload[0], payload[1]]) & 0x07ff);

        let mut offset = 2;
        let end = 2 + declared;

        while offset + 12 <= end {
            let command = payload[offset];
            let address = [
                payload[offset + 2],
                payload[offset + 3],
                payload[offset + 4],
                payload[offset + 5],
            ];
            let len = usize::from(
                u16::from_le_bytes([payload[offset + 6], payload[offset + 7]]) & 0x07ff,
            );
            let more_follows = payload[offset + 7] & 0x80 != 0;

            let data_start = offset + 10;
            let wkc_at = data_start + len;

            let mut wkc = 0u16;

            {
                let BusInner { slaves, .. } = &mut *inner;

                let data = &mut payload[data_start..wkc_at];

                let position_of = |address: [u8; 4]| -> usize {
                    u16::from_le_bytes([address[0], address[1]]).wrapping_neg() as usize
                };

                let station_of = |address: [u8; 4]| -> u16 {
                    u16::from_le_bytes([address[0], address[1]])
                };

                let register = u16::from_le_bytes([address[2], address[3]]);

                match command {
                    // APRD / APWR
                    0x01 | 0x02 => {
                        let position = position_of(address);

                        if let Some(slave) = slaves.get_mut(position) {
                            if command == 0x01 {
                                slave.read(register, data);
                            } else {
                                slave.write(register, &data.to_vec());
                            }

                            wkc += 1;
                        }
                    }
                    // FPRD / FPWR
                    0x04 | 0x05 => {
                        let station = station_of(address);

                        for slave in slaves.iter_mut() {
                            if slave.station_address() == station {
                                if command == 0x04 {
                                    slave.read(register, data);
                                } else {
                                    slave.write(register, &data.to_vec());
                                }

                                wkc += 1;
                            }
                        }
                    }
                    // BRD: OR of all SubDevices
                    0x07 => {
                        let mut combined = vec![0u8; data.len()];

                        for slave in slaves.iter_mut() {
                            let mut scratch = vec![0u8; data.len()];

                            slave.read(register, &mut scratch);

                            for (acc, byte) in combined.iter_mut().zip(scratch.iter()) {
                                *acc |= byte;
                            }

                            wkc += 1;
                        }

                        data.copy_from_slice(&combined);
                    }
                    // BWR
                    0x08 => {
                        let written = data.to_vec();

                        for slave in slaves.iter_mut() {
                            slave.write(register, &written);

                            wkc += 1;
                        }
                    }
                    // LRD / LWR / LRW
                    0x0a | 0x0b | 0x0c => {
                        let logical = u32::from_le_bytes(address);

                        for slave in slaves.iter_mut() {
                            wkc += slave.logical_access(logical, data);
                        }
                    }
                    // ARMW
                    0x0d => {
                        let position = position_of(address);

                        let mut value = vec![0u8; data.len()];

                        if let Some(slave) = slaves.get_mut(position) {
                            slave.read(register, &mut value);

                            wkc += 1;

                            data.copy_from_slice(&value);
                        }

                        for (other_position, slave) in slaves.iter_mut().enumerate() {
                            if other_position != position {
                                slave.write(register, &value);

                                wkc += 1;
                            }
                        }
                    }
                    // FRMW
                    0x0e => {
                        let station = station_of(address);

                        let mut value = vec![0u8; data.len()];
                        let mut found = false;

                        for slave in slaves.iter_mut() {
                            if slave.station_address() == station {
                                slave.read(register, &mut value);

                                found = true;
                                wkc += 1;
                            }
                        }

                        if found {
                            data.copy_from_slice(&value);

                            for slave in slaves.iter_mut() {
                                if slave.station_address() != station {
                                    slave.write(register, &value);

                                    wkc += 1;
                                }
                            }
                        }
                    }
                    _ => (),
                }
            }

            payload[wkc_at..wkc_at + 2].copy_from_slice(&wkc.to_le_bytes());

            offset = wkc_at + 2;

            if !more_follows {
                break;
            }
        }

        inner.pending.push_back(response);

        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<Option<usize>, Error> {
        let mut inner = self.inner.lock().unwrap();

        let Some(frame) = inner.pending.pop_front() else {
            return Ok(None);
        };

        buf[..frame.len()].copy_from_slice(&frame);

        Ok(Some(frame.len()))
    }
}
