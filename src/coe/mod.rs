//! CAN application protocol over EtherCAT (CoE) headers and services.

pub mod abort_code;
pub(crate) mod fsm;
pub(crate) mod info;
pub(crate) mod services;

/// Defined in ETG1000.6 5.6.1 Table 29 – CoE elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 2)]
pub struct CoeHeader {
    /// Fragment counter, only used by SDO Information services.
    #[wire(bits = 9, post_skip = 3)]
    pub number: u16,
    #[wire(bits = 4)]
    pub service: CoeService,
}

impl CoeHeader {
    pub(crate) fn new(service: CoeService) -> Self {
        Self { number: 0, service }
    }
}

/// Defined in ETG1000.6 Table 29 – CoE elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u8)]
pub enum CoeService {
    /// Emergency.
    Emergency = 0x01,
    /// SDO Request.
    SdoRequest = 0x02,
    /// SDO Response.
    SdoResponse = 0x03,
    /// TxPDO.
    TxPdo = 0x04,
    /// RxPDO.
    RxPdo = 0x05,
    /// TxPDO remote request.
    TxPdoRemoteRequest = 0x06,
    /// RxPDO remote request.
    RxPdoRemoteRequest = 0x07,
    /// SDO Information.
    SdoInformation = 0x08,
}

/// Defined in ETG1000.6 Section 5.6.2.1.1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 1)]
pub struct InitSdoFlags {
    #[wire(bits = 1)]
    pub size_indicator: bool,
    #[wire(bits = 1)]
    pub expedited_transfer: bool,
    /// For expedited transfers, the number of unused bytes in the 4 byte data field.
    #[wire(bits = 2)]
    pub size: u8,
    #[wire(bits = 1)]
    pub complete_access: bool,
    #[wire(bits = 3)]
    pub command: u8,
}

impl InitSdoFlags {
    pub const DOWNLOAD_REQUEST: u8 = 0x01;
    pub const DOWNLOAD_RESPONSE: u8 = 0x03;
    pub const UPLOAD_REQUEST: u8 = 0x02;
    pub const UPLOAD_RESPONSE: u8 = 0x02;
    pub const ABORT_REQUEST: u8 = 0x04;
}

/// The four bytes shared by all non-segment SDO requests and responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 4)]
pub struct InitSdoHeader {
    #[wire(bytes = 1)]
    pub flags: InitSdoFlags,
    #[wire(bytes = 2)]
    pub index: u16,
    #[wire(bytes = 1)]
    pub sub_index: u8,
}

/// Defined in ETG1000.6 5.6.2.3.1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 1)]
pub struct SegmentSdoHeader {
    /// Last segment flag.
    #[wire(bits = 1)]
    pub is_last_segment: bool,

    /// The number of bytes of the minimum 7 byte segment area that do *not* contain data.
    ///
    /// Only meaningful for segments shorter than 7 bytes.
    #[wire(bits = 3)]
    pub segment_data_size: u8,

    /// Alternates between consecutive segments, starting clear.
    #[wire(bits = 1)]
    pub toggle: bool,

    #[wire(bits = 3)]
    pub command: u8,
}

impl SegmentSdoHeader {
    pub const DOWNLOAD_SEGMENT_REQUEST: u8 = 0x00;
    pub const DOWNLOAD_SEGMENT_RESPONSE: u8 = 0x01;
    pub const UPLOAD_SEGMENT_REQUEST: u8 = 0x03;
    pub const UPLOAD_SEGMENT_RESPONSE: u8 = 0x00;

    /// Minimum segment data area; shorter payloads are padded to this.
    pub const MIN_SEGMENT_DATA: usize = 7;
}
