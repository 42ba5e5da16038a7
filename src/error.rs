//! Crate error types.

pub use crate::coe::abort_code::CoeAbortCode;
use crate::{al_status_code::AlStatusCode, subdevice_state::SubDeviceState};
use core::num::TryFromIntError;

/// Top level error type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// A low level error occurred when producing or consuming a PDU.
    Pdu(PduError),
    /// A working counter (WKC) error was encountered.
    WorkingCounter {
        /// The expected working counter value.
        expected: u16,
        /// The actual value received.
        received: u16,
    },
    /// Something timed out.
    Timeout,
    /// An EEPROM (SII) error was encountered.
    Eeprom(EepromError),
    /// A mailbox error was encountered.
    Mailbox(MailboxError),
    /// A FoE transfer failed.
    Foe(FoeError),
    /// Failed to send a frame over the network interface.
    SendFrame,
    /// Failed to receive a frame properly.
    ReceiveFrame,
    /// A string was too long to fit in a fixed size buffer.
    StringTooLong {
        /// The length of the fixed size buffer.
        max_length: usize,
        /// The length of the input string.
        string_length: usize,
    },
    /// A value may be too large or otherwise could not be converted into a target type.
    IntegerTypeConversion,
    /// An item in a list could not be found.
    NotFound {
        /// Item kind.
        item: Item,

        /// An index into a list of items.
        index: Option<usize>,
    },
    /// A registered PDO entry does not lie on a byte boundary and bit-granular registration was
    /// not requested.
    PdoEntryNotByteAligned {
        /// PDO entry index.
        index: u16,
        /// PDO entry subindex.
        sub_index: u8,
    },
    /// There is a problem with the discovered SubDevice topology.
    Topology,
    /// A SubDevice refused a requested state change.
    StateTransition(AlStatusCode),
    /// A SubDevice did not match the identity its configuration expects.
    UnexpectedSubDevice {
        /// Expected vendor ID.
        vendor_id: u32,
        /// Expected product ID.
        product_id: u32,
    },
    /// An invalid state was encountered.
    InvalidState {
        /// The desired state.
        expected: SubDeviceState,

        /// The actual state.
        actual: SubDeviceState,

        /// SubDevice configured station address.
        configured_address: u16,
    },
    /// The operation requires the MainDevice to be activated, or not activated.
    InvalidPhase,
    /// The SubDevice has latched an error and is skipped until the next rescan.
    SubDeviceFailed,
    /// A request was cancelled by its submitter before it was started.
    Cancelled,
    /// A distributed clock error occurred.
    DistributedClock(DistributedClockError),
    /// An error occurred encoding or decoding an item.
    Wire(ethercrab_wire::WireError),
    /// An internal error occurred. This indicates a bug.
    Internal,
}

impl std::error::Error for Error {}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Pdu(e) => write!(f, "pdu: {}", e),
            Error::WorkingCounter { expected, received } => {
                write!(f, "working counter expected {}, got {}", expected, received)
            }
            Error::Timeout => f.write_str("timeout"),
            Error::Eeprom(e) => write!(f, "eeprom: {}", e),
            Error::Mailbox(e) => write!(f, "mailbox: {}", e),
            Error::Foe(e) => write!(f, "foe: {}", e),
            Error::SendFrame => f.write_str("failed to send EtherCAT frame"),
            Error::ReceiveFrame => f.write_str("failed to receive an EtherCAT frame"),
            Error::StringTooLong {
                max_length,
                string_length,
            } => write!(
                f,
                "string of {} bytes is too long to fit in max storage of {} bytes",
                string_length, max_length
            ),
            Error::IntegerTypeConversion => write!(f, "failed to convert between integer types"),
            Error::NotFound { item, index } => {
                write!(f, "item kind {:?} not found (index: {:?})", item, index)
            }
            Error::PdoEntryNotByteAligned { index, sub_index } => write!(
                f,
                "PDO entry {:#06x}:{} does not byte-align",
                index, sub_index
            ),
            Error::Topology => f.write_str("topology"),
            Error::StateTransition(code) => {
                write!(f, "SubDevice refused state change: {}", code)
            }
            Error::UnexpectedSubDevice {
                vendor_id,
                product_id,
            } => write!(
                f,
                "SubDevice does not match expected identity {:#010x}:{:#010x}",
                vendor_id, product_id
            ),
            Error::InvalidState {
                expected,
                actual,
                configured_address,
            } => write!(
                f,
                "SubDevice {:#06x} state is invalid: {}, expected {}",
                configured_address, actual, expected
            ),
            Error::InvalidPhase => f.write_str("operation not valid in current phase"),
            Error::SubDeviceFailed => f.write_str("SubDevice has latched an error"),
            Error::Cancelled => f.write_str("request cancelled"),
            Error::DistributedClock(e) => write!(f, "distributed clock: {}", e),
            Error::Wire(e) => write!(f, "wire encode/decode error: {}", e),
            Error::Internal => f.write_str("internal error"),
        }
    }
}

/// The kind of item being looked for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Item {
    /// An EtherCAT SubDevice.
    SubDevice,
    /// A SubDevice configuration.
    SubDeviceConfig,
    /// Process Data Object.
    Pdo,
    /// A PDO entry.
    PdoEntry,
    /// Fieldbus Memory Management Unit.
    Fmmu,
    /// Sync Manager.
    SyncManager,
    /// A process data domain.
    Domain,
    /// A user request slot.
    Request,
    /// An object dictionary entry.
    DictionaryObject,
}

/// Low-level PDU error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PduError {
    /// Failed to decode raw PDU data into a given data type.
    Decode,
    /// Something went wrong when encoding/decoding the raw Ethernet II frame.
    Ethernet,
    /// PDU data is too long to fit in a single frame.
    TooLong,
    /// A received frame is invalid.
    Validation,
}

impl core::fmt::Display for PduError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PduError::Decode => f.write_str("failed to decode raw PDU data into type"),
            PduError::Ethernet => f.write_str("network"),
            PduError::TooLong => f.write_str("data is too long to fit in given buffer"),
            PduError::Validation => f.write_str("received PDU validation failed"),
        }
    }
}

/// Mailbox error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MailboxError {
    /// The mailbox operation was aborted.
    Aborted {
        /// Abort code.
        code: CoeAbortCode,
        /// The object index used in the operation.
        index: u16,
        /// The subindex used in the operation.
        sub_index: u8,
    },
    /// Mailbox data is too long to fit in the given type.
    TooLong {
        /// The object index used in the operation.
        index: u16,
        /// The subindex used in the operation.
        sub_index: u8,
    },
    /// A SubDevice has no mailbox but requires one for a given action.
    NoMailbox,
    /// The SubDevice does not support the requested mailbox protocol.
    UnsupportedProtocol,
    /// The response to a mailbox action is invalid.
    SdoResponseInvalid {
        /// The object index used in the operation.
        index: u16,
        /// The subindex used in the operation.
        sub_index: u8,
    },
    /// The mailbox never signalled a waiting response.
    NoResponse,
}

impl core::fmt::Display for MailboxError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MailboxError::Aborted {
                code,
                index,
                sub_index,
            } => write!(f, "{:#06x}:{} aborted: {}", index, sub_index, code),
            MailboxError::TooLong { index, sub_index } => {
                write!(f, "{:#06x}:{} returned data is too long", index, sub_index)
            }
            MailboxError::NoMailbox => f.write_str("device has no mailbox"),
            MailboxError::UnsupportedProtocol => {
                f.write_str("device does not support the requested mailbox protocol")
            }
            MailboxError::SdoResponseInvalid { index, sub_index } => write!(
                f,
                "{:#06x}:{} invalid response from device",
                index, sub_index
            ),
            MailboxError::NoResponse => f.write_str("no response in mailbox"),
        }
    }
}

/// EEPROM (SII) error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EepromError {
    /// Failed to decode data from EEPROM.
    Decode,
    /// The given category does not exist in the SubDevice's EEPROM.
    NoCategory,
    /// A category in the SubDevice's EEPROM overruns the image.
    SectionOverrun,
    /// The SII interface reported an access error or stayed busy past its budget.
    Access,
    /// An address is beyond the device's EEPROM size.
    AddressOutOfRange,
    /// The EEPROM is missing mandatory identity/mailbox words.
    TooShort,
}

impl core::fmt::Display for EepromError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EepromError::Decode => f.write_str("failed to decode data"),
            EepromError::NoCategory => f.write_str("category not found"),
            EepromError::SectionOverrun => f.write_str("category overruns EEPROM image"),
            EepromError::Access => f.write_str("SII access failed"),
            EepromError::AddressOutOfRange => f.write_str("address out of range"),
            EepromError::TooShort => f.write_str("EEPROM image too short"),
        }
    }
}

/// FoE transfer error: a typed status plus the 32-bit error code when the server sent one.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FoeError {
    /// What went wrong.
    pub status: crate::foe::FoeStatus,
    /// Error code from an explicit `ERROR` packet, zero otherwise.
    pub code: u32,
}

impl core::fmt::Display for FoeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?} (code {:#010x})", self.status, self.code)
    }
}

/// Distributed clock error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DistributedClockError {
    /// No DC system time reference SubDevice was found.
    NoReference,
}

impl core::fmt::Display for DistributedClockError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoReference => f.write_str("no DC reference SubDevice found"),
        }
    }
}

impl From<PduError> for Error {
    fn from(e: PduError) -> Self {
        Self::Pdu(e)
    }
}

impl From<EepromError> for Error {
    fn from(e: EepromError) -> Self {
        Self::Eeprom(e)
    }
}

impl From<MailboxError> for Error {
    fn from(e: MailboxError) -> Self {
        Self::Mailbox(e)
    }
}

impl From<FoeError> for Error {
    fn from(e: FoeError) -> Self {
        Self::Foe(e)
    }
}

impl From<DistributedClockError> for Error {
    fn from(e: DistributedClockError) -> Self {
        Self::DistributedClock(e)
    }
}

impl From<TryFromIntError> for Error {
    fn from(_e: TryFromIntError) -> Self {
        Self::IntegerTypeConversion
    }
}

impl From<ethercrab_wire::WireError> for Error {
    fn from(value: ethercrab_wire::WireError) -> Self {
        Self::Wire(value)
    }
}
