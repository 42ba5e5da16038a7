/// AL (Application Layer) Status Code.
///
/// Read from register `0x0134` when a SubDevice refuses a requested state change.
///
/// Defined in ETG1000.6 Table 11.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u16)]
pub enum AlStatusCode {
    /// No error
    NoError = 0x0000,
    /// Unspecified error
    UnspecifiedError = 0x0001,
    /// No Memory
    NoMemory = 0x0002,
    /// Invalid Device Setup
    InvalidDeviceSetup = 0x0003,
    /// Reserved due to compatibility reasons
    CompatibilityReserved = 0x0005,
    /// Invalid requested state change
    InvalidRequestedStateChange = 0x0011,
    /// Unknown requested state
    UnknownRequestedState = 0x0012,
    /// Bootstrap not supported
    BootstrapNotSupported = 0x0013,
    /// No valid firmware
    NoValidFirmware = 0x0014,
    /// Invalid mailbox configuration (BOOT state)
    InvalidMailboxConfiguration = 0x0015,
    /// Invalid mailbox configuration (PREOP state)
    InvalidMailboxConfiguration2 = 0x0016,
    /// Invalid sync manager configuration
    InvalidSyncManagerConfiguration = 0x0017,
    /// No valid inputs available
    NoValidInputsAvailable = 0x0018,
    /// No valid outputs
    NoValidOutputs = 0x0019,
    /// Synchronization error
    SynchronizationError = 0x001A,
    /// Sync manager watchdog
    SyncManagerWatchdog = 0x001B,
    /// Invalid Sync Manager Types
    InvalidSyncManagerTypes = 0x001C,
    /// Invalid Output Configuration
    InvalidOutputConfiguration = 0x001D,
    /// Invalid Input Configuration
    InvalidInputConfiguration = 0x001E,
    /// Invalid Watchdog Configuration
    InvalidWatchdogConfiguration = 0x001F,
    /// SubDevice needs cold start
    SubDeviceNeedsColdStart = 0x0020,
    /// SubDevice needs INIT
    SubDeviceNeedsInit = 0x0021,
    /// SubDevice needs PREOP
    SubDeviceNeedsPreop = 0x0022,
    /// SubDevice needs SAFEOP
    SubDeviceNeedsSafeop = 0x0023,
    /// Invalid Input Mapping
    InvalidInputMapping = 0x0024,
    /// Invalid Output Mapping
    InvalidOutputMapping = 0x0025,
    /// Inconsistent Settings
    InconsistentSettings = 0x0026,
    /// FreeRun not supported
    FreeRunNotSupported = 0x0027,
    /// SyncMode not supported
    SyncModeNotSupported = 0x0028,
    /// FreeRun needs 3 Buffer Mode
    FreeRunNeeds3BufferMode = 0x0029,
    /// Background Watchdog
    BackgroundWatchdog = 0x002A,
    /// No Valid Inputs and Outputs
    NoValidInputsAndOutputs = 0x002B,
    /// Fatal Sync Error
    FatalSyncError = 0x002C,
    /// No Sync Error
    NoSyncError = 0x002D,
    /// Invalid DC SYNC Configuration
    InvalidDcSyncConfiguration = 0x0030,
    /// Invalid DC Latch Configuration
    InvalidDcLatchConfiguration = 0x0031,
    /// PLL Error
    PllError = 0x0032,
    /// DC Sync IO Error
    DcSyncIoError = 0x0033,
    /// DC Sync Timeout Error
    DcSyncTimeoutError = 0x0034,
    /// DC Invalid Sync Cycle Time
    DcInvalidSyncCycleTime = 0x0035,
    /// DC Sync0 Cycle Time
    DcSync0CycleTime = 0x0036,
    /// DC Sync1 Cycle Time
    DcSync1CycleTime = 0x0037,
    /// MBX_AOE
    MbxAoe = 0x0041,
    /// MBX_EOE
    MbxEoe = 0x0042,
    /// MBX_COE
    MbxCoe = 0x0043,
    /// MBX_FOE
    MbxFoe = 0x0044,
    /// MBX_SOE
    MbxSoe = 0x0045,
    /// MBX_VOE
    MbxVoe = 0x004F,
    /// EEPROM no access
    EepromNoAccess = 0x0050,
    /// EEPROM Error
    EepromError = 0x0051,
    /// SubDevice restarted locally
    SubDeviceRestartedLocally = 0x0060,
    /// Device Identification value updated
    DeviceIdentificationValueUpdated = 0x0061,
    /// Application controller available
    ApplicationControllerAvailable = 0x00F0,
    /// Unknown code.
    #[wire(catch_all)]
    Unknown(u16),
}

impl core::fmt::Display for AlStatusCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Self::NoError => "No error",
            Self::UnspecifiedError => "Unspecified error",
            Self::NoMemory => "No memory",
            Self::InvalidDeviceSetup => "Invalid device setup",
            Self::CompatibilityReserved => "Reserved due to compatibility reasons",
            Self::InvalidRequestedStateChange => "Invalid requested state change",
            Self::UnknownRequestedState => "Unknown requested state",
            Self::BootstrapNotSupported => "Bootstrap not supported",
            Self::NoValidFirmware => "No valid firmware",
            Self::InvalidMailboxConfiguration => "Invalid mailbox configuration (BOOT state)",
            Self::InvalidMailboxConfiguration2 => "Invalid mailbox configuration (PREOP state)",
            Self::InvalidSyncManagerConfiguration => "Invalid sync manager configuration",
            Self::NoValidInputsAvailable => "No valid inputs available",
            Self::NoValidOutputs => "No valid outputs",
            Self::SynchronizationError => "Synchronization error",
            Self::SyncManagerWatchdog => "Sync manager watchdog",
            Self::InvalidSyncManagerTypes => "Invalid sync manager types",
            Self::InvalidOutputConfiguration => "Invalid output configuration",
            Self::InvalidInputConfiguration => "Invalid input configuration",
            Self::InvalidWatchdogConfiguration => "Invalid watchdog configuration",
            Self::SubDeviceNeedsColdStart => "SubDevice needs cold start",
            Self::SubDeviceNeedsInit => "SubDevice needs INIT",
            Self::SubDeviceNeedsPreop => "SubDevice needs PREOP",
            Self::SubDeviceNeedsSafeop => "SubDevice needs SAFEOP",
            Self::InvalidInputMapping => "Invalid input mapping",
            Self::InvalidOutputMapping => "Invalid output mapping",
            Self::InconsistentSettings => "Inconsistent settings",
            Self::FreeRunNotSupported => "FreeRun not supported",
            Self::SyncModeNotSupported => "SyncMode not supported",
            Self::FreeRunNeeds3BufferMode => "FreeRun needs 3 buffer mode",
            Self::BackgroundWatchdog => "Background watchdog",
            Self::NoValidInputsAndOutputs => "No valid inputs and outputs",
            Self::FatalSyncError => "Fatal sync error",
            Self::NoSyncError => "No sync error",
            Self::InvalidDcSyncConfiguration => "Invalid DC SYNC configuration",
            Self::InvalidDcLatchConfiguration => "Invalid DC latch configuration",
            Self::PllError => "PLL error",
            Self::DcSyncIoError => "DC sync IO error",
            Self::DcSyncTimeoutError => "DC sync timeout error",
            Self::DcInvalidSyncCycleTime => "DC invalid sync cycle time",
            Self::DcSync0CycleTime => "DC Sync0 cycle time",
            Self::DcSync1CycleTime => "DC Sync1 cycle time",
            Self::MbxAoe => "MBX_AOE",
            Self::MbxEoe => "MBX_EOE",
            Self::MbxCoe => "MBX_COE",
            Self::MbxFoe => "MBX_FOE",
            Self::MbxSoe => "MBX_SOE",
            Self::MbxVoe => "MBX_VOE",
            Self::EepromNoAccess => "EEPROM no access",
            Self::EepromError => "EEPROM error",
            Self::SubDeviceRestartedLocally => "SubDevice restarted locally",
            Self::DeviceIdentificationValueUpdated => "Device identification value updated",
            Self::ApplicationControllerAvailable => "Application controller available",
            Self::Unknown(raw) => return write!(f, "Unknown ({:#06x})", raw),
        };

        f.write_str(s)
    }
}
