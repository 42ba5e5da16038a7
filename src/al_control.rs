use crate::subdevice_state::SubDeviceState;

/// The AL control word for an individual SubDevice.
///
/// Written to register `0x0120`. Defined in ETG1000.6 Table 9 - AL Control Description.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 2)]
pub struct AlControl {
    /// Requested state.
    #[wire(bits = 4)]
    pub state: SubDeviceState,
    /// Error acknowledge flag.
    #[wire(bits = 1)]
    pub acknowledge: bool,
    /// ID request flag.
    #[wire(bits = 1, post_skip = 10)]
    pub id_request: bool,
}

impl AlControl {
    /// Request a state change.
    pub fn new(state: SubDeviceState) -> Self {
        Self {
            state,
            acknowledge: false,
            id_request: false,
        }
    }

    /// Re-request a state with the acknowledge bit set to clear a refused change.
    pub fn acknowledge(state: SubDeviceState) -> Self {
        Self {
            state,
            acknowledge: true,
            id_request: false,
        }
    }
}

/// The AL status word for an individual SubDevice.
///
/// Read from register `0x0130`. Defined in ETG1000.6 Table 10 - AL Status Description.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 2)]
pub struct AlStatus {
    /// Current state.
    #[wire(bits = 4)]
    pub state: SubDeviceState,
    /// The last requested change was refused; the code register at `0x0134` holds the reason.
    #[wire(bits = 1)]
    pub error: bool,
    /// Device identification value is loaded.
    #[wire(bits = 1, post_skip = 10)]
    pub id_loaded: bool,
}
