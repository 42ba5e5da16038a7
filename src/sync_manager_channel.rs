//! Sync manager channel register image.

use core::fmt;

/// Sync manager channel.
///
/// Defined in ETG1000.4 6.7.2. One of these occupies each 8-byte slot in the SM register region
/// starting at `0x0800`.
#[derive(Default, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 8)]
pub struct SyncManagerChannel {
    #[wire(bytes = 2)]
    pub physical_start_address: u16,
    #[wire(bytes = 2)]
    pub length_bytes: u16,
    #[wire(bytes = 1)]
    pub control: Control,
    #[wire(bytes = 1)]
    pub status: Status,
    #[wire(bytes = 2)]
    pub enable: Enable,
}

impl SyncManagerChannel {
    /// A mailbox SM with the given direction, as synthesised from the SII mailbox geometry.
    pub fn mailbox(physical_start_address: u16, length_bytes: u16, direction: Direction) -> Self {
        Self {
            physical_start_address,
            length_bytes,
            control: Control {
                operation_mode: OperationMode::Mailbox,
                direction,
                dls_user_event_enable: true,
                ..Default::default()
            },
            status: Status::default(),
            enable: Enable {
                enable: true,
                ..Default::default()
            },
        }
    }

    /// A buffered (process data) SM.
    pub fn process_data(
        physical_start_address: u16,
        length_bytes: u16,
        direction: Direction,
        watchdog_enable: bool,
    ) -> Self {
        Self {
            physical_start_address,
            length_bytes,
            control: Control {
                operation_mode: OperationMode::Normal,
                direction,
                watchdog_enable,
                ..Default::default()
            },
            status: Status::default(),
            enable: Enable {
                // A zero length channel must stay disabled or some ESCs refuse SAFEOP
                enable: length_bytes > 0,
                ..Default::default()
            },
        }
    }
}

impl fmt::Debug for SyncManagerChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyncManagerChannel")
            .field(
                "physical_start_address",
                &format_args!("{:#06x}", self.physical_start_address),
            )
            .field(
                "length_bytes",
                &format_args!("{:#06x} ({})", self.length_bytes, self.length_bytes),
            )
            .field("control", &self.control)
            .field("status", &self.status)
            .field("enable", &self.enable)
            .finish()
    }
}

impl fmt::Display for SyncManagerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "start {:#06x}, size {:#06x} ({}), direction {:?}, mode {:?}, {}",
            self.physical_start_address,
            self.length_bytes,
            self.length_bytes,
            self.control.direction,
            self.control.operation_mode,
            if self.enable.enable {
                "enabled"
            } else {
                "disabled"
            },
        ))
    }
}

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 1)]
pub struct Control {
    #[wire(bits = 2)]
    pub operation_mode: OperationMode,
    #[wire(bits = 2)]
    pub direction: Direction,
    #[wire(bits = 1)]
    pub ecat_event_enable: bool,
    #[wire(bits = 1)]
    pub dls_user_event_enable: bool,
    #[wire(bits = 1, post_skip = 1)]
    pub watchdog_enable: bool,
    // reserved1
}

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 1)]
pub struct Status {
    #[wire(bits = 1)]
    pub has_write_event: bool,
    #[wire(bits = 1, post_skip = 1)]
    pub has_read_event: bool,
    // reserved1
    /// A full mailbox is waiting to be read by the MainDevice.
    #[wire(bits = 1)]
    pub mailbox_full: bool,
    #[wire(bits = 2)]
    pub buffer_state: u8,
    #[wire(bits = 1)]
    pub read_buffer_open: bool,
    #[wire(bits = 1)]
    pub write_buffer_open: bool,
}

/// Described in ETG1000.4 6.7.2 Sync Manager Attributes.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 2)]
pub struct Enable {
    #[wire(bits = 1)]
    pub enable: bool,
    #[wire(bits = 1, post_skip = 4)]
    pub repeat: bool,
    // reserved4
    /// DC event 0 on EtherCAT writes.
    #[wire(bits = 1)]
    pub enable_dc_event_bus_write: bool,
    /// DC event 0 on local (PDI) writes.
    #[wire(bits = 1)]
    pub enable_dc_event_local_write: bool,
    // Second byte
    #[wire(bits = 1)]
    pub channel_pdi_disabled: bool,
    #[wire(bits = 1, post_skip = 6)]
    pub repeat_ack: bool,
    // reserved6
}

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u8)]
pub enum OperationMode {
    /// Buffered (triple buffered process data) mode.
    #[default]
    Normal = 0x00,
    /// Mailbox mode.
    Mailbox = 0x02,
}

/// Transfer direction as seen from the MainDevice.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u8)]
pub enum Direction {
    /// Inputs: the MainDevice reads from this channel.
    #[default]
    MainDeviceRead = 0x00,
    /// Outputs: the MainDevice writes into this channel.
    MainDeviceWrite = 0x01,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireSized, EtherCrabWireWriteSized};

    #[test]
    fn size() {
        assert_eq!(SyncManagerChannel::PACKED_LEN, 8);
    }

    #[test]
    fn decode_mailbox_sm() {
        // Taken from a LAN9252 mailbox configuration
        let raw = [
            // Start address
            0x00, 0x10, //
            // Length
            0x80, 0x00, //
            // Control
            0x26, //
            // Status
            0x00, //
            // Enable
            0x01, 0x00,
        ];

        let parsed = SyncManagerChannel::unpack_from_slice(&raw).unwrap();

        assert_eq!(
            parsed,
            SyncManagerChannel {
                physical_start_address: 0x1000,
                length_bytes: 0x0080,
                control: Control {
                    operation_mode: OperationMode::Mailbox,
                    direction: Direction::MainDeviceWrite,
                    ecat_event_enable: false,
                    dls_user_event_enable: true,
                    watchdog_enable: false,
                },
                status: Status::default(),
                enable: Enable {
                    enable: true,
                    ..Default::default()
                }
            }
        )
    }

    #[test]
    fn mailbox_constructor_round_trips() {
        let sm = SyncManagerChannel::mailbox(0x1000, 0x0080, Direction::MainDeviceWrite);

        let packed = sm.pack();

        assert_eq!(packed, [0x00, 0x10, 0x80, 0x00, 0x26, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn decode_mailbox_full() {
        let raw = [0x09];

        let parsed = Status::unpack_from_slice(&raw).unwrap();

        assert!(parsed.mailbox_full)
    }

    #[test]
    fn zero_length_pd_sm_disabled() {
        let sm = SyncManagerChannel::process_data(0x1100, 0, Direction::MainDeviceRead, false);

        assert!(!sm.enable.enable);
    }
}
