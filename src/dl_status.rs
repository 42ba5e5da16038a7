/// DL status word, read from register `0x0110`.
///
/// Defined in ETG1000.4 Table 34.
#[derive(Debug, Default, Copy, Clone, PartialEq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 2)]
pub struct DlStatus {
    /// PDI is operational.
    #[wire(bits = 1)]
    pub pdi_operational: bool,
    /// The DL user watchdog has not expired.
    #[wire(bits = 1)]
    pub watchdog_ok: bool,
    #[wire(bits = 1, post_skip = 1)]
    pub extended_link_detection: bool,
    // reserved1
    /// True if port 0 has a physical link present.
    #[wire(bits = 1)]
    pub link_port0: bool,
    /// True if port 1 has a physical link present.
    #[wire(bits = 1)]
    pub link_port1: bool,
    /// True if port 2 has a physical link present.
    #[wire(bits = 1)]
    pub link_port2: bool,
    /// True if port 3 has a physical link present.
    #[wire(bits = 1)]
    pub link_port3: bool,

    /// True if port 0 forwards to itself (i.e. loopback).
    #[wire(bits = 1)]
    pub loopback_port0: bool,
    /// RX signal detected on port 0.
    #[wire(bits = 1)]
    pub signal_port0: bool,
    /// True if port 1 forwards to itself (i.e. loopback).
    #[wire(bits = 1)]
    pub loopback_port1: bool,
    /// RX signal detected on port 1.
    #[wire(bits = 1)]
    pub signal_port1: bool,
    /// True if port 2 forwards to itself (i.e. loopback).
    #[wire(bits = 1)]
    pub loopback_port2: bool,
    /// RX signal detected on port 2.
    #[wire(bits = 1)]
    pub signal_port2: bool,
    /// True if port 3 forwards to itself (i.e. loopback).
    #[wire(bits = 1)]
    pub loopback_port3: bool,
    /// RX signal detected on port 3.
    #[wire(bits = 1)]
    pub signal_port3: bool,
}

impl DlStatus {
    /// Whether the port at `index` forwards frames onward to another SubDevice.
    pub fn port_open(&self, index: u8) -> bool {
        match index {
            0 => self.link_port0 && !self.loopback_port0,
            1 => self.link_port1 && !self.loopback_port1,
            2 => self.link_port2 && !self.loopback_port2,
            3 => self.link_port3 && !self.loopback_port3,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::EtherCrabWireRead;

    #[test]
    fn decode_two_port_device() {
        // PDI operational, watchdog ok, links on ports 0/1, loopback on ports 2/3
        let raw = [0b0011_0011u8, 0b0101_0000];

        let status = DlStatus::unpack_from_slice(&raw).unwrap();

        assert!(status.pdi_operational);
        assert!(status.link_port0);
        assert!(status.link_port1);
        assert!(!status.link_port2);
        assert!(status.port_open(0));
        assert!(!status.port_open(2));
    }
}
