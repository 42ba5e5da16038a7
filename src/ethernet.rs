//! Ethernet II framing and the NIC binding.
//!
//! The frame wrapper started life as a stripped-down copy of SmolTCP's `ethernet` wire module.

use crate::{
    ETHERCAT_ETHERTYPE, MAINDEVICE_ADDR,
    error::{Error, PduError},
    fmt,
    pdu::frame::MAX_ETHERCAT_PAYLOAD,
};
use core::fmt as core_fmt;
use std::time::Instant;

/// A six-octet Ethernet II address.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct EthernetAddress(pub [u8; 6]);

impl EthernetAddress {
    /// The broadcast address.
    pub const BROADCAST: EthernetAddress = EthernetAddress([0xff; 6]);

    /// Construct an Ethernet address from a sequence of octets, in big-endian.
    ///
    /// # Panics
    ///
    /// The function panics if `data` is not six octets long.
    pub fn from_bytes(data: &[u8]) -> EthernetAddress {
        let mut bytes = [0; 6];
        bytes.copy_from_slice(data);
        EthernetAddress(bytes)
    }

    /// Return an Ethernet address as a sequence of octets, in big-endian.
    pub const fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl core_fmt::Display for EthernetAddress {
    fn fmt(&self, f: &mut core_fmt::Formatter) -> core_fmt::Result {
        let bytes = self.0;
        write!(
            f,
            "{:02x}-{:02x}-{:02x}-{:02x}-{:02x}-{:02x}",
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
        )
    }
}

mod field {
    use core::ops::{Range, RangeFrom};

    pub const DESTINATION: Range<usize> = 0..6;
    pub const SOURCE: Range<usize> = 6..12;
    pub const ETHERTYPE: Range<usize> = 12..14;
    pub const PAYLOAD: RangeFrom<usize> = 14..;
}

/// The Ethernet header length.
pub const ETHERNET_HEADER_LEN: usize = field::PAYLOAD.start;

/// A read/write wrapper around an Ethernet II frame buffer.
#[derive(Debug, Clone)]
pub struct EthernetFrame<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> EthernetFrame<T> {
    /// Imbue a raw octet buffer with Ethernet frame structure.
    pub const fn new_unchecked(buffer: T) -> EthernetFrame<T> {
        EthernetFrame { buffer }
    }

    /// Check the buffer is long enough to hold a header, then wrap it.
    pub fn new_checked(buffer: T) -> Result<EthernetFrame<T>, Error> {
        if buffer.as_ref().len() < ETHERNET_HEADER_LEN {
            return Err(Error::Pdu(PduError::Ethernet));
        }

        Ok(Self::new_unchecked(buffer))
    }

    /// Return the length of a buffer required to hold a packet with the payload of a given
    /// length.
    pub const fn buffer_len(payload_len: usize) -> usize {
        ETHERNET_HEADER_LEN + payload_len
    }

    /// Return the destination address field.
    #[inline]
    pub fn dst_addr(&self) -> EthernetAddress {
        let data = self.buffer.as_ref();
        EthernetAddress::from_bytes(&data[field::DESTINATION])
    }

    /// Return the source address field.
    #[inline]
    pub fn src_addr(&self) -> EthernetAddress {
        let data = self.buffer.as_ref();
        EthernetAddress::from_bytes(&data[field::SOURCE])
    }

    /// Return the EtherType field, without checking for 802.1Q.
    #[inline]
    pub fn ethertype(&self) -> u16 {
        let data = self.buffer.as_ref();

        data.get(field::ETHERTYPE)
            .and_then(|raw| raw.try_into().ok())
            .map(u16::from_be_bytes)
            .unwrap_or(0)
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> EthernetFrame<&'a T> {
    /// Return a pointer to the payload, without checking for 802.1Q.
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        let data = self.buffer.as_ref();
        &data[field::PAYLOAD]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> EthernetFrame<T> {
    /// Set the destination address field.
    #[inline]
    pub fn set_dst_addr(&mut self, value: EthernetAddress) {
        let data = self.buffer.as_mut();
        data[field::DESTINATION].copy_from_slice(value.as_bytes())
    }

    /// Set the source address field.
    #[inline]
    pub fn set_src_addr(&mut self, value: EthernetAddress) {
        let data = self.buffer.as_mut();
        data[field::SOURCE].copy_from_slice(value.as_bytes())
    }

    /// Set the EtherType field.
    #[inline]
    pub fn set_ethertype(&mut self, value: u16) {
        let data = self.buffer.as_mut();

        data[field::ETHERTYPE].copy_from_slice(&value.to_be_bytes());
    }

    /// Return a mutable pointer to the payload.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let data = self.buffer.as_mut();
        &mut data[field::PAYLOAD]
    }
}

/// The NIC abstraction the MainDevice drives.
///
/// Both calls are non-blocking; the cyclic application calls
/// [`MainDevice::receive`](crate::MainDevice::receive) to drain pending frames and
/// [`MainDevice::send`](crate::MainDevice::send) to flush queued ones.
pub trait EthernetDevice: Send {
    /// Send one complete Ethernet frame.
    fn send(&mut self, frame: &[u8]) -> Result<(), Error>;

    /// Receive one complete Ethernet frame into `buf` if one is pending.
    ///
    /// Returns the frame length, or `None` when nothing is waiting.
    fn receive(&mut self, buf: &mut [u8]) -> Result<Option<usize>, Error>;

    /// Current physical link state.
    fn link_up(&self) -> bool {
        true
    }
}

/// TX/RX accounting for the bound NIC.
#[derive(Debug, Default, Copy, Clone)]
pub struct DeviceStats {
    /// Frames sent.
    pub tx_frames: u64,
    /// Frames received (EtherCAT only).
    pub rx_frames: u64,
    /// Bytes sent.
    pub tx_bytes: u64,
    /// Bytes received.
    pub rx_bytes: u64,
    /// Send failures.
    pub tx_errors: u64,
    /// Non-EtherCAT or self-originated frames skipped.
    pub rx_skipped: u64,
}

impl DeviceStats {
    /// Frames sent but (so far) unanswered. A persistently growing value indicates frame loss.
    pub fn loss(&self) -> i64 {
        self.tx_frames as i64 - self.rx_frames as i64
    }
}

/// Owns the NIC callbacks, the reusable TX buffer, the link state flag and TX/RX accounting.
pub(crate) struct NetworkDevice {
    device: Box<dyn EthernetDevice>,
    /// Reused frame to frame.
    tx_buf: Vec<u8>,
    rx_buf: Vec<u8>,
    link_up: bool,
    stats: DeviceStats,
    last_tx: Option<Instant>,
    last_rx: Option<Instant>,
}

impl NetworkDevice {
    pub(crate) fn new(device: Box<dyn EthernetDevice>) -> Self {
        let link_up = device.link_up();

        Self {
            device,
            tx_buf: vec![0u8; EthernetFrame::<&[u8]>::buffer_len(MAX_ETHERCAT_PAYLOAD)],
            rx_buf: vec![0u8; EthernetFrame::<&[u8]>::buffer_len(MAX_ETHERCAT_PAYLOAD)],
            link_up,
            stats: DeviceStats::default(),
            last_tx: None,
            last_rx: None,
        }
    }

    pub(crate) fn stats(&self) -> DeviceStats {
        self.stats
    }

    pub(crate) fn link_up(&self) -> bool {
        self.link_up
    }

    /// Wrap an EtherCAT payload in an Ethernet II frame and push it to the NIC.
    pub(crate) fn send_payload(&mut self, ethercat_payload: &[u8], now: Instant) -> Result<(), Error> {
        let frame_len = EthernetFrame::<&[u8]>::buffer_len(ethercat_payload.len());

        let mut frame = EthernetFrame::new_unchecked(&mut self.tx_buf[..frame_len]);

        frame.set_dst_addr(EthernetAddress::BROADCAST);
        frame.set_src_addr(MAINDEVICE_ADDR);
        frame.set_ethertype(ETHERCAT_ETHERTYPE);
        frame.payload_mut().copy_from_slice(ethercat_payload);

        self.device.send(&self.tx_buf[..frame_len]).inspect_err(|_| {
            self.stats.tx_errors += 1;
        })?;

        self.stats.tx_frames += 1;
        self.stats.tx_bytes += frame_len as u64;
        self.last_tx = Some(now);

        Ok(())
    }

    /// Drain the NIC, handing each EtherCAT frame payload to `handle`.
    ///
    /// Non-EtherCAT traffic and our own outgoing broadcasts are skipped. The first SubDevice
    /// sets the locally-administered bit of the source MAC when it returns a frame, so responses
    /// pass this filter.
    pub(crate) fn poll_receive(
        &mut self,
        now: Instant,
        mut handle: impl FnMut(&[u8]),
    ) -> Result<(), Error> {
        self.link_up = self.device.link_up();

        while let Some(len) = self.device.receive(&mut self.rx_buf)? {
            let Ok(frame) = EthernetFrame::new_checked(&self.rx_buf[..len]) else {
                self.stats.rx_skipped += 1;

                continue;
            };

            if frame.ethertype() != ETHERCAT_ETHERTYPE || frame.src_addr() == MAINDEVICE_ADDR {
                fmt::trace!("Ignoring non-EtherCAT frame");

                self.stats.rx_skipped += 1;

                continue;
            }

            self.stats.rx_frames += 1;
            self.stats.rx_bytes += len as u64;
            self.last_rx = Some(now);

            handle(EthernetFrame::new_unchecked(&self.rx_buf[..len]).payload());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct Loopback {
        sent: Vec<Vec<u8>>,
        pending: VecDeque<Vec<u8>>,
    }

    impl EthernetDevice for Loopback {
        fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
            self.sent.push(frame.to_vec());
            Ok(())
        }

        fn receive(&mut self, buf: &mut [u8]) -> Result<Option<usize>, Error> {
            let Some(frame) = self.pending.pop_front() else {
                return Ok(None);
            };

            buf[..frame.len()].copy_from_slice(&frame);

            Ok(Some(frame.len()))
        }
    }

    #[test]
    fn send_wraps_payload() {
        let mut device = NetworkDevice::new(Box::new(Loopback {
            sent: Vec::new(),
            pending: VecDeque::new(),
        }));

        let payload = [0xabu8; 46];

        device.send_payload(&payload, Instant::now()).unwrap();

        assert_eq!(device.stats().tx_frames, 1);
    }

    #[test]
    fn receive_filters_own_frames() {
        let mut own = vec![0u8; 60];
        {
            let mut frame = EthernetFrame::new_unchecked(own.as_mut_slice());
            frame.set_dst_addr(EthernetAddress::BROADCAST);
            frame.set_src_addr(MAINDEVICE_ADDR);
            frame.set_ethertype(ETHERCAT_ETHERTYPE);
        }

        let mut answered = own.clone();
        {
            let mut frame = EthernetFrame::new_unchecked(answered.as_mut_slice());
            // First SubDevice sets the U/L bit on the way back
            frame.set_src_addr(EthernetAddress([0x12, 0x10, 0x10, 0x10, 0x10, 0x10]));
        }

        let mut device = NetworkDevice::new(Box::new(Loopback {
            sent: Vec::new(),
            pending: VecDeque::from([own, answered]),
        }));

        let mut seen = 0;

        device
            .poll_receive(Instant::now(), |_| seen += 1)
            .unwrap();

        assert_eq!(seen, 1);
        assert_eq!(device.stats().rx_skipped, 1);
        assert_eq!(device.stats().rx_frames, 1);
    }
}
