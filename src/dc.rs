//! Distributed clocks: propagation delay measurement, static offset sync and cyclic drift
//! compensation against a reference SubDevice.

use crate::{
    command::Command,
    error::{DistributedClockError, Error},
    fmt,
    pdu::Pdu,
    register::RegisterAddress,
};
use std::time::Instant;

/// Number of FRMW iterations used to pull SubDevice clocks in before cyclic operation.
const STATIC_SYNC_ITERATIONS: usize = 64;

/// MainDevice-side DC bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct DcSystem {
    /// Configured station address of the reference SubDevice (the first DC-capable one).
    pub reference: Option<u16>,
    /// Latest system time observed on the reference SubDevice.
    pub reference_time: u64,
    /// Whether the one-shot measurement and static sync have completed since the last rescan.
    pub synchronised: bool,
}

impl DcSystem {
    /// The drift compensation PDU distributed every cycle while DC is active: FRMW of the
    /// reference SubDevice's system time to all others.
    pub(crate) fn drift_pdu(&self) -> Option<Pdu> {
        let reference = self.reference?;

        Some(Pdu::read(
            Command::frmw(reference, RegisterAddress::DcSystemTime.into()),
            8,
        ))
    }
}

/// Per-SubDevice inputs for the measurement walk.
#[derive(Debug, Clone)]
pub(crate) struct DcPort {
    pub station: u16,
    /// Whether the downstream port (port 1) forwards to another SubDevice.
    pub downstream_open: bool,
    pub supports_dc: bool,
}

/// Result of the measurement for one SubDevice.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct DcMeasurement {
    pub receive_times: [u32; 4],
    pub propagation_delay: u32,
}

/// Outcome of one DC FSM step.
pub(crate) enum DcStep {
    /// Enqueue this PDU and call [`DcFsm::advance`] with the completed response.
    Send(Pdu),
    /// Measurement and static sync complete.
    Done {
        measurements: Vec<DcMeasurement>,
        reference_time: u64,
    },
}

#[derive(Copy, Clone)]
enum State {
    /// BWR of `0x0900`, latching the port receive times in every SubDevice.
    Latch,
    /// FPRD of the four port times per SubDevice.
    ReadTimes(usize),
    /// FPWR of the computed transmission delay per SubDevice.
    WriteDelays(usize),
    /// FPRD of the reference SubDevice's local time.
    ReadReferenceTime,
    /// FPRD of one SubDevice's local time, to compute its offset.
    ReadLocalTime(usize),
    /// FPWR of the system time offset of that SubDevice.
    WriteOffset(usize),
    /// FRMW iterations pulling all clocks toward the reference.
    StaticSync(usize),
}

/// The one-shot bus-wide DC setup: latch, measure, program delays and offsets, static sync.
pub(crate) struct DcFsm {
    ports: Vec<DcPort>,
    measurements: Vec<DcMeasurement>,
    state: State,
    slave_count: u16,
    reference: u16,
    reference_time: u64,
}

impl DcFsm {
    /// Start the measurement over the given ring, in ring order.
    ///
    /// Fails when no SubDevice supports DC.
    pub(crate) fn start(ports: Vec<DcPort>, slave_count: u16) -> Result<(Self, Pdu), Error> {
        let reference = ports
            .iter()
            .find(|port| port.supports_dc)
            .map(|port| port.station)
            .ok_or(Error::DistributedClock(DistributedClockError::NoReference))?;

        let measurements = vec![DcMeasurement::default(); ports.len()];

        // Any write latches the receive time of the latch register at every port
        let pdu = Pdu::write(
            Command::bwr(RegisterAddress::DcTimePort0.into()),
            vec![0u8; 4],
        );

        Ok((
            Self {
                ports,
                measurements,
                state: State::Latch,
                slave_count,
                reference,
                reference_time: 0,
            },
            pdu,
        ))
    }

    fn read_times_pdu(&self, position: usize) -> Pdu {
        Pdu::read(
            Command::fprd(
                self.ports[position].station,
                RegisterAddress::DcTimePort0.into(),
            ),
            16,
        )
    }

    /// Propagation delay of SubDevice `position`, from the loop times of it and its upstream
    /// neighbour.
    ///
    /// For a chain the delay is monotone along the ring: each hop adds half the difference
    /// of the two loop times.
    fn compute_delay(&mut self, position: usize) {
        if position == 0 {
            self.measurements[0].propagation_delay = 0;

            return;
        }

        let loop_time = |measurement: &DcMeasurement, port: &DcPort| -> u32 {
            if port.downstream_open {
                measurement.receive_times[1].wrapping_sub(measurement.receive_times[0])
            } else {
                0
            }
        };

        let parent = position - 1;

        let parent_loop = loop_time(&self.measurements[parent], &self.ports[parent]);
        let own_loop = loop_time(&self.measurements[position], &self.ports[position]);

        let hop = parent_loop.saturating_sub(own_loop) / 2;

        self.measurements[position].propagation_delay =
            self.measurements[parent].propagation_delay + hop;
    }

    /// Feed a completed PDU in, get the next one (or the results) out.
    pub(crate) fn advance(&mut self, response: Pdu, _now: Instant) -> Result<DcStep, Error> {
        match self.state {
            State::Latch => {
                response.check_wkc(self.slave_count)?;

                self.state = State::ReadTimes(0);

                Ok(DcStep::Send(self.read_times_pdu(0)))
            }
            State::ReadTimes(position) => {
                response.check_wkc(1)?;

                for (port, chunk) in response.data().chunks_exact(4).enumerate() {
                    self.measurements[position].receive_times[port] =
                        u32::from_le_bytes(chunk.try_into().expect("4 byte chunk"));
                }

                self.compute_delay(position);

                let next = position + 1;

                if next < self.ports.len() {
                    self.state = State::ReadTimes(next);

                    return Ok(DcStep::Send(self.read_times_pdu(next)));
                }

                self.state = State::WriteDelays(0);

                Ok(DcStep::Send(self.write_delay_pdu(0)))
            }
            State::WriteDelays(position) => {
                response.check_wkc(1)?;

                let next = position + 1;

                if next < self.ports.len() {
                    self.state = State::WriteDelays(next);

                    return Ok(DcStep::Send(self.write_delay_pdu(next)));
                }

                self.state = State::ReadReferenceTime;

                Ok(DcStep::Send(Pdu::read(
                    Command::fprd(self.reference, RegisterAddress::DcSystemTime.into()),
                    8,
                )))
            }
            State::ReadReferenceTime => {
                response.check_wkc(1)?;

                self.reference_time = u64::from_le_bytes(
                    response.data()[0..8].try_into().expect("8 byte read"),
                );

                match self.next_offset_target(0) {
                    Some(position) => {
                        self.state = State::ReadLocalTime(position);

                        Ok(DcStep::Send(self.read_local_time_pdu(position)))
                    }
                    None => self.enter_static_sync(),
                }
            }
            State::ReadLocalTime(position) => {
                response.check_wkc(1)?;

                let local = u64::from_le_bytes(
                    response.data()[0..8].try_into().expect("8 byte read"),
                );

                // System time offset per ETG1000.4: reference time minus local time, so every
                // DC unit converges on the reference epoch
                let offset = self
                    .reference_time
                    .wrapping_sub(local)
                    .wrapping_sub(u64::from(self.measurements[position].propagation_delay));

                self.state = State::WriteOffset(position);

                Ok(DcStep::Send(Pdu::write(
                    Command::fpwr(
                        self.ports[position].station,
                        RegisterAddress::DcSystemTimeOffset.into(),
                    ),
                    offset.to_le_bytes().to_vec(),
                )))
            }
            State::WriteOffset(position) => {
                response.check_wkc(1)?;

                match self.next_offset_target(position + 1) {
                    Some(next) => {
                        self.state = State::ReadLocalTime(next);

                        Ok(DcStep::Send(self.read_local_time_pdu(next)))
                    }
                    None => self.enter_static_sync(),
                }
            }
            State::StaticSync(iteration) => {
                // Working counter mismatches here only slow convergence; don't fail the walk
                if response.check_received().is_err() {
                    fmt::debug!("DC static sync iteration lost its frame");
                }

                if iteration + 1 < STATIC_SYNC_ITERATIONS {
                    self.state = State::StaticSync(iteration + 1);

                    return Ok(DcStep::Send(Pdu::read(
                        Command::frmw(self.reference, RegisterAddress::DcSystemTime.into()),
                        8,
                    )));
                }

                Ok(DcStep::Done {
                    measurements: core::mem::take(&mut self.measurements),
                    reference_time: self.reference_time,
                })
            }
        }
    }

    fn write_delay_pdu(&self, position: usize) -> Pdu {
        Pdu::write(
            Command::fpwr(
                self.ports[position].station,
                RegisterAddress::DcSystemTimeTransmissionDelay.into(),
            ),
            self.measurements[position]
                .propagation_delay
                .to_le_bytes()
                .to_vec(),
        )
    }

    fn read_local_time_pdu(&self, position: usize) -> Pdu {
        Pdu::read(
            Command::fprd(
                self.ports[position].station,
                RegisterAddress::DcSystemTime.into(),
            ),
            8,
        )
    }

    /// The next DC-capable SubDevice (excluding the reference) needing an offset, at or after
    /// `from`.
    fn next_offset_target(&self, from: usize) -> Option<usize> {
        (from..self.ports.len()).find(|position| {
            self.ports[*position].supports_dc && self.ports[*position].station != self.reference
        })
    }

    fn enter_static_sync(&mut self) -> Result<DcStep, Error> {
        self.state = State::StaticSync(0);

        Ok(DcStep::Send(Pdu::read(
            Command::frmw(self.reference, RegisterAddress::DcSystemTime.into()),
            8,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::PduState;

    fn complete(mut pdu: Pdu, data: &[u8], wkc: u16) -> Pdu {
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.working_counter = wkc;
        pdu.state = PduState::Received;
        pdu
    }

    fn two_slave_ports() -> Vec<DcPort> {
        vec![
            DcPort {
                station: 1,
                downstream_open: true,
                supports_dc: true,
            },
            DcPort {
                station: 2,
                downstream_open: false,
                supports_dc: true,
            },
        ]
    }

    #[test]
    fn no_dc_capable_subdevice_is_an_error() {
        let ports = vec![DcPort {
            station: 1,
            downstream_open: false,
            supports_dc: false,
        }];

        assert!(matches!(
            DcFsm::start(ports, 1).err(),
            Some(Error::DistributedClock(DistributedClockError::NoReference))
        ));
    }

    #[test]
    fn delays_are_monotone_along_the_ring() {
        let now = Instant::now();

        let (mut fsm, latch) = DcFsm::start(two_slave_ports(), 2).unwrap();

        assert_eq!(latch.command(), Command::bwr(0x0900));

        let read0 = match fsm.advance(complete(latch, &[0u8; 4], 2), now).unwrap() {
            DcStep::Send(pdu) => pdu,
            _ => panic!("expected port time read"),
        };

        // First SubDevice: port 0 at t=1000, port 1 at t=2000 (1000 ns loop downstream)
        let mut times = [0u8; 16];
        times[0..4].copy_from_slice(&1000u32.to_le_bytes());
        times[4..8].copy_from_slice(&2000u32.to_le_bytes());

        let read1 = match fsm.advance(complete(read0, &times, 1), now).unwrap() {
            DcStep::Send(pdu) => pdu,
            _ => panic!("expected second port time read"),
        };

        // Terminal SubDevice: loop time zero
        let times = [0u8; 16];

        let write0 = match fsm.advance(complete(read1, &times, 1), now).unwrap() {
            DcStep::Send(pdu) => pdu,
            _ => panic!("expected delay write"),
        };

        assert_eq!(write0.command(), Command::fpwr(1, 0x0928));
        assert_eq!(write0.data(), &0u32.to_le_bytes());

        let write1 = match fsm.advance(complete(write0, &[0u8; 4], 1), now).unwrap() {
            DcStep::Send(pdu) => pdu,
            _ => panic!("expected second delay write"),
        };

        // Half the upstream loop time
        assert_eq!(write1.data(), &500u32.to_le_bytes());
    }
}
