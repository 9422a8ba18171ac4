//! SWD line driver for MPSSE-mode FTDI bridges.
//!
//! Encodes [`IoSequence`](super::sequence::IoSequence) frames into MPSSE
//! command streams: data is clocked out LSB-first on the falling edge and
//! sampled on the rising edge, with GPIO writes flipping the SWDIO direction
//! at every bus turnaround. Captured reply bits are collected per command and
//! reassembled into the frame's input bit positions.

use bitvec::prelude::*;

use crate::arm::{ArmError, DapError, PortType, SwdTransactions};
use crate::probe::sequence::{
    self, abandon_sequence, read_data_sequence, request_sequence, write_data_sequence, Ack,
    IoSequence,
};
use crate::probe::{BridgeConfig, ProbeError, Transport};

/// Clock data bytes out, LSB-first, on the falling edge.
const CLOCK_BYTES_OUT: u8 = 0x19;
/// Clock up to 8 data bits out, LSB-first, on the falling edge.
const CLOCK_BITS_OUT: u8 = 0x1B;
/// Clock data bytes in, LSB-first, sampled on the rising edge.
const CLOCK_BYTES_IN: u8 = 0x28;
/// Clock up to 8 data bits in, LSB-first, sampled on the rising edge.
const CLOCK_BITS_IN: u8 = 0x2A;
/// Write level and direction of the low GPIO byte.
const SET_BITS_LOW: u8 = 0x80;
/// Flush the bridge's reply buffer back to the host.
const SEND_IMMEDIATE: u8 = 0x87;

/// Idle low cycles after every write transaction so the DP latches the
/// write before the next header.
const IDLE_CYCLES_AFTER_WRITE: usize = 8;

/// An SWD driver bit-banging through an MPSSE byte channel.
pub struct MpsseSwd<T: Transport> {
    transport: T,
    config: &'static BridgeConfig,
    /// Whether the host currently owns the SWDIO line.
    swdio_driven: bool,
    reset_asserted: bool,
}

impl<T: Transport> MpsseSwd<T> {
    pub fn new(transport: T, config: &'static BridgeConfig) -> Self {
        Self {
            transport,
            config,
            swdio_driven: false,
            reset_asserted: false,
        }
    }

    /// Opens the driver over a configured bridge: enters MPSSE mode and sets
    /// up clocking and pins. The SWD wake-up sequence itself is driven by
    /// the debug port layer through [`SwdTransactions::line_reset`].
    pub fn open(transport: T, config: &'static BridgeConfig) -> Result<Self, ArmError> {
        let mut swd = Self::new(transport, config);
        swd.transport.configure()?;
        swd.swdio_driven = true;
        Ok(swd)
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn drive_cmd(&self, driven: bool) -> [u8; 3] {
        [
            SET_BITS_LOW,
            self.config.levels(self.reset_asserted),
            self.config.directions(driven),
        ]
    }

    /// Appends the MPSSE encoding of `seq` to `cmds`, recording the captured
    /// bit count of every expected reply byte in `reply_bits`.
    fn encode(&mut self, seq: &IoSequence, cmds: &mut Vec<u8>, reply_bits: &mut Vec<usize>) {
        let io = seq.io_bits();
        let dir = seq.direction_bits();

        let mut start = 0;
        while start < io.len() {
            let driven = dir[start];
            let mut end = start;
            while end < io.len() && dir[end] == driven {
                end += 1;
            }
            let run = &io[start..end];

            if driven != self.swdio_driven {
                cmds.extend_from_slice(&self.drive_cmd(driven));
                self.swdio_driven = driven;
            }

            if driven {
                let full_bytes = run.len() / 8;
                if full_bytes > 0 {
                    let len = (full_bytes - 1) as u16;
                    cmds.push(CLOCK_BYTES_OUT);
                    cmds.extend_from_slice(&len.to_le_bytes());
                    for chunk in run[..full_bytes * 8].chunks(8) {
                        cmds.push(bits_to_byte(chunk));
                    }
                }
                let rest = &run[full_bytes * 8..];
                if !rest.is_empty() {
                    cmds.push(CLOCK_BITS_OUT);
                    cmds.push((rest.len() - 1) as u8);
                    cmds.push(bits_to_byte(rest));
                }
            } else {
                let full_bytes = run.len() / 8;
                if full_bytes > 0 {
                    let len = (full_bytes - 1) as u16;
                    cmds.push(CLOCK_BYTES_IN);
                    cmds.extend_from_slice(&len.to_le_bytes());
                    reply_bits.extend(std::iter::repeat(8).take(full_bytes));
                }
                let rest = run.len() % 8;
                if rest > 0 {
                    cmds.push(CLOCK_BITS_IN);
                    cmds.push((rest - 1) as u8);
                    reply_bits.push(rest);
                }
            }

            start = end;
        }
    }

    /// Sends a frame and returns its captured input bits in frame order.
    fn exchange(&mut self, seq: &IoSequence) -> Result<Vec<bool>, ProbeError> {
        let mut cmds = Vec::new();
        let mut reply_bits = Vec::new();
        self.encode(seq, &mut cmds, &mut reply_bits);
        cmds.push(SEND_IMMEDIATE);

        self.transport.write_bytes(&cmds)?;

        let mut reply = vec![0u8; reply_bits.len()];
        self.transport.read_bytes(&mut reply)?;

        let mut in_bits: BitVec<u8, Lsb0> = BitVec::with_capacity(seq.input_bit_len());
        for (byte, count) in reply.into_iter().zip(reply_bits) {
            // Bit reads accumulate into the top of the byte, first bit lowest.
            let bits = byte >> (8 - count);
            in_bits.extend_from_bitslice(&bits.view_bits::<Lsb0>()[..count]);
        }

        Ok(in_bits.iter().by_vals().collect())
    }

    /// Runs one full transaction: request phase, ACK decision, then the
    /// matching data phase.
    fn transfer(
        &mut self,
        port: PortType,
        read: bool,
        address: u8,
        value: u32,
    ) -> Result<u32, ArmError> {
        let request = request_sequence(port, read, address);
        let bits = self.exchange(&request)?;
        let ack = sequence::parse_ack(&bits);
        tracing::trace!("{port:?} a={address:#x} read={read} ack={ack:?}");

        match ack {
            Ack::Ok if read => {
                let bits = self.exchange(&read_data_sequence())?;
                Ok(sequence::parse_read_data(&bits)?)
            }
            Ack::Ok => {
                self.exchange(&write_data_sequence(value, IDLE_CYCLES_AFTER_WRITE))?;
                Ok(0)
            }
            Ack::Wait => {
                self.exchange(&abandon_sequence(IDLE_CYCLES_AFTER_WRITE))?;
                Err(DapError::WaitResponse.into())
            }
            Ack::Fault => {
                self.exchange(&abandon_sequence(IDLE_CYCLES_AFTER_WRITE))?;
                Err(DapError::FaultResponse.into())
            }
            Ack::NoResponse => {
                self.exchange(&abandon_sequence(IDLE_CYCLES_AFTER_WRITE))?;
                Err(DapError::NoAcknowledge.into())
            }
        }
    }
}

impl<T: Transport> SwdTransactions for MpsseSwd<T> {
    fn raw_read_register(&mut self, port: PortType, address: u8) -> Result<u32, ArmError> {
        self.transfer(port, true, address, 0)
    }

    fn raw_write_register(
        &mut self,
        port: PortType,
        address: u8,
        value: u32,
    ) -> Result<(), ArmError> {
        self.transfer(port, false, address, value)?;
        Ok(())
    }

    fn line_reset(&mut self) -> Result<u32, ArmError> {
        tracing::debug!("performing SWD line reset");

        let mut seq = IoSequence::new();
        // SWDIO high for at least 50 clocks.
        for _ in 0..56 {
            seq.add_output(true);
        }
        // JTAG-to-SWD select pattern, LSB-first: 0111 1001 1110 0111 on the
        // wire (bytes 0x9E 0xE7).
        for i in 0..16 {
            seq.add_output((0xE79Eu16 >> i) & 1 == 1);
        }
        for _ in 0..56 {
            seq.add_output(true);
        }
        // At least two idle low cycles before the first header.
        for _ in 0..8 {
            seq.add_output(false);
        }
        self.exchange(&seq)?;

        // The first transaction after a line reset must read DP.IDCODE.
        self.raw_read_register(PortType::DebugPort, 0x0)
    }

    fn enter_reset(&mut self) -> Result<(), ArmError> {
        self.reset_asserted = true;
        self.transport.assert_reset()?;
        Ok(())
    }

    fn leave_reset(&mut self) -> Result<(), ArmError> {
        self.reset_asserted = false;
        self.transport.release_reset()?;
        Ok(())
    }
}

fn bits_to_byte(bits: &[bool]) -> u8 {
    debug_assert!(bits.len() <= 8);
    bits.iter()
        .enumerate()
        .fold(0, |byte, (offset, bit)| byte | (u8::from(*bit) << offset))
}
