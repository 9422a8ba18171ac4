//! SWD line-protocol frames, expressed as bit sequences.
//!
//! A transaction is assembled as an [`IoSequence`]: one entry per clock
//! period, recording both the SWDIO value (for host-driven periods) and
//! whether the host or the target owns the line. The MPSSE driver encodes
//! these sequences into bridge commands; keeping the frame layout separate
//! makes the protocol invariants testable without hardware.

use crate::arm::{DapError, PortType};

/// Three-bit target acknowledge, LSB-first on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Ok,
    Wait,
    Fault,
    /// All-ones or all-zeros: nothing drove the line.
    NoResponse,
}

impl Ack {
    pub fn from_bits(bits: [bool; 3]) -> Self {
        match bits {
            [true, false, false] => Ack::Ok,
            [false, true, false] => Ack::Wait,
            [false, false, true] => Ack::Fault,
            _ => Ack::NoResponse,
        }
    }
}

/// A bit sequence on the SWD bus.
///
/// `io` holds the value the host drives (meaningless for input periods);
/// `direction` is `true` where the host drives the line.
#[derive(Debug, Default, Clone)]
pub struct IoSequence {
    io: Vec<bool>,
    direction: Vec<bool>,
}

impl IoSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_output(&mut self, bit: bool) {
        self.io.push(bit);
        self.direction.push(true);
    }

    pub fn add_input(&mut self) {
        self.io.push(false);
        self.direction.push(false);
    }

    pub fn add_input_sequence(&mut self, length: usize) {
        for _ in 0..length {
            self.add_input();
        }
    }

    pub fn bit_len(&self) -> usize {
        self.io.len()
    }

    pub fn io_bits(&self) -> &[bool] {
        &self.io
    }

    pub fn direction_bits(&self) -> &[bool] {
        &self.direction
    }

    /// Number of target-driven periods, i.e. bits the bridge must capture.
    pub fn input_bit_len(&self) -> usize {
        self.direction.iter().filter(|driven| !**driven).count()
    }
}

/// The request phase of a transaction: eight header bits, one turnaround,
/// three ACK bits.
///
/// Header layout, LSB-first: Start(1), APnDP, RnW, A[2], A[3],
/// parity over the middle four, Stop(0), Park(1).
pub fn request_sequence(port: PortType, read: bool, address: u8) -> IoSequence {
    let ap_n_dp = port == PortType::AccessPort;
    let a2 = (address >> 2) & 1 == 1;
    let a3 = (address >> 3) & 1 == 1;

    let mut sequence = IoSequence::new();

    // Start bit.
    sequence.add_output(true);
    sequence.add_output(ap_n_dp);
    sequence.add_output(read);
    sequence.add_output(a2);
    sequence.add_output(a3);
    // Parity over APnDP, RnW, A[2], A[3].
    sequence.add_output(ap_n_dp ^ read ^ a2 ^ a3);
    // Stop bit.
    sequence.add_output(false);
    // Park bit.
    sequence.add_output(true);

    // Turnaround: host releases the line.
    sequence.add_input();
    // ACK bits.
    sequence.add_input_sequence(3);

    sequence
}

/// Data phase of a successful read: 32 data bits, parity, and the turnaround
/// that hands the line back to the host.
pub fn read_data_sequence() -> IoSequence {
    let mut sequence = IoSequence::new();
    sequence.add_input_sequence(32);
    // Parity bit.
    sequence.add_input();
    // Turnaround, host reclaims the line.
    sequence.add_input();
    sequence
}

/// Data phase of a successful write: turnaround, 32 data bits, parity, then
/// `idle_cycles` low periods so the DP can latch the write.
pub fn write_data_sequence(mut value: u32, idle_cycles: usize) -> IoSequence {
    let mut sequence = IoSequence::new();

    // Turnaround, host reclaims the line.
    sequence.add_input();

    let mut parity = false;
    for _ in 0..32 {
        let bit = value & 1 == 1;
        sequence.add_output(bit);
        parity ^= bit;
        value >>= 1;
    }
    sequence.add_output(parity);

    for _ in 0..idle_cycles {
        sequence.add_output(false);
    }

    sequence
}

/// Abandoned data phase after WAIT or FAULT: one turnaround to reclaim the
/// line, then idle cycles.
pub fn abandon_sequence(idle_cycles: usize) -> IoSequence {
    let mut sequence = IoSequence::new();
    sequence.add_input();
    for _ in 0..idle_cycles {
        sequence.add_output(false);
    }
    sequence
}

/// Parses the four captured request-phase bits (turnaround + ACK).
pub fn parse_ack(bits: &[bool]) -> Ack {
    debug_assert!(bits.len() >= 4);
    Ack::from_bits([bits[1], bits[2], bits[3]])
}

/// Parses the 34 captured read-phase bits into a value, checking even parity
/// over the 32 data bits.
pub fn parse_read_data(bits: &[bool]) -> Result<u32, DapError> {
    debug_assert!(bits.len() >= 33);

    let value = bits_to_u32(&bits[..32]);
    let parity = bits[32];

    if (value.count_ones() % 2 == 1) == parity {
        Ok(value)
    } else {
        Err(DapError::IncorrectParity)
    }
}

/// Folds LSB-first bits into a word.
pub fn bits_to_u32(bits: &[bool]) -> u32 {
    bits.iter()
        .take(32)
        .enumerate()
        .fold(0, |word, (offset, bit)| word | (u32::from(*bit) << offset))
}
