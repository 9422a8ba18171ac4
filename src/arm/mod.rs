//! ARM Debug Interface stack: debug port, access ports, memory access and
//! the Cortex-M core driver.

pub mod ap;
pub mod core;
pub mod dap;
pub mod dp;
pub mod memory;

#[cfg(test)]
pub(crate) mod mock;

use crate::probe::ProbeError;

/// The two register spaces reachable over SWD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortType {
    DebugPort,
    AccessPort,
}

/// An error in the communication with an access port or debug port.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum DapError {
    #[error("an error occurred in the SWD communication between probe and device")]
    SwdProtocol,
    #[error("target device did not respond to the request")]
    NoAcknowledge,
    #[error("target device responded with a FAULT response")]
    FaultResponse,
    #[error("target device responded with a WAIT response")]
    WaitResponse,
    #[error("incorrect parity on read request")]
    IncorrectParity,
}

/// Errors of the ARM debug stack.
#[derive(Debug, thiserror::Error)]
pub enum ArmError {
    #[error("probe transport failure")]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Dap(#[from] DapError),
    #[error("transaction still WAITed after {0} attempts")]
    WaitRetriesExhausted(usize),
    #[error("no target detected on the wire (IDCODE read {0:#010x})")]
    NoTarget(u32),
    #[error("operation timed out")]
    Timeout,
    #[error("operation requires a halted core")]
    CoreNotHalted,
    #[error("debug access denied by the target (core locked out)")]
    LockedOut,
    #[error("address {address:#010x} is not aligned to {alignment} bytes")]
    MemoryNotAligned { address: u32, alignment: u32 },
}

impl ArmError {
    /// Whether this error latched a sticky DP fault, invalidating everything
    /// the session believed about the target.
    pub fn is_sticky_fault(&self) -> bool {
        matches!(self, ArmError::Dap(DapError::FaultResponse))
    }
}

/// A typed register in the DP or AP register space.
pub trait Register: From<u32> + Into<u32> + Clone + Sized + std::fmt::Debug {
    /// Register address: A[3:2] as a byte address for DP registers, the byte
    /// offset within the register file for AP registers.
    const ADDRESS: u8;
    const NAME: &'static str;
}

/// The raw SWD transaction contract the DP/AP engine is built on.
///
/// One implementation drives real hardware through an MPSSE bridge; tests
/// substitute a scripted fake. WAIT and FAULT responses are surfaced
/// unretried so the engine above owns the retry and recovery policy.
pub trait SwdTransactions {
    /// Performs one read transaction. For AP reads this returns the posted
    /// value of the *previous* AP read.
    fn raw_read_register(&mut self, port: PortType, address: u8) -> Result<u32, ArmError>;

    /// Performs one write transaction.
    fn raw_write_register(
        &mut self,
        port: PortType,
        address: u8,
        value: u32,
    ) -> Result<(), ArmError>;

    /// Performs a line reset followed by the mandatory IDCODE read and
    /// returns its value.
    fn line_reset(&mut self) -> Result<u32, ArmError>;

    /// Asserts the target system reset pin.
    fn enter_reset(&mut self) -> Result<(), ArmError>;

    /// Releases the target system reset pin.
    fn leave_reset(&mut self) -> Result<(), ArmError>;
}
