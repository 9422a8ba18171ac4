//! Cortex-M debug control block driver.
//!
//! Drives the DHCSR halt/resume machinery, the DCRSR/DCRDR core register
//! file protocol and the DFSR halt cause bits over a memory interface, for
//! M0/M3/M4-class cores.

use std::time::Duration;

use bitfield::bitfield;

use super::memory::{MemoryInterface, TargetPtr};
use super::ArmError;
use crate::util::with_retry;

/// Poll bound for S_HALT and the power-of-two friends.
const HALT_POLL_RETRIES: usize = 100;
const HALT_POLL_YIELD: Duration = Duration::from_millis(1);

/// Poll bound for the DCRSR/DCRDR transfer handshake.
const REGISTER_POLL_RETRIES: usize = 100;
const REGISTER_POLL_YIELD: Duration = Duration::from_micros(100);

/// A memory-mapped register in the system control space.
pub trait MemoryMappedRegister: From<u32> + Into<u32> {
    const ADDRESS: TargetPtr<u32>;
    const NAME: &'static str;
}

bitfield! {
    /// Debug Halting Control and Status Register.
    ///
    /// Writes take effect only with the debug key in the upper halfword; set
    /// it via [`Dhcsr::enable_write`].
    #[derive(Copy, Clone)]
    pub struct Dhcsr(u32);
    impl Debug;
    pub s_reset_st, _: 25;
    pub s_retire_st, _: 24;
    pub s_lockup, _: 19;
    pub s_sleep, _: 18;
    pub s_halt, _: 17;
    pub s_regrdy, _: 16;
    pub c_maskints, set_c_maskints: 3;
    pub c_step, set_c_step: 2;
    pub c_halt, set_c_halt: 1;
    pub c_debugen, set_c_debugen: 0;
}

impl Dhcsr {
    /// Places DBGKEY in bits [31:16]; without it the core ignores the write.
    pub fn enable_write(&mut self) {
        self.0 &= !(0xFFFF << 16);
        self.0 |= 0xA05F << 16;
    }
}

impl From<u32> for Dhcsr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Dhcsr> for u32 {
    fn from(value: Dhcsr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Dhcsr {
    const ADDRESS: TargetPtr<u32> = TargetPtr::new(0xE000_EDF0);
    const NAME: &'static str = "DHCSR";
}

bitfield! {
    /// Debug Core Register Selector Register.
    #[derive(Copy, Clone)]
    pub struct Dcrsr(u32);
    impl Debug;
    pub _, set_regwnr: 16;
    pub _, set_regsel: 4, 0;
}

impl From<u32> for Dcrsr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Dcrsr> for u32 {
    fn from(value: Dcrsr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Dcrsr {
    const ADDRESS: TargetPtr<u32> = TargetPtr::new(0xE000_EDF4);
    const NAME: &'static str = "DCRSR";
}

/// Debug Core Register Data Register.
#[derive(Debug, Copy, Clone)]
pub struct Dcrdr(pub u32);

impl From<u32> for Dcrdr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Dcrdr> for u32 {
    fn from(value: Dcrdr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Dcrdr {
    const ADDRESS: TargetPtr<u32> = TargetPtr::new(0xE000_EDF8);
    const NAME: &'static str = "DCRDR";
}

bitfield! {
    /// Debug Fault Status Register. All bits are sticky, write-one-to-clear.
    #[derive(Copy, Clone)]
    pub struct Dfsr(u32);
    impl Debug;
    pub external, _: 4;
    pub vcatch, _: 3;
    pub dwttrap, _: 2;
    pub bkpt, _: 1;
    pub halted, _: 0;
}

impl Dfsr {
    pub fn clear_all() -> Self {
        Dfsr(0x1F)
    }

    /// The cause mask; only bits [4:0] carry meaning.
    pub fn reason_bits(self) -> u32 {
        self.0 & 0x1F
    }

    pub fn halt_reason(self) -> HaltReason {
        match self.reason_bits() {
            0b00001 => HaltReason::Request,
            0b00010 => HaltReason::Breakpoint,
            0b00100 => HaltReason::Watchpoint,
            0b01000 => HaltReason::VectorCatch,
            0b10000 => HaltReason::External,
            0 => HaltReason::Unknown,
            _ => HaltReason::Multiple,
        }
    }
}

impl From<u32> for Dfsr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Dfsr> for u32 {
    fn from(value: Dfsr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Dfsr {
    const ADDRESS: TargetPtr<u32> = TargetPtr::new(0xE000_ED30);
    const NAME: &'static str = "DFSR";
}

bitfield! {
    /// Debug Exception and Monitor Control Register.
    #[derive(Copy, Clone)]
    pub struct Demcr(u32);
    impl Debug;
    pub trcena, set_trcena: 24;
    pub vc_harderr, set_vc_harderr: 10;
    pub vc_corereset, set_vc_corereset: 0;
}

impl From<u32> for Demcr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Demcr> for u32 {
    fn from(value: Demcr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Demcr {
    const ADDRESS: TargetPtr<u32> = TargetPtr::new(0xE000_EDFC);
    const NAME: &'static str = "DEMCR";
}

bitfield! {
    /// Application Interrupt and Reset Control Register. Writes require the
    /// vector key in bits [31:16], see [`Aircr::vectkey`].
    #[derive(Copy, Clone)]
    pub struct Aircr(u32);
    impl Debug;
    pub endianness, _: 15;
    pub sysresetreq, set_sysresetreq: 2;
    pub vectclractive, set_vectclractive: 1;
}

impl Aircr {
    pub fn vectkey(&mut self) {
        self.0 &= !(0xFFFF << 16);
        self.0 |= 0x05FA << 16;
    }
}

impl From<u32> for Aircr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Aircr> for u32 {
    fn from(value: Aircr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Aircr {
    const ADDRESS: TargetPtr<u32> = TargetPtr::new(0xE000_ED0C);
    const NAME: &'static str = "AIRCR";
}

/// A core register selector in DCRSR.REGSEL encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterId(pub u8);

impl RegisterId {
    pub const R0: Self = RegisterId(0);
    pub const R1: Self = RegisterId(1);
    pub const R2: Self = RegisterId(2);
    pub const R3: Self = RegisterId(3);
    pub const SP: Self = RegisterId(13);
    pub const LR: Self = RegisterId(14);
    pub const PC: Self = RegisterId(15);
    pub const XPSR: Self = RegisterId(16);
    pub const MSP: Self = RegisterId(17);
    pub const PSP: Self = RegisterId(18);
    /// CONTROL, FAULTMASK, BASEPRI and PRIMASK, packed in one transfer.
    pub const CFBP: Self = RegisterId(20);
}

/// Observed state of the target core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    Unknown,
    Running,
    Halted,
    /// Debug access denied by the target.
    LockedOut,
}

/// Why the core is halted, from DFSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// C_HALT request.
    Request,
    Breakpoint,
    Watchpoint,
    VectorCatch,
    External,
    Unknown,
    Multiple,
}

/// A Cortex-M target reached through a memory interface.
pub struct CortexM<M: MemoryInterface> {
    memory: M,
    state: CoreState,
}

impl<M: MemoryInterface> CortexM<M> {
    pub fn new(memory: M) -> Self {
        Self {
            memory,
            state: CoreState::Unknown,
        }
    }

    pub fn state(&self) -> CoreState {
        self.state
    }

    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    fn read_reg<R: MemoryMappedRegister>(&mut self) -> Result<R, ArmError> {
        Ok(R::from(self.memory.read_word(R::ADDRESS)?))
    }

    fn write_reg<R: MemoryMappedRegister>(&mut self, register: R) -> Result<(), ArmError> {
        self.memory.write_word(R::ADDRESS, register.into())
    }

    /// A sticky DP fault invalidates everything we believed about the core;
    /// only a `reset_state` recovers from that.
    fn track<T>(&mut self, result: Result<T, ArmError>) -> Result<T, ArmError> {
        if let Err(e) = &result {
            if e.is_sticky_fault() {
                self.state = CoreState::Unknown;
            }
        }
        result
    }

    /// Enables halting debug without disturbing the core's run state and
    /// records whether it is currently running or halted.
    pub fn initialize(&mut self) -> Result<(), ArmError> {
        let r = self.read_reg::<Dhcsr>();
        let current = self.track(r)?;

        let mut dhcsr = Dhcsr(0);
        dhcsr.set_c_debugen(true);
        dhcsr.set_c_maskints(false);
        // Clearing C_HALT on a halted core would resume it.
        dhcsr.set_c_halt(current.s_halt());
        dhcsr.enable_write();
        let r = self.write_reg(dhcsr);
        self.track(r)?;

        let r = self.read_reg::<Dhcsr>();
        let dhcsr = self.track(r)?;
        if !dhcsr.c_debugen() {
            tracing::warn!("C_DEBUGEN did not stick, target refuses debug access");
            self.state = CoreState::LockedOut;
            return Err(ArmError::LockedOut);
        }

        self.state = if dhcsr.s_halt() {
            CoreState::Halted
        } else {
            CoreState::Running
        };
        tracing::debug!("debug enabled, core {:?}", self.state);
        Ok(())
    }

    pub fn is_halted(&mut self) -> Result<bool, ArmError> {
        let r = self.read_reg::<Dhcsr>();
        let halted = self.track(r)?.s_halt();

        // Keep the cached state in sync with what the wire reports: the core
        // halts on its own on breakpoints and resumes are requests, not
        // guarantees.
        if self.state != CoreState::LockedOut {
            let observed = if halted {
                CoreState::Halted
            } else {
                CoreState::Running
            };
            if self.state != observed {
                tracing::trace!("core state {:?} -> {:?}", self.state, observed);
                self.state = observed;
            }
        }

        Ok(halted)
    }

    /// Requests a halt and waits for S_HALT.
    pub fn halt(&mut self) -> Result<(), ArmError> {
        let mut dhcsr = Dhcsr(0);
        dhcsr.set_c_debugen(true);
        dhcsr.set_c_halt(true);
        dhcsr.enable_write();
        let r = self.write_reg(dhcsr);
        self.track(r)?;

        let r = self.wait_for_halt();
        self.track(r)?;
        self.state = CoreState::Halted;
        Ok(())
    }

    /// Requests a run. No polling: the core may halt again immediately on a
    /// pending breakpoint.
    pub fn resume(&mut self) -> Result<(), ArmError> {
        let mut dhcsr = Dhcsr(0);
        dhcsr.set_c_debugen(true);
        dhcsr.enable_write();
        let r = self.write_reg(dhcsr);
        self.track(r)?;
        self.state = CoreState::Running;
        Ok(())
    }

    /// Executes one instruction and waits for the core to halt again.
    pub fn step(&mut self) -> Result<(), ArmError> {
        if self.state != CoreState::Halted {
            return Err(ArmError::CoreNotHalted);
        }

        let mut dhcsr = Dhcsr(0);
        dhcsr.set_c_debugen(true);
        dhcsr.set_c_step(true);
        dhcsr.enable_write();
        let r = self.write_reg(dhcsr);
        self.track(r)?;

        let r = self.wait_for_halt();
        self.track(r)
    }

    /// Reads and decodes the halt cause.
    pub fn halt_reason(&mut self) -> Result<HaltReason, ArmError> {
        let r = self.read_reg::<Dfsr>();
        Ok(self.track(r)?.halt_reason())
    }

    /// Clears the sticky DFSR cause bits.
    pub fn clear_halt_state(&mut self) -> Result<(), ArmError> {
        let r = self.write_reg(Dfsr::clear_all());
        self.track(r)
    }

    /// Reads a core register through DCRSR/DCRDR. Only legal while halted.
    pub fn read_core_reg(&mut self, register: RegisterId) -> Result<u32, ArmError> {
        if self.state != CoreState::Halted {
            return Err(ArmError::CoreNotHalted);
        }

        let mut dcrsr = Dcrsr(0);
        dcrsr.set_regwnr(false);
        dcrsr.set_regsel(u32::from(register.0));
        let r = self.write_reg(dcrsr);
        self.track(r)?;

        let r = self.wait_for_register_transfer();
        self.track(r)?;

        let r = self.read_reg::<Dcrdr>();
        Ok(self.track(r)?.0)
    }

    /// Writes a core register through DCRDR/DCRSR. Only legal while halted.
    pub fn write_core_reg(&mut self, register: RegisterId, value: u32) -> Result<(), ArmError> {
        if self.state != CoreState::Halted {
            return Err(ArmError::CoreNotHalted);
        }

        let r = self.write_reg(Dcrdr(value));
        self.track(r)?;

        let mut dcrsr = Dcrsr(0);
        dcrsr.set_regwnr(true);
        dcrsr.set_regsel(u32::from(register.0));
        let r = self.write_reg(dcrsr);
        self.track(r)?;

        let r = self.wait_for_register_transfer();
        self.track(r)
    }

    /// Resets the system through AIRCR with reset vector catch armed, so the
    /// core halts on the first instruction.
    pub fn reset_halt(&mut self) -> Result<(), ArmError> {
        let r = self.read_reg::<Demcr>();
        let mut demcr = self.track(r)?;
        demcr.set_vc_corereset(true);
        let r = self.write_reg(demcr);
        self.track(r)?;

        let mut aircr = Aircr(0);
        aircr.vectkey();
        aircr.set_sysresetreq(true);
        let r = self.write_reg(aircr);
        self.track(r)?;

        let r = self.wait_for_halt();
        self.track(r)?;
        self.state = CoreState::Halted;
        Ok(())
    }

    fn wait_for_halt(&mut self) -> Result<(), ArmError> {
        with_retry(
            HALT_POLL_RETRIES,
            HALT_POLL_YIELD,
            || {
                if self.read_reg::<Dhcsr>()?.s_halt() {
                    Ok(())
                } else {
                    Err(ArmError::Timeout)
                }
            },
            |e| matches!(e, ArmError::Timeout),
        )
    }

    fn wait_for_register_transfer(&mut self) -> Result<(), ArmError> {
        with_retry(
            REGISTER_POLL_RETRIES,
            REGISTER_POLL_YIELD,
            || {
                if self.read_reg::<Dhcsr>()?.s_regrdy() {
                    Ok(())
                } else {
                    Err(ArmError::Timeout)
                }
            },
            |e| matches!(e, ArmError::Timeout),
        )
    }

    // Memory operations, delegating to the MEM-AP (or whatever implements
    // the memory interface).

    pub fn read_word(&mut self, address: TargetPtr<u32>) -> Result<u32, ArmError> {
        let r = self.memory.read_word(address);
        self.track(r)
    }

    pub fn write_word(&mut self, address: TargetPtr<u32>, value: u32) -> Result<(), ArmError> {
        let r = self.memory.write_word(address, value);
        self.track(r)
    }

    pub fn read_halfword(&mut self, address: TargetPtr<u16>) -> Result<u16, ArmError> {
        let r = self.memory.read_halfword(address);
        self.track(r)
    }

    pub fn write_halfword(&mut self, address: TargetPtr<u16>, value: u16) -> Result<(), ArmError> {
        let r = self.memory.write_halfword(address, value);
        self.track(r)
    }

    pub fn read_byte(&mut self, address: TargetPtr<u8>) -> Result<u8, ArmError> {
        let r = self.memory.read_byte(address);
        self.track(r)
    }

    pub fn write_byte(&mut self, address: TargetPtr<u8>, value: u8) -> Result<(), ArmError> {
        let r = self.memory.write_byte(address, value);
        self.track(r)
    }

    pub fn read_block(
        &mut self,
        address: TargetPtr<u32>,
        values: &mut [u32],
    ) -> Result<(), ArmError> {
        let r = self.memory.read_block(address, values);
        self.track(r)
    }
}

impl<P: super::SwdTransactions> CortexM<super::memory::MemoryAp<P>> {
    /// Shortcut to the probe at the bottom of the stack, for reset pin
    /// control during bring-up.
    pub fn probe_mut(&mut self) -> &mut P {
        self.memory.dap_mut().probe_mut()
    }
}
