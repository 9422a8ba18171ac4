//! Semihosting supervisor.
//!
//! Polls the target for halts, identifies `BKPT #0xAB` requests and services
//! them against a host console sink, then advances the target past the
//! breakpoint and resumes it.

use std::io::Write;
use std::time::Duration;

use crate::arm::core::{CortexM, Dfsr, HaltReason, MemoryMappedRegister, RegisterId};
use crate::arm::memory::{MemoryInterface, TargetPtr};
use crate::arm::ArmError;

/// Write one character to the debug console; the character is in the low
/// byte of the parameter.
pub const SYS_WRITEC: u32 = 0x03;
/// Report the target application's exit to the host.
pub const SYS_EXIT: u32 = 0x18;
/// SYS_EXIT reason meaning a normal application exit.
pub const ADP_STOPPED_APPLICATION_EXIT: u32 = 0x20026;

/// The 16-bit Thumb encoding of `BKPT #0xAB`.
const BKPT_SEMIHOSTING: u16 = 0xBEAB;

/// Pause between halt polls while the target runs.
const RUN_POLL_YIELD: Duration = Duration::from_millis(1);

#[derive(Debug, thiserror::Error)]
pub enum SemihostingError {
    #[error("processor halted for unexpected reason (DFSR {dfsr:#x})")]
    UnexpectedHaltReason { dfsr: u32 },
    #[error("unexpected non-semihosting breakpoint {instruction:#06x} at PC {pc:#010x}")]
    UnexpectedBreakpoint { instruction: u16, pc: u32 },
    #[error("unsupported semihosting operation {operation:#x} (parameter {parameter:#010x})")]
    UnsupportedOperation { operation: u32, parameter: u32 },
    #[error("target access failed")]
    Arm(#[from] ArmError),
    #[error("console write failed")]
    Console(#[from] std::io::Error),
}

/// How the target ended the session through SYS_EXIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure { reason: u32 },
}

impl ExitStatus {
    /// Process exit code for the hosting tool.
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Failure { .. } => 1,
        }
    }
}

/// Drives the semihosting session for one target.
pub struct Supervisor<'a, M: MemoryInterface> {
    core: &'a mut CortexM<M>,
    console: &'a mut dyn Write,
}

impl<'a, M: MemoryInterface> Supervisor<'a, M> {
    pub fn new(core: &'a mut CortexM<M>, console: &'a mut dyn Write) -> Self {
        Self { core, console }
    }

    /// Runs until the target exits through SYS_EXIT or a request cannot be
    /// serviced.
    pub fn run(&mut self) -> Result<ExitStatus, SemihostingError> {
        loop {
            while !self.core.is_halted()? {
                std::thread::sleep(RUN_POLL_YIELD);
            }

            if let Some(status) = self.service_halt()? {
                return Ok(status);
            }
        }
    }

    /// Services one halt. Returns `Some` when the target requested exit.
    pub fn service_halt(&mut self) -> Result<Option<ExitStatus>, SemihostingError> {
        let dfsr = Dfsr::from(self.core.read_word(Dfsr::ADDRESS)?);
        if dfsr.halt_reason() != HaltReason::Breakpoint {
            tracing::warn!("processor halted for unexpected reason {:#x}", dfsr.reason_bits());
            return Err(SemihostingError::UnexpectedHaltReason {
                dfsr: dfsr.reason_bits(),
            });
        }

        let pc = self.core.read_core_reg(RegisterId::PC)?;

        // Some targets only permit 32-bit accesses: load the word containing
        // the instruction and pick the addressed halfword.
        let instruction_ptr: TargetPtr<u16> = TargetPtr::new(pc);
        let word = self.core.read_word(instruction_ptr.containing_word())?;
        let instruction = if pc & 2 != 0 {
            (word >> 16) as u16
        } else {
            word as u16
        };

        if instruction != BKPT_SEMIHOSTING {
            tracing::warn!("unexpected non-semihosting breakpoint {instruction:#06x} @ {pc:#010x}");
            return Err(SemihostingError::UnexpectedBreakpoint { instruction, pc });
        }

        // Operation code in R0, single parameter (or parameter block
        // pointer) in R1, result back in R0.
        let operation = self.core.read_core_reg(RegisterId::R0)?;
        let parameter = self.core.read_core_reg(RegisterId::R1)?;

        match operation {
            SYS_WRITEC => {
                self.console.write_all(&[parameter as u8])?;
                self.console.flush()?;
            }
            SYS_EXIT => {
                let status = if parameter == ADP_STOPPED_APPLICATION_EXIT {
                    tracing::info!("target exited");
                    ExitStatus::Success
                } else {
                    tracing::warn!("target exited abnormally (reason {parameter:#x})");
                    ExitStatus::Failure { reason: parameter }
                };
                return Ok(Some(status));
            }
            _ => {
                tracing::warn!("unsupported semihosting operation {operation:#x}");
                return Err(SemihostingError::UnsupportedOperation {
                    operation,
                    parameter,
                });
            }
        }

        // Advance past the 16-bit BKPT and let the target continue.
        self.core.write_core_reg(RegisterId::PC, pc + 2)?;
        self.core.resume()?;

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::core::CoreState;
    use crate::arm::mock::{FakeCoreBus, ScriptedHalt};

    const DFSR_BKPT: u32 = 0x2;

    /// A bus halted at a semihosting breakpoint: `BKPT #0xAB` at `pc`, with
    /// the given operation and parameter loaded.
    fn halted_at_bkpt(pc: u32, operation: u32, parameter: u32) -> FakeCoreBus {
        let mut bus = FakeCoreBus::new();
        bus.halted = true;
        bus.dfsr = DFSR_BKPT;
        bus.regs[15] = pc;
        bus.regs[0] = operation;
        bus.regs[1] = parameter;

        // Place the BKPT halfword in the addressed lane; the other lane gets
        // an unrelated instruction.
        let word = if pc & 2 != 0 {
            (u32::from(BKPT_SEMIHOSTING) << 16) | 0x4770 // bx lr
        } else {
            0x4770_0000 | u32::from(BKPT_SEMIHOSTING)
        };
        bus.mem.insert(pc & !0x3, word);
        bus
    }

    #[test]
    fn sys_writec_emits_byte_advances_pc_and_resumes() {
        let bus = halted_at_bkpt(0x0000_0100, SYS_WRITEC, u32::from(b'X'));
        let mut core = CortexM::new(bus);
        core.initialize().unwrap();

        let mut console = Vec::new();
        let mut supervisor = Supervisor::new(&mut core, &mut console);
        let status = supervisor.service_halt().unwrap();

        assert_eq!(status, None);
        assert_eq!(console, b"X");
        assert_eq!(core.memory_mut().regs[15], 0x102);
        assert_eq!(core.memory_mut().resumes, 1);
        assert_eq!(core.state(), CoreState::Running);
    }

    #[test]
    fn bkpt_in_high_halfword_is_recognized() {
        let bus = halted_at_bkpt(0x0000_0102, SYS_WRITEC, u32::from(b'h'));
        let mut core = CortexM::new(bus);
        core.initialize().unwrap();

        let mut console = Vec::new();
        let mut supervisor = Supervisor::new(&mut core, &mut console);
        supervisor.service_halt().unwrap();

        assert_eq!(console, b"h");
        assert_eq!(core.memory_mut().regs[15], 0x104);
    }

    #[test]
    fn unsupported_operation_fails_without_advancing_pc() {
        // 0x04 is SYS_WRITE0, which this supervisor does not implement.
        let bus = halted_at_bkpt(0x0000_0200, 0x04, 0x2000_0000);
        let mut core = CortexM::new(bus);
        core.initialize().unwrap();

        let mut console = Vec::new();
        let mut supervisor = Supervisor::new(&mut core, &mut console);
        let err = supervisor.service_halt().unwrap_err();

        assert!(matches!(
            err,
            SemihostingError::UnsupportedOperation { operation: 0x04, .. }
        ));
        assert!(console.is_empty());
        assert_eq!(core.memory_mut().regs[15], 0x200);
        assert_eq!(core.memory_mut().resumes, 0);
    }

    #[test]
    fn non_bkpt_halt_reason_is_rejected() {
        let mut bus = halted_at_bkpt(0x0000_0100, SYS_WRITEC, 0);
        bus.dfsr = 0x1; // HALTED, not BKPT
        let mut core = CortexM::new(bus);
        core.initialize().unwrap();

        let mut console = Vec::new();
        let mut supervisor = Supervisor::new(&mut core, &mut console);
        assert!(matches!(
            supervisor.service_halt().unwrap_err(),
            SemihostingError::UnexpectedHaltReason { dfsr: 0x1 }
        ));
    }

    #[test]
    fn foreign_breakpoint_is_rejected() {
        let mut bus = halted_at_bkpt(0x0000_0100, SYS_WRITEC, 0);
        bus.mem.insert(0x100, 0x0000_BE00); // BKPT #0
        let mut core = CortexM::new(bus);
        core.initialize().unwrap();

        let mut console = Vec::new();
        let mut supervisor = Supervisor::new(&mut core, &mut console);
        assert!(matches!(
            supervisor.service_halt().unwrap_err(),
            SemihostingError::UnexpectedBreakpoint { instruction: 0xBE00, pc: 0x100 }
        ));
    }

    #[test]
    fn run_streams_until_sys_exit() {
        let mut bus = halted_at_bkpt(0x0000_0100, SYS_WRITEC, u32::from(b'o'));
        // After the first resume, halt again with a clean exit request.
        bus.scripted_halts.push_back(ScriptedHalt {
            regs: vec![(0, SYS_EXIT), (1, ADP_STOPPED_APPLICATION_EXIT), (15, 0x100)],
            dfsr: DFSR_BKPT,
        });
        let mut core = CortexM::new(bus);
        core.initialize().unwrap();

        let mut console = Vec::new();
        let status = Supervisor::new(&mut core, &mut console).run().unwrap();

        assert_eq!(status, ExitStatus::Success);
        assert_eq!(status.code(), 0);
        assert_eq!(console, b"o");
    }

    #[test]
    fn abnormal_exit_reports_failure() {
        let bus = halted_at_bkpt(0x0000_0100, SYS_EXIT, 0x20024);
        let mut core = CortexM::new(bus);
        core.initialize().unwrap();

        let mut console = Vec::new();
        let status = Supervisor::new(&mut core, &mut console).run().unwrap();

        assert_eq!(status, ExitStatus::Failure { reason: 0x20024 });
        assert_eq!(status.code(), 1);
    }
}
