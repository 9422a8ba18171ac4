//! Scripted fakes for driving the stack in tests.

use std::collections::{HashMap, VecDeque};

use super::memory::{MemoryInterface, TargetPtr};
use super::{ArmError, DapError, PortType, SwdTransactions};

const DHCSR: u32 = 0xE000_EDF0;
const DCRSR: u32 = 0xE000_EDF4;
const DCRDR: u32 = 0xE000_EDF8;
const DFSR: u32 = 0xE000_ED30;
const AIRCR: u32 = 0xE000_ED0C;
const DEMCR: u32 = 0xE000_EDFC;

/// A simulated SWD target: DP registers, one MEM-AP with a posted-read
/// pipeline and windowed TAR auto-increment, and scripting hooks for WAIT
/// storms and sticky faults.
pub struct FakeTarget {
    pub idcode: u32,
    /// Word-addressed target memory.
    pub memory: HashMap<u32, u32>,

    select: u32,
    csw: u32,
    tar: u32,
    /// The posted-read pipeline register behind AP reads and RDBUFF.
    posted: u32,

    /// Last value written to CTRL/STAT.
    pub ctrl_reqs: u32,
    pub powered_up: bool,
    pub sticky_err: bool,

    /// Number of WAIT acknowledges to give AP transactions before OK.
    pub wait_responses: usize,
    /// Respond FAULT to the next AP transaction.
    pub fault_next: bool,

    pub select_writes: usize,
    pub csw_writes: usize,
    pub tar_writes: usize,
    /// TAR write attempts including WAITed ones.
    pub tar_attempts: usize,
    pub abort_writes: usize,
    pub ctrl_reads: usize,
    pub last_abort_stkerrclr: bool,
    pub line_resets: usize,
}

impl FakeTarget {
    pub fn new() -> Self {
        Self {
            idcode: 0x0BC1_1477,
            memory: HashMap::new(),
            select: 0,
            csw: 0,
            tar: 0,
            posted: 0,
            ctrl_reqs: 0,
            powered_up: false,
            sticky_err: false,
            wait_responses: 0,
            fault_next: false,
            select_writes: 0,
            csw_writes: 0,
            tar_writes: 0,
            tar_attempts: 0,
            abort_writes: 0,
            ctrl_reads: 0,
            last_abort_stkerrclr: false,
            line_resets: 0,
        }
    }

    fn ap_offset(&self, a: u8) -> u8 {
        (((self.select >> 4) & 0xF) as u8) << 4 | (a & 0xC)
    }

    fn ap_script(&mut self) -> Result<(), DapError> {
        if self.fault_next {
            self.fault_next = false;
            self.sticky_err = true;
            return Err(DapError::FaultResponse);
        }
        if self.wait_responses > 0 {
            self.wait_responses -= 1;
            return Err(DapError::WaitResponse);
        }
        Ok(())
    }

    fn increment_tar(&mut self) {
        // Auto-increment only carries within the low ten bits.
        if (self.csw >> 4) & 0x3 == 0b01 {
            self.tar = (self.tar & !0x3FF) | (self.tar.wrapping_add(4) & 0x3FF);
        }
    }

    fn drw_read(&mut self) -> u32 {
        let value = self.memory.get(&(self.tar & !0x3)).copied().unwrap_or(0);
        self.increment_tar();
        value
    }

    fn drw_write(&mut self, payload: u32) {
        let word_addr = self.tar & !0x3;

        // The debug register block halts and un-halts instantly.
        if word_addr == DHCSR {
            let mut stored = payload & 0xFFFF;
            stored |= 1 << 16; // S_REGRDY
            if payload & 0x2 != 0 {
                stored |= 1 << 17; // S_HALT follows C_HALT
            }
            self.memory.insert(word_addr, stored);
            self.increment_tar();
            return;
        }

        let value = match self.csw & 0x7 {
            0b000 => {
                let lane = 8 * (self.tar & 0x3);
                let old = self.memory.get(&word_addr).copied().unwrap_or(0);
                (old & !(0xFF << lane)) | (payload & (0xFF << lane))
            }
            0b001 => {
                let lane = 8 * (self.tar & 0x2);
                let old = self.memory.get(&word_addr).copied().unwrap_or(0);
                (old & !(0xFFFF << lane)) | (payload & (0xFFFF << lane))
            }
            _ => payload,
        };
        self.memory.insert(word_addr, value);
        self.increment_tar();
    }

    fn ctrl_value(&self) -> u32 {
        let mut value = self.ctrl_reqs & 0x5000_0000;
        if value & (1 << 30) != 0 {
            value |= 1 << 31; // CSYSPWRUPACK
        }
        if value & (1 << 28) != 0 {
            value |= 1 << 29; // CDBGPWRUPACK
        }
        if self.sticky_err {
            value |= 1 << 5;
        }
        value
    }
}

impl SwdTransactions for FakeTarget {
    fn raw_read_register(&mut self, port: PortType, address: u8) -> Result<u32, ArmError> {
        match port {
            PortType::DebugPort => match address & 0xC {
                0x0 => Ok(self.idcode),
                0x4 => {
                    self.ctrl_reads += 1;
                    Ok(self.ctrl_value())
                }
                0xC => Ok(self.posted),
                _ => Ok(0),
            },
            PortType::AccessPort => {
                self.ap_script().map_err(ArmError::from)?;
                let current = match self.ap_offset(address) {
                    0x00 => self.csw,
                    0x04 => self.tar,
                    0x0C => self.drw_read(),
                    _ => 0,
                };
                let stale = self.posted;
                self.posted = current;
                Ok(stale)
            }
        }
    }

    fn raw_write_register(
        &mut self,
        port: PortType,
        address: u8,
        value: u32,
    ) -> Result<(), ArmError> {
        match port {
            PortType::DebugPort => {
                match address & 0xC {
                    0x0 => {
                        self.abort_writes += 1;
                        self.last_abort_stkerrclr = value & (1 << 2) != 0;
                        if value & (1 << 2) != 0 {
                            self.sticky_err = false;
                        }
                    }
                    0x4 => {
                        self.ctrl_reqs = value;
                        if value & (1 << 28) != 0 && value & (1 << 30) != 0 {
                            self.powered_up = true;
                        }
                    }
                    0x8 => {
                        self.select_writes += 1;
                        self.select = value;
                    }
                    _ => {}
                }
                Ok(())
            }
            PortType::AccessPort => {
                if self.ap_offset(address) == 0x04 {
                    self.tar_attempts += 1;
                }
                self.ap_script().map_err(ArmError::from)?;
                match self.ap_offset(address) {
                    0x00 => {
                        self.csw_writes += 1;
                        self.csw = value;
                    }
                    0x04 => {
                        self.tar_writes += 1;
                        self.tar = value;
                    }
                    0x0C => self.drw_write(value),
                    _ => {}
                }
                Ok(())
            }
        }
    }

    fn line_reset(&mut self) -> Result<u32, ArmError> {
        self.line_resets += 1;
        self.posted = 0;
        Ok(self.idcode)
    }

    fn enter_reset(&mut self) -> Result<(), ArmError> {
        Ok(())
    }

    fn leave_reset(&mut self) -> Result<(), ArmError> {
        Ok(())
    }
}

/// Register state a [`FakeCoreBus`] applies when the simulated core halts
/// again after a resume.
pub struct ScriptedHalt {
    /// (REGSEL index, value) pairs to load before halting.
    pub regs: Vec<(usize, u32)>,
    pub dfsr: u32,
}

/// A simulated Cortex-M debug register block behind the memory interface.
///
/// Models the DHCSR halt/resume handshake, the DCRSR/DCRDR register file
/// transfer protocol and sticky DFSR bits, plus plain word memory.
pub struct FakeCoreBus {
    pub mem: HashMap<u32, u32>,
    /// Core register file indexed by REGSEL encoding.
    pub regs: [u32; 21],
    pub dfsr: u32,
    pub halted: bool,
    /// DHCSR reads before a requested halt reports S_HALT.
    pub halt_after_polls: usize,
    halt_pending: bool,
    dcrdr: u32,
    debugen: bool,
    /// When false, C_DEBUGEN writes do not stick (locked-out target).
    pub debugen_sticks: bool,
    /// Halts to play back on subsequent resumes.
    pub scripted_halts: VecDeque<ScriptedHalt>,

    pub dhcsr_reads: usize,
    pub dhcsr_writes: Vec<u32>,
    pub resumes: usize,
}

impl FakeCoreBus {
    pub fn new() -> Self {
        Self {
            mem: HashMap::new(),
            regs: [0; 21],
            dfsr: 0,
            halted: false,
            halt_after_polls: 0,
            halt_pending: false,
            dcrdr: 0,
            debugen: false,
            debugen_sticks: true,
            scripted_halts: VecDeque::new(),
            dhcsr_reads: 0,
            dhcsr_writes: Vec::new(),
            resumes: 0,
        }
    }

    fn dhcsr_value(&mut self) -> u32 {
        self.dhcsr_reads += 1;

        if self.halt_pending {
            if self.halt_after_polls > 0 {
                self.halt_after_polls -= 1;
            }
            if self.halt_after_polls == 0 {
                self.halt_pending = false;
                self.halted = true;
            }
        }

        let mut value = 1 << 16; // S_REGRDY: transfers complete instantly
        if self.halted {
            value |= 1 << 17;
        }
        if self.debugen {
            value |= 1;
        }
        value
    }

    fn dhcsr_write(&mut self, value: u32) {
        self.dhcsr_writes.push(value);
        if value >> 16 != 0xA05F {
            return; // wrong DBGKEY, write ignored
        }

        if self.debugen_sticks {
            self.debugen = value & 1 != 0;
        }

        let halt = value & 0x2 != 0;
        let step = value & 0x4 != 0;
        if halt {
            if self.halt_after_polls == 0 {
                self.halted = true;
            } else {
                self.halt_pending = true;
            }
        } else {
            self.resumes += 1;
            if step {
                // A step halts again right away.
                self.halted = true;
            } else if let Some(script) = self.scripted_halts.pop_front() {
                for (regsel, value) in script.regs {
                    self.regs[regsel] = value;
                }
                self.dfsr = script.dfsr;
                self.halted = true;
            } else {
                self.halted = false;
            }
        }
    }

    fn word(&mut self, address: u32) -> u32 {
        match address {
            DHCSR => self.dhcsr_value(),
            DCRDR => self.dcrdr,
            DFSR => self.dfsr,
            _ => self.mem.get(&address).copied().unwrap_or(0),
        }
    }

    fn set_word(&mut self, address: u32, value: u32) {
        match address {
            DHCSR => self.dhcsr_write(value),
            DCRSR => {
                let regsel = (value & 0x1F) as usize;
                if value & (1 << 16) != 0 {
                    self.regs[regsel] = self.dcrdr;
                } else {
                    self.dcrdr = self.regs[regsel];
                }
            }
            DCRDR => self.dcrdr = value,
            DFSR => self.dfsr &= !value,
            AIRCR => {
                // Vector catch on reset if DEMCR.VC_CORERESET is set.
                if value >> 16 == 0x05FA && value & 0x4 != 0 {
                    let demcr = self.mem.get(&DEMCR).copied().unwrap_or(0);
                    if demcr & 1 != 0 {
                        self.halted = true;
                        self.dfsr |= 1 << 3; // VCATCH
                    }
                }
            }
            _ => {
                self.mem.insert(address, value);
            }
        }
    }
}

impl MemoryInterface for FakeCoreBus {
    fn read_word(&mut self, address: TargetPtr<u32>) -> Result<u32, ArmError> {
        Ok(self.word(address.addr()))
    }

    fn write_word(&mut self, address: TargetPtr<u32>, value: u32) -> Result<(), ArmError> {
        self.set_word(address.addr(), value);
        Ok(())
    }

    fn read_halfword(&mut self, address: TargetPtr<u16>) -> Result<u16, ArmError> {
        let word = self.word(address.addr() & !0x3);
        Ok((word >> (8 * (address.addr() & 0x2))) as u16)
    }

    fn write_halfword(&mut self, address: TargetPtr<u16>, value: u16) -> Result<(), ArmError> {
        let word_addr = address.addr() & !0x3;
        let lane = 8 * (address.addr() & 0x2);
        let old = self.word(word_addr);
        self.set_word(
            word_addr,
            (old & !(0xFFFF << lane)) | (u32::from(value) << lane),
        );
        Ok(())
    }

    fn read_byte(&mut self, address: TargetPtr<u8>) -> Result<u8, ArmError> {
        let word = self.word(address.addr() & !0x3);
        Ok((word >> (8 * (address.addr() & 0x3))) as u8)
    }

    fn write_byte(&mut self, address: TargetPtr<u8>, value: u8) -> Result<(), ArmError> {
        let word_addr = address.addr() & !0x3;
        let lane = 8 * (address.addr() & 0x3);
        let old = self.word(word_addr);
        self.set_word(
            word_addr,
            (old & !(0xFF << lane)) | (u32::from(value) << lane),
        );
        Ok(())
    }

    fn read_block(&mut self, address: TargetPtr<u32>, values: &mut [u32]) -> Result<(), ArmError> {
        for (i, value) in values.iter_mut().enumerate() {
            *value = self.word(address.offset(i as u32).addr());
        }
        Ok(())
    }
}
