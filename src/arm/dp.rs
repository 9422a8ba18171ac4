//! Debug Port register file.

use bitfield::bitfield;
use jep106::JEP106Code;

use super::Register;

/// DP bank requirement of a register: most DP registers ignore
/// SELECT.DPBANKSEL, only address 0x4 is banked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpBankSel {
    DontCare,
    Bank(u8),
}

/// A register in DP space.
pub trait DpRegister: Register {
    const BANK: DpBankSel;
}

bitfield! {
    /// ABORT: sticky error clear and transaction abort (write-only, 0x0).
    #[derive(Clone, Default)]
    pub struct Abort(u32);
    impl Debug;
    pub _, set_orunerrclr: 4;
    pub _, set_wderrclr: 3;
    pub _, set_stkerrclr: 2;
    pub _, set_stkcmpclr: 1;
    pub _, set_dapabort: 0;
}

impl From<u32> for Abort {
    fn from(raw: u32) -> Self {
        Abort(raw)
    }
}

impl From<Abort> for u32 {
    fn from(raw: Abort) -> Self {
        raw.0
    }
}

impl Register for Abort {
    const ADDRESS: u8 = 0x0;
    const NAME: &'static str = "ABORT";
}

impl DpRegister for Abort {
    const BANK: DpBankSel = DpBankSel::DontCare;
}

bitfield! {
    /// CTRL/STAT: power-up requests and sticky fault flags (0x4, bank 0).
    #[derive(Clone, Copy, Default)]
    pub struct Ctrl(u32);
    impl Debug;
    pub csyspwrupack, _: 31;
    pub csyspwrupreq, set_csyspwrupreq: 30;
    pub cdbgpwrupack, _: 29;
    pub cdbgpwrupreq, set_cdbgpwrupreq: 28;
    pub cdbgrstack, _: 27;
    pub cdbgrstreq, set_cdbgrstreq: 26;
    pub u8, mask_lane, set_mask_lane: 11, 8;
    pub wdataerr, _: 7;
    pub read_ok, _: 6;
    pub sticky_err, _: 5;
    pub sticky_cmp, _: 4;
    pub sticky_orun, _: 1;
    pub orun_detect, set_orun_detect: 0;
}

impl From<u32> for Ctrl {
    fn from(raw: u32) -> Self {
        Ctrl(raw)
    }
}

impl From<Ctrl> for u32 {
    fn from(raw: Ctrl) -> Self {
        raw.0
    }
}

impl Register for Ctrl {
    const ADDRESS: u8 = 0x4;
    const NAME: &'static str = "CTRL/STAT";
}

impl DpRegister for Ctrl {
    const BANK: DpBankSel = DpBankSel::Bank(0);
}

bitfield! {
    /// SELECT: active AP, AP register bank and DP register bank (0x8).
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Select(u32);
    impl Debug;
    pub u8, ap_sel, set_ap_sel: 31, 24;
    pub u8, ap_bank_sel, set_ap_bank_sel: 7, 4;
    pub u8, dp_bank_sel, set_dp_bank_sel: 3, 0;
}

impl From<u32> for Select {
    fn from(raw: u32) -> Self {
        Select(raw)
    }
}

impl From<Select> for u32 {
    fn from(raw: Select) -> Self {
        raw.0
    }
}

impl Register for Select {
    const ADDRESS: u8 = 0x8;
    const NAME: &'static str = "SELECT";
}

impl DpRegister for Select {
    const BANK: DpBankSel = DpBankSel::DontCare;
}

bitfield! {
    /// IDCODE/DPIDR: identification of the debug port (read-only, 0x0).
    #[derive(Clone, Copy)]
    pub struct DpIdr(u32);
    impl Debug;
    pub u8, revision, _: 31, 28;
    pub u8, part_no, _: 27, 20;
    pub min, _: 16;
    pub u8, version, _: 15, 12;
    u8, jep_cc, _: 11, 8;
    u8, jep_id, _: 7, 1;
}

impl From<u32> for DpIdr {
    fn from(raw: u32) -> Self {
        DpIdr(raw)
    }
}

impl From<DpIdr> for u32 {
    fn from(raw: DpIdr) -> Self {
        raw.0
    }
}

impl Register for DpIdr {
    const ADDRESS: u8 = 0x0;
    const NAME: &'static str = "IDCODE";
}

impl DpRegister for DpIdr {
    const BANK: DpBankSel = DpBankSel::DontCare;
}

/// RDBUFF: result of the previous posted AP read (read-only, 0xC).
#[derive(Debug, Clone, Copy)]
pub struct RdBuff(pub u32);

impl From<u32> for RdBuff {
    fn from(raw: u32) -> Self {
        RdBuff(raw)
    }
}

impl From<RdBuff> for u32 {
    fn from(raw: RdBuff) -> Self {
        raw.0
    }
}

impl Register for RdBuff {
    const ADDRESS: u8 = 0xC;
    const NAME: &'static str = "RDBUFF";
}

impl DpRegister for RdBuff {
    const BANK: DpBankSel = DpBankSel::DontCare;
}

/// Decoded identity of a debug port.
#[derive(Debug)]
pub struct DebugPortId {
    pub revision: u8,
    pub part_no: u8,
    pub version: u8,
    pub designer: JEP106Code,
}

impl From<DpIdr> for DebugPortId {
    fn from(idr: DpIdr) -> Self {
        DebugPortId {
            revision: idr.revision(),
            part_no: idr.part_no(),
            version: idr.version(),
            designer: JEP106Code::new(idr.jep_cc(), idr.jep_id()),
        }
    }
}

impl std::fmt::Display for DebugPortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DPv{} rev{} part {:#04x} by {}",
            self.version,
            self.revision,
            self.part_no,
            self.designer.get().unwrap_or("<unknown designer>")
        )
    }
}
