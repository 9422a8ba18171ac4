//! MEM-AP register file.

use bitfield::bitfield;

use super::Register;

/// A register in the currently selected AP's register file. `ADDRESS` is the
/// byte offset, split by the engine into APBANKSEL and A[3:2].
pub trait ApRegister: Register {}

/// MEM-AP transfer size, CSW[2:0].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferSize {
    Byte = 0b000,
    Halfword = 0b001,
    Word = 0b010,
}

impl TransferSize {
    pub fn bytes(self) -> u32 {
        match self {
            TransferSize::Byte => 1,
            TransferSize::Halfword => 2,
            TransferSize::Word => 4,
        }
    }
}

/// MEM-AP address increment mode, CSW[5:4].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressIncrement {
    Off = 0b00,
    Single = 0b01,
}

bitfield! {
    /// CSW: control/status word of the MEM-AP (offset 0x00).
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Csw(u32);
    impl Debug;
    pub dbg_sw_enable, set_dbg_sw_enable: 31;
    pub u8, prot, set_prot: 30, 24;
    pub tr_in_prog, _: 7;
    pub device_en, _: 6;
    pub u8, addr_inc, set_addr_inc: 5, 4;
    pub u8, size, set_size: 2, 0;
}

impl Csw {
    /// CSW value for a debugger access of the given size with single
    /// auto-increment, the only configuration this driver uses.
    pub fn for_access(size: TransferSize) -> Self {
        let mut csw = Csw(0);
        csw.set_dbg_sw_enable(true);
        csw.set_addr_inc(AddressIncrement::Single as u8);
        csw.set_size(size as u8);
        csw
    }
}

impl From<u32> for Csw {
    fn from(raw: u32) -> Self {
        Csw(raw)
    }
}

impl From<Csw> for u32 {
    fn from(raw: Csw) -> Self {
        raw.0
    }
}

impl Register for Csw {
    const ADDRESS: u8 = 0x00;
    const NAME: &'static str = "CSW";
}

impl ApRegister for Csw {}

/// TAR: transfer address register (offset 0x04).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tar(pub u32);

impl From<u32> for Tar {
    fn from(raw: u32) -> Self {
        Tar(raw)
    }
}

impl From<Tar> for u32 {
    fn from(raw: Tar) -> Self {
        raw.0
    }
}

impl Register for Tar {
    const ADDRESS: u8 = 0x04;
    const NAME: &'static str = "TAR";
}

impl ApRegister for Tar {}

/// DRW: data read/write register (offset 0x0C). Accesses go to target
/// memory at the address in TAR.
#[derive(Debug, Clone, Copy, Default)]
pub struct Drw(pub u32);

impl From<u32> for Drw {
    fn from(raw: u32) -> Self {
        Drw(raw)
    }
}

impl From<Drw> for u32 {
    fn from(raw: Drw) -> Self {
        raw.0
    }
}

impl Register for Drw {
    const ADDRESS: u8 = 0x0C;
    const NAME: &'static str = "DRW";
}

impl ApRegister for Drw {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csw_for_word_access() {
        let csw = Csw::for_access(TransferSize::Word);
        assert!(csw.dbg_sw_enable());
        assert_eq!(csw.addr_inc(), AddressIncrement::Single as u8);
        assert_eq!(csw.size(), TransferSize::Word as u8);
        assert_eq!(u32::from(csw), 0x8000_0012);
    }
}
