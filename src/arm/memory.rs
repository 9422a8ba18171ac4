//! Target memory access through a MEM-AP.

use std::marker::PhantomData;

use super::ap::{Csw, Drw, Tar, TransferSize};
use super::dap::DebugAccessPort;
use super::{ArmError, Register, SwdTransactions};

/// The TAR auto-increment wraps within this window; streaming reads must
/// rewrite TAR at every crossing.
const AUTOINC_WINDOW: u32 = 0x400;

/// A typed 32-bit target address.
///
/// Carries its pointee type so host pointers and target addresses cannot be
/// confused; arithmetic is in element units and it is never dereferenced on
/// the host.
pub struct TargetPtr<T> {
    address: u32,
    _pointee: PhantomData<fn() -> T>,
}

impl<T> TargetPtr<T> {
    pub const fn new(address: u32) -> Self {
        Self {
            address,
            _pointee: PhantomData,
        }
    }

    pub const fn addr(self) -> u32 {
        self.address
    }

    /// Moves forward by `elements` pointees.
    pub const fn offset(self, elements: u32) -> Self {
        Self::new(self.address + elements * std::mem::size_of::<T>() as u32)
    }

    pub fn is_aligned(self) -> bool {
        self.address % std::mem::size_of::<T>() as u32 == 0
    }

    fn check_aligned(self) -> Result<Self, ArmError> {
        if self.is_aligned() {
            Ok(self)
        } else {
            Err(ArmError::MemoryNotAligned {
                address: self.address,
                alignment: std::mem::size_of::<T>() as u32,
            })
        }
    }

    /// The word containing this address.
    pub const fn containing_word(self) -> TargetPtr<u32> {
        TargetPtr::new(self.address & !0x3)
    }
}

impl<T> Clone for TargetPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TargetPtr<T> {}

impl<T> PartialEq for TargetPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl<T> Eq for TargetPtr<T> {}

impl<T> std::fmt::Debug for TargetPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.address)
    }
}

impl<T> std::fmt::LowerHex for TargetPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::LowerHex::fmt(&self.address, f)
    }
}

/// Word/halfword/byte access to target memory.
///
/// Implemented by [`MemoryAp`]; the core driver is generic over it so tests
/// can run against a fake bus.
pub trait MemoryInterface {
    fn read_word(&mut self, address: TargetPtr<u32>) -> Result<u32, ArmError>;
    fn write_word(&mut self, address: TargetPtr<u32>, value: u32) -> Result<(), ArmError>;
    fn read_halfword(&mut self, address: TargetPtr<u16>) -> Result<u16, ArmError>;
    fn write_halfword(&mut self, address: TargetPtr<u16>, value: u16) -> Result<(), ArmError>;
    fn read_byte(&mut self, address: TargetPtr<u8>) -> Result<u8, ArmError>;
    fn write_byte(&mut self, address: TargetPtr<u8>, value: u8) -> Result<(), ArmError>;

    /// Reads `values.len()` consecutive words starting at `address`.
    fn read_block(&mut self, address: TargetPtr<u32>, values: &mut [u32]) -> Result<(), ArmError>;
}

/// Memory access through AP 0's CSW/TAR/DRW registers.
pub struct MemoryAp<P: SwdTransactions> {
    dap: DebugAccessPort<P>,
    ap: u8,
    /// Last CSW written, elided on rewrite. Tied to the DAP's shadow epoch.
    csw: Option<Csw>,
    csw_epoch: u64,
}

impl<P: SwdTransactions> MemoryAp<P> {
    pub fn new(dap: DebugAccessPort<P>) -> Self {
        Self {
            dap,
            ap: 0,
            csw: None,
            csw_epoch: 0,
        }
    }

    pub fn dap_mut(&mut self) -> &mut DebugAccessPort<P> {
        &mut self.dap
    }

    /// See [`DebugAccessPort::reset_state`]. Also drops the CSW shadow.
    pub fn reset_state(&mut self) -> Result<(), ArmError> {
        self.csw = None;
        self.dap.reset_state()
    }

    fn write_csw(&mut self, size: TransferSize) -> Result<(), ArmError> {
        if self.csw_epoch != self.dap.shadow_epoch() {
            self.csw = None;
            self.csw_epoch = self.dap.shadow_epoch();
        }

        let csw = Csw::for_access(size);
        if self.csw == Some(csw) {
            return Ok(());
        }
        self.dap.write_ap_register(self.ap, csw)?;
        self.csw = Some(csw);
        Ok(())
    }

    fn write_tar(&mut self, address: u32) -> Result<(), ArmError> {
        self.dap.write_ap_register(self.ap, Tar(address))
    }

    /// One sized read through DRW; returns the full 32-bit payload.
    fn read_sized(&mut self, address: u32, size: TransferSize) -> Result<u32, ArmError> {
        self.write_csw(size)?;
        self.write_tar(address)?;
        Ok(self.dap.read_ap_register::<Drw>(self.ap)?.0)
    }

    /// One sized write through DRW; `payload` must already sit on the
    /// addressed byte lane.
    fn write_sized(&mut self, address: u32, size: TransferSize, payload: u32) -> Result<(), ArmError> {
        self.write_csw(size)?;
        self.write_tar(address)?;
        self.dap.write_ap_register(self.ap, Drw(payload))
    }
}

impl<P: SwdTransactions> MemoryInterface for MemoryAp<P> {
    fn read_word(&mut self, address: TargetPtr<u32>) -> Result<u32, ArmError> {
        let address = address.check_aligned()?;
        self.read_sized(address.addr(), TransferSize::Word)
    }

    fn write_word(&mut self, address: TargetPtr<u32>, value: u32) -> Result<(), ArmError> {
        let address = address.check_aligned()?;
        self.write_sized(address.addr(), TransferSize::Word, value)
    }

    fn read_halfword(&mut self, address: TargetPtr<u16>) -> Result<u16, ArmError> {
        let address = address.check_aligned()?;
        let lane = 8 * (address.addr() & 0x3);
        let payload = self.read_sized(address.addr(), TransferSize::Halfword)?;
        Ok((payload >> lane) as u16)
    }

    fn write_halfword(&mut self, address: TargetPtr<u16>, value: u16) -> Result<(), ArmError> {
        let address = address.check_aligned()?;
        let lane = 8 * (address.addr() & 0x3);
        self.write_sized(
            address.addr(),
            TransferSize::Halfword,
            u32::from(value) << lane,
        )
    }

    fn read_byte(&mut self, address: TargetPtr<u8>) -> Result<u8, ArmError> {
        let lane = 8 * (address.addr() & 0x3);
        let payload = self.read_sized(address.addr(), TransferSize::Byte)?;
        Ok((payload >> lane) as u8)
    }

    fn write_byte(&mut self, address: TargetPtr<u8>, value: u8) -> Result<(), ArmError> {
        let lane = 8 * (address.addr() & 0x3);
        self.write_sized(address.addr(), TransferSize::Byte, u32::from(value) << lane)
    }

    fn read_block(&mut self, address: TargetPtr<u32>, values: &mut [u32]) -> Result<(), ArmError> {
        if values.is_empty() {
            return Ok(());
        }
        let address = address.check_aligned()?;

        self.write_csw(TransferSize::Word)?;

        let mut address = address.addr();
        let mut done = 0;
        let total = values.len();

        while done < total {
            // TAR only auto-increments within a 1 KiB window.
            let window_words = ((AUTOINC_WINDOW - (address % AUTOINC_WINDOW)) / 4) as usize;
            let chunk = window_words.min(total - done);

            tracing::trace!("streaming {chunk} words from {address:#010x}");
            self.write_tar(address)?;
            self.dap
                .read_ap_repeated(self.ap, Drw::ADDRESS, &mut values[done..done + chunk])?;

            done += chunk;
            address += (chunk * 4) as u32;
        }

        Ok(())
    }
}
