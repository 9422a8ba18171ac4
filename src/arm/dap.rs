//! Debug Access Port engine.
//!
//! Presents typed DP and AP register access on top of raw SWD transactions,
//! hiding bank selection and the posted-read pipeline. The SELECT register is
//! shadowed so bank switches only hit the wire when the target's selection
//! actually has to change.

use std::time::Duration;

use super::dp::{Abort, Ctrl, DebugPortId, DpBankSel, DpIdr, DpRegister, RdBuff, Select};
use super::{ap::ApRegister, ArmError, DapError, PortType, Register, SwdTransactions};
use crate::util::with_retry;

/// How often a transaction is retried on a WAIT acknowledge.
const WAIT_RETRIES: usize = 100;
/// Yield between WAIT retries; timing is not specified on the wire, a
/// sub-millisecond pause is adequate.
const WAIT_YIELD: Duration = Duration::from_micros(100);

/// Retry bound for the debug/system power-up acknowledge bits.
const POWER_UP_RETRIES: usize = 100;
const POWER_UP_YIELD: Duration = Duration::from_millis(1);

/// The debug access port of one SWD connection.
pub struct DebugAccessPort<P: SwdTransactions> {
    probe: P,
    /// Shadow of the last SELECT written, `None` while unknown (after
    /// construction, line reset, or `reset_state`).
    select: Option<Select>,
    /// Bumped whenever downstream shadows (e.g. a memory AP's CSW) must be
    /// considered stale.
    shadow_epoch: u64,
}

impl<P: SwdTransactions> DebugAccessPort<P> {
    pub fn new(probe: P) -> Self {
        Self {
            probe,
            select: None,
            shadow_epoch: 0,
        }
    }

    pub fn probe_mut(&mut self) -> &mut P {
        &mut self.probe
    }

    /// Epoch of the register-selection shadows; consumers holding their own
    /// shadows of AP state must invalidate them when this changes.
    pub fn shadow_epoch(&self) -> u64 {
        self.shadow_epoch
    }

    /// Performs an SWD line reset and validates the IDCODE the target
    /// reports back.
    pub fn initialize(&mut self) -> Result<DebugPortId, ArmError> {
        self.invalidate_shadows();
        let idcode = self.probe.line_reset()?;
        if idcode == 0 || idcode == u32::MAX {
            return Err(ArmError::NoTarget(idcode));
        }
        let id = DebugPortId::from(DpIdr::from(idcode));
        tracing::info!("found debug port: {} (IDCODE {:#010x})", id, idcode);
        Ok(id)
    }

    /// Brings the DP to a known state: zeroes SELECT, discards a fresh
    /// IDCODE read, clears all sticky errors, then powers up the debug and
    /// system domains and waits for both acknowledges.
    pub fn reset_state(&mut self) -> Result<(), ArmError> {
        tracing::debug!("resetting debug port state");
        self.invalidate_shadows();

        self.write_select(Select::default())?;

        let idcode = self.read_dp::<DpIdr>()?;
        let raw = u32::from(idcode);
        if raw == 0 || raw == u32::MAX {
            return Err(ArmError::NoTarget(raw));
        }

        let mut abort = Abort::default();
        abort.set_stkerrclr(true);
        abort.set_wderrclr(true);
        abort.set_orunerrclr(true);
        abort.set_stkcmpclr(true);
        self.write_dp(abort)?;

        let mut ctrl = Ctrl::default();
        ctrl.set_cdbgpwrupreq(true);
        ctrl.set_csyspwrupreq(true);
        self.write_dp(ctrl)?;

        with_retry(
            POWER_UP_RETRIES,
            POWER_UP_YIELD,
            || {
                let ctrl = self.read_dp::<Ctrl>()?;
                if ctrl.cdbgpwrupack() && ctrl.csyspwrupack() {
                    Ok(())
                } else {
                    Err(ArmError::Timeout)
                }
            },
            |e| matches!(e, ArmError::Timeout),
        )?;

        // Normal transfer mode, all byte lanes included in compares.
        let mut ctrl = Ctrl::default();
        ctrl.set_cdbgpwrupreq(true);
        ctrl.set_csyspwrupreq(true);
        ctrl.set_mask_lane(0b1111);
        self.write_dp(ctrl)?;

        tracing::debug!("debug and system domains powered up");
        Ok(())
    }

    /// Reads a DP register, switching DPBANKSEL first if the register is
    /// banked and the shadow disagrees.
    pub fn read_dp<R: DpRegister>(&mut self) -> Result<R, ArmError> {
        self.select_dp_bank(R::BANK)?;
        let value = self.checked_read(PortType::DebugPort, R::ADDRESS)?;
        tracing::trace!("read {} = {value:#010x}", R::NAME);
        Ok(R::from(value))
    }

    /// Writes a DP register, switching DPBANKSEL first if needed.
    pub fn write_dp<R: DpRegister>(&mut self, register: R) -> Result<(), ArmError> {
        self.select_dp_bank(R::BANK)?;
        let value: u32 = register.into();
        tracing::trace!("write {} = {value:#010x}", R::NAME);
        self.checked_write(PortType::DebugPort, R::ADDRESS, value)?;
        if R::ADDRESS == Select::ADDRESS {
            self.select = Some(Select::from(value));
        }
        Ok(())
    }

    /// Reads an AP register by byte offset. The posted-read pipeline is
    /// drained here: the stale value the AP read itself returns is discarded
    /// and the natural value extracted through RDBUFF.
    pub fn read_ap(&mut self, ap: u8, offset: u8) -> Result<u32, ArmError> {
        self.select_ap_bank(ap, offset)?;
        self.checked_read(PortType::AccessPort, offset & 0xF)?;
        self.checked_read(PortType::DebugPort, RdBuff::ADDRESS)
    }

    /// Writes an AP register by byte offset.
    pub fn write_ap(&mut self, ap: u8, offset: u8, value: u32) -> Result<(), ArmError> {
        self.select_ap_bank(ap, offset)?;
        self.checked_write(PortType::AccessPort, offset & 0xF, value)
    }

    /// Reads the same AP register `values.len()` times, pipelined: each wire
    /// read returns the previous access's result, so results are shifted by
    /// one and the last collected from RDBUFF.
    pub fn read_ap_repeated(
        &mut self,
        ap: u8,
        offset: u8,
        values: &mut [u32],
    ) -> Result<(), ArmError> {
        let Some((_, head)) = values.split_last_mut() else {
            return Ok(());
        };

        self.select_ap_bank(ap, offset)?;

        // Prime the pipeline; this result belongs to whatever came before.
        self.checked_read(PortType::AccessPort, offset & 0xF)?;
        for value in head.iter_mut() {
            *value = self.checked_read(PortType::AccessPort, offset & 0xF)?;
        }
        let last = self.checked_read(PortType::DebugPort, RdBuff::ADDRESS)?;
        *values.last_mut().expect("checked non-empty") = last;
        Ok(())
    }

    /// Writes the same AP register once per value.
    pub fn write_ap_repeated(
        &mut self,
        ap: u8,
        offset: u8,
        values: &[u32],
    ) -> Result<(), ArmError> {
        self.select_ap_bank(ap, offset)?;
        for value in values {
            self.checked_write(PortType::AccessPort, offset & 0xF, *value)?;
        }
        Ok(())
    }

    /// Typed AP register read.
    pub fn read_ap_register<R: ApRegister>(&mut self, ap: u8) -> Result<R, ArmError> {
        Ok(R::from(self.read_ap(ap, R::ADDRESS)?))
    }

    /// Typed AP register write.
    pub fn write_ap_register<R: ApRegister>(&mut self, ap: u8, register: R) -> Result<(), ArmError> {
        self.write_ap(ap, R::ADDRESS, register.into())
    }

    fn invalidate_shadows(&mut self) {
        self.select = None;
        self.shadow_epoch = self.shadow_epoch.wrapping_add(1);
    }

    fn select_dp_bank(&mut self, bank: DpBankSel) -> Result<(), ArmError> {
        let DpBankSel::Bank(bank) = bank else {
            return Ok(());
        };

        let stale = match self.select {
            Some(select) => select.dp_bank_sel() != bank,
            None => true,
        };
        if stale {
            let mut select = self.select.unwrap_or_default();
            select.set_dp_bank_sel(bank);
            self.write_select(select)?;
        }
        Ok(())
    }

    fn select_ap_bank(&mut self, ap: u8, offset: u8) -> Result<(), ArmError> {
        let bank = offset >> 4;

        let stale = match self.select {
            Some(select) => select.ap_sel() != ap || select.ap_bank_sel() != bank,
            None => true,
        };
        if stale {
            let mut select = self.select.unwrap_or_default();
            select.set_ap_sel(ap);
            select.set_ap_bank_sel(bank);
            self.write_select(select)?;
        }
        Ok(())
    }

    fn write_select(&mut self, select: Select) -> Result<(), ArmError> {
        tracing::debug!("SELECT <- {:#010x}", u32::from(select));
        self.checked_write(PortType::DebugPort, Select::ADDRESS, select.into())?;
        self.select = Some(select);
        Ok(())
    }

    /// One read with WAIT retry and FAULT recovery applied.
    fn checked_read(&mut self, port: PortType, address: u8) -> Result<u32, ArmError> {
        let result = with_retry(
            WAIT_RETRIES,
            WAIT_YIELD,
            || self.probe.raw_read_register(port, address),
            is_wait,
        );
        self.settle(result)
    }

    /// One write with WAIT retry and FAULT recovery applied.
    fn checked_write(&mut self, port: PortType, address: u8, value: u32) -> Result<(), ArmError> {
        let result = with_retry(
            WAIT_RETRIES,
            WAIT_YIELD,
            || self.probe.raw_write_register(port, address, value),
            is_wait,
        );
        self.settle(result)
    }

    fn settle<T>(&mut self, result: Result<T, ArmError>) -> Result<T, ArmError> {
        match result {
            Err(ArmError::Dap(DapError::WaitResponse)) => {
                tracing::warn!("transaction still WAITing after {WAIT_RETRIES} attempts");
                Err(ArmError::WaitRetriesExhausted(WAIT_RETRIES))
            }
            Err(ArmError::Dap(DapError::FaultResponse)) => {
                self.clear_sticky_fault()?;
                Err(DapError::FaultResponse.into())
            }
            other => other,
        }
    }

    /// Classifies a FAULT by reading CTRL/STAT and clears the latched sticky
    /// bits through ABORT so the next transaction can proceed. The original
    /// fault is still surfaced by the caller.
    ///
    /// CTRL/STAT is read raw: DPBANKSEL is 0 whenever this driver runs, the
    /// only banked register it touches lives in bank 0.
    fn clear_sticky_fault(&mut self) -> Result<(), ArmError> {
        let ctrl = Ctrl::from(
            self.probe
                .raw_read_register(PortType::DebugPort, Ctrl::ADDRESS)?,
        );
        tracing::warn!("transaction FAULTed, CTRL/STAT = {ctrl:?}");

        let mut abort = Abort::default();
        abort.set_stkerrclr(ctrl.sticky_err());
        abort.set_wderrclr(ctrl.wdataerr());
        abort.set_orunerrclr(ctrl.sticky_orun());
        abort.set_stkcmpclr(ctrl.sticky_cmp());
        self.probe
            .raw_write_register(PortType::DebugPort, Abort::ADDRESS, abort.into())?;
        Ok(())
    }
}

fn is_wait(error: &ArmError) -> bool {
    matches!(error, ArmError::Dap(DapError::WaitResponse))
}
