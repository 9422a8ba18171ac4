//! Host-side SWD debugger agent for Cortex-M targets.
//!
//! Speaks the ARM Serial Wire Debug protocol to an M0/M3/M4-class target
//! through an FTDI bridge in MPSSE mode, and layers the ADI debug-port /
//! access-port model, MEM-AP memory access, Cortex-M halt control and a
//! semihosting supervisor on top.
//!
//! The stack, leaves first:
//!
//! - [`probe`]: the byte transport to the bridge and the SWD line driver.
//! - [`arm`]: DP/AP engine, MEM-AP memory access, Cortex-M core driver.
//! - [`semihosting`]: services `BKPT #0xAB` requests against a host console.
//!
//! A session is built bottom-up and owned by a single thread:
//!
//! ```no_run
//! use swd_host::arm::{core::CortexM, dap::DebugAccessPort, memory::MemoryAp};
//! use swd_host::probe::{lookup_programmer, FtdiBridge, MpsseSwd};
//!
//! # fn main() -> Result<(), swd_host::Error> {
//! let config = lookup_programmer("um232h")?;
//! let bridge = FtdiBridge::open(config, None, None, None)?;
//! let swd = MpsseSwd::open(bridge, config)?;
//! let mut core = CortexM::new(MemoryAp::new(DebugAccessPort::new(swd)));
//!
//! core.memory_mut().dap_mut().initialize()?;
//! core.memory_mut().reset_state()?;
//! core.initialize()?;
//! core.halt()?;
//! # Ok(())
//! # }
//! ```

pub mod arm;
pub mod error;
pub mod probe;
pub mod semihosting;

mod util;

pub use error::Error;
