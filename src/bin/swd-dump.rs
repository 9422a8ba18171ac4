//! Flash dump tool: halts the target, unmaps the boot-ROM overlay and prints
//! the first words of user flash.

use std::io;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use swd_host::arm::core::CortexM;
use swd_host::arm::dap::DebugAccessPort;
use swd_host::arm::memory::{MemoryAp, TargetPtr};
use swd_host::arm::SwdTransactions;
use swd_host::probe::{lookup_programmer, FtdiBridge, MpsseSwd};

/// LPC SYSCON memory remap register: 2 maps user flash at address zero.
const SYSMEMREMAP: TargetPtr<u32> = TargetPtr::new(0x4004_8000);
const MAP_USER_FLASH: u32 = 2;

#[derive(Parser)]
#[clap(name = "swd-dump", about = "Dump the first words of a target's flash")]
struct Cli {
    /// Debug logging verbosity (0 = warnings, 1 = info, 2 = debug, 3 = trace).
    #[clap(long, default_value_t = 0)]
    debug: u8,

    /// FTDI-based programmer to use.
    #[clap(long, default_value = "um232h")]
    programmer: String,

    /// Override the programmer's USB vendor ID (hex).
    #[clap(long, value_parser = parse_hex_u16)]
    vid: Option<u16>,

    /// Override the programmer's USB product ID (hex).
    #[clap(long, value_parser = parse_hex_u16)]
    pid: Option<u16>,

    /// Interface on the FTDI chip (0-3).
    #[clap(long)]
    interface: Option<u8>,

    /// Words to dump.
    #[clap(long, default_value_t = 32)]
    count: u32,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config = lookup_programmer(&cli.programmer)?;
    let bridge = FtdiBridge::open(config, cli.vid, cli.pid, cli.interface)
        .context("opening the USB bridge")?;
    let swd = MpsseSwd::open(bridge, config).context("entering MPSSE mode")?;

    let mut core = CortexM::new(MemoryAp::new(DebugAccessPort::new(swd)));

    core.memory_mut()
        .dap_mut()
        .initialize()
        .context("waking the SWD link")?;

    // Pulse the reset pin so the target starts from a clean state.
    core.probe_mut().enter_reset()?;
    std::thread::sleep(Duration::from_millis(100));
    core.probe_mut().leave_reset()?;

    core.memory_mut()
        .reset_state()
        .context("powering up the debug domains")?;
    core.initialize().context("enabling halting debug")?;
    core.halt().context("halting the core")?;

    core.write_word(SYSMEMREMAP, MAP_USER_FLASH)
        .context("unmapping the boot ROM")?;

    let mut words = vec![0u32; cli.count as usize];
    core.read_block(TargetPtr::new(0), &mut words)
        .context("reading flash")?;

    println!("First {} words of Flash:", cli.count);
    for (i, word) in words.iter().enumerate() {
        println!(" [{:08X}] {:08X}", i * 4, word);
    }

    Ok(())
}

fn init_logging(level: u8) {
    let default = match level {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn parse_hex_u16(src: &str) -> Result<u16, std::num::ParseIntError> {
    u16::from_str_radix(src.trim_start_matches("0x"), 16)
}
