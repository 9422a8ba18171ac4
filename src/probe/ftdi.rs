//! FTDI bridge transport.
//!
//! Speaks to an FT232H/FT2232H-class chip over USB: vendor control requests
//! for chip setup, bulk transfers for MPSSE command traffic. Incoming bulk
//! packets carry two modem-status bytes per packet which are stripped here so
//! upper layers see a clean byte stream.

use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};

use async_io::block_on;
use nusb::transfer::{Control, ControlType, Recipient, RequestBuffer};

use super::{BridgeConfig, ProbeError, Transport};

const SIO_RESET_REQUEST: u8 = 0x00;
const SIO_RESET_SIO: u16 = 0;
const SIO_RESET_PURGE_RX: u16 = 1;
const SIO_RESET_PURGE_TX: u16 = 2;
const SIO_SET_LATENCY_TIMER_REQUEST: u8 = 0x09;
const SIO_SET_BITMODE_REQUEST: u8 = 0x0B;

const BITMODE_RESET: u8 = 0x00;
const BITMODE_MPSSE: u8 = 0x02;

/// MPSSE GPIO write command for the low byte: opcode, level, direction.
const MPSSE_SET_BITS_LOW: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChipType {
    Ft2232C,
    Ft2232H,
    Ft4232H,
    Ft232H,
}

impl ChipType {
    fn detect(device_version: u16) -> Result<Self, ProbeError> {
        match device_version {
            0x500 => Ok(ChipType::Ft2232C),
            0x700 => Ok(ChipType::Ft2232H),
            0x800 => Ok(ChipType::Ft4232H),
            0x900 => Ok(ChipType::Ft232H),
            _ => Err(ProbeError::UnsupportedChip("unknown bcdDevice")),
        }
    }

    /// H-series chips run a 60 MHz master clock behind a compatibility
    /// divide-by-5 that must be switched off.
    fn has_divide_by_5(self) -> bool {
        !matches!(self, ChipType::Ft2232C)
    }
}

/// USB endpoint pair for one FTDI interface.
fn endpoints(interface: u8) -> (u8, u8) {
    let read_ep = 0x81 + 2 * interface;
    let write_ep = 0x02 + 2 * interface;
    (read_ep, write_ep)
}

/// A byte channel to an FTDI bridge chip.
pub struct FtdiBridge {
    handle: nusb::Interface,
    config: &'static BridgeConfig,
    chip: ChipType,
    interface_index: u16,
    read_ep: u8,
    write_ep: u8,
    read_timeout: Duration,
    write_timeout: Duration,
    /// Payload bytes received past what a caller asked for.
    read_queue: VecDeque<u8>,
    reset_asserted: bool,
}

impl FtdiBridge {
    /// Opens the bridge selected by the programmer config, with optional
    /// VID/PID/interface overrides from the command line.
    pub fn open(
        config: &'static BridgeConfig,
        vid: Option<u16>,
        pid: Option<u16>,
        interface: Option<u8>,
    ) -> Result<Self, ProbeError> {
        let vid = vid.unwrap_or(config.vid);
        let pid = pid.unwrap_or(config.pid);
        let interface = interface.unwrap_or(config.interface);

        let device_info = nusb::list_devices()
            .map_err(ProbeError::Usb)?
            .find(|info| info.vendor_id() == vid && info.product_id() == pid)
            .ok_or(ProbeError::DeviceNotFound { vid, pid })?;

        let chip = ChipType::detect(device_info.device_version())?;
        tracing::debug!(
            "opening {} bridge {:04x}:{:04x} interface {} ({:?})",
            config.name,
            vid,
            pid,
            interface,
            chip
        );

        let device = device_info.open().map_err(ProbeError::Usb)?;
        let handle = device
            .claim_interface(interface)
            .map_err(ProbeError::Usb)?;

        let (read_ep, write_ep) = endpoints(interface);

        Ok(Self {
            handle,
            config,
            chip,
            interface_index: u16::from(interface) + 1,
            read_ep,
            write_ep,
            read_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(5),
            read_queue: VecDeque::new(),
            reset_asserted: false,
        })
    }

    fn sio_write(&mut self, request: u8, value: u16) -> Result<(), ProbeError> {
        self.handle
            .control_out_blocking(
                Control {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index: self.interface_index,
                },
                &[],
                self.write_timeout,
            )
            .map_err(|e| ProbeError::Usb(io::Error::other(e)))?;
        Ok(())
    }

    fn set_bitmode(&mut self, bitmask: u8, mode: u8) -> Result<(), ProbeError> {
        self.sio_write(
            SIO_SET_BITMODE_REQUEST,
            u16::from_le_bytes([bitmask, mode]),
        )
    }

    fn set_pins(&mut self) -> Result<(), ProbeError> {
        let cmd = [
            MPSSE_SET_BITS_LOW,
            self.config.levels(self.reset_asserted),
            self.config.directions(true),
        ];
        self.write_bytes(&cmd)
    }
}

impl Transport for FtdiBridge {
    fn write_bytes(&mut self, data: &[u8]) -> Result<(), ProbeError> {
        tracing::trace!("bridge write: {:02x?}", data);
        let completion = block_on(self.handle.bulk_out(self.write_ep, data.to_vec()));
        completion
            .status
            .map_err(|e| ProbeError::Usb(io::Error::other(e)))?;
        Ok(())
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<(), ProbeError> {
        let mut filled = 0;
        let deadline = Instant::now() + self.read_timeout;

        while filled < buf.len() {
            while filled < buf.len() {
                match self.read_queue.pop_front() {
                    Some(byte) => {
                        buf[filled] = byte;
                        filled += 1;
                    }
                    None => break,
                }
            }
            if filled == buf.len() {
                break;
            }

            if Instant::now() >= deadline {
                tracing::warn!("bridge read timed out with {}/{} bytes", filled, buf.len());
                return Err(ProbeError::Timeout);
            }

            let completion = block_on(self.handle.bulk_in(self.read_ep, RequestBuffer::new(512)));
            completion
                .status
                .map_err(|e| ProbeError::Usb(io::Error::other(e)))?;

            // Every bulk packet leads with two modem-status bytes.
            if completion.data.len() > 2 {
                self.read_queue.extend(&completion.data[2..]);
            }
        }

        tracing::trace!("bridge read: {:02x?}", &buf[..filled]);
        Ok(())
    }

    fn assert_reset(&mut self) -> Result<(), ProbeError> {
        tracing::debug!("asserting target reset");
        self.reset_asserted = true;
        self.set_pins()
    }

    fn release_reset(&mut self) -> Result<(), ProbeError> {
        tracing::debug!("releasing target reset");
        self.reset_asserted = false;
        self.set_pins()
    }

    fn configure(&mut self) -> Result<(), ProbeError> {
        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_SIO)?;
        self.set_bitmode(self.config.directions(true), BITMODE_MPSSE)?;
        self.sio_write(SIO_SET_LATENCY_TIMER_REQUEST, 1)?;
        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_PURGE_TX)?;
        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_PURGE_RX)?;
        self.read_queue.clear();

        // Command-level setup: loopback off, clock divider, and on H parts
        // the divide-by-5 compatibility prescaler off.
        let [div_lo, div_hi] = self.config.clock_divisor.to_le_bytes();
        let mut setup = vec![0x85, 0x86, div_lo, div_hi];
        if self.chip.has_divide_by_5() {
            setup.insert(0, 0x8A);
        }
        self.write_bytes(&setup)?;

        self.set_pins()
    }
}

impl Drop for FtdiBridge {
    fn drop(&mut self) {
        // Hand the pins back on every exit path.
        let _ = self.set_bitmode(0xFF, BITMODE_RESET);
    }
}
