//! On-chip debugging of MIPS32 targets through Altera USB-Blaster probes.
//!
//! This crate drives the two-mode wire protocol of the USB-Blaster family of
//! JTAG adapters (an FTDI FT245 bridge in front of a CPLD) and layers the
//! MIPS EJTAG processor-access (PrAcc) debug protocol on top of it. It is
//! built around two session objects:
//!
//! - [`probe::usb_blaster::UsbBlaster`], the cable session. It owns the USB
//!   transport, the 64-byte packet window and the TAP state tracker, and
//!   executes queues of [`probe::JtagCommand`]s.
//! - [`architecture::mips::Mips32`], the target session. It borrows the cable
//!   and implements memory and register access for a core halted in debug
//!   mode, by feeding it short MIPS instruction sequences through the debug
//!   memory segment.
//!
//! # Example
//!
//! ```no_run
//! use usb_blaster_ejtag::architecture::mips::Mips32;
//! use usb_blaster_ejtag::probe::usb_blaster::{UsbBlaster, UsbBlasterOptions};
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut probe = UsbBlaster::open(&UsbBlasterOptions::default())?;
//! let mut target = Mips32::attach(&mut probe)?;
//!
//! let word = target.read_u32(0x8000_0000)?;
//! println!("first word of kseg0: {word:#010x}");
//! # Ok(())
//! # }
//! ```

pub mod architecture;
pub mod probe;

pub use crate::architecture::mips::MipsError;
pub use crate::probe::{DebugProbeError, ProbeCreationError};
