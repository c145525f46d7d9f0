//! Probe layer: the USB-Blaster cable driver and its supporting types.

pub mod common;
pub(crate) mod usb_util;

pub mod usb_blaster;

use bitvec::prelude::*;

use crate::probe::common::TapState;

/// This error occurs whenever the probe logic encounters an error while
/// operating the cable.
#[derive(thiserror::Error, Debug, docsplay::Display)]
pub enum DebugProbeError {
    /// USB Communication Error
    Usb(#[source] std::io::Error),

    /// A scan or encoding precondition was violated: {0}
    Protocol(&'static str),

    /// No low-level backend is registered under the name '{0}'.
    BackendNotFound(String),

    /// The debug probe could not be created.
    ProbeCouldNotBeCreated(#[from] ProbeCreationError),

    /// A timeout occurred during probe operation.
    Timeout,

    /// Some other error occurred.
    #[display("{0}")]
    Other(#[from] anyhow::Error),
}

/// An error during probe creation occurred.
/// This is almost always a sign of a bad USB setup.
#[derive(thiserror::Error, Debug, docsplay::Display)]
pub enum ProbeCreationError {
    /// The selected probe was not found. This can be due to permissions.
    NotFound,
    /// The selected USB device could not be opened.
    CouldNotOpen,
    /// A USB error occurred.
    Usb(#[source] std::io::Error),
    /// Something else happened.
    #[display("{0}")]
    Other(&'static str),
}

/// Direction of a scan: whether TDO has to be captured while TDI is
/// shifted out.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScanType {
    /// Capture TDO only; TDI shifts zeroes.
    In,
    /// Shift TDI out, discard TDO.
    Out,
    /// Shift TDI out and capture TDO.
    Io,
}

impl ScanType {
    /// Returns true if the scan needs TDO data back from the cable.
    pub fn captures(self) -> bool {
        matches!(self, ScanType::In | ScanType::Io)
    }
}

/// A single IR or DR scan through the TAP.
///
/// `data` carries the TDI bits in index order (bit 0 first on the wire).
/// For capturing scans the TDO bits replace `data` at the same indices
/// once the command has executed.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    /// Scan the instruction register instead of the data register.
    pub ir: bool,
    /// Whether TDO is captured.
    pub scan_type: ScanType,
    /// TDI bits, LSB-first; length is the scan length in bits.
    pub data: BitVec<u8, Lsb0>,
    /// TAP state to settle in after the scan.
    pub end_state: TapState,
}

/// One queued JTAG operation.
///
/// Commands are handed to [`usb_blaster::UsbBlaster::execute_queue`] which
/// dispatches them in order and stops at the first error.
#[derive(Debug)]
pub enum JtagCommand {
    /// Assert/deassert the reset lines. The cable has no reset wiring, so
    /// only the TAP tracker is affected (`trst` forces Test-Logic-Reset).
    Reset {
        /// Assert TRST.
        trst: bool,
        /// Assert SRST.
        srst: bool,
    },
    /// Clock `cycles` TCK cycles in Run-Test/Idle, then move to `end_state`.
    Runtest {
        /// Number of TCK cycles to spend in Run-Test/Idle.
        cycles: usize,
        /// TAP state to settle in afterwards.
        end_state: TapState,
    },
    /// Clock `cycles` TCK cycles without changing TAP state.
    StableClocks {
        /// Number of TCK cycles.
        cycles: usize,
    },
    /// Move the TAP to `end_state` along the shortest TMS path.
    StateMove {
        /// Target TAP state.
        end_state: TapState,
    },
    /// Walk the TAP through the given sequence of adjacent states.
    PathMove(Vec<TapState>),
    /// Clock out a raw TMS bit sequence, LSB-first.
    TmsSeq {
        /// TMS bits, bit 0 first.
        bits: u8,
        /// Number of bits, between 1 and 8.
        len: usize,
    },
    /// Stall for the given number of microseconds.
    Sleep {
        /// Microseconds to sleep.
        us: u64,
    },
    /// Shift the instruction or data register.
    Scan(ScanRequest),
}
