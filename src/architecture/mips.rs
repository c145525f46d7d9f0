//! MIPS32 target support over EJTAG.
//!
//! A MIPS32 core halted in debug mode executes out of dmseg, a virtual
//! memory segment serviced entirely by the probe: every fetch, load and
//! store in that segment becomes a handshake over the EJTAG data
//! registers. [`Mips32`] feeds short pre-assembled code sequences to the
//! core this way to move memory and registers in and out.

pub mod assembly;
pub mod ejtag;
pub mod pracc;

pub use ejtag::{Ejtag, EjtagControl, EjtagInstruction};
pub use pracc::{FastdataDir, Mips32, WorkingArea};

use crate::probe::DebugProbeError;

/// Number of entries in the core register block: 32 GPRs followed by
/// status, lo, hi, badvaddr, cause and depc.
pub const NUM_CORE_REGS: usize = 38;

/// Indices of the non-GPR entries in the core register block.
pub mod core_reg {
    /// COP0 Status.
    pub const STATUS: usize = 32;
    /// Multiply/divide LO.
    pub const LO: usize = 33;
    /// Multiply/divide HI.
    pub const HI: usize = 34;
    /// COP0 BadVAddr.
    pub const BADVADDR: usize = 35;
    /// COP0 Cause.
    pub const CAUSE: usize = 36;
    /// COP0 DEPC: the PC the core resumes at when leaving debug mode.
    pub const DEPC: usize = 37;
}

/// This error occurs when talking to a MIPS32 target goes wrong.
#[derive(thiserror::Error, Debug, docsplay::Display)]
pub enum MipsError {
    /// An error with the debug probe occurred.
    Probe(#[from] DebugProbeError),

    /// No processor access was pending within the timeout.
    ///
    /// The core is not halted in debug mode, or it is not executing from
    /// dmseg.
    #[ignore_extra_doc_attributes]
    Timeout,

    /// The processor accessed the unexpected dmseg address {0:#010x}.
    UnexpectedAddress(u32),

    /// The processor access stack over- or underflowed.
    PraccStack,

    /// A fastdata transfer failed: no processor access was pending when a
    /// word was scanned.
    FastdataFailed,

    /// The working area ({available} bytes) is too small for the fastdata
    /// handler ({required} bytes).
    WorkingAreaTooSmall {
        /// Bytes the handler needs.
        required: u32,
        /// Bytes the area offers.
        available: u32,
    },
}
