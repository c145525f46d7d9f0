//! Structures shared across the probe layer: the TAP state machine and
//! IDCODE handling.

use bitfield::bitfield;
use once_cell::sync::Lazy;

/// The states of the IEEE 1149.1 TAP controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TapState {
    /// Test-Logic-Reset
    Reset,
    /// Run-Test/Idle
    Idle,
    /// Select-DR-Scan
    DrSelect,
    /// Capture-DR
    DrCapture,
    /// Shift-DR
    DrShift,
    /// Exit1-DR
    DrExit1,
    /// Pause-DR
    DrPause,
    /// Exit2-DR
    DrExit2,
    /// Update-DR
    DrUpdate,
    /// Select-IR-Scan
    IrSelect,
    /// Capture-IR
    IrCapture,
    /// Shift-IR
    IrShift,
    /// Exit1-IR
    IrExit1,
    /// Pause-IR
    IrPause,
    /// Exit2-IR
    IrExit2,
    /// Update-IR
    IrUpdate,
}

/// All TAP states, indexable by `state as usize`.
pub(crate) const TAP_STATES: [TapState; 16] = [
    TapState::Reset,
    TapState::Idle,
    TapState::DrSelect,
    TapState::DrCapture,
    TapState::DrShift,
    TapState::DrExit1,
    TapState::DrPause,
    TapState::DrExit2,
    TapState::DrUpdate,
    TapState::IrSelect,
    TapState::IrCapture,
    TapState::IrShift,
    TapState::IrExit1,
    TapState::IrPause,
    TapState::IrExit2,
    TapState::IrUpdate,
];

impl TapState {
    /// The state reached by clocking one TCK cycle with the given TMS level.
    pub fn step(self, tms: bool) -> TapState {
        match (self, tms) {
            (TapState::Reset, true) => TapState::Reset,
            (TapState::Reset, false) => TapState::Idle,
            (TapState::Idle, true) => TapState::DrSelect,
            (TapState::Idle, false) => TapState::Idle,
            (TapState::DrSelect, true) => TapState::IrSelect,
            (TapState::DrSelect, false) => TapState::DrCapture,
            (TapState::DrCapture, true) => TapState::DrExit1,
            (TapState::DrCapture, false) => TapState::DrShift,
            (TapState::DrShift, true) => TapState::DrExit1,
            (TapState::DrShift, false) => TapState::DrShift,
            (TapState::DrExit1, true) => TapState::DrUpdate,
            (TapState::DrExit1, false) => TapState::DrPause,
            (TapState::DrPause, true) => TapState::DrExit2,
            (TapState::DrPause, false) => TapState::DrPause,
            (TapState::DrExit2, true) => TapState::DrUpdate,
            (TapState::DrExit2, false) => TapState::DrShift,
            (TapState::DrUpdate, true) => TapState::DrSelect,
            (TapState::DrUpdate, false) => TapState::Idle,
            (TapState::IrSelect, true) => TapState::Reset,
            (TapState::IrSelect, false) => TapState::IrCapture,
            (TapState::IrCapture, true) => TapState::IrExit1,
            (TapState::IrCapture, false) => TapState::IrShift,
            (TapState::IrShift, true) => TapState::IrExit1,
            (TapState::IrShift, false) => TapState::IrShift,
            (TapState::IrExit1, true) => TapState::IrUpdate,
            (TapState::IrExit1, false) => TapState::IrPause,
            (TapState::IrPause, true) => TapState::IrExit2,
            (TapState::IrPause, false) => TapState::IrPause,
            (TapState::IrExit2, true) => TapState::IrUpdate,
            (TapState::IrExit2, false) => TapState::IrShift,
            (TapState::IrUpdate, true) => TapState::DrSelect,
            (TapState::IrUpdate, false) => TapState::Idle,
        }
    }

    /// Shortest TMS sequence from `self` to `to`.
    ///
    /// Returns the path for any state pair; moving to the current state is
    /// the empty path.
    pub fn tms_path_to(self, to: TapState) -> TmsPath {
        TMS_PATHS[self as usize][to as usize]
    }
}

/// A TMS bit sequence, bit 0 clocked first.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TmsPath {
    /// TMS bits, LSB-first.
    pub bits: u8,
    /// Number of valid bits.
    pub len: usize,
}

/// Shortest TMS paths between all state pairs, breadth-first over the
/// state graph. Expanding the TMS=0 edge first reproduces the canonical
/// sequences (e.g. Run-Test/Idle to Shift-DR is 1,0,0).
static TMS_PATHS: Lazy<[[TmsPath; 16]; 16]> = Lazy::new(|| {
    let mut table = [[TmsPath::default(); 16]; 16];
    for from in TAP_STATES {
        let mut seen = [false; 16];
        let mut queue = std::collections::VecDeque::new();
        seen[from as usize] = true;
        queue.push_back((from, TmsPath::default()));
        while let Some((state, path)) = queue.pop_front() {
            table[from as usize][state as usize] = path;
            for tms in [false, true] {
                let next = state.step(tms);
                if !seen[next as usize] && path.len < 8 {
                    seen[next as usize] = true;
                    let mut next_path = path;
                    next_path.bits |= (tms as u8) << next_path.len;
                    next_path.len += 1;
                    queue.push_back((next, next_path));
                }
            }
        }
    }
    table
});

bitfield! {
    /// A JTAG IDCODE.
    /// Identifies a particular Test Access Port (TAP) on the JTAG scan chain.
    #[derive(Copy, Clone, Eq, PartialEq)]
    pub struct IdCode(u32);
    impl Debug;

    u8;
    /// The IDCODE version.
    pub version, set_version: 31, 28;

    u16;
    /// The part number.
    pub part_number, set_part_number: 27, 12;

    /// The JEDEC JEP-106 Manufacturer ID.
    pub manufacturer, set_manufacturer: 11, 1;

    u8;
    /// The continuation code of the JEDEC JEP-106 Manufacturer ID.
    pub manufacturer_continuation, set_manufacturer_continuation: 11, 8;

    /// The identity code of the JEDEC JEP-106 Manufacturer ID.
    pub manufacturer_identity, set_manufacturer_identity: 7, 1;

    bool;
    /// The least-significant bit. Always set.
    pub lsbit, set_lsbit: 0;
}

impl std::fmt::Display for IdCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(mfn) = self.manufacturer_name() {
            write!(f, "0x{:08X} ({})", self.0, mfn)
        } else {
            write!(f, "0x{:08X}", self.0)
        }
    }
}

impl IdCode {
    /// Returns `true` iff the IDCODE's least significant bit is `1` and the
    /// 7-bit `manufacturer_identity` is one of the non-reserved values in
    /// the range `[1,126]`.
    pub fn valid(&self) -> bool {
        self.lsbit() && (self.manufacturer() != 0) && (self.manufacturer() != 127)
    }

    /// Return the manufacturer name, if available.
    pub fn manufacturer_name(&self) -> Option<&'static str> {
        let cc = self.manufacturer_continuation();
        let id = self.manufacturer_identity();
        jep106::JEP106Code::new(cc, id).get()
    }
}
