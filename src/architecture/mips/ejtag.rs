//! EJTAG TAP access: the instruction set, the control register and the
//! data-register scan primitives the PrAcc engine is built from.

use bitfield::bitfield;
use bitvec::prelude::*;

use crate::architecture::mips::pracc::FastdataDir;
use crate::architecture::mips::MipsError;
use crate::probe::common::{IdCode, TapState};
use crate::probe::usb_blaster::UsbBlaster;
use crate::probe::{DebugProbeError, JtagCommand, ScanRequest, ScanType};

/// Length of the EJTAG instruction register.
const IR_LEN: usize = 5;

/// EJTAG instruction register values.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum EjtagInstruction {
    /// Select the device identification register.
    IdCode = 0x01,
    /// Select the implementation register.
    ImpCode = 0x03,
    /// Select the PrAcc address register.
    Address = 0x08,
    /// Select the PrAcc data register.
    Data = 0x09,
    /// Select the EJTAG control register.
    Control = 0x0a,
    /// Select address, data and control chained together.
    All = 0x0b,
    /// Make the core trap into debug mode straight out of reset.
    EjtagBoot = 0x0c,
    /// Boot normally after reset.
    NormalBoot = 0x0d,
    /// Select the fastdata register (SPrAcc + data).
    Fastdata = 0x0e,
    /// Bypass.
    Bypass = 0x1f,
}

bitfield! {
    /// The EJTAG control register, restricted to the bits this engine
    /// reads or writes.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct EjtagControl(u32);
    impl Debug;

    /// The core is in debug mode.
    pub dm, set_dm: 3;
    /// Requests a debug interrupt exception.
    pub ejtag_brk, set_ejtag_brk: 12;
    /// Peripheral reset applied.
    pub per_rst, set_per_rst: 20;
    /// Processor reset applied.
    pub pr_rst, set_pr_rst: 16;
    /// Probe enable: dmseg accesses are serviced by the probe.
    pub prob_en, set_prob_en: 15;
    /// A processor access is pending. Cleared by the probe to let the
    /// processor continue.
    pub pracc, set_pracc: 18;
    /// Direction of the pending access: set for a processor write.
    pub prnw, set_prnw: 19;
    /// A reset occurred since the bit was last cleared.
    pub rocc, set_rocc: 31;
}

/// An EJTAG session on a probe.
///
/// Non-capturing scans are queued and ride along with the next capturing
/// scan (or an explicit [`Ejtag::execute`]), so a handshake like "shift
/// data out, clear the pending bit, poll control" costs a single queue
/// execution per poll.
pub struct Ejtag<'probe> {
    probe: &'probe mut UsbBlaster,
    queue: Vec<JtagCommand>,

    /// Shadow of the control word written during handshakes. Carries
    /// PrAcc and ProbEn so that polling does not disturb a pending
    /// access; clearing PrAcc is done on a copy.
    pub(crate) ejtag_ctrl: u32,

    /// Direction of the fastdata handler currently uploaded to the
    /// working area, if any.
    pub(crate) fast_access_save: Option<FastdataDir>,
}

impl std::fmt::Debug for Ejtag<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ejtag")
            .field("ejtag_ctrl", &EjtagControl(self.ejtag_ctrl))
            .field("fast_access_save", &self.fast_access_save)
            .finish()
    }
}

impl<'probe> Ejtag<'probe> {
    /// Create a session. No wire traffic happens until the first scan.
    pub fn new(probe: &'probe mut UsbBlaster) -> Self {
        let mut ctrl = EjtagControl(0);
        ctrl.set_pracc(true);
        ctrl.set_prob_en(true);

        Self {
            probe,
            queue: Vec::new(),
            ejtag_ctrl: ctrl.0,
            fast_access_save: None,
        }
    }

    /// Queue an instruction register load.
    pub fn set_instr(&mut self, instr: EjtagInstruction) {
        let mut data = bitvec![u8, Lsb0; 0; IR_LEN];
        data.store_le(instr as u8);
        self.queue.push(JtagCommand::Scan(ScanRequest {
            ir: true,
            scan_type: ScanType::Out,
            data,
            end_state: TapState::Idle,
        }));
    }

    /// Queue a 32-bit data register shift without capture.
    pub fn drscan_32_out(&mut self, value: u32) {
        let mut data = bitvec![u8, Lsb0; 0; 32];
        data.store_le(value);
        self.queue.push(JtagCommand::Scan(ScanRequest {
            ir: false,
            scan_type: ScanType::Out,
            data,
            end_state: TapState::Idle,
        }));
    }

    /// Shift 32 bits out while capturing the 32 bits coming back.
    ///
    /// Executes everything queued so far first, preserving order.
    pub fn drscan_32(&mut self, value: u32) -> Result<u32, DebugProbeError> {
        let mut data = bitvec![u8, Lsb0; 0; 32];
        data.store_le(value);

        let mut commands = std::mem::take(&mut self.queue);
        commands.push(JtagCommand::Scan(ScanRequest {
            ir: false,
            scan_type: ScanType::Io,
            data,
            end_state: TapState::Idle,
        }));
        self.probe.execute_queue(&mut commands)?;

        let Some(JtagCommand::Scan(request)) = commands.last() else {
            unreachable!()
        };
        Ok(request.data.load_le())
    }

    /// One fastdata scan: the 1-bit SPrAcc handshake plus 32 data bits.
    ///
    /// A zero is shifted into SPrAcc to complete the pending processor
    /// access; the captured SPrAcc must read back set, meaning an access
    /// was actually pending, otherwise the transfer has derailed. On a
    /// write the given word goes out; the captured word is returned either
    /// way and is the target's data on a read.
    pub fn fastdata_scan(&mut self, dir: FastdataDir, word: u32) -> Result<u32, MipsError> {
        let mut data = bitvec![u8, Lsb0; 0; 33];
        if dir == FastdataDir::Write {
            data[1..].store_le(word);
        }

        let mut commands = std::mem::take(&mut self.queue);
        commands.push(JtagCommand::Scan(ScanRequest {
            ir: false,
            scan_type: ScanType::Io,
            data,
            end_state: TapState::Idle,
        }));
        self.probe.execute_queue(&mut commands)?;

        let Some(JtagCommand::Scan(request)) = commands.last() else {
            unreachable!()
        };
        if !request.data[0] {
            return Err(MipsError::FastdataFailed);
        }
        Ok(request.data[1..].load_le())
    }

    /// Execute everything queued so far.
    pub fn execute(&mut self) -> Result<(), DebugProbeError> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let mut commands = std::mem::take(&mut self.queue);
        self.probe.execute_queue(&mut commands)
    }

    /// Read the device identification register.
    pub fn read_idcode(&mut self) -> Result<IdCode, DebugProbeError> {
        self.set_instr(EjtagInstruction::IdCode);
        Ok(IdCode(self.drscan_32(0)?))
    }

    /// Read the implementation register.
    pub fn read_impcode(&mut self) -> Result<u32, DebugProbeError> {
        self.set_instr(EjtagInstruction::ImpCode);
        self.drscan_32(0)
    }
}
