//! A software model of the cable and target used by the integration
//! tests: a CPLD decoder for the two-mode wire protocol, an IEEE 1149.1
//! TAP, and a MIPS32 core with its EJTAG front end, complete enough to
//! execute the debug routines instruction by instruction.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};

use usb_blaster_ejtag::probe::common::TapState;
use usb_blaster_ejtag::probe::usb_blaster::backend::UsbBlasterBackend;
use usb_blaster_ejtag::probe::DebugProbeError;

/// IDCODE the simulated TAP reports.
pub const TEST_IDCODE: u32 = 0x020B_30DD;
/// IMPCODE the simulated EJTAG block reports.
pub const TEST_IMPCODE: u32 = 0x2040_4000;

/// Something on the far end of the JTAG header.
///
/// One call is one full TCK cycle; the returned level is the TDO the
/// device presented during that cycle.
pub trait ChainDevice: Send {
    fn clock(&mut self, tms: bool, tdi: bool) -> bool;
}

/// TDO wired straight to TDI.
#[derive(Debug, Default)]
pub struct Loopback;

impl ChainDevice for Loopback {
    fn clock(&mut self, _tms: bool, tdi: bool) -> bool {
        tdi
    }
}

/// Decodes the USB-Blaster byte stream and drives a chain device.
///
/// Checks the protocol laws as it consumes bytes: packets fit the
/// endpoint, byte-shift headers carry a valid length and only ever arrive
/// with TCK low.
pub struct VirtualCable {
    device: Box<dyn ChainDevice>,
    replies: VecDeque<u8>,

    tck: bool,
    tms: bool,
    tdi: bool,
    tdo: bool,

    shift_remaining: usize,
    shift_read: bool,
}

impl std::fmt::Debug for VirtualCable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualCable")
            .field("replies", &self.replies.len())
            .field("tck", &self.tck)
            .finish()
    }
}

impl VirtualCable {
    pub fn new(device: Box<dyn ChainDevice>) -> Self {
        Self {
            device,
            replies: VecDeque::new(),
            tck: false,
            tms: false,
            tdi: false,
            tdo: false,
            shift_remaining: 0,
            shift_read: false,
        }
    }

    fn consume(&mut self, byte: u8) {
        if self.shift_remaining > 0 {
            // Byte-shift payload: eight full TCK cycles, LSB first.
            let mut tdo_byte = 0u8;
            for i in 0..8 {
                let tdi = byte & (1 << i) != 0;
                let tdo = self.device.clock(self.tms, tdi);
                tdo_byte |= (tdo as u8) << i;
                self.tdi = tdi;
            }
            self.shift_remaining -= 1;
            if self.shift_read {
                self.replies.push_back(tdo_byte);
            }
            self.tck = false;
        } else if byte & 0x80 != 0 {
            assert!(!self.tck, "byte-shift header arrived with TCK high");
            let n = (byte & 0x3f) as usize;
            assert!((1..=63).contains(&n), "byte-shift header with length {n}");
            self.shift_remaining = n;
            self.shift_read = byte & 0x40 != 0;
        } else {
            let tms = byte & 0x02 != 0;
            let tdi = byte & 0x10 != 0;
            let tck = byte & 0x01 != 0;
            if tck && !self.tck {
                self.tdo = self.device.clock(tms, tdi);
            }
            if byte & 0x40 != 0 {
                self.replies.push_back(self.tdo as u8);
            }
            self.tck = tck;
            self.tms = tms;
            self.tdi = tdi;
        }
    }
}

impl UsbBlasterBackend for VirtualCable {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.replies.len());
        for slot in &mut buf[..n] {
            *slot = self.replies.pop_front().unwrap();
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        assert!(buf.len() <= 64, "USB packet exceeds the endpoint size");
        for &byte in buf {
            self.consume(byte);
        }
        Ok(buf.len())
    }

    fn set_speed(&mut self, speed_khz: u32) -> Result<u32, DebugProbeError> {
        Ok(speed_khz)
    }
}

/// Data registers behind a TAP.
pub trait TapTarget: Send {
    fn ir_len(&self) -> usize;
    /// IR value preloaded by Test-Logic-Reset.
    fn reset_ir(&self) -> u32;
    /// Parallel-load the DR selected by `ir`; returns value and length.
    fn capture_dr(&mut self, ir: u32) -> (u64, usize);
    /// Latch the shifted DR back into the selected register.
    fn update_dr(&mut self, ir: u32, value: u64, len: usize);
}

/// An IEEE 1149.1 TAP in front of a [`TapTarget`].
///
/// Tracks its state with the same transition function the driver uses,
/// which the parity tests compare against the driver's tracker.
pub struct TapDevice {
    target: Box<dyn TapTarget>,
    pub state: TapState,
    ir: u32,
    ir_shift: u64,
    dr: u64,
    dr_len: usize,
}

impl TapDevice {
    pub fn new(target: Box<dyn TapTarget>) -> Self {
        let ir = target.reset_ir();
        Self {
            target,
            state: TapState::Reset,
            ir,
            ir_shift: 0,
            dr: 0,
            dr_len: 1,
        }
    }
}

impl ChainDevice for TapDevice {
    fn clock(&mut self, tms: bool, tdi: bool) -> bool {
        let tdo = match self.state {
            TapState::DrShift => self.dr & 1 != 0,
            TapState::IrShift => self.ir_shift & 1 != 0,
            _ => false,
        };

        // Rising-edge action of the state being left.
        match self.state {
            TapState::DrCapture => {
                let (value, len) = self.target.capture_dr(self.ir);
                self.dr = value;
                self.dr_len = len;
            }
            TapState::DrShift => {
                self.dr = (self.dr >> 1) | ((tdi as u64) << (self.dr_len - 1));
            }
            TapState::IrCapture => {
                // Mandatory 01 capture pattern.
                self.ir_shift = 0b01;
            }
            TapState::IrShift => {
                self.ir_shift =
                    (self.ir_shift >> 1) | ((tdi as u64) << (self.target.ir_len() - 1));
            }
            _ => {}
        }

        self.state = self.state.step(tms);

        match self.state {
            TapState::Reset => self.ir = self.target.reset_ir(),
            TapState::DrUpdate => {
                let (dr, len) = (self.dr, self.dr_len);
                self.target.update_dr(self.ir, dr, len);
            }
            TapState::IrUpdate => {
                self.ir = (self.ir_shift as u32) & ((1 << self.target.ir_len()) - 1);
            }
            _ => {}
        }

        tdo
    }
}

// EJTAG instruction register values, as the hardware defines them.
const IR_IDCODE: u32 = 0x01;
const IR_IMPCODE: u32 = 0x03;
const IR_ADDRESS: u32 = 0x08;
const IR_DATA: u32 = 0x09;
const IR_CONTROL: u32 = 0x0a;
const IR_FASTDATA: u32 = 0x0e;

// EJTAG control register bits.
const CTRL_DM: u32 = 1 << 3;
const CTRL_PROBEN: u32 = 1 << 15;
const CTRL_PRACC: u32 = 1 << 18;
const CTRL_PRNW: u32 = 1 << 19;

const DMSEG_BASE: u32 = 0xFF20_0000;
const DMSEG_END: u32 = 0xFF30_0000;
const FASTDATA_AREA: u32 = 0xFF20_0000;
const DEBUG_VECTOR: u32 = 0xFF20_0200;

/// What the core is suspended on.
#[derive(Debug, Clone, Copy)]
enum Waiting {
    Fetch,
    Load { rt: u32 },
    Store,
}

/// A dmseg access waiting for the probe.
#[derive(Debug, Clone, Copy)]
struct Pending {
    addr: u32,
    store: bool,
    /// Store data on its way to the probe.
    data: u32,
}

/// Register and PC state of the simulated core.
#[derive(Debug)]
struct Cpu {
    pc: u32,
    next_pc: u32,
    gpr: [u32; 32],
    hi: u32,
    lo: u32,
    cop0: [u32; 32],
}

impl Cpu {
    fn new() -> Self {
        Self {
            pc: DEBUG_VECTOR,
            next_pc: DEBUG_VECTOR + 4,
            gpr: [0; 32],
            hi: 0,
            lo: 0,
            cop0: [0; 32],
        }
    }

    fn set_gpr(&mut self, index: u32, value: u32) {
        if index != 0 {
            self.gpr[index as usize] = value;
        }
    }
}

/// A MIPS32 core halted in debug mode, with the EJTAG registers in front
/// of it. Executes the template ISA with branch delay slots and turns
/// every dmseg fetch, load and store into a PrAcc handshake.
pub struct MipsTarget {
    cpu: Cpu,
    mem: HashMap<u32, u8>,

    pending: Option<Pending>,
    waiting: Option<Waiting>,
    /// Last value the probe put into the DATA register.
    data_latch: u32,

    /// When set, the control register never reports a pending access.
    pub stall_pracc: bool,

    /// Count stores into this address range (used to watch handler
    /// uploads into the working area).
    pub store_watch: Option<(u32, u32)>,
    pub watched_stores: usize,
}

impl MipsTarget {
    pub fn new() -> Self {
        Self {
            cpu: Cpu::new(),
            mem: HashMap::new(),
            pending: None,
            waiting: None,
            data_latch: 0,
            stall_pracc: false,
            store_watch: None,
            watched_stores: 0,
        }
    }

    fn is_dmseg(addr: u32) -> bool {
        (DMSEG_BASE..DMSEG_END).contains(&addr)
    }

    pub fn write_word(&mut self, addr: u32, value: u32) {
        for (i, byte) in value.to_le_bytes().into_iter().enumerate() {
            self.mem.insert(addr + i as u32, byte);
        }
    }

    pub fn read_word(&self, addr: u32) -> u32 {
        let mut bytes = [0u8; 4];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = *self.mem.get(&(addr + i as u32)).unwrap_or(&0);
        }
        u32::from_le_bytes(bytes)
    }

    fn load_direct(&self, addr: u32, bytes: u32) -> u32 {
        let mut value = 0u32;
        for i in 0..bytes {
            value |= (*self.mem.get(&(addr + i)).unwrap_or(&0) as u32) << (8 * i);
        }
        value
    }

    fn store_direct(&mut self, addr: u32, value: u32, bytes: u32) {
        if let Some((start, end)) = self.store_watch {
            if (start..end).contains(&addr) {
                self.watched_stores += 1;
            }
        }
        for i in 0..bytes {
            self.mem.insert(addr + i, (value >> (8 * i)) as u8);
        }
    }

    /// Run the core until it suspends on a dmseg access.
    fn ensure_pending(&mut self) {
        while self.pending.is_none() {
            let pc = self.cpu.pc;
            if Self::is_dmseg(pc) {
                self.pending = Some(Pending {
                    addr: pc,
                    store: false,
                    data: 0,
                });
                self.waiting = Some(Waiting::Fetch);
                return;
            }
            let instr = self.load_direct(pc, 4);
            self.retire(instr);
        }
    }

    /// Complete the suspended access with the probe's data word.
    fn complete(&mut self, word: u32) {
        self.pending = None;
        match self.waiting.take() {
            Some(Waiting::Fetch) => self.retire(word),
            Some(Waiting::Load { rt }) => self.cpu.set_gpr(rt, word),
            Some(Waiting::Store) | None => {}
        }
    }

    /// Execute one instruction, with MIPS delay-slot PC sequencing.
    fn retire(&mut self, instr: u32) {
        let cur = self.cpu.pc;
        self.cpu.pc = self.cpu.next_pc;
        self.cpu.next_pc = self.cpu.next_pc.wrapping_add(4);

        let op = instr >> 26;
        let rs = (instr >> 21) & 0x1f;
        let rt = (instr >> 16) & 0x1f;
        let rd = (instr >> 11) & 0x1f;
        let funct = instr & 0x3f;
        let imm = instr & 0xffff;
        let simm = imm as u16 as i16 as i32;

        let branch_target = |pc: u32| pc.wrapping_add(4).wrapping_add((simm << 2) as u32);

        match op {
            0x00 => match funct {
                0x00 => {} // sll $0 / nop
                0x08 => self.cpu.next_pc = self.cpu.gpr[rs as usize], // jr
                0x10 => { let hi = self.cpu.hi; self.cpu.set_gpr(rd, hi) } // mfhi
                0x11 => self.cpu.hi = self.cpu.gpr[rs as usize], // mthi
                0x12 => { let lo = self.cpu.lo; self.cpu.set_gpr(rd, lo) } // mflo
                0x13 => self.cpu.lo = self.cpu.gpr[rs as usize], // mtlo
                _ => panic!("unimplemented SPECIAL function {funct:#04x}"),
            },
            0x10 => match rs {
                0x00 => { let value = self.cpu.cop0[rd as usize]; self.cpu.set_gpr(rt, value) } // mfc0
                0x04 => self.cpu.cop0[rd as usize] = self.cpu.gpr[rt as usize], // mtc0
                _ => panic!("unimplemented COP0 rs {rs:#04x}"),
            },
            0x04 => {
                // beq
                if self.cpu.gpr[rs as usize] == self.cpu.gpr[rt as usize] {
                    self.cpu.next_pc = branch_target(cur);
                }
            }
            0x05 => {
                // bne
                if self.cpu.gpr[rs as usize] != self.cpu.gpr[rt as usize] {
                    self.cpu.next_pc = branch_target(cur);
                }
            }
            0x08 => {
                let value = self.cpu.gpr[rs as usize].wrapping_add(simm as u32);
                self.cpu.set_gpr(rt, value); // addi
            }
            0x0d => {
                let value = self.cpu.gpr[rs as usize] | imm;
                self.cpu.set_gpr(rt, value); // ori
            }
            0x0f => self.cpu.set_gpr(rt, imm << 16), // lui
            0x23 | 0x24 | 0x25 => {
                // lw / lbu / lhu
                let addr = self.cpu.gpr[rs as usize].wrapping_add(simm as u32);
                if Self::is_dmseg(addr) {
                    self.pending = Some(Pending {
                        addr,
                        store: false,
                        data: 0,
                    });
                    self.waiting = Some(Waiting::Load { rt });
                } else {
                    let bytes = match op {
                        0x23 => 4,
                        0x25 => 2,
                        _ => 1,
                    };
                    let value = self.load_direct(addr, bytes);
                    self.cpu.set_gpr(rt, value);
                }
            }
            0x28 | 0x29 | 0x2b => {
                // sb / sh / sw
                let addr = self.cpu.gpr[rs as usize].wrapping_add(simm as u32);
                let value = self.cpu.gpr[rt as usize];
                if Self::is_dmseg(addr) {
                    self.pending = Some(Pending {
                        addr,
                        store: true,
                        data: value,
                    });
                    self.waiting = Some(Waiting::Store);
                } else {
                    let bytes = match op {
                        0x2b => 4,
                        0x29 => 2,
                        _ => 1,
                    };
                    self.store_direct(addr, value, bytes);
                }
            }
            _ => panic!("unimplemented opcode {op:#04x} in {instr:#010x}"),
        }
    }
}

impl TapTarget for MipsTarget {
    fn ir_len(&self) -> usize {
        5
    }

    fn reset_ir(&self) -> u32 {
        IR_IDCODE
    }

    fn capture_dr(&mut self, ir: u32) -> (u64, usize) {
        match ir {
            IR_IDCODE => (TEST_IDCODE as u64, 32),
            IR_IMPCODE => (TEST_IMPCODE as u64, 32),
            IR_ADDRESS => {
                if !self.stall_pracc {
                    self.ensure_pending();
                }
                (self.pending.map_or(0, |p| p.addr) as u64, 32)
            }
            IR_DATA => (self.pending.map_or(0, |p| p.data) as u64, 32),
            IR_CONTROL => {
                let mut ctrl = CTRL_DM | CTRL_PROBEN;
                if !self.stall_pracc {
                    self.ensure_pending();
                    if let Some(pending) = self.pending {
                        ctrl |= CTRL_PRACC;
                        if pending.store {
                            ctrl |= CTRL_PRNW;
                        }
                    }
                }
                (ctrl as u64, 32)
            }
            IR_FASTDATA => {
                if !self.stall_pracc {
                    self.ensure_pending();
                }
                let pending = self.pending.filter(|p| p.addr == FASTDATA_AREA);
                let spracc = pending.is_some() as u64;
                let data = pending.map_or(0, |p| p.data) as u64;
                ((data << 1) | spracc, 33)
            }
            _ => (0, 1),
        }
    }

    fn update_dr(&mut self, ir: u32, value: u64, _len: usize) {
        match ir {
            IR_DATA => self.data_latch = value as u32,
            IR_CONTROL => {
                // Writing the pending bit back low completes the access.
                if value as u32 & CTRL_PRACC == 0 && self.pending.is_some() {
                    let word = self.data_latch;
                    self.complete(word);
                }
            }
            IR_FASTDATA => {
                // SPrAcc shifted in low completes a fastdata-area access.
                let complete = value & 1 == 0;
                if complete && self.pending.is_some_and(|p| p.addr == FASTDATA_AREA) {
                    let word = (value >> 1) as u32;
                    self.complete(word);
                }
            }
            _ => {}
        }
    }
}

/// A [`MipsTarget`] shared between the cable (which owns the chain) and
/// the test body (which inspects memory and counters).
#[derive(Clone)]
pub struct SharedTarget(pub Arc<Mutex<MipsTarget>>);

impl SharedTarget {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(MipsTarget::new())))
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, MipsTarget> {
        self.0.lock().unwrap()
    }
}

impl TapTarget for SharedTarget {
    fn ir_len(&self) -> usize {
        self.lock().ir_len()
    }

    fn reset_ir(&self) -> u32 {
        self.lock().reset_ir()
    }

    fn capture_dr(&mut self, ir: u32) -> (u64, usize) {
        self.lock().capture_dr(ir)
    }

    fn update_dr(&mut self, ir: u32, value: u64, len: usize) {
        self.lock().update_dr(ir, value, len)
    }
}

/// A [`TapDevice`] whose state the test body can still observe.
pub struct SharedTap(pub Arc<Mutex<TapDevice>>);

impl ChainDevice for SharedTap {
    fn clock(&mut self, tms: bool, tdi: bool) -> bool {
        self.0.lock().unwrap().clock(tms, tdi)
    }
}
