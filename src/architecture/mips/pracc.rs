//! The PrAcc engine: servicing processor accesses while a halted MIPS32
//! core executes debug code out of dmseg.
//!
//! A routine is a short pre-assembled MIPS sequence placed at the debug
//! vector (`PRACC_TEXT`). The core fetches it word by word through the
//! EJTAG handshake; loads and stores it performs inside dmseg are routed
//! by address to a parameter-in area, a parameter-out area and a small
//! software register-save stack. A routine finishes by branching back to
//! the vector: the second fetch of `PRACC_TEXT` tells the engine the pass
//! is complete.
//!
//! The MIPS branch delay slot applies throughout: the instruction after
//! every branch executes before the branch lands, which is why the
//! templates end in `b start; mfc0 $15, DeSave` pairs.

use std::time::{Duration, Instant};

use crate::architecture::mips::assembly as asm;
use crate::architecture::mips::ejtag::{Ejtag, EjtagControl, EjtagInstruction};
use crate::architecture::mips::{MipsError, NUM_CORE_REGS};
use crate::probe::usb_blaster::UsbBlaster;

/// The debug handler entry point in dmseg: every routine starts here.
pub const PRACC_TEXT: u32 = 0xFF20_0200;
/// The software register-save stack (a probe-serviced FIFO, the pointer
/// never moves).
pub const PRACC_STACK: u32 = 0xFF20_4000;
/// Parameters from the probe to the routine.
pub const PRACC_PARAM_IN: u32 = 0xFF20_1000;
/// Results from the routine to the probe.
pub const PRACC_PARAM_OUT: u32 = 0xFF20_2000;
/// The fastdata transfer window.
pub const PRACC_FASTDATA_AREA: u32 = 0xFF20_0000;

/// Bytes of target RAM the fastdata handler needs: 80 bytes of code plus
/// a register save area at the top.
pub const FASTDATA_HANDLER_SIZE: u32 = 0x80;

/// Slots in the register-save stack.
const STACK_SLOTS: usize = 32;

/// Words moved per routine pass; larger requests run multiple passes.
const BLOCK_WORDS: usize = 0x400;

/// How long to wait for the core to touch dmseg before giving up.
const PRACC_TIMEOUT: Duration = Duration::from_millis(1000);

/// A caller-allocated region of target RAM for the fastdata handler.
#[derive(Debug, Clone, Copy)]
pub struct WorkingArea {
    /// Start address in target memory.
    pub address: u32,
    /// Size in bytes.
    pub size: u32,
}

/// Direction of a fastdata transfer, seen from the probe.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FastdataDir {
    /// Target memory to probe.
    Read,
    /// Probe to target memory.
    Write,
}

/// Where in dmseg a processor access landed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum DmsegAccess {
    ParamIn(usize),
    ParamOut(usize),
    Code(usize),
    Stack,
    Other,
}

/// Borrowed state of one routine pass.
struct PraccContext<'a> {
    iparam: &'a mut [u32],
    oparam: &'a mut [u32],
    code: &'a [u32],
    stack: [u32; STACK_SLOTS],
    stack_offset: usize,
}

impl PraccContext<'_> {
    fn classify(&self, address: u32) -> DmsegAccess {
        let offset_in = |base: u32, len: usize| {
            (address >= base && address < base + 4 * len as u32)
                .then(|| ((address - base) / 4) as usize)
        };

        if let Some(offset) = offset_in(PRACC_PARAM_IN, self.iparam.len()) {
            DmsegAccess::ParamIn(offset)
        } else if let Some(offset) = offset_in(PRACC_PARAM_OUT, self.oparam.len()) {
            DmsegAccess::ParamOut(offset)
        } else if let Some(offset) = offset_in(PRACC_TEXT, self.code.len()) {
            DmsegAccess::Code(offset)
        } else if address == PRACC_STACK {
            DmsegAccess::Stack
        } else {
            DmsegAccess::Other
        }
    }
}

/// A MIPS32 target session: memory, register and fastdata access for a
/// core halted in debug mode.
#[derive(Debug)]
pub struct Mips32<'probe> {
    ejtag: Ejtag<'probe>,
}

impl<'probe> Mips32<'probe> {
    /// Attach to the target behind the probe.
    pub fn attach(probe: &'probe mut UsbBlaster) -> Result<Self, MipsError> {
        let mut ejtag = Ejtag::new(probe);
        let idcode = ejtag.read_idcode()?;
        let impcode = ejtag.read_impcode()?;
        tracing::debug!("EJTAG IDCODE {idcode}, IMPCODE {impcode:#010x}");
        Ok(Self { ejtag })
    }

    /// The underlying EJTAG session.
    pub fn ejtag(&mut self) -> &mut Ejtag<'probe> {
        &mut self.ejtag
    }

    /// Poll the control register until a processor access is pending.
    ///
    /// Returns the captured control word. Each poll writes the shadow
    /// control word back, which keeps ProbEn asserted and leaves the
    /// pending bit alone.
    fn wait_for_pracc_rw(&mut self) -> Result<u32, MipsError> {
        let start = Instant::now();

        self.ejtag.set_instr(EjtagInstruction::Control);
        self.ejtag.execute()?;

        loop {
            let ctrl = self.ejtag.drscan_32(self.ejtag.ejtag_ctrl)?;
            if EjtagControl(ctrl).pracc() {
                return Ok(ctrl);
            }

            if start.elapsed() > PRACC_TIMEOUT {
                tracing::debug!("no processor access in progress");
                return Err(MipsError::Timeout);
            }
        }
    }

    /// The shadow control word with the pending bit cleared, i.e. the
    /// value written to let the processor continue.
    fn ctrl_pracc_cleared(&self) -> u32 {
        let mut ctrl = EjtagControl(self.ejtag.ejtag_ctrl);
        ctrl.set_pracc(false);
        ctrl.0
    }

    /// Service a processor read: route the address to a data source,
    /// shift the word out and clear the pending bit.
    fn exec_read(&mut self, ctx: &mut PraccContext<'_>, address: u32) -> Result<(), MipsError> {
        let data = match ctx.classify(address) {
            DmsegAccess::ParamIn(offset) => ctx.iparam[offset],
            DmsegAccess::ParamOut(offset) => ctx.oparam[offset],
            DmsegAccess::Code(offset) => ctx.code[offset],
            DmsegAccess::Stack => {
                if ctx.stack_offset == 0 {
                    return Err(MipsError::PraccStack);
                }
                ctx.stack_offset -= 1;
                ctx.stack[ctx.stack_offset]
            }
            DmsegAccess::Other => {
                tracing::error!("error reading unexpected address {address:#010x}");
                return Err(MipsError::UnexpectedAddress(address));
            }
        };

        self.ejtag.set_instr(EjtagInstruction::Data);
        self.ejtag.drscan_32_out(data);

        // Clear the access pending bit (let the processor eat).
        let ctrl = self.ctrl_pracc_cleared();
        self.ejtag.set_instr(EjtagInstruction::Control);
        self.ejtag.drscan_32_out(ctrl);

        self.ejtag.execute()?;
        Ok(())
    }

    /// Service a processor write: read the word being stored, clear the
    /// pending bit and route the word by address.
    fn exec_write(&mut self, ctx: &mut PraccContext<'_>, address: u32) -> Result<(), MipsError> {
        self.ejtag.set_instr(EjtagInstruction::Data);
        let data = self.ejtag.drscan_32(0)?;

        let ctrl = self.ctrl_pracc_cleared();
        self.ejtag.set_instr(EjtagInstruction::Control);
        self.ejtag.drscan_32_out(ctrl);
        self.ejtag.execute()?;

        match ctx.classify(address) {
            DmsegAccess::ParamIn(offset) => ctx.iparam[offset] = data,
            DmsegAccess::ParamOut(offset) => ctx.oparam[offset] = data,
            DmsegAccess::Stack => {
                if ctx.stack_offset == STACK_SLOTS {
                    return Err(MipsError::PraccStack);
                }
                ctx.stack[ctx.stack_offset] = data;
                ctx.stack_offset += 1;
            }
            DmsegAccess::Code(_) | DmsegAccess::Other => {
                tracing::error!("error writing unexpected address {address:#010x}");
                return Err(MipsError::UnexpectedAddress(address));
            }
        }
        Ok(())
    }

    /// Run a debug routine to completion.
    ///
    /// Loops over processor accesses: wait for one, read its address, and
    /// service it in the direction the control word indicates. The first
    /// fetch of `PRACC_TEXT` seeds the routine; the second one means the
    /// routine branched back to its start and the pass is done (that fetch
    /// is left pending for the next pass). With `single_transaction`,
    /// exactly one access is serviced instead.
    pub fn pracc_exec(
        &mut self,
        code: &[u32],
        iparam: &mut [u32],
        oparam: &mut [u32],
        single_transaction: bool,
    ) -> Result<(), MipsError> {
        let mut ctx = PraccContext {
            iparam,
            oparam,
            code,
            stack: [0; STACK_SLOTS],
            stack_offset: 0,
        };
        let mut text_fetches = 0;

        loop {
            let ctrl = self.wait_for_pracc_rw()?;

            self.ejtag.set_instr(EjtagInstruction::Address);
            let address = self.ejtag.drscan_32(0)?;

            if EjtagControl(ctrl).prnw() {
                self.exec_write(&mut ctx, address)?;
            } else {
                if address == PRACC_TEXT {
                    text_fetches += 1;
                    if text_fetches == 2 {
                        break;
                    }
                }
                self.exec_read(&mut ctx, address)?;
            }

            if single_transaction {
                break;
            }
        }

        if ctx.stack_offset != 0 {
            tracing::warn!("PrAcc stack not empty on exit");
        }
        Ok(())
    }

    /// Read a single word from target memory.
    pub fn read_u32(&mut self, address: u32) -> Result<u32, MipsError> {
        const CODE: &[u32] = &[
            // start:
            asm::mtc0(15, 31, 0), // $15 to DeSave
            asm::lui(15, asm::upper16(PRACC_STACK)),
            asm::ori(15, 15, asm::lower16(PRACC_STACK)),
            asm::sw(8, 0, 15),
            asm::lw(8, asm::neg16(PRACC_STACK - PRACC_PARAM_IN), 15), // $8 = param_in[0] (address)
            asm::lw(8, 0, 8),
            asm::sw(8, asm::neg16(PRACC_STACK - PRACC_PARAM_OUT), 15), // param_out[0] = word
            asm::lw(8, 0, 15),
            asm::b(asm::neg16(9)),
            asm::mfc0(15, 31, 0), // DeSave back to $15
        ];

        let mut param_in = [address];
        let mut param_out = [0u32];
        self.pracc_exec(CODE, &mut param_in, &mut param_out, false)?;
        Ok(param_out[0])
    }

    /// Read words from target memory. `address` must be 4-byte aligned.
    pub fn read_mem32(&mut self, mut address: u32, buf: &mut [u32]) -> Result<(), MipsError> {
        if buf.len() == 1 {
            buf[0] = self.read_u32(address)?;
            return Ok(());
        }

        const CODE: &[u32] = &[
            // start:
            asm::mtc0(15, 31, 0), // $15 to DeSave
            asm::lui(15, asm::upper16(PRACC_STACK)),
            asm::ori(15, 15, asm::lower16(PRACC_STACK)),
            asm::sw(8, 0, 15),
            asm::sw(9, 0, 15),
            asm::sw(10, 0, 15),
            asm::sw(11, 0, 15),
            asm::lui(8, asm::upper16(PRACC_PARAM_IN)),
            asm::ori(8, 8, asm::lower16(PRACC_PARAM_IN)),
            asm::lw(9, 0, 8),  // $9 = source address
            asm::lw(10, 4, 8), // $10 = word count
            asm::lui(11, asm::upper16(PRACC_PARAM_OUT)),
            asm::ori(11, 11, asm::lower16(PRACC_PARAM_OUT)),
            // loop:
            asm::beq(0, 10, 8), // count exhausted -> end
            asm::NOP,
            asm::lw(8, 0, 9),
            asm::sw(8, 0, 11),
            asm::addi(10, 10, asm::neg16(1)),
            asm::addi(9, 9, 4),
            asm::addi(11, 11, 4),
            asm::b(asm::neg16(8)),
            asm::NOP,
            // end:
            asm::lw(11, 0, 15),
            asm::lw(10, 0, 15),
            asm::lw(9, 0, 15),
            asm::lw(8, 0, 15),
            asm::b(asm::neg16(27)),
            asm::mfc0(15, 31, 0), // DeSave back to $15
        ];

        let mut done = 0;
        while done < buf.len() {
            let block = (buf.len() - done).min(BLOCK_WORDS);
            let mut param_in = [address, block as u32];
            self.pracc_exec(CODE, &mut param_in, &mut buf[done..done + block], false)?;
            address += 4 * block as u32;
            done += block;
        }
        Ok(())
    }

    /// Read halfwords from target memory. `address` must be 2-byte
    /// aligned. The routine widens each halfword into a parameter-out
    /// word; they are narrowed here.
    pub fn read_mem16(&mut self, mut address: u32, buf: &mut [u16]) -> Result<(), MipsError> {
        const CODE: &[u32] = &[
            // start:
            asm::mtc0(15, 31, 0), // $15 to DeSave
            asm::lui(15, asm::upper16(PRACC_STACK)),
            asm::ori(15, 15, asm::lower16(PRACC_STACK)),
            asm::sw(8, 0, 15),
            asm::sw(9, 0, 15),
            asm::sw(10, 0, 15),
            asm::sw(11, 0, 15),
            asm::lui(8, asm::upper16(PRACC_PARAM_IN)),
            asm::ori(8, 8, asm::lower16(PRACC_PARAM_IN)),
            asm::lw(9, 0, 8),  // $9 = source address
            asm::lw(10, 4, 8), // $10 = halfword count
            asm::lui(11, asm::upper16(PRACC_PARAM_OUT)),
            asm::ori(11, 11, asm::lower16(PRACC_PARAM_OUT)),
            // loop:
            asm::beq(0, 10, 8), // count exhausted -> end
            asm::NOP,
            asm::lhu(8, 0, 9),
            asm::sw(8, 0, 11),
            asm::addi(10, 10, asm::neg16(1)),
            asm::addi(9, 9, 2),
            asm::addi(11, 11, 4),
            asm::b(asm::neg16(8)),
            asm::NOP,
            // end:
            asm::lw(11, 0, 15),
            asm::lw(10, 0, 15),
            asm::lw(9, 0, 15),
            asm::lw(8, 0, 15),
            asm::b(asm::neg16(27)),
            asm::mfc0(15, 31, 0), // DeSave back to $15
        ];

        let mut done = 0;
        while done < buf.len() {
            let block = (buf.len() - done).min(BLOCK_WORDS);
            let mut words = vec![0u32; block];
            let mut param_in = [address, block as u32];
            self.pracc_exec(CODE, &mut param_in, &mut words, false)?;
            for (dst, word) in buf[done..done + block].iter_mut().zip(&words) {
                *dst = *word as u16;
            }
            address += 2 * block as u32;
            done += block;
        }
        Ok(())
    }

    /// Read bytes from target memory.
    pub fn read_mem8(&mut self, mut address: u32, buf: &mut [u8]) -> Result<(), MipsError> {
        const CODE: &[u32] = &[
            // start:
            asm::mtc0(15, 31, 0), // $15 to DeSave
            asm::lui(15, asm::upper16(PRACC_STACK)),
            asm::ori(15, 15, asm::lower16(PRACC_STACK)),
            asm::sw(8, 0, 15),
            asm::sw(9, 0, 15),
            asm::sw(10, 0, 15),
            asm::sw(11, 0, 15),
            asm::lui(8, asm::upper16(PRACC_PARAM_IN)),
            asm::ori(8, 8, asm::lower16(PRACC_PARAM_IN)),
            asm::lw(9, 0, 8),  // $9 = source address
            asm::lw(10, 4, 8), // $10 = byte count
            asm::lui(11, asm::upper16(PRACC_PARAM_OUT)),
            asm::ori(11, 11, asm::lower16(PRACC_PARAM_OUT)),
            // loop:
            asm::beq(0, 10, 8), // count exhausted -> end
            asm::NOP,
            asm::lbu(8, 0, 9),
            asm::sw(8, 0, 11),
            asm::addi(10, 10, asm::neg16(1)),
            asm::addi(9, 9, 1),
            asm::addi(11, 11, 4),
            asm::b(asm::neg16(8)),
            asm::NOP,
            // end:
            asm::lw(11, 0, 15),
            asm::lw(10, 0, 15),
            asm::lw(9, 0, 15),
            asm::lw(8, 0, 15),
            asm::b(asm::neg16(27)),
            asm::mfc0(15, 31, 0), // DeSave back to $15
        ];

        let mut done = 0;
        while done < buf.len() {
            let block = (buf.len() - done).min(BLOCK_WORDS);
            let mut words = vec![0u32; block];
            let mut param_in = [address, block as u32];
            self.pracc_exec(CODE, &mut param_in, &mut words, false)?;
            for (dst, word) in buf[done..done + block].iter_mut().zip(&words) {
                *dst = *word as u8;
            }
            address += block as u32;
            done += block;
        }
        Ok(())
    }

    /// Write a single word to target memory.
    pub fn write_u32(&mut self, address: u32, value: u32) -> Result<(), MipsError> {
        const CODE: &[u32] = &[
            // start:
            asm::mtc0(15, 31, 0), // $15 to DeSave
            asm::lui(15, asm::upper16(PRACC_STACK)),
            asm::ori(15, 15, asm::lower16(PRACC_STACK)),
            asm::sw(8, 0, 15),
            asm::sw(9, 0, 15),
            asm::lw(8, asm::neg16((PRACC_STACK - PRACC_PARAM_IN) - 4), 15), // $8 = param_in[1] (data)
            asm::lw(9, asm::neg16(PRACC_STACK - PRACC_PARAM_IN), 15), // $9 = param_in[0] (address)
            asm::sw(8, 0, 9),
            asm::lw(9, 0, 15),
            asm::lw(8, 0, 15),
            asm::b(asm::neg16(11)),
            asm::mfc0(15, 31, 0), // DeSave back to $15
        ];

        let mut param_in = [address, value];
        self.pracc_exec(CODE, &mut param_in, &mut [], false)
    }

    /// Write words to target memory.
    ///
    /// The routine walks an address pointer up to an end marker; both ride
    /// in front of the data in the parameter-in block.
    pub fn write_mem32(&mut self, address: u32, data: &[u32]) -> Result<(), MipsError> {
        // The store loop below checks its bound after the first store, so
        // an empty request must not reach the target at all.
        if data.is_empty() {
            return Ok(());
        }
        if data.len() == 1 {
            return self.write_u32(address, data[0]);
        }

        const CODE: &[u32] = &[
            // start:
            asm::mtc0(15, 31, 0), // $15 to DeSave
            asm::lui(15, asm::upper16(PRACC_STACK)),
            asm::ori(15, 15, asm::lower16(PRACC_STACK)),
            asm::sw(8, 0, 15),
            asm::sw(9, 0, 15),
            asm::sw(10, 0, 15),
            asm::sw(11, 0, 15),
            asm::addi(8, 15, asm::neg16(PRACC_STACK - PRACC_PARAM_IN)), // $8 = param area
            asm::lw(9, 0, 8),  // $9 = destination address
            asm::lw(10, 4, 8), // $10 = end address
            asm::addi(8, 8, 8), // $8 -> start of data
            // loop:
            asm::lw(11, 0, 8),
            asm::sw(11, 0, 9),
            asm::addi(9, 9, 4),
            asm::bne(10, 9, asm::neg16(4)),
            asm::addi(8, 8, 4), // delay slot
            // end:
            asm::lw(11, 0, 15),
            asm::lw(10, 0, 15),
            asm::lw(9, 0, 15),
            asm::lw(8, 0, 15),
            asm::b(asm::neg16(21)),
            asm::mfc0(15, 31, 0), // DeSave back to $15
        ];

        let mut param_in = Vec::with_capacity(data.len() + 2);
        param_in.push(address);
        param_in.push(address + 4 * data.len() as u32); // end marker
        param_in.extend_from_slice(data);

        self.pracc_exec(CODE, &mut param_in, &mut [], false)
    }

    /// Write halfwords to target memory. `address` must be 2-byte aligned.
    pub fn write_mem16(&mut self, address: u32, data: &[u16]) -> Result<(), MipsError> {
        const CODE: &[u32] = &[
            // start:
            asm::mtc0(15, 31, 0), // $15 to DeSave
            asm::lui(15, asm::upper16(PRACC_STACK)),
            asm::ori(15, 15, asm::lower16(PRACC_STACK)),
            asm::sw(8, 0, 15),
            asm::sw(9, 0, 15),
            asm::sw(10, 0, 15),
            asm::sw(11, 0, 15),
            asm::lui(8, asm::upper16(PRACC_PARAM_IN)),
            asm::ori(8, 8, asm::lower16(PRACC_PARAM_IN)),
            asm::lw(9, 0, 8),  // $9 = destination address
            asm::lw(10, 4, 8), // $10 = halfword count
            asm::addi(8, 8, 8), // $8 -> start of data
            // loop:
            asm::beq(0, 10, 8), // count exhausted -> end
            asm::NOP,
            asm::lw(11, 0, 8),
            asm::sh(11, 0, 9),
            asm::addi(10, 10, asm::neg16(1)),
            asm::addi(9, 9, 2),
            asm::addi(8, 8, 4),
            asm::b(asm::neg16(8)),
            asm::NOP,
            // end:
            asm::lw(11, 0, 15),
            asm::lw(10, 0, 15),
            asm::lw(9, 0, 15),
            asm::lw(8, 0, 15),
            asm::b(asm::neg16(26)),
            asm::mfc0(15, 31, 0), // DeSave back to $15
        ];

        let mut param_in = Vec::with_capacity(data.len() + 2);
        param_in.push(address);
        param_in.push(data.len() as u32);
        param_in.extend(data.iter().map(|&half| half as u32));

        self.pracc_exec(CODE, &mut param_in, &mut [], false)
    }

    /// Write bytes to target memory.
    pub fn write_mem8(&mut self, address: u32, data: &[u8]) -> Result<(), MipsError> {
        const CODE: &[u32] = &[
            // start:
            asm::mtc0(15, 31, 0), // $15 to DeSave
            asm::lui(15, asm::upper16(PRACC_STACK)),
            asm::ori(15, 15, asm::lower16(PRACC_STACK)),
            asm::sw(8, 0, 15),
            asm::sw(9, 0, 15),
            asm::sw(10, 0, 15),
            asm::sw(11, 0, 15),
            asm::lui(8, asm::upper16(PRACC_PARAM_IN)),
            asm::ori(8, 8, asm::lower16(PRACC_PARAM_IN)),
            asm::lw(9, 0, 8),  // $9 = destination address
            asm::lw(10, 4, 8), // $10 = byte count
            asm::addi(8, 8, 8), // $8 -> start of data
            // loop:
            asm::beq(0, 10, 8), // count exhausted -> end
            asm::NOP,
            asm::lw(11, 0, 8),
            asm::sb(11, 0, 9),
            asm::addi(10, 10, asm::neg16(1)),
            asm::addi(9, 9, 1),
            asm::addi(8, 8, 4),
            asm::b(asm::neg16(8)),
            asm::NOP,
            // end:
            asm::lw(11, 0, 15),
            asm::lw(10, 0, 15),
            asm::lw(9, 0, 15),
            asm::lw(8, 0, 15),
            asm::b(asm::neg16(26)),
            asm::mfc0(15, 31, 0), // DeSave back to $15
        ];

        let mut param_in = Vec::with_capacity(data.len() + 2);
        param_in.push(address);
        param_in.push(data.len() as u32);
        param_in.extend(data.iter().map(|&byte| byte as u32));

        self.pracc_exec(CODE, &mut param_in, &mut [], false)
    }

    /// Dump the core register block: GPR 0..31 followed by status, lo,
    /// hi, badvaddr, cause and depc.
    pub fn read_regs(&mut self) -> Result<[u32; NUM_CORE_REGS], MipsError> {
        const CODE: &[u32] = &[
            // start:
            asm::mtc0(2, 31, 0), // $2 to DeSave
            asm::lui(2, asm::upper16(PRACC_PARAM_OUT)),
            asm::ori(2, 2, asm::lower16(PRACC_PARAM_OUT)),
            asm::sw(0, 0, 2),
            asm::sw(1, 4, 2),
            asm::sw(15, 60, 2),
            asm::mfc0(2, 31, 0), // DeSave back to $2
            asm::mtc0(15, 31, 0), // $15 to DeSave
            asm::lui(15, asm::upper16(PRACC_STACK)),
            asm::ori(15, 15, asm::lower16(PRACC_STACK)),
            asm::sw(1, 0, 15),
            asm::sw(2, 0, 15),
            asm::lui(1, asm::upper16(PRACC_PARAM_OUT)),
            asm::ori(1, 1, asm::lower16(PRACC_PARAM_OUT)),
            asm::sw(2, 2 * 4, 1),
            asm::sw(3, 3 * 4, 1),
            asm::sw(4, 4 * 4, 1),
            asm::sw(5, 5 * 4, 1),
            asm::sw(6, 6 * 4, 1),
            asm::sw(7, 7 * 4, 1),
            asm::sw(8, 8 * 4, 1),
            asm::sw(9, 9 * 4, 1),
            asm::sw(10, 10 * 4, 1),
            asm::sw(11, 11 * 4, 1),
            asm::sw(12, 12 * 4, 1),
            asm::sw(13, 13 * 4, 1),
            asm::sw(14, 14 * 4, 1),
            asm::sw(16, 16 * 4, 1),
            asm::sw(17, 17 * 4, 1),
            asm::sw(18, 18 * 4, 1),
            asm::sw(19, 19 * 4, 1),
            asm::sw(20, 20 * 4, 1),
            asm::sw(21, 21 * 4, 1),
            asm::sw(22, 22 * 4, 1),
            asm::sw(23, 23 * 4, 1),
            asm::sw(24, 24 * 4, 1),
            asm::sw(25, 25 * 4, 1),
            asm::sw(26, 26 * 4, 1),
            asm::sw(27, 27 * 4, 1),
            asm::sw(28, 28 * 4, 1),
            asm::sw(29, 29 * 4, 1),
            asm::sw(30, 30 * 4, 1),
            asm::sw(31, 31 * 4, 1),
            asm::mfc0(2, 12, 0), // status
            asm::sw(2, 32 * 4, 1),
            asm::mflo(2),
            asm::sw(2, 33 * 4, 1),
            asm::mfhi(2),
            asm::sw(2, 34 * 4, 1),
            asm::mfc0(2, 8, 0), // badvaddr
            asm::sw(2, 35 * 4, 1),
            asm::mfc0(2, 13, 0), // cause
            asm::sw(2, 36 * 4, 1),
            asm::mfc0(2, 24, 0), // depc (pc)
            asm::sw(2, 37 * 4, 1),
            asm::lw(2, 0, 15),
            asm::lw(1, 0, 15),
            asm::b(asm::neg16(58)),
            asm::mfc0(15, 31, 0), // DeSave back to $15
        ];

        let mut regs = [0u32; NUM_CORE_REGS];
        self.pracc_exec(CODE, &mut [], &mut regs, false)?;
        Ok(regs)
    }

    /// Load the core register block. DEPC goes in last, so leaving debug
    /// mode resumes at the written PC.
    pub fn write_regs(&mut self, regs: &[u32; NUM_CORE_REGS]) -> Result<(), MipsError> {
        const CODE: &[u32] = &[
            // start:
            asm::lui(2, asm::upper16(PRACC_PARAM_IN)),
            asm::ori(2, 2, asm::lower16(PRACC_PARAM_IN)),
            asm::lw(1, 4, 2),
            asm::lw(15, 15 * 4, 2),
            asm::mtc0(15, 31, 0), // $15 to DeSave
            asm::lui(15, asm::upper16(PRACC_STACK)),
            asm::ori(15, 15, asm::lower16(PRACC_STACK)),
            asm::sw(1, 0, 15),
            asm::lui(1, asm::upper16(PRACC_PARAM_IN)),
            asm::ori(1, 1, asm::lower16(PRACC_PARAM_IN)),
            asm::lw(3, 3 * 4, 1),
            asm::lw(4, 4 * 4, 1),
            asm::lw(5, 5 * 4, 1),
            asm::lw(6, 6 * 4, 1),
            asm::lw(7, 7 * 4, 1),
            asm::lw(8, 8 * 4, 1),
            asm::lw(9, 9 * 4, 1),
            asm::lw(10, 10 * 4, 1),
            asm::lw(11, 11 * 4, 1),
            asm::lw(12, 12 * 4, 1),
            asm::lw(13, 13 * 4, 1),
            asm::lw(14, 14 * 4, 1),
            asm::lw(16, 16 * 4, 1),
            asm::lw(17, 17 * 4, 1),
            asm::lw(18, 18 * 4, 1),
            asm::lw(19, 19 * 4, 1),
            asm::lw(20, 20 * 4, 1),
            asm::lw(21, 21 * 4, 1),
            asm::lw(22, 22 * 4, 1),
            asm::lw(23, 23 * 4, 1),
            asm::lw(24, 24 * 4, 1),
            asm::lw(25, 25 * 4, 1),
            asm::lw(26, 26 * 4, 1),
            asm::lw(27, 27 * 4, 1),
            asm::lw(28, 28 * 4, 1),
            asm::lw(29, 29 * 4, 1),
            asm::lw(30, 30 * 4, 1),
            asm::lw(31, 31 * 4, 1),
            asm::lw(2, 32 * 4, 1),
            asm::mtc0(2, 12, 0), // status
            asm::lw(2, 33 * 4, 1),
            asm::mtlo(2),
            asm::lw(2, 34 * 4, 1),
            asm::mthi(2),
            asm::lw(2, 35 * 4, 1),
            asm::mtc0(2, 8, 0), // badvaddr
            asm::lw(2, 36 * 4, 1),
            asm::mtc0(2, 13, 0), // cause
            asm::lw(2, 37 * 4, 1),
            asm::mtc0(2, 24, 0), // depc (pc)
            asm::lw(2, 2 * 4, 1),
            asm::lw(1, 0, 15),
            asm::b(asm::neg16(53)),
            asm::mfc0(15, 31, 0), // DeSave back to $15
        ];

        let mut param_in = *regs;
        self.pracc_exec(CODE, &mut param_in, &mut [], false)
    }

    /// Stream words from the probe into target memory through the
    /// fastdata register.
    pub fn fastdata_write(
        &mut self,
        area: &WorkingArea,
        address: u32,
        data: &[u32],
    ) -> Result<(), MipsError> {
        self.fastdata_setup(area, FastdataDir::Write, address, data.len())?;
        for &word in data {
            self.ejtag.fastdata_scan(FastdataDir::Write, word)?;
        }
        self.fastdata_finish()
    }

    /// Stream words from target memory into `buf` through the fastdata
    /// register.
    pub fn fastdata_read(
        &mut self,
        area: &WorkingArea,
        address: u32,
        buf: &mut [u32],
    ) -> Result<(), MipsError> {
        self.fastdata_setup(area, FastdataDir::Read, address, buf.len())?;
        for slot in buf.iter_mut() {
            *slot = self.ejtag.fastdata_scan(FastdataDir::Read, 0)?;
        }
        self.fastdata_finish()
    }

    /// The RAM-resident transfer loop for one direction. $15 holds the
    /// handler base on entry; live registers are saved at the top of the
    /// working area.
    fn fastdata_handler(dir: FastdataDir) -> [u32; 20] {
        let (load, store) = match dir {
            // fastdata window -> RAM at $9
            FastdataDir::Write => (asm::lw(11, 0, 8), asm::sw(11, 0, 9)),
            // RAM at $9 -> fastdata window
            FastdataDir::Read => (asm::lw(11, 0, 9), asm::sw(11, 0, 8)),
        };

        [
            asm::sw(8, (FASTDATA_HANDLER_SIZE - 4) as u16, 15),
            asm::sw(9, (FASTDATA_HANDLER_SIZE - 8) as u16, 15),
            asm::sw(10, (FASTDATA_HANDLER_SIZE - 12) as u16, 15),
            asm::sw(11, (FASTDATA_HANDLER_SIZE - 16) as u16, 15),
            asm::lui(8, asm::upper16(PRACC_FASTDATA_AREA)),
            asm::ori(8, 8, asm::lower16(PRACC_FASTDATA_AREA)),
            asm::lw(9, 0, 8),  // start address
            asm::lw(10, 0, 8), // end address
            // loop:
            load,
            store,
            asm::bne(10, 9, asm::neg16(3)),
            asm::addi(9, 9, 4), // delay slot
            asm::lw(8, (FASTDATA_HANDLER_SIZE - 4) as u16, 15),
            asm::lw(9, (FASTDATA_HANDLER_SIZE - 8) as u16, 15),
            asm::lw(10, (FASTDATA_HANDLER_SIZE - 12) as u16, 15),
            asm::lw(11, (FASTDATA_HANDLER_SIZE - 16) as u16, 15),
            asm::lui(15, asm::upper16(PRACC_TEXT)),
            asm::ori(15, 15, asm::lower16(PRACC_TEXT)),
            asm::jr(15), // back to the debug vector
            asm::mfc0(15, 31, 0), // DeSave back to $15
        ]
    }

    /// Upload the handler if needed, vector the core into it and hand it
    /// the transfer bounds.
    fn fastdata_setup(
        &mut self,
        area: &WorkingArea,
        dir: FastdataDir,
        address: u32,
        count: usize,
    ) -> Result<(), MipsError> {
        if area.size < FASTDATA_HANDLER_SIZE {
            return Err(MipsError::WorkingAreaTooSmall {
                required: FASTDATA_HANDLER_SIZE,
                available: area.size,
            });
        }

        // The handler only changes with the direction; reuploading it for
        // consecutive same-direction transfers would waste the bulk of
        // the time a small transfer takes.
        if self.ejtag.fast_access_save != Some(dir) {
            let handler = Self::fastdata_handler(dir);
            self.write_mem32(area.address, &handler)?;
            self.ejtag.fast_access_save = Some(dir);
        }

        tracing::debug!("fastdata handler at {:#010x}", area.address);

        // Feed the core a trampoline into the handler, one fetch at a
        // time: save $15, load the handler address, jump.
        let jmp_code = [
            asm::mtc0(15, 31, 0),
            asm::lui(15, asm::upper16(area.address)),
            asm::ori(15, 15, asm::lower16(area.address)),
            asm::jr(15),
            asm::NOP,
        ];

        for instr in jmp_code {
            self.wait_for_pracc_rw()?;

            self.ejtag.set_instr(EjtagInstruction::Data);
            self.ejtag.drscan_32_out(instr);

            // Clear the access pending bit (let the processor eat).
            let ctrl = self.ctrl_pracc_cleared();
            self.ejtag.set_instr(EjtagInstruction::Control);
            self.ejtag.drscan_32_out(ctrl);
        }

        self.wait_for_pracc_rw()?;

        // The handler's first move is fetching its bounds from the
        // fastdata window; anything else means the jump went astray.
        self.ejtag.set_instr(EjtagInstruction::Address);
        let fetch = self.ejtag.drscan_32(0)?;
        if fetch != PRACC_FASTDATA_AREA {
            return Err(MipsError::UnexpectedAddress(fetch));
        }

        self.wait_for_pracc_rw()?;

        self.ejtag.set_instr(EjtagInstruction::Fastdata);
        self.ejtag.fastdata_scan(FastdataDir::Write, address)?;
        self.ejtag
            .fastdata_scan(FastdataDir::Write, address + 4 * (count as u32 - 1))?;

        Ok(())
    }

    /// Wait out the handler's return and check it came back to the debug
    /// vector.
    fn fastdata_finish(&mut self) -> Result<(), MipsError> {
        self.ejtag.execute()?;

        self.wait_for_pracc_rw()?;

        self.ejtag.set_instr(EjtagInstruction::Address);
        let fetch = self.ejtag.drscan_32(0)?;
        if fetch != PRACC_TEXT {
            tracing::warn!("fastdata handler did not return to the debug vector");
        }
        Ok(())
    }
}
