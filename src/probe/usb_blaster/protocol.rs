//! The two-mode USB-Blaster wire protocol.
//!
//! The cable clocks JTAG signals out of a CPLD that understands two byte
//! encodings on the FTDI FIFO:
//!
//! *Bit-bang mode* drives every pin level explicitly, one byte per TCK
//! level:
//!
//! ```text
//! bit 7 (0x80): must be zero (selects bit-bang mode)
//! bit 6 (0x40): read back one byte with TDO in bit 0
//! bit 5 (0x20): output enable / LED
//! bit 4 (0x10): TDI
//! bit 3 (0x08): nCS (free GPIO in JTAG mode)
//! bit 2 (0x04): nCE (free GPIO in JTAG mode)
//! bit 1 (0x02): TMS
//! bit 0 (0x01): TCK
//! ```
//!
//! Clocking one bit takes two bytes: one with TCK low to set up TDI/TMS,
//! one with TCK high to latch them into the target.
//!
//! *Byte-shift mode* streams up to 63 whole TDI bytes after a header of
//! `0x80 | (read ? 0x40 : 0) | n`; the CPLD clocks out eight bits per
//! payload byte, LSB first, and returns `n` bytes of packed TDO if the
//! read flag was set. Byte-shift sampling edges are only correct when TCK
//! is low at the moment the header is queued, which is why every bit-bang
//! burst ends by parking TCK low.
//!
//! Bytes accumulate in a 64-byte buffer matching the USB endpoint size and
//! are flushed when full, before any readback, and at the end of every
//! command queue.

use std::time::{Duration, Instant};

use crate::probe::usb_blaster::backend::UsbBlasterBackend;
use crate::probe::{DebugProbeError, ScanType};

/// Size of the USB endpoint max packet, i.e. 64 bytes.
pub(super) const BUF_LEN: usize = 64;

const TCK: u8 = 1 << 0;
const TMS: u8 = 1 << 1;
const NCE: u8 = 1 << 2;
const NCS: u8 = 1 << 3;
const TDI: u8 = 1 << 4;
const LED: u8 = 1 << 5;
const READ: u8 = 1 << 6;
const SHMODE: u8 = 1 << 7;

const READ_TDO: u8 = 1 << 0;

/// How long readback may stall without a single byte arriving before the
/// transfer is abandoned.
const READ_STALL_TIMEOUT: Duration = Duration::from_millis(500);

/// Owns the outgoing packet window and the shadow pin state.
pub(super) struct ProtocolHandler {
    backend: Box<dyn UsbBlasterBackend>,

    /// Accumulates protocol bytes until a USB packet is full or a flush is
    /// forced.
    buf: [u8; BUF_LEN],
    bufidx: usize,

    tms: bool,
    tdi: bool,
    pub(super) pin6: bool,
    pub(super) pin8: bool,
}

impl std::fmt::Debug for ProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolHandler")
            .field("backend", &self.backend)
            .field("bufidx", &self.bufidx)
            .field("tms", &self.tms)
            .field("tdi", &self.tdi)
            .field("pin6", &self.pin6)
            .field("pin8", &self.pin8)
            .finish()
    }
}

impl ProtocolHandler {
    pub fn new(backend: Box<dyn UsbBlasterBackend>, pin6: bool, pin8: bool) -> Self {
        Self {
            backend,
            buf: [0; BUF_LEN],
            bufidx: 0,
            tms: false,
            tdi: false,
            pin6,
            pin8,
        }
    }

    pub fn set_speed(&mut self, speed_khz: u32) -> Result<u32, DebugProbeError> {
        self.backend.set_speed(speed_khz)
    }

    /// Space left in the outgoing packet.
    fn remaining(&self) -> usize {
        BUF_LEN - self.bufidx
    }

    /// Push the buffered bytes down to the cable.
    ///
    /// Short writes restart on the unsent tail until the whole packet has
    /// been accepted.
    pub fn flush(&mut self) -> Result<(), DebugProbeError> {
        let mut sent = 0;
        while sent < self.bufidx {
            let written = self
                .backend
                .write(&self.buf[sent..self.bufidx])
                .map_err(DebugProbeError::Usb)?;
            if written == 0 {
                return Err(DebugProbeError::Usb(std::io::ErrorKind::WriteZero.into()));
            }
            sent += written;
        }
        self.bufidx = 0;
        Ok(())
    }

    /// Queue one protocol byte, flushing around a full packet.
    fn queue_byte(&mut self, byte: u8) -> Result<(), DebugProbeError> {
        if self.remaining() < 1 {
            self.flush()?;
        }
        self.buf[self.bufidx] = byte;
        self.bufidx += 1;
        if self.remaining() == 0 {
            self.flush()?;
        }
        tracing::trace!(
            "queued 0x{byte:02x} (TDI={} TMS={} TCK={} READ={})",
            (byte & TDI != 0) as u8,
            (byte & TMS != 0) as u8,
            (byte & TCK != 0) as u8,
            (byte & READ != 0) as u8,
        );
        Ok(())
    }

    /// Queue a byte-shift payload: `nb_bytes` from `bytes`, or zeroes when
    /// `bytes` is `None`.
    ///
    /// The caller is responsible for making room first; queueing past the
    /// packet boundary is a bug in this crate, not a device condition.
    fn queue_bytes(
        &mut self,
        bytes: Option<&[u8]>,
        nb_bytes: usize,
    ) -> Result<(), DebugProbeError> {
        assert!(
            self.bufidx + nb_bytes <= BUF_LEN,
            "buggy code, should never queue more than {} bytes",
            self.remaining()
        );
        match bytes {
            Some(bytes) => {
                self.buf[self.bufidx..self.bufidx + nb_bytes].copy_from_slice(&bytes[..nb_bytes])
            }
            None => self.buf[self.bufidx..self.bufidx + nb_bytes].fill(0),
        }
        self.bufidx += nb_bytes;
        if self.remaining() == 0 {
            self.flush()?;
        }
        Ok(())
    }

    /// Compute a bit-bang byte from the shadow pin state. READ is asserted
    /// when the operation captures TDO.
    fn build_out(&self, scan: ScanType) -> u8 {
        let mut byte = LED;
        if self.tms {
            byte |= TMS;
        }
        if self.tdi {
            byte |= TDI;
        }
        if self.pin6 {
            byte |= NCE;
        }
        if self.pin8 {
            byte |= NCS;
        }
        if scan.captures() {
            byte |= READ;
        }
        byte
    }

    /// Emit the current pin state with TCK low and flush.
    ///
    /// Used to reflect pin6/pin8 changes on the wire outside of any JTAG
    /// operation.
    pub fn apply_pin_state(&mut self) -> Result<(), DebugProbeError> {
        let out = self.build_out(ScanType::Out);
        self.queue_byte(out)?;
        self.flush()
    }

    /// Clock one TMS transition (one TAP state move). TDI is parked low.
    pub fn clock_tms(&mut self, tms: bool) -> Result<(), DebugProbeError> {
        tracing::trace!("(tms={})", tms as u8);
        self.tms = tms;
        self.tdi = false;

        let out = self.build_out(ScanType::Out);
        self.queue_byte(out)?;
        self.queue_byte(out | TCK)
    }

    /// Put TCK back to its low level.
    ///
    /// Required after every bit-bang burst so a following byte-shift header
    /// is sampled on the right edges; see [`ProtocolHandler::queue_tdi`].
    pub fn idle_clock(&mut self) -> Result<(), DebugProbeError> {
        let out = self.build_out(ScanType::Out);
        self.queue_byte(out)
    }

    /// Clock one TDI bit out, requesting TDO capture when `scan` reads.
    pub fn clock_tdi(&mut self, tdi: bool, scan: ScanType) -> Result<(), DebugProbeError> {
        self.tdi = tdi;

        let out = self.build_out(ScanType::Out);
        self.queue_byte(out)?;

        let out = self.build_out(scan);
        self.queue_byte(out | TCK)
    }

    /// Clock one TDI bit out while toggling TMS, then park TCK low.
    ///
    /// This is the last TDI bit of a scan; the TMS flip moves the TAP from
    /// Shift-IR/DR into Exit1-IR/DR on the same rising edge.
    pub fn clock_tdi_flip_tms(&mut self, tdi: bool, scan: ScanType) -> Result<(), DebugProbeError> {
        self.tdi = tdi;
        self.tms = !self.tms;

        let out = self.build_out(ScanType::Out);
        self.queue_byte(out)?;

        let out = self.build_out(scan);
        self.queue_byte(out | TCK)?;

        let out = self.build_out(ScanType::Out);
        self.queue_byte(out)
    }

    /// Read exactly `buf.len()` reply bytes, restarting on short reads.
    fn read_response(&mut self, buf: &mut [u8]) -> Result<(), DebugProbeError> {
        let mut got = 0;
        let mut t0 = Instant::now();
        while got < buf.len() {
            let read = self
                .backend
                .read(&mut buf[got..])
                .map_err(DebugProbeError::Usb)?;
            got += read;

            if read > 0 {
                t0 = Instant::now();
            } else if t0.elapsed() > READ_STALL_TIMEOUT {
                tracing::warn!("read {got} bytes, expected {}", buf.len());
                return Err(DebugProbeError::Timeout);
            }
        }
        Ok(())
    }

    /// Read back TDO bytes produced by a byte-shift transmission.
    ///
    /// The cable packs eight TDO bits per byte, LSB first, which is already
    /// the order callers want, so the bytes are stored as they arrive. All
    /// queued writes are flushed first so the cable actually produces them.
    fn read_byteshifted_tdos(&mut self, buf: &mut [u8]) -> Result<(), DebugProbeError> {
        tracing::trace!("reading {} byteshifted tdo bytes", buf.len());
        self.flush()?;
        self.read_response(buf)
    }

    /// Read back TDO bits produced by bit-bang reads: one reply byte per
    /// clocked bit, TDO in bit 0. Returns the bits packed LSB-first.
    fn read_bitbang_tdos(&mut self, nb_bits: usize) -> Result<u8, DebugProbeError> {
        tracing::trace!("reading {nb_bits} bitbang tdo bytes");
        self.flush()?;

        let mut tmp = [0u8; 8];
        self.read_response(&mut tmp[..nb_bits])?;

        let mut packed = 0;
        for (i, byte) in tmp[..nb_bits].iter().enumerate() {
            packed |= (byte & READ_TDO) << i;
        }
        Ok(packed)
    }

    /// Shift a series of TDI bits, packed LSB-first in `bits` (or zeroes
    /// when `bits` is `None`).
    ///
    /// The whole bytes go out in byte-shift mode, the remainder in bit-bang
    /// mode; the last bit is always bit-banged so that `tap_shift` can ride
    /// the TMS flip out of Shift-IR/DR on it. When `scan` captures, TDO is
    /// read back chunk by chunk (this also keeps the cable queues from
    /// saturating) and written over `bits` at the matching indices.
    ///
    /// TCK must be low on entry: in byte-shift mode the CPLD shifts TDI on
    /// rising and samples TDO on falling edges only if it was. Bursts
    /// emitted here end with an idle clock to keep that invariant for the
    /// next caller.
    pub fn queue_tdi(
        &mut self,
        mut bits: Option<&mut [u8]>,
        nb_bits: usize,
        scan: ScanType,
        tap_shift: bool,
    ) -> Result<(), DebugProbeError> {
        let mut nb8 = nb_bits / 8;
        let mut nb1 = nb_bits % 8;

        // The last TDI bit must go out in bit-bang mode to allow the TMS
        // flip, so a multiple of 8 leaves one whole byte to the tail.
        if nb8 > 0 && nb1 == 0 {
            nb8 -= 1;
            nb1 = 8;
        }

        let read_tdos = scan.captures();
        let mut tdos = vec![0u8; nb_bits.div_ceil(8)];

        let mut i = 0;
        while i < nb8 {
            // One byte of room is reserved for the header; with the header
            // slot alone free there is nothing useful to send.
            if self.remaining() < 2 {
                self.flush()?;
            }
            let trans = (self.remaining() - 1).min(nb8 - i);

            if read_tdos {
                self.queue_byte(SHMODE | READ | trans as u8)?;
            } else {
                self.queue_byte(SHMODE | trans as u8)?;
            }
            match bits.as_deref() {
                Some(bits) => self.queue_bytes(Some(&bits[i..i + trans]), trans)?,
                None => self.queue_bytes(None, trans)?,
            }
            if read_tdos {
                self.read_byteshifted_tdos(&mut tdos[i..i + trans])?;
            }
            i += trans;
        }

        for i in 0..nb1 {
            let tdi = bits
                .as_deref()
                .is_some_and(|bits| bits[nb8 + i / 8] & (1 << i) != 0);

            if tap_shift && bits.is_some() && i == nb1 - 1 {
                self.clock_tdi_flip_tms(tdi, scan)?;
            } else {
                self.clock_tdi(tdi, scan)?;
            }
        }
        if nb1 > 0 && read_tdos {
            tdos[nb8] = self.read_bitbang_tdos(nb1)?;
        }

        if read_tdos {
            if let Some(bits) = bits.as_deref_mut() {
                bits[..tdos.len()].copy_from_slice(&tdos);
            }
        }

        // Leave the clock parked low.
        self.idle_clock()
    }

    /// Drain whatever the adapter still holds in its read FIFO.
    ///
    /// Returns once a read comes back empty.
    pub fn drain_read_fifo(&mut self) -> Result<(), DebugProbeError> {
        let mut junk = [0u8; BUF_LEN];
        loop {
            let read = self.backend.read(&mut junk).map_err(DebugProbeError::Usb)?;
            if read == 0 {
                return Ok(());
            }
            tracing::debug!("drained {read} stale bytes");
        }
    }

    /// Write `packets` packets of zero bytes straight through, bypassing
    /// the buffer. Used at init to clear the adapter's write FIFO.
    pub fn write_zero_packets(&mut self, packets: usize) -> Result<(), DebugProbeError> {
        let zeroes = [0u8; BUF_LEN];
        for _ in 0..packets {
            let mut sent = 0;
            while sent < zeroes.len() {
                let written = self
                    .backend
                    .write(&zeroes[sent..])
                    .map_err(DebugProbeError::Usb)?;
                if written == 0 {
                    return Err(DebugProbeError::Usb(std::io::ErrorKind::WriteZero.into()));
                }
                sent += written;
            }
        }
        Ok(())
    }

    /// Emit a single zero byte, putting every pin into high impedance.
    /// This is the very last write of a session.
    pub fn tristate_pins(&mut self) -> Result<(), DebugProbeError> {
        self.bufidx = 0;
        self.queue_byte(0)?;
        self.flush()
    }
}
