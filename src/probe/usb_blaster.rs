//! Driver for the Altera USB-Blaster and compatible JTAG cables.
//!
//! The adapter is an FTDI FT245 USB FIFO followed by a CPLD (EPM7064 on
//! the original part) speaking the two-mode protocol implemented in
//! [`protocol`]. This module owns the session: it runs the TAP state
//! machine, turns queued [`JtagCommand`]s into protocol bytes and hands
//! captured TDO bits back to the caller.

pub mod backend;
mod protocol;

use std::time::Duration;

use bitvec::prelude::*;

use crate::probe::common::{IdCode, TapState};
use crate::probe::usb_blaster::backend::{BackendSelector, UsbBlasterBackend};
use crate::probe::usb_blaster::protocol::ProtocolHandler;
use crate::probe::{DebugProbeError, JtagCommand, ScanRequest, ScanType};

const TAP_SHIFT: bool = true;

/// Configuration for opening a cable.
#[derive(Debug, Clone, Default)]
pub struct UsbBlasterOptions {
    /// Vendor/product id pair; Altera's `09fb:6001` when absent.
    pub vid_pid: Option<(u16, u16)>,
    /// Match the USB product string as well.
    pub device_desc: Option<String>,
    /// Low-level backend name; the default backend when absent.
    pub backend: Option<String>,
    /// Initial level of the free GPIO on pin 6.
    pub pin6: bool,
    /// Initial level of the free GPIO on pin 8.
    pub pin8: bool,
}

/// The free GPIO pins of the cable. Neither is wired for JTAG use; some
/// boards repurpose them for resets or mode straps.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GpioPin {
    /// Pin 6 (the nCE output of the CPLD).
    Pin6,
    /// Pin 8 (the nCS output of the CPLD).
    Pin8,
}

/// An open USB-Blaster session.
///
/// Owns the protocol handler (packet window, shadow pin state, USB
/// transport) and the TAP state tracker. All operations run on the
/// caller's thread and block on USB completion.
#[derive(Debug)]
pub struct UsbBlaster {
    protocol: ProtocolHandler,
    tap_state: TapState,
    speed_khz: u32,
    closed: bool,
}

impl UsbBlaster {
    /// Open the first cable matching `options`.
    pub fn open(options: &UsbBlasterOptions) -> Result<Self, DebugProbeError> {
        let (vid, pid) = options.vid_pid.unwrap_or(backend::USB_BLASTER_VID_PID);
        let selector = BackendSelector {
            vid,
            pid,
            description: options.device_desc.clone(),
        };
        let backend = backend::open_backend(options.backend.as_deref(), &selector)?;
        Self::open_with_backend(backend, options)
    }

    /// Open a session over an already constructed byte transport.
    ///
    /// This is how simulated cables are attached in tests; hardware users
    /// want [`UsbBlaster::open`].
    pub fn open_with_backend(
        backend: Box<dyn UsbBlasterBackend>,
        options: &UsbBlasterOptions,
    ) -> Result<Self, DebugProbeError> {
        let mut probe = Self {
            protocol: ProtocolHandler::new(backend, options.pin6, options.pin8),
            tap_state: TapState::Reset,
            speed_khz: 6_000,
            closed: false,
        };

        // The adapter powers up with stale state: a 128 byte write FIFO
        // and a 384 byte read FIFO that may hold leftovers of an aborted
        // session. Push two zero packets through the write side and drain
        // the read side until it runs dry.
        probe.protocol.write_zero_packets(2)?;
        probe.protocol.drain_read_fifo()?;

        // Five TMS=1 edges reach Test-Logic-Reset from any state.
        probe.tms_seq(0x1f, 5)?;
        probe.protocol.flush()?;
        probe.tap_state = TapState::Reset;

        tracing::debug!("USB-Blaster attached");
        Ok(probe)
    }

    /// The TAP state the tracker believes the target is in.
    pub fn tap_state(&self) -> TapState {
        self.tap_state
    }

    /// The configured TCK frequency in kHz.
    pub fn speed_khz(&self) -> u32 {
        self.speed_khz
    }

    /// Request a TCK frequency, returning the effective one.
    pub fn set_speed(&mut self, speed_khz: u32) -> Result<u32, DebugProbeError> {
        self.speed_khz = self.protocol.set_speed(speed_khz)?;
        Ok(self.speed_khz)
    }

    /// Drive one of the free GPIO pins and reflect it on the wire.
    pub fn set_pin_state(&mut self, pin: GpioPin, level: bool) -> Result<(), DebugProbeError> {
        match pin {
            GpioPin::Pin6 => self.protocol.pin6 = level,
            GpioPin::Pin8 => self.protocol.pin8 = level,
        }
        self.protocol.apply_pin_state()
    }

    /// Release the cable, putting its pins into high impedance first.
    pub fn close(mut self) -> Result<(), DebugProbeError> {
        self.closed = true;
        self.protocol.tristate_pins()
    }

    fn clock_tms(&mut self, tms: bool) -> Result<(), DebugProbeError> {
        self.tap_state = self.tap_state.step(tms);
        self.protocol.clock_tms(tms)
    }

    /// Clock out a raw TMS sequence, bit 0 first, and park TCK low.
    fn tms_seq(&mut self, bits: u8, nb_bits: usize) -> Result<(), DebugProbeError> {
        tracing::trace!("tms_seq(bits=0x{bits:02x}, nb_bits={nb_bits})");
        for i in 0..nb_bits {
            self.clock_tms(bits & (1 << i) != 0)?;
        }
        self.protocol.idle_clock()
    }

    /// Move the TAP to `state` along the shortest TMS path.
    fn state_move(&mut self, state: TapState) -> Result<(), DebugProbeError> {
        tracing::trace!("state_move(from {:?} to {:?})", self.tap_state, state);
        if self.tap_state == state {
            return Ok(());
        }
        let path = self.tap_state.tms_path_to(state);
        self.tms_seq(path.bits, path.len)?;
        self.tap_state = state;
        Ok(())
    }

    /// Walk the TAP through a sequence of adjacent states.
    fn path_move(&mut self, path: &[TapState]) -> Result<(), DebugProbeError> {
        tracing::trace!("path_move(num_states={}, path={path:?})", path.len());
        for &next in path {
            if self.tap_state.step(false) == next {
                self.clock_tms(false)?;
            } else if self.tap_state.step(true) == next {
                self.clock_tms(true)?;
            } else {
                return Err(DebugProbeError::Protocol(
                    "path_move through non-adjacent TAP states",
                ));
            }
        }
        self.protocol.idle_clock()
    }

    /// Spend `cycles` TCK cycles in Run-Test/Idle, ending in `end_state`.
    fn runtest(&mut self, cycles: usize, end_state: TapState) -> Result<(), DebugProbeError> {
        tracing::trace!("runtest(cycles={cycles}, end_state={end_state:?})");
        self.state_move(TapState::Idle)?;
        self.protocol
            .queue_tdi(None, cycles, ScanType::Out, TAP_SHIFT)?;
        self.state_move(end_state)
    }

    /// Clock TCK `cycles` times without touching TMS.
    fn stableclocks(&mut self, cycles: usize) -> Result<(), DebugProbeError> {
        tracing::trace!("stableclocks(cycles={cycles})");
        self.protocol
            .queue_tdi(None, cycles, ScanType::Out, TAP_SHIFT)
    }

    /// Reset handling. The cable has no TRST/SRST wiring (pin6/pin8 are
    /// plain GPIO), so only the tracker can be forced.
    fn reset(&mut self, trst: bool, srst: bool) {
        tracing::debug!("reset({trst}, {srst}) has no wiring on this cable");
        if trst {
            self.tap_state = TapState::Reset;
        }
    }

    /// Run an IR or DR scan.
    ///
    /// Captured TDO bits replace the request's data, index for index. When
    /// the scan does not end in Shift-DR the last bit rides a TMS flip into
    /// Exit1, one more TMS=0 settles in Pause, and a state move finishes in
    /// the requested end state.
    fn scan(&mut self, request: &mut ScanRequest) -> Result<(), DebugProbeError> {
        if request.data.is_empty() {
            return Err(DebugProbeError::Protocol("empty scan"));
        }

        self.state_move(if request.ir {
            TapState::IrShift
        } else {
            TapState::DrShift
        })?;

        tracing::trace!(
            "scan({}, {:?}, bits={}, end_state={:?})",
            if request.ir { "IRSCAN" } else { "DRSCAN" },
            request.scan_type,
            request.data.len(),
            request.end_state,
        );

        let tap_shift = request.end_state != TapState::DrShift;
        let nbits = request.data.len();
        self.protocol.queue_tdi(
            Some(request.data.as_raw_mut_slice()),
            nbits,
            request.scan_type,
            tap_shift,
        )?;

        if tap_shift {
            // The flip landed us in Exit1; the tracker follows here since
            // the protocol layer does not know about TAP states.
            self.tap_state = self.tap_state.step(true);
            // Exit1 is unstable, settle in Pause before moving on.
            self.clock_tms(false)?;
            self.state_move(request.end_state)?;
        }
        Ok(())
    }

    /// Execute a queue of JTAG commands in order.
    ///
    /// Execution stops at the first failing command; buffered bytes are
    /// flushed in every case so the wire state matches the tracker.
    pub fn execute_queue(&mut self, commands: &mut [JtagCommand]) -> Result<(), DebugProbeError> {
        for command in commands.iter_mut() {
            if let Err(error) = self.dispatch(command) {
                let _ = self.protocol.flush();
                return Err(error);
            }
        }
        self.protocol.flush()
    }

    fn dispatch(&mut self, command: &mut JtagCommand) -> Result<(), DebugProbeError> {
        match command {
            JtagCommand::Reset { trst, srst } => {
                self.reset(*trst, *srst);
                Ok(())
            }
            JtagCommand::Runtest { cycles, end_state } => self.runtest(*cycles, *end_state),
            JtagCommand::StableClocks { cycles } => self.stableclocks(*cycles),
            JtagCommand::StateMove { end_state } => self.state_move(*end_state),
            JtagCommand::PathMove(path) => {
                let path = std::mem::take(path);
                self.path_move(&path)
            }
            JtagCommand::TmsSeq { bits, len } => self.tms_seq(*bits, *len),
            JtagCommand::Sleep { us } => {
                tracing::trace!("sleep({us} us)");
                std::thread::sleep(Duration::from_micros(*us));
                Ok(())
            }
            JtagCommand::Scan(request) => self.scan(request),
        }
    }

    /// Read the IDCODE preloaded into the DR chain by a TAP reset.
    pub fn read_idcode(&mut self) -> Result<IdCode, DebugProbeError> {
        let mut commands = [
            JtagCommand::StateMove {
                end_state: TapState::Reset,
            },
            JtagCommand::Scan(ScanRequest {
                ir: false,
                scan_type: ScanType::In,
                data: bitvec![u8, Lsb0; 0; 32],
                end_state: TapState::Idle,
            }),
        ];
        self.execute_queue(&mut commands)?;

        let JtagCommand::Scan(request) = &commands[1] else {
            unreachable!()
        };
        let idcode = IdCode(request.data.load_le::<u32>());
        tracing::debug!("IDCODE: {idcode}");
        Ok(idcode)
    }
}

impl Drop for UsbBlaster {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.protocol.tristate_pins();
        }
    }
}

/// Information about a connected cable.
#[derive(Debug, Clone)]
pub struct UsbBlasterInfo {
    /// USB vendor id.
    pub vendor_id: u16,
    /// USB product id.
    pub product_id: u16,
    /// USB serial number, when the adapter reports one.
    pub serial_number: Option<String>,
    /// USB product string.
    pub description: Option<String>,
}

/// List the connected USB-Blaster cables.
#[tracing::instrument(skip_all)]
pub fn list_usb_blasters() -> Vec<UsbBlasterInfo> {
    let Ok(devices) = nusb::list_devices() else {
        return vec![];
    };

    devices
        .filter(backend::is_usb_blaster_device)
        .map(|device| UsbBlasterInfo {
            vendor_id: device.vendor_id(),
            product_id: device.product_id(),
            serial_number: device.serial_number().map(Into::into),
            description: device.product_string().map(Into::into),
        })
        .collect()
}
