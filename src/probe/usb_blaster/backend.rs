//! Low-level byte transports to the USB-Blaster.
//!
//! The adapter is an FTDI FT245 FIFO bridge: everything written to the bulk
//! OUT endpoint is handed to the CPLD byte by byte, everything the CPLD
//! produces comes back on the bulk IN endpoint. The probe layer above only
//! needs a byte pipe; the trait below is that pipe, and backends are looked
//! up by name so alternative transports can be slotted in (the original
//! libftdi/FTD2xx split collapsed into the single nusb driver).

use std::collections::VecDeque;
use std::fmt::Debug;
use std::io;
use std::time::Duration;

use nusb::transfer::{Control, ControlType, Recipient};
use nusb::DeviceInfo;

use crate::probe::usb_util::InterfaceExt;
use crate::probe::{DebugProbeError, ProbeCreationError};

/// Altera's vendor id and the USB-Blaster product id.
pub const USB_BLASTER_VID_PID: (u16, u16) = (0x09fb, 0x6001);

const READ_EP: u8 = 0x81;
const WRITE_EP: u8 = 0x02;
const USB_TIMEOUT: Duration = Duration::from_secs(5);

/// Matching criteria for opening a cable.
#[derive(Debug, Clone)]
pub struct BackendSelector {
    /// Vendor id to match.
    pub vid: u16,
    /// Product id to match.
    pub pid: u16,
    /// If set, the USB product string must match as well.
    pub description: Option<String>,
}

impl Default for BackendSelector {
    fn default() -> Self {
        let (vid, pid) = USB_BLASTER_VID_PID;
        Self {
            vid,
            pid,
            description: None,
        }
    }
}

impl BackendSelector {
    fn matches(&self, device: &DeviceInfo) -> bool {
        device.vendor_id() == self.vid
            && device.product_id() == self.pid
            && match &self.description {
                Some(desc) => device.product_string() == Some(desc.as_str()),
                None => true,
            }
    }
}

/// A byte pipe to the CPLD behind the FTDI bridge.
///
/// `read` returns the bytes that have arrived so far and `Ok(0)` when the
/// adapter currently has nothing to offer; callers that expect a specific
/// number of reply bytes loop until they have them.
pub trait UsbBlasterBackend: Debug + Send {
    /// Read up to `buf.len()` pending bytes from the cable.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write bytes to the cable, returning how many were accepted.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Request a TCK frequency, returning the effective one.
    fn set_speed(&mut self, speed_khz: u32) -> Result<u32, DebugProbeError>;
}

type OpenFn = fn(&BackendSelector) -> Result<Box<dyn UsbBlasterBackend>, ProbeCreationError>;

/// Registered backends, first entry is the default.
///
/// The historical `ftdi`/`ftd2xx` names are kept as aliases so existing
/// configurations keep selecting a working transport.
static BACKENDS: &[(&str, OpenFn)] = &[
    ("nusb", NusbBackend::open_boxed),
    ("ftdi", NusbBackend::open_boxed),
    ("ftd2xx", NusbBackend::open_boxed),
];

/// Resolve a backend by name (`None` selects the default) and open it.
pub(crate) fn open_backend(
    name: Option<&str>,
    selector: &BackendSelector,
) -> Result<Box<dyn UsbBlasterBackend>, DebugProbeError> {
    match name {
        None => {
            let (name, open) = BACKENDS[0];
            tracing::debug!("no backend configured, using {name}");
            Ok(open(selector)?)
        }
        Some(wanted) => {
            let Some((_, open)) = BACKENDS.iter().find(|(name, _)| *name == wanted) else {
                return Err(DebugProbeError::BackendNotFound(wanted.to_string()));
            };
            Ok(open(selector)?)
        }
    }
}

/// Returns true if the USB device looks like a USB-Blaster.
pub(crate) fn is_usb_blaster_device(device: &DeviceInfo) -> bool {
    let (vid, pid) = USB_BLASTER_VID_PID;
    device.vendor_id() == vid && device.product_id() == pid
}

/// FT245 driver on top of nusb.
///
/// The FT245 prepends two modem-status bytes to every IN packet; they are
/// stripped here and any payload beyond what the caller asked for is kept
/// in a queue for the next read.
pub struct NusbBackend {
    handle: nusb::Interface,

    read_queue: VecDeque<u8>,
    read_buffer: Box<[u8]>,

    speed_khz: u32,
}

impl Debug for NusbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NusbBackend")
            .field("queued", &self.read_queue.len())
            .field("speed_khz", &self.speed_khz)
            .finish()
    }
}

impl NusbBackend {
    fn open_boxed(
        selector: &BackendSelector,
    ) -> Result<Box<dyn UsbBlasterBackend>, ProbeCreationError> {
        Self::open(selector).map(|backend| Box::new(backend) as Box<dyn UsbBlasterBackend>)
    }

    fn open(selector: &BackendSelector) -> Result<Self, ProbeCreationError> {
        let device = nusb::list_devices()
            .map_err(ProbeCreationError::Usb)?
            .find(|device| selector.matches(device))
            .ok_or(ProbeCreationError::NotFound)?;

        tracing::debug!(
            "opening {:04x}:{:04x} ({:?})",
            device.vendor_id(),
            device.product_id(),
            device.product_string()
        );

        let handle = device
            .open()
            .map_err(ProbeCreationError::Usb)?
            .claim_interface(0)
            .map_err(ProbeCreationError::Usb)?;

        let mut backend = Self {
            handle,
            read_queue: VecDeque::new(),
            read_buffer: vec![0; 64].into_boxed_slice(),
            speed_khz: 6_000,
        };

        backend.sio_reset().map_err(ProbeCreationError::Usb)?;
        // 2 ms latency keeps bit-bang readback turnaround short.
        backend.sio_set_latency_timer(2).map_err(ProbeCreationError::Usb)?;

        Ok(backend)
    }

    fn sio_write(&mut self, request: u8, value: u16) -> io::Result<()> {
        self.handle
            .control_out_blocking(
                Control {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index: 0,
                },
                &[],
                USB_TIMEOUT,
            )
            .map_err(io::Error::other)?;

        Ok(())
    }

    fn sio_reset(&mut self) -> io::Result<()> {
        const SIO_RESET_REQUEST: u8 = 0;
        const SIO_RESET_SIO: u16 = 0;

        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_SIO)?;
        self.read_queue.clear();
        Ok(())
    }

    fn sio_set_latency_timer(&mut self, value: u8) -> io::Result<()> {
        const SIO_SET_LATENCY_TIMER_REQUEST: u8 = 0x09;

        self.sio_write(SIO_SET_LATENCY_TIMER_REQUEST, value as u16)
    }
}

impl UsbBlasterBackend for NusbBackend {
    fn read(&mut self, mut buf: &mut [u8]) -> io::Result<usize> {
        let mut total = 0;

        // Serve buffered surplus from earlier packets first.
        while total < buf.len() {
            let Some(byte) = self.read_queue.pop_front() else {
                break;
            };
            buf[total] = byte;
            total += 1;
        }
        buf = &mut buf[total..];

        if !buf.is_empty() {
            let read = self
                .handle
                .read_bulk(READ_EP, &mut self.read_buffer, USB_TIMEOUT)?;

            if read > 2 {
                // Two modem-status bytes lead every packet.
                let payload = &self.read_buffer[2..read];
                let copy = payload.len().min(buf.len());
                buf[..copy].copy_from_slice(&payload[..copy]);
                total += copy;
                self.read_queue.extend(&payload[copy..]);
            }
        }

        tracing::trace!("read {total} bytes");
        Ok(total)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.handle.write_bulk(WRITE_EP, buf, USB_TIMEOUT)?;
        tracing::trace!("wrote {written} of {} bytes", buf.len());
        Ok(written)
    }

    fn set_speed(&mut self, speed_khz: u32) -> Result<u32, DebugProbeError> {
        // TCK pacing comes from the CPLD's 24 MHz oscillator, not from the
        // FTDI link; the request is recorded and reported back unchanged.
        tracing::debug!("speed request {speed_khz} kHz (fixed-rate cable)");
        self.speed_khz = speed_khz;
        Ok(speed_khz)
    }
}
