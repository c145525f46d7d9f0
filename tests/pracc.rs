//! PrAcc and fastdata integration tests against the simulated MIPS32
//! target.

mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;

use common::{SharedTap, SharedTarget, TapDevice, VirtualCable, TEST_IDCODE};
use usb_blaster_ejtag::architecture::mips::{Mips32, MipsError, WorkingArea, NUM_CORE_REGS};
use usb_blaster_ejtag::probe::usb_blaster::{UsbBlaster, UsbBlasterOptions};

fn fixture() -> (UsbBlaster, SharedTarget) {
    let target = SharedTarget::new();
    let tap = Arc::new(Mutex::new(TapDevice::new(Box::new(target.clone()))));
    let cable = VirtualCable::new(Box::new(SharedTap(tap)));
    let probe =
        UsbBlaster::open_with_backend(Box::new(cable), &UsbBlasterOptions::default()).unwrap();
    (probe, target)
}

#[test]
fn attach_reads_the_identification_registers() {
    let (mut probe, _target) = fixture();
    let mut mips = Mips32::attach(&mut probe).unwrap();
    assert_eq!(mips.ejtag().read_idcode().unwrap().0, TEST_IDCODE);
}

#[test]
fn read_u32_returns_the_word_in_memory() {
    let (mut probe, target) = fixture();
    target.lock().write_word(0x8000_0000, 0x4008_6000);

    let mut mips = Mips32::attach(&mut probe).unwrap();
    assert_eq!(mips.read_u32(0x8000_0000).unwrap(), 0x4008_6000);
}

#[test]
fn block_write_then_read_round_trips() {
    let (mut probe, target) = fixture();
    let mut mips = Mips32::attach(&mut probe).unwrap();

    let data = [0xDEAD_BEEF, 0xCAFE_BABE, 0x1234_5678, 0x0000_0000];
    mips.write_mem32(0xA000_0000, &data).unwrap();

    // The words really landed in target memory.
    assert_eq!(target.lock().read_word(0xA000_0000), 0xDEAD_BEEF);
    assert_eq!(target.lock().read_word(0xA000_000C), 0x0000_0000);

    let mut back = [0u32; 4];
    mips.read_mem32(0xA000_0000, &mut back).unwrap();
    assert_eq!(back, data);
}

#[test]
fn halfword_write_then_read_round_trips() {
    let (mut probe, _target) = fixture();
    let mut mips = Mips32::attach(&mut probe).unwrap();

    let data = [0x1122u16, 0x3344, 0xA55A, 0xFFFF, 0x0001];
    mips.write_mem16(0xA000_1000, &data).unwrap();

    let mut back = [0u16; 5];
    mips.read_mem16(0xA000_1000, &mut back).unwrap();
    assert_eq!(back, data);
}

#[test]
fn byte_write_then_read_round_trips() {
    let (mut probe, _target) = fixture();
    let mut mips = Mips32::attach(&mut probe).unwrap();

    let data = [0x11u8, 0x22, 0x00, 0xFF, 0x80, 0x7F, 0x5A];
    mips.write_mem8(0xA000_1800, &data).unwrap();

    let mut back = [0u8; 7];
    mips.read_mem8(0xA000_1800, &mut back).unwrap();
    assert_eq!(back, data);
}

#[test]
fn reads_larger_than_a_block_are_chunked() {
    let (mut probe, target) = fixture();

    // 0x410 words crosses the 0x400-word routine block size.
    let count = 0x410usize;
    {
        let mut target = target.lock();
        for i in 0..count {
            target.write_word(0x8800_0000 + 4 * i as u32, 0x5EED_0000 | i as u32);
        }
    }

    let mut mips = Mips32::attach(&mut probe).unwrap();
    let mut back = vec![0u32; count];
    mips.read_mem32(0x8800_0000, &mut back).unwrap();

    for (i, word) in back.iter().enumerate() {
        assert_eq!(*word, 0x5EED_0000 | i as u32, "word {i}");
    }
}

#[test]
fn register_block_round_trips() {
    let (mut probe, _target) = fixture();
    let mut mips = Mips32::attach(&mut probe).unwrap();

    let mut regs = [0u32; NUM_CORE_REGS];
    for (i, reg) in regs.iter_mut().enumerate().skip(1) {
        *reg = 0x1000_0000 | (i as u32) << 8 | i as u32;
    }

    mips.write_regs(&regs).unwrap();
    let back = mips.read_regs().unwrap();
    assert_eq!(back, regs);
}

#[test]
fn fastdata_streams_a_block_and_uploads_the_handler_once_per_direction() {
    let (mut probe, target) = fixture();
    let area = WorkingArea {
        address: 0xA000_2000,
        size: 0x80,
    };
    // Watch stores into the handler code region; only uploads hit it.
    target.lock().store_watch = Some((area.address, area.address + 0x50));

    let mut mips = Mips32::attach(&mut probe).unwrap();

    let data: Vec<u32> = (0..1024u32).map(|i| 0xFA57_0000 ^ (i * 0x0101)).collect();
    mips.fastdata_write(&area, 0xA000_4000, &data).unwrap();
    assert_eq!(target.lock().watched_stores, 20);
    assert_eq!(target.lock().read_word(0xA000_4000), data[0]);
    assert_eq!(target.lock().read_word(0xA000_4000 + 4 * 1023), data[1023]);

    // Same direction again: the handler is not re-uploaded.
    mips.fastdata_write(&area, 0xA000_8000, &data[..16]).unwrap();
    assert_eq!(target.lock().watched_stores, 20);

    // Direction change re-uploads once.
    let mut back = vec![0u32; 1024];
    mips.fastdata_read(&area, 0xA000_4000, &mut back).unwrap();
    assert_eq!(target.lock().watched_stores, 40);
    assert_eq!(back, data);
}

#[test]
fn fastdata_rejects_a_too_small_working_area() {
    let (mut probe, _target) = fixture();
    let area = WorkingArea {
        address: 0xA000_2000,
        size: 0x40,
    };

    let mut mips = Mips32::attach(&mut probe).unwrap();
    let result = mips.fastdata_write(&area, 0xA000_4000, &[1, 2, 3]);
    assert!(matches!(
        result,
        Err(MipsError::WorkingAreaTooSmall {
            required: 0x80,
            available: 0x40
        })
    ));
}

#[test]
fn stalled_pracc_times_out_within_the_window() {
    let (mut probe, target) = fixture();
    target.lock().stall_pracc = true;

    let mut mips = Mips32::attach(&mut probe).unwrap();

    let start = Instant::now();
    let result = mips.read_u32(0x8000_0000);
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(MipsError::Timeout)));
    assert!(elapsed >= Duration::from_millis(1000), "{elapsed:?}");
    assert!(elapsed <= Duration::from_millis(1200), "{elapsed:?}");
}
