//! Capabilities the driver core needs from its surroundings.

use std::{
    fmt::Debug,
    sync::{Mutex, MutexGuard},
    thread,
    time::{Duration, Instant},
};

use super::{constants::configuration::MEMORY, slots::SlotTable};

/// Access to the controller's register window.
///
/// Registers are addressed by their CPU byte offset. Chip memory shares the
/// window at the CPU address of each memory location. Reads additionally
/// program the memory address register before the first dword.
pub trait RegisterBus: Debug + Send + Sync {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&self, offset: u32, value: u32);

    /// Drive the chip's hardware reset line. `true` releases the chip from
    /// reset.
    fn set_reset_line(&self, high: bool);

    /// Read `buf.len()` bytes of chip memory starting at the CPU offset
    /// `cpu_address`.
    fn read_mem(&self, cpu_address: u32, buf: &mut [u8]) {
        self.write32(MEMORY, cpu_address);
        for (offset, chunk) in (cpu_address..).step_by(4).zip(buf.chunks_mut(4)) {
            let word = self.read32(offset).to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }

    /// Write `data` to chip memory starting at the CPU offset `cpu_address`.
    /// A trailing partial dword is padded with zeroes.
    fn write_mem(&self, cpu_address: u32, data: &[u8]) {
        for (offset, chunk) in (cpu_address..).step_by(4).zip(data.chunks(4)) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.write32(offset, u32::from_le_bytes(word));
        }
    }
}

/// Clock, delays and interrupt masking of the platform the driver runs on.
pub trait Platform: Debug + Send + Sync {
    /// Monotonic milliseconds.
    fn now_ms(&self) -> u64;

    fn delay_us(&self, us: u32);

    fn delay_ms(&self, ms: u32) {
        self.delay_us(ms.saturating_mul(1000));
    }

    /// Mask the controller interrupt on the current CPU and return the
    /// previous state for [`Platform::restore_interrupts`].
    fn mask_interrupts(&self) -> u32;

    fn restore_interrupts(&self, state: u32);

    /// Called by blocking waits between two polls.
    fn relax(&self) {
        std::hint::spin_loop();
    }
}

/// Platform services of a hosted environment.
///
/// Interrupt masking is a no-op: the interrupt handler runs on an ordinary
/// thread and the slot table mutex alone serializes it against the
/// foreground.
#[derive(Debug)]
pub struct SystemPlatform {
    epoch: Instant,
}

impl SystemPlatform {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for SystemPlatform {
    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn delay_us(&self, us: u32) {
        thread::sleep(Duration::from_micros(u64::from(us)));
    }

    fn mask_interrupts(&self) -> u32 {
        0
    }

    fn restore_interrupts(&self, _state: u32) {}

    fn relax(&self) {
        thread::yield_now();
    }
}

/// Exclusive access to the slot table with the controller interrupt masked.
///
/// Dropping the guard unlocks the table first and then restores the
/// interrupt state.
pub(crate) struct CriticalSection<'a> {
    table: MutexGuard<'a, SlotTable>,
    irq: IrqGuard<'a>,
}

impl<'a> CriticalSection<'a> {
    pub(crate) fn enter(platform: &'a dyn Platform, table: &'a Mutex<SlotTable>) -> Self {
        let irq = IrqGuard {
            platform,
            state: platform.mask_interrupts(),
        };
        // The lock only fails if another thread panicked while holding it.
        // Nothing sensible can continue from that state.
        let table = table.lock().unwrap();
        Self { table, irq }
    }
}

impl std::ops::Deref for CriticalSection<'_> {
    type Target = SlotTable;

    fn deref(&self) -> &SlotTable {
        &self.table
    }
}

impl std::ops::DerefMut for CriticalSection<'_> {
    fn deref_mut(&mut self) -> &mut SlotTable {
        &mut self.table
    }
}

impl Debug for CriticalSection<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CriticalSection")
            .field("irq_state", &self.irq.state)
            .finish_non_exhaustive()
    }
}

struct IrqGuard<'a> {
    platform: &'a dyn Platform,
    state: u32,
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        self.platform.restore_interrupts(self.state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct FakeBus {
        writes: Mutex<Vec<(u32, u32)>>,
    }

    impl RegisterBus for FakeBus {
        fn read32(&self, offset: u32) -> u32 {
            // every dword reads back as its own address
            offset
        }

        fn write32(&self, offset: u32, value: u32) {
            self.writes.lock().unwrap().push((offset, value));
        }

        fn set_reset_line(&self, _high: bool) {}
    }

    #[test]
    fn memory_writes_are_split_into_little_endian_dwords() {
        let bus = FakeBus::default();
        bus.write_mem(0x1000, &[1, 2, 3, 4, 5, 6]);
        assert_eq!(
            *bus.writes.lock().unwrap(),
            vec![(0x1000, 0x0403_0201), (0x1004, 0x0000_0605)]
        );
    }

    #[test]
    fn memory_reads_program_the_address_register_first() {
        let bus = FakeBus::default();
        let mut buf = [0u8; 6];
        bus.read_mem(0x2000, &mut buf);
        assert_eq!(*bus.writes.lock().unwrap(), vec![(MEMORY, 0x2000)]);
        assert_eq!(buf, [0x00, 0x20, 0, 0, 0x04, 0x20]);
    }
}
