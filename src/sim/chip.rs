//! A register-level model of the ISP1760 host controller.
//!
//! The model is good enough to run the driver against: it keeps a register
//! file and the chip's SRAM, and once per simulated frame it executes the
//! armed, unskipped PTDs of every enabled class against the attached device
//! models. Results are written back into DW3 the way the chip does it, done
//! and interrupt cause bits are set, and the interrupt line is raised.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, RwLock},
};

use tracing::{debug, trace};

use crate::device::{
    interrupt_line::{DummyInterruptLine, InterruptLine},
    isp1760::{
        constants::{
            configuration::{buffer_status, hw_mode, CHIP_ID, HW_MODE_CONTROL, BUFFER_STATUS},
            interrupt::{cause, INTERRUPT, INTERRUPT_ENABLE, ATL_IRQ_MASK_OR, INT_IRQ_MASK_OR},
            memory::{self, chip_to_cpu, CPU_BASE, CPU_END, PTD_BYTES},
            operational::{portsc, PORTSC1},
            ptd_maps, MAX_SLOTS,
        },
        ptd::{PtdFields, PtdWords},
        PtdClass, RegisterBus, SlotId,
    },
};

use super::devices::{SimDevice, SimResponse, SimTransaction};

/// Value of the chip id register.
pub const SIM_CHIP_ID: u32 = 0x0001_1761;

/// Simulated time per frame.
const FRAME_US: u64 = 1000;

/// One executed transaction and what the device answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedTransaction {
    pub transaction: SimTransaction,
    pub response: SimResponse,
}

#[derive(Debug)]
struct ChipState {
    registers: BTreeMap<u32, u32>,
    /// Registers that read back a fixed value no matter what is written.
    held: BTreeMap<u32, u32>,
    /// Indexed by CPU offset; the register window below [`CPU_BASE`] is
    /// unused.
    memory: Vec<u8>,
    /// Slots whose PTD was written with the active bit set, per class.
    armed_periodic: u32,
    armed_async: u32,
    reset_line: bool,
    reset_releases: usize,
    now_us: u64,
    devices: BTreeMap<u8, Box<dyn SimDevice>>,
    log: Vec<LoggedTransaction>,
}

impl ChipState {
    fn register(&self, offset: u32) -> u32 {
        self.registers.get(&offset).copied().unwrap_or(0)
    }

    const fn armed(&self, class: PtdClass) -> u32 {
        match class {
            PtdClass::Periodic => self.armed_periodic,
            PtdClass::Async => self.armed_async,
        }
    }

    fn armed_mut(&mut self, class: PtdClass) -> &mut u32 {
        match class {
            PtdClass::Periodic => &mut self.armed_periodic,
            PtdClass::Async => &mut self.armed_async,
        }
    }

    fn read_dword(&self, offset: u32) -> u32 {
        let start = offset as usize;
        let bytes = &self.memory[start..start + 4];
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn write_dword(&mut self, offset: u32, value: u32) {
        let start = offset as usize;
        self.memory[start..start + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Track the active bit of PTD DW3 writes.
    fn snoop_ptd_write(&mut self, offset: u32, value: u32) {
        let chip = memory::cpu_to_chip(offset);
        let class = if (memory::INT_PTD_BASE..memory::ATL_PTD_BASE).contains(&chip) {
            PtdClass::Periodic
        } else if (memory::ATL_PTD_BASE..memory::PAYLOAD_BASE).contains(&chip) {
            PtdClass::Async
        } else {
            return;
        };

        let table_offset = (offset - chip_to_cpu(class.ptd_address(SlotId::new(0)))) as usize;
        if table_offset % PTD_BYTES != 12 {
            return;
        }
        let bit = 1u32 << (table_offset / PTD_BYTES);
        if value & (1 << 31) != 0 {
            *self.armed_mut(class) |= bit;
        } else {
            *self.armed_mut(class) &= !bit;
        }
    }

    fn write_portsc(&mut self, value: u32) {
        let old = self.register(PORTSC1);
        let mut new = (value & !(portsc::CCS | portsc::CSC)) | (old & portsc::CCS);
        // connect status change is write-one-to-clear
        if old & portsc::CSC != 0 && value & portsc::CSC == 0 {
            new |= portsc::CSC;
        }
        if value & portsc::PP != 0 && old & portsc::PP == 0 {
            new |= portsc::CCS | portsc::CSC;
        }
        self.registers.insert(PORTSC1, new);
    }

    fn ptd_words(&self, address: u32) -> PtdWords {
        let mut words = [0u32; memory::PTD_DWORDS];
        for (index, word) in words.iter_mut().enumerate() {
            *word = self.read_dword(address + 4 * index as u32);
        }
        words
    }

    /// Run one frame. Returns true if an enabled interrupt cause was raised.
    fn frame(&mut self) -> bool {
        self.now_us += FRAME_US;
        let status = self.register(BUFFER_STATUS);
        let mut raised = false;
        if status & buffer_status::ATL_FILLED != 0 {
            raised |= self.execute(PtdClass::Async);
        }
        if status & buffer_status::INT_FILLED != 0 {
            raised |= self.execute(PtdClass::Periodic);
        }
        raised
    }

    fn execute(&mut self, class: PtdClass) -> bool {
        let skip = self.register(class.skip_map());
        let runnable = self.armed(class) & !skip;
        let mut completed = 0u32;

        for index in (0..MAX_SLOTS).filter(|&i| runnable & (1 << i) != 0) {
            let slot = SlotId::new(index);
            let address = chip_to_cpu(class.ptd_address(slot));
            let words = self.ptd_words(address);
            let Some(fields) = PtdFields::decode(&words) else {
                debug!("{class} slot {index}: undecodable PTD {words:08x?}");
                continue;
            };
            if self.run_ptd(class, index, address, fields) {
                completed |= slot.bit();
            }
        }

        if completed == 0 {
            return false;
        }
        *self.armed_mut(class) &= !completed;
        let done_map = class.done_map();
        let done = self.register(done_map) | completed;
        self.registers.insert(done_map, done);

        let (or_mask, cause_bit) = match class {
            PtdClass::Periodic => (INT_IRQ_MASK_OR, cause::INT),
            PtdClass::Async => (ATL_IRQ_MASK_OR, cause::ATL),
        };
        if self.register(or_mask) & completed == 0 {
            return false;
        }
        let pending = self.register(INTERRUPT) | cause_bit;
        self.registers.insert(INTERRUPT, pending);
        self.register(INTERRUPT_ENABLE) & cause_bit != 0
    }

    /// Execute one PTD. Returns true if the PTD is done.
    fn run_ptd(&mut self, class: PtdClass, index: usize, address: u32, fields: PtdFields) -> bool {
        let payload = chip_to_cpu(u32::from(fields.start_address));
        let length = usize::from(fields.length);
        let data = if fields.token.is_outbound() {
            let start = payload as usize;
            self.memory[start..start + length].to_vec()
        } else {
            Vec::new()
        };

        let transaction = SimTransaction {
            class,
            slot: index,
            device_address: fields.device_address,
            endpoint: fields.endpoint,
            token: fields.token,
            toggle: fields.toggle,
            length,
            max_packet: usize::from(fields.max_packet),
            split: fields.split,
            hub_address: fields.hub_address,
            hub_port: fields.hub_port,
            data,
        };

        let response = match self.devices.get_mut(&fields.device_address) {
            Some(device) => device.transact(&transaction),
            None => SimResponse::TransactionError,
        };
        trace!("{class} slot {index}: {:?} -> {response:?}", transaction.token);

        let mut dw3 = status_of(&fields);
        let done = match &response {
            SimResponse::Data(bytes) => {
                let stored = bytes.len().min(memory::PAYLOAD_BYTES_PER_SLOT);
                let start = payload as usize;
                self.memory[start..start + stored].copy_from_slice(&bytes[..stored]);
                dw3.finish(bytes.len(), transaction.max_packet);
                true
            }
            SimResponse::Accept => {
                dw3.finish(length, transaction.max_packet);
                true
            }
            SimResponse::Partial(bytes) => {
                dw3.finish(*bytes, transaction.max_packet);
                true
            }
            SimResponse::Nak if fields.nak_reload > 0 => {
                // NAK counter ran out; the PTD stays active
                dw3.nak_count = 0;
                true
            }
            SimResponse::Nak => false,
            SimResponse::Stall => {
                dw3.active = false;
                dw3.halted = true;
                true
            }
            SimResponse::Babble => {
                dw3.active = false;
                dw3.babble = true;
                true
            }
            SimResponse::TransactionError => {
                dw3.active = false;
                dw3.transaction_error = true;
                true
            }
        };

        self.log.push(LoggedTransaction {
            transaction,
            response,
        });

        if done {
            self.write_dword(address + 12, dw3.encode());
        }
        done
    }
}

/// The status half of DW3 as the chip rewrites it.
#[derive(Debug, Clone, Copy)]
struct Dw3 {
    active: bool,
    halted: bool,
    babble: bool,
    transaction_error: bool,
    toggle: bool,
    error_counter: u8,
    nak_count: u8,
    bytes_done: usize,
}

const fn status_of(fields: &PtdFields) -> Dw3 {
    Dw3 {
        active: fields.active,
        halted: false,
        babble: false,
        transaction_error: false,
        toggle: fields.toggle,
        error_counter: fields.error_counter,
        nak_count: fields.nak_count,
        bytes_done: 0,
    }
}

impl Dw3 {
    /// Successful completion after moving `bytes` in packets of
    /// `max_packet` bytes. Every packet flips the data toggle, and a
    /// zero-length transfer is one packet.
    fn finish(&mut self, bytes: usize, max_packet: usize) {
        let packets = if bytes == 0 {
            1
        } else {
            bytes.div_ceil(max_packet.max(1))
        };
        self.active = false;
        self.bytes_done = bytes;
        self.toggle ^= packets % 2 == 1;
    }

    fn encode(self) -> u32 {
        (u32::from(self.active) << 31)
            | (u32::from(self.halted) << 30)
            | (u32::from(self.babble) << 29)
            | (u32::from(self.transaction_error) << 28)
            | (u32::from(self.toggle) << 25)
            | ((u32::from(self.error_counter) & 0x3) << 23)
            | ((u32::from(self.nak_count) & 0xf) << 19)
            | (self.bytes_done as u32 & 0x7fff)
    }
}

/// The simulated chip. Share it as `Arc<SimChip>`; it implements
/// [`RegisterBus`] for the driver.
#[derive(Debug)]
pub struct SimChip {
    state: Mutex<ChipState>,
    interrupt_line: RwLock<Arc<dyn InterruptLine>>,
}

impl Default for SimChip {
    fn default() -> Self {
        Self::new()
    }
}

impl SimChip {
    #[must_use]
    pub fn new() -> Self {
        let mut registers = BTreeMap::new();
        registers.insert(CHIP_ID, SIM_CHIP_ID);

        Self {
            state: Mutex::new(ChipState {
                registers,
                held: BTreeMap::new(),
                memory: vec![0; CPU_END as usize],
                armed_periodic: 0,
                armed_async: 0,
                reset_line: true,
                reset_releases: 0,
                now_us: 0,
                devices: BTreeMap::new(),
                log: Vec::new(),
            }),
            interrupt_line: RwLock::new(Arc::new(DummyInterruptLine)),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChipState> {
        // The lock only fails if another thread panicked while holding it.
        self.state.lock().unwrap()
    }

    /// Configure the line raised when an enabled interrupt cause is set.
    pub fn connect_irq(&self, line: Arc<dyn InterruptLine>) {
        *self.interrupt_line.write().unwrap() = line;
    }

    /// Plug a device model in at `address`.
    pub fn attach(&self, address: u8, device: Box<dyn SimDevice>) {
        self.state().devices.insert(address, device);
    }

    /// Make reads of `offset` return `value` until [`SimChip::release_register`].
    pub fn hold_register(&self, offset: u32, value: u32) {
        self.state().held.insert(offset, value);
    }

    pub fn release_register(&self, offset: u32) {
        self.state().held.remove(&offset);
    }

    /// Simulated time in microseconds.
    #[must_use]
    pub fn now_us(&self) -> u64 {
        self.state().now_us
    }

    pub fn advance_us(&self, us: u64) {
        self.state().now_us += us;
    }

    /// Number of times the reset line went from low to high.
    #[must_use]
    pub fn reset_releases(&self) -> usize {
        self.state().reset_releases
    }

    /// Run one frame of the schedule and raise the interrupt line if an
    /// enabled cause was set.
    pub fn run_frame(&self) {
        let raised = self.state().frame();
        if raised && self.irq_asserted() {
            self.raise();
        }
    }

    /// Level of the interrupt pin: an enabled cause is pending and global
    /// interrupts are on.
    #[must_use]
    pub fn irq_asserted(&self) -> bool {
        let state = self.state();
        let pending = state.register(INTERRUPT) & state.register(INTERRUPT_ENABLE);
        pending != 0 && state.register(HW_MODE_CONTROL) & hw_mode::GLOBAL_INTR_EN != 0
    }

    fn raise(&self) {
        let line = Arc::clone(&self.interrupt_line.read().unwrap());
        line.interrupt();
    }

    /// Set done bits that belong to no scheduled PTD, as a misbehaving chip
    /// would.
    pub fn inject_done(&self, class: PtdClass, bits: u32) {
        {
            let mut state = self.state();
            let done = state.register(class.done_map()) | bits;
            state.registers.insert(class.done_map(), done);
            let cause_bit = match class {
                PtdClass::Periodic => cause::INT,
                PtdClass::Async => cause::ATL,
            };
            let pending = state.register(INTERRUPT) | cause_bit;
            state.registers.insert(INTERRUPT, pending);
        }
        if self.irq_asserted() {
            self.raise();
        }
    }

    /// Every transaction executed so far.
    #[must_use]
    pub fn transactions(&self) -> Vec<LoggedTransaction> {
        self.state().log.clone()
    }

    /// Slots of `class` whose PTD is armed.
    #[must_use]
    pub fn armed(&self, class: PtdClass) -> u32 {
        self.state().armed(class)
    }

    /// Decode the PTD of `slot` in `class` straight from chip memory.
    #[must_use]
    pub fn ptd(&self, class: PtdClass, slot: SlotId) -> PtdWords {
        self.state().ptd_words(chip_to_cpu(class.ptd_address(slot)))
    }

    /// Peek at chip memory without going through the memory address
    /// register.
    #[must_use]
    pub fn peek(&self, cpu_address: u32, len: usize) -> Vec<u8> {
        let start = cpu_address as usize;
        self.state().memory[start..start + len].to_vec()
    }
}

impl RegisterBus for SimChip {
    fn read32(&self, offset: u32) -> u32 {
        let mut state = self.state();
        if let Some(&value) = state.held.get(&offset) {
            return value;
        }
        if (CPU_BASE..CPU_END).contains(&offset) {
            return state.read_dword(offset & !3);
        }
        match offset {
            ptd_maps::ISO_DONEMAP | ptd_maps::INT_DONEMAP | ptd_maps::ATL_DONEMAP => {
                // read to clear
                state.registers.insert(offset, 0).unwrap_or(0)
            }
            _ => state.register(offset),
        }
    }

    fn write32(&self, offset: u32, value: u32) {
        let mut state = self.state();
        if (CPU_BASE..CPU_END).contains(&offset) {
            state.write_dword(offset & !3, value);
            state.snoop_ptd_write(offset & !3, value);
            return;
        }
        match offset {
            INTERRUPT => {
                let pending = state.register(INTERRUPT) & !value;
                state.registers.insert(INTERRUPT, pending);
            }
            PORTSC1 => state.write_portsc(value),
            CHIP_ID => {}
            _ => {
                state.registers.insert(offset, value);
            }
        }
    }

    fn set_reset_line(&self, high: bool) {
        let mut state = self.state();
        if high && !state.reset_line {
            state.reset_releases += 1;
        }
        state.reset_line = high;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::isp1760::constants::operational::USBCMD;

    #[test]
    fn done_maps_clear_on_read() {
        let chip = SimChip::new();
        chip.inject_done(PtdClass::Async, 0b101);
        assert_eq!(chip.read32(ptd_maps::ATL_DONEMAP), 0b101);
        assert_eq!(chip.read32(ptd_maps::ATL_DONEMAP), 0);
    }

    #[test]
    fn interrupt_causes_are_write_one_to_clear() {
        let chip = SimChip::new();
        chip.inject_done(PtdClass::Async, 1);
        chip.inject_done(PtdClass::Periodic, 1);
        assert_eq!(chip.read32(INTERRUPT), cause::ATL | cause::INT);
        chip.write32(INTERRUPT, cause::ATL);
        assert_eq!(chip.read32(INTERRUPT), cause::INT);
    }

    #[test]
    fn powering_the_port_reports_a_connect() {
        let chip = SimChip::new();
        chip.write32(PORTSC1, portsc::PP);
        let status = chip.read32(PORTSC1);
        assert_eq!(status & (portsc::CCS | portsc::CSC), portsc::CCS | portsc::CSC);

        chip.write32(PORTSC1, status);
        assert_eq!(chip.read32(PORTSC1) & portsc::CSC, 0);
        assert_ne!(chip.read32(PORTSC1) & portsc::CCS, 0);
    }

    #[test]
    fn held_registers_ignore_writes() {
        let chip = SimChip::new();
        chip.hold_register(USBCMD, 0);
        chip.write32(USBCMD, 1);
        assert_eq!(chip.read32(USBCMD), 0);
        chip.release_register(USBCMD);
        assert_eq!(chip.read32(USBCMD), 1);
    }

    #[test]
    fn reset_line_releases_are_counted() {
        let chip = SimChip::new();
        chip.set_reset_line(false);
        chip.set_reset_line(true);
        chip.set_reset_line(true);
        assert_eq!(chip.reset_releases(), 1);
    }

    #[test]
    fn active_dw3_writes_arm_the_slot() {
        let chip = SimChip::new();
        let slot = SlotId::new(3);
        let dw3 = chip_to_cpu(PtdClass::Async.ptd_address(slot)) + 12;
        chip.write32(dw3, 1 << 31);
        assert_eq!(chip.armed(PtdClass::Async), 1 << 3);
        assert_eq!(chip.armed(PtdClass::Periodic), 0);

        chip.write32(dw3, 0);
        assert_eq!(chip.armed(PtdClass::Async), 0);
    }
}
