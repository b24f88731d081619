use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, trace, warn};

use crate::device::usb::{DeviceRequest, Direction, Pipe, PipeType, UsbDevice};

use super::{
    bus::{CriticalSection, Platform, RegisterBus},
    completion::{evaluate, Expectation},
    config::{CompletionMode, DriverConfig},
    constants::{
        configuration::{
            self, buffer_status, hw_mode, sw_reset, BUFFER_STATUS, CHIP_ID, HW_MODE_CONTROL,
            PORT_1_CONTROL, SCRATCH, SW_RESET,
        },
        interrupt::{self, cause, INTERRUPT, INTERRUPT_ENABLE},
        memory::{self, chip_to_cpu, payload_address},
        operational::{configflag, portsc, usbcmd, CONFIGFLAG, PORTSC1, USBCMD},
        ptd_maps, timing,
    },
    error::{HcdError, InitError, SlotError},
    ptd::{bytes_to_words, words_to_bytes, PtdFields, PtdStatus},
    slots::{Place, SlotInfo, SlotTable},
    stats::{HcdStats, StatsSnapshot},
    transfer::{
        CompletedTransfer, Completion, Lease, Outcome, PtdClass, SlotId, Token, Transfer,
    },
};

/// The ISP1760 host controller driver.
///
/// One value of this type owns the controller: its slot pool, the active
/// and ready lists, and the register window. It is shared by reference
/// between the foreground, which submits transfers and polls for results,
/// and the interrupt handler, which calls [`Isp1760::on_interrupt`].
#[derive(Debug)]
pub struct Isp1760 {
    bus: Arc<dyn RegisterBus>,
    platform: Arc<dyn Platform>,
    config: DriverConfig,
    table: Mutex<SlotTable>,
    stats: HcdStats,
}

impl Isp1760 {
    /// Create a driver for the controller behind `bus`.
    ///
    /// The chip is not touched until [`Isp1760::init`].
    pub fn new(
        bus: Arc<dyn RegisterBus>,
        platform: Arc<dyn Platform>,
        config: DriverConfig,
    ) -> Result<Self, InitError> {
        config.validate()?;
        Ok(Self {
            table: Mutex::new(SlotTable::new(config.pool_size)),
            bus,
            platform,
            config,
            stats: HcdStats::default(),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &DriverConfig {
        &self.config
    }

    fn critical_section(&self) -> CriticalSection<'_> {
        CriticalSection::enter(self.platform.as_ref(), &self.table)
    }

    fn read(&self, register: u32) -> u32 {
        self.bus.read32(register)
    }

    fn write(&self, register: u32, value: u32) {
        self.bus.write32(register, value);
    }

    // Skip map updates take the critical section as proof that the
    // read-modify-write cannot interleave with the interrupt handler.

    fn set_skip(&self, _cs: &CriticalSection<'_>, class: PtdClass, slot: SlotId) {
        let map = self.read(class.skip_map());
        self.write(class.skip_map(), map | slot.bit());
    }

    fn clear_skip(&self, _cs: &CriticalSection<'_>, class: PtdClass, slot: SlotId) {
        let map = self.read(class.skip_map());
        self.write(class.skip_map(), map & !slot.bit());
    }

    fn pulse_reset_line(&self) {
        self.bus.set_reset_line(true);
        self.platform.delay_ms(timing::RESET_PULSE_MS);
        self.bus.set_reset_line(false);
        self.platform.delay_ms(timing::RESET_PULSE_MS);
        self.bus.set_reset_line(true);
        self.platform.delay_ms(timing::RESET_PULSE_MS);
    }

    /// Poll `register` every 10 µs until `(value & mask) == expected` or
    /// `timeout_ms` elapses. The register is read at least once.
    pub fn wait_register(&self, register: u32, mask: u32, expected: u32, timeout_ms: u64) -> bool {
        let start = self.platform.now_ms();
        loop {
            if (self.read(register) & mask) == expected {
                return true;
            }
            self.platform.delay_us(timing::WAIT_POLL_US);
            if self.platform.now_ms().saturating_sub(start) >= timeout_ms {
                return false;
            }
        }
    }

    fn expect_register(
        &self,
        what: &'static str,
        register: u32,
        bits: u32,
        timeout_ms: u64,
    ) -> Result<(), InitError> {
        if self.wait_register(register, bits, bits, timeout_ms) {
            Ok(())
        } else {
            Err(InitError::Timeout { what, register })
        }
    }

    /// Reset the chip and bring up the host controller and its root port.
    pub fn init(&self) -> Result<(), InitError> {
        info!("Resetting ISP1760");
        self.pulse_reset_line();

        // 16 bit bus mode; the second write settles the bus
        self.write(HW_MODE_CONTROL, 0);
        self.write(HW_MODE_CONTROL, 0);

        self.write(SCRATCH, configuration::SCRATCH_PATTERN);
        // Read something else so a floating bus cannot fake the pattern.
        let chip_id = self.read(CHIP_ID);
        let scratch = self.read(SCRATCH);
        if scratch != configuration::SCRATCH_PATTERN {
            return Err(InitError::ScratchMismatch {
                wrote: configuration::SCRATCH_PATTERN,
                read: scratch,
            });
        }
        debug!("Chip id {chip_id:#010x}");

        self.write(BUFFER_STATUS, 0);
        self.write(ptd_maps::ATL_SKIPMAP, u32::MAX);
        self.write(ptd_maps::INT_SKIPMAP, u32::MAX);
        self.write(ptd_maps::ISO_SKIPMAP, u32::MAX);

        self.write(SW_RESET, sw_reset::RESET_ALL);
        self.platform.delay_ms(timing::SW_RESET_MS);
        self.write(SW_RESET, sw_reset::RESET_HC);
        self.platform.delay_ms(timing::SW_RESET_MS);

        self.write(HW_MODE_CONTROL, 0);
        self.write(HW_MODE_CONTROL, 0);
        let command = self.read(USBCMD) | usbcmd::RESET;
        self.write(USBCMD, command);
        self.platform.delay_ms(timing::HC_RESET_MS);
        self.write(HW_MODE_CONTROL, 0);
        self.write(HW_MODE_CONTROL, 0);
        self.write(USBCMD, command & !usbcmd::RESET);

        self.write(PORT_1_CONTROL, configuration::PORT_1_HOST_MODE);

        self.write(INTERRUPT, interrupt::HANDLED);
        self.write(INTERRUPT_ENABLE, interrupt::HANDLED);

        self.write(HW_MODE_CONTROL, hw_mode::ALL_ATX_RESET);
        self.platform.delay_ms(timing::ATX_RESET_MS);
        self.write(HW_MODE_CONTROL, 0);

        self.write(interrupt::ATL_IRQ_MASK_AND, 0);
        self.write(interrupt::ATL_IRQ_MASK_OR, u32::MAX);
        self.write(interrupt::INT_IRQ_MASK_AND, 0);
        self.write(interrupt::INT_IRQ_MASK_OR, u32::MAX);
        self.write(interrupt::ISO_IRQ_MASK_AND, 0);
        self.write(interrupt::ISO_IRQ_MASK_OR, 0);

        self.write(HW_MODE_CONTROL, hw_mode::GLOBAL_INTR_EN);

        self.write(USBCMD, usbcmd::RUN);
        self.expect_register("run bit", USBCMD, usbcmd::RUN, timing::RUN_TIMEOUT_MS)?;

        self.write(CONFIGFLAG, configflag::CF);
        self.expect_register(
            "EHCI configure flag",
            CONFIGFLAG,
            configflag::CF,
            timing::CONFIGFLAG_TIMEOUT_MS,
        )?;

        let last_ptd = 1u32 << (self.config.pool_size - 1);
        self.write(ptd_maps::ATL_LASTPTD, last_ptd);
        self.write(ptd_maps::INT_LASTPTD, last_ptd);
        self.write(ptd_maps::ISO_LASTPTD, 1);

        self.write(
            BUFFER_STATUS,
            buffer_status::ATL_FILLED | buffer_status::INT_FILLED,
        );

        self.write(PORTSC1, portsc::PP);
        self.expect_register(
            "root port connect",
            PORTSC1,
            portsc::CSC,
            timing::CONNECT_TIMEOUT_MS,
        )?;
        self.write(PORTSC1, self.read(PORTSC1) | portsc::CSC);

        self.write(
            PORTSC1,
            portsc::PP | (2 << portsc::LINE_STATUS_SHIFT) | portsc::PR | portsc::CCS,
        );
        self.platform.delay_ms(timing::PORT_RESET_MS);
        self.write(PORTSC1, self.read(PORTSC1) & !portsc::PR);

        info!(
            "ISP1760 running with {} transfer slots",
            self.config.pool_size
        );
        Ok(())
    }

    /// Put the chip back into reset.
    pub fn stop(&self) {
        info!("Stopping ISP1760");
        self.pulse_reset_line();
    }

    /// Take a slot from the pool for a transfer on `pipe`.
    ///
    /// The returned transfer must eventually go back through
    /// [`Isp1760::release`] unless it is scheduled.
    pub fn acquire(&self, device: Arc<UsbDevice>, pipe: Pipe) -> Result<Transfer, HcdError> {
        let class = PtdClass::for_pipe(pipe)
            .ok_or(HcdError::NotImplemented(PipeType::Isochronous))?;
        let lease = self.critical_section().acquire().ok_or_else(|| {
            warn!("No free transfer slot for {pipe:?}");
            HcdError::ResourceExhausted
        })?;
        trace!("Acquired slot {} for device {}", lease.slot, device.address());
        Ok(Transfer::new(lease, class, device, pipe))
    }

    /// Give an unscheduled transfer's slot back to the pool.
    pub fn release(&self, transfer: Transfer) -> Result<(), SlotError> {
        let lease = transfer.lease();
        drop(transfer);
        self.release_lease(lease)
    }

    fn release_lease(&self, lease: Lease) -> Result<(), SlotError> {
        self.critical_section().release(lease)
    }

    fn release_or_log(&self, lease: Lease) {
        if let Err(err) = self.release_lease(lease) {
            error!("Failed to release transfer slot: {err}");
        }
    }

    fn release_or_log_transfer(&self, transfer: Transfer) {
        if let Err(err) = self.release(transfer) {
            error!("Failed to release transfer slot: {err}");
        }
    }

    /// Write the PTD of `transfer` and hand it to the chip.
    ///
    /// A fresh start resets the NAK timeout clock; a retry keeps it.
    fn start_transfer(&self, mut transfer: Transfer, fresh: bool) {
        let slot = transfer.slot();
        let class = transfer.class();
        let endpoint = transfer.pipe.endpoint();
        let payload = payload_address(slot.index());

        if transfer.token == Token::Setup {
            transfer.device.set_toggle(endpoint, Direction::In, false);
            transfer.device.set_toggle(endpoint, Direction::Out, false);
        }

        if transfer.token.is_outbound() && !transfer.data.is_empty() {
            self.bus.write_mem(chip_to_cpu(payload), &transfer.data);
        }

        let toggle = transfer
            .device
            .toggle(endpoint, transfer.toggle_direction());
        let fields = PtdFields::for_transfer(&transfer, toggle, payload);
        trace!(
            "{class} slot {slot}: dev {} ep {endpoint} {:?} {} bytes, {}",
            fields.device_address,
            transfer.token,
            transfer.requested_length(),
            transfer.pipe.speed()
        );
        if self.config.dump_ptd {
            debug!("{class} slot {slot} written: {fields}");
        }
        self.bus.write_mem(
            chip_to_cpu(class.ptd_address(slot)),
            &words_to_bytes(&fields.encode()),
        );

        if fresh {
            transfer.start_ms = self.platform.now_ms();
        }

        let mut cs = self.critical_section();
        cs.link_active(transfer);
        self.clear_skip(&cs, class, slot);
    }

    /// Evaluate a PTD the chip reported done.
    ///
    /// Reads the PTD back, applies the outcome to the device record and the
    /// transfer, and always ends the PTD by setting its skip bit.
    pub(crate) fn complete_transfer(&self, transfer: &mut Transfer) -> Outcome {
        let slot = transfer.slot();
        let class = transfer.class();
        let pipe = transfer.pipe;
        let endpoint = pipe.endpoint();

        let mut raw = [0u8; memory::PTD_BYTES];
        self.bus
            .read_mem(chip_to_cpu(class.ptd_address(slot)), &mut raw);
        let words = bytes_to_words(&raw);
        if self.config.dump_ptd {
            match PtdFields::decode(&words) {
                Some(fields) => debug!("{class} slot {slot} read back: {fields}"),
                None => debug!("{class} slot {slot} read back: {words:08x?}"),
            }
        }

        let status = PtdStatus::decode(&words);
        let timeout_ms = match transfer.timeout_ms {
            0 => self.config.nak_timeout_ms,
            timeout => timeout,
        };
        let expect = Expectation {
            token: transfer.token,
            requested: transfer.requested_length(),
            elapsed_ms: self.platform.now_ms().saturating_sub(transfer.start_ms),
            timeout_ms: u64::from(timeout_ms),
        };
        let outcome = evaluate(&status, &expect);

        match outcome {
            Outcome::Success => {
                let device = &transfer.device;
                if transfer.token == Token::Setup {
                    device.set_toggle(endpoint, Direction::In, true);
                    device.set_toggle(endpoint, Direction::Out, true);
                } else {
                    device.set_toggle(endpoint, pipe.direction(), status.toggle);
                }

                let mut length = status.bytes_done;
                if transfer.token == Token::In {
                    if length > expect.requested {
                        warn!(
                            "{class} slot {slot}: requested {} bytes, chip reports {length}",
                            expect.requested
                        );
                        length = expect.requested;
                    }
                    if length > 0 {
                        let payload = chip_to_cpu(payload_address(slot.index()));
                        self.bus.read_mem(payload, &mut transfer.data[..length]);
                    }
                }
                transfer.actual_length = length;
                device.set_actual_length(length);
            }
            Outcome::Halt => transfer.device.halt(endpoint, pipe.direction()),
            _ => {}
        }

        match outcome {
            Outcome::Success | Outcome::Retry => {}
            failure => debug!(
                "{class} slot {slot}: dev {} ep {endpoint} failed: {failure}",
                pipe.device_address()
            ),
        }
        if outcome != Outcome::Retry {
            transfer.device.record_status(outcome);
        }

        let cs = self.critical_section();
        self.set_skip(&cs, class, slot);
        outcome
    }

    /// Service the controller interrupt.
    pub fn on_interrupt(&self) {
        let pending = self.read(INTERRUPT);
        // write one to clear
        self.write(INTERRUPT, pending);

        if pending & cause::INT != 0 {
            self.reconcile(PtdClass::Periodic);
        }
        if pending & cause::ATL != 0 {
            self.reconcile(PtdClass::Async);
        }
    }

    /// Match the done map of `class` against its active list and complete
    /// every finished transfer.
    fn reconcile(&self, class: PtdClass) {
        let (finished, unmatched) = {
            let mut cs = self.critical_section();
            let done = self.read(class.done_map());
            if done == 0 {
                return;
            }
            trace!(
                "{class} done {done:#010x}, active {:?}",
                cs.active_slots(class)
            );
            cs.detach_done(class, done)
        };

        if unmatched != 0 {
            error!("Unhandled {class} done bits {unmatched:#010x}");
            self.stats.unmatched(unmatched);
        }

        for mut transfer in finished {
            let outcome = self.complete_transfer(&mut transfer);
            self.dispatch(transfer, outcome);
        }
    }

    /// Route a completed transfer to whoever is waiting for it.
    fn dispatch(&self, mut transfer: Transfer, outcome: Outcome) {
        if outcome == Outcome::Retry {
            self.stats.retried();
            self.start_transfer(transfer, false);
            return;
        }
        self.stats.completed();

        let slot = transfer.slot();
        match std::mem::replace(&mut transfer.completion, Completion::Waiter) {
            Completion::Waiter => self.critical_section().park_terminal(transfer, outcome),
            Completion::Callback(callback) => {
                transfer.completion = Completion::Callback(callback);
                self.critical_section().push_ready(transfer, outcome);
            }
            Completion::Rearm(mut rearm) => {
                self.critical_section().set_terminal(slot, outcome);
                let again = rearm(&transfer.device, outcome, transfer.received());
                if again {
                    transfer.completion = Completion::Rearm(rearm);
                    transfer.actual_length = 0;
                    self.start_transfer(transfer, true);
                } else {
                    debug!("Interrupt transfer on slot {slot} not re-armed");
                    self.release_or_log_transfer(transfer);
                }
            }
        }
    }

    /// Run completion callbacks of finished asynchronous transfers.
    ///
    /// In [`CompletionMode::Polled`] this also runs the interrupt handler
    /// first. Callbacks run outside the critical section, one ready entry
    /// at a time.
    pub fn usb_event_poll(&self) {
        if self.config.completion == CompletionMode::Polled {
            self.on_interrupt();
        }

        loop {
            let next = self.critical_section().pop_ready();
            let Some((outcome, transfer)) = next else {
                break;
            };
            let lease = transfer.lease();
            let (completed, completion) = transfer.into_completed(outcome);
            match completion {
                Completion::Callback(callback) => callback(completed),
                other => error!("Slot {} on the ready list with {other:?}", lease.slot),
            }
            self.release_or_log(lease);
        }
    }

    /// Block until the transfer on `slot` reaches an outcome.
    fn wait_for(&self, slot: SlotId) -> (Outcome, Transfer) {
        let started = self.platform.now_ms();
        loop {
            self.usb_event_poll();

            let finished = self.critical_section().take_finished(slot);
            if let Some(result) = finished {
                return result;
            }

            if self.platform.now_ms().saturating_sub(started) >= self.config.stuck_after_ms {
                if let Some(transfer) = self.unlink_if_stuck(slot) {
                    return (Outcome::ProtocolError, transfer);
                }
            }
            self.platform.relax();
        }
    }

    /// Recover a slot that is still linked although the chip was told to
    /// skip it. Such a PTD never completes.
    fn unlink_if_stuck(&self, slot: SlotId) -> Option<Transfer> {
        let mut cs = self.critical_section();
        let Place::Active(class) = cs.place(slot) else {
            return None;
        };
        if self.read(class.skip_map()) & slot.bit() == 0 {
            return None;
        }
        let transfer = cs.unlink_active(slot)?;
        cs.set_terminal(slot, Outcome::ProtocolError);
        drop(cs);

        error!("{class} slot {slot} is active but skipped, giving up on it");
        self.stats.stuck();
        transfer.device.record_status(Outcome::ProtocolError);
        Some(transfer)
    }

    fn run_phase(
        &self,
        mut transfer: Transfer,
        pipe: Pipe,
        token: Token,
        data: Vec<u8>,
        timeout_ms: u32,
    ) -> (Outcome, Transfer) {
        transfer.stage(pipe, token, data);
        transfer.timeout_ms = timeout_ms;
        let slot = transfer.slot();
        self.start_transfer(transfer, true);
        self.wait_for(slot)
    }

    fn check_pipe(pipe: Pipe, expected: PipeType) -> Result<(), HcdError> {
        match pipe.pipe_type() {
            PipeType::Isochronous => Err(HcdError::NotImplemented(PipeType::Isochronous)),
            found if found != expected => Err(HcdError::ProtocolMismatch { expected, found }),
            _ => Ok(()),
        }
    }

    const fn check_length(requested: usize) -> Result<(), HcdError> {
        if requested > memory::PAYLOAD_BYTES_PER_SLOT {
            Err(HcdError::TransferTooLarge {
                requested,
                limit: memory::PAYLOAD_BYTES_PER_SLOT,
            })
        } else {
            Ok(())
        }
    }

    /// Buffer to hand to the chip for a data phase in `direction`.
    fn phase_buffer(direction: Direction, buffer: &[u8]) -> Vec<u8> {
        match direction {
            Direction::In => vec![0; buffer.len()],
            Direction::Out => buffer.to_vec(),
        }
    }

    /// Run a control transfer and block until it finishes.
    ///
    /// `buffer` is the data stage: filled for IN pipes, sent for OUT pipes.
    /// Returns the number of data stage bytes moved.
    pub fn submit_control_msg(
        &self,
        device: &Arc<UsbDevice>,
        pipe: Pipe,
        buffer: &mut [u8],
        setup: &DeviceRequest,
    ) -> Result<usize, HcdError> {
        Self::check_pipe(pipe, PipeType::Control)?;
        Self::check_length(buffer.len())?;
        debug!(
            "Control request {:#04x} to device {} (parent {:?})",
            setup.request,
            pipe.device_address(),
            device.parent()
        );

        let transfer = self.acquire(Arc::clone(device), pipe)?;
        let lease = transfer.lease();
        let result = self.control_phases(transfer, pipe, buffer, setup);
        self.release_or_log(lease);

        if let Err(err) = &result {
            warn!("Control transfer to device {} failed: {err}", pipe.device_address());
        }
        result
    }

    fn control_phases(
        &self,
        transfer: Transfer,
        pipe: Pipe,
        buffer: &mut [u8],
        setup: &DeviceRequest,
    ) -> Result<usize, HcdError> {
        let device = Arc::clone(&transfer.device);
        let (outcome, transfer) =
            self.run_phase(transfer, pipe, Token::Setup, setup.to_bytes().to_vec(), 0);
        if !outcome.is_success() {
            return Err(HcdError::Transfer(outcome));
        }

        let direction = pipe.direction();
        let data = Self::phase_buffer(direction, buffer);
        let (outcome, transfer) =
            self.run_phase(transfer, pipe, Token::for_direction(direction), data, 0);
        if !outcome.is_success() {
            return Err(HcdError::Transfer(outcome));
        }

        let actual = transfer.actual_length();
        if direction == Direction::In {
            buffer[..actual].copy_from_slice(transfer.received());
        }

        if actual > 0 {
            // The status stage always uses DATA1.
            let status_pipe = pipe.reversed();
            let status_direction = status_pipe.direction();
            device.set_toggle(pipe.endpoint(), status_direction, true);
            let (outcome, _) = self.run_phase(
                transfer,
                status_pipe,
                Token::for_direction(status_direction),
                Vec::new(),
                0,
            );
            if !outcome.is_success() {
                return Err(HcdError::Transfer(outcome));
            }
        }

        device.set_actual_length(actual);
        Ok(actual)
    }

    /// Run a bulk transfer and block until it finishes.
    ///
    /// A `timeout_ms` of 0 selects the configured NAK timeout. Returns the
    /// number of bytes moved.
    pub fn submit_bulk_msg(
        &self,
        device: &Arc<UsbDevice>,
        pipe: Pipe,
        buffer: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, HcdError> {
        Self::check_pipe(pipe, PipeType::Bulk)?;
        Self::check_length(buffer.len())?;

        let transfer = self.acquire(Arc::clone(device), pipe)?;
        let direction = pipe.direction();
        let data = Self::phase_buffer(direction, buffer);
        let (outcome, transfer) = self.run_phase(
            transfer,
            pipe,
            Token::for_direction(direction),
            data,
            timeout_ms,
        );
        let actual = transfer.actual_length();
        if outcome.is_success() && direction == Direction::In {
            buffer[..actual].copy_from_slice(transfer.received());
        }
        self.release_or_log_transfer(transfer);

        if outcome.is_success() {
            Ok(actual)
        } else {
            warn!(
                "Bulk transfer to device {} ep {} failed: {outcome}",
                pipe.device_address(),
                pipe.endpoint()
            );
            Err(HcdError::Transfer(outcome))
        }
    }

    /// Start a bulk transfer without waiting for it.
    ///
    /// `callback` runs from [`Isp1760::usb_event_poll`] once the transfer
    /// finished, after which the slot is released.
    pub fn submit_bulk_async<F>(
        &self,
        device: &Arc<UsbDevice>,
        pipe: Pipe,
        data: Vec<u8>,
        timeout_ms: u32,
        callback: F,
    ) -> Result<SlotId, HcdError>
    where
        F: FnOnce(CompletedTransfer) + Send + 'static,
    {
        Self::check_pipe(pipe, PipeType::Bulk)?;
        Self::check_length(data.len())?;

        let mut transfer = self.acquire(Arc::clone(device), pipe)?;
        let slot = transfer.slot();
        transfer.stage(pipe, Token::for_direction(pipe.direction()), data);
        transfer.timeout_ms = timeout_ms;
        transfer.completion = Completion::Callback(Box::new(callback));
        self.start_transfer(transfer, true);
        Ok(slot)
    }

    /// Start a periodic interrupt transfer.
    ///
    /// Returns once the PTD is scheduled. Every time it completes, `rearm`
    /// runs in interrupt context with the outcome and the received bytes;
    /// the transfer is scheduled again for as long as it returns true.
    ///
    /// The chip polls full and low speed endpoints every 8 ms and high
    /// speed endpoints every micro-frame; `interval` is not used to pick the
    /// schedule.
    pub fn submit_int_msg<F>(
        &self,
        device: &Arc<UsbDevice>,
        pipe: Pipe,
        data: Vec<u8>,
        interval: u32,
        rearm: F,
    ) -> Result<SlotId, HcdError>
    where
        F: FnMut(&UsbDevice, Outcome, &[u8]) -> bool + Send + 'static,
    {
        Self::check_pipe(pipe, PipeType::Interrupt)?;
        Self::check_length(data.len())?;

        let mut transfer = self.acquire(Arc::clone(device), pipe)?;
        let slot = transfer.slot();
        debug!(
            "Interrupt transfer on slot {slot}: dev {} ep {}, requested interval {interval}",
            pipe.device_address(),
            pipe.endpoint()
        );
        transfer.stage(pipe, Token::for_direction(pipe.direction()), data);
        transfer.completion = Completion::Rearm(Box::new(rearm));
        self.start_transfer(transfer, true);
        Ok(slot)
    }

    /// State and list membership of every slot.
    #[must_use]
    pub fn slot_snapshot(&self) -> Vec<SlotInfo> {
        self.critical_section().snapshot()
    }

    #[must_use]
    pub fn free_slots(&self) -> usize {
        self.critical_section().free_count()
    }

    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.critical_section().pool_size()
    }

    /// Verify the list bookkeeping. Meant for tests and debugging.
    pub fn check_invariants(&self) -> Result<(), String> {
        self.critical_section().check_invariants()
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}
