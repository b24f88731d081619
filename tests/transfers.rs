use std::sync::{Arc, Mutex};

use isp1760_hcd::{
    device::{
        isp1760::{
            constants::ptd_maps, CompletionMode, DriverConfig, HcdError, Outcome, Place, PtdClass,
            RegisterBus, Token,
        },
        usb::{DeviceRequest, Direction, Pipe, PipeType, Speed, UsbDevice},
    },
    sim::{EchoDevice, FnDevice, ScriptedDevice, SimResponse, SimTransaction},
};

mod util;
use util::{bulk_pipe, control_pipe, high_speed_device, interrupt_pipe, Harness, DEVICE_ADDRESS};

fn answer_in_with(data: Vec<u8>) -> FnDevice<impl FnMut(&SimTransaction) -> SimResponse + Send> {
    FnDevice(move |t: &SimTransaction| match t.token {
        Token::In => SimResponse::Data(data.clone()),
        _ => SimResponse::Accept,
    })
}

#[test]
fn bulk_in_returns_data_and_advances_the_toggle() {
    let h = Harness::started(DriverConfig::default());
    h.chip.attach(DEVICE_ADDRESS, Box::new(answer_in_with(b"0123456789abc".to_vec())));
    let device = high_speed_device();

    let mut buffer = [0u8; 64];
    let length = h
        .driver
        .submit_bulk_msg(&device, bulk_pipe(Direction::In, 2), &mut buffer, 0)
        .unwrap();

    assert_eq!(length, 13);
    assert_eq!(&buffer[..13], b"0123456789abc");
    assert!(device.toggle(2, Direction::In));
    assert!(!device.toggle(2, Direction::Out));
    assert_eq!(device.last_status(), Some(Outcome::Success));
    assert_eq!(device.actual_length(), 13);

    let stats = h.driver.stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.retries, 0);
    assert_eq!(h.driver.free_slots(), 32);
    h.assert_consistent();
}

#[test]
fn a_full_packet_bulk_in_moves_every_byte() {
    let h = Harness::started(DriverConfig::default());
    let packet: Vec<u8> = (0..64).collect();
    h.chip.attach(DEVICE_ADDRESS, Box::new(answer_in_with(packet.clone())));
    let device = high_speed_device();

    let mut buffer = [0u8; 64];
    let length = h
        .driver
        .submit_bulk_msg(&device, bulk_pipe(Direction::In, 1), &mut buffer, 0)
        .unwrap();

    assert_eq!(length, 64);
    assert_eq!(buffer.to_vec(), packet);
    assert_eq!(device.actual_length(), 64);
    assert!(device.toggle(1, Direction::In));
    assert_eq!(device.last_status(), Some(Outcome::Success));
    assert_eq!(h.driver.free_slots(), 32);
}

#[test]
fn bulk_out_data_reaches_the_device() {
    let h = Harness::started(DriverConfig::default());
    h.chip
        .attach(DEVICE_ADDRESS, Box::new(EchoDevice::with_default_descriptor()));
    let device = high_speed_device();

    let mut message = *b"ping";
    let sent = h
        .driver
        .submit_bulk_msg(&device, bulk_pipe(Direction::Out, 2), &mut message, 0)
        .unwrap();
    assert_eq!(sent, 4);

    let mut echo = [0u8; 16];
    let received = h
        .driver
        .submit_bulk_msg(&device, bulk_pipe(Direction::In, 2), &mut echo, 0)
        .unwrap();
    assert_eq!(&echo[..received], b"ping");

    let log = h.chip.transactions();
    assert_eq!(log[0].transaction.token, Token::Out);
    assert_eq!(log[0].transaction.data, b"ping");
    h.assert_consistent();
}

#[test]
fn control_read_runs_setup_data_and_status_stages() {
    let h = Harness::started(DriverConfig::default());
    h.chip
        .attach(DEVICE_ADDRESS, Box::new(EchoDevice::with_default_descriptor()));
    let device = high_speed_device();

    let mut descriptor = [0u8; 18];
    let length = h
        .driver
        .submit_control_msg(
            &device,
            control_pipe(Direction::In),
            &mut descriptor,
            &DeviceRequest::get_device_descriptor(18),
        )
        .unwrap();

    assert_eq!(length, 18);
    assert_eq!(descriptor[0], 0x12);
    assert_eq!(descriptor[1], 0x01);
    assert_eq!(device.actual_length(), 18);

    let stages: Vec<_> = h
        .chip
        .transactions()
        .into_iter()
        .map(|entry| {
            (
                entry.transaction.token,
                entry.transaction.toggle,
                entry.transaction.length,
            )
        })
        .collect();
    assert_eq!(
        stages,
        vec![(Token::Setup, false, 8), (Token::In, true, 18), (Token::Out, true, 0)]
    );
    assert_eq!(h.driver.free_slots(), 32);
    h.assert_consistent();
}

#[test]
fn control_without_data_skips_the_status_stage() {
    let h = Harness::started(DriverConfig::default());
    h.chip
        .attach(DEVICE_ADDRESS, Box::new(EchoDevice::with_default_descriptor()));
    let device = high_speed_device();

    let set_configuration = DeviceRequest {
        request_type: 0,
        request: DeviceRequest::SET_CONFIGURATION,
        value: 1,
        index: 0,
        length: 0,
    };
    let length = h
        .driver
        .submit_control_msg(
            &device,
            control_pipe(Direction::Out),
            &mut [],
            &set_configuration,
        )
        .unwrap();

    assert_eq!(length, 0);
    let stages: Vec<_> = h
        .chip
        .transactions()
        .into_iter()
        .map(|entry| (entry.transaction.token, entry.transaction.toggle))
        .collect();
    // The SETUP stage leaves the OUT toggle at DATA1 for the next stage.
    assert_eq!(stages, vec![(Token::Setup, false), (Token::Out, true)]);
}

#[test]
fn naks_are_retried_until_the_timeout_expires() {
    let h = Harness::started(DriverConfig::default());
    h.chip.attach(
        DEVICE_ADDRESS,
        Box::new(ScriptedDevice::always(SimResponse::Nak)),
    );
    let device = high_speed_device();

    let mut buffer = [0u8; 8];
    let result = h
        .driver
        .submit_bulk_msg(&device, bulk_pipe(Direction::In, 1), &mut buffer, 20);

    assert_eq!(result, Err(HcdError::Transfer(Outcome::NakTimeout)));
    let stats = h.driver.stats();
    assert!(stats.retries >= 10, "only {} retries", stats.retries);
    assert_eq!(stats.completed, 1);
    assert_eq!(device.last_status(), Some(Outcome::NakTimeout));
    assert_eq!(h.driver.free_slots(), 32);
    h.assert_consistent();
}

#[test]
fn a_nak_burst_shorter_than_the_timeout_still_succeeds() {
    let h = Harness::started(DriverConfig::default());
    h.chip.attach(
        DEVICE_ADDRESS,
        Box::new(ScriptedDevice::new(
            [SimResponse::Nak, SimResponse::Nak, SimResponse::Nak],
            SimResponse::Data(vec![7; 4]),
        )),
    );
    let device = high_speed_device();

    let mut buffer = [0u8; 8];
    let length = h
        .driver
        .submit_bulk_msg(&device, bulk_pipe(Direction::In, 1), &mut buffer, 0)
        .unwrap();

    assert_eq!(length, 4);
    assert_eq!(h.driver.stats().retries, 3);
}

#[test]
fn stalls_halt_the_endpoint() {
    let h = Harness::started(DriverConfig::default());
    h.chip.attach(
        DEVICE_ADDRESS,
        Box::new(ScriptedDevice::always(SimResponse::Stall)),
    );
    let device = high_speed_device();

    let mut buffer = [0u8; 8];
    let result = h
        .driver
        .submit_bulk_msg(&device, bulk_pipe(Direction::In, 3), &mut buffer, 0);

    assert_eq!(result, Err(HcdError::Transfer(Outcome::Halt)));
    assert!(device.is_halted(3, Direction::In));
    assert!(!device.is_halted(3, Direction::Out));
    assert_eq!(device.last_status(), Some(Outcome::Halt));
    h.assert_consistent();
}

#[test]
fn babble_and_transaction_errors_are_reported() {
    let h = Harness::started(DriverConfig::default());
    h.chip.attach(
        DEVICE_ADDRESS,
        Box::new(ScriptedDevice::new(
            [SimResponse::Babble, SimResponse::TransactionError],
            SimResponse::Accept,
        )),
    );
    let device = high_speed_device();
    let pipe = bulk_pipe(Direction::In, 1);

    let mut buffer = [0u8; 8];
    assert_eq!(
        h.driver.submit_bulk_msg(&device, pipe, &mut buffer, 0),
        Err(HcdError::Transfer(Outcome::Babble))
    );
    assert_eq!(
        h.driver.submit_bulk_msg(&device, pipe, &mut buffer, 0),
        Err(HcdError::Transfer(Outcome::BufferError))
    );
    assert_eq!(h.driver.free_slots(), 32);
}

#[test]
fn transfers_to_an_absent_device_fail() {
    let h = Harness::started(DriverConfig::default());
    let device = high_speed_device();

    let mut buffer = [0u8; 8];
    assert_eq!(
        h.driver
            .submit_bulk_msg(&device, bulk_pipe(Direction::In, 1), &mut buffer, 0),
        Err(HcdError::Transfer(Outcome::BufferError))
    );
}

#[test]
fn oversized_in_data_is_clipped_to_the_buffer() {
    let h = Harness::started(DriverConfig::default());
    h.chip
        .attach(DEVICE_ADDRESS, Box::new(answer_in_with(vec![0xaa; 100])));
    let device = high_speed_device();

    let mut buffer = [0u8; 64];
    let length = h
        .driver
        .submit_bulk_msg(&device, bulk_pipe(Direction::In, 1), &mut buffer, 0)
        .unwrap();

    assert_eq!(length, 64);
    assert!(buffer.iter().all(|&b| b == 0xaa));
}

#[test]
fn short_out_transfers_are_wrong_length() {
    let h = Harness::started(DriverConfig::default());
    h.chip.attach(
        DEVICE_ADDRESS,
        Box::new(ScriptedDevice::always(SimResponse::Partial(3))),
    );
    let device = high_speed_device();

    let mut data = [1u8; 8];
    assert_eq!(
        h.driver
            .submit_bulk_msg(&device, bulk_pipe(Direction::Out, 1), &mut data, 0),
        Err(HcdError::Transfer(Outcome::WrongLength))
    );
}

#[test]
fn submissions_are_checked_before_a_slot_is_taken() {
    let h = Harness::started(DriverConfig::default());
    let device = high_speed_device();
    let mut buffer = [0u8; 8];

    assert_eq!(
        h.driver
            .submit_bulk_msg(&device, control_pipe(Direction::In), &mut buffer, 0),
        Err(HcdError::ProtocolMismatch {
            expected: PipeType::Bulk,
            found: PipeType::Control
        })
    );

    let iso = Pipe::new(
        PipeType::Isochronous,
        Direction::In,
        DEVICE_ADDRESS,
        1,
        Speed::High,
        3,
    );
    assert_eq!(
        h.driver.submit_bulk_msg(&device, iso, &mut buffer, 0),
        Err(HcdError::NotImplemented(PipeType::Isochronous))
    );
    assert_eq!(
        h.driver
            .submit_int_msg(&device, iso, vec![0; 8], 8, |_, _, _| false),
        Err(HcdError::NotImplemented(PipeType::Isochronous))
    );

    let mut large = vec![0u8; 2048];
    assert_eq!(
        h.driver
            .submit_bulk_msg(&device, bulk_pipe(Direction::In, 1), &mut large, 0),
        Err(HcdError::TransferTooLarge {
            requested: 2048,
            limit: 1024
        })
    );

    assert!(h.chip.transactions().is_empty());
    assert_eq!(h.driver.free_slots(), 32);
}

#[test]
fn interrupt_transfers_rearm_until_the_hook_declines() {
    let h = Harness::started(DriverConfig::default());
    let mut model = EchoDevice::with_default_descriptor();
    model.queue_reports(1, [vec![1, 0], vec![2, 0], vec![3, 0]]);
    h.chip.attach(DEVICE_ADDRESS, Box::new(model));
    let device = high_speed_device();

    let reports = Arc::new(Mutex::new(Vec::new()));
    let seen = reports.clone();
    let slot = h
        .driver
        .submit_int_msg(&device, interrupt_pipe(1), vec![0; 8], 8, move |_, outcome, data| {
            let mut seen = seen.lock().unwrap();
            seen.push((outcome, data.to_vec()));
            seen.len() < 3
        })
        .unwrap();

    let info = h.driver.slot_snapshot()[slot.index()];
    assert_eq!(info.place, Place::Active(PtdClass::Periodic));

    h.run_frames(20);

    assert_eq!(
        *reports.lock().unwrap(),
        vec![
            (Outcome::Success, vec![1, 0]),
            (Outcome::Success, vec![2, 0]),
            (Outcome::Success, vec![3, 0]),
        ]
    );
    let toggles: Vec<_> = h
        .chip
        .transactions()
        .into_iter()
        .filter(|entry| entry.response != SimResponse::Nak)
        .map(|entry| entry.transaction.toggle)
        .collect();
    assert_eq!(toggles, vec![false, true, false]);
    assert_eq!(h.driver.free_slots(), 32);
    h.assert_consistent();
}

#[test]
fn interrupt_naks_keep_the_ptd_scheduled() {
    let h = Harness::started(DriverConfig::default());
    h.chip.attach(
        DEVICE_ADDRESS,
        Box::new(ScriptedDevice::always(SimResponse::Nak)),
    );
    let device = high_speed_device();

    let slot = h
        .driver
        .submit_int_msg(&device, interrupt_pipe(1), vec![0; 8], 8, |_, _, _| true)
        .unwrap();
    h.run_frames(10);

    assert_eq!(h.chip.armed(PtdClass::Periodic), slot.bit());
    assert_eq!(h.driver.stats().completed, 0);
    assert_eq!(h.driver.free_slots(), 31);
    h.assert_consistent();
}

#[test]
fn async_bulk_completions_run_from_the_event_poll() {
    let h = Harness::started(DriverConfig::default());
    h.chip
        .attach(DEVICE_ADDRESS, Box::new(EchoDevice::with_default_descriptor()));
    let device = high_speed_device();

    let finished = Arc::new(Mutex::new(None));
    let sink = finished.clone();
    let slot = h
        .driver
        .submit_bulk_async(
            &device,
            bulk_pipe(Direction::Out, 2),
            b"queued".to_vec(),
            0,
            move |completed| {
                *sink.lock().unwrap() = Some((completed.outcome, completed.actual_length));
            },
        )
        .unwrap();

    h.run_frames(2);
    // Completed in interrupt context, but the callback waits for the poll.
    assert_eq!(*finished.lock().unwrap(), None);
    assert_eq!(h.driver.slot_snapshot()[slot.index()].place, Place::Ready);

    h.driver.usb_event_poll();
    assert_eq!(*finished.lock().unwrap(), Some((Outcome::Success, 6)));
    assert_eq!(h.driver.free_slots(), 32);
    h.assert_consistent();
}

#[test]
fn polled_mode_needs_no_interrupt_delivery() {
    let h = Harness::started(DriverConfig {
        completion: CompletionMode::Polled,
        ..DriverConfig::default()
    });
    h.chip
        .attach(DEVICE_ADDRESS, Box::new(answer_in_with(vec![5; 10])));
    let device = high_speed_device();

    let mut buffer = [0u8; 16];
    let length = h
        .driver
        .submit_bulk_msg(&device, bulk_pipe(Direction::In, 1), &mut buffer, 0)
        .unwrap();
    assert_eq!(length, 10);
}

#[test]
fn full_speed_devices_behind_a_hub_use_split_transactions() {
    use isp1760_hcd::device::usb::HubPort;

    let h = Harness::started(DriverConfig::default());
    h.chip
        .attach(DEVICE_ADDRESS, Box::new(answer_in_with(vec![9; 4])));
    let device = Arc::new(UsbDevice::new(
        DEVICE_ADDRESS,
        Speed::Full,
        Some(HubPort {
            hub_address: 4,
            port: 2,
        }),
        8,
    ));
    let pipe = Pipe::new(
        PipeType::Bulk,
        Direction::In,
        DEVICE_ADDRESS,
        1,
        Speed::Full,
        0,
    );

    let mut buffer = [0u8; 8];
    h.driver
        .submit_bulk_msg(&device, pipe, &mut buffer, 0)
        .unwrap();

    let log = h.chip.transactions();
    assert!(log[0].transaction.split);
    assert_eq!(log[0].transaction.hub_address, 4);
    assert_eq!(log[0].transaction.hub_port, 2);
    assert_eq!(log[0].transaction.max_packet, 8);
}

#[test]
fn stray_done_bits_are_counted_and_ignored() {
    let h = Harness::started(DriverConfig::default());
    h.chip.inject_done(PtdClass::Async, 1 << 5 | 1 << 9);

    h.driver.on_interrupt();

    assert_eq!(h.driver.stats().unmatched_done_bits, 2);
    assert_eq!(h.chip.read32(ptd_maps::ATL_DONEMAP), 0);
    assert_eq!(h.driver.free_slots(), 32);
    h.assert_consistent();
}

#[test]
fn a_stray_done_bit_does_not_hold_up_its_neighbours() {
    let h = Harness::started(DriverConfig::default());
    h.chip
        .attach(DEVICE_ADDRESS, Box::new(EchoDevice::with_default_descriptor()));
    let device = high_speed_device();

    let finished = Arc::new(Mutex::new(None));
    let sink = finished.clone();
    let slot = h
        .driver
        .submit_bulk_async(
            &device,
            bulk_pipe(Direction::Out, 2),
            b"neighbour".to_vec(),
            0,
            move |completed| *sink.lock().unwrap() = Some(completed.outcome),
        )
        .unwrap();

    // One done map carries the real completion and a bit nobody owns.
    h.chip.run_frame();
    let stray = 1 << 7;
    assert_ne!(slot.bit(), stray);
    h.chip.inject_done(PtdClass::Async, stray);
    h.driver.on_interrupt();

    assert_eq!(h.driver.slot_snapshot()[slot.index()].place, Place::Ready);
    assert_eq!(h.driver.stats().unmatched_done_bits, 1);

    h.driver.usb_event_poll();
    assert_eq!(*finished.lock().unwrap(), Some(Outcome::Success));
    assert_eq!(h.driver.free_slots(), 32);
    h.assert_consistent();
}
