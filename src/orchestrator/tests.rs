//! Unit tests for the orchestration state machine.
//!
//! These tests run on the host (not embedded) against a recording stack
//! that accepts every command unless told otherwise.

use std::vec::Vec;

use super::{Effect, Orchestrator, State, StackHandler};
use crate::ble::{Address, Clock, ConnHandle, Event, Stack, Tick};
use crate::config::TestConfig;
use crate::error::{Error, StackError, StackOp};

// ═══════════════════════════════════════════════════════════════════════════
// Recording stack
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug, PartialEq, Eq)]
enum Call {
    SetInterval(u32),
    StartScan,
    StopScan,
    Open(Address),
    Write(ConnHandle, u16, Vec<u8>),
    ArmTimer(u32),
}

#[derive(Default)]
struct MockStack {
    calls: Vec<Call>,
    now: Tick,
    start_scan_status: Option<StackError>,
    write_status: Option<StackError>,
}

impl MockStack {
    fn writes(&self) -> Vec<u16> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::Write(h, _, _) => Some(h.0),
                _ => None,
            })
            .collect()
    }

    fn count(&self, call: &Call) -> usize {
        self.calls.iter().filter(|c| *c == call).count()
    }

    fn opens(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, Call::Open(_)))
            .count()
    }
}

impl Stack for MockStack {
    fn set_connection_interval(&mut self, interval_ms: u32) -> Result<(), StackError> {
        self.calls.push(Call::SetInterval(interval_ms));
        Ok(())
    }

    fn start_scan(&mut self) -> Result<(), StackError> {
        self.calls.push(Call::StartScan);
        self.start_scan_status.map_or(Ok(()), Err)
    }

    fn stop_scan(&mut self) -> Result<(), StackError> {
        self.calls.push(Call::StopScan);
        Ok(())
    }

    fn open_connection(&mut self, address: &Address) -> Result<(), StackError> {
        self.calls.push(Call::Open(*address));
        Ok(())
    }

    fn write_without_response(
        &mut self,
        handle: ConnHandle,
        attribute: u16,
        payload: &[u8],
    ) -> Result<(), StackError> {
        self.calls.push(Call::Write(handle, attribute, payload.to_vec()));
        self.write_status.map_or(Ok(()), Err)
    }

    fn arm_scan_timer(&mut self, duration_ms: u32) -> Result<(), StackError> {
        self.calls.push(Call::ArmTimer(duration_ms));
        Ok(())
    }
}

impl Clock for MockStack {
    fn now(&self) -> Tick {
        self.now
    }

    // 32768 Hz sleep timer.
    fn ticks_to_ms(&self, ticks: u64) -> u32 {
        (ticks * 1000 / 32_768) as u32
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════

/// Flags + complete 16-bit UUID list with 0xCCCC.
const MATCHING_ADV: [u8; 7] = [0x02, 0x01, 0x06, 0x03, 0x03, 0xCC, 0xCC];

fn peer(n: u8) -> Address {
    Address::public([n, 0x11, 0x22, 0x33, 0x44, 0x55])
}

fn booted<const N: usize>(config: TestConfig) -> (Orchestrator<N>, MockStack) {
    let mut orc = Orchestrator::new(config);
    let mut stack = MockStack::default();
    orc.on_ready(&mut stack).unwrap();
    (orc, stack)
}

fn connect<const N: usize>(orc: &mut Orchestrator<N>, stack: &mut MockStack, n: u8, handle: u16) {
    let adv = Event::AdvertisementReport {
        address: peer(n),
        payload: &MATCHING_ADV,
    };
    orc.on_event(stack, adv).unwrap();
    orc.on_event(
        stack,
        Event::ConnectionOpened {
            handle: ConnHandle(handle),
        },
    )
    .unwrap();
}

/// Boot, connect `handles`, close the scan window and press start.
fn started<const N: usize>(handles: &[u16], config: TestConfig) -> (Orchestrator<N>, MockStack) {
    let (mut orc, mut stack) = booted::<N>(config);
    for (i, &h) in handles.iter().enumerate() {
        connect(&mut orc, &mut stack, i as u8, h);
    }
    orc.on_event(&mut stack, Event::ScanTimeout).unwrap();
    orc.on_event(&mut stack, Event::StartTrigger).unwrap();
    (orc, stack)
}

fn respond<const N: usize>(orc: &mut Orchestrator<N>, stack: &mut MockStack, handle: u16) {
    orc.on_event(
        stack,
        Event::AttributeValue {
            handle: ConnHandle(handle),
            payload: &[3],
        },
    )
    .unwrap();
}

fn close<const N: usize>(orc: &mut Orchestrator<N>, stack: &mut MockStack, handle: u16) {
    orc.on_event(
        stack,
        Event::ConnectionClosed {
            handle: ConnHandle(handle),
        },
    )
    .unwrap();
}

// ═══════════════════════════════════════════════════════════════════════════
// Boot & discovery
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn boot_configures_link_starts_scan_and_arms_timer() {
    let (orc, stack) = booted::<2>(TestConfig::default());
    assert_eq!(orc.state(), State::Scanning);
    assert_eq!(
        stack.calls,
        [Call::SetInterval(40), Call::StartScan, Call::ArmTimer(5_000)]
    );
}

#[test]
fn events_before_ready_are_ignored() {
    let mut orc: Orchestrator<2> = Orchestrator::default();
    let mut stack = MockStack::default();
    for event in [
        Event::ScanTimeout,
        Event::StartTrigger,
        Event::ConnectionOpened {
            handle: ConnHandle(1),
        },
        Event::Continue,
    ] {
        orc.on_event(&mut stack, event).unwrap();
    }
    assert_eq!(orc.state(), State::Init);
    assert!(stack.calls.is_empty());
    assert!(orc.table().is_empty());
}

#[test]
fn step_does_not_touch_the_stack() {
    let mut orc: Orchestrator<2> = Orchestrator::default();
    let step = orc.step(&Event::Ready);
    assert_eq!(
        step.effects.as_slice(),
        [
            Effect::SetConnectionInterval { interval_ms: 40 },
            Effect::StartScan,
            Effect::ArmScanTimer { duration_ms: 5_000 },
        ]
    );
    assert!(!step.follow_up);
    assert_eq!(orc.state(), State::Scanning);
}

#[test]
fn matching_advertisement_opens_connection() {
    let (mut orc, mut stack) = booted::<2>(TestConfig::default());
    let adv = Event::AdvertisementReport {
        address: peer(1),
        payload: &MATCHING_ADV,
    };
    orc.on_event(&mut stack, adv).unwrap();
    assert_eq!(stack.calls.last(), Some(&Call::Open(peer(1))));
    assert!(orc.is_connecting());
    assert_eq!(orc.state(), State::Scanning);
}

#[test]
fn non_matching_advertisements_are_ignored() {
    let (mut orc, mut stack) = booted::<2>(TestConfig::default());
    let payloads: [&[u8]; 4] = [
        &[0x03, 0x03, 0x0F, 0x18],
        // Device name carrying the target bytes.
        &[0x03, 0x09, 0xCC, 0xCC],
        &[],
        // Truncated UUID list.
        &[0x05, 0x03, 0xCC, 0xCC],
    ];
    for payload in payloads {
        let adv = Event::AdvertisementReport {
            address: peer(1),
            payload,
        };
        orc.on_event(&mut stack, adv).unwrap();
    }
    assert_eq!(stack.opens(), 0);
}

#[test]
fn one_connection_attempt_at_a_time() {
    let (mut orc, mut stack) = booted::<2>(TestConfig::default());
    for n in 0..3 {
        let adv = Event::AdvertisementReport {
            address: peer(n),
            payload: &MATCHING_ADV,
        };
        orc.on_event(&mut stack, adv).unwrap();
    }
    assert_eq!(stack.opens(), 1);

    orc.on_event(
        &mut stack,
        Event::ConnectionOpened {
            handle: ConnHandle(1),
        },
    )
    .unwrap();
    connect(&mut orc, &mut stack, 5, 2);
    assert_eq!(stack.opens(), 2);
    assert_eq!(orc.table().active_count(), 2);
}

#[test]
fn full_table_stops_connection_attempts() {
    let (mut orc, mut stack) = booted::<2>(TestConfig::default());
    connect(&mut orc, &mut stack, 1, 1);
    connect(&mut orc, &mut stack, 2, 2);
    assert!(orc.table().is_full());

    let adv = Event::AdvertisementReport {
        address: peer(3),
        payload: &MATCHING_ADV,
    };
    orc.on_event(&mut stack, adv).unwrap();
    assert_eq!(stack.opens(), 2);
}

#[test]
fn failed_attempt_allows_a_new_one() {
    let (mut orc, mut stack) = booted::<2>(TestConfig::default());
    let adv = Event::AdvertisementReport {
        address: peer(1),
        payload: &MATCHING_ADV,
    };
    orc.on_event(&mut stack, adv).unwrap();
    orc.on_event(&mut stack, Event::ConnectFailed).unwrap();
    assert!(!orc.is_connecting());
    orc.on_event(&mut stack, adv).unwrap();
    assert_eq!(stack.opens(), 2);
}

#[test]
fn stray_close_keeps_attempt_outstanding() {
    let (mut orc, mut stack) = booted::<2>(TestConfig::default());
    connect(&mut orc, &mut stack, 1, 1);
    close(&mut orc, &mut stack, 1);

    let adv = Event::AdvertisementReport {
        address: peer(2),
        payload: &MATCHING_ADV,
    };
    orc.on_event(&mut stack, adv).unwrap();
    assert!(orc.is_connecting());

    // Repeated close for the link that is already gone.
    close(&mut orc, &mut stack, 1);
    assert!(orc.is_connecting());
    orc.on_event(&mut stack, adv).unwrap();
    assert_eq!(stack.opens(), 2);
}

#[test]
fn scan_window_closing_mid_attempt_waits_for_failure() {
    let (mut orc, mut stack) = booted::<2>(TestConfig::default());
    let adv = Event::AdvertisementReport {
        address: peer(1),
        payload: &MATCHING_ADV,
    };
    orc.on_event(&mut stack, adv).unwrap();
    orc.on_event(&mut stack, Event::ScanTimeout).unwrap();
    assert_eq!(orc.state(), State::AwaitingStart);
    assert_eq!(stack.calls.last(), Some(&Call::StopScan));
    assert!(orc.is_connecting());

    // The cancelled attempt reports back as a failure.
    orc.on_event(&mut stack, Event::ConnectFailed).unwrap();
    assert!(!orc.is_connecting());
    assert_eq!(orc.state(), State::AwaitingStart);
    assert!(orc.table().is_empty());
}

#[test]
fn close_during_scan_restarts_scanner() {
    let (mut orc, mut stack) = booted::<2>(TestConfig::default());
    connect(&mut orc, &mut stack, 1, 1);
    close(&mut orc, &mut stack, 1);
    assert_eq!(stack.count(&Call::StartScan), 2);
    assert_eq!(orc.state(), State::Scanning);
    assert!(orc.table().is_empty());
}

#[test]
fn scanner_already_running_is_not_fatal() {
    let mut orc: Orchestrator<2> = Orchestrator::default();
    let mut stack = MockStack {
        start_scan_status: Some(StackError::InvalidState),
        ..MockStack::default()
    };
    assert_eq!(orc.on_ready(&mut stack), Ok(()));
    assert_eq!(orc.state(), State::Scanning);
}

#[test]
fn rejected_scan_start_is_fatal() {
    let mut orc: Orchestrator<2> = Orchestrator::default();
    let mut stack = MockStack {
        start_scan_status: Some(StackError::Raw(0x0181)),
        ..MockStack::default()
    };
    let err = orc.on_ready(&mut stack).unwrap_err();
    assert_eq!(
        err,
        Error::Stack {
            op: StackOp::StartScan,
            status: StackError::Raw(0x0181)
        }
    );
    assert_eq!(err.status_code(), 0x0181);
}

#[test]
fn scan_timeout_stops_scanner_and_waits_for_start() {
    let (mut orc, mut stack) = booted::<2>(TestConfig::default());
    orc.on_event(&mut stack, Event::ScanTimeout).unwrap();
    assert_eq!(orc.state(), State::AwaitingStart);
    assert_eq!(stack.calls.last(), Some(&Call::StopScan));

    // Late advertisements are no longer acted on.
    let adv = Event::AdvertisementReport {
        address: peer(1),
        payload: &MATCHING_ADV,
    };
    orc.on_event(&mut stack, adv).unwrap();
    assert_eq!(stack.opens(), 0);
}

#[test]
fn start_trigger_ignored_while_scanning() {
    let (mut orc, mut stack) = booted::<2>(TestConfig::default());
    connect(&mut orc, &mut stack, 1, 1);
    orc.on_event(&mut stack, Event::StartTrigger).unwrap();
    assert_eq!(orc.state(), State::Scanning);
    assert!(stack.writes().is_empty());
}

// ═══════════════════════════════════════════════════════════════════════════
// Write sweep
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn start_writes_payload_to_slot_zero() {
    let (orc, stack) = started::<2>(&[10, 11], TestConfig::default());
    assert_eq!(orc.state(), State::AwaitingResponse);
    assert_eq!(orc.run().current_index, 0);
    assert_eq!(
        stack.calls.last(),
        Some(&Call::Write(ConnHandle(10), 17, [3, 0, 0, 0, 0].to_vec()))
    );
}

#[test]
fn round_robin_visits_slots_in_order_then_restarts() {
    let (mut orc, mut stack) = started::<2>(&[10, 11], TestConfig::default());
    respond(&mut orc, &mut stack, 10);
    respond(&mut orc, &mut stack, 11);
    respond(&mut orc, &mut stack, 10);
    respond(&mut orc, &mut stack, 11);
    assert_eq!(stack.writes(), [10, 11, 10, 11, 10]);
    assert_eq!(orc.run().sweeps, 2);
}

#[test]
fn round_robin_with_partially_filled_table() {
    // Three slots, two peers: trailing empty slot is skipped.
    let (mut orc, mut stack) = started::<3>(&[10, 11], TestConfig::default());
    respond(&mut orc, &mut stack, 10);
    respond(&mut orc, &mut stack, 11);
    respond(&mut orc, &mut stack, 10);
    assert_eq!(stack.writes(), [10, 11, 10, 11]);
    assert_eq!(orc.run().current_index, 1);
}

#[test]
fn response_count_resets_each_sweep() {
    let (mut orc, mut stack) = started::<2>(&[10, 11], TestConfig::default());
    respond(&mut orc, &mut stack, 10);
    assert_eq!(orc.run().response_count, 1);
    respond(&mut orc, &mut stack, 11);
    // New sweep already issued its first write.
    assert_eq!(orc.run().response_count, 0);
    assert_eq!(orc.run().current_index, 0);
}

#[test]
fn response_from_other_peer_is_ignored() {
    let (mut orc, mut stack) = started::<2>(&[10, 11], TestConfig::default());
    respond(&mut orc, &mut stack, 11);
    assert_eq!(orc.state(), State::AwaitingResponse);
    assert_eq!(stack.writes(), [10]);
    assert_eq!(orc.stats().count, 0);
}

#[test]
fn latency_is_reported_per_response() {
    let (mut orc, mut stack) = started::<2>(&[10, 11], TestConfig::default());
    // Write for slot 0 was armed at tick 0.
    stack.now = 6_554; // ~200 ms at 32768 Hz
    let report = orc
        .on_event(
            &mut stack,
            Event::AttributeValue {
                handle: ConnHandle(10),
                payload: &[3],
            },
        )
        .unwrap()
        .expect("expected latency report");
    assert_eq!(report.slot, 0);
    assert_eq!(report.handle, ConnHandle(10));
    assert_eq!(report.sample.start_tick, 0);
    assert_eq!(report.sample.end_tick, 6_554);
    assert_eq!(report.sample.elapsed_ms, 200);

    // Slot 1 write was armed at 6_554.
    stack.now = 6_554 + 3_277;
    respond(&mut orc, &mut stack, 11);
    let stats = orc.stats();
    assert_eq!(stats.count, 2);
    assert_eq!(stats.min_ms, 100);
    assert_eq!(stats.max_ms, 200);
}

#[test]
fn slot_closed_mid_sweep_is_skipped() {
    let (mut orc, mut stack) = started::<2>(&[10, 11], TestConfig::default());
    assert_eq!(orc.state(), State::AwaitingResponse);

    // Slot 1 drops while waiting on slot 0.
    close(&mut orc, &mut stack, 11);
    assert_eq!(orc.state(), State::AwaitingResponse);

    respond(&mut orc, &mut stack, 10);
    assert_eq!(stack.writes(), [10, 10]);
    assert_eq!(orc.run().current_index, 0);
    assert_eq!(orc.run().sweeps, 1);
    assert_eq!(orc.stats().count, 1);
}

#[test]
fn empty_leading_slot_is_skipped() {
    let (mut orc, mut stack) = booted::<2>(TestConfig::default());
    connect(&mut orc, &mut stack, 1, 10);
    connect(&mut orc, &mut stack, 2, 11);
    close(&mut orc, &mut stack, 10);
    orc.on_event(&mut stack, Event::ScanTimeout).unwrap();
    orc.on_event(&mut stack, Event::StartTrigger).unwrap();

    assert_eq!(stack.writes(), [11]);
    assert_eq!(orc.run().current_index, 1);
    respond(&mut orc, &mut stack, 11);
    assert_eq!(stack.writes(), [11, 11]);
}

#[test]
fn empty_table_waits_until_a_peer_appears() {
    let (mut orc, mut stack) = started::<2>(&[], TestConfig::default());
    assert_eq!(orc.state(), State::PreparingWrite);
    orc.on_tick(&mut stack).unwrap();
    assert_eq!(orc.state(), State::PreparingWrite);
    assert!(stack.writes().is_empty());

    // A late connection completes; the next tick starts the sweep.
    orc.on_event(
        &mut stack,
        Event::ConnectionOpened {
            handle: ConnHandle(4),
        },
    )
    .unwrap();
    orc.on_tick(&mut stack).unwrap();
    assert_eq!(stack.writes(), [4]);
    assert_eq!(orc.state(), State::AwaitingResponse);
}

#[test]
fn missing_response_stalls_the_sweep() {
    let (mut orc, mut stack) = started::<2>(&[10, 11], TestConfig::default());
    for _ in 0..10 {
        orc.on_tick(&mut stack).unwrap();
    }
    assert_eq!(orc.state(), State::AwaitingResponse);
    assert_eq!(stack.writes(), [10]);
}

#[test]
fn awaited_peer_closing_leaves_sweep_waiting() {
    let (mut orc, mut stack) = started::<2>(&[10, 11], TestConfig::default());
    close(&mut orc, &mut stack, 10);
    orc.on_tick(&mut stack).unwrap();
    assert_eq!(orc.state(), State::AwaitingResponse);
    assert_eq!(orc.table().active_count(), 1);
}

#[test]
fn duplicate_close_is_benign() {
    let (mut orc, mut stack) = started::<2>(&[10, 11], TestConfig::default());
    close(&mut orc, &mut stack, 11);
    close(&mut orc, &mut stack, 11);
    close(&mut orc, &mut stack, 99);
    assert_eq!(orc.table().active_count(), 1);
    assert_eq!(orc.state(), State::AwaitingResponse);
}

#[test]
fn rejected_write_is_fatal() {
    let (mut orc, mut stack) = booted::<2>(TestConfig::default());
    connect(&mut orc, &mut stack, 1, 10);
    orc.on_event(&mut stack, Event::ScanTimeout).unwrap();
    stack.write_status = Some(StackError::Busy);
    let err = orc.on_event(&mut stack, Event::StartTrigger).unwrap_err();
    assert_eq!(err, StackError::Busy.during(StackOp::WriteWithoutResponse));
}

// ═══════════════════════════════════════════════════════════════════════════
// Conclusion
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn stop_concludes_and_freezes() {
    let (mut orc, mut stack) = started::<2>(&[10, 11], TestConfig::default());
    orc.on_event(&mut stack, Event::Stop).unwrap();
    assert_eq!(orc.state(), State::Concluded);

    respond(&mut orc, &mut stack, 10);
    orc.on_tick(&mut stack).unwrap();
    orc.on_event(&mut stack, Event::StartTrigger).unwrap();
    assert_eq!(orc.state(), State::Concluded);
    assert_eq!(stack.writes(), [10]);
}

#[test]
fn stop_while_scanning_stops_scanner() {
    let (mut orc, mut stack) = booted::<2>(TestConfig::default());
    orc.on_event(&mut stack, Event::Stop).unwrap();
    assert_eq!(orc.state(), State::Concluded);
    assert_eq!(stack.calls.last(), Some(&Call::StopScan));
}

#[test]
fn stop_before_boot_is_ignored() {
    let mut orc: Orchestrator<2> = Orchestrator::default();
    let mut stack = MockStack::default();
    orc.on_event(&mut stack, Event::Stop).unwrap();
    assert_eq!(orc.state(), State::Init);
}

#[test]
fn max_sweeps_concludes_run() {
    let config = TestConfig {
        max_sweeps: Some(2),
        ..TestConfig::default()
    };
    let (mut orc, mut stack) = started::<2>(&[10, 11], config);
    for h in [10, 11, 10, 11] {
        respond(&mut orc, &mut stack, h);
    }
    assert_eq!(orc.state(), State::Concluded);
    assert_eq!(orc.run().sweeps, 2);
    assert_eq!(stack.writes(), [10, 11, 10, 11]);
    assert_eq!(orc.stats().count, 4);
}
