//! Connection/test orchestration state machine.
//!
//! The orchestrator owns every piece of mutable test state: the connection
//! table, the sweep position, the live latency measurement. The stack's event
//! loop feeds it one event at a time through [`StackHandler`].
//!
//! Each event is turned into a [`Step`] by [`Orchestrator::step`], which only
//! touches orchestrator state and lists the side effects to perform. Steps
//! that land in an immediate state ask for a follow-up; [`Orchestrator::dispatch`]
//! feeds them a [`Event::Continue`] before returning, so immediate transitions
//! never wait for the next process tick.
//!
//! ```text
//! Init ──ready──▶ Scanning ──scan timeout──▶ ScanStopped ──▶ AwaitingStart
//!                                                               │ start
//!                     ┌──────────── sweep complete ───────┐     ▼
//!                     ▼                                   │  PreparingWrite
//!               PreparingWrite ──▶ Writing ──write──▶ AwaitingResponse
//!                                   ▲  │ empty slot          │ response
//!                                   └──┘                     ▼
//!                                   ◀──── more slots ── ResponseReceived
//! ```

#[cfg(test)]
mod tests;

use heapless::Vec;

use crate::ble::adv_filter::AdvertisementFilter;
use crate::ble::conn_table::ConnectionTable;
use crate::ble::{Address, Clock, ConnHandle, Event, Stack};
use crate::config::TestConfig;
use crate::error::{Error, StackError, StackOp};
use crate::latency::{LatencySample, LatencyStats, LatencyTracker};
use crate::log::{debug, error, info, warn};

/// Orchestrator states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    /// Waiting for the radio to boot.
    Init,
    /// Discovery window open; matching peripherals get connected.
    Scanning,
    /// Discovery window closed; the scanner is stopped on the next step.
    ScanStopped,
    /// Idle until the start trigger.
    AwaitingStart,
    /// About to start a sweep from slot 0.
    PreparingWrite,
    /// Writing to the slot at `current_index`, skipping empty slots.
    Writing,
    /// Write issued; waiting for the peer's attribute write.
    AwaitingResponse,
    /// Response measured; pick the next slot or restart the sweep.
    ResponseReceived,
    /// Terminal.
    Concluded,
}

/// Side effect requested by a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Effect {
    SetConnectionInterval { interval_ms: u32 },
    StartScan,
    StopScan,
    ArmScanTimer { duration_ms: u32 },
    OpenConnection(Address),
    /// Arm the latency tracker, then write the test payload.
    Write { slot: usize, handle: ConnHandle },
    /// Close the live latency measurement.
    Measure { slot: usize, handle: ConnHandle },
    /// Report the run summary.
    Conclude,
}

const MAX_EFFECTS: usize = 4;

/// Output of a single transition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Step {
    pub effects: Vec<Effect, MAX_EFFECTS>,
    /// Feed [`Event::Continue`] before the next external event.
    pub follow_up: bool,
}

impl Step {
    fn emit(&mut self, effect: Effect) {
        // No transition emits more than MAX_EFFECTS effects.
        let pushed = self.effects.push(effect);
        debug_assert!(pushed.is_ok());
    }
}

/// Position of the current write sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TestRun {
    /// Slot targeted by the next (or in-flight) write.
    pub current_index: usize,
    /// Responses received in the current sweep.
    pub response_count: u32,
    /// Completed sweeps.
    pub sweeps: u32,
}

/// A latency sample attributed to the slot it was measured on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LatencyReport {
    pub slot: usize,
    pub handle: ConnHandle,
    pub sample: LatencySample,
}

/// Host-runtime integration points.
///
/// The stack's event loop calls `on_ready` once after boot, `on_event` for
/// every delivered event in order, and `on_tick` periodically.
pub trait StackHandler<S> {
    fn on_ready(&mut self, stack: &mut S) -> Result<(), Error>;

    fn on_event(&mut self, stack: &mut S, event: Event<'_>)
        -> Result<Option<LatencyReport>, Error>;

    fn on_tick(&mut self, stack: &mut S) -> Result<(), Error>;
}

/// The test state machine over a table of `N` connections.
pub struct Orchestrator<const N: usize> {
    state: State,
    table: ConnectionTable<N>,
    run: TestRun,
    latency: LatencyTracker,
    filter: AdvertisementFilter,
    config: TestConfig,
    /// A connection attempt is outstanding.
    connecting: bool,
    /// Handle whose response we are waiting for.
    in_flight: Option<ConnHandle>,
}

impl<const N: usize> Orchestrator<N> {
    pub fn new(config: TestConfig) -> Self {
        Self {
            state: State::Init,
            table: ConnectionTable::new(),
            run: TestRun::default(),
            latency: LatencyTracker::new(),
            filter: AdvertisementFilter::new(config.target_uuid),
            config,
            connecting: false,
            in_flight: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn run(&self) -> &TestRun {
        &self.run
    }

    pub fn table(&self) -> &ConnectionTable<N> {
        &self.table
    }

    pub fn stats(&self) -> &LatencyStats {
        self.latency.stats()
    }

    pub fn config(&self) -> &TestConfig {
        &self.config
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting
    }

    /// Handle one event, then drain the immediate transitions it unlocks.
    ///
    /// A rejected stack command is fatal and is returned as is; the caller
    /// is expected to halt.
    pub fn dispatch<S>(
        &mut self,
        stack: &mut S,
        event: Event<'_>,
    ) -> Result<Option<LatencyReport>, Error>
    where
        S: Stack + Clock,
    {
        let mut report = None;
        let mut step = self.step(&event);
        loop {
            for effect in step.effects.iter().copied() {
                if let Some(r) = self.apply(stack, effect)? {
                    report = Some(r);
                }
            }
            if !step.follow_up {
                break;
            }
            step = self.step(&Event::Continue);
        }
        Ok(report)
    }

    /// Apply `event` to the state machine without touching the stack.
    pub fn step(&mut self, event: &Event<'_>) -> Step {
        let mut step = Step::default();

        match (self.state, *event) {
            (State::Init, Event::Ready) => self.boot(&mut step),
            (State::Init, _) => {}

            // Table bookkeeping happens in every state after boot.
            (_, Event::ConnectionOpened { handle }) => self.on_connection_opened(handle),
            (_, Event::ConnectFailed) => {
                warn!("Connection attempt failed");
                self.connecting = false;
            }
            (state, Event::ConnectionClosed { handle }) => {
                self.on_connection_closed(state, handle, &mut step)
            }

            (State::Concluded, _) => {}
            (_, Event::Stop) => self.conclude(&mut step),

            (State::Scanning, Event::ScanTimeout) => {
                self.state = State::ScanStopped;
                step.follow_up = true;
            }
            (State::Scanning, Event::AdvertisementReport { address, payload }) => {
                self.on_advertisement(address, payload, &mut step)
            }
            (State::ScanStopped, Event::Continue) => {
                info!("Scanning stopped - scanning period concluded");
                step.emit(Effect::StopScan);
                self.state = State::AwaitingStart;
            }
            (State::AwaitingStart, Event::StartTrigger) => {
                info!("Start trigger, starting the test");
                self.run.current_index = 0;
                self.state = State::PreparingWrite;
                step.follow_up = true;
            }
            (State::PreparingWrite, Event::Continue) => self.prepare_sweep(&mut step),
            (State::Writing, Event::Continue) => self.write_current(&mut step),
            (State::AwaitingResponse, Event::AttributeValue { handle, .. }) => {
                self.on_response(handle, &mut step)
            }
            (State::ResponseReceived, Event::Continue) => self.advance(&mut step),

            _ => {}
        }

        step
    }

    fn boot(&mut self, step: &mut Step) {
        self.table.reset();
        self.run = TestRun::default();
        self.connecting = false;
        self.in_flight = None;

        info!(
            "Radio ready: {} connections, {} ms scan window, {} ms interval",
            N, self.config.scan_duration_ms, self.config.conn_interval_ms
        );

        step.emit(Effect::SetConnectionInterval {
            interval_ms: self.config.conn_interval_ms,
        });
        step.emit(Effect::StartScan);
        step.emit(Effect::ArmScanTimer {
            duration_ms: self.config.scan_duration_ms,
        });
        self.state = State::Scanning;
    }

    fn on_advertisement(&mut self, address: Address, payload: &[u8], step: &mut Step) {
        // One attempt at a time, and never more links than free slots.
        if self.connecting || self.table.is_full() || !self.filter.matches(payload) {
            return;
        }
        info!("Device found: {}", address);
        self.connecting = true;
        step.emit(Effect::OpenConnection(address));
    }

    fn on_connection_opened(&mut self, handle: ConnHandle) {
        self.connecting = false;
        match self.table.insert(handle) {
            Ok(slot) => {
                info!(
                    "Connection opened: {} in slot {}, number of connections: {}",
                    handle,
                    slot,
                    self.table.active_count()
                );
                if self.table.is_full() {
                    info!("Max number of connections achieved - {} connections", N);
                }
            }
            Err(e) => {
                warn!("Connection {} not registered: {}", handle, e);
            }
        }
    }

    fn on_connection_closed(&mut self, state: State, handle: ConnHandle, step: &mut Step) {
        match self.table.remove(handle) {
            Ok(slot) => {
                info!(
                    "Connection closed: slot {}, number of connections: {}",
                    slot,
                    self.table.active_count()
                );
            }
            Err(_) => {
                // Duplicate notification. An outstanding attempt is only
                // cleared by its own open or connect-failed event.
                debug!("Close for unregistered connection {}", handle);
            }
        }

        if self.in_flight == Some(handle) {
            warn!("Peer {} closed with a write in flight", handle);
        }

        // Refill the freed slot while discovery is still open.
        if state == State::Scanning && !self.connecting {
            step.emit(Effect::StartScan);
        }
    }

    fn prepare_sweep(&mut self, step: &mut Step) {
        // Nothing to write to; re-evaluated on the next tick.
        if self.table.is_empty() {
            return;
        }
        self.run.current_index = 0;
        self.run.response_count = 0;
        debug!(
            "Sweep {} over {} connections",
            self.run.sweeps,
            self.table.active_count()
        );
        self.state = State::Writing;
        step.follow_up = true;
    }

    fn write_current(&mut self, step: &mut Step) {
        let slot = self.run.current_index;
        if slot >= N {
            self.finish_sweep(step);
            return;
        }

        match self.table.get(slot) {
            Some(handle) => {
                info!("Sending data to connection: {} (slot {})", handle, slot);
                step.emit(Effect::Write { slot, handle });
                self.in_flight = Some(handle);
                self.state = State::AwaitingResponse;
            }
            None => {
                self.run.current_index += 1;
                step.follow_up = true;
            }
        }
    }

    fn on_response(&mut self, handle: ConnHandle, step: &mut Step) {
        if self.in_flight != Some(handle) {
            debug!("Ignoring attribute value from {}", handle);
            return;
        }
        self.in_flight = None;
        self.run.response_count += 1;
        step.emit(Effect::Measure {
            slot: self.run.current_index,
            handle,
        });
        self.state = State::ResponseReceived;
        step.follow_up = true;
    }

    fn advance(&mut self, step: &mut Step) {
        if self.run.current_index + 1 < N {
            self.run.current_index += 1;
            self.state = State::Writing;
            step.follow_up = true;
        } else {
            self.finish_sweep(step);
        }
    }

    fn finish_sweep(&mut self, step: &mut Step) {
        self.run.sweeps += 1;
        debug!(
            "Sweep {} complete: {} responses",
            self.run.sweeps, self.run.response_count
        );

        if let Some(max) = self.config.max_sweeps {
            if self.run.sweeps >= max {
                self.conclude(step);
                return;
            }
        }

        self.state = State::PreparingWrite;
        step.follow_up = true;
    }

    fn conclude(&mut self, step: &mut Step) {
        if self.state == State::Scanning {
            step.emit(Effect::StopScan);
        }
        self.in_flight = None;
        self.state = State::Concluded;
        step.emit(Effect::Conclude);
    }

    fn apply<S>(&mut self, stack: &mut S, effect: Effect) -> Result<Option<LatencyReport>, Error>
    where
        S: Stack + Clock,
    {
        match effect {
            Effect::SetConnectionInterval { interval_ms } => {
                command(
                    StackOp::SetConnectionParameters,
                    stack.set_connection_interval(interval_ms),
                )?;
                info!("Connection interval set to {} msec", interval_ms);
            }
            Effect::StartScan => {
                command(StackOp::StartScan, idempotent(stack.start_scan()))?;
                info!("Scanning started");
            }
            Effect::StopScan => command(StackOp::StopScan, idempotent(stack.stop_scan()))?,
            Effect::ArmScanTimer { duration_ms } => {
                command(StackOp::ArmScanTimer, stack.arm_scan_timer(duration_ms))?
            }
            Effect::OpenConnection(address) => {
                command(StackOp::OpenConnection, stack.open_connection(&address))?
            }
            Effect::Write { handle, .. } => {
                self.latency.arm(stack.now());
                command(
                    StackOp::WriteWithoutResponse,
                    stack.write_without_response(
                        handle,
                        self.config.attribute,
                        &self.config.payload,
                    ),
                )?;
            }
            Effect::Measure { slot, handle } => {
                let now = stack.now();
                if let Some(sample) = self.latency.resolve(now, |ticks| stack.ticks_to_ms(ticks)) {
                    info!("Latency: {} msec (slot {})", sample.elapsed_ms, slot);
                    return Ok(Some(LatencyReport {
                        slot,
                        handle,
                        sample,
                    }));
                }
            }
            Effect::Conclude => {
                let stats = self.latency.stats();
                info!(
                    "Test concluded after {} sweeps: {} samples, min {} ms, max {} ms, mean {} ms",
                    self.run.sweeps,
                    stats.count,
                    stats.min_ms,
                    stats.max_ms,
                    stats.mean_ms().unwrap_or(0)
                );
            }
        }
        Ok(None)
    }
}

impl<const N: usize> Default for Orchestrator<N> {
    fn default() -> Self {
        Self::new(TestConfig::default())
    }
}

impl<S, const N: usize> StackHandler<S> for Orchestrator<N>
where
    S: Stack + Clock,
{
    fn on_ready(&mut self, stack: &mut S) -> Result<(), Error> {
        self.dispatch(stack, Event::Ready).map(|_| ())
    }

    fn on_event(
        &mut self,
        stack: &mut S,
        event: Event<'_>,
    ) -> Result<Option<LatencyReport>, Error> {
        self.dispatch(stack, event)
    }

    fn on_tick(&mut self, stack: &mut S) -> Result<(), Error> {
        self.dispatch(stack, Event::Continue).map(|_| ())
    }
}

/// "Already running" / "already stopped" counts as success for the scanner.
fn idempotent(result: Result<(), StackError>) -> Result<(), StackError> {
    match result {
        Err(StackError::InvalidState) => {
            debug!("Scanner already in requested state");
            Ok(())
        }
        other => other,
    }
}

fn command(op: StackOp, result: Result<(), StackError>) -> Result<(), Error> {
    result.map_err(|status| {
        error!("{} failed with status {}", op, status);
        status.during(op)
    })
}
