//! SoftDevice S140 binding for the orchestrator.
//!
//! The radio side is split across embassy tasks that talk over channels:
//!
//! 1. **Central** - scanning and connection initiation ([`central`]).
//! 2. **Links** - one task per connection slot; runs the local GATT server
//!    that receives the peer's response ([`link`]).
//! 3. **Scan timer** - one-shot discovery window ([`scan_timer_task`]).
//!
//! Everything they observe is queued on [`EVENTS`] as an owned
//! [`StackEvent`]. The orchestrator task drains that queue and talks back
//! through [`SoftdeviceStack`], whose commands never block.

pub mod central;
pub mod link;

use ble_latency::config::{ADV_PAYLOAD_MAX, ATT_VALUE_MAX, EVENT_QUEUE_DEPTH, MAX_CONNECTIONS};
use ble_latency::{Address, AddressKind, Clock, ConnHandle, Event, Stack, StackError, Tick};
use defmt::{debug, warn};
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver, Sender};
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer};
use heapless::Vec;
use nrf_softdevice::ble::gatt_client::{self, TryWriteError};
use nrf_softdevice::ble::{self, Connection};
use nrf_softdevice::raw;

use self::central::CentralCommand;

/// Depth of the orchestrator → central command queue.
pub const CENTRAL_QUEUE_DEPTH: usize = 4;

/// Stack → orchestrator event queue.
pub static EVENTS: Channel<CriticalSectionRawMutex, StackEvent, EVENT_QUEUE_DEPTH> = Channel::new();

/// Orchestrator → central task commands.
pub static CENTRAL_COMMANDS: Channel<CriticalSectionRawMutex, CentralCommand, CENTRAL_QUEUE_DEPTH> =
    Channel::new();

/// Freshly opened connections, picked up by whichever link task is idle.
pub static NEW_LINKS: Channel<CriticalSectionRawMutex, Connection, MAX_CONNECTIONS> =
    Channel::new();

/// Arms the scan timer with a duration in milliseconds.
pub static SCAN_TIMER: Signal<CriticalSectionRawMutex, u32> = Signal::new();

pub type EventSender = Sender<'static, CriticalSectionRawMutex, StackEvent, EVENT_QUEUE_DEPTH>;
pub type LinkSender = Sender<'static, CriticalSectionRawMutex, Connection, MAX_CONNECTIONS>;
pub type LinkReceiver = Receiver<'static, CriticalSectionRawMutex, Connection, MAX_CONNECTIONS>;

/// Owned counterpart of [`Event`], queued between tasks.
pub enum StackEvent {
    Advertisement {
        address: Address,
        payload: Vec<u8, ADV_PAYLOAD_MAX>,
    },
    Opened {
        handle: ConnHandle,
        conn: Connection,
    },
    ConnectFailed,
    Closed(ConnHandle),
    AttributeValue {
        handle: ConnHandle,
        value: Vec<u8, ATT_VALUE_MAX>,
    },
    ScanTimeout,
    StartTrigger,
}

impl StackEvent {
    /// Borrow as the orchestrator's event type.
    pub fn as_event(&self) -> Event<'_> {
        match self {
            StackEvent::Advertisement { address, payload } => Event::AdvertisementReport {
                address: *address,
                payload,
            },
            StackEvent::Opened { handle, .. } => Event::ConnectionOpened { handle: *handle },
            StackEvent::ConnectFailed => Event::ConnectFailed,
            StackEvent::Closed(handle) => Event::ConnectionClosed { handle: *handle },
            StackEvent::AttributeValue { handle, value } => Event::AttributeValue {
                handle: *handle,
                payload: value,
            },
            StackEvent::ScanTimeout => Event::ScanTimeout,
            StackEvent::StartTrigger => Event::StartTrigger,
        }
    }
}

/// Queue an event from a synchronous callback. Drops it when the queue is full.
pub fn post(events: &EventSender, event: StackEvent) {
    if events.try_send(event).is_err() {
        warn!("Event queue full, event dropped");
    }
}

pub fn to_address(addr: &ble::Address) -> Address {
    let kind = match addr.address_type() {
        ble::AddressType::Public => AddressKind::Public,
        ble::AddressType::RandomStatic => AddressKind::RandomStatic,
        ble::AddressType::RandomPrivateResolvable => AddressKind::RandomPrivateResolvable,
        _ => AddressKind::RandomPrivateNonResolvable,
    };
    Address {
        kind,
        bytes: addr.bytes(),
    }
}

pub fn to_sd_address(addr: &Address) -> ble::Address {
    let kind = match addr.kind {
        AddressKind::Public => ble::AddressType::Public,
        AddressKind::RandomStatic => ble::AddressType::RandomStatic,
        AddressKind::RandomPrivateResolvable => ble::AddressType::RandomPrivateResolvable,
        AddressKind::RandomPrivateNonResolvable => ble::AddressType::RandomPrivateNonResolvable,
    };
    ble::Address::new(kind, addr.bytes)
}

/// [`Stack`] + [`Clock`] over the radio tasks.
///
/// Owned by the orchestrator task. Keeps a clone of every open
/// [`Connection`] so writes can be issued without a round trip through the
/// link tasks.
pub struct SoftdeviceStack {
    central: Sender<'static, CriticalSectionRawMutex, CentralCommand, CENTRAL_QUEUE_DEPTH>,
    links: Vec<(ConnHandle, Connection), MAX_CONNECTIONS>,
}

impl SoftdeviceStack {
    pub fn new() -> Self {
        Self {
            central: CENTRAL_COMMANDS.sender(),
            links: Vec::new(),
        }
    }

    /// Track a connection reported by a link task.
    pub fn attach(&mut self, handle: ConnHandle, conn: Connection) {
        if self.links.push((handle, conn)).is_err() {
            warn!("No room to track connection {}", handle);
        }
    }

    pub fn detach(&mut self, handle: ConnHandle) {
        self.links.retain(|(h, _)| *h != handle);
    }

    fn command(&self, cmd: CentralCommand) -> Result<(), StackError> {
        self.central.try_send(cmd).map_err(|_| StackError::Busy)
    }
}

impl Stack for SoftdeviceStack {
    fn set_connection_interval(&mut self, interval_ms: u32) -> Result<(), StackError> {
        self.command(CentralCommand::SetInterval(interval_ms))
    }

    fn start_scan(&mut self) -> Result<(), StackError> {
        self.command(CentralCommand::StartScan)
    }

    fn stop_scan(&mut self) -> Result<(), StackError> {
        self.command(CentralCommand::StopScan)
    }

    fn open_connection(&mut self, address: &Address) -> Result<(), StackError> {
        self.command(CentralCommand::Connect(*address))
    }

    fn write_without_response(
        &mut self,
        handle: ConnHandle,
        attribute: u16,
        payload: &[u8],
    ) -> Result<(), StackError> {
        let Some((_, conn)) = self.links.iter().find(|(h, _)| *h == handle) else {
            return Err(StackError::InvalidState);
        };
        match gatt_client::try_write_without_response(conn, attribute, payload) {
            Ok(()) => Ok(()),
            Err(TryWriteError::BufferFull) => Err(StackError::Busy),
            // Lost the race with the disconnect; the close event follows.
            Err(TryWriteError::Disconnected) => {
                warn!("Write to {} raced a disconnect", handle);
                Ok(())
            }
            Err(_) => Err(StackError::Raw(raw::NRF_ERROR_INTERNAL)),
        }
    }

    fn arm_scan_timer(&mut self, duration_ms: u32) -> Result<(), StackError> {
        SCAN_TIMER.signal(duration_ms);
        Ok(())
    }
}

impl Clock for SoftdeviceStack {
    fn now(&self) -> Tick {
        Instant::now().as_ticks()
    }

    fn ticks_to_ms(&self, ticks: u64) -> u32 {
        Duration::from_ticks(ticks).as_millis() as u32
    }
}

/// One-shot discovery timer. Re-arming restarts the countdown.
#[embassy_executor::task]
pub async fn scan_timer_task(events: EventSender) -> ! {
    let mut duration_ms = SCAN_TIMER.wait().await;
    loop {
        debug!("Scan timer armed: {} ms", duration_ms);
        let deadline = Timer::after(Duration::from_millis(u64::from(duration_ms)));
        match select(deadline, SCAN_TIMER.wait()).await {
            Either::First(()) => {
                events.send(StackEvent::ScanTimeout).await;
                duration_ms = SCAN_TIMER.wait().await;
            }
            Either::Second(rearmed) => duration_ms = rearmed,
        }
    }
}
