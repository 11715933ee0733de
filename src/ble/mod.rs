//! Bluetooth Low Energy vocabulary shared by the core and the radio runtime.
//!
//! 1. **Advertisement filter** - decides whether a peripheral advertises the
//!    test service.
//! 2. **Connection table** - fixed-capacity registry of open links.
//! 3. **Stack surface** - the narrow command/clock traits the orchestrator
//!    drives, plus the events the stack delivers back.

pub mod adv_filter;
pub mod conn_table;

use crate::error::StackError;

/// Monotonic tick count from the stack's timer.
pub type Tick = u64;

/// Connection handle assigned by the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnHandle(pub u16);

/// Peer address type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddressKind {
    Public,
    RandomStatic,
    RandomPrivateResolvable,
    RandomPrivateNonResolvable,
}

/// BLE device address (little-endian bytes, as on air).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Address {
    pub kind: AddressKind,
    pub bytes: [u8; 6],
}

impl Address {
    pub const fn public(bytes: [u8; 6]) -> Self {
        Self {
            kind: AddressKind::Public,
            bytes,
        }
    }
}

/// Events delivered by the stack, timer and start trigger, in order.
///
/// Payloads are borrowed: the event loop owns the buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event<'a> {
    /// Radio stack booted; no command may be issued before this.
    Ready,
    /// A legacy advertisement report.
    AdvertisementReport { address: Address, payload: &'a [u8] },
    /// A connection attempt completed.
    ConnectionOpened { handle: ConnHandle },
    /// A connection attempt failed before a handle was assigned.
    ConnectFailed,
    /// A link was closed (by either side or by supervision timeout).
    ConnectionClosed { handle: ConnHandle },
    /// A peer wrote to our attribute - the response to a test write.
    AttributeValue { handle: ConnHandle, payload: &'a [u8] },
    /// The one-shot discovery timer expired.
    ScanTimeout,
    /// External start signal (button).
    StartTrigger,
    /// Explicit stop request.
    Stop,
    /// Re-evaluate pending immediate transitions.
    Continue,
}

/// Command surface of the BLE stack.
///
/// Every call either is accepted immediately or fails; effects arrive later
/// as [`Event`]s.
pub trait Stack {
    /// Default connection parameters for links opened from now on.
    fn set_connection_interval(&mut self, interval_ms: u32) -> Result<(), StackError>;

    fn start_scan(&mut self) -> Result<(), StackError>;

    fn stop_scan(&mut self) -> Result<(), StackError>;

    /// Begin connecting to `address`. The handle arrives with
    /// [`Event::ConnectionOpened`].
    fn open_connection(&mut self, address: &Address) -> Result<(), StackError>;

    /// Fire-and-forget characteristic write.
    fn write_without_response(
        &mut self,
        handle: ConnHandle,
        attribute: u16,
        payload: &[u8],
    ) -> Result<(), StackError>;

    /// Arm the one-shot timer that delivers [`Event::ScanTimeout`].
    fn arm_scan_timer(&mut self, duration_ms: u32) -> Result<(), StackError>;
}

/// Monotonic tick source.
pub trait Clock {
    fn now(&self) -> Tick;

    fn ticks_to_ms(&self, ticks: u64) -> u32;
}
