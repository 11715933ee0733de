//! Application-wide constants and compile-time configuration.
//!
//! All timing parameters and protocol constants live here so they can be
//! tuned in one place.  [`TestConfig`] bundles the values the orchestrator
//! needs at runtime; its `Default` is built from these constants.

// BLE

/// 16-bit service UUID a peripheral must advertise to be tested,
/// little-endian as it appears on air (0xCCCC).
pub const TARGET_SERVICE_UUID: [u8; 2] = [0xCC, 0xCC];

/// Maximum simultaneous BLE connections (size of the connection table).
pub const MAX_CONNECTIONS: usize = 2;

/// Duration of the discovery window after boot (milliseconds).
pub const SCAN_DURATION_MS: u32 = 5_000;

/// Connection interval requested for every link (milliseconds).
pub const CONN_INTERVAL_MS: u32 = 40;

/// BLE slave latency (number of connection events the peripheral can skip).
pub const BLE_SLAVE_LATENCY: u16 = 0;

/// Link supervision timeout (milliseconds).
pub const SUP_TIMEOUT_MS: u32 = 1_600;

// Test payload

/// Length of the payload written to every peer.
pub const PAYLOAD_LENGTH: usize = 5;

/// Fixed payload identifying the test. First byte is the nonzero marker.
pub const TEST_PAYLOAD: [u8; PAYLOAD_LENGTH] = [3, 0, 0, 0, 0];

/// Attribute handle of the characteristic written on the peer.
pub const REMOTE_CHAR_HANDLE: u16 = 17;

// Runtime

/// Period of the process tick that re-evaluates pending transitions (ms).
pub const PROCESS_TICK_MS: u64 = 10;

/// Button debounce time (ms).
pub const BUTTON_DEBOUNCE_MS: u64 = 50;

/// Depth of the stack → orchestrator event queue.
pub const EVENT_QUEUE_DEPTH: usize = 16;

/// Largest legacy advertisement payload.
pub const ADV_PAYLOAD_MAX: usize = 31;

/// Largest attribute value forwarded with a response event.
pub const ATT_VALUE_MAX: usize = 20;

/// Convert milliseconds to BLE 1.25 ms connection-interval units.
pub const fn ms_to_conn_units(ms: u32) -> u16 {
    (ms * 4 / 5) as u16
}

/// Convert milliseconds to BLE 10 ms supervision-timeout units.
pub const fn ms_to_sup_timeout_units(ms: u32) -> u16 {
    (ms / 10) as u16
}

/// Parameters of a test run.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TestConfig {
    /// Service UUID the advertisement filter looks for.
    pub target_uuid: [u8; 2],
    /// Discovery window length.
    pub scan_duration_ms: u32,
    /// Connection interval pushed to the stack at boot.
    pub conn_interval_ms: u32,
    /// Remote characteristic written on every peer.
    pub attribute: u16,
    /// Bytes written on every peer.
    pub payload: [u8; PAYLOAD_LENGTH],
    /// Conclude after this many completed sweeps. `None` runs forever.
    pub max_sweeps: Option<u32>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            target_uuid: TARGET_SERVICE_UUID,
            scan_duration_ms: SCAN_DURATION_MS,
            conn_interval_ms: CONN_INTERVAL_MS,
            attribute: REMOTE_CHAR_HANDLE,
            payload: TEST_PAYLOAD,
            max_sweeps: None,
        }
    }
}
