//! Unified error type for ble-latency.
//!
//! We avoid `alloc` - all error variants carry only fixed-size data.
//! Implements `defmt::Format` for efficient on-target logging.

/// Top-level error type used across the application.
///
/// Every variant is fatal to a test run: the runtime reports it and halts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The BLE stack rejected a command.
    Stack { op: StackOp, status: StackError },
}

/// Status returned by a rejected capability call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StackError {
    /// The stack is not in a state that accepts the command
    /// (e.g. scanner already running).
    InvalidState,
    /// Command queue full.
    Busy,
    /// Raw vendor status code.
    Raw(u32),
}

/// Capability call that produced a [`StackError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StackOp {
    SetConnectionParameters,
    StartScan,
    StopScan,
    OpenConnection,
    WriteWithoutResponse,
    ArmScanTimer,
}

impl Error {
    pub const fn stack(op: StackOp, status: StackError) -> Self {
        Error::Stack { op, status }
    }

    /// Vendor status code, for the diagnostic line printed before halting.
    pub const fn status_code(&self) -> u32 {
        match self {
            Error::Stack { status, .. } => match status {
                StackError::InvalidState => 0x0002,
                StackError::Busy => 0x0004,
                StackError::Raw(code) => *code,
            },
        }
    }
}

impl StackError {
    /// Attach the failing operation.
    pub const fn during(self, op: StackOp) -> Error {
        Error::stack(op, self)
    }
}

// Convenience conversions

impl From<(StackOp, StackError)> for Error {
    fn from((op, status): (StackOp, StackError)) -> Self {
        Error::Stack { op, status }
    }
}
