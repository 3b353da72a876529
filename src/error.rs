//! Error taxonomy shared by every layer of the core (see spec §7).
//!
//! Transport and hardware errors propagate out of the compound operation
//! that raised them (arm / acquire / download). Parse and decode errors are
//! recovered locally by the caller that iterates pods/ROMs/samples — they
//! are constructed here but a caller may choose to log-and-continue instead
//! of returning them.

use std::net::IpAddr;

#[derive(Debug, thiserror::Error)]
pub enum SumpError {
    #[error("transport unavailable: host={host} resolved={resolved:?}: {message}")]
    TransportUnavailable {
        host: String,
        resolved: Option<IpAddr>,
        message: String,
    },

    #[error("transport authentication failed: {message}")]
    TransportAuth { message: String },

    #[error("transport timed out waiting for {operation}")]
    TransportTimeout { operation: String },

    #[error("hardware missing: expected hw_id 0x53, got {got:#04x}")]
    HardwareMissing { got: u8 },

    #[error("hardware stuck in state {state:?} for longer than {timeout_ms}ms")]
    HardwareStuck {
        state: crate::driver::CaptureState,
        timeout_ms: u64,
    },

    #[error("config parse error at {context}: {message}")]
    ConfigParse { context: String, message: String },

    #[error("sample decode error for pod ({hub},{pod}): {message}")]
    SampleDecode {
        hub: u8,
        pod: u8,
        message: String,
    },

    #[error("view conflict: removed views {removed:?}")]
    ViewConflict { removed: Vec<String> },

    #[error("user-control invalid for signal {signal}: required {required:#x} masked {mask:#x}, captured {captured:#x}")]
    UserCtrlInvalid {
        signal: String,
        required: u32,
        mask: u32,
        captured: u32,
    },
}

pub type SumpResult<T> = Result<T, SumpError>;
