//! UDS (ISO 14229) client layer
//!
//! One client per ISO-TP endpoint: a FIFO of requests, one outstanding at
//! a time, with P2/P2* response timing, negative-response classification,
//! session and security-access state, and a tester-present keepalive.

pub mod client;
pub mod nrc;
pub mod session;

pub use client::{UdsClient, UdsEvent, UdsRequest, UdsResponse};
pub use nrc::NegativeResponseCode;
pub use session::UdsSession;

/// Service IDs used by the client.
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const CLEAR_DIAGNOSTIC_INFO: u8 = 0x14;
    pub const READ_DTC_INFO: u8 = 0x19;
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const WRITE_DATA_BY_ID: u8 = 0x2E;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;

    /// Positive responses echo the request SID plus this offset.
    pub const POSITIVE_OFFSET: u8 = 0x40;
}

/// Diagnostic session sub-functions (0x10).
pub mod session_type {
    pub const DEFAULT: u8 = 0x01;
    pub const PROGRAMMING: u8 = 0x02;
    pub const EXTENDED: u8 = 0x03;
}

/// RoutineControl (0x31) sub-functions.
pub mod routine_sub_function {
    pub const START: u8 = 0x01;
    pub const STOP: u8 = 0x02;
    pub const REQUEST_RESULTS: u8 = 0x03;
}

/// TesterPresent (0x3E) sub-function with suppressPosRspMsgIndication set.
pub const TESTER_PRESENT_SUPPRESS: u8 = 0x80;
