//! UDS Negative Response Codes (ISO 14229-1 A.1)

use std::fmt;

/// Negative response code byte of a 0x7F response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegativeResponseCode {
    GeneralReject,
    ServiceNotSupported,
    SubFunctionNotSupported,
    IncorrectMessageLengthOrFormat,
    ResponseTooLong,
    BusyRepeatRequest,
    ConditionsNotCorrect,
    RequestSequenceError,
    RequestOutOfRange,
    SecurityAccessDenied,
    InvalidKey,
    ExceededNumberOfAttempts,
    RequiredTimeDelayNotExpired,
    UploadDownloadNotAccepted,
    GeneralProgrammingFailure,
    WrongBlockSequenceCounter,
    ResponsePending,
    SubFunctionNotSupportedInActiveSession,
    ServiceNotSupportedInActiveSession,
    Unknown(u8),
}

impl NegativeResponseCode {
    /// The raw NRC byte.
    pub fn code(&self) -> u8 {
        match self {
            Self::GeneralReject => 0x10,
            Self::ServiceNotSupported => 0x11,
            Self::SubFunctionNotSupported => 0x12,
            Self::IncorrectMessageLengthOrFormat => 0x13,
            Self::ResponseTooLong => 0x14,
            Self::BusyRepeatRequest => 0x21,
            Self::ConditionsNotCorrect => 0x22,
            Self::RequestSequenceError => 0x24,
            Self::RequestOutOfRange => 0x31,
            Self::SecurityAccessDenied => 0x33,
            Self::InvalidKey => 0x35,
            Self::ExceededNumberOfAttempts => 0x36,
            Self::RequiredTimeDelayNotExpired => 0x37,
            Self::UploadDownloadNotAccepted => 0x70,
            Self::GeneralProgrammingFailure => 0x72,
            Self::WrongBlockSequenceCounter => 0x73,
            Self::ResponsePending => 0x78,
            Self::SubFunctionNotSupportedInActiveSession => 0x7E,
            Self::ServiceNotSupportedInActiveSession => 0x7F,
            Self::Unknown(code) => *code,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::GeneralReject => "generalReject",
            Self::ServiceNotSupported => "serviceNotSupported",
            Self::SubFunctionNotSupported => "subFunctionNotSupported",
            Self::IncorrectMessageLengthOrFormat => "incorrectMessageLengthOrInvalidFormat",
            Self::ResponseTooLong => "responseTooLong",
            Self::BusyRepeatRequest => "busyRepeatRequest",
            Self::ConditionsNotCorrect => "conditionsNotCorrect",
            Self::RequestSequenceError => "requestSequenceError",
            Self::RequestOutOfRange => "requestOutOfRange",
            Self::SecurityAccessDenied => "securityAccessDenied",
            Self::InvalidKey => "invalidKey",
            Self::ExceededNumberOfAttempts => "exceededNumberOfAttempts",
            Self::RequiredTimeDelayNotExpired => "requiredTimeDelayNotExpired",
            Self::UploadDownloadNotAccepted => "uploadDownloadNotAccepted",
            Self::GeneralProgrammingFailure => "generalProgrammingFailure",
            Self::WrongBlockSequenceCounter => "wrongBlockSequenceCounter",
            Self::ResponsePending => "requestCorrectlyReceived-ResponsePending",
            Self::SubFunctionNotSupportedInActiveSession => {
                "subFunctionNotSupportedInActiveSession"
            }
            Self::ServiceNotSupportedInActiveSession => "serviceNotSupportedInActiveSession",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl From<u8> for NegativeResponseCode {
    fn from(code: u8) -> Self {
        match code {
            0x10 => Self::GeneralReject,
            0x11 => Self::ServiceNotSupported,
            0x12 => Self::SubFunctionNotSupported,
            0x13 => Self::IncorrectMessageLengthOrFormat,
            0x14 => Self::ResponseTooLong,
            0x21 => Self::BusyRepeatRequest,
            0x22 => Self::ConditionsNotCorrect,
            0x24 => Self::RequestSequenceError,
            0x31 => Self::RequestOutOfRange,
            0x33 => Self::SecurityAccessDenied,
            0x35 => Self::InvalidKey,
            0x36 => Self::ExceededNumberOfAttempts,
            0x37 => Self::RequiredTimeDelayNotExpired,
            0x70 => Self::UploadDownloadNotAccepted,
            0x72 => Self::GeneralProgrammingFailure,
            0x73 => Self::WrongBlockSequenceCounter,
            0x78 => Self::ResponsePending,
            0x7E => Self::SubFunctionNotSupportedInActiveSession,
            0x7F => Self::ServiceNotSupportedInActiveSession,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for NegativeResponseCode {
    // "name (0xNN)" so logs carry both forms
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), self.code())
    }
}
