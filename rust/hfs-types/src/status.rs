//! Stable wire status codes and the status value carried in responses.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status codes with stable wire values. The numeric values are part of
/// the inter-tier protocol and must never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(i32)]
pub enum StatusCode {
    #[default]
    Success = 0,
    Failed = 1,
    ParameterError = 2,
    ResourceNotEnough = 3,
    InvalidResourceParameter = 4,
    AffinityScheduleFailed = 5,
    HeterogeneousScheduleFailed = 6,
    InstanceTransactionWrongVersion = 7,
    ErrScheduleCanceled = 8,
    /// User-facing form of ResourceNotEnough after the retry budget ran out.
    ErrResourceNotEnough = 9,
    ErrResourceConfigError = 10,
    ErrInstanceExited = 11,
    RequestTimeOut = 12,
    ErrInnerSystemError = 13,
    DomainSchedulerUnavailableScheduler = 20,
    DomainSchedulerForwardErr = 21,
    LsForwardDomainTimeout = 30,
    LsGlobalSchedulerAidEmpty = 31,
    LsDomainSchedulerAidEmpty = 32,
    LsRequestNotFound = 33,
    LsInstanceCtrlIsNull = 34,
    LsRegistryTimeout = 35,
    MetaStorePutError = 40,
    MetaStoreDeleteError = 41,
    MetaStoreUnavailable = 42,
}

impl StatusCode {
    pub fn is_ok(self) -> bool {
        self == StatusCode::Success
    }

    /// Transient codes are retried locally and never surfaced unless the
    /// retry budget is exhausted.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            StatusCode::RequestTimeOut | StatusCode::MetaStoreUnavailable
        )
    }

    /// Codes the caller knows how to recover from; returned verbatim.
    pub fn is_caller_recoverable(self) -> bool {
        matches!(
            self,
            StatusCode::InstanceTransactionWrongVersion | StatusCode::LsRequestNotFound
        )
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, *self as i32)
    }
}

/// Outcome of an operation: a code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Self { code: StatusCode::Success, message: String::new() }
    }

    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    pub fn is_err(&self) -> bool {
        !self.is_ok()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl From<StatusCode> for Status {
    fn from(code: StatusCode) -> Self {
        Self { code, message: String::new() }
    }
}
