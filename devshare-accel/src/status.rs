//! Status codes returned by accelerator calls and the single place where a
//! status is turned into an error.

use std::fmt;
use std::panic::Location;
use thiserror::Error;

/// Raw status of an accelerator call. `Ok` never appears inside an `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelStatus {
    Ok,
    BadParameters,
    UnknownError,
    InternalError,
    NoMemory,
    BadMode,
    BadConfiguration,
    NotInitialized,
    InvalidHandle,
    CommFailure,
}

impl AccelStatus {
    /// Numeric code reported alongside the failing call.
    pub fn code(self) -> i32 {
        match self {
            AccelStatus::Ok => 0,
            AccelStatus::BadParameters => 1,
            AccelStatus::UnknownError => 2,
            AccelStatus::InternalError => 3,
            AccelStatus::NoMemory => 5,
            AccelStatus::BadMode => 10,
            AccelStatus::BadConfiguration => 13,
            AccelStatus::NotInitialized => 14,
            AccelStatus::InvalidHandle => 15,
            AccelStatus::CommFailure => 16,
        }
    }
}

impl fmt::Display for AccelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (code {})", self, self.code())
    }
}

/// Result of a raw accelerator call.
pub type AccelResult<T> = core::result::Result<T, AccelStatus>;

/// A failed accelerator call: which call, with what status, from where.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{call} failed with status {status} at {location}")]
pub struct AccelError {
    call: &'static str,
    status: AccelStatus,
    location: &'static Location<'static>,
}

impl AccelError {
    #[track_caller]
    pub fn new(call: &'static str, status: AccelStatus) -> Self {
        Self {
            call,
            status,
            location: Location::caller(),
        }
    }

    pub fn call(&self) -> &'static str {
        self.call
    }

    pub fn status(&self) -> AccelStatus {
        self.status
    }

    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }
}

/// Checks the outcome of an accelerator call, recording the caller's
/// location on failure.
#[track_caller]
pub fn check<T>(result: AccelResult<T>, call: &'static str) -> Result<T, AccelError> {
    match result {
        Ok(value) => Ok(value),
        Err(status) => {
            let error = AccelError::new(call, status);
            log::error!("{}", error);
            Err(error)
        }
    }
}
