use derive_more::From;
use devshare_accel::{AccelError, SolveStatus, UnknownMode};
use devshare_core::CoreError;
use std::panic::Location;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, From)]
pub enum Error {
    // -- Externals
    #[from]
    Core(CoreError),

    #[from]
    Accelerator(AccelError),

    #[from]
    Mode(UnknownMode),

    // -- Orchestration
    /// The process layout cannot be served by the visible devices.
    Topology(String),

    /// A call made in the wrong lifecycle state.
    Lifecycle(String),

    Device(String),

    Config(String),

    InvalidInput(String),

    /// Another process failed a collective step this process completed.
    PeerFailure(String),

    /// The solve ran to completion but the solver did not succeed.
    SolveStatus(SolveStatus),
}

impl Error {
    /// Underlying status code, where the failure carries one.
    pub fn status_code(&self) -> Option<i32> {
        match self {
            Error::Accelerator(e) => Some(e.status().code()),
            Error::SolveStatus(status) => Some(status.code() as i32),
            _ => None,
        }
    }

    /// Whether this error leaves the instance in the failed state.
    pub(crate) fn poisons(&self) -> bool {
        !matches!(
            self,
            Error::SolveStatus(_) | Error::Lifecycle(_) | Error::Mode(_) | Error::Config(_)
        )
    }
}

// region:    --- Error Boilerplate

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        write!(fmt, "{self:?}")
    }
}

impl std::error::Error for Error {}

// endregion: --- Error Boilerplate

/// Fatal reporting: log where the failure surfaced, then abort the process.
pub trait OrAbort<T> {
    fn or_abort(self) -> T;
}

impl<T> OrAbort<T> for Result<T> {
    #[track_caller]
    fn or_abort(self) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                let location = Location::caller();
                let status = err
                    .status_code()
                    .map_or_else(|| "n/a".to_string(), |code| code.to_string());
                log::error!(
                    "Fatal error at {}:{}: {} (status {})",
                    location.file(),
                    location.line(),
                    err,
                    status
                );
                eprintln!(
                    "devshare: fatal error at {}:{}: {} (status {})",
                    location.file(),
                    location.line(),
                    err,
                    status
                );
                std::process::abort()
            }
        }
    }
}
