use crate::accelerator::Accelerator;
use crate::status::{check, AccelError};
use std::fmt;
use std::sync::Arc;

/// What an accelerator handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Config,
    Resources,
    Matrix,
    Vector,
    Solver,
}

impl HandleKind {
    pub(crate) fn destroy_call(self) -> &'static str {
        match self {
            HandleKind::Config => "config_destroy",
            HandleKind::Resources => "resources_destroy",
            HandleKind::Matrix => "matrix_destroy",
            HandleKind::Vector => "vector_destroy",
            HandleKind::Solver => "solver_destroy",
        }
    }
}

/// Opaque handle value issued by an accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle(pub u64);

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Owns one accelerator handle and destroys it exactly once.
///
/// [`OwnedHandle::release`] destroys it with a checked call. If the guard is
/// dropped instead, the handle is destroyed and a failure is only logged.
pub struct OwnedHandle {
    accel: Arc<dyn Accelerator>,
    kind: HandleKind,
    raw: RawHandle,
    live: bool,
}

impl OwnedHandle {
    pub fn new(accel: Arc<dyn Accelerator>, kind: HandleKind, raw: RawHandle) -> Self {
        log::trace!("Owning {:?} handle {}", kind, raw);
        Self {
            accel,
            kind,
            raw,
            live: true,
        }
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    /// The raw handle, for passing to accelerator calls.
    pub fn raw(&self) -> RawHandle {
        self.raw
    }

    #[track_caller]
    pub fn release(mut self) -> Result<(), AccelError> {
        self.live = false;
        check(
            self.accel.destroy(self.kind, self.raw),
            self.kind.destroy_call(),
        )
    }
}

impl fmt::Debug for OwnedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedHandle")
            .field("kind", &self.kind)
            .field("raw", &self.raw)
            .finish()
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if !self.live {
            return;
        }
        if let Err(status) = self.accel.destroy(self.kind, self.raw) {
            log::warn!(
                "Dropping {:?} handle {} failed with status {}",
                self.kind,
                self.raw,
                status
            );
        }
    }
}
