use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Where the accelerator keeps matrix and vector data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemorySpace {
    Host,
    Device,
}

/// Storage precision of a floating point array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Precision {
    Double,
    Float,
}

/// Accelerator mode: memory space, vector precision, matrix precision.
/// Indices are always 32-bit.
///
/// The names follow the accelerator's own spelling, e.g. `dDFI` is device
/// memory, double vectors, float matrix, int indices.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    dDDI,
    dDFI,
    dFFI,
    hDDI,
    hDFI,
    hFFI,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unrecognized accelerator mode '{0}' (expected one of dDDI, dDFI, dFFI, hDDI, hDFI, hFFI)")]
pub struct UnknownMode(pub String);

impl Mode {
    pub const ALL: [Mode; 6] = [
        Mode::dDDI,
        Mode::dDFI,
        Mode::dFFI,
        Mode::hDDI,
        Mode::hDFI,
        Mode::hFFI,
    ];

    pub fn memory_space(self) -> MemorySpace {
        match self {
            Mode::dDDI | Mode::dDFI | Mode::dFFI => MemorySpace::Device,
            Mode::hDDI | Mode::hDFI | Mode::hFFI => MemorySpace::Host,
        }
    }

    pub fn vector_precision(self) -> Precision {
        match self {
            Mode::dFFI | Mode::hFFI => Precision::Float,
            _ => Precision::Double,
        }
    }

    pub fn matrix_precision(self) -> Precision {
        match self {
            Mode::dDDI | Mode::hDDI => Precision::Double,
            _ => Precision::Float,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::dDDI => "dDDI",
            Mode::dDFI => "dDFI",
            Mode::dFFI => "dFFI",
            Mode::hDDI => "hDDI",
            Mode::hDFI => "hDFI",
            Mode::hFFI => "hFFI",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| UnknownMode(s.to_string()))
    }
}
