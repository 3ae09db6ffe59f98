//! Byte-size and split-weight value types threaded through scheduler APIs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Add;

/// A byte count with human-readable formatting.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DataSize(u64);

impl DataSize {
    /// Zero bytes.
    pub const ZERO: DataSize = DataSize(0);

    /// Construct from a raw byte count.
    pub const fn of_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Construct from mebibytes.
    pub const fn of_mib(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }

    /// Construct from gibibytes.
    pub const fn of_gib(gib: u64) -> Self {
        Self(gib * 1024 * 1024 * 1024)
    }

    /// Raw byte count.
    pub const fn bytes(self) -> u64 {
        self.0
    }

    /// Saturating byte-wise addition.
    pub fn saturating_add(self, other: DataSize) -> DataSize {
        DataSize(self.0.saturating_add(other.0))
    }
}

impl Add for DataSize {
    type Output = DataSize;

    fn add(self, other: DataSize) -> DataSize {
        self.saturating_add(other)
    }
}

impl fmt::Display for DataSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(u64, &str); 4] = [
            (1 << 40, "TiB"),
            (1 << 30, "GiB"),
            (1 << 20, "MiB"),
            (1 << 10, "KiB"),
        ];
        for (scale, unit) in UNITS {
            if self.0 >= scale {
                return write!(f, "{:.2}{unit}", self.0 as f64 / scale as f64);
            }
        }
        write!(f, "{}B", self.0)
    }
}

/// Relative cost weight of one split.
///
/// A "standard" split has raw weight [`SplitWeight::STANDARD_RAW`]; connectors
/// scale up for oversized splits and down for trivially small ones.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SplitWeight(u64);

impl SplitWeight {
    /// Raw value of the standard unit weight.
    pub const STANDARD_RAW: u64 = 100;

    /// The standard unit weight.
    pub const fn standard() -> Self {
        Self(Self::STANDARD_RAW)
    }

    /// Construct from a raw weight value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw weight value.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Saturating raw-value addition.
    pub fn saturating_add(self, other: SplitWeight) -> SplitWeight {
        SplitWeight(self.0.saturating_add(other.0))
    }
}

impl fmt::Display for SplitWeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
