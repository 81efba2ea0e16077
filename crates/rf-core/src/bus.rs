//! Bus ranges
//!
//! A contiguous block of engine buses, one per audio channel.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::BusId;

/// Contiguous range of buses `[start, start + count)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusRange {
    /// First bus
    pub start: BusId,
    /// Number of channels
    pub count: usize,
}

impl BusRange {
    pub fn new(start: u32, count: usize) -> Self {
        Self {
            start: BusId(start),
            count,
        }
    }

    /// One past the last bus
    #[inline]
    pub fn end(&self) -> u32 {
        self.start.0 + self.count as u32
    }

    /// Check whether a single bus lies within this range
    pub fn contains(&self, bus: BusId) -> bool {
        bus.0 >= self.start.0 && bus.0 < self.end()
    }

    /// Check whether two ranges share any bus
    pub fn overlaps(&self, other: &BusRange) -> bool {
        self.start.0 < other.end() && other.start.0 < self.end()
    }
}

impl fmt::Display for BusRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{})", self.start.0, self.end())
    }
}
