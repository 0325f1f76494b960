//! Status codes returned by a low-level driver.

use std::fmt;

use thiserror::Error;

use super::PlaneMask;

/// The minor code of a deferred error: which of the in-flight operations failed.
///
/// Drivers read this out of a status register as a bitmask; it is unpacked here once, so that
/// recovery code never has to deal with raw bits.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct MinorError {
    /// Plane 0 of the previous operation failed
    pub prev_plane0: bool,

    /// Plane 1 of the previous operation failed
    pub prev_plane1: bool,

    /// The operation before the previous one failed (pipeline depth 2 only)
    pub next_prev: bool,

    /// Plane 0 of a dummy program of the reference block failed
    pub dummy_plane0: bool,

    /// Plane 1 of a dummy program of the reference block failed
    pub dummy_plane1: bool,
}

impl MinorError {
    pub const PREV_PLANE0: u32 = 1 << 0;
    pub const PREV_PLANE1: u32 = 1 << 1;
    pub const NEXT_PREV: u32 = 1 << 2;
    pub const DUMMY_PLANE0: u32 = 1 << 8;
    pub const DUMMY_PLANE1: u32 = 1 << 9;

    /// Unpack a raw minor code
    pub fn from_bits(bits: u32) -> Self {
        Self {
            prev_plane0: bits & Self::PREV_PLANE0 != 0,
            prev_plane1: bits & Self::PREV_PLANE1 != 0,
            next_prev: bits & Self::NEXT_PREV != 0,
            dummy_plane0: bits & Self::DUMMY_PLANE0 != 0,
            dummy_plane1: bits & Self::DUMMY_PLANE1 != 0,
        }
    }

    /// Pack back into a raw minor code
    pub fn bits(self) -> u32 {
        [
            (self.prev_plane0, Self::PREV_PLANE0),
            (self.prev_plane1, Self::PREV_PLANE1),
            (self.next_prev, Self::NEXT_PREV),
            (self.dummy_plane0, Self::DUMMY_PLANE0),
            (self.dummy_plane1, Self::DUMMY_PLANE1),
        ]
        .into_iter()
        .filter(|&(set, _)| set)
        .fold(0, |acc, (_, bit)| acc | bit)
    }

    pub fn is_empty(self) -> bool {
        self.bits() == 0
    }

    /// Planes of the previous operation reported as failed
    pub fn prev_planes(self) -> PlaneMask {
        PlaneMask::from_bits(self.prev_plane0 as u8 | (self.prev_plane1 as u8) << 1)
    }

    /// Planes of the dummy program reported as failed
    pub fn dummy_planes(self) -> PlaneMask {
        PlaneMask::from_bits(self.dummy_plane0 as u8 | (self.dummy_plane1 as u8) << 1)
    }

    /// Move the previous-operation bits into the dummy range.
    ///
    /// Used for the status of a dummy program, so that it is never mistaken for a data error.
    pub fn into_dummy(self) -> Self {
        Self {
            dummy_plane0: self.prev_plane0,
            dummy_plane1: self.prev_plane1,
            ..Default::default()
        }
    }
}

impl fmt::Display for MinorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "minor {:#06x}", self.bits())
    }
}

/// How a successful read went
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReadStatus {
    Clean,

    /// ECC corrected the data, but the block is close to losing it and should be refreshed
    Disturbed,
}

/// Errors reported by a low-level driver
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum LldError {
    /// An earlier program on this die failed; the current command was not issued
    #[error("deferred write error ({0})")]
    DeferredWrite(MinorError),

    /// An earlier erase on this die failed; the current command was not issued
    #[error("deferred erase error ({0})")]
    DeferredErase(MinorError),

    /// An earlier read-ahead on this die hit an uncorrectable error
    #[error("deferred read error on die {die}")]
    DeferredRead { die: u32 },

    #[error("block is write-protected")]
    WriteProtect,

    #[error("uncorrectable read error")]
    Uncorrectable,

    /// A protocol violation; never retried
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),
}

impl LldError {
    /// The minor code, if this is a recoverable program/erase error
    pub fn deferred(&self) -> Option<MinorError> {
        match self {
            Self::DeferredWrite(minor) | Self::DeferredErase(minor) => Some(*minor),
            _ => None,
        }
    }
}

#[test]
fn test_minor_bits() {
    let minor = MinorError::from_bits(MinorError::PREV_PLANE1 | MinorError::NEXT_PREV);
    assert!(!minor.prev_plane0);
    assert!(minor.prev_plane1);
    assert!(minor.next_prev);
    assert_eq!(minor.prev_planes(), PlaneMask::single(1));
    assert_eq!(
        minor.bits(),
        MinorError::PREV_PLANE1 | MinorError::NEXT_PREV
    );
}

#[test]
fn test_minor_into_dummy() {
    let minor = MinorError::from_bits(MinorError::PREV_PLANE1 | MinorError::NEXT_PREV);
    let dummy = minor.into_dummy();

    assert!(dummy.prev_planes().is_empty());
    assert_eq!(dummy.dummy_planes(), PlaneMask::single(1));
    assert!(!dummy.next_prev);
}
