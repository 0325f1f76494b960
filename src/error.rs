//! Errors surfaced by the block management layer

use thiserror::Error;

use crate::nand::LldError;
use crate::reservoir::ReservoirError;

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum BmlError {
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    #[error("virtual address {0} is out of range")]
    OutOfRange(u32),

    #[error("target is write-protected")]
    WriteProtect,

    /// Uncorrectable data; each set bit names a way that failed
    #[error("uncorrectable read error (ways {way_mask:#x})")]
    ReadError { way_mask: u32 },

    #[error("block {block} could not be erased, even after replacement")]
    EraseError { block: u32 },

    /// Recovery itself failed; the volume should not be trusted any further
    #[error("critical error: {0}")]
    Critical(&'static str),

    #[error("could not acquire the volume lock")]
    LockAcquire,

    #[error(transparent)]
    Lld(LldError),

    #[error("reservoir error: {0}")]
    Reservoir(#[from] ReservoirError),
}

impl From<LldError> for BmlError {
    fn from(e: LldError) -> Self {
        match e {
            LldError::WriteProtect => Self::WriteProtect,
            e => Self::Lld(e),
        }
    }
}
