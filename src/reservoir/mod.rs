//! The interface to the reservoir manager: the pool of spare blocks that bad blocks are
//! replaced from, and the table recording those replacements.
//!
//! Allocation policy and bad-block-table persistence belong to the implementation. The block
//! management layer only asks where a nominal block currently lives, and requests a new home
//! for blocks that fail.

use thiserror::Error;

use crate::nand::{LldError, LowLevelDriver, SpareBuf};

pub mod sim;

/// Cell technology of the reservoir blocks
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum ReservoirType {
    #[default]
    Slc,
    Mlc,

    /// SLC reservoir blocks backing an MLC data area
    Hybrid,
}

/// Where the data area and the reservoir sit within one die.
///
/// Block numbers are relative to the start of the die.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ReservoirLayout {
    pub kind: ReservoirType,
    pub first_block: u32,
    pub blocks: u32,
    pub data_offset: u32,
    pub data_blocks: u32,
}

impl ReservoirLayout {
    /// Is this die-relative block in the data area?
    pub fn is_data(&self, block: u32) -> bool {
        (self.data_offset..self.data_offset + self.data_blocks).contains(&block)
    }

    /// Is this die-relative block in the reservoir?
    pub fn is_reservoir(&self, block: u32) -> bool {
        (self.first_block..self.first_block + self.blocks).contains(&block)
    }
}

/// Why a block is being replaced
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SubstituteReason {
    /// A program failed; the pages below the failing one must survive the move
    Write,

    /// An erase failed
    Erase,

    /// A dummy program of the reference block failed
    Reference,
}

/// A request to move a failed block (or plane group) into the reservoir
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SubstituteRequest {
    pub dev: u32,
    pub die: u32,

    /// Device-relative nominal block; the plane group base when more than one plane failed
    pub block: u32,

    /// The page that failed; pages below it are preserved
    pub page: u32,

    /// How many planes of the group failed
    pub planes: u32,

    pub reason: SubstituteReason,
}

/// The result of a substitution
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct Substitution {
    /// Nominal blocks that were given a new home
    pub replaced: Vec<u32>,

    /// Planes substituted, as reported by the reservoir: the plane count for a paired
    /// replacement, one less for an unpaired one, zero if nothing moved
    pub count: u32,
}

/// Which lookback log a restore refers to
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Lookback {
    Previous,
    NextPrevious,
}

/// Buffers of a logged operation, handed to the reservoir before they are rewritten
#[derive(Debug)]
pub struct RestoreBuffers<'a> {
    pub block: u32,
    pub page: u32,
    pub main: &'a mut [u8],
    pub spare: &'a mut Option<SpareBuf>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RefreshUpdate {
    Add,
    Remove,
}

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum ReservoirError {
    #[error("invalid reservoir request: {0}")]
    InvalidParam(&'static str),

    #[error("no free reservoir blocks left on die {die}")]
    Exhausted { die: u32 },

    #[error("driver error while relocating: {0}")]
    Lld(#[from] LldError),
}

/// Represents the reservoir manager of a volume
pub trait Reservoir: Send {
    /// Layout of one die
    fn layout(&self, dev: u32, die: u32) -> ReservoirLayout;

    /// Where a nominal block currently lives, if it has been replaced
    fn replacement(&self, dev: u32, block: u32) -> Option<u32>;

    /// Has this nominal block been replaced?
    fn is_bad(&self, dev: u32, block: u32) -> bool {
        self.replacement(dev, block).is_some()
    }

    /// The device-relative block that dummy backup programs go to
    fn reference_block(&self, dev: u32, die: u32) -> u32;

    /// Replace a failed block (or plane group).
    ///
    /// Any pages the implementation copies over go through `lld`; the die's pipeline is
    /// flushed before this returns.
    fn substitute(
        &mut self,
        lld: &mut dyn LowLevelDriver,
        req: &SubstituteRequest,
    ) -> Result<Substitution, ReservoirError>;

    /// Give the reservoir a chance to repair a logged buffer before it is rewritten
    fn restore_previous_data(
        &mut self,
        dev: u32,
        die: u32,
        which: Lookback,
        buffers: RestoreBuffers<'_>,
    ) -> Result<(), ReservoirError>;

    /// Called before programming a page whose failure would corrupt a paired page
    fn backup_previous_data(
        &mut self,
        dev: u32,
        die: u32,
        block: u32,
        page: u32,
    ) -> Result<(), ReservoirError>;

    fn update_erase_refresh_list(
        &mut self,
        dev: u32,
        die: u32,
        block: u32,
        update: RefreshUpdate,
    ) -> Result<(), ReservoirError>;
}
