//! Abstractions for talking to NAND flash through a low-level driver (LLD)

use std::str::FromStr;

use anyhow::ensure;
use bitflags::bitflags;

pub mod sim;
mod spare;
mod status;

pub use spare::{SpareBuf, META_EXT_LEN, SPARE_BASE_LEN};
pub use status::{LldError, MinorError, ReadStatus};

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// The most planes a die can have
pub const MAX_PLANES: u32 = 2;

/// The most dies a volume can span; read errors name the failing ways in a `u32` mask
pub const MAX_WAYS: u32 = u32::BITS;

/// The cell technology of the NAND array
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum NandClass {
    /// One bit per cell
    #[default]
    Slc,

    /// Two bits per cell, with pages paired as (LSB, MSB)
    Mlc,

    /// Flex-OneNAND: an SLC partition followed by an MLC partition on the same die
    Flex,
}

/// A pub-fields struct describing a volume built from one or more NAND devices
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Geometry {
    pub devices: u32,
    pub dies_per_device: u32,
    pub planes: u32,
    pub blocks_per_die: u32,
    pub pages_per_block: u32,
    pub main_size: usize,
    pub spare_size: usize,
    pub class: NandClass,

    /// How many operations a die accepts before it reports the status of the oldest (1 or 2)
    pub pipeline_depth: u32,

    /// Whether the status of a cache program can only be trusted after a dummy program of the
    /// reference block
    pub cache_backup: bool,
}

impl Geometry {
    /// Change the NAND class
    pub fn class(mut self, class: NandClass) -> Self {
        self.class = class;
        self
    }

    /// Change the pipeline depth
    pub fn pipeline_depth(mut self, depth: u32) -> Self {
        self.pipeline_depth = depth;
        self
    }

    /// Enable or disable dummy backup programs
    pub fn cache_backup(mut self, enable: bool) -> Self {
        self.cache_backup = enable;
        self
    }

    /// Check that the geometry describes something this layer can drive
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.devices == 0 || self.dies_per_device == 0 {
            return Err("volume has no dies");
        }
        if self.dies_per_device > 2 {
            return Err("at most two dies per device are supported");
        }
        if self.devices.saturating_mul(self.dies_per_device) > MAX_WAYS {
            return Err("volume spans too many dies");
        }
        if self.planes == 0 || self.planes > MAX_PLANES {
            return Err("plane count must be 1 or 2");
        }
        if self.blocks_per_die == 0 || self.blocks_per_die % self.planes != 0 {
            return Err("blocks per die must be a nonzero multiple of the plane count");
        }
        if self.pages_per_block < 2 || self.pages_per_block % 2 != 0 {
            return Err("pages per block must be an even number");
        }
        if self.main_size == 0 {
            return Err("page main area must not be empty");
        }
        if self.spare_size < SpareBuf::HEADER_LEN {
            return Err("spare area too small for the spare header");
        }
        if !(1..=2).contains(&self.pipeline_depth) {
            return Err("pipeline depth must be 1 or 2");
        }
        Ok(())
    }

    /// Number of independently addressable dies in the volume
    pub fn ways(&self) -> u32 {
        self.devices * self.dies_per_device
    }

    /// Split a way index into (device, die)
    pub fn way_location(&self, way: u32) -> (u32, u32) {
        (way / self.dies_per_device, way % self.dies_per_device)
    }

    /// Combine (device, die) into a way index
    pub fn way_index(&self, dev: u32, die: u32) -> u32 {
        dev * self.dies_per_device + die
    }

    /// The die a device-relative block number lives on
    pub fn die_of(&self, block: u32) -> u32 {
        block / self.blocks_per_die
    }

    /// The first device-relative block number of a die
    pub fn die_start(&self, die: u32) -> u32 {
        die * self.blocks_per_die
    }

    pub fn blocks_per_device(&self) -> u32 {
        self.blocks_per_die * self.dies_per_device
    }

    /// Bytes of main area in a virtual page (one physical page per plane)
    pub fn virtual_page_size(&self) -> usize {
        self.main_size * self.planes as usize
    }

    /// Bytes of spare area in a virtual page
    pub fn virtual_spare_size(&self) -> usize {
        self.spare_size * self.planes as usize
    }

    /// The plane mask covering every plane of a die
    pub fn all_planes(&self) -> PlaneMask {
        PlaneMask::full(self.planes)
    }

    /// Is this page the LSB half of an MLC page pair?
    pub fn is_lsb_page(&self, page: u32) -> bool {
        page % 2 == 0
    }

    /// The last LSB page of a block
    pub fn last_lsb_page(&self) -> u32 {
        self.pages_per_block - 2
    }

    /// Does the status of a cache program need a dummy program of the reference block?
    pub fn requires_backup_program(&self) -> bool {
        self.cache_backup && matches!(self.class, NandClass::Slc | NandClass::Flex)
    }
}

/// Parse strings like "DEVSxDIESxPLANESxBLOCKSxPAGESxBYTES"
///
/// The spare area is sized at 1/32 of the main area, as on most large-page NAND.
impl FromStr for Geometry {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [devices, dies, planes, blocks, pages, bytes]: [&str; 6] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#x#x#x#"))?;

        let main_size: usize = bytes.parse()?;
        ensure!(main_size % 32 == 0, "page size must be a multiple of 32");

        let geometry = Geometry {
            devices: devices.parse()?,
            dies_per_device: dies.parse()?,
            planes: planes.parse()?,
            blocks_per_die: blocks.parse()?,
            pages_per_block: pages.parse()?,
            main_size,
            spare_size: main_size / 32,
            class: NandClass::Slc,
            pipeline_depth: 1,
            cache_backup: false,
        };

        geometry.validate().map_err(|e| anyhow::anyhow!(e))?;
        Ok(geometry)
    }
}

/// A set of planes within one die
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct PlaneMask(u8);

impl PlaneMask {
    pub const EMPTY: Self = Self(0);

    pub fn single(plane: u32) -> Self {
        Self(1 << plane)
    }

    pub fn full(planes: u32) -> Self {
        Self(((1u16 << planes) - 1) as u8)
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, plane: u32) -> bool {
        self.0 & (1 << plane) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub fn first(self) -> Option<u32> {
        (!self.is_empty()).then(|| self.0.trailing_zeros())
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Iterate over the planes in ascending order
    pub fn iter(self) -> impl Iterator<Item = u32> {
        (0..8).filter(move |&p| self.contains(p))
    }
}

bitflags! {
    /// Flags attached to every LLD command
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
    pub struct LldFlags: u32 {
        /// Use hardware ECC
        const ECC_ON = 1 << 0;

        /// Cache program: the status is reported by a later command
        const CACHE_PROGRAM = 1 << 1;

        /// Dummy program of the reference block
        const BACKUP = 1 << 2;

        /// Address the OTP block instead of the array
        const OTP = 1 << 3;

        /// Reissued by the deferred error handler
        const RECOVERY = 1 << 4;
    }
}

/// Data to overwrite while a page is held in the page buffer during copy-back.
///
/// `offset` counts bytes from the start of the page, main area first, then spare area.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RandomIn {
    pub offset: usize,
    pub data: Vec<u8>,
}

/// One plane's worth of a copy-back command
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CopyBackPlane {
    pub src_block: u32,
    pub src_page: u32,
    pub dst_block: u32,
    pub dst_page: u32,
    pub random_in: Vec<RandomIn>,
}

/// Miscellaneous device controls
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IoCtl {
    /// Write-protect a range of blocks
    Lock { first: u32, count: u32 },

    /// Remove write protection from a range of blocks
    Unlock { first: u32, count: u32 },

    /// Write-protect a range of blocks until power cycle
    LockTight { first: u32, count: u32 },

    /// Permanently lock the OTP block
    LockOtp,

    /// Query whether the OTP block is locked
    OtpStatus,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IoCtlReply {
    Done,
    OtpLocked(bool),
}

/// Represents a low-level NAND driver
///
/// Block numbers are relative to the device; the die is implied by the block number. Commands
/// that take several blocks address one block per plane, in ascending plane order, and take
/// page buffers holding one physical page per block.
///
/// Program and erase commands may return the status of an *earlier* command on the same die
/// (see [LldError::DeferredWrite]); in that case the command itself was not issued.
pub trait LowLevelDriver: Send {
    /// Program one page in each of `blocks`
    fn write(
        &mut self,
        dev: u32,
        blocks: &[u32],
        page: u32,
        main: &[u8],
        spare: Option<&[u8]>,
        flags: LldFlags,
    ) -> Result<(), LldError>;

    /// Read one page from each of `blocks`
    fn read(
        &mut self,
        dev: u32,
        blocks: &[u32],
        page: u32,
        main: &mut [u8],
        spare: Option<&mut [u8]>,
        flags: LldFlags,
    ) -> Result<ReadStatus, LldError>;

    /// Erase each of `blocks`
    fn erase(&mut self, dev: u32, blocks: &[u32], flags: LldFlags) -> Result<(), LldError>;

    /// Copy pages through the page buffer, applying random-in data on the way
    fn copy_back(
        &mut self,
        dev: u32,
        planes: &[CopyBackPlane],
        flags: LldFlags,
    ) -> Result<(), LldError>;

    /// Wait for every command on the die to finish, and report any status not yet reported
    ///
    /// Calling this on an idle die succeeds without doing anything.
    fn flush_op(&mut self, dev: u32, die: u32, flags: LldFlags) -> Result<(), LldError>;

    /// Miscellaneous device controls
    fn ioctl(&mut self, dev: u32, cmd: IoCtl) -> Result<IoCtlReply, LldError>;
}

#[cfg(test)]
pub(crate) const TEST_GEOMETRY: Geometry = Geometry {
    devices: 1,
    dies_per_device: 1,
    planes: 1,
    blocks_per_die: 32,
    pages_per_block: 8,
    main_size: 64,
    spare_size: 32,
    class: NandClass::Slc,
    pipeline_depth: 1,
    cache_backup: false,
};

#[test]
fn test_parse_geometry() -> anyhow::Result<()> {
    let geometry: Geometry = "2x2x2x1024x64x2048".parse()?;
    assert_eq!(geometry.ways(), 4);
    assert_eq!(geometry.spare_size, 64);
    assert_eq!(geometry.virtual_page_size(), 4096);
    assert_eq!(geometry.way_location(3), (1, 1));
    assert_eq!(geometry.way_index(1, 1), 3);

    assert!("2x2x2x1024x64".parse::<Geometry>().is_err());
    assert!("1x1x3x1024x64x2048".parse::<Geometry>().is_err());
    assert!("1x1x2x1023x64x2048".parse::<Geometry>().is_err());

    let widest: Geometry = "16x2x2x1024x64x2048".parse()?;
    assert_eq!(widest.ways(), MAX_WAYS);
    assert!("17x2x2x1024x64x2048".parse::<Geometry>().is_err());
    Ok(())
}

#[test]
fn test_plane_mask() {
    let full = PlaneMask::full(2);
    assert_eq!(full.count(), 2);
    assert_eq!(full.iter().collect::<Vec<_>>(), [0, 1]);
    assert_eq!(full.without(PlaneMask::single(0)), PlaneMask::single(1));
    assert_eq!(PlaneMask::single(1).first(), Some(1));
    assert_eq!(PlaneMask::EMPTY.first(), None);
    assert_eq!(PlaneMask::full(1), PlaneMask::single(0));
}

#[test]
fn test_backup_requirement() {
    let geometry = TEST_GEOMETRY;
    assert!(!geometry.requires_backup_program());
    assert!(geometry.cache_backup(true).requires_backup_program());
    assert!(geometry
        .class(NandClass::Flex)
        .cache_backup(true)
        .requires_backup_program());
    assert!(!geometry
        .class(NandClass::Mlc)
        .cache_backup(true)
        .requires_backup_program());
}
