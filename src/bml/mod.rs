//! The block management layer: virtual units and pages on top of a low-level driver.
//!
//! A volume is made of every die ("way") of every device. A virtual unit is one plane group
//! on each way, and its virtual pages are interleaved across the ways, so consecutive
//! virtual pages keep every die busy. A virtual page is one physical page per plane.
//!
//! All operations go through a [VolumeGuard], obtained from [Volume::lock]; the convenience
//! methods on [Volume] take the lock for the duration of one call.

use std::mem;
use std::sync::{Mutex, MutexGuard};

use bitflags::bitflags;
use log::info;

use crate::error::BmlError;
use crate::nand::{Geometry, IoCtlReply, LldFlags, LowLevelDriver, SpareBuf};
use crate::reservoir::{Reservoir, ReservoirLayout};

mod die;
mod ops;
pub mod partition;
mod recovery;
pub mod translate;

#[cfg(test)]
mod test;

pub use die::{CopyBackLog, DieState, LogKind, OpLog};
pub use ops::{split_random_in, CopyBackArg, VolumeIoCtl};
pub use partition::{PartAttr, Partition, PartitionTable};
pub use translate::{unpaired_plane, SubstitutionKind, Translation};

bitflags! {
    /// Flags accepted by the volume operations
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
    pub struct BmlFlags: u32 {
        /// Use hardware ECC
        const ECC_ON = 1 << 0;

        /// Never use cache programs; every program is confirmed by the next command
        const NO_CACHE = 1 << 1;
    }
}

impl BmlFlags {
    /// The driver flags every command issued for this call carries
    fn lld(self) -> LldFlags {
        match self.contains(BmlFlags::ECC_ON) {
            true => LldFlags::ECC_ON,
            false => LldFlags::empty(),
        }
    }
}

/// The dies of one device
#[derive(Debug, Default, Clone)]
pub struct DeviceContext {
    pub dies: Vec<DieState>,
}

/// Everything a volume knows; only reachable through the volume lock
pub struct VolumeContext {
    geometry: Geometry,
    lld: Box<dyn LowLevelDriver>,
    reservoir: Box<dyn Reservoir>,

    /// Reservoir layout of each way
    layouts: Vec<ReservoirLayout>,

    devices: Vec<DeviceContext>,
    units: u32,
    partitions: PartitionTable,
    partitions_adjusted: bool,

    /// Page written by dummy programs
    dummy: Vec<u8>,
}

/// Exclusive access to a volume
pub type VolumeGuard<'a> = MutexGuard<'a, VolumeContext>;

/// An open volume
pub struct Volume {
    ctx: Mutex<VolumeContext>,

    /// Held while the partition table is being replaced
    adjust: Mutex<()>,
}

impl Volume {
    /// Open a volume on top of a driver and a reservoir manager.
    ///
    /// The number of virtual units is set by the smallest data area of any die. An empty
    /// partition table leaves every unit writable.
    pub fn open(
        geometry: Geometry,
        lld: Box<dyn LowLevelDriver>,
        reservoir: Box<dyn Reservoir>,
        partitions: PartitionTable,
    ) -> Result<Self, BmlError> {
        geometry.validate().map_err(BmlError::InvalidParam)?;

        let mut layouts = Vec::with_capacity(geometry.ways() as usize);
        for way in 0..geometry.ways() {
            let (dev, die) = geometry.way_location(way);
            let layout = reservoir.layout(dev, die);
            if layout.data_offset % geometry.planes != 0
                || layout.data_blocks < geometry.planes
                || layout.data_offset + layout.data_blocks > geometry.blocks_per_die
                || layout.blocks == 0
            {
                return Err(BmlError::InvalidParam("reservoir layout does not fit the die"));
            }
            layouts.push(layout);
        }

        let units = layouts
            .iter()
            .map(|layout| layout.data_blocks / geometry.planes)
            .min()
            .unwrap_or(0);
        partitions.check(units).map_err(BmlError::InvalidParam)?;

        let device = DeviceContext {
            dies: vec![DieState::default(); geometry.dies_per_device as usize],
        };

        info!(
            "opened volume: {} ways, {} units of {} pages",
            geometry.ways(),
            units,
            geometry.pages_per_block * geometry.ways()
        );

        let ctx = VolumeContext {
            geometry,
            lld,
            reservoir,
            layouts,
            devices: vec![device; geometry.devices as usize],
            units,
            partitions,
            partitions_adjusted: false,
            dummy: vec![0xFF; geometry.main_size],
        };

        Ok(Self {
            ctx: Mutex::new(ctx),
            adjust: Mutex::new(()),
        })
    }

    /// Take the volume lock, blocking until it is available
    pub fn lock(&self) -> Result<VolumeGuard<'_>, BmlError> {
        self.ctx.lock().map_err(|_| BmlError::LockAcquire)
    }

    /// Program `pages` virtual pages starting at `vpn`; see [VolumeContext::write]
    pub fn write(
        &self,
        vpn: u32,
        pages: u32,
        main: &[u8],
        spare: Option<&[SpareBuf]>,
        flags: BmlFlags,
    ) -> Result<(), BmlError> {
        self.lock()?.write(vpn, pages, main, spare, flags)
    }

    pub fn read(
        &self,
        vpn: u32,
        pages: u32,
        main: &mut [u8],
        spare: Option<&mut [SpareBuf]>,
        flags: BmlFlags,
    ) -> Result<(), BmlError> {
        self.lock()?.read(vpn, pages, main, spare, flags)
    }

    pub fn erase(&self, units: &[u32], flags: BmlFlags) -> Result<(), BmlError> {
        self.lock()?.erase(units, flags)
    }

    pub fn copy_back(&self, args: &[CopyBackArg], flags: BmlFlags) -> Result<(), BmlError> {
        self.lock()?.copy_back(args, flags)
    }

    /// Flush every die of the volume. Holders of a [VolumeGuard] call
    /// [VolumeContext::flush] instead.
    pub fn flush(&self) -> Result<(), BmlError> {
        self.lock()?.flush()
    }

    pub fn ioctl(&self, cmd: VolumeIoCtl) -> Result<IoCtlReply, BmlError> {
        self.lock()?.ioctl(cmd)
    }

    pub fn otp_write(
        &self,
        page: u32,
        main: &[u8],
        spare: Option<&SpareBuf>,
    ) -> Result<(), BmlError> {
        self.lock()?.otp_write(page, main, spare)
    }

    pub fn otp_read(
        &self,
        page: u32,
        main: &mut [u8],
        spare: Option<&mut SpareBuf>,
    ) -> Result<(), BmlError> {
        self.lock()?.otp_read(page, main, spare)
    }

    pub fn otp_lock(&self) -> Result<(), BmlError> {
        self.lock()?.otp_lock()
    }

    /// Replace the driver, returning the old one. Everything in flight is flushed first.
    pub fn set_driver(
        &self,
        lld: Box<dyn LowLevelDriver>,
    ) -> Result<Box<dyn LowLevelDriver>, BmlError> {
        self.lock()?.set_driver(lld)
    }

    /// Replace the partition table
    pub fn adjust_partitions(&self, partitions: PartitionTable) -> Result<(), BmlError> {
        let _adjust = self.adjust.lock().map_err(|_| BmlError::LockAcquire)?;
        let mut ctx = self.lock()?;
        ctx.flush()?;
        partitions.check(ctx.units).map_err(BmlError::InvalidParam)?;

        info!("partition table adjusted");
        ctx.partitions = partitions;
        ctx.partitions_adjusted = true;
        Ok(())
    }

    /// Flush everything and close the volume
    pub fn close(self) -> Result<(), BmlError> {
        let mut ctx = self.ctx.into_inner().map_err(|_| BmlError::LockAcquire)?;
        ctx.flush()?;
        info!("volume closed");
        Ok(())
    }
}

impl VolumeContext {
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Number of virtual units
    pub fn units(&self) -> u32 {
        self.units
    }

    /// Virtual pages in one virtual unit
    pub fn pages_per_unit(&self) -> u32 {
        self.geometry.pages_per_block * self.geometry.ways()
    }

    pub fn partitions(&self) -> &PartitionTable {
        &self.partitions
    }

    /// Has the partition table been replaced since the volume was opened?
    pub fn partitions_adjusted(&self) -> bool {
        self.partitions_adjusted
    }

    pub fn layout(&self, dev: u32, die: u32) -> &ReservoirLayout {
        &self.layouts[self.geometry.way_index(dev, die) as usize]
    }

    pub fn die(&self, dev: u32, die: u32) -> &DieState {
        &self.devices[dev as usize].dies[die as usize]
    }

    fn die_mut(&mut self, dev: u32, die: u32) -> &mut DieState {
        &mut self.devices[dev as usize].dies[die as usize]
    }

    /// Replace the driver, returning the old one. Everything in flight is flushed first.
    pub fn set_driver(
        &mut self,
        lld: Box<dyn LowLevelDriver>,
    ) -> Result<Box<dyn LowLevelDriver>, BmlError> {
        self.flush()?;
        Ok(mem::replace(&mut self.lld, lld))
    }
}
