//! The operation drivers: write, read, erase, copy-back, OTP access and device controls.

use log::{debug, error, warn};

use super::die::CopyBackLog;
use super::translate::Translation;
use super::{BmlFlags, PartAttr, VolumeContext};
use crate::error::BmlError;
use crate::nand::{
    CopyBackPlane, Geometry, IoCtl, IoCtlReply, LldError, LldFlags, NandClass, PlaneMask,
    RandomIn, ReadStatus, SpareBuf, MAX_PLANES,
};
use crate::reservoir::RefreshUpdate;

/// How many times one command is reissued after recovering from errors it ran into
const MAX_COMMAND_RETRIES: u32 = 4;

/// One way's worth of a copy-back request
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CopyBackArg {
    pub way: u32,
    pub src_unit: u32,
    pub src_page: u32,
    pub dst_unit: u32,
    pub dst_page: u32,

    /// Data to overwrite on the way; offsets count from the start of the virtual page, main
    /// area of every plane first, then the spare area of every plane
    pub random_in: Vec<RandomIn>,
}

/// Device controls, addressed by partition
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum VolumeIoCtl {
    Lock(u32),
    Unlock(u32),
    LockTight(u32),
    OtpStatus,
}

/// The physical location of a virtual page
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct PageAddr {
    unit: u32,
    way: u32,
    dev: u32,
    die: u32,
    page: u32,
}

/// Split random-in ranges over a virtual page into per-plane ranges over physical pages.
///
/// A range may cross from one plane to the next, and from the main area into the spare
/// area; it is cut at each boundary. Ranges must lie within the virtual page.
pub fn split_random_in(
    geometry: &Geometry,
    ranges: &[RandomIn],
) -> [Vec<RandomIn>; MAX_PLANES as usize] {
    let (main_size, spare_size) = (geometry.main_size, geometry.spare_size);
    let main_total = geometry.virtual_page_size();
    let mut planes: [Vec<RandomIn>; MAX_PLANES as usize] = Default::default();

    for range in ranges {
        let mut offset = range.offset;
        let mut data = &range.data[..];
        while !data.is_empty() {
            let (plane, physical, room) = if offset < main_total {
                let within = offset % main_size;
                (offset / main_size, within, main_size - within)
            } else {
                let spare = offset - main_total;
                let within = spare % spare_size;
                (spare / spare_size, main_size + within, spare_size - within)
            };

            let (chunk, rest) = data.split_at(room.min(data.len()));
            planes[plane].push(RandomIn {
                offset: physical,
                data: chunk.to_vec(),
            });
            offset += chunk.len();
            data = rest;
        }
    }

    planes
}

impl VolumeContext {
    fn locate(&self, vpn: u32) -> PageAddr {
        let ways = self.geometry.ways();
        let within = vpn % self.pages_per_unit();
        let way = within % ways;
        let (dev, die) = self.geometry.way_location(way);

        PageAddr {
            unit: vpn / self.pages_per_unit(),
            way,
            dev,
            die,
            page: within / ways,
        }
    }

    fn check_pages(&self, vpn: u32, pages: u32) -> Result<(), BmlError> {
        let end = vpn.checked_add(pages).ok_or(BmlError::OutOfRange(vpn))?;
        if pages == 0 {
            return Err(BmlError::InvalidParam("zero-length request"));
        }
        if end > self.units * self.pages_per_unit() {
            return Err(BmlError::OutOfRange(end - 1));
        }
        Ok(())
    }

    fn check_unit(&self, unit: u32) -> Result<(), BmlError> {
        match unit < self.units {
            true => Ok(()),
            false => Err(BmlError::OutOfRange(unit)),
        }
    }

    fn check_writable(&self, unit: u32) -> Result<(), BmlError> {
        match self.partitions.is_read_only(unit) {
            true => Err(BmlError::WriteProtect),
            false => Ok(()),
        }
    }

    /// Nominal block of plane 0 of a unit's group on one die
    pub fn nominal_block(&self, dev: u32, die: u32, unit: u32) -> u32 {
        self.geometry.die_start(die)
            + self.layout(dev, die).data_offset
            + unit * self.geometry.planes
    }

    /// Find out where a unit's plane group on one die currently lives
    pub fn translate(&self, dev: u32, die: u32, unit: u32) -> Translation {
        let nominal = self.nominal_block(dev, die, unit);
        let reservoir = &self.reservoir;
        let translation = Translation::resolve(nominal, self.geometry.planes, |block| {
            match reservoir.is_bad(dev, block) {
                true => reservoir.replacement(dev, block),
                false => None,
            }
        });

        if translation.kind != super::SubstitutionKind::None {
            debug!(
                "dev {dev} die {die} unit {unit}: block {nominal} -> {:?} ({:?})",
                &translation.blocks[..self.geometry.planes as usize],
                translation.kind
            );
        }
        translation
    }

    /// Program pages of a translated group, one command for the whole group or one per plane.
    ///
    /// `main` holds the whole virtual page. Planes are cleared from `remaining` as the driver
    /// accepts them, so a retry after recovery picks up where this left off.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn write_planes(
        &mut self,
        dev: u32,
        die: u32,
        unit: u32,
        tr: &Translation,
        remaining: &mut PlaneMask,
        page: u32,
        main: &[u8],
        spare: Option<&SpareBuf>,
        flags: LldFlags,
    ) -> Result<(), LldError> {
        let (main_size, planes) = (self.geometry.main_size, self.geometry.planes);

        for mask in tr.commands(*remaining) {
            let Some(first) = mask.first() else {
                continue;
            };
            let data = &main[first as usize * main_size..][..mask.count() as usize * main_size];
            let spare_bytes = spare
                .map(|s| s.encode_planes(mask, planes, self.geometry.spare_size))
                .transpose()
                .map_err(LldError::InvalidParam)?;

            self.lld
                .write(dev, &tr.blocks_of(mask), page, data, spare_bytes.as_deref(), flags)?;
            self.die_mut(dev, die)
                .log_write(unit, tr.nominal, page, mask, flags, main, spare);
            *remaining = remaining.without(mask);
        }
        Ok(())
    }

    /// Erase a translated group; see [Self::write_planes]
    pub(super) fn erase_planes(
        &mut self,
        dev: u32,
        die: u32,
        unit: u32,
        tr: &Translation,
        remaining: &mut PlaneMask,
        flags: LldFlags,
    ) -> Result<(), LldError> {
        for mask in tr.commands(*remaining) {
            self.lld.erase(dev, &tr.blocks_of(mask), flags)?;
            self.die_mut(dev, die)
                .log_erase(unit, tr.nominal, mask, flags);
            *remaining = remaining.without(mask);
        }
        Ok(())
    }

    /// Copy a page into a translated group; see [Self::write_planes]
    #[allow(clippy::too_many_arguments)]
    pub(super) fn copy_planes(
        &mut self,
        dev: u32,
        die: u32,
        unit: u32,
        dst: &Translation,
        remaining: &mut PlaneMask,
        dst_page: u32,
        copy: &CopyBackLog,
        flags: LldFlags,
    ) -> Result<(), LldError> {
        let commands = match copy.src.is_split() || dst.is_split() {
            true => remaining.iter().map(PlaneMask::single).collect(),
            false => dst.commands(*remaining),
        };

        for mask in commands {
            let planes: Vec<CopyBackPlane> = mask
                .iter()
                .map(|plane| CopyBackPlane {
                    src_block: copy.src.block(plane),
                    src_page: copy.src_page,
                    dst_block: dst.block(plane),
                    dst_page,
                    random_in: copy.random_in[plane as usize].clone(),
                })
                .collect();

            self.lld.copy_back(dev, &planes, flags)?;
            self.die_mut(dev, die).log_copy_back(
                unit,
                dst.nominal,
                dst_page,
                mask,
                flags,
                copy.clone(),
            );
            *remaining = remaining.without(mask);
        }
        Ok(())
    }

    /// Program `pages` virtual pages starting at `vpn`.
    ///
    /// `main` holds one virtual page per page written; `spare`, if given, one spare buffer
    /// per page. Programs are pipelined: a failure may only be found, and recovered from, by
    /// a later call.
    pub fn write(
        &mut self,
        vpn: u32,
        pages: u32,
        main: &[u8],
        spare: Option<&[SpareBuf]>,
        flags: BmlFlags,
    ) -> Result<(), BmlError> {
        self.check_pages(vpn, pages)?;
        let page_size = self.geometry.virtual_page_size();
        if main.len() != page_size * pages as usize {
            return Err(BmlError::InvalidParam("main buffer does not match page count"));
        }
        if let Some(spare) = spare {
            let fits = spare
                .iter()
                .all(|s| s.fits(self.geometry.planes, self.geometry.spare_size));
            if spare.len() != pages as usize || !fits {
                return Err(BmlError::InvalidParam("spare buffers do not match the pages"));
            }
        }
        for i in 0..pages {
            self.check_writable(self.locate(vpn + i).unit)?;
        }

        let ways = self.geometry.ways();
        let mut flushed = vec![false; self.geometry.devices as usize];
        for i in 0..pages {
            let addr = self.locate(vpn + i);
            if !flushed[addr.dev as usize] {
                self.flush_device(addr.dev)?;
                flushed[addr.dev as usize] = true;
            } else if addr.page == 0 {
                self.flush_die(addr.dev, addr.die)?;
            }

            let mut lld_flags = flags.lld();
            if i + ways < pages
                && addr.page + 1 < self.geometry.pages_per_block
                && !flags.contains(BmlFlags::NO_CACHE)
            {
                lld_flags |= LldFlags::CACHE_PROGRAM;
            }

            let data = &main[i as usize * page_size..][..page_size];
            let spare = spare.map(|s| &s[i as usize]);
            self.program_page(addr, data, spare, lld_flags)?;
        }
        Ok(())
    }

    fn program_page(
        &mut self,
        addr: PageAddr,
        main: &[u8],
        spare: Option<&SpareBuf>,
        flags: LldFlags,
    ) -> Result<(), BmlError> {
        let PageAddr {
            unit,
            dev,
            die,
            page,
            ..
        } = addr;

        if self.geometry.class == NandClass::Mlc && !self.geometry.is_lsb_page(page) {
            let nominal = self.nominal_block(dev, die, unit);
            self.reservoir.backup_previous_data(dev, die, nominal, page)?;
        }

        let mut remaining = self.geometry.all_planes();
        for _ in 0..MAX_COMMAND_RETRIES {
            self.replay_latched(dev, die)?;
            let tr = self.translate(dev, die, unit);
            match self.write_planes(dev, die, unit, &tr, &mut remaining, page, main, spare, flags) {
                Ok(()) => return Ok(()),
                Err(e) => self.recover(dev, die, e, 0)?,
            }
        }

        error!("dev {dev} die {die}: unit {unit} page {page} keeps failing");
        Err(BmlError::Critical("program retries exhausted"))
    }

    /// Read `pages` virtual pages starting at `vpn`.
    ///
    /// Every page that can be read is; uncorrectable pages are reported together at the end,
    /// by way.
    pub fn read(
        &mut self,
        vpn: u32,
        pages: u32,
        main: &mut [u8],
        mut spare: Option<&mut [SpareBuf]>,
        flags: BmlFlags,
    ) -> Result<(), BmlError> {
        self.check_pages(vpn, pages)?;
        let page_size = self.geometry.virtual_page_size();
        let (main_size, spare_size) = (self.geometry.main_size, self.geometry.spare_size);
        if main.len() != page_size * pages as usize
            || spare.as_ref().is_some_and(|s| s.len() != pages as usize)
        {
            return Err(BmlError::InvalidParam("buffers do not match page count"));
        }

        let mut flushed = vec![false; self.geometry.ways() as usize];
        let mut way_mask = 0;
        let mut spare_bytes = vec![0xFF; self.geometry.virtual_spare_size()];
        for i in 0..pages {
            let addr = self.locate(vpn + i);
            let PageAddr { dev, die, page, .. } = addr;
            if !flushed[addr.way as usize] {
                self.flush_die(dev, die)?;
                flushed[addr.way as usize] = true;
            }

            let tr = self.translate(dev, die, addr.unit);
            let out = &mut main[i as usize * page_size..][..page_size];
            spare_bytes.fill(0xFF);

            for mask in tr.commands(self.geometry.all_planes()) {
                let Some(first) = mask.first() else {
                    continue;
                };
                let (first, count) = (first as usize, mask.count() as usize);
                let blocks = tr.blocks_of(mask);
                let result = self.lld.read(
                    dev,
                    &blocks,
                    page,
                    &mut out[first * main_size..][..count * main_size],
                    Some(&mut spare_bytes[first * spare_size..][..count * spare_size]),
                    flags.lld(),
                );

                match result {
                    Ok(ReadStatus::Clean) => (),
                    Ok(ReadStatus::Disturbed) => {
                        warn!("dev {dev}: read disturbance in blocks {blocks:?} page {page}");
                        self.reservoir.update_erase_refresh_list(
                            dev,
                            die,
                            tr.nominal,
                            RefreshUpdate::Add,
                        )?;
                    }
                    Err(LldError::Uncorrectable | LldError::DeferredRead { .. }) => {
                        warn!("dev {dev}: uncorrectable data in blocks {blocks:?} page {page}");
                        way_mask |= 1 << addr.way;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if let Some(spare) = spare.as_deref_mut() {
                let views = spare_bytes.chunks(spare_size).map(SpareBuf::decode);
                spare[i as usize] = SpareBuf::join(views);
            }
        }

        match way_mask {
            0 => Ok(()),
            way_mask => Err(BmlError::ReadError { way_mask }),
        }
    }

    /// Erase virtual units. Every die touched is flushed before this returns, so erase
    /// failures are recovered from within the call.
    pub fn erase(&mut self, units: &[u32], flags: BmlFlags) -> Result<(), BmlError> {
        for &unit in units {
            self.check_unit(unit)?;
            self.check_writable(unit)?;
        }

        let ways = self.geometry.ways();
        let mut touched = vec![false; ways as usize];
        for &unit in units {
            for way in 0..ways {
                let (dev, die) = self.geometry.way_location(way);
                self.erase_group(dev, die, unit, flags.lld())?;
                touched[way as usize] = true;
            }
        }

        for way in (0..ways).filter(|&way| touched[way as usize]) {
            let (dev, die) = self.geometry.way_location(way);
            self.flush_die(dev, die)?;
        }
        Ok(())
    }

    fn erase_group(
        &mut self,
        dev: u32,
        die: u32,
        unit: u32,
        flags: LldFlags,
    ) -> Result<(), BmlError> {
        let mut remaining = self.geometry.all_planes();
        for _ in 0..MAX_COMMAND_RETRIES {
            self.replay_latched(dev, die)?;
            let tr = self.translate(dev, die, unit);
            match self.erase_planes(dev, die, unit, &tr, &mut remaining, flags) {
                Ok(()) => {
                    self.reservoir.update_erase_refresh_list(
                        dev,
                        die,
                        tr.nominal,
                        RefreshUpdate::Remove,
                    )?;
                    return Ok(());
                }
                Err(e) => self.recover(dev, die, e, 0)?,
            }
        }

        error!("dev {dev} die {die}: unit {unit} keeps failing to erase");
        Err(BmlError::Critical("erase retries exhausted"))
    }

    /// Copy pages within each way through the page buffer, overwriting the random-in ranges
    /// on the way
    pub fn copy_back(&mut self, args: &[CopyBackArg], flags: BmlFlags) -> Result<(), BmlError> {
        let page_total = self.geometry.virtual_page_size() + self.geometry.virtual_spare_size();
        for arg in args {
            if arg.way >= self.geometry.ways() {
                return Err(BmlError::InvalidParam("no such way"));
            }
            self.check_unit(arg.src_unit)?;
            self.check_unit(arg.dst_unit)?;
            if arg.src_page >= self.geometry.pages_per_block
                || arg.dst_page >= self.geometry.pages_per_block
            {
                return Err(BmlError::InvalidParam("page out of range"));
            }
            if arg
                .random_in
                .iter()
                .any(|r| r.offset.checked_add(r.data.len()).map_or(true, |end| end > page_total))
            {
                return Err(BmlError::InvalidParam("random-in range outside the page"));
            }
            self.check_writable(arg.dst_unit)?;
        }

        let mut touched = vec![false; self.geometry.ways() as usize];
        for arg in args {
            let (dev, die) = self.geometry.way_location(arg.way);
            if !touched[arg.way as usize] {
                self.flush_die(dev, die)?;
                touched[arg.way as usize] = true;
            }
            self.copy_page(dev, die, arg, flags.lld())?;
        }

        for way in 0..self.geometry.ways() {
            if touched[way as usize] {
                let (dev, die) = self.geometry.way_location(way);
                self.flush_die(dev, die)?;
            }
        }
        Ok(())
    }

    fn copy_page(
        &mut self,
        dev: u32,
        die: u32,
        arg: &CopyBackArg,
        flags: LldFlags,
    ) -> Result<(), BmlError> {
        let random_in = split_random_in(&self.geometry, &arg.random_in);
        let mut remaining = self.geometry.all_planes();

        for _ in 0..MAX_COMMAND_RETRIES {
            self.replay_latched(dev, die)?;
            let copy = CopyBackLog {
                src: self.translate(dev, die, arg.src_unit),
                src_page: arg.src_page,
                random_in: random_in.clone(),
            };
            let dst = self.translate(dev, die, arg.dst_unit);

            let result = self.copy_planes(
                dev,
                die,
                arg.dst_unit,
                &dst,
                &mut remaining,
                arg.dst_page,
                &copy,
                flags,
            );
            match result {
                Ok(()) => return Ok(()),
                Err(e) => self.recover(dev, die, e, 0)?,
            }
        }

        error!("dev {dev} die {die}: copy-back to unit {} keeps failing", arg.dst_unit);
        Err(BmlError::Critical("copy-back retries exhausted"))
    }

    /// Program a page of the OTP block
    pub fn otp_write(
        &mut self,
        page: u32,
        main: &[u8],
        spare: Option<&SpareBuf>,
    ) -> Result<(), BmlError> {
        if main.len() != self.geometry.main_size {
            return Err(BmlError::InvalidParam("OTP pages are one physical page"));
        }
        let spare_bytes = spare
            .map(|s| {
                let mut bytes = vec![0xFF; self.geometry.spare_size];
                s.encode(&mut bytes).map(|()| bytes)
            })
            .transpose()
            .map_err(BmlError::InvalidParam)?;

        self.lld.write(
            0,
            &[],
            page,
            main,
            spare_bytes.as_deref(),
            LldFlags::OTP | LldFlags::ECC_ON,
        )?;
        Ok(())
    }

    /// Read a page of the OTP block
    pub fn otp_read(
        &mut self,
        page: u32,
        main: &mut [u8],
        spare: Option<&mut SpareBuf>,
    ) -> Result<(), BmlError> {
        if main.len() != self.geometry.main_size {
            return Err(BmlError::InvalidParam("OTP pages are one physical page"));
        }
        let mut spare_bytes = vec![0xFF; self.geometry.spare_size];
        self.lld.read(
            0,
            &[],
            page,
            main,
            Some(&mut spare_bytes),
            LldFlags::OTP | LldFlags::ECC_ON,
        )?;
        if let Some(spare) = spare {
            *spare = SpareBuf::decode(&spare_bytes);
        }
        Ok(())
    }

    /// Permanently write-protect the OTP block
    pub fn otp_lock(&mut self) -> Result<(), BmlError> {
        self.lld.ioctl(0, IoCtl::LockOtp)?;
        Ok(())
    }

    pub fn ioctl(&mut self, cmd: VolumeIoCtl) -> Result<IoCtlReply, BmlError> {
        let id = match cmd {
            VolumeIoCtl::Lock(id) | VolumeIoCtl::Unlock(id) | VolumeIoCtl::LockTight(id) => id,
            VolumeIoCtl::OtpStatus => return Ok(self.lld.ioctl(0, IoCtl::OtpStatus)?),
        };
        let part = *self
            .partitions
            .get(id)
            .ok_or(BmlError::InvalidParam("no such partition"))?;

        self.flush()?;

        let planes = self.geometry.planes;
        for way in 0..self.geometry.ways() {
            let (dev, die) = self.geometry.way_location(way);
            let first = self.nominal_block(dev, die, part.first_unit);
            let count = part.units * planes;

            // Replacement blocks live outside the range and are protected one by one
            let moved: Vec<(u32, u32)> = (first..first + count)
                .filter_map(|block| self.reservoir.replacement(dev, block))
                .map(|block| (block, 1))
                .collect();

            for (first, count) in std::iter::once((first, count)).chain(moved) {
                let lld_cmd = match cmd {
                    VolumeIoCtl::Lock(_) => IoCtl::Lock { first, count },
                    VolumeIoCtl::Unlock(_) => IoCtl::Unlock { first, count },
                    _ => IoCtl::LockTight { first, count },
                };
                self.lld.ioctl(dev, lld_cmd)?;
            }
        }

        if let Some(part) = self.partitions.get_mut(id) {
            match cmd {
                VolumeIoCtl::Lock(_) => part.attrs.insert(PartAttr::LOCKED),
                VolumeIoCtl::Unlock(_) => part.attrs.remove(PartAttr::LOCKED),
                _ => part.attrs.insert(PartAttr::LOCKED_TIGHT),
            }
        }
        Ok(IoCtlReply::Done)
    }

    /// Flush every die of the volume.
    ///
    /// This never takes the volume lock: holding the [super::VolumeGuard] is what makes
    /// calling it safe.
    pub fn flush(&mut self) -> Result<(), BmlError> {
        for dev in 0..self.geometry.devices {
            self.flush_device(dev)?;
        }
        Ok(())
    }
}

#[test]
fn test_split_random_in() {
    let geometry = Geometry {
        planes: 2,
        ..crate::nand::TEST_GEOMETRY
    };
    let (main, spare) = (geometry.main_size, geometry.spare_size);

    let split = split_random_in(
        &geometry,
        &[
            // Crosses from plane 0 into plane 1
            RandomIn {
                offset: main - 2,
                data: vec![1; 4],
            },
            // Crosses from the main area of plane 1 into the spare area of plane 0
            RandomIn {
                offset: 2 * main - 1,
                data: vec![2; 3],
            },
            // Spare area of plane 1
            RandomIn {
                offset: 2 * main + spare + 4,
                data: vec![3; 2],
            },
        ],
    );

    assert_eq!(
        split[0],
        [
            RandomIn {
                offset: main - 2,
                data: vec![1; 2]
            },
            RandomIn {
                offset: main,
                data: vec![2; 2]
            },
        ]
    );
    assert_eq!(
        split[1],
        [
            RandomIn {
                offset: 0,
                data: vec![1; 2]
            },
            RandomIn {
                offset: main - 1,
                data: vec![2; 1]
            },
            RandomIn {
                offset: main + 4,
                data: vec![3; 2]
            },
        ]
    );
}
