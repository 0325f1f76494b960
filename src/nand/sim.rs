//! A simulated in-memory NAND array behind the [LowLevelDriver] interface, for testing purposes.
//!
//! The simulation models the parts of real hardware that matter to the error-recovery code:
//!
//! - Program and erase commands are queued per die, up to the pipeline depth. Their status is
//!   only reported when a later command needs the slot, or when the die is flushed.
//! - When a queued command failed, the *incoming* command is rejected and the failure is
//!   reported with a minor code naming the failed planes.
//! - Faults are injected per page or per block. A block that fails a program or erase is worn
//!   out, and fails every program and erase after that.
//! - Every stored page carries a CRC standing in for ECC; a corrupted page reads back as
//!   uncorrectable.
//!
//! The driver is a cheap handle to shared state, so a test can keep a clone to inject faults
//! and inspect the command trace after handing the driver to a volume.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crc::{Crc, CRC_32_ISCSI};

use super::{
    CopyBackPlane, Geometry, IoCtl, IoCtlReply, LldError, LldFlags, LowLevelDriver, MinorError,
    ReadStatus,
};

const SIM_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Pages in the simulated OTP block
pub const OTP_PAGES: u32 = 64;

/// A failure to inject into the simulation
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Fault {
    /// The next program of this page fails, wearing out the block
    Program { dev: u32, block: u32, page: u32 },

    /// The next erase of this block fails, wearing out the block
    Erase { dev: u32, block: u32 },

    /// The stored copy of this page is corrupted beyond what ECC can fix
    Uncorrectable { dev: u32, block: u32, page: u32 },

    /// The next read of this page needs heavy ECC correction
    Disturb { dev: u32, block: u32, page: u32 },

    /// The die's read-ahead buffer goes bad; the next command or flush of the die reports it
    ReadAhead { dev: u32, die: u32 },
}

/// A command received by the simulation, as recorded in its trace
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum LldCall {
    Write {
        dev: u32,
        blocks: Vec<u32>,
        page: u32,
        flags: LldFlags,
    },
    Read {
        dev: u32,
        blocks: Vec<u32>,
        page: u32,
    },
    Erase {
        dev: u32,
        blocks: Vec<u32>,
        flags: LldFlags,
    },
    CopyBack {
        dev: u32,
        dst_blocks: Vec<u32>,
        dst_page: u32,
        flags: LldFlags,
    },
    Flush {
        dev: u32,
        die: u32,
    },
    IoCtl {
        dev: u32,
        cmd: IoCtl,
    },
}

/// A programmed page
#[derive(Debug, Clone)]
struct SimPage {
    main: Vec<u8>,
    spare: Vec<u8>,
    crc: u32,
}

impl SimPage {
    fn new(main: &[u8], spare: &[u8]) -> Self {
        Self {
            main: main.to_vec(),
            spare: spare.to_vec(),
            crc: Self::checksum(main, spare),
        }
    }

    fn checksum(main: &[u8], spare: &[u8]) -> u32 {
        let mut digest = SIM_CRC.digest();
        digest.update(main);
        digest.update(spare);
        digest.finalize()
    }

    fn is_intact(&self) -> bool {
        self.crc == Self::checksum(&self.main, &self.spare)
    }
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
enum Protection {
    #[default]
    Unlocked,
    Locked,
    LockedTight,
}

/// A block of the simulated array
#[derive(Debug, Clone)]
struct SimBlock {
    /// Programmed pages; `None` is erased
    pages: Vec<Option<SimPage>>,

    /// Has this block failed a program or erase?
    worn: bool,

    protection: Protection,
}

impl SimBlock {
    fn new(geometry: &Geometry) -> Self {
        Self {
            pages: vec![None; geometry.pages_per_block as usize],
            worn: false,
            protection: Protection::Unlocked,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum PendingKind {
    Program,
    Erase,
}

/// A command whose status has not been reported yet
#[derive(Debug, Clone)]
struct PendingOp {
    kind: PendingKind,
    blocks: Vec<u32>,
    failed: Vec<bool>,
}

impl PendingOp {
    fn any_failed(&self) -> bool {
        self.failed.iter().any(|&x| x)
    }

    /// Minor-code plane bits for this command's failures.
    ///
    /// Multi-plane commands report by position; a single-plane command reports the physical
    /// plane its block sits in.
    fn plane_bits(&self, planes: u32) -> u32 {
        if let [block] = self.blocks[..] {
            return if self.failed[0] { 1 << (block % planes) } else { 0 };
        }

        self.failed
            .iter()
            .enumerate()
            .filter(|&(_, &failed)| failed)
            .fold(0, |acc, (i, _)| acc | 1 << i)
    }
}

#[derive(Debug)]
struct SimState {
    geometry: Geometry,

    /// All blocks of all devices, device-major
    blocks: Box<[SimBlock]>,

    /// Queued commands, one queue per way
    pipelines: Box<[VecDeque<PendingOp>]>,

    faults: Vec<Fault>,
    otp: Vec<Option<SimPage>>,
    otp_locked: bool,
    calls: Vec<LldCall>,
}

/// A simulated low-level driver
#[derive(Debug, Clone)]
pub struct SimLld {
    state: Arc<Mutex<SimState>>,
}

impl SimLld {
    /// Create a fully-erased simulated array with the specified geometry
    pub fn new(geometry: Geometry) -> Self {
        let block_count = (geometry.devices * geometry.blocks_per_device()) as usize;
        let blocks = vec![SimBlock::new(&geometry); block_count].into_boxed_slice();
        let pipelines = vec![VecDeque::new(); geometry.ways() as usize].into_boxed_slice();

        let state = SimState {
            geometry,
            blocks,
            pipelines,
            faults: Vec::new(),
            otp: vec![None; OTP_PAGES as usize],
            otp_locked: false,
            calls: Vec::new(),
        };

        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn geometry(&self) -> Geometry {
        self.state().geometry
    }

    /// Arm a fault; it fires on the next matching command
    pub fn inject(&self, fault: Fault) {
        self.state().faults.push(fault);
    }

    /// Faults armed but not fired yet
    pub fn pending_faults(&self) -> Vec<Fault> {
        self.state().faults.clone()
    }

    /// Every command received so far
    pub fn calls(&self) -> Vec<LldCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Contents of a page, or `None` if it is erased
    pub fn page(&self, dev: u32, block: u32, page: u32) -> Option<(Vec<u8>, Vec<u8>)> {
        let state = self.state();
        let index = state.block_index(dev, block).ok()?;
        state.blocks[index].pages[page as usize]
            .as_ref()
            .map(|p| (p.main.clone(), p.spare.clone()))
    }

    /// Has this block failed a program or erase?
    pub fn is_worn(&self, dev: u32, block: u32) -> bool {
        let state = self.state();
        state
            .block_index(dev, block)
            .map_or(false, |index| state.blocks[index].worn)
    }

    /// Commands queued on a die whose status has not been reported
    pub fn in_flight(&self, dev: u32, die: u32) -> usize {
        let state = self.state();
        let way = state.geometry.way_index(dev, die) as usize;
        state.pipelines[way].len()
    }

    /// Write the contents of the simulated array out to a writable stream (such as a File).
    ///
    /// Each page is written as main area followed by spare area. Worn blocks are filled with
    /// 0xBD.
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let state = self.state();
        let page_len = state.geometry.main_size + state.geometry.spare_size;
        let mut buf = vec![0; page_len];

        for block in state.blocks.iter() {
            for page in block.pages.iter() {
                match page {
                    _ if block.worn => buf.fill(0xBD),
                    None => buf.fill(0xFF),
                    Some(page) => {
                        let (main, spare) = buf.split_at_mut(state.geometry.main_size);
                        main.copy_from_slice(&page.main);
                        spare.copy_from_slice(&page.spare);
                    }
                }
                write.write_all(&buf)?;
            }
        }

        Ok(())
    }
}

impl SimState {
    fn block_index(&self, dev: u32, block: u32) -> Result<usize, LldError> {
        if dev >= self.geometry.devices || block >= self.geometry.blocks_per_device() {
            return Err(LldError::InvalidParam("block out of range"));
        }
        Ok((dev * self.geometry.blocks_per_device() + block) as usize)
    }

    fn check_page(&self, page: u32) -> Result<(), LldError> {
        if page >= self.geometry.pages_per_block {
            return Err(LldError::InvalidParam("page out of range"));
        }
        Ok(())
    }

    /// Check a multi-plane block list, returning the die it addresses
    fn check_targets(&self, dev: u32, blocks: &[u32]) -> Result<u32, LldError> {
        if blocks.is_empty() || blocks.len() > self.geometry.planes as usize {
            return Err(LldError::InvalidParam("one block per plane expected"));
        }

        let die = self.geometry.die_of(blocks[0]);
        for &block in blocks {
            self.block_index(dev, block)?;
            if self.geometry.die_of(block) != die {
                return Err(LldError::InvalidParam("blocks span more than one die"));
            }
        }
        Ok(die)
    }

    fn check_unprotected(&self, dev: u32, blocks: &[u32]) -> Result<(), LldError> {
        for &block in blocks {
            let index = self.block_index(dev, block)?;
            if self.blocks[index].protection != Protection::Unlocked {
                return Err(LldError::WriteProtect);
            }
        }
        Ok(())
    }

    fn check_erased(&self, dev: u32, blocks: &[u32], page: u32) -> Result<(), LldError> {
        for &block in blocks {
            let index = self.block_index(dev, block)?;
            if self.blocks[index].pages[page as usize].is_some() {
                return Err(LldError::InvalidParam("page already programmed"));
            }
        }
        Ok(())
    }

    /// Remove a matching armed fault, returning whether there was one
    fn take_fault(&mut self, fault: Fault) -> bool {
        match self.faults.iter().position(|&f| f == fault) {
            Some(i) => {
                self.faults.remove(i);
                true
            }
            None => false,
        }
    }

    /// Make room for an incoming command (or, for a flush, empty the queue), reporting any
    /// failure among the queued commands.
    fn retire(&mut self, dev: u32, die: u32, incoming: bool) -> Result<(), LldError> {
        if self.take_fault(Fault::ReadAhead { dev, die }) {
            return Err(LldError::DeferredRead { die });
        }

        let depth = self.geometry.pipeline_depth as usize;
        let planes = self.geometry.planes;
        let queue = &mut self.pipelines[self.geometry.way_index(dev, die) as usize];

        if incoming && queue.len() < depth {
            return Ok(());
        }

        if !queue.iter().any(PendingOp::any_failed) {
            if incoming {
                queue.pop_front();
            } else {
                queue.clear();
            }
            return Ok(());
        }

        // Something failed: report everything queued, and drop the queue
        let ops: Vec<PendingOp> = queue.drain(..).collect();
        let newest_group = ops[ops.len() - 1].blocks[0] / planes;

        let mut bits = 0;
        let mut erase_only = true;
        for (i, op) in ops.iter().enumerate() {
            if !op.any_failed() {
                continue;
            }
            erase_only &= op.kind == PendingKind::Erase;

            if i + 1 == ops.len() || op.blocks[0] / planes == newest_group {
                bits |= op.plane_bits(planes);
            } else {
                bits |= MinorError::NEXT_PREV;
            }
        }

        let minor = MinorError::from_bits(bits);
        Err(match erase_only {
            true => LldError::DeferredErase(minor),
            false => LldError::DeferredWrite(minor),
        })
    }

    /// Program one page, returning whether it succeeded
    fn program(
        &mut self,
        dev: u32,
        block: u32,
        page: u32,
        main: &[u8],
        spare: &[u8],
        flags: LldFlags,
    ) -> Result<bool, LldError> {
        let fault = self.take_fault(Fault::Program { dev, block, page });
        let index = self.block_index(dev, block)?;
        let block = &mut self.blocks[index];

        if block.worn || fault {
            block.worn = true;
            return Ok(false);
        }

        // Dummy programs exist only for their status
        if !flags.contains(LldFlags::BACKUP) {
            block.pages[page as usize] = Some(SimPage::new(main, spare));
        }
        Ok(true)
    }

    /// Read one page, applying any armed read fault
    fn read_page(
        &mut self,
        dev: u32,
        block: u32,
        page: u32,
        main: &mut [u8],
        spare: &mut [u8],
    ) -> Result<ReadStatus, LldError> {
        let disturbed = self.take_fault(Fault::Disturb { dev, block, page });
        let corrupt = self.take_fault(Fault::Uncorrectable { dev, block, page });
        let index = self.block_index(dev, block)?;
        let stored = &mut self.blocks[index].pages[page as usize];

        if corrupt {
            let page = stored.get_or_insert_with(|| SimPage::new(main, spare));
            page.main[0] ^= 0x01;
        }

        match stored {
            None => {
                main.fill(0xFF);
                spare.fill(0xFF);
            }
            Some(page) if !page.is_intact() => return Err(LldError::Uncorrectable),
            Some(page) => {
                main.copy_from_slice(&page.main);
                spare.copy_from_slice(&page.spare);
            }
        }

        Ok(match disturbed {
            true => ReadStatus::Disturbed,
            false => ReadStatus::Clean,
        })
    }

    fn otp_write(&mut self, page: u32, main: &[u8], spare: Option<&[u8]>) -> Result<(), LldError> {
        if page >= OTP_PAGES || main.len() != self.geometry.main_size {
            return Err(LldError::InvalidParam("bad OTP access"));
        }
        if self.otp_locked {
            return Err(LldError::WriteProtect);
        }
        let spare_fill = vec![0xFF; self.geometry.spare_size];
        let slot = &mut self.otp[page as usize];
        if slot.is_some() {
            return Err(LldError::InvalidParam("page already programmed"));
        }
        *slot = Some(SimPage::new(main, spare.unwrap_or(&spare_fill)));
        Ok(())
    }

    fn otp_read(
        &mut self,
        page: u32,
        main: &mut [u8],
        spare: Option<&mut [u8]>,
    ) -> Result<ReadStatus, LldError> {
        if page >= OTP_PAGES || main.len() != self.geometry.main_size {
            return Err(LldError::InvalidParam("bad OTP access"));
        }
        match &self.otp[page as usize] {
            None => {
                main.fill(0xFF);
                if let Some(spare) = spare {
                    spare.fill(0xFF);
                }
            }
            Some(stored) => {
                main.copy_from_slice(&stored.main);
                if let Some(spare) = spare {
                    spare.copy_from_slice(&stored.spare);
                }
            }
        }
        Ok(ReadStatus::Clean)
    }

    fn set_protection(
        &mut self,
        dev: u32,
        first: u32,
        count: u32,
        protection: Protection,
    ) -> Result<(), LldError> {
        let end = first
            .checked_add(count)
            .ok_or(LldError::InvalidParam("block range overflows"))?;
        if count == 0 || end > self.geometry.blocks_per_device() {
            return Err(LldError::InvalidParam("block range out of bounds"));
        }

        for block in first..end {
            let index = self.block_index(dev, block)?;
            let current = &mut self.blocks[index].protection;
            if *current == Protection::LockedTight && protection != Protection::LockedTight {
                return Err(LldError::WriteProtect);
            }
            *current = protection;
        }
        Ok(())
    }
}

impl LowLevelDriver for SimLld {
    fn write(
        &mut self,
        dev: u32,
        blocks: &[u32],
        page: u32,
        main: &[u8],
        spare: Option<&[u8]>,
        flags: LldFlags,
    ) -> Result<(), LldError> {
        let mut state = self.state();
        state.calls.push(LldCall::Write {
            dev,
            blocks: blocks.to_vec(),
            page,
            flags,
        });

        if flags.contains(LldFlags::OTP) {
            return state.otp_write(page, main, spare);
        }

        let die = state.check_targets(dev, blocks)?;
        state.check_page(page)?;
        let (main_size, spare_size) = (state.geometry.main_size, state.geometry.spare_size);
        if main.len() != main_size * blocks.len()
            || spare.is_some_and(|s| s.len() != spare_size * blocks.len())
        {
            return Err(LldError::InvalidParam("buffer size does not match block count"));
        }
        state.check_unprotected(dev, blocks)?;
        if !flags.contains(LldFlags::BACKUP) {
            state.check_erased(dev, blocks, page)?;
        }

        state.retire(dev, die, true)?;

        let spare_fill = vec![0xFF; spare_size * blocks.len()];
        let spare = spare.unwrap_or(&spare_fill);
        let mut failed = Vec::with_capacity(blocks.len());
        for (i, &block) in blocks.iter().enumerate() {
            let ok = state.program(
                dev,
                block,
                page,
                &main[i * main_size..][..main_size],
                &spare[i * spare_size..][..spare_size],
                flags,
            )?;
            failed.push(!ok);
        }

        let way = state.geometry.way_index(dev, die) as usize;
        state.pipelines[way].push_back(PendingOp {
            kind: PendingKind::Program,
            blocks: blocks.to_vec(),
            failed,
        });
        Ok(())
    }

    fn read(
        &mut self,
        dev: u32,
        blocks: &[u32],
        page: u32,
        main: &mut [u8],
        spare: Option<&mut [u8]>,
        flags: LldFlags,
    ) -> Result<ReadStatus, LldError> {
        let mut state = self.state();
        state.calls.push(LldCall::Read {
            dev,
            blocks: blocks.to_vec(),
            page,
        });

        if flags.contains(LldFlags::OTP) {
            return state.otp_read(page, main, spare);
        }

        state.check_targets(dev, blocks)?;
        state.check_page(page)?;
        let (main_size, spare_size) = (state.geometry.main_size, state.geometry.spare_size);
        if main.len() != main_size * blocks.len()
            || spare.as_ref().is_some_and(|s| s.len() != spare_size * blocks.len())
        {
            return Err(LldError::InvalidParam("buffer size does not match block count"));
        }

        let mut spare_scratch = vec![0xFF; spare_size * blocks.len()];
        let spare = spare.unwrap_or(&mut spare_scratch);

        let mut status = ReadStatus::Clean;
        for (i, &block) in blocks.iter().enumerate() {
            let result = state.read_page(
                dev,
                block,
                page,
                &mut main[i * main_size..][..main_size],
                &mut spare[i * spare_size..][..spare_size],
            )?;
            if result == ReadStatus::Disturbed {
                status = ReadStatus::Disturbed;
            }
        }
        Ok(status)
    }

    fn erase(&mut self, dev: u32, blocks: &[u32], flags: LldFlags) -> Result<(), LldError> {
        let mut state = self.state();
        state.calls.push(LldCall::Erase {
            dev,
            blocks: blocks.to_vec(),
            flags,
        });

        let die = state.check_targets(dev, blocks)?;
        state.check_unprotected(dev, blocks)?;
        state.retire(dev, die, true)?;

        let mut failed = Vec::with_capacity(blocks.len());
        for &block in blocks {
            let fault = state.take_fault(Fault::Erase { dev, block });
            let index = state.block_index(dev, block)?;
            let block = &mut state.blocks[index];
            if block.worn || fault {
                block.worn = true;
                failed.push(true);
            } else {
                block.pages.fill(None);
                failed.push(false);
            }
        }

        let way = state.geometry.way_index(dev, die) as usize;
        state.pipelines[way].push_back(PendingOp {
            kind: PendingKind::Erase,
            blocks: blocks.to_vec(),
            failed,
        });
        Ok(())
    }

    fn copy_back(
        &mut self,
        dev: u32,
        planes: &[CopyBackPlane],
        flags: LldFlags,
    ) -> Result<(), LldError> {
        let mut state = self.state();
        let dst_blocks: Vec<u32> = planes.iter().map(|p| p.dst_block).collect();
        let dst_page = planes.first().map_or(0, |p| p.dst_page);
        state.calls.push(LldCall::CopyBack {
            dev,
            dst_blocks: dst_blocks.clone(),
            dst_page,
            flags,
        });

        let die = state.check_targets(dev, &dst_blocks)?;
        for plane in planes {
            state.check_page(plane.src_page)?;
            state.check_page(plane.dst_page)?;
            state.block_index(dev, plane.src_block)?;
            if state.geometry.die_of(plane.src_block) != die || plane.dst_page != dst_page {
                return Err(LldError::InvalidParam("copy-back must stay within one die and page"));
            }
        }
        state.check_unprotected(dev, &dst_blocks)?;
        state.check_erased(dev, &dst_blocks, dst_page)?;

        // Load every plane's page buffer before anything is queued
        let (main_size, spare_size) = (state.geometry.main_size, state.geometry.spare_size);
        let mut buffers = Vec::with_capacity(planes.len());
        for plane in planes {
            let mut buf = vec![0xFF; main_size + spare_size];
            let (main, spare) = buf.split_at_mut(main_size);
            state.read_page(dev, plane.src_block, plane.src_page, main, spare)?;

            for random_in in &plane.random_in {
                let dst = buf
                    .get_mut(random_in.offset..random_in.offset + random_in.data.len())
                    .ok_or(LldError::InvalidParam("random-in outside the page"))?;
                dst.copy_from_slice(&random_in.data);
            }
            buffers.push(buf);
        }

        state.retire(dev, die, true)?;

        let mut failed = Vec::with_capacity(planes.len());
        for (plane, buf) in planes.iter().zip(&buffers) {
            let (main, spare) = buf.split_at(main_size);
            let ok = state.program(dev, plane.dst_block, dst_page, main, spare, flags)?;
            failed.push(!ok);
        }

        let way = state.geometry.way_index(dev, die) as usize;
        state.pipelines[way].push_back(PendingOp {
            kind: PendingKind::Program,
            blocks: dst_blocks,
            failed,
        });
        Ok(())
    }

    fn flush_op(&mut self, dev: u32, die: u32, _flags: LldFlags) -> Result<(), LldError> {
        let mut state = self.state();
        state.calls.push(LldCall::Flush { dev, die });

        if dev >= state.geometry.devices || die >= state.geometry.dies_per_device {
            return Err(LldError::InvalidParam("die out of range"));
        }
        state.retire(dev, die, false)
    }

    fn ioctl(&mut self, dev: u32, cmd: IoCtl) -> Result<IoCtlReply, LldError> {
        let mut state = self.state();
        state.calls.push(LldCall::IoCtl { dev, cmd });

        match cmd {
            IoCtl::Lock { first, count } => {
                state.set_protection(dev, first, count, Protection::Locked)?
            }
            IoCtl::Unlock { first, count } => {
                state.set_protection(dev, first, count, Protection::Unlocked)?
            }
            IoCtl::LockTight { first, count } => {
                state.set_protection(dev, first, count, Protection::LockedTight)?
            }
            IoCtl::LockOtp => state.otp_locked = true,
            IoCtl::OtpStatus => return Ok(IoCtlReply::OtpLocked(state.otp_locked)),
        }
        Ok(IoCtlReply::Done)
    }
}
