//! The deferred error handler.
//!
//! A die reports that a program or erase failed only when a later command is issued, or
//! when it is flushed. By then the command that failed is known only through the die's
//! lookback logs. Recovery works out which plane group(s) the minor code points at, has the
//! reservoir move them, and replays the logged operations at the new location:
//!
//! 1. Decode the minor code against the previous and next-previous logs into a list of
//!    failed plane groups, oldest first.
//! 2. For each group, ask the reservoir for a substitution, then translate the group again.
//! 3. Replay every log on that group, restricted to the planes that moved, and flush to
//!    confirm the replay.
//!
//! A replay may fail in turn. That is recovered from once more; a failure during that
//! second recovery is critical.

use log::{debug, error, info, warn};

use super::die::{LogKind, OpLog};
use super::translate::unpaired_plane;
use super::VolumeContext;
use crate::error::BmlError;
use crate::nand::{LldError, LldFlags, MinorError, PlaneMask};
use crate::reservoir::{
    Lookback, ReservoirType, RestoreBuffers, SubstituteReason, SubstituteRequest,
};

/// How many recoveries may be started from within a recovery
pub(crate) const MAX_NESTED_RECOVERY: u32 = 1;

/// A plane group whose logged operations must be moved and replayed
#[derive(Debug, Clone, Eq, PartialEq)]
struct FailedGroup {
    unit: u32,
    nominal: u32,

    /// Planes reported as failed
    planes: PlaneMask,

    /// The lowest page that must be rewritten; the reservoir preserves the pages below it
    page: u32,

    reason: SubstituteReason,

    /// Logs to replay, oldest first
    replay: Vec<Lookback>,
}

impl FailedGroup {
    fn new(log: &OpLog, planes: PlaneMask, which: Lookback) -> Self {
        Self {
            unit: log.unit,
            nominal: log.nominal,
            planes,
            page: log.page,
            reason: match log.is_erase() {
                true => SubstituteReason::Erase,
                false => SubstituteReason::Write,
            },
            replay: vec![which],
        }
    }

    /// Also replay the older log on the same group, from the lower of the two pages. Planes
    /// addressed one at a time are all suspect, since either command may have been the one
    /// that failed; callers only do this when both logs sit at the same page, so that every
    /// moved plane has a log to replay there.
    fn absorb(&mut self, older: &OpLog, split: bool) {
        if split {
            self.planes = self.planes.union(older.planes);
        }
        self.page = self.page.min(older.page);
        if !older.is_erase() {
            self.reason = SubstituteReason::Write;
        }
        self.replay.insert(0, Lookback::NextPrevious);
    }
}

/// Work out which plane groups a minor code refers to.
///
/// Plane bits of a multi-plane command are positional; a single-plane command has only one
/// plane to blame, whatever bit the driver set for it.
///
/// With a pipeline one command deep the driver has confirmed the next-previous operation
/// before the previous one was accepted, so only the previous log is replayed. Deeper
/// pipelines leave both unconfirmed: on the same group they are replayed together, except
/// when single planes were written at different pages. Each of those is then moved on its
/// own, so the pages below each log stay where they are.
fn plan_recovery(
    minor: MinorError,
    prev: &OpLog,
    next_prev: &OpLog,
    planes: u32,
    pipeline_depth: u32,
) -> Result<Vec<FailedGroup>, BmlError> {
    let reported = minor.prev_planes();
    let same_group = prev.same_group(next_prev);
    let mut groups = Vec::new();

    if !reported.is_empty() || (minor.next_prev && same_group) {
        if prev.is_empty() {
            return Err(BmlError::Critical("deferred error without a logged operation"));
        }

        let failed = match prev.is_single_plane(planes) {
            true => prev.planes,
            false => reported.intersect(prev.planes),
        };
        let failed = match failed.is_empty() {
            true if reported.is_empty() => next_prev.planes,
            true => prev.planes,
            false => failed,
        };

        let mut group = FailedGroup::new(prev, failed, Lookback::Previous);
        if same_group && pipeline_depth > 1 {
            let split = prev.is_single_plane(planes) || next_prev.is_single_plane(planes);
            match split && next_prev.page != prev.page {
                true => groups.push(FailedGroup::new(
                    next_prev,
                    next_prev.planes,
                    Lookback::NextPrevious,
                )),
                false => group.absorb(next_prev, split),
            }
        }
        groups.push(group);
    }

    if minor.next_prev && !same_group {
        if next_prev.is_empty() {
            return Err(BmlError::Critical("deferred error without a logged operation"));
        }
        groups.insert(
            0,
            FailedGroup::new(next_prev, next_prev.planes, Lookback::NextPrevious),
        );
    }

    Ok(groups)
}

/// Move the status of a dummy program into the dummy bits of the minor code.
///
/// Plane bits from the flush after a dummy program belong to the dummy itself. A real
/// operation still queued ahead of it can only show up as the next-previous bit, and is
/// blamed on every plane of the previous log.
fn dummy_status(err: LldError) -> LldError {
    let shift = |minor: MinorError| {
        let shifted = minor.into_dummy();
        match minor.next_prev {
            true => MinorError {
                prev_plane0: true,
                prev_plane1: true,
                ..shifted
            },
            false => shifted,
        }
    };

    match err {
        LldError::DeferredWrite(minor) => LldError::DeferredWrite(shift(minor)),
        LldError::DeferredErase(minor) => LldError::DeferredErase(shift(minor)),
        e => e,
    }
}

impl VolumeContext {
    /// Handle an error reported by the driver for a die, recovering from it if possible
    pub(super) fn recover(
        &mut self,
        dev: u32,
        die: u32,
        err: LldError,
        depth: u32,
    ) -> Result<(), BmlError> {
        match err {
            LldError::DeferredWrite(minor) | LldError::DeferredErase(minor) => {
                warn!("dev {dev} die {die}: {err}");
                self.recover_minor(dev, die, minor, depth)
            }
            LldError::DeferredRead { .. } => Err(BmlError::ReadError {
                way_mask: 1 << self.geometry.way_index(dev, die),
            }),
            e => Err(e.into()),
        }
    }

    fn recover_minor(
        &mut self,
        dev: u32,
        die: u32,
        minor: MinorError,
        depth: u32,
    ) -> Result<(), BmlError> {
        if !minor.dummy_planes().is_empty() {
            self.replace_reference(dev, die)?;
        }

        let (prev, next_prev) = self.die_mut(dev, die).take_logs();
        let groups = plan_recovery(
            minor,
            &prev,
            &next_prev,
            self.geometry.planes,
            self.geometry.pipeline_depth,
        )?;

        let mut pending = groups.len();
        for group in &groups {
            self.replace_group(dev, die, group, &prev, &next_prev, depth)?;
            pending -= 1;
            debug!("dev {dev} die {die}: {pending} replacement(s) left");
        }
        Ok(())
    }

    /// Give the die a new reference block after a dummy program failed
    fn replace_reference(&mut self, dev: u32, die: u32) -> Result<(), BmlError> {
        let req = SubstituteRequest {
            dev,
            die,
            block: self.reservoir.reference_block(dev, die),
            page: 0,
            planes: 1,
            reason: SubstituteReason::Reference,
        };
        warn!("dev {dev} die {die}: dummy program of block {} failed", req.block);
        self.reservoir.substitute(self.lld.as_mut(), &req)?;
        Ok(())
    }

    fn replace_group(
        &mut self,
        dev: u32,
        die: u32,
        group: &FailedGroup,
        prev: &OpLog,
        next_prev: &OpLog,
        depth: u32,
    ) -> Result<(), BmlError> {
        let planes = self.geometry.planes;
        let all_planes = self.geometry.all_planes();

        // One failed plane of several is named by its exact block
        let block = match group.planes.first() {
            Some(plane) if group.planes.count() == 1 && planes > 1 => group.nominal + plane,
            _ => group.nominal,
        };
        let req = SubstituteRequest {
            dev,
            die,
            block,
            page: group.page,
            planes: group.planes.count(),
            reason: group.reason,
        };
        let sub = self.reservoir.substitute(self.lld.as_mut(), &req)?;

        let moved = match sub.count {
            0 => {
                warn!(
                    "dev {dev} die {die}: no substitution reported for block {block}, \
                     rewriting the whole group"
                );
                all_planes
            }
            count if count == planes => all_planes,
            _ => PlaneMask::single(unpaired_plane(block, planes)),
        };

        let tr = self.translate(dev, die, group.unit);
        info!(
            "dev {dev} die {die}: unit {} now at {:?} ({:?}), replaying planes {:#b}",
            group.unit,
            &tr.blocks[..planes as usize],
            tr.kind,
            moved.bits()
        );

        for &which in &group.replay {
            let log = match which {
                Lookback::Previous => prev,
                Lookback::NextPrevious => next_prev,
            };
            let replay_planes = log.planes.intersect(moved);
            if !replay_planes.is_empty() {
                self.replay(dev, die, which, log, replay_planes, depth)?;
            }
        }
        Ok(())
    }

    /// Issue a logged operation again at its group's current location, and confirm it
    fn replay(
        &mut self,
        dev: u32,
        die: u32,
        which: Lookback,
        log: &OpLog,
        planes: PlaneMask,
        depth: u32,
    ) -> Result<(), BmlError> {
        let tr = self.translate(dev, die, log.unit);
        let flags = log.flags.difference(LldFlags::CACHE_PROGRAM) | LldFlags::RECOVERY;
        let mut remaining = planes;

        let issued = match &log.kind {
            Some(LogKind::Write) => {
                let mut main = log.main.clone();
                let mut spare = log.spare.clone();
                self.reservoir.restore_previous_data(
                    dev,
                    die,
                    which,
                    RestoreBuffers {
                        block: tr.nominal,
                        page: log.page,
                        main: &mut main,
                        spare: &mut spare,
                    },
                )?;
                self.write_planes(
                    dev,
                    die,
                    log.unit,
                    &tr,
                    &mut remaining,
                    log.page,
                    &main,
                    spare.as_ref(),
                    flags,
                )
            }
            Some(LogKind::Erase) => {
                self.erase_planes(dev, die, log.unit, &tr, &mut remaining, flags)
            }
            Some(LogKind::CopyBack(copy)) => self.copy_planes(
                dev,
                die,
                log.unit,
                &tr,
                &mut remaining,
                log.page,
                copy,
                flags,
            ),
            None => return Ok(()),
        };

        let confirmed = issued.and_then(|()| self.lld.flush_op(dev, die, LldFlags::empty()));
        match confirmed {
            Ok(()) => {
                debug!(
                    "dev {dev} die {die}: replayed {which:?} log of unit {} page {}",
                    log.unit, log.page
                );
                self.die_mut(dev, die).clear_logs();
                Ok(())
            }
            Err(e) if e.deferred().is_some() && log.is_erase() => {
                error!("dev {dev} die {die}: re-erase of unit {} failed ({e})", log.unit);
                Err(BmlError::EraseError { block: tr.nominal })
            }
            Err(e) if e.deferred().is_some() => {
                if depth >= MAX_NESTED_RECOVERY {
                    error!("dev {dev} die {die}: rewrite failed again during recovery ({e})");
                    return Err(BmlError::Critical("rewrite failed during recovery"));
                }
                warn!("dev {dev} die {die}: rewrite failed ({e}), recovering again");
                self.recover(dev, die, e, depth + 1)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replay an error latched while flushing the other die, in place of a real command
    pub(super) fn replay_latched(&mut self, dev: u32, die: u32) -> Result<(), BmlError> {
        match self.die_mut(dev, die).latched.take() {
            Some(err) => {
                debug!("dev {dev} die {die}: replaying latched {err}");
                self.recover(dev, die, err, 0)
            }
            None => Ok(()),
        }
    }

    /// Flush the other die of a dual-die device before a dummy program, keeping any error
    /// it reports for later
    fn latch_opposite(&mut self, dev: u32, die: u32) {
        let state = self.die(dev, die);
        if state.is_idle() || state.latched.is_some() {
            return;
        }

        match self.lld.flush_op(dev, die, LldFlags::empty()) {
            Ok(()) => self.die_mut(dev, die).clear_logs(),
            Err(e) => {
                warn!("dev {dev} die {die}: {e}, latched until the die is next used");
                self.die_mut(dev, die).latched = Some(e);
            }
        }
    }

    /// Program the reference block to force out the status of the operations before it
    fn dummy_program(&mut self, dev: u32, die: u32) -> Result<(), LldError> {
        let block = self.reservoir.reference_block(dev, die);
        let page = match self.layout(dev, die).kind {
            ReservoirType::Slc => self.geometry.pages_per_block - 1,
            ReservoirType::Mlc | ReservoirType::Hybrid => self.geometry.last_lsb_page(),
        };

        debug!("dev {dev} die {die}: dummy program of block {block} page {page}");
        self.lld
            .write(dev, &[block], page, &self.dummy, None, LldFlags::BACKUP)?;
        self.lld
            .flush_op(dev, die, LldFlags::empty())
            .map_err(dummy_status)
    }

    /// Wait for everything issued to a die, recovering from any error it reports
    pub(crate) fn flush_die(&mut self, dev: u32, die: u32) -> Result<(), BmlError> {
        self.replay_latched(dev, die)?;

        let state = self.die(dev, die);
        if state.is_idle() {
            return Ok(());
        }

        let needs_dummy = self.geometry.requires_backup_program()
            && matches!(
                state.prev.kind,
                Some(LogKind::Write | LogKind::CopyBack(_))
            );

        debug!("dev {dev} die {die}: flushing (dummy program: {needs_dummy})");
        if needs_dummy && self.geometry.dies_per_device == 2 {
            self.latch_opposite(dev, 1 - die);
        }

        let result = match needs_dummy {
            true => self.dummy_program(dev, die),
            false => self.lld.flush_op(dev, die, LldFlags::empty()),
        };

        match result {
            Ok(()) => {
                self.die_mut(dev, die).clear_logs();
                Ok(())
            }
            Err(e) => self.recover(dev, die, e, 0),
        }
    }

    /// Flush every die of a device
    pub(crate) fn flush_device(&mut self, dev: u32) -> Result<(), BmlError> {
        for die in 0..self.geometry.dies_per_device {
            self.flush_die(dev, die)?;
        }
        Ok(())
    }
}
