//! Per-die pipeline state.
//!
//! A die reports the status of a program or erase only when a later command arrives, so the
//! last one or two operations issued to it must be kept until they are confirmed. Each log
//! owns a shadow copy of the data it wrote; callers are free to reuse their buffers as soon
//! as a call returns.

use std::mem;

use super::translate::Translation;
use crate::nand::{LldError, LldFlags, PlaneMask, RandomIn, SpareBuf, MAX_PLANES};

/// What a copy-back needs to be issued again
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CopyBackLog {
    /// Where the source group lived when the copy was issued
    pub src: Translation,
    pub src_page: u32,

    /// Physical random-in ranges of each plane
    pub random_in: [Vec<RandomIn>; MAX_PLANES as usize],
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum LogKind {
    Write,
    Erase,
    CopyBack(CopyBackLog),
}

/// One logged operation
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct OpLog {
    /// `None` when nothing is logged
    pub kind: Option<LogKind>,

    pub unit: u32,

    /// Nominal block of plane 0 of the group
    pub nominal: u32,

    pub page: u32,
    pub planes: PlaneMask,
    pub flags: LldFlags,

    /// The whole virtual page, one physical page per plane
    pub main: Vec<u8>,
    pub spare: Option<SpareBuf>,
}

impl OpLog {
    pub fn is_empty(&self) -> bool {
        self.kind.is_none()
    }

    pub fn is_erase(&self) -> bool {
        self.kind == Some(LogKind::Erase)
    }

    /// Did this operation address a single plane of a multi-plane group?
    pub fn is_single_plane(&self, planes: u32) -> bool {
        planes > 1 && self.planes.count() == 1
    }

    /// Do both logs hold an operation on the same plane group?
    pub fn same_group(&self, other: &OpLog) -> bool {
        !self.is_empty() && !other.is_empty() && self.nominal == other.nominal
    }

    /// Forget the operation, keeping the buffer allocation around
    fn clear(&mut self) {
        self.kind = None;
        self.planes = PlaneMask::EMPTY;
        self.main.clear();
        self.spare = None;
    }

    fn fill(&mut self, kind: LogKind, unit: u32, nominal: u32, page: u32, planes: PlaneMask) {
        self.kind = Some(kind);
        self.unit = unit;
        self.nominal = nominal;
        self.page = page;
        self.planes = planes;
        self.flags = LldFlags::empty();
        self.main.clear();
        self.spare = None;
    }
}

/// The pipeline state of one die
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct DieState {
    pub prev: OpLog,
    pub next_prev: OpLog,

    /// An error found while flushing on behalf of the other die of the device; it is replayed
    /// in place of the next command issued here
    pub latched: Option<LldError>,
}

impl DieState {
    /// Is there nothing on this die whose status is still unknown?
    pub fn is_idle(&self) -> bool {
        self.prev.is_empty() && self.next_prev.is_empty() && self.latched.is_none()
    }

    /// Move the previous log back one slot, returning the slot for the new operation
    fn shift(&mut self) -> &mut OpLog {
        mem::swap(&mut self.prev, &mut self.next_prev);
        &mut self.prev
    }

    /// Record a program accepted by the driver
    #[allow(clippy::too_many_arguments)]
    pub fn log_write(
        &mut self,
        unit: u32,
        nominal: u32,
        page: u32,
        planes: PlaneMask,
        flags: LldFlags,
        main: &[u8],
        spare: Option<&SpareBuf>,
    ) {
        let log = self.shift();
        log.fill(LogKind::Write, unit, nominal, page, planes);
        log.flags = flags;
        log.main.extend_from_slice(main);
        log.spare = spare.cloned();
    }

    /// Record an erase accepted by the driver
    pub fn log_erase(&mut self, unit: u32, nominal: u32, planes: PlaneMask, flags: LldFlags) {
        let log = self.shift();
        log.fill(LogKind::Erase, unit, nominal, 0, planes);
        log.flags = flags;
    }

    /// Record a copy-back accepted by the driver
    pub fn log_copy_back(
        &mut self,
        unit: u32,
        nominal: u32,
        page: u32,
        planes: PlaneMask,
        flags: LldFlags,
        copy: CopyBackLog,
    ) {
        let log = self.shift();
        log.fill(LogKind::CopyBack(copy), unit, nominal, page, planes);
        log.flags = flags;
    }

    /// Everything issued so far is confirmed
    pub fn clear_logs(&mut self) {
        self.prev.clear();
        self.next_prev.clear();
    }

    /// Take both logs for recovery, as (previous, next-previous)
    pub fn take_logs(&mut self) -> (OpLog, OpLog) {
        (mem::take(&mut self.prev), mem::take(&mut self.next_prev))
    }
}

#[test]
fn test_log_shift() {
    let mut die = DieState::default();
    assert!(die.is_idle());

    let full = PlaneMask::full(2);
    die.log_write(3, 6, 0, full, LldFlags::CACHE_PROGRAM, &[1; 8], None);
    die.log_write(3, 6, 1, full, LldFlags::empty(), &[2; 8], None);
    assert!(!die.is_idle());
    assert_eq!(die.prev.page, 1);
    assert_eq!(die.prev.main, [2; 8]);
    assert_eq!(die.next_prev.page, 0);
    assert_eq!(die.next_prev.flags, LldFlags::CACHE_PROGRAM);
    assert!(die.prev.same_group(&die.next_prev));

    // The oldest log is reused for the newest operation
    die.log_erase(4, 8, full, LldFlags::empty());
    assert!(die.prev.is_erase());
    assert!(die.prev.main.is_empty());
    assert_eq!(die.next_prev.page, 1);
    assert!(!die.prev.same_group(&die.next_prev));

    let (prev, next_prev) = die.take_logs();
    assert!(prev.is_erase());
    assert_eq!(next_prev.unit, 3);
    assert!(die.is_idle());
}

#[test]
fn test_single_plane_log() {
    let mut die = DieState::default();
    die.log_write(0, 0, 2, PlaneMask::single(1), LldFlags::empty(), &[0; 8], None);
    assert!(die.prev.is_single_plane(2));
    assert!(!die.prev.is_single_plane(1));
    die.clear_logs();
    assert!(die.is_idle());
}
