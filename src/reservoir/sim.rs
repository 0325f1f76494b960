//! A simple in-memory reservoir manager, for testing purposes.
//!
//! Every die reserves a run of blocks, either at the top or the bottom of the die. The first
//! reserved block is the reference block used for dummy programs; the rest are handed out in
//! ascending order as replacements. Substitutions are real: replacement blocks are erased
//! and, when a program failed, the pages below the failing one are copied across through
//! the driver.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info};

use super::{
    Lookback, RefreshUpdate, Reservoir, ReservoirError, ReservoirLayout, ReservoirType,
    RestoreBuffers, SubstituteReason, SubstituteRequest, Substitution,
};
use crate::nand::{Geometry, LldFlags, LowLevelDriver, NandClass, PageUtil};

/// Which end of each die the reserved blocks occupy
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum Placement {
    #[default]
    Top,
    Bottom,
}

/// How a single failed plane is replaced
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum Pairing {
    /// Move only the failed block
    #[default]
    Unpaired,

    /// Always move the whole plane group to an aligned replacement group
    Paired,
}

/// A request received by the simulation, as recorded in its trace
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ReservoirCall {
    Substitute(SubstituteRequest),
    Restore {
        dev: u32,
        die: u32,
        which: Lookback,
        block: u32,
        page: u32,
    },
    Backup {
        dev: u32,
        die: u32,
        block: u32,
        page: u32,
    },
    Refresh {
        dev: u32,
        die: u32,
        block: u32,
        update: RefreshUpdate,
    },
}

#[derive(Debug)]
struct SimState {
    geometry: Geometry,
    reserved: u32,
    placement: Placement,
    pairing: Pairing,
    layout: ReservoirLayout,

    /// (device, nominal block) -> replacement block
    remap: BTreeMap<(u32, u32), u32>,

    free: BTreeSet<(u32, u32)>,
    bad: BTreeSet<(u32, u32)>,
    reference: BTreeMap<(u32, u32), u32>,
    refresh: BTreeSet<(u32, u32)>,

    /// Substitutions left that move the whole group but report a count of zero
    understate: u32,

    calls: Vec<ReservoirCall>,
}

/// A simulated reservoir manager
#[derive(Debug, Clone)]
pub struct SimReservoir {
    state: Arc<Mutex<SimState>>,
}

impl SimReservoir {
    /// Reserve `reserved` blocks at the top of every die (one of them is the reference block)
    pub fn new(geometry: Geometry, reserved: u32) -> Self {
        let kind = match geometry.class {
            NandClass::Slc => ReservoirType::Slc,
            NandClass::Mlc => ReservoirType::Mlc,
            NandClass::Flex => ReservoirType::Hybrid,
        };

        let mut state = SimState {
            geometry,
            reserved,
            placement: Placement::Top,
            pairing: Pairing::Unpaired,
            layout: ReservoirLayout {
                kind,
                first_block: 0,
                blocks: 0,
                data_offset: 0,
                data_blocks: 0,
            },
            remap: BTreeMap::new(),
            free: BTreeSet::new(),
            bad: BTreeSet::new(),
            reference: BTreeMap::new(),
            refresh: BTreeSet::new(),
            understate: 0,
            calls: Vec::new(),
        };
        state.reset();

        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Change where the reserved blocks sit (this forgets all substitutions)
    pub fn placement(self, placement: Placement) -> Self {
        {
            let mut state = self.state();
            state.placement = placement;
            state.reset();
        }
        self
    }

    /// Change how single failed planes are replaced
    pub fn pairing(self, pairing: Pairing) -> Self {
        self.state().pairing = pairing;
        self
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `count` substitutions move the whole plane group, yet report that
    /// nothing was substituted
    pub fn understate_next(&self, count: u32) {
        self.state().understate = count;
    }

    /// Every request received so far
    pub fn calls(&self) -> Vec<ReservoirCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Substitution requests received so far
    pub fn substitutions(&self) -> Vec<SubstituteRequest> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                ReservoirCall::Substitute(req) => Some(req.clone()),
                _ => None,
            })
            .collect()
    }

    /// Blocks retired so far, as (device, block)
    pub fn bad_blocks(&self) -> Vec<(u32, u32)> {
        self.state().bad.iter().copied().collect()
    }

    /// Blocks waiting for a refresh, as (device, block)
    pub fn refresh_list(&self) -> Vec<(u32, u32)> {
        self.state().refresh.iter().copied().collect()
    }

    /// Replacement blocks still available on a die
    pub fn free_blocks(&self, dev: u32, die: u32) -> usize {
        let state = self.state();
        let range = state.reservoir_range(die);
        state
            .free
            .iter()
            .filter(|&&(d, block)| d == dev && range.contains(&block))
            .count()
    }
}

impl SimState {
    /// Rebuild the layout and forget all substitutions
    fn reset(&mut self) {
        let geometry = self.geometry;
        let reserved = self.reserved.min(geometry.blocks_per_die);
        let data_blocks = geometry.blocks_per_die - reserved;
        let (first_block, data_offset) = match self.placement {
            Placement::Top => (data_blocks, 0),
            Placement::Bottom => (0, reserved),
        };

        self.layout = ReservoirLayout {
            first_block,
            blocks: reserved,
            data_offset,
            data_blocks,
            ..self.layout
        };

        self.remap.clear();
        self.free.clear();
        self.bad.clear();
        self.reference.clear();
        self.refresh.clear();

        for dev in 0..geometry.devices {
            for die in 0..geometry.dies_per_device {
                let range = self.reservoir_range(die);
                let mut blocks = range.clone();
                if let Some(reference) = blocks.next() {
                    self.reference.insert((dev, die), reference);
                }
                self.free.extend(blocks.map(|block| (dev, block)));
            }
        }
    }

    /// The reserved blocks of a die, device-relative
    fn reservoir_range(&self, die: u32) -> std::ops::Range<u32> {
        let start = self.geometry.die_start(die) + self.layout.first_block;
        start..start + self.layout.blocks
    }

    /// Take `count` free blocks from a die; more than one are taken as an aligned group
    fn allocate(&mut self, dev: u32, die: u32, count: u32) -> Option<Vec<u32>> {
        let range = self.reservoir_range(die);
        let first = range.clone().find(|&block| {
            (count == 1 || block % count == 0)
                && (block..block + count)
                    .all(|b| range.contains(&b) && self.free.contains(&(dev, b)))
        })?;

        let blocks: Vec<u32> = (first..first + count).collect();
        for &block in &blocks {
            self.free.remove(&(dev, block));
        }
        Some(blocks)
    }

    fn current(&self, dev: u32, nominal: u32) -> u32 {
        self.remap.get(&(dev, nominal)).copied().unwrap_or(nominal)
    }

    /// Prepare new homes for `targets`: erase them and, for a failed program, bring over
    /// every page below the failing one.
    fn relocate(
        &self,
        lld: &mut dyn LowLevelDriver,
        req: &SubstituteRequest,
        targets: &[u32],
        blocks: &[u32],
    ) -> Result<(), ReservoirError> {
        for &block in blocks {
            lld.erase(req.dev, &[block], LldFlags::empty())?;
        }
        lld.flush_op(req.dev, req.die, LldFlags::empty())?;

        if req.reason != SubstituteReason::Write {
            return Ok(());
        }

        let mut main = vec![0; self.geometry.main_size];
        let mut spare = vec![0; self.geometry.spare_size];
        for (&nominal, &block) in targets.iter().zip(blocks) {
            let old = self.current(req.dev, nominal);
            for page in 0..req.page {
                lld.read(
                    req.dev,
                    &[old],
                    page,
                    &mut main,
                    Some(&mut spare),
                    LldFlags::ECC_ON,
                )?;
                if main.is_erased() && spare.is_erased() {
                    continue;
                }
                lld.write(req.dev, &[block], page, &main, Some(&spare), LldFlags::ECC_ON)?;
            }
        }
        lld.flush_op(req.dev, req.die, LldFlags::empty())?;
        Ok(())
    }

    /// Allocate and prepare replacement blocks, retiring any that fail along the way
    fn allocate_prepared(
        &mut self,
        lld: &mut dyn LowLevelDriver,
        req: &SubstituteRequest,
        targets: &[u32],
        count: u32,
    ) -> Result<Vec<u32>, ReservoirError> {
        loop {
            let blocks = self
                .allocate(req.dev, req.die, count)
                .ok_or(ReservoirError::Exhausted { die: req.die })?;

            match self.relocate(lld, req, targets, &blocks) {
                Ok(()) => return Ok(blocks),
                Err(ReservoirError::Lld(e)) if e.deferred().is_some() => {
                    debug!("replacement blocks {blocks:?} failed ({e}); retiring them");
                    self.bad.extend(blocks.iter().map(|&b| (req.dev, b)));
                }
                Err(e) => {
                    self.free.extend(blocks.iter().map(|&b| (req.dev, b)));
                    return Err(e);
                }
            }
        }
    }
}

impl Reservoir for SimReservoir {
    fn layout(&self, _dev: u32, _die: u32) -> ReservoirLayout {
        self.state().layout
    }

    fn replacement(&self, dev: u32, block: u32) -> Option<u32> {
        self.state().remap.get(&(dev, block)).copied()
    }

    fn reference_block(&self, dev: u32, die: u32) -> u32 {
        let state = self.state();
        state
            .reference
            .get(&(dev, die))
            .copied()
            .unwrap_or_else(|| state.reservoir_range(die).start)
    }

    fn substitute(
        &mut self,
        lld: &mut dyn LowLevelDriver,
        req: &SubstituteRequest,
    ) -> Result<Substitution, ReservoirError> {
        let mut state = self.state();
        state.calls.push(ReservoirCall::Substitute(req.clone()));

        let geometry = state.geometry;
        if req.dev >= geometry.devices || req.die >= geometry.dies_per_device {
            return Err(ReservoirError::InvalidParam("no such die"));
        }
        if req.page >= geometry.pages_per_block {
            return Err(ReservoirError::InvalidParam("page out of range"));
        }

        if req.reason == SubstituteReason::Reference {
            let blocks = state.allocate_prepared(lld, req, &[], 1)?;
            let old = state.reference.insert((req.dev, req.die), blocks[0]);
            if let Some(old) = old {
                state.bad.insert((req.dev, old));
            }
            info!(
                "dev {} die {}: reference block moved to {}",
                req.dev, req.die, blocks[0]
            );
            return Ok(Substitution {
                replaced: old.into_iter().collect(),
                count: 1,
            });
        }

        let in_data_area = req
            .block
            .checked_sub(geometry.die_start(req.die))
            .is_some_and(|rel| rel < geometry.blocks_per_die && state.layout.is_data(rel));
        if !in_data_area {
            return Err(ReservoirError::InvalidParam("block is not in the data area"));
        }

        let planes = geometry.planes;
        let base = req.block - req.block % planes;
        let understate = state.understate > 0;
        let whole_group = understate || state.pairing == Pairing::Paired || req.planes >= planes;
        let targets: Vec<u32> = match whole_group {
            true => (base..base + planes).collect(),
            false => vec![req.block],
        };

        let blocks = state.allocate_prepared(lld, req, &targets, targets.len() as u32)?;
        for (&nominal, &block) in targets.iter().zip(&blocks) {
            let old = state.current(req.dev, nominal);
            state.bad.insert((req.dev, old));
            state.remap.insert((req.dev, nominal), block);
        }
        info!(
            "dev {} die {}: blocks {targets:?} replaced by {blocks:?}",
            req.dev, req.die
        );

        let count = if understate {
            state.understate -= 1;
            0
        } else if whole_group {
            planes
        } else {
            planes - 1
        };

        Ok(Substitution {
            replaced: targets,
            count,
        })
    }

    fn restore_previous_data(
        &mut self,
        dev: u32,
        die: u32,
        which: Lookback,
        buffers: RestoreBuffers<'_>,
    ) -> Result<(), ReservoirError> {
        self.state().calls.push(ReservoirCall::Restore {
            dev,
            die,
            which,
            block: buffers.block,
            page: buffers.page,
        });
        Ok(())
    }

    fn backup_previous_data(
        &mut self,
        dev: u32,
        die: u32,
        block: u32,
        page: u32,
    ) -> Result<(), ReservoirError> {
        self.state().calls.push(ReservoirCall::Backup {
            dev,
            die,
            block,
            page,
        });
        Ok(())
    }

    fn update_erase_refresh_list(
        &mut self,
        dev: u32,
        die: u32,
        block: u32,
        update: RefreshUpdate,
    ) -> Result<(), ReservoirError> {
        let mut state = self.state();
        state.calls.push(ReservoirCall::Refresh {
            dev,
            die,
            block,
            update,
        });
        match update {
            RefreshUpdate::Add => state.refresh.insert((dev, block)),
            RefreshUpdate::Remove => state.refresh.remove(&(dev, block)),
        };
        Ok(())
    }
}
