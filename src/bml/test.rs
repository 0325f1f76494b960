use super::*;
use crate::nand::sim::{Fault, LldCall, SimLld};
use crate::nand::{
    IoCtl, LldError, MinorError, NandClass, PageUtil, RandomIn, TEST_GEOMETRY,
};
use crate::reservoir::sim::{ReservoirCall, SimReservoir};
use crate::reservoir::{
    Lookback, RefreshUpdate, Reservoir, ReservoirError, ReservoirLayout, RestoreBuffers,
    SubstituteReason, SubstituteRequest, Substitution,
};

/// Two planes, with room for 28 units and a reservoir of 8 blocks per die
const TWO_PLANE: Geometry = Geometry {
    planes: 2,
    blocks_per_die: 64,
    ..TEST_GEOMETRY
};

fn open(
    geometry: Geometry,
    reserved: u32,
    partitions: PartitionTable,
) -> anyhow::Result<(Volume, SimLld, SimReservoir)> {
    let lld = SimLld::new(geometry);
    let reservoir = SimReservoir::new(geometry, reserved);
    let volume = Volume::open(
        geometry,
        Box::new(lld.clone()),
        Box::new(reservoir.clone()),
        partitions,
    )?;
    Ok((volume, lld, reservoir))
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed))
        .collect()
}

fn program_fault(block: u32, page: u32) -> Fault {
    Fault::Program {
        dev: 0,
        block,
        page,
    }
}

/// Every program command received, as (blocks, page, flags)
fn writes(lld: &SimLld) -> Vec<(Vec<u32>, u32, LldFlags)> {
    lld.calls()
        .into_iter()
        .filter_map(|call| match call {
            LldCall::Write {
                blocks,
                page,
                flags,
                ..
            } => Some((blocks, page, flags)),
            _ => None,
        })
        .collect()
}

/// Program commands issued by the deferred error handler, as (blocks, page)
fn replayed(lld: &SimLld) -> Vec<(Vec<u32>, u32)> {
    writes(lld)
        .into_iter()
        .filter(|(_, _, flags)| flags.contains(LldFlags::RECOVERY))
        .map(|(blocks, page, _)| (blocks, page))
        .collect()
}

fn read_back(volume: &Volume, vpn: u32, pages: u32) -> anyhow::Result<Vec<u8>> {
    let page_size = volume.lock()?.geometry().virtual_page_size();
    let mut out = vec![0; page_size * pages as usize];
    volume.read(vpn, pages, &mut out, None, BmlFlags::ECC_ON)?;
    Ok(out)
}

#[test]
fn test_write_single_plane() -> anyhow::Result<()> {
    let (volume, lld, reservoir) = open(TEST_GEOMETRY, 4, PartitionTable::new())?;
    assert_eq!(volume.lock()?.units(), 28);

    let data = pattern(4 * TEST_GEOMETRY.main_size, 1);
    volume.write(0, 4, &data, None, BmlFlags::ECC_ON)?;

    let issued: Vec<(Vec<u32>, u32)> = writes(&lld)
        .into_iter()
        .map(|(blocks, page, _)| (blocks, page))
        .collect();
    assert_eq!(
        issued,
        [(vec![0], 0), (vec![0], 1), (vec![0], 2), (vec![0], 3)]
    );
    assert!(reservoir.substitutions().is_empty());

    // Every program but the last is a cache program
    let flags: Vec<LldFlags> = writes(&lld).into_iter().map(|(_, _, f)| f).collect();
    assert!(flags[..3].iter().all(|f| f.contains(LldFlags::CACHE_PROGRAM)));
    assert!(!flags[3].contains(LldFlags::CACHE_PROGRAM));

    assert_eq!(read_back(&volume, 0, 4)?, data);
    Ok(())
}

#[test]
fn test_write_with_spare() -> anyhow::Result<()> {
    let (volume, _lld, _reservoir) = open(TWO_PLANE, 8, PartitionTable::new())?;

    let data = pattern(TWO_PLANE.virtual_page_size(), 2);
    let spare = [SpareBuf::new([1, 2, 3, 4, 5, 6, 7, 8])
        .meta_ext([0xA0; 8])
        .meta_ext([0xB0; 8])];
    volume.write(0, 1, &data, Some(&spare), BmlFlags::ECC_ON)?;

    let mut out = vec![0; data.len()];
    let mut spare_out = [SpareBuf::default()];
    volume.read(0, 1, &mut out, Some(&mut spare_out), BmlFlags::ECC_ON)?;
    assert_eq!(out, data);
    assert_eq!(spare_out, spare);
    Ok(())
}

#[test]
fn test_prev_plane0_failure() -> anyhow::Result<()> {
    let (volume, lld, reservoir) = open(TWO_PLANE, 8, PartitionTable::new())?;
    lld.inject(program_fault(0, 0));

    let data = pattern(2 * TWO_PLANE.virtual_page_size(), 3);
    volume.write(0, 2, &data, None, BmlFlags::ECC_ON)?;

    assert_eq!(
        reservoir.substitutions(),
        [SubstituteRequest {
            dev: 0,
            die: 0,
            block: 0,
            page: 0,
            planes: 1,
            reason: SubstituteReason::Write,
        }]
    );
    let restores: Vec<ReservoirCall> = reservoir
        .calls()
        .into_iter()
        .filter(|call| matches!(call, ReservoirCall::Restore { .. }))
        .collect();
    assert_eq!(
        restores,
        [ReservoirCall::Restore {
            dev: 0,
            die: 0,
            which: Lookback::Previous,
            block: 0,
            page: 0,
        }]
    );

    // Only plane 0 is rewritten; its new home cannot pair with block 1
    assert_eq!(replayed(&lld), [(vec![57], 0)]);
    let issued = writes(&lld);
    let tail: Vec<(Vec<u32>, u32)> = issued[issued.len() - 2..]
        .iter()
        .map(|(blocks, page, _)| (blocks.clone(), *page))
        .collect();
    assert_eq!(tail, [(vec![57], 1), (vec![1], 1)]);

    {
        let guard = volume.lock()?;
        let tr = guard.translate(0, 0, 0);
        assert_eq!(tr.kind, SubstitutionKind::Unpaired);
        assert_eq!(tr.blocks, [57, 1]);
    }

    assert_eq!(read_back(&volume, 0, 2)?, data);
    Ok(())
}

#[test]
fn test_split_group_keeps_confirmed_pages() -> anyhow::Result<()> {
    let (volume, lld, reservoir) = open(TWO_PLANE, 8, PartitionTable::new())?;
    lld.inject(program_fault(0, 0));
    let first = pattern(2 * TWO_PLANE.virtual_page_size(), 25);
    volume.write(0, 2, &first, None, BmlFlags::ECC_ON)?;
    assert_eq!(volume.lock()?.translate(0, 0, 0).blocks, [57, 1]);

    // Plane 0's replacement fails while the planes are written one at a time
    lld.inject(program_fault(57, 3));
    let second = pattern(4 * TWO_PLANE.virtual_page_size(), 26);
    volume.write(2, 4, &second, None, BmlFlags::ECC_ON)?;
    volume.flush()?;

    // Only the failed block moves, keeping page 2 of plane 0
    let subs = reservoir.substitutions();
    assert_eq!(subs.len(), 2);
    assert_eq!((subs[1].block, subs[1].page, subs[1].planes), (0, 3, 1));
    assert_eq!(replayed(&lld), [(vec![57], 0), (vec![58], 3)]);
    assert_eq!(volume.lock()?.translate(0, 0, 0).blocks, [58, 1]);

    assert_eq!(read_back(&volume, 0, 2)?, first);
    assert_eq!(read_back(&volume, 2, 4)?, second);
    Ok(())
}

#[test]
fn test_same_group_depth_two() -> anyhow::Result<()> {
    let geometry = TWO_PLANE.pipeline_depth(2);
    let (volume, lld, reservoir) = open(geometry, 8, PartitionTable::new())?;
    lld.inject(program_fault(0, 1));

    let data = pattern(4 * geometry.virtual_page_size(), 4);
    volume.write(0, 4, &data, None, BmlFlags::ECC_ON)?;

    // Both logged pages of the group are rewritten, from the lower one up
    let subs = reservoir.substitutions();
    assert_eq!(subs.len(), 1);
    assert_eq!((subs[0].block, subs[0].page, subs[0].planes), (0, 0, 1));
    assert_eq!(replayed(&lld), [(vec![57], 0), (vec![57], 1)]);

    assert_eq!(read_back(&volume, 0, 4)?, data);
    Ok(())
}

fn check_durability(depth: u32) -> anyhow::Result<()> {
    let geometry = TWO_PLANE.pipeline_depth(depth);
    let (volume, lld, reservoir) = open(geometry, 8, PartitionTable::new())?;

    // The last page of unit 0, plane 0, and a middle page of unit 1, plane 1
    lld.inject(program_fault(0, 7));
    lld.inject(program_fault(3, 2));

    let pages = 2 * geometry.pages_per_block;
    let data = pattern(pages as usize * geometry.virtual_page_size(), 5);
    volume.write(0, pages, &data, None, BmlFlags::ECC_ON)?;
    volume.flush()?;

    assert!(lld.pending_faults().is_empty());
    assert_eq!(reservoir.substitutions().len(), 2);
    assert_eq!(reservoir.replacement(0, 0), Some(57));
    assert_eq!(reservoir.replacement(0, 3), Some(58));
    assert_eq!(lld.in_flight(0, 0), 0);

    assert_eq!(read_back(&volume, 0, pages)?, data);
    Ok(())
}

#[test]
fn test_durability_depth_one() -> anyhow::Result<()> {
    check_durability(1)
}

#[test]
fn test_durability_depth_two() -> anyhow::Result<()> {
    check_durability(2)
}

#[test]
fn test_flush_idle() -> anyhow::Result<()> {
    let (volume, lld, _reservoir) = open(TWO_PLANE, 8, PartitionTable::new())?;
    volume.flush()?;
    volume.flush()?;
    assert!(lld.calls().is_empty());
    Ok(())
}

#[test]
fn test_flush_under_guard() -> anyhow::Result<()> {
    let (volume, lld, _reservoir) = open(TEST_GEOMETRY, 4, PartitionTable::new())?;
    let data = pattern(TEST_GEOMETRY.main_size, 6);

    {
        let mut guard = volume.lock()?;
        guard.write(0, 1, &data, None, BmlFlags::ECC_ON)?;
        assert_eq!(lld.in_flight(0, 0), 1);
        assert!(!guard.die(0, 0).is_idle());

        guard.flush()?;
        assert_eq!(lld.in_flight(0, 0), 0);
        assert!(guard.die(0, 0).is_idle());
    }

    // The lock was released with the guard
    volume.flush()?;
    Ok(())
}

#[test]
fn test_read_only_partition() -> anyhow::Result<()> {
    let partitions = PartitionTable::new()
        .partition(Partition::new(1, 0, 2).attrs(PartAttr::READ_ONLY))
        .partition(Partition::new(2, 2, 26));
    let (volume, lld, _reservoir) = open(TEST_GEOMETRY, 4, partitions)?;
    let data = pattern(TEST_GEOMETRY.main_size, 7);

    assert_eq!(
        volume.write(0, 1, &data, None, BmlFlags::ECC_ON),
        Err(BmlError::WriteProtect)
    );
    // A request reaching into the read-only partition is rejected as a whole
    let two = pattern(2 * TEST_GEOMETRY.main_size, 7);
    assert_eq!(
        volume.write(15, 2, &two, None, BmlFlags::ECC_ON),
        Err(BmlError::WriteProtect)
    );
    assert_eq!(
        volume.erase(&[2, 1], BmlFlags::empty()),
        Err(BmlError::WriteProtect)
    );
    let copy = CopyBackArg {
        way: 0,
        src_unit: 4,
        src_page: 0,
        dst_unit: 0,
        dst_page: 0,
        random_in: Vec::new(),
    };
    assert_eq!(
        volume.copy_back(&[copy], BmlFlags::empty()),
        Err(BmlError::WriteProtect)
    );

    assert!(lld.calls().is_empty());
    assert!(volume.lock()?.die(0, 0).is_idle());

    // Reading is still allowed, and so is everything outside the partition
    read_back(&volume, 0, 1)?;
    volume.write(16, 1, &data, None, BmlFlags::ECC_ON)?;
    Ok(())
}

#[test]
fn test_bad_requests() -> anyhow::Result<()> {
    let (volume, _lld, _reservoir) = open(TEST_GEOMETRY, 4, PartitionTable::new())?;
    let pages = volume.lock()?.units() * TEST_GEOMETRY.pages_per_block;
    let data = pattern(TEST_GEOMETRY.main_size, 8);

    assert_eq!(
        volume.write(pages, 1, &data, None, BmlFlags::empty()),
        Err(BmlError::OutOfRange(pages))
    );
    assert!(matches!(
        volume.write(0, 2, &data, None, BmlFlags::empty()),
        Err(BmlError::InvalidParam(_))
    ));
    assert!(matches!(
        volume.write(0, 0, &[], None, BmlFlags::empty()),
        Err(BmlError::InvalidParam(_))
    ));
    assert_eq!(
        volume.erase(&[28], BmlFlags::empty()),
        Err(BmlError::OutOfRange(28))
    );

    // A reservoir that leaves no data area
    let reservoir = SimReservoir::new(TEST_GEOMETRY, 32);
    let opened = Volume::open(
        TEST_GEOMETRY,
        Box::new(SimLld::new(TEST_GEOMETRY)),
        Box::new(reservoir),
        PartitionTable::new(),
    );
    assert!(matches!(opened, Err(BmlError::InvalidParam(_))));
    Ok(())
}

#[test]
fn test_erase_plane0_failure() -> anyhow::Result<()> {
    let (volume, lld, reservoir) = open(TWO_PLANE, 8, PartitionTable::new())?;
    lld.inject(Fault::Erase { dev: 0, block: 10 });

    volume.erase(&[5], BmlFlags::empty())?;

    assert_eq!(
        reservoir.substitutions(),
        [SubstituteRequest {
            dev: 0,
            die: 0,
            block: 10,
            page: 0,
            planes: 1,
            reason: SubstituteReason::Erase,
        }]
    );
    assert_eq!(reservoir.replacement(0, 10), Some(57));
    let re_erased = lld.calls().into_iter().any(|call| {
        matches!(call, LldCall::Erase { blocks, flags, .. }
            if blocks == [57] && flags.contains(LldFlags::RECOVERY))
    });
    assert!(re_erased);
    assert_eq!(lld.in_flight(0, 0), 0);
    Ok(())
}

#[test]
fn test_zero_substitution_rewrites_group() -> anyhow::Result<()> {
    let (volume, lld, reservoir) = open(TWO_PLANE, 8, PartitionTable::new())?;
    reservoir.understate_next(1);
    lld.inject(program_fault(0, 0));

    let data = pattern(2 * TWO_PLANE.virtual_page_size(), 9);
    volume.write(0, 2, &data, None, BmlFlags::ECC_ON)?;

    // The group moved as a whole, so both planes are rewritten with one command
    assert_eq!(replayed(&lld), [(vec![58, 59], 0)]);
    assert_eq!(volume.lock()?.translate(0, 0, 0).kind, SubstitutionKind::Paired);
    assert_eq!(read_back(&volume, 0, 2)?, data);
    Ok(())
}

/// A reservoir whose table refuses every substitution
struct Rejecting(SimReservoir);

impl Reservoir for Rejecting {
    fn layout(&self, dev: u32, die: u32) -> ReservoirLayout {
        self.0.layout(dev, die)
    }

    fn replacement(&self, dev: u32, block: u32) -> Option<u32> {
        self.0.replacement(dev, block)
    }

    fn reference_block(&self, dev: u32, die: u32) -> u32 {
        self.0.reference_block(dev, die)
    }

    fn substitute(
        &mut self,
        lld: &mut dyn LowLevelDriver,
        req: &SubstituteRequest,
    ) -> Result<Substitution, ReservoirError> {
        // Recorded by the simulation, then turned down as out of range
        let req = SubstituteRequest {
            page: u32::MAX,
            ..req.clone()
        };
        self.0.substitute(lld, &req)
    }

    fn restore_previous_data(
        &mut self,
        dev: u32,
        die: u32,
        which: Lookback,
        buffers: RestoreBuffers<'_>,
    ) -> Result<(), ReservoirError> {
        self.0.restore_previous_data(dev, die, which, buffers)
    }

    fn backup_previous_data(
        &mut self,
        dev: u32,
        die: u32,
        block: u32,
        page: u32,
    ) -> Result<(), ReservoirError> {
        self.0.backup_previous_data(dev, die, block, page)
    }

    fn update_erase_refresh_list(
        &mut self,
        dev: u32,
        die: u32,
        block: u32,
        update: RefreshUpdate,
    ) -> Result<(), ReservoirError> {
        self.0.update_erase_refresh_list(dev, die, block, update)
    }
}

#[test]
fn test_rejected_substitution() -> anyhow::Result<()> {
    let lld = SimLld::new(TWO_PLANE);
    let reservoir = SimReservoir::new(TWO_PLANE, 8);
    let volume = Volume::open(
        TWO_PLANE,
        Box::new(lld.clone()),
        Box::new(Rejecting(reservoir.clone())),
        PartitionTable::new(),
    )?;
    lld.inject(program_fault(0, 0));

    let data = pattern(2 * TWO_PLANE.virtual_page_size(), 27);
    assert_eq!(
        volume.write(0, 2, &data, None, BmlFlags::ECC_ON),
        Err(BmlError::Reservoir(ReservoirError::InvalidParam(
            "page out of range"
        )))
    );

    // Passed up as is: no second substitution, and page 1 is not issued again
    assert_eq!(reservoir.substitutions().len(), 1);
    assert_eq!(writes(&lld).len(), 2);
    assert!(replayed(&lld).is_empty());
    Ok(())
}

#[test]
fn test_nested_recovery() -> anyhow::Result<()> {
    let (volume, lld, reservoir) = open(TEST_GEOMETRY, 4, PartitionTable::new())?;
    lld.inject(program_fault(0, 0));
    lld.inject(program_fault(29, 0));

    let data = pattern(2 * TEST_GEOMETRY.main_size, 10);
    volume.write(0, 2, &data, None, BmlFlags::ECC_ON)?;

    assert_eq!(reservoir.substitutions().len(), 2);
    assert_eq!(reservoir.replacement(0, 0), Some(30));
    assert!(reservoir.bad_blocks().contains(&(0, 29)));
    assert_eq!(replayed(&lld), [(vec![29], 0), (vec![30], 0)]);
    assert_eq!(read_back(&volume, 0, 2)?, data);
    Ok(())
}

#[test]
fn test_nested_recovery_failure() -> anyhow::Result<()> {
    let (volume, lld, _reservoir) = open(TEST_GEOMETRY, 4, PartitionTable::new())?;
    lld.inject(program_fault(0, 0));
    lld.inject(program_fault(29, 0));
    lld.inject(program_fault(30, 0));

    let data = pattern(2 * TEST_GEOMETRY.main_size, 11);
    assert!(matches!(
        volume.write(0, 2, &data, None, BmlFlags::ECC_ON),
        Err(BmlError::Critical(_))
    ));
    Ok(())
}

#[test]
fn test_reservoir_exhausted() -> anyhow::Result<()> {
    let (volume, lld, _reservoir) = open(TEST_GEOMETRY, 2, PartitionTable::new())?;
    lld.inject(program_fault(0, 0));

    let data = pattern(2 * TEST_GEOMETRY.main_size, 12);
    volume.write(0, 1, &data[..TEST_GEOMETRY.main_size], None, BmlFlags::ECC_ON)?;
    volume.flush()?;

    // The only free block went to unit 0; block 2 has nowhere to go
    lld.inject(program_fault(2, 0));
    assert!(matches!(
        volume.write(16, 2, &data, None, BmlFlags::ECC_ON),
        Err(BmlError::Reservoir(ReservoirError::Exhausted { die: 0 }))
    ));
    Ok(())
}

fn dual_die() -> Geometry {
    Geometry {
        dies_per_device: 2,
        ..TEST_GEOMETRY
    }
    .cache_backup(true)
}

#[test]
fn test_latched_error() -> anyhow::Result<()> {
    let geometry = dual_die();
    let (volume, lld, reservoir) = open(geometry, 4, PartitionTable::new())?;

    // vpn 1 is page 0 of unit 0 on die 1, which starts at block 32
    lld.inject(program_fault(32, 0));
    let data = pattern(2 * geometry.main_size, 13);
    volume.write(0, 2, &data, None, BmlFlags::ECC_ON)?;

    {
        let mut guard = volume.lock()?;
        guard.flush_die(0, 0)?;

        // Flushing die 1 for die 0's dummy program found the error; it waits for die 1
        assert_eq!(
            guard.die(0, 1).latched,
            Some(LldError::DeferredWrite(MinorError::from_bits(
                MinorError::PREV_PLANE0
            )))
        );
        assert!(reservoir.substitutions().is_empty());
        let dummy = writes(&lld).into_iter().any(|(blocks, page, flags)| {
            blocks == [28] && page == 7 && flags.contains(LldFlags::BACKUP)
        });
        assert!(dummy);

        guard.flush()?;
        assert_eq!(guard.die(0, 1).latched, None);
        assert!(guard.die(0, 1).is_idle());
    }

    assert_eq!(reservoir.replacement(0, 32), Some(61));
    assert_eq!(read_back(&volume, 0, 2)?, data);
    Ok(())
}

#[test]
fn test_dummy_program_failure() -> anyhow::Result<()> {
    let geometry = TEST_GEOMETRY.cache_backup(true);
    let (volume, lld, reservoir) = open(geometry, 4, PartitionTable::new())?;
    lld.inject(program_fault(28, 7));

    let data = pattern(geometry.main_size, 14);
    volume.write(0, 1, &data, None, BmlFlags::ECC_ON)?;
    volume.flush()?;

    let subs = reservoir.substitutions();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].reason, SubstituteReason::Reference);
    assert_eq!(subs[0].block, 28);
    assert_eq!(reservoir.reference_block(0, 0), 29);

    // The data itself was never in doubt
    assert_eq!(reservoir.replacement(0, 0), None);
    assert_eq!(read_back(&volume, 0, 1)?, data);

    // Later dummy programs go to the new reference block
    volume.write(1, 1, &data, None, BmlFlags::ECC_ON)?;
    volume.flush()?;
    let (blocks, page, _) = writes(&lld)
        .into_iter()
        .filter(|(_, _, flags)| flags.contains(LldFlags::BACKUP))
        .last()
        .ok_or_else(|| anyhow::anyhow!("no dummy program"))?;
    assert_eq!((blocks, page), (vec![29], 7));
    Ok(())
}

#[test]
fn test_copy_back() -> anyhow::Result<()> {
    let (volume, lld, _reservoir) = open(TEST_GEOMETRY, 4, PartitionTable::new())?;
    let data = pattern(TEST_GEOMETRY.main_size, 15);
    volume.write(0, 1, &data, None, BmlFlags::ECC_ON)?;

    let copy = CopyBackArg {
        way: 0,
        src_unit: 0,
        src_page: 0,
        dst_unit: 1,
        dst_page: 2,
        random_in: vec![RandomIn {
            offset: 4,
            data: vec![0xEE; 4],
        }],
    };
    volume.copy_back(&[copy], BmlFlags::ECC_ON)?;
    assert_eq!(lld.in_flight(0, 0), 0);

    let mut expected = data;
    expected[4..8].fill(0xEE);
    assert_eq!(read_back(&volume, 8 + 2, 1)?, expected);
    Ok(())
}

#[test]
fn test_copy_back_failure() -> anyhow::Result<()> {
    let (volume, lld, reservoir) = open(TEST_GEOMETRY, 4, PartitionTable::new())?;
    let data = pattern(TEST_GEOMETRY.main_size, 16);
    volume.write(0, 1, &data, None, BmlFlags::ECC_ON)?;
    lld.inject(program_fault(1, 0));

    let copy = CopyBackArg {
        way: 0,
        src_unit: 0,
        src_page: 0,
        dst_unit: 1,
        dst_page: 0,
        random_in: Vec::new(),
    };
    volume.copy_back(&[copy], BmlFlags::ECC_ON)?;

    assert_eq!(reservoir.replacement(0, 1), Some(29));
    let recopied = lld.calls().into_iter().any(|call| {
        matches!(call, LldCall::CopyBack { dst_blocks, flags, .. }
            if dst_blocks == [29] && flags.contains(LldFlags::RECOVERY))
    });
    assert!(recopied);
    assert_eq!(read_back(&volume, 8, 1)?, data);
    Ok(())
}

#[test]
fn test_otp() -> anyhow::Result<()> {
    let (volume, _lld, _reservoir) = open(TEST_GEOMETRY, 4, PartitionTable::new())?;
    let data = pattern(TEST_GEOMETRY.main_size, 17);
    let spare = SpareBuf::new([9; 8]);

    volume.otp_write(3, &data, Some(&spare))?;
    let mut out = vec![0; data.len()];
    let mut spare_out = SpareBuf::default();
    volume.otp_read(3, &mut out, Some(&mut spare_out))?;
    assert_eq!(out, data);
    assert_eq!(spare_out, spare);

    assert_eq!(volume.ioctl(VolumeIoCtl::OtpStatus)?, IoCtlReply::OtpLocked(false));
    volume.otp_lock()?;
    assert_eq!(volume.ioctl(VolumeIoCtl::OtpStatus)?, IoCtlReply::OtpLocked(true));
    assert_eq!(
        volume.otp_write(4, &data, None),
        Err(BmlError::WriteProtect)
    );
    Ok(())
}

#[test]
fn test_lock_partition() -> anyhow::Result<()> {
    let partitions = PartitionTable::new().partition(Partition::new(1, 2, 2));
    let (volume, lld, reservoir) = open(TEST_GEOMETRY, 4, partitions)?;

    // Unit 2 gets a replacement block, which must be locked along with the partition
    lld.inject(Fault::Erase { dev: 0, block: 2 });
    volume.erase(&[2], BmlFlags::empty())?;
    assert_eq!(reservoir.replacement(0, 2), Some(29));

    lld.clear_calls();
    volume.ioctl(VolumeIoCtl::Lock(1))?;
    let ioctls: Vec<IoCtl> = lld
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            LldCall::IoCtl { cmd, .. } => Some(cmd),
            _ => None,
        })
        .collect();
    assert_eq!(
        ioctls,
        [
            IoCtl::Lock { first: 2, count: 2 },
            IoCtl::Lock {
                first: 29,
                count: 1
            },
        ]
    );
    assert!(volume
        .lock()?
        .partitions()
        .get(1)
        .is_some_and(|p| p.attrs.contains(PartAttr::LOCKED)));

    let data = pattern(TEST_GEOMETRY.main_size, 18);
    assert_eq!(
        volume.write(16, 1, &data, None, BmlFlags::ECC_ON),
        Err(BmlError::WriteProtect)
    );

    volume.ioctl(VolumeIoCtl::Unlock(1))?;
    volume.write(16, 1, &data, None, BmlFlags::ECC_ON)?;

    assert_eq!(
        volume.ioctl(VolumeIoCtl::Lock(7)),
        Err(BmlError::InvalidParam("no such partition"))
    );
    Ok(())
}

#[test]
fn test_read_disturbance() -> anyhow::Result<()> {
    let (volume, lld, reservoir) = open(TEST_GEOMETRY, 4, PartitionTable::new())?;
    let data = pattern(TEST_GEOMETRY.main_size, 19);
    volume.write(0, 1, &data, None, BmlFlags::ECC_ON)?;

    lld.inject(Fault::Disturb {
        dev: 0,
        block: 0,
        page: 0,
    });
    assert_eq!(read_back(&volume, 0, 1)?, data);
    assert_eq!(reservoir.refresh_list(), [(0, 0)]);

    volume.erase(&[0], BmlFlags::empty())?;
    assert!(reservoir.refresh_list().is_empty());
    Ok(())
}

#[test]
fn test_read_error() -> anyhow::Result<()> {
    let geometry = Geometry {
        dies_per_device: 2,
        ..TEST_GEOMETRY
    };
    let (volume, lld, _reservoir) = open(geometry, 4, PartitionTable::new())?;
    let data = pattern(2 * geometry.main_size, 20);
    volume.write(0, 2, &data, None, BmlFlags::ECC_ON)?;

    lld.inject(Fault::Uncorrectable {
        dev: 0,
        block: 32,
        page: 0,
    });
    let mut out = vec![0; data.len()];
    assert_eq!(
        volume.read(0, 2, &mut out, None, BmlFlags::ECC_ON),
        Err(BmlError::ReadError { way_mask: 0b10 })
    );

    // Everything readable was still read
    assert_eq!(out[..geometry.main_size], data[..geometry.main_size]);
    Ok(())
}

#[test]
fn test_deferred_read_error() -> anyhow::Result<()> {
    let geometry = Geometry {
        dies_per_device: 2,
        ..TEST_GEOMETRY
    };
    let (volume, lld, reservoir) = open(geometry, 4, PartitionTable::new())?;
    let data = pattern(2 * geometry.main_size, 28);
    volume.write(0, 2, &data, None, BmlFlags::ECC_ON)?;

    // Die 1's read-ahead goes bad while its program is still in flight
    lld.inject(Fault::ReadAhead { dev: 0, die: 1 });
    assert_eq!(volume.flush(), Err(BmlError::ReadError { way_mask: 0b10 }));
    assert!(reservoir.substitutions().is_empty());
    assert!(!volume.lock()?.die(0, 1).is_idle());

    // The program itself is confirmed by the next flush
    volume.flush()?;
    assert!(volume.lock()?.die(0, 1).is_idle());
    assert_eq!(read_back(&volume, 0, 2)?, data);
    Ok(())
}

#[test]
fn test_mlc_backup() -> anyhow::Result<()> {
    let geometry = TEST_GEOMETRY.class(NandClass::Mlc);
    let (volume, _lld, reservoir) = open(geometry, 4, PartitionTable::new())?;

    let data = pattern(3 * geometry.main_size, 21);
    volume.write(8, 3, &data, None, BmlFlags::ECC_ON)?;

    let backups: Vec<ReservoirCall> = reservoir
        .calls()
        .into_iter()
        .filter(|call| matches!(call, ReservoirCall::Backup { .. }))
        .collect();
    assert_eq!(
        backups,
        [ReservoirCall::Backup {
            dev: 0,
            die: 0,
            block: 1,
            page: 1,
        }]
    );
    Ok(())
}

#[test]
fn test_set_driver() -> anyhow::Result<()> {
    let (volume, lld, _reservoir) = open(TEST_GEOMETRY, 4, PartitionTable::new())?;
    let data = pattern(TEST_GEOMETRY.main_size, 22);
    volume.write(0, 1, &data, None, BmlFlags::ECC_ON)?;

    let fresh = SimLld::new(TEST_GEOMETRY);
    volume.set_driver(Box::new(fresh.clone()))?;
    assert_eq!(lld.in_flight(0, 0), 0);
    assert!(lld.page(0, 0, 0).is_some());

    assert!(read_back(&volume, 0, 1)?.is_erased());
    assert_eq!(fresh.calls().len(), 1);
    Ok(())
}

#[test]
fn test_adjust_partitions() -> anyhow::Result<()> {
    let (volume, lld, _reservoir) = open(TEST_GEOMETRY, 4, PartitionTable::new())?;
    let data = pattern(TEST_GEOMETRY.main_size, 23);
    volume.write(0, 1, &data, None, BmlFlags::ECC_ON)?;
    assert!(!volume.lock()?.partitions_adjusted());

    let overlapping = PartitionTable::whole(28).partition(Partition::new(1, 0, 1));
    assert!(matches!(
        volume.adjust_partitions(overlapping),
        Err(BmlError::InvalidParam(_))
    ));

    let read_only =
        PartitionTable::new().partition(Partition::new(1, 0, 1).attrs(PartAttr::READ_ONLY));
    volume.adjust_partitions(read_only)?;
    assert_eq!(lld.in_flight(0, 0), 0);
    assert!(volume.lock()?.partitions_adjusted());
    assert_eq!(
        volume.write(1, 1, &data, None, BmlFlags::ECC_ON),
        Err(BmlError::WriteProtect)
    );
    Ok(())
}

#[test]
fn test_close() -> anyhow::Result<()> {
    let (volume, lld, _reservoir) = open(TEST_GEOMETRY, 4, PartitionTable::new())?;
    let data = pattern(TEST_GEOMETRY.main_size, 24);
    volume.write(0, 1, &data, None, BmlFlags::ECC_ON)?;
    assert_eq!(lld.in_flight(0, 0), 1);

    volume.close()?;
    assert_eq!(lld.in_flight(0, 0), 0);
    Ok(())
}
