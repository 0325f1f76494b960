//! Run workloads through the block management layer against a simulated NAND array.
//!
//! Faults are injected at random into the pages and blocks a workload is about to touch, so
//! the deferred error handling gets exercised end to end. Every workload checks what it wrote
//! (or erased) at the end.

use std::fs::File;
use std::path::PathBuf;

use anyhow::{ensure, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};
use rand::prelude::*;
use simplelog::*;
use time::macros::format_description;

use flex_bml::bml::{BmlFlags, PartitionTable, Volume};
use flex_bml::nand::sim::{Fault, SimLld};
use flex_bml::nand::{Geometry, NandClass, PageUtil};
use flex_bml::reservoir::sim::{Pairing, SimReservoir};

#[derive(ValueEnum, Debug, Copy, Clone)]
enum Class {
    Slc,
    Mlc,
    Flex,
}

impl From<Class> for NandClass {
    fn from(value: Class) -> Self {
        match value {
            Class::Slc => NandClass::Slc,
            Class::Mlc => NandClass::Mlc,
            Class::Flex => NandClass::Flex,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write random data to randomly chosen units, then read it all back
    Workload {
        /// How many units to write
        #[clap(long, default_value_t = 32)]
        units: u32,

        /// Chance of a program fault in each page written, per thousand
        #[clap(long, default_value_t = 4)]
        fault_rate: u32,
    },

    /// Fill randomly chosen units, erase them, and check they read back erased
    Erase {
        /// How many units to erase
        #[clap(long, default_value_t = 32)]
        units: u32,

        /// Chance of an erase fault in each block erased, per thousand
        #[clap(long, default_value_t = 50)]
        fault_rate: u32,
    },
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// Layout of the NAND to simulate, as DEVICESxDIESxPLANESxBLOCKSxPAGESxBYTES
    #[clap(long, default_value = "1x2x2x256x64x2048")]
    layout: Geometry,

    /// Blocks set aside on each die for replacements
    #[clap(long, default_value_t = 24)]
    reserved: u32,

    /// Operations each die accepts before reporting the status of the oldest
    #[clap(long, default_value_t = 1)]
    depth: u32,

    #[clap(long, value_enum, default_value_t = Class::Slc)]
    class: Class,

    /// Confirm cache programs with dummy programs of the reference block
    #[clap(long)]
    backup: bool,

    /// Always replace whole plane groups
    #[clap(long)]
    paired: bool,

    /// Seed for data and fault placement
    #[clap(long, default_value_t = 7)]
    seed: u64,

    #[clap(short, long)]
    verbose: bool,

    /// Write the simulated array out to this file when done
    #[clap(long)]
    dump: Option<PathBuf>,

    #[clap(subcommand)]
    cmd: Command,
}

/// What a workload needs to address a volume
struct Target<'a> {
    volume: &'a Volume,
    lld: &'a SimLld,
    geometry: Geometry,
    pages_per_unit: u32,
}

impl<'a> Target<'a> {
    fn new(volume: &'a Volume, lld: &'a SimLld) -> Result<Self> {
        let ctx = volume.lock()?;
        Ok(Self {
            volume,
            lld,
            geometry: *ctx.geometry(),
            pages_per_unit: ctx.pages_per_unit(),
        })
    }

    fn unit_size(&self) -> usize {
        self.geometry.virtual_page_size() * self.pages_per_unit as usize
    }

    /// Pick `count` distinct units at random
    fn choose_units(&self, rng: &mut SmallRng, count: u32) -> Result<Vec<u32>> {
        let available = self.volume.lock()?.units();
        ensure!(count <= available, "the volume only has {available} units");

        let mut units: Vec<u32> = (0..available).collect();
        units.shuffle(rng);
        units.truncate(count as usize);
        Ok(units)
    }

    /// The physical blocks a unit currently occupies, as (device, block)
    fn blocks_of(&self, unit: u32) -> Result<Vec<(u32, u32)>> {
        let ctx = self.volume.lock()?;
        let mut blocks = Vec::new();
        for way in 0..self.geometry.ways() {
            let (dev, die) = self.geometry.way_location(way);
            let tr = ctx.translate(dev, die, unit);
            let planes = &tr.blocks[..self.geometry.planes as usize];
            blocks.extend(planes.iter().map(|&block| (dev, block)));
        }
        Ok(blocks)
    }

    fn write_unit(&self, unit: u32, data: &[u8]) -> Result<()> {
        let vpn = unit * self.pages_per_unit;
        self.volume
            .write(vpn, self.pages_per_unit, data, None, BmlFlags::ECC_ON)?;
        Ok(())
    }

    fn read_unit(&self, unit: u32) -> Result<Vec<u8>> {
        let mut data = vec![0; self.unit_size()];
        let vpn = unit * self.pages_per_unit;
        self.volume
            .read(vpn, self.pages_per_unit, &mut data, None, BmlFlags::ECC_ON)?;
        Ok(data)
    }
}

fn workload(target: &Target, rng: &mut SmallRng, units: u32, fault_rate: u32) -> Result<()> {
    let chosen = target.choose_units(rng, units)?;
    let mut written = Vec::with_capacity(chosen.len());

    let rpt = howudoin::new()
        .label("Writing units")
        .set_len(u64::from(units));
    for &unit in &chosen {
        for (dev, block) in target.blocks_of(unit)? {
            for page in 0..target.geometry.pages_per_block {
                if rng.gen_range(0..1000) < fault_rate {
                    target.lld.inject(Fault::Program { dev, block, page });
                }
            }
        }

        let mut data = vec![0; target.unit_size()];
        rng.fill_bytes(&mut data);
        target.write_unit(unit, &data)?;
        written.push((unit, data));
        rpt.inc();
    }
    rpt.close();
    target.volume.flush()?;

    let rpt = howudoin::new()
        .label("Verifying units")
        .set_len(u64::from(units));
    for (unit, data) in &written {
        ensure!(target.read_unit(*unit)? == *data, "unit {unit} read back wrong");
        rpt.inc();
    }
    rpt.close();

    info!("{} units written and verified", written.len());
    Ok(())
}

fn erase(target: &Target, rng: &mut SmallRng, units: u32, fault_rate: u32) -> Result<()> {
    let chosen = target.choose_units(rng, units)?;

    let rpt = howudoin::new()
        .label("Filling units")
        .set_len(u64::from(units));
    for &unit in &chosen {
        let mut data = vec![0; target.unit_size()];
        rng.fill_bytes(&mut data);
        target.write_unit(unit, &data)?;
        rpt.inc();
    }
    rpt.close();
    target.volume.flush()?;

    for &unit in &chosen {
        for (dev, block) in target.blocks_of(unit)? {
            if rng.gen_range(0..1000) < fault_rate {
                target.lld.inject(Fault::Erase { dev, block });
            }
        }
    }

    let rpt = howudoin::new()
        .label("Erasing units")
        .set_len(u64::from(units));
    for chunk in chosen.chunks(4) {
        target.volume.erase(chunk, BmlFlags::empty())?;
        for _ in chunk {
            rpt.inc();
        }
    }
    rpt.close();

    for &unit in &chosen {
        ensure!(target.read_unit(unit)?.is_erased(), "unit {unit} not erased");
    }

    info!("{} units erased and verified", chosen.len());
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let log_cfg = ConfigBuilder::new()
        .set_time_format_custom(format_description!("[hour]:[minute]:[second].[subsecond]"))
        .build();
    let level = match args.verbose {
        true => LevelFilter::Debug,
        false => LevelFilter::Info,
    };
    SimpleLogger::init(level, log_cfg)?;
    howudoin::init(howudoin::consumers::TermLine::default());

    let geometry = args
        .layout
        .class(args.class.into())
        .pipeline_depth(args.depth)
        .cache_backup(args.backup);
    let pairing = match args.paired {
        true => Pairing::Paired,
        false => Pairing::Unpaired,
    };

    let lld = SimLld::new(geometry);
    let reservoir = SimReservoir::new(geometry, args.reserved).pairing(pairing);
    let volume = Volume::open(
        geometry,
        Box::new(lld.clone()),
        Box::new(reservoir.clone()),
        PartitionTable::new(),
    )?;

    let mut rng = SmallRng::seed_from_u64(args.seed);
    let target = Target::new(&volume, &lld)?;
    match args.cmd {
        Command::Workload { units, fault_rate } => workload(&target, &mut rng, units, fault_rate)?,
        Command::Erase { units, fault_rate } => erase(&target, &mut rng, units, fault_rate)?,
    }

    let unfired = lld.pending_faults().len();
    if unfired > 0 {
        warn!("{unfired} injected faults never fired");
    }
    info!(
        "{} substitutions, {} blocks retired",
        reservoir.substitutions().len(),
        reservoir.bad_blocks().len()
    );
    for way in 0..geometry.ways() {
        let (dev, die) = geometry.way_location(way);
        info!(
            "dev {dev} die {die}: {} replacement blocks left",
            reservoir.free_blocks(dev, die)
        );
    }

    volume.close()?;

    if let Some(path) = &args.dump {
        lld.save(&mut File::create(path)?)?;
        info!("array written to {}", path.display());
    }
    Ok(())
}
