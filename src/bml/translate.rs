//! Translation of virtual units to physical blocks

use crate::nand::{PlaneMask, MAX_PLANES};

/// How the plane group of a unit has been substituted
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum SubstitutionKind {
    /// Every plane lives at its nominal block
    #[default]
    None,

    /// The whole group lives in one aligned replacement group; multi-plane commands still work
    Paired,

    /// Some planes were moved on their own; each plane must be addressed separately
    Unpaired,
}

/// Where a unit's plane group lives on one die
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Translation {
    /// Device-relative nominal block of plane 0
    pub nominal: u32,

    /// Physical block of each plane
    pub blocks: [u32; MAX_PLANES as usize],

    pub planes: u32,
    pub kind: SubstitutionKind,
}

impl Translation {
    /// Resolve a plane group, looking up each plane's replacement with `replacement`
    pub fn resolve<F>(nominal: u32, planes: u32, replacement: F) -> Self
    where
        F: Fn(u32) -> Option<u32>,
    {
        let mut blocks = [0; MAX_PLANES as usize];
        let mut replaced = 0;
        for plane in 0..planes {
            let block = nominal + plane;
            blocks[plane as usize] = match replacement(block) {
                Some(new) => {
                    replaced += 1;
                    new
                }
                None => block,
            };
        }

        let aligned = blocks[0] % planes == 0
            && (1..planes).all(|plane| blocks[plane as usize] == blocks[0] + plane);
        let kind = match replaced {
            0 => SubstitutionKind::None,
            n if n == planes && aligned => SubstitutionKind::Paired,
            _ => SubstitutionKind::Unpaired,
        };

        Self {
            nominal,
            blocks,
            planes,
            kind,
        }
    }

    /// Planes reported as substituted: all of them when paired, one less when unpaired
    pub fn substitution_count(&self) -> u32 {
        match self.kind {
            SubstitutionKind::None => 0,
            SubstitutionKind::Paired => self.planes,
            SubstitutionKind::Unpaired => self.planes - 1,
        }
    }

    /// Must the planes be issued one at a time?
    pub fn is_split(&self) -> bool {
        self.kind == SubstitutionKind::Unpaired
    }

    pub fn block(&self, plane: u32) -> u32 {
        self.blocks[plane as usize]
    }

    /// Physical blocks of the planes in `mask`, in plane order
    pub fn blocks_of(&self, mask: PlaneMask) -> Vec<u32> {
        mask.iter().map(|plane| self.block(plane)).collect()
    }

    /// Split a plane mask into the masks of the commands needed to address it
    pub fn commands(&self, mask: PlaneMask) -> Vec<PlaneMask> {
        match self.is_split() {
            true => mask.iter().map(PlaneMask::single).collect(),
            false if mask.is_empty() => Vec::new(),
            false => vec![mask],
        }
    }
}

/// The plane slot that a single failed nominal block belongs to.
///
/// Plane groups are aligned, so the slot follows the block's parity: odd and even nominal
/// blocks always land on complementary slots.
pub fn unpaired_plane(nominal: u32, planes: u32) -> u32 {
    nominal % planes
}

#[test]
fn test_resolve() {
    let none = Translation::resolve(10, 2, |_| None);
    assert_eq!(none.kind, SubstitutionKind::None);
    assert_eq!(none.blocks, [10, 11]);
    assert_eq!(none.substitution_count(), 0);
    assert_eq!(none.commands(PlaneMask::full(2)), [PlaneMask::full(2)]);

    let paired = Translation::resolve(10, 2, |b| Some(b + 40));
    assert_eq!(paired.kind, SubstitutionKind::Paired);
    assert_eq!(paired.substitution_count(), 2);
    assert_eq!(paired.blocks_of(PlaneMask::single(1)), [51]);

    let unpaired = Translation::resolve(10, 2, |b| (b == 11).then_some(57));
    assert_eq!(unpaired.kind, SubstitutionKind::Unpaired);
    assert_eq!(unpaired.blocks, [10, 57]);
    assert_eq!(unpaired.substitution_count(), 1);
    assert_eq!(
        unpaired.commands(PlaneMask::full(2)),
        [PlaneMask::single(0), PlaneMask::single(1)]
    );

    // Both planes moved, but not to an aligned pair
    let scattered = Translation::resolve(10, 2, |b| Some(if b == 10 { 51 } else { 52 }));
    assert_eq!(scattered.kind, SubstitutionKind::Unpaired);

    let single = Translation::resolve(7, 1, |_| Some(30));
    assert_eq!(single.kind, SubstitutionKind::Paired);
    assert!(!single.is_split());
}

#[test]
fn test_parity_flip() {
    for nominal in (0..64).step_by(2) {
        let even = unpaired_plane(nominal, 2);
        let odd = unpaired_plane(nominal + 1, 2);
        assert_eq!(even, 0);
        assert_eq!(odd, 1 - even);
    }
    assert_eq!(unpaired_plane(7, 1), 0);
}
