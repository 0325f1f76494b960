//! Partitions: ranges of virtual units with access attributes

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
    pub struct PartAttr: u32 {
        /// Rejected by write, erase and copy-back before anything is issued
        const READ_ONLY = 1 << 0;

        /// Write-protected by the device, until unlocked
        const LOCKED = 1 << 1;

        /// Write-protected by the device until power cycle
        const LOCKED_TIGHT = 1 << 2;
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Partition {
    pub id: u32,
    pub first_unit: u32,
    pub units: u32,
    pub attrs: PartAttr,
}

impl Partition {
    pub fn new(id: u32, first_unit: u32, units: u32) -> Self {
        Self {
            id,
            first_unit,
            units,
            attrs: PartAttr::empty(),
        }
    }

    /// Change the attributes
    pub fn attrs(mut self, attrs: PartAttr) -> Self {
        self.attrs = attrs;
        self
    }

    pub fn end(&self) -> u32 {
        self.first_unit + self.units
    }

    pub fn contains(&self, unit: u32) -> bool {
        (self.first_unit..self.end()).contains(&unit)
    }
}

/// The partitions of a volume. Units outside every partition are writable.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct PartitionTable {
    parts: Vec<Partition>,
}

impl PartitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// One writable partition spanning `units`
    pub fn whole(units: u32) -> Self {
        Self::new().partition(Partition::new(0, 0, units))
    }

    /// Add a partition
    pub fn partition(mut self, part: Partition) -> Self {
        self.parts.push(part);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Partition> {
        self.parts.iter()
    }

    pub fn find(&self, unit: u32) -> Option<&Partition> {
        self.parts.iter().find(|p| p.contains(unit))
    }

    pub fn get(&self, id: u32) -> Option<&Partition> {
        self.parts.iter().find(|p| p.id == id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Partition> {
        self.parts.iter_mut().find(|p| p.id == id)
    }

    pub fn is_read_only(&self, unit: u32) -> bool {
        self.find(unit)
            .is_some_and(|p| p.attrs.contains(PartAttr::READ_ONLY))
    }

    /// Check that every partition fits in `units` and that none overlap or share an id
    pub fn check(&self, units: u32) -> Result<(), &'static str> {
        let mut sorted: Vec<&Partition> = self.parts.iter().collect();
        sorted.sort_by_key(|p| p.first_unit);

        for (i, part) in sorted.iter().enumerate() {
            if part.units == 0 {
                return Err("empty partition");
            }
            if part.first_unit.checked_add(part.units).map_or(true, |end| end > units) {
                return Err("partition extends past the end of the volume");
            }
            if sorted.get(i + 1).is_some_and(|next| next.first_unit < part.end()) {
                return Err("partitions overlap");
            }
            if sorted[..i].iter().any(|other| other.id == part.id) {
                return Err("duplicate partition id");
            }
        }
        Ok(())
    }
}

#[test]
fn test_partition_lookup() {
    let table = PartitionTable::new()
        .partition(Partition::new(1, 0, 4).attrs(PartAttr::READ_ONLY))
        .partition(Partition::new(2, 4, 12));

    assert!(table.is_read_only(3));
    assert!(!table.is_read_only(4));
    assert!(!table.is_read_only(100));
    assert_eq!(table.find(15).map(|p| p.id), Some(2));
    assert_eq!(table.find(16), None);
    assert_eq!(table.check(16), Ok(()));
    assert!(table.check(15).is_err());
}

#[test]
fn test_partition_overlap() {
    let table = PartitionTable::whole(8).partition(Partition::new(1, 7, 1));
    assert_eq!(table.check(8), Err("partitions overlap"));

    let table = PartitionTable::whole(4).partition(Partition::new(0, 4, 4));
    assert_eq!(table.check(8), Err("duplicate partition id"));
}
