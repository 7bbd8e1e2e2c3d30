//! Boot memory-map records.
//!
//! The bootloader hands over a list of `(base, length, kind)` records.
//! Only RAM records feed the free pool; the rest mark firmware tables and
//! holes. When no map is available at all, the reported lower/upper memory
//! sizes (in 1024-byte units) stand in for it.

/// Classification of one handover record.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum RegionKind {
    /// Usable RAM.
    Ram = 1,
    /// Reserved by firmware.
    Reserved = 2,
    /// ACPI tables.
    Acpi = 3,
    /// ACPI non-volatile storage.
    Nvs = 4,
    /// Otherwise unusable.
    Unusable = 5,
}

/// One record of the boot memory map.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: RegionKind,
}

/// The 24-bit ISA DMA reach. RAM records straddling it are split here so
/// a DMA24 zone edge never bisects a record.
pub const DMA24_BOUNDARY: u64 = 16 << 20;

impl MemoryRegion {
    pub const fn new(base: u64, length: u64, kind: RegionKind) -> Self {
        Self { base, length, kind }
    }

    pub fn end(&self) -> u64 {
        self.base + self.length
    }

    /// Splits the region at `boundary` when it straddles it.
    pub fn split_at(self, boundary: u64) -> (MemoryRegion, Option<MemoryRegion>) {
        if self.base < boundary && boundary < self.end() {
            (
                MemoryRegion::new(self.base, boundary - self.base, self.kind),
                Some(MemoryRegion::new(boundary, self.end() - boundary, self.kind)),
            )
        } else {
            (self, None)
        }
    }
}

/// The RAM records of `map`, split at the DMA24 boundary.
pub fn usable_regions(map: &[MemoryRegion]) -> impl Iterator<Item = MemoryRegion> + '_ {
    map.iter()
        .copied()
        .filter(|region| region.kind == RegionKind::Ram)
        .flat_map(|region| {
            let (head, tail) = region.split_at(DMA24_BOUNDARY);
            [Some(head), tail].into_iter().flatten()
        })
}

/// Synthesizes a memory map from the lower/upper memory sizes when the
/// bootloader provided none.
pub fn fallback_map(mem_lower_kib: u32, mem_upper_kib: u32) -> [MemoryRegion; 2] {
    [
        MemoryRegion::new(0, u64::from(mem_lower_kib) << 10, RegionKind::Ram),
        MemoryRegion::new(1 << 20, u64::from(mem_upper_kib) << 10, RegionKind::Ram),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_ram_records_survive() {
        let map = [
            MemoryRegion::new(0, 0x9f000, RegionKind::Ram),
            MemoryRegion::new(0x9f000, 0x1000, RegionKind::Reserved),
            MemoryRegion::new(0xf0000, 0x10000, RegionKind::Acpi),
            MemoryRegion::new(0x100000, 0x100000, RegionKind::Ram),
        ];
        let usable: Vec<MemoryRegion> = usable_regions(&map).collect();
        assert_eq!(usable.len(), 2);
        assert!(usable.iter().all(|r| r.kind == RegionKind::Ram));
        assert_eq!(usable[0].end(), 0x9f000);
    }

    #[test]
    fn records_split_at_the_dma_boundary() {
        let map = [MemoryRegion::new(1 << 20, 63 << 20, RegionKind::Ram)];
        let usable: Vec<MemoryRegion> = usable_regions(&map).collect();
        assert_eq!(usable.len(), 2);
        assert_eq!(usable[0].base, 1 << 20);
        assert_eq!(usable[0].end(), DMA24_BOUNDARY);
        assert_eq!(usable[1].base, DMA24_BOUNDARY);
        assert_eq!(usable[1].end(), 64 << 20);
    }

    #[test]
    fn records_touching_the_boundary_stay_whole() {
        let below = MemoryRegion::new(0, DMA24_BOUNDARY, RegionKind::Ram);
        let above = MemoryRegion::new(DMA24_BOUNDARY, 1 << 20, RegionKind::Ram);
        assert_eq!(below.split_at(DMA24_BOUNDARY), (below, None));
        assert_eq!(above.split_at(DMA24_BOUNDARY), (above, None));
    }

    #[test]
    fn fallback_map_uses_kib_units() {
        let map = fallback_map(640, 65536);
        assert_eq!(map[0].base, 0);
        assert_eq!(map[0].length, 640 * 1024);
        assert_eq!(map[1].base, 1 << 20);
        assert_eq!(map[1].length, 64 << 20);
        assert!(map.iter().all(|r| r.kind == RegionKind::Ram));
    }
}
