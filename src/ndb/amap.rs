//! Allocation Map (AMap) + Density List (DList): the file-wide free/busy
//! bitmap at 64-byte slot granularity, and the in-memory cache of which
//! AMap page currently has the most free slots. `spec.md` §4.1.

use tracing::{debug, instrument};

use super::{page::MapPage, FormatVariant, NdbError, NdbResult, PAGE_SIZE};
use crate::device::Device;

/// Every slot is 64 bytes, per `spec.md` §3 ("each byte covers 8 slots of
/// 64 bytes").
pub const SLOT_SIZE: u64 = 64;

fn div_round_up(n: u64, d: u64) -> u64 {
    (n + d - 1) / d
}

/// Allocation state for one AMap page: its bitmap and how many of its
/// slots are currently free.
#[derive(Clone)]
struct AmapPageState {
    bits: Vec<u8>,
    free_slots: u32,
}

impl AmapPageState {
    fn new_empty(variant: FormatVariant) -> Self {
        let bits = vec![0_u8; MapPage::payload_len(variant)];
        let free_slots = MapPage::slots_governed(variant) as u32;
        Self { bits, free_slots }
    }

    fn is_busy(&self, slot: usize) -> bool {
        let byte = self.bits[slot / 8];
        byte & (1 << (slot % 8)) != 0
    }

    fn set_busy(&mut self, slot: usize, busy: bool) {
        let was_busy = self.is_busy(slot);
        let byte = &mut self.bits[slot / 8];
        if busy {
            *byte |= 1 << (slot % 8);
        } else {
            *byte &= !(1 << (slot % 8));
        }
        match (was_busy, busy) {
            (false, true) => self.free_slots -= 1,
            (true, false) => self.free_slots += 1,
            _ => {}
        }
    }

    /// Finds the lowest run of `count` contiguous free slots, if any.
    fn find_free_run(&self, count: usize) -> Option<usize> {
        let total_slots = self.bits.len() * 8;
        let mut run_start = 0;
        let mut run_len = 0;
        for slot in 0..total_slots {
            if self.is_busy(slot) {
                run_start = slot + 1;
                run_len = 0;
            } else {
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            }
        }
        None
    }
}

/// A snapshot of every AMap page's bits, used to roll a transaction back.
type AmapSnapshot = Vec<Vec<u8>>;

/// File-wide bitmap over 64-byte slots, chained across AMap pages covering
/// successive stripes of the file (`spec.md` §4.1). Logical addresses are
/// relative to the start of the AMap-governed region; the caller (the
/// [`crate::ndb::context::DbContext`]) translates those into absolute file
/// offsets via [`AllocationMap::file_offset`].
#[derive(Clone)]
pub struct AllocationMap {
    variant: FormatVariant,
    region_start: u64,
    pages: Vec<AmapPageState>,
    txn: Option<AmapSnapshot>,
}

impl AllocationMap {
    pub fn new(variant: FormatVariant, region_start: u64) -> Self {
        Self {
            variant,
            region_start,
            pages: Vec::new(),
            txn: None,
        }
    }

    fn bytes_per_page(&self) -> u64 {
        MapPage::bytes_governed(self.variant)
    }

    fn stripe_size(&self) -> u64 {
        PAGE_SIZE as u64 + self.bytes_per_page()
    }

    /// Absolute file offset backing an AMap page index (where the bitmap
    /// page itself is physically stored).
    pub fn amap_page_offset(&self, page_no: usize) -> u64 {
        self.region_start + page_no as u64 * self.stripe_size()
    }

    /// Absolute file offset for a logical address returned by
    /// [`AllocationMap::allocate`].
    pub fn file_offset(&self, addr: u64) -> u64 {
        let page_no = (addr / self.bytes_per_page()) as usize;
        let within_page = addr % self.bytes_per_page();
        self.amap_page_offset(page_no) + PAGE_SIZE as u64 + within_page
    }

    fn page_and_slot(&self, addr: u64) -> NdbResult<(usize, usize)> {
        let page_no = (addr / self.bytes_per_page()) as usize;
        if page_no >= self.pages.len() {
            return Err(NdbError::UnexpectedPage(addr));
        }
        let within_page = addr % self.bytes_per_page();
        if within_page % SLOT_SIZE != 0 {
            return Err(NdbError::InvalidArgument(format!(
                "address 0x{addr:X} is not slot-aligned"
            )));
        }
        Ok((page_no, (within_page / SLOT_SIZE) as usize))
    }

    pub fn is_allocated(&self, addr: u64, len: u64) -> NdbResult<bool> {
        let count = div_round_up(len.max(1), SLOT_SIZE) as usize;
        let (page_no, slot) = self.page_and_slot(addr)?;
        let page = &self.pages[page_no];
        if slot + count > page.bits.len() * 8 {
            return Err(NdbError::UnexpectedPage(addr));
        }
        Ok((slot..slot + count).all(|s| page.is_busy(s)))
    }

    /// Appends a fresh AMap-governed stripe, growing the device to back it.
    /// `spec.md` §4.1: "appends a fresh AMap-governed stripe by
    /// `device.grow`."
    #[instrument(skip(self, device))]
    fn grow_one_page(&mut self, device: &mut dyn Device) -> NdbResult<()> {
        let page_no = self.pages.len();
        let new_end = self.amap_page_offset(page_no) + self.stripe_size();
        device.grow(new_end)?;
        self.pages.push(AmapPageState::new_empty(self.variant));
        debug!(page_no, new_end, "grew allocation map by one stripe");
        Ok(())
    }

    /// `spec.md` §4.1: "chooses the first AMap page whose free-slot count
    /// (per DList) is sufficient, finds the lowest run of `⌈size/64⌉`
    /// contiguous free slots ... If no page can satisfy the request and
    /// file growth is permitted, appends a fresh AMap-governed stripe."
    #[instrument(skip(self, device), fields(size))]
    pub fn allocate(&mut self, size: u64, device: &mut dyn Device) -> NdbResult<u64> {
        let slots_needed = div_round_up(size, SLOT_SIZE) as usize;
        if slots_needed as u64 * SLOT_SIZE > self.bytes_per_page() {
            return Err(NdbError::InvalidArgument(format!(
                "size {size} exceeds the span a single AMap page can express contiguously"
            )));
        }

        for dlist_entry in self.density_list() {
            if dlist_entry.free_slot_count as usize >= slots_needed {
                let page_no = dlist_entry.amap_page_no as usize;
                if let Some(slot) = self.pages[page_no].find_free_run(slots_needed) {
                    for s in slot..slot + slots_needed {
                        self.pages[page_no].set_busy(s, true);
                    }
                    let addr = page_no as u64 * self.bytes_per_page() + slot as u64 * SLOT_SIZE;
                    debug!(addr, slots_needed, "allocated slot run");
                    return Ok(addr);
                }
            }
        }

        self.grow_one_page(device)?;
        let page_no = self.pages.len() - 1;
        let slot = self.pages[page_no]
            .find_free_run(slots_needed)
            .expect("freshly grown page always has room");
        for s in slot..slot + slots_needed {
            self.pages[page_no].set_busy(s, true);
        }
        Ok(page_no as u64 * self.bytes_per_page() + slot as u64 * SLOT_SIZE)
    }

    #[instrument(skip(self))]
    pub fn free_allocation(&mut self, addr: u64, size: u64) -> NdbResult<()> {
        let slots = div_round_up(size, SLOT_SIZE) as usize;
        let (page_no, slot) = self.page_and_slot(addr)?;
        let page = &mut self.pages[page_no];
        if slot + slots > page.bits.len() * 8 {
            return Err(NdbError::UnexpectedPage(addr));
        }
        for s in slot..slot + slots {
            page.set_busy(s, false);
        }
        Ok(())
    }

    /// `spec.md` §4.1: "DList is an in-memory array of `(amap_page_no,
    /// free_slot_count)` sorted by descending free count; only pages with
    /// free slots appear."
    pub fn density_list(&self) -> Vec<super::page::DensityListEntry> {
        let mut entries: Vec<_> = self
            .pages
            .iter()
            .enumerate()
            .filter(|(_, p)| p.free_slots > 0)
            .map(|(i, p)| super::page::DensityListEntry {
                amap_page_no: i as u32,
                free_slot_count: p.free_slots,
            })
            .collect();
        entries.sort_by(|a, b| b.free_slot_count.cmp(&a.free_slot_count));
        entries
    }

    pub fn get_current_page(&self) -> Option<u32> {
        self.density_list().first().map(|e| e.amap_page_no)
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// `spec.md` §4.1: "Transactions are single-threaded per context and
    /// non-nesting". We reject a nested `begin_transaction` rather than
    /// silently treat it as a no-op, per the Open Question in `spec.md` §9
    /// (decision recorded in `DESIGN.md`).
    pub fn begin_transaction(&mut self) -> NdbResult<()> {
        if self.txn.is_some() {
            return Err(NdbError::InvalidArgument(
                "nested begin_transaction on allocation_map is not supported".into(),
            ));
        }
        self.txn = Some(self.pages.iter().map(|p| p.bits.clone()).collect());
        Ok(())
    }

    pub fn commit_transaction(&mut self) -> NdbResult<()> {
        if self.txn.is_none() {
            return Err(NdbError::InvalidArgument(
                "no transaction in progress".into(),
            ));
        }
        self.txn = None;
        Ok(())
    }

    pub fn abort_transaction(&mut self) -> NdbResult<()> {
        let Some(snapshot) = self.txn.take() else {
            return Err(NdbError::InvalidArgument(
                "no transaction in progress".into(),
            ));
        };
        for (page, bits) in self.pages.iter_mut().zip(snapshot.into_iter()) {
            let free_slots = bits
                .iter()
                .map(|b| b.count_zeros() as u32)
                .sum::<u32>()
                .min((page.bits.len() * 8) as u32);
            page.bits = bits;
            page.free_slots = free_slots;
        }
        Ok(())
    }

    /// `spec.md` §4.1: rebuild walks BBT and marks every page occupied by
    /// a live block (plus index/AMap/DList pages themselves) as busy, then
    /// flips `fAMapValid` to valid on next commit. `occupied_ranges` yields
    /// `(logical_addr, len)` for everything the caller considers live.
    #[instrument(skip(self, occupied_ranges, device))]
    pub fn rebuild(
        &mut self,
        occupied_ranges: impl Iterator<Item = (u64, u64)>,
        device: &mut dyn Device,
    ) -> NdbResult<()> {
        for page in &mut self.pages {
            page.bits.fill(0);
            page.free_slots = MapPage::slots_governed(self.variant) as u32;
        }
        for (addr, len) in occupied_ranges {
            while self.page_and_slot(addr).is_err() {
                self.grow_one_page(device)?;
            }
            let slots = div_round_up(len.max(1), SLOT_SIZE) as usize;
            let (page_no, slot) = self.page_and_slot(addr)?;
            for s in slot..slot + slots {
                self.pages[page_no].set_busy(s, true);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    fn new_map() -> (AllocationMap, MemoryDevice) {
        let map = AllocationMap::new(FormatVariant::Unicode, 0);
        let device = MemoryDevice::new();
        (map, device)
    }

    #[test]
    fn test_allocate_and_is_allocated() {
        let (mut map, mut device) = new_map();
        let addr = map.allocate(1024, &mut device).unwrap();
        assert!(map.is_allocated(addr, 1024).unwrap());
        assert!(!map.is_allocated(addr + 1024, SLOT_SIZE).unwrap_or(false));
    }

    #[test]
    fn test_free_allocation() {
        let (mut map, mut device) = new_map();
        let addr = map.allocate(256, &mut device).unwrap();
        map.free_allocation(addr, 256).unwrap();
        assert!(!map.is_allocated(addr, 64).unwrap());
    }

    #[test]
    fn test_out_of_range_is_unexpected_page() {
        let (map, _device) = new_map();
        let err = map.is_allocated(10 * map.bytes_per_page(), 64).unwrap_err();
        assert!(matches!(err, NdbError::UnexpectedPage(_)));
    }

    #[test]
    fn test_transaction_abort_restores_bits() {
        let (mut map, mut device) = new_map();
        let base = map.allocate(64, &mut device).unwrap();
        assert!(map.is_allocated(base, 64).unwrap());

        map.begin_transaction().unwrap();
        let addr = map.allocate(1024, &mut device).unwrap();
        assert!(map.is_allocated(addr, 1024).unwrap());
        map.abort_transaction().unwrap();

        assert!(!map.is_allocated(addr, 64).unwrap_or(false));
        assert!(map.is_allocated(base, 64).unwrap());
    }

    #[test]
    fn test_nested_transaction_rejected() {
        let (mut map, _device) = new_map();
        map.begin_transaction().unwrap();
        assert!(map.begin_transaction().is_err());
    }

    #[test]
    fn test_size_exceeding_page_span_is_invalid_argument() {
        let (mut map, mut device) = new_map();
        let too_big = MapPage::bytes_governed(FormatVariant::Unicode) + SLOT_SIZE;
        let err = map.allocate(too_big, &mut device).unwrap_err();
        assert!(matches!(err, NdbError::InvalidArgument(_)));
    }

    #[test]
    fn test_allocate_grows_past_one_stripe() {
        let (mut map, mut device) = new_map();
        let per_page = MapPage::bytes_governed(FormatVariant::Unicode);
        let mut addrs = Vec::new();
        let mut allocated = 0_u64;
        // Force at least one stripe rollover.
        while allocated < per_page {
            addrs.push(map.allocate(per_page / 8, &mut device).unwrap());
            allocated += per_page / 8;
        }
        assert!(map.page_count() >= 2);
        for addr in addrs {
            assert!(map.is_allocated(addr, per_page / 8).unwrap());
        }
    }
}
