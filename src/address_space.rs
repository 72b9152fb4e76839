// src/address_space.rs — sparse per-PASID page table
//
// Authoritative single-stage IOVA->PA translation. All operations work at
// 4 KiB granularity and are keyed internally by page number (`iova >> 12`).
// AddressSpace never references a TLBCache; the four `invalidate_*` methods
// are no-op observer hooks an external dispatcher can call through, not
// authoritative cache operations.

use std::collections::HashMap;

use crate::error::{SMMUError, VoidResult};
use crate::types::{
    check_address_in_range, page_number, AccessType, AddressRange, PageEntry, PagePermissions,
    SecurityState, TranslationData, TranslationResult, IOVA, PA, PAGE_MASK, PAGE_SIZE,
};

/// Sparse per-PASID page table. Cloning performs a deep copy of every
/// stored entry, via the derived `Clone` on the underlying `HashMap`.
#[derive(Debug, Clone, Default)]
pub struct AddressSpace {
    page_table: HashMap<u64, PageEntry>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self {
            page_table: HashMap::new(),
        }
    }

    /// Maps a single page. Overwrites any existing entry at the same page
    /// number — remap is whole-entry replacement, not an error.
    /// `PageAlreadyMapped` is never raised here.
    pub fn map_page(
        &mut self,
        iova: IOVA,
        pa: PA,
        permissions: PagePermissions,
        security_state: SecurityState,
    ) -> VoidResult {
        check_address_in_range(iova)?;
        check_address_in_range(pa)?;
        if permissions.is_empty() {
            return Err(SMMUError::InvalidPermissions);
        }

        let page_num = page_number(iova);
        let entry = PageEntry::new(pa & !PAGE_MASK, permissions, security_state);
        log::trace!("map_page: page {:#x} -> pa {:#x}", page_num, entry.pa);
        self.page_table.insert(page_num, entry);
        Ok(())
    }

    /// Convenience wrapper defaulting the security state to `NonSecure`.
    pub fn map_page_ns(&mut self, iova: IOVA, pa: PA, permissions: PagePermissions) -> VoidResult {
        self.map_page(iova, pa, permissions, SecurityState::NonSecure)
    }

    /// Unmaps a single page. Returns `PageNotMapped` if the page has no
    /// valid entry — unmapping an already-unmapped page is an error, not a
    /// silent no-op.
    pub fn unmap_page(&mut self, iova: IOVA) -> VoidResult {
        check_address_in_range(iova)?;
        let page_num = page_number(iova);
        match self.page_table.remove(&page_num) {
            Some(_) => {
                log::trace!("unmap_page: page {:#x}", page_num);
                Ok(())
            }
            None => Err(SMMUError::PageNotMapped),
        }
    }

    /// Translates `iova` for `access_type` under `security_state`. Security
    /// mismatches always fail with `InvalidSecurityState`, even when the
    /// page is mapped with the requested access type — the security check
    /// runs before the permission check.
    pub fn translate_page(
        &self,
        iova: IOVA,
        access_type: AccessType,
        security_state: SecurityState,
    ) -> TranslationResult {
        let page_num = page_number(iova);
        let entry = self
            .page_table
            .get(&page_num)
            .filter(|e| e.valid)
            .ok_or(SMMUError::PageNotMapped)?;

        if entry.security_state != security_state {
            return Err(SMMUError::InvalidSecurityState);
        }

        if !entry.permissions.allows(access_type) {
            return Err(SMMUError::PagePermissionViolation);
        }

        let offset = iova & PAGE_MASK;
        Ok(TranslationData {
            physical_address: entry.pa + offset,
            permissions: entry.permissions,
            security_state: entry.security_state,
        })
    }

    /// Convenience wrapper defaulting the security state to `NonSecure`.
    pub fn translate_page_ns(&self, iova: IOVA, access_type: AccessType) -> TranslationResult {
        self.translate_page(iova, access_type, SecurityState::NonSecure)
    }

    /// Maps a closed, inclusive IOVA range to a contiguous PA range with
    /// uniform permissions, under `NonSecure`. Existing mappings inside the
    /// range are overwritten.
    pub fn map_range(
        &mut self,
        start_iova: IOVA,
        end_iova: IOVA,
        start_pa: PA,
        permissions: PagePermissions,
    ) -> VoidResult {
        if end_iova < start_iova {
            return Err(SMMUError::InvalidAddress);
        }
        check_address_in_range(start_iova)?;
        check_address_in_range(end_iova)?;
        check_address_in_range(start_pa)?;
        if permissions.is_empty() {
            return Err(SMMUError::InvalidPermissions);
        }

        let range_size = end_iova - start_iova + 1;
        if start_pa.checked_add(range_size).is_none() {
            return Err(SMMUError::InvalidAddress);
        }

        let aligned_start_iova = start_iova & !PAGE_MASK;
        let aligned_start_pa = start_pa & !PAGE_MASK;

        let start_page = page_number(aligned_start_iova);
        let end_page = page_number(end_iova);

        let mut current_pa = aligned_start_pa;
        for page_num in start_page..=end_page {
            self.page_table
                .insert(page_num, PageEntry::new(current_pa, permissions, SecurityState::NonSecure));
            current_pa += PAGE_SIZE;
        }

        log::trace!(
            "map_range: pages {:#x}..={:#x}",
            start_page,
            end_page
        );
        Ok(())
    }

    /// Unmaps every page in a closed, inclusive IOVA range. Absent pages in
    /// the range are skipped silently; if *no* page in the range is mapped
    /// the whole call fails with `PageNotMapped`.
    pub fn unmap_range(&mut self, start_iova: IOVA, end_iova: IOVA) -> VoidResult {
        if end_iova < start_iova {
            return Err(SMMUError::InvalidAddress);
        }
        check_address_in_range(start_iova)?;
        check_address_in_range(end_iova)?;

        let start_page = page_number(start_iova);
        let end_page = page_number(end_iova);

        let any_mapped = (start_page..=end_page)
            .any(|p| self.page_table.get(&p).map_or(false, |e| e.valid));
        if !any_mapped {
            return Err(SMMUError::PageNotMapped);
        }

        for page_num in start_page..=end_page {
            self.page_table.remove(&page_num);
        }
        log::trace!("unmap_range: pages {:#x}..={:#x}", start_page, end_page);
        Ok(())
    }

    /// Maps several `(iova, pa)` pairs under shared permissions. Validates
    /// every pair before applying any of them: on any validation failure the
    /// batch is rejected and no mutation is observable.
    pub fn map_pages(
        &mut self,
        mappings: &[(IOVA, PA)],
        permissions: PagePermissions,
    ) -> VoidResult {
        if permissions.is_empty() {
            return Err(SMMUError::InvalidPermissions);
        }
        for &(iova, pa) in mappings {
            check_address_in_range(iova)?;
            check_address_in_range(pa)?;
        }

        for &(iova, pa) in mappings {
            let page_num = page_number(iova);
            let aligned_pa = pa & !PAGE_MASK;
            self.page_table
                .insert(page_num, PageEntry::new(aligned_pa, permissions, SecurityState::NonSecure));
        }
        Ok(())
    }

    /// Unmaps several pages. If not a single listed page is currently
    /// mapped, returns `PageNotMapped` and nothing is mutated.
    pub fn unmap_pages(&mut self, iovas: &[IOVA]) -> VoidResult {
        for &iova in iovas {
            check_address_in_range(iova)?;
        }

        let any_mapped = iovas.iter().any(|&iova| {
            self.page_table
                .get(&page_number(iova))
                .map_or(false, |e| e.valid)
        });
        if !any_mapped {
            return Err(SMMUError::PageNotMapped);
        }

        for &iova in iovas {
            self.page_table.remove(&page_number(iova));
        }
        Ok(())
    }

    /// Whether `iova`'s page currently holds a valid entry.
    pub fn is_page_mapped(&self, iova: IOVA) -> crate::error::SmmuResult<bool> {
        check_address_in_range(iova)?;
        Ok(self
            .page_table
            .get(&page_number(iova))
            .map_or(false, |e| e.valid))
    }

    /// Permissions of the page mapped at `iova`.
    pub fn get_page_permissions(&self, iova: IOVA) -> crate::error::SmmuResult<PagePermissions> {
        check_address_in_range(iova)?;
        self.page_table
            .get(&page_number(iova))
            .filter(|e| e.valid)
            .map(|e| e.permissions)
            .ok_or(SMMUError::PageNotMapped)
    }

    /// Number of currently-valid page entries.
    pub fn get_page_count(&self) -> crate::error::SmmuResult<usize> {
        Ok(self.page_table.values().filter(|e| e.valid).count())
    }

    /// Returns every mapped range, fused from consecutive pages, in
    /// strictly ascending, non-overlapping, page-aligned order.
    pub fn get_mapped_ranges(&self) -> Vec<AddressRange> {
        let mut page_nums: Vec<u64> = self
            .page_table
            .iter()
            .filter(|(_, e)| e.valid)
            .map(|(&p, _)| p)
            .collect();
        page_nums.sort_unstable();

        let mut ranges = Vec::new();
        let mut iter = page_nums.into_iter();
        let Some(first) = iter.next() else {
            return ranges;
        };

        let mut range_start = first << 12;
        let mut range_end = range_start + PAGE_SIZE - 1;

        for page_num in iter {
            let addr = page_num << 12;
            if addr == range_end + 1 {
                range_end = addr + PAGE_SIZE - 1;
            } else {
                ranges.push(AddressRange::new(range_start, range_end));
                range_start = addr;
                range_end = range_start + PAGE_SIZE - 1;
            }
        }
        ranges.push(AddressRange::new(range_start, range_end));
        ranges
    }

    /// Span from the lowest to the highest mapped page, inclusive; 0 if no
    /// page is mapped.
    pub fn get_address_space_size(&self) -> u64 {
        let bounds = self
            .page_table
            .iter()
            .filter(|(_, e)| e.valid)
            .fold(None, |acc: Option<(u64, u64)>, (&p, _)| match acc {
                None => Some((p, p)),
                Some((lo, hi)) => Some((lo.min(p), hi.max(p))),
            });

        let Some((min_page, max_page)) = bounds else {
            return 0;
        };

        let min_address = min_page << 12;
        let max_address = (max_page << 12) + PAGE_SIZE - 1;
        max_address - min_address + 1
    }

    /// Whether any page in the closed range `[start_iova, end_iova]` is
    /// currently mapped.
    pub fn has_overlapping_mappings(&self, start_iova: IOVA, end_iova: IOVA) -> bool {
        if end_iova < start_iova {
            return false;
        }
        let start_page = page_number(start_iova);
        let end_page = page_number(end_iova);
        (start_page..=end_page).any(|p| self.page_table.get(&p).map_or(false, |e| e.valid))
    }

    /// Drops every mapping.
    pub fn clear(&mut self) -> VoidResult {
        self.page_table.clear();
        Ok(())
    }

    /// Observer hook: no authoritative effect. An external dispatcher wires
    /// this to TLB invalidation when it owns both the AddressSpace and the
    /// TLBCache it backs.
    pub fn invalidate_cache(&self) {}

    /// Observer hook: no authoritative effect (see `invalidate_cache`).
    pub fn invalidate_page(&self, _iova: IOVA) {}

    /// Observer hook: no authoritative effect (see `invalidate_cache`).
    pub fn invalidate_range(&self, _start_iova: IOVA, _end_iova: IOVA) {}

    /// Observer hook: no authoritative effect (see `invalidate_cache`).
    pub fn invalidate_all(&self) {}
}
