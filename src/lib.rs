// src/lib.rs — smmu_core: ARM SMMU v3 translation core
//
// Two pieces compose the crate: `AddressSpace`, the authoritative sparse
// page table for a single PASID, and `TLBCache`, a bounded-capacity LRU
// cache a dispatcher consults in front of it. Both report through the
// same `SmmuResult<T>`/`SMMUError` surface defined in `error`.

mod address_space;
mod error;
mod tlb_cache;
mod types;

pub use address_space::AddressSpace;
pub use error::{FaultType, SMMUError, SmmuResult, VoidResult};
pub use tlb_cache::{CacheEntry, CacheStatistics, TLBCache, TLBEntry};
pub use types::{
    check_address_in_range, page_number, AccessType, AddressRange, PageEntry, PagePermissions,
    SecurityState, TranslationData, TranslationResult, IOVA, IPA, MAX_ADDRESS, MAX_PASID,
    MAX_STREAM_ID, PAGE_MASK, PAGE_SIZE, PA, PASID, StreamID,
};
