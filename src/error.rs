// src/error.rs — SMMU error taxonomy and fault-kind projection
//
// The uniform success/error discipline shared by AddressSpace and TLBCache.

use thiserror::Error;

/// Unified error surface returned at every API boundary in this crate.
///
/// Variants are grouped the way the ARM SMMU v3 fault taxonomy groups them:
/// argument-validity errors, state errors, translation errors, and a
/// catch-all. `PageAlreadyMapped` is part of the taxonomy but is never
/// raised by `AddressSpace::map_page` — remapping an already-mapped page
/// replaces its entry outright rather than failing.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SMMUError {
    #[error("stream ID exceeds the maximum allowed value")]
    InvalidStreamID,
    #[error("PASID exceeds the maximum allowed value or has an invalid format")]
    InvalidPASID,
    #[error("address is invalid or outside the supported 52-bit range")]
    InvalidAddress,
    #[error("page permissions are invalid or inconsistent")]
    InvalidPermissions,
    #[error("security state does not match the stored mapping")]
    InvalidSecurityState,
    #[error("requested page is not mapped in the address space")]
    PageNotMapped,
    #[error("attempt to map an already-mapped page")]
    PageAlreadyMapped,
    #[error("access type violates the page's permissions")]
    PagePermissionViolation,
    #[error("translation table structure is invalid")]
    TranslationTableError,
    #[error("TLB cache entry not found")]
    CacheEntryNotFound,
    #[error("TLB cache operation failed")]
    CacheOperationFailed,
    #[error("internal SMMU core error")]
    InternalError,
}

/// The uniform Result carrier used across the core. A caller can never
/// observe both a value and an error, or neither, and reading the payload
/// of an `Err` variant is a compile error rather than a forged default —
/// `std::result::Result` gives us all of that natively, so no bespoke
/// sum type is introduced on top of it.
pub type SmmuResult<T> = std::result::Result<T, SMMUError>;

/// `Result<()>` alias for void-returning operations.
pub type VoidResult = SmmuResult<()>;

/// ARM SMMU v3 fault taxonomy. Distinct from `SMMUError`: several fault
/// kinds project onto the same `SMMUError` variant (e.g. every
/// level-N translation fault projects to `PageNotMapped`), so the two are
/// kept separate rather than collapsed into one enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultType {
    TranslationFault,
    PermissionFault,
    AddressSizeFault,
    AccessFault,
    SecurityFault,
    ContextDescriptorFormatFault,
    TranslationTableFormatFault,
    Level0TranslationFault,
    Level1TranslationFault,
    Level2TranslationFault,
    Level3TranslationFault,
    AccessFlagFault,
    DirtyBitFault,
    TLBConflictFault,
    ExternalAbort,
    SynchronousExternalAbort,
    AsynchronousExternalAbort,
    StreamTableFormatFault,
    ConfigurationCacheFault,
    Stage2TranslationFault,
    Stage2PermissionFault,
}

impl FaultType {
    /// Total, deterministic projection onto the unified error surface.
    pub fn to_smmu_error(self) -> SMMUError {
        match self {
            FaultType::TranslationFault
            | FaultType::Level0TranslationFault
            | FaultType::Level1TranslationFault
            | FaultType::Level2TranslationFault
            | FaultType::Level3TranslationFault
            | FaultType::Stage2TranslationFault => SMMUError::PageNotMapped,

            FaultType::PermissionFault | FaultType::Stage2PermissionFault => {
                SMMUError::PagePermissionViolation
            }

            FaultType::AddressSizeFault => SMMUError::InvalidAddress,
            FaultType::SecurityFault => SMMUError::InvalidSecurityState,

            FaultType::ContextDescriptorFormatFault
            | FaultType::TranslationTableFormatFault
            | FaultType::StreamTableFormatFault => SMMUError::TranslationTableError,

            FaultType::ConfigurationCacheFault => SMMUError::CacheOperationFailed,

            FaultType::AccessFault
            | FaultType::AccessFlagFault
            | FaultType::DirtyBitFault
            | FaultType::TLBConflictFault
            | FaultType::ExternalAbort
            | FaultType::SynchronousExternalAbort
            | FaultType::AsynchronousExternalAbort => SMMUError::InternalError,
        }
    }
}

impl SMMUError {
    /// Reverse mapping, provided for call sites that only have an
    /// `SMMUError` in hand but need to report a fault kind. Several
    /// `SMMUError` variants have no single natural fault counterpart and
    /// fall back to `AccessFault`.
    pub fn to_fault_type(self) -> FaultType {
        match self {
            SMMUError::PageNotMapped => FaultType::TranslationFault,
            SMMUError::PagePermissionViolation => FaultType::PermissionFault,
            SMMUError::InvalidAddress => FaultType::AddressSizeFault,
            SMMUError::InvalidSecurityState => FaultType::SecurityFault,
            SMMUError::TranslationTableError => FaultType::TranslationTableFormatFault,
            SMMUError::CacheOperationFailed => FaultType::ConfigurationCacheFault,
            SMMUError::InvalidStreamID
            | SMMUError::InvalidPASID
            | SMMUError::InvalidPermissions
            | SMMUError::PageAlreadyMapped
            | SMMUError::CacheEntryNotFound
            | SMMUError::InternalError => FaultType::AccessFault,
        }
    }

    /// Build a translation-path error directly from a fault kind.
    pub fn from_fault(fault: FaultType) -> Self {
        fault.to_smmu_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn translation_fault_family_projects_to_page_not_mapped() {
        for fault in [
            FaultType::TranslationFault,
            FaultType::Level0TranslationFault,
            FaultType::Level1TranslationFault,
            FaultType::Level2TranslationFault,
            FaultType::Level3TranslationFault,
            FaultType::Stage2TranslationFault,
        ] {
            assert_eq!(fault.to_smmu_error(), SMMUError::PageNotMapped);
        }
    }

    #[test]
    fn permission_fault_family_projects_to_permission_violation() {
        assert_eq!(
            FaultType::PermissionFault.to_smmu_error(),
            SMMUError::PagePermissionViolation
        );
        assert_eq!(
            FaultType::Stage2PermissionFault.to_smmu_error(),
            SMMUError::PagePermissionViolation
        );
    }

    #[test]
    fn security_fault_projects_to_invalid_security_state_not_permission_violation() {
        let projected = FaultType::SecurityFault.to_smmu_error();
        assert_eq!(projected, SMMUError::InvalidSecurityState);
        assert_ne!(projected, SMMUError::PagePermissionViolation);
        assert_ne!(projected, SMMUError::PageNotMapped);
    }

    #[test]
    fn address_size_fault_projects_to_invalid_address() {
        assert_eq!(
            FaultType::AddressSizeFault.to_smmu_error(),
            SMMUError::InvalidAddress
        );
    }

    #[test]
    fn format_faults_project_to_translation_table_error() {
        for fault in [
            FaultType::ContextDescriptorFormatFault,
            FaultType::TranslationTableFormatFault,
            FaultType::StreamTableFormatFault,
        ] {
            assert_eq!(fault.to_smmu_error(), SMMUError::TranslationTableError);
        }
    }

    #[test]
    fn reverse_mapping_round_trips_for_named_faults() {
        assert_eq!(
            SMMUError::PageNotMapped.to_fault_type(),
            FaultType::TranslationFault
        );
        assert_eq!(
            SMMUError::PagePermissionViolation.to_fault_type(),
            FaultType::PermissionFault
        );
        assert_eq!(
            SMMUError::InvalidSecurityState.to_fault_type(),
            FaultType::SecurityFault
        );
    }
}
