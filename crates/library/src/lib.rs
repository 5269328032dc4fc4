//! Archive store services.
//!
//! Files are packed into compressed containers by the
//! [`ArchiveCreationService`], catalogued in the [`ArchiveRegistry`] and read
//! back by the [`ArchiveExtractionService`]. Datasets split over several
//! archives are stitched together by the [`FragmentAssemblyService`]. A
//! [`Session`] builds all of them from a [`tellus_config::Config`].

mod assemble;
mod create;
pub mod error;
mod extract;
mod locations;
mod progress;
mod registry;
mod session;

pub use crate::assemble::{
    AssemblyMode, AssemblyPlan, AssemblyRequest, AssemblyResult, ConflictResolver, ConflictStrategy, DatasetSelector,
    FragmentAssemblyService, FragmentDescriptor, FragmentOverlap, OverlapResolution, PlanComplexity, PlanSegment,
    Resolution,
};
pub use crate::create::{
    ArchiveCreationConfig, ArchiveCreationFilter, ArchiveCreationResult, ArchiveCreationService, SourceFile,
};
pub use crate::extract::{
    ArchiveExtractionFilter, ArchiveExtractionService, ConflictResolution, ExtractionConfig, ExtractionDestination,
    ExtractionMode, ExtractionResult, MemberVerification, VerificationReport,
};
pub use crate::locations::Locations;
pub use crate::progress::{NoProgress, OperationContext, ProgressCallback};
pub use crate::registry::{ArchiveRegistry, RegistryEntry};
pub use crate::session::Session;
