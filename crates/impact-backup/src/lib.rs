//! Encrypted backup lifecycle: snapshot, archive, verify, plan retention,
//! prune and restore.
//!
//! Archives live one per directory under the archive root, each holding an
//! encrypted blob and a plaintext `manifest.json`. Writes are staged in a
//! hidden directory and published with a single rename, so readers never see
//! a partial archive.

pub mod error;
mod format;
pub mod live_store;
pub mod manifest;
pub mod restore;
pub mod retention;
pub mod service;
pub mod snapshot;
pub mod space;
pub mod store;
pub mod verify;
pub mod writer;

pub use error::{ArchiveError, FormatError};
pub use live_store::JsonDirStore;
pub use manifest::{ArchiveKind, ArchiveManifest};
pub use restore::{
    confirmation_token_for, CollectionRestore, CollectionState, RestoreCoordinator, RestoreError,
    RestoreOptions, RestoreOutcome, RestoreReport, RestoreStep,
};
pub use retention::{
    Bucket, PolicyError, RetentionCandidate, RetentionDecision, RetentionPlanner,
    RetentionPolicy, RetentionReason,
};
pub use service::{
    ArchiveSummary, BackupConfig, BackupService, PruneRefusal, PruneReport, RetentionPlan,
    ServiceError, StatusReport, DEFAULT_COLLECTIONS,
};
pub use snapshot::{CollectionSnapshot, SnapshotBuilder, SnapshotError, SnapshotHandle};
pub use space::{DiskSpace, FixedSpace, SpaceProbe};
pub use store::ArchiveStore;
pub use verify::{ArchiveVerifier, VerificationReport, VerifyDepth};
pub use writer::{ArchiveWriter, WriterOptions};

#[cfg(test)]
pub(crate) mod testutil;
