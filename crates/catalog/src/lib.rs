//! Typed access to the `files`, `archives`, `stage` and failure
//! collections (spec.md §3, §4.B): the catalog is the sole coordinator
//! between concurrent packer/verifier/stager workers.

pub mod error;
pub mod gateway;
pub mod mongo;
pub mod types;

#[cfg(any(test, feature = "fake"))]
pub mod fake;

pub use error::CatalogError;
pub use gateway::{CatalogGateway, FileStream, StageStream};
pub use mongo::MongoCatalog;
pub use types::{
    ArchiveFailureRecord, ArchiveRecord, FailureRecord, FileRecord, FileState, NewFileFilter,
    PathPredicate, StageRecord, StageStatus,
};
