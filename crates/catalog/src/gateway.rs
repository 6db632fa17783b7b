//! Typed catalog operations (spec.md §4.B). `CatalogGateway` is the sole
//! coordinator between concurrent workers (spec.md §5): every write here
//! is a single-document update filtered by current state, which is what
//! keeps I1–I4 true without cross-document transactions.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::{
    error::CatalogError,
    types::{ArchiveFailureRecord, ArchiveRecord, FailureRecord, FileRecord, NewFileFilter, StageRecord, StageStatus},
};

pub type FileStream<'a> = BoxStream<'a, Result<FileRecord, CatalogError>>;
pub type StageStream<'a> = BoxStream<'a, Result<StageRecord, CatalogError>>;

#[async_trait]
pub trait CatalogGateway: Send + Sync {
    /// Cursor over `files` matching `filter`, ordered by `ctime` ascending,
    /// opened with no cursor timeout and `allowDiskUse` (spec.md §4.B, §5).
    async fn list_new_files<'a>(&'a self, filter: &NewFileFilter) -> Result<FileStream<'a>, CatalogError>;

    async fn count_new_files(&self, filter: &NewFileFilter) -> Result<u64, CatalogError>;

    async fn distinct_parents(&self, path_pattern: &str) -> Result<Vec<String>, CatalogError>;

    async fn claim(&self, pnfsid: &str, container_path: &str, worker_id: &str) -> Result<(), CatalogError>;

    async fn unclaim(&self, container_path: &str) -> Result<(), CatalogError>;

    async fn promote(&self, container_path: &str) -> Result<(), CatalogError>;

    async fn verify(&self, pnfsid: &str, container_path: &str, archive_url: &str) -> Result<(), CatalogError>;

    async fn register_archive(&self, container_path: &str, dest_path: &str) -> Result<(), CatalogError>;

    async fn forget_archive(&self, container_path: &str) -> Result<(), CatalogError>;

    /// Crash-recovery sweep (I5): any `lock=worker_id` resets to `new`;
    /// also any `added:*` with no owning archive record resets to `new`
    /// (spec.md §4.B, §7).
    async fn sanitize(&self, worker_id: &str) -> Result<(), CatalogError>;

    async fn list_archives(&self) -> Result<Vec<ArchiveRecord>, CatalogError>;

    async fn get_archive(&self, container_path: &str) -> Result<Option<ArchiveRecord>, CatalogError>;

    /// Files currently `added:P` or `archived:P` for a given container
    /// path, used by the verifier's cross-check (spec.md §4.F step 2).
    async fn files_for_container(&self, container_path: &str) -> Result<Vec<FileRecord>, CatalogError>;

    async fn reset_file_to_new(&self, pnfsid: &str) -> Result<(), CatalogError>;

    /// Persistent checksum mismatch on fetch (spec.md §4.C): the file
    /// leaves `new` for good, short of an operator resetting it by hand.
    async fn mark_download_failed(&self, pnfsid: &str) -> Result<(), CatalogError>;

    async fn insert_failure(&self, record: FailureRecord) -> Result<(), CatalogError>;

    async fn insert_archive_failure(&self, record: ArchiveFailureRecord) -> Result<(), CatalogError>;

    async fn list_stage_new<'a>(&'a self) -> Result<StageStream<'a>, CatalogError>;

    async fn set_stage_status(&self, pnfsid: &str, status: StageStatus) -> Result<(), CatalogError>;
}
