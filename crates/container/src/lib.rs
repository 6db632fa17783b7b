//! Container writer (spec.md §4.D): accumulates file records up to a
//! size threshold (or past it, under old-files override) and streams
//! their bytes into a sealed ZIP64 archive on disk.

use std::path::{Path, PathBuf};

use catalog::{CatalogGateway, FileRecord};
use common::config::VerifyMode;
use fetch::ReplicaFetcher;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("failed to create container file at {0}: {1}")]
    Create(PathBuf, std::io::Error),
    #[error("failed to seal archive {0}: {1}")]
    Seal(PathBuf, std::io::Error),
    #[error("catalog error: {0}")]
    Catalog(#[from] catalog::CatalogError),
}

/// Outcome of [`ContainerWriter::pack`].
#[derive(Debug)]
pub enum PackOutcome {
    /// Sealed, verified and promoted; `entry_count` reserved records made
    /// it into the archive (some may have been dropped by persistent
    /// fetch/checksum failures, spec.md §4.C/§8).
    Sealed { entry_count: usize },
    /// Below `archiveSize` and not in old-files mode: unclaimed and
    /// discarded without touching disk beyond the empty container file.
    DiscardedBelowThreshold,
    /// Sealing failed integrity verification: unclaimed, archive deleted.
    VerificationFailed,
}

/// A container in progress: either still accumulating entries, or sealed
/// and awaiting verification/promotion via [`ContainerWriter::pack`].
pub struct ContainerWriter {
    path: PathBuf,
    scratch_dir: PathBuf,
    dest_path: String,
    archive_size_bytes: u64,
    ctime_old_threshold: i64,
    verify_mode: VerifyMode,
    current_size: u64,
    old_mode: bool,
    reserved: Vec<FileRecord>,
}

impl ContainerWriter {
    /// Allocates a fresh UUID v1 name and creates an empty archive file
    /// under `<work_dir>/container/`. On creation failure the partial
    /// file is removed and [`ContainerError::Create`] is returned
    /// (spec.md §4.D).
    pub async fn new(
        work_dir: &Path,
        archive_size_bytes: u64,
        ctime_old_threshold: i64,
        verify_mode: VerifyMode,
        dest_path: String,
    ) -> Result<Self, ContainerError> {
        let container_dir = work_dir.join("container");
        tokio::fs::create_dir_all(&container_dir)
            .await
            .map_err(|e| ContainerError::Create(container_dir.clone(), e))?;
        let uuid = Uuid::now_v1(&[0, 0, 0, 0, 0, 0]);
        let path = container_dir.join(uuid.to_string());
        if let Err(e) = tokio::fs::File::create(&path).await {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(ContainerError::Create(path, e));
        }
        let scratch_dir = work_dir.join(format!("tmp-{uuid}"));
        tokio::fs::create_dir_all(&scratch_dir)
            .await
            .map_err(|e| ContainerError::Create(scratch_dir.clone(), e))?;
        Ok(Self {
            path,
            scratch_dir,
            dest_path,
            archive_size_bytes,
            ctime_old_threshold,
            verify_mode,
            current_size: 0,
            old_mode: false,
            reserved: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved.len()
    }

    /// Reserves a slot for `record` and claims it in the catalog. Entering
    /// old-files mode is sticky: once set it is never cleared by later,
    /// within-threshold entries (spec.md §4.D, §9).
    pub async fn add(
        &mut self,
        catalog: &dyn CatalogGateway,
        worker_id: &str,
        record: FileRecord,
    ) -> Result<(), ContainerError> {
        if record.ctime < self.ctime_old_threshold {
            self.old_mode = true;
        }
        self.current_size += record.size;
        catalog
            .claim(&record.pnfsid, &self.path.to_string_lossy(), worker_id)
            .await?;
        self.reserved.push(record);
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.current_size >= self.archive_size_bytes
    }

    pub fn is_old_mode(&self) -> bool {
        self.old_mode
    }

    /// Seals the container if it is full or in old-files mode; otherwise
    /// unclaims its reservations and discards it (spec.md §4.D).
    pub async fn pack(
        mut self,
        catalog: &dyn CatalogGateway,
        fetcher: &ReplicaFetcher,
    ) -> Result<PackOutcome, ContainerError> {
        if !self.is_full() && !self.old_mode {
            catalog.unclaim(&self.path.to_string_lossy()).await?;
            self.close().await;
            return Ok(PackOutcome::DiscardedBelowThreshold);
        }

        // Materialize each reserved record, skipping ones that the
        // fetcher permanently drops (checksum mismatch): the spec
        // explicitly allows the container to shrink by one entry and
        // still seal (spec.md §4.C, §8).
        let mut fetched = Vec::with_capacity(self.reserved.len());
        for record in &self.reserved {
            let scratch_path = self.scratch_dir.join(&record.pnfsid);
            match fetcher.fetch(catalog, record, &scratch_path).await {
                Ok(()) => fetched.push(record.clone()),
                Err(fetch::FetchError::PersistentMismatch(_)) => {
                    tracing::warn!(pnfsid = %record.pnfsid, "dropped from container after persistent checksum mismatch");
                },
                Err(e) => {
                    tracing::error!(pnfsid = %record.pnfsid, error = %e, "replica fetch failed, unclaiming container");
                    catalog.unclaim(&self.path.to_string_lossy()).await?;
                    self.close().await;
                    return Err(ContainerError::Catalog(catalog::CatalogError::Operation(
                        anyhow::anyhow!(e),
                    )));
                },
            }
        }

        let scratch_dir = self.scratch_dir.clone();
        let archive_path = self.path.clone();
        let entry_names: Vec<String> = fetched.iter().map(|r| r.pnfsid.clone()).collect();
        let entry_names_for_blocking = entry_names.clone();
        let sealed = tokio::task::spawn_blocking(move || {
            seal_zip(&scratch_dir, &archive_path, &entry_names_for_blocking)
        })
        .await
        .expect("seal_zip task panicked")
        .map_err(|e| ContainerError::Seal(self.path.clone(), e))?;

        if !self.verify(sealed, fetched.len()) {
            catalog.unclaim(&self.path.to_string_lossy()).await?;
            let _ = tokio::fs::remove_file(&self.path).await;
            self.close_scratch_only().await;
            return Ok(PackOutcome::VerificationFailed);
        }

        catalog
            .register_archive(&self.path.to_string_lossy(), &self.dest_path)
            .await?;
        catalog.promote(&self.path.to_string_lossy()).await?;
        self.close_scratch_only().await;
        Ok(PackOutcome::Sealed { entry_count: sealed })
    }

    /// `filelist` checks entry count against the materialized set;
    /// `chksum` is declared but unimplemented upstream and behaves like
    /// `filelist` with a warning (spec.md §4.D, §9); `off` always passes.
    fn verify(&self, sealed_entries: usize, materialized: usize) -> bool {
        match self.verify_mode {
            VerifyMode::Off => true,
            VerifyMode::FileList => sealed_entries == materialized,
            VerifyMode::Chksum => {
                tracing::warn!("verify=chksum is not implemented, falling back to filelist semantics");
                sealed_entries == materialized
            },
        }
    }

    /// Unclaims every reservation and discards the container outright.
    /// Used by the group packer's cooperative shutdown path (spec.md §5):
    /// the in-progress container is closed and unclaimed rather than
    /// handed to `pack()`.
    pub async fn abort(mut self, catalog: &dyn CatalogGateway) -> Result<(), ContainerError> {
        catalog.unclaim(&self.path.to_string_lossy()).await?;
        let _ = tokio::fs::remove_file(&self.path).await;
        self.close_scratch_only().await;
        Ok(())
    }

    /// Releases the archive handle, removes the scratch directory, and
    /// removes the container file if it never sealed (spec.md §4.D).
    pub async fn close(mut self) {
        self.close_scratch_only().await;
        if !self.is_full() && !self.old_mode {
            let _ = tokio::fs::remove_file(&self.path).await;
        }
    }

    async fn close_scratch_only(&mut self) {
        let _ = tokio::fs::remove_dir_all(&self.scratch_dir).await;
    }
}

/// Synchronous ZIP64 sealing step, run via `spawn_blocking`. Iterates the
/// *reserved* (materialized) list, not `listdir(scratch_dir)` — spec.md §9
/// explicitly rejects reproducing the original's `listdir`-based
/// iteration, since its order/completeness depends on which fetches
/// happened to succeed.
fn seal_zip(scratch_dir: &Path, archive_path: &Path, entry_names: &[String]) -> std::io::Result<usize> {
    let file = std::fs::File::create(archive_path)?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .large_file(true);
    let mut count = 0;
    for name in entry_names {
        let src = scratch_dir.join(name);
        let mut contents = std::fs::File::open(&src)?;
        writer.start_file(name, options)?;
        std::io::copy(&mut contents, &mut writer)?;
        count += 1;
    }
    writer.finish()?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use catalog::{fake::FakeCatalog, FileState};
    use common::webdav::WebDavClient;
    use reqwest::Client;

    use super::*;

    fn sample_record(pnfsid: &str, size: u64, ctime: i64, localpath: PathBuf) -> FileRecord {
        FileRecord {
            pnfsid: pnfsid.to_string(),
            path: format!("/data/a/{pnfsid}"),
            parent: "/data/a".into(),
            size,
            ctime,
            store: "store1".into(),
            group: "group1".into(),
            hsm_type: "osm".into(),
            hsm_name: "example".into(),
            replica_uri: None,
            driver_url: None,
            localpath: Some(localpath.to_string_lossy().to_string()),
            state: FileState::New,
            lock: None,
            archive_url: None,
        }
    }

    fn fetcher() -> ReplicaFetcher {
        ReplicaFetcher::new(Client::new(), WebDavClient::new(Client::new(), None), None)
    }

    #[tokio::test]
    async fn seals_when_full_and_promotes() {
        let work_dir = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        let file_a = source.path().join("a");
        tokio::fs::write(&file_a, vec![0u8; 600]).await.unwrap();

        let mut writer = ContainerWriter::new(
            work_dir.path(),
            1000,
            0,
            VerifyMode::FileList,
            "/archives/a".into(),
        )
        .await
        .unwrap();

        let catalog = FakeCatalog::new();
        let record = sample_record("A1", 600, 100, file_a);
        catalog.insert_file(record.clone());
        writer.add(&catalog, "worker1", record.clone()).await.unwrap();
        assert!(!writer.is_full());

        let file_b = source.path().join("b");
        tokio::fs::write(&file_b, vec![0u8; 500]).await.unwrap();
        let record_b = sample_record("B1", 500, 101, file_b);
        catalog.insert_file(record_b.clone());
        writer.add(&catalog, "worker1", record_b.clone()).await.unwrap();
        assert!(writer.is_full());

        let outcome = writer.pack(&catalog, &fetcher()).await.unwrap();
        assert!(matches!(outcome, PackOutcome::Sealed { entry_count: 2 }));
        assert_eq!(
            catalog.file("A1").unwrap().state,
            FileState::Archived(catalog.list_archives().await.unwrap()[0].path.clone())
        );
    }

    #[tokio::test]
    async fn discards_when_below_threshold() {
        let work_dir = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        let file_a = source.path().join("a");
        tokio::fs::write(&file_a, vec![0u8; 100]).await.unwrap();

        let mut writer = ContainerWriter::new(
            work_dir.path(),
            1_000_000,
            0,
            VerifyMode::FileList,
            "/archives/a".into(),
        )
        .await
        .unwrap();
        let catalog = FakeCatalog::new();
        let record = sample_record("A1", 100, 100, file_a);
        catalog.insert_file(record.clone());
        writer.add(&catalog, "worker1", record).await.unwrap();

        let outcome = writer.pack(&catalog, &fetcher()).await.unwrap();
        assert!(matches!(outcome, PackOutcome::DiscardedBelowThreshold));
        assert_eq!(catalog.file("A1").unwrap().state, FileState::New);
        assert!(catalog.list_archives().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn old_mode_is_sticky_and_seals_below_threshold() {
        let work_dir = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        let file_a = source.path().join("a");
        tokio::fs::write(&file_a, vec![0u8; 100]).await.unwrap();

        let mut writer = ContainerWriter::new(
            work_dir.path(),
            1_000_000,
            1000, // ctime_old_threshold: anything before 1000 is "old"
            VerifyMode::FileList,
            "/archives/a".into(),
        )
        .await
        .unwrap();
        let catalog = FakeCatalog::new();
        let record = sample_record("A1", 100, 1, file_a); // ctime=1 < 1000
        catalog.insert_file(record.clone());
        writer.add(&catalog, "worker1", record).await.unwrap();
        assert!(writer.is_old_mode());

        let outcome = writer.pack(&catalog, &fetcher()).await.unwrap();
        assert!(matches!(outcome, PackOutcome::Sealed { entry_count: 1 }));
    }
}
