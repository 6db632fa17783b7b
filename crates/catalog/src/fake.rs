//! In-memory `CatalogGateway` for unit tests, in the shape of the
//! teacher's in-memory storage stand-ins (`file_storage/src/tests.rs`):
//! a plain `Mutex`-guarded map per collection instead of a real MongoDB
//! connection.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{
    error::CatalogError,
    gateway::{CatalogGateway, FileStream, StageStream},
    types::{
        ArchiveFailureRecord, ArchiveRecord, FailureRecord, FileRecord, FileState, NewFileFilter,
        StageRecord, StageStatus,
    },
};

#[derive(Default)]
pub struct FakeCatalog {
    files: Mutex<HashMap<String, FileRecord>>,
    archives: Mutex<HashMap<String, ArchiveRecord>>,
    stage: Mutex<HashMap<String, StageRecord>>,
    failures: Mutex<Vec<FailureRecord>>,
    archive_failures: Mutex<Vec<ArchiveFailureRecord>>,
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_file(&self, record: FileRecord) {
        self.files.lock().unwrap().insert(record.pnfsid.clone(), record);
    }

    pub fn insert_stage(&self, record: StageRecord) {
        self.stage.lock().unwrap().insert(record.pnfsid.clone(), record);
    }

    pub fn file(&self, pnfsid: &str) -> Option<FileRecord> {
        self.files.lock().unwrap().get(pnfsid).cloned()
    }

    pub fn stage_record(&self, pnfsid: &str) -> Option<StageRecord> {
        self.stage.lock().unwrap().get(pnfsid).cloned()
    }

    pub fn failures(&self) -> Vec<FailureRecord> {
        self.failures.lock().unwrap().clone()
    }

    pub fn archive_failures(&self) -> Vec<ArchiveFailureRecord> {
        self.archive_failures.lock().unwrap().clone()
    }

    fn matches_filter(record: &FileRecord, filter: &NewFileFilter) -> bool {
        if record.state != FileState::New {
            return false;
        }
        if let Some(p) = &filter.path_pattern {
            if !p.compile().map(|re| re.is_match(&record.path)).unwrap_or(true) {
                return false;
            }
        }
        if let Some(p) = &filter.group_pattern {
            if !p.compile().map(|re| re.is_match(&record.group)).unwrap_or(true) {
                return false;
            }
        }
        if let Some(p) = &filter.store_pattern {
            if !p.compile().map(|re| re.is_match(&record.store)).unwrap_or(true) {
                return false;
            }
        }
        if let Some(max) = filter.ctime_max {
            if record.ctime >= max {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl CatalogGateway for FakeCatalog {
    async fn list_new_files<'a>(&'a self, filter: &NewFileFilter) -> Result<FileStream<'a>, CatalogError> {
        let mut matching: Vec<FileRecord> = self
            .files
            .lock()
            .unwrap()
            .values()
            .filter(|r| Self::matches_filter(r, filter))
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.ctime);
        Ok(Box::pin(stream::iter(matching.into_iter().map(Ok))))
    }

    async fn count_new_files(&self, filter: &NewFileFilter) -> Result<u64, CatalogError> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .values()
            .filter(|r| Self::matches_filter(r, filter))
            .count() as u64)
    }

    async fn distinct_parents(&self, path_pattern: &str) -> Result<Vec<String>, CatalogError> {
        let re = regex::Regex::new(path_pattern)?;
        let mut parents: Vec<String> = self
            .files
            .lock()
            .unwrap()
            .values()
            .map(|r| r.parent.clone())
            .filter(|p| re.is_match(p))
            .collect();
        parents.sort();
        parents.dedup();
        Ok(parents)
    }

    async fn claim(&self, pnfsid: &str, container_path: &str, worker_id: &str) -> Result<(), CatalogError> {
        if let Some(record) = self.files.lock().unwrap().get_mut(pnfsid) {
            record.state = FileState::Added(container_path.to_string());
            record.lock = Some(worker_id.to_string());
        }
        Ok(())
    }

    async fn unclaim(&self, container_path: &str) -> Result<(), CatalogError> {
        for record in self.files.lock().unwrap().values_mut() {
            if record.state == FileState::Added(container_path.to_string()) {
                record.state = FileState::New;
                record.lock = None;
            }
        }
        Ok(())
    }

    async fn promote(&self, container_path: &str) -> Result<(), CatalogError> {
        for record in self.files.lock().unwrap().values_mut() {
            if record.state == FileState::Added(container_path.to_string()) {
                record.state = FileState::Archived(container_path.to_string());
            }
        }
        Ok(())
    }

    async fn verify(&self, pnfsid: &str, container_path: &str, archive_url: &str) -> Result<(), CatalogError> {
        if let Some(record) = self.files.lock().unwrap().get_mut(pnfsid) {
            record.state = FileState::Verified(container_path.to_string());
            record.archive_url = Some(archive_url.to_string());
            record.lock = None;
        }
        Ok(())
    }

    async fn register_archive(&self, container_path: &str, dest_path: &str) -> Result<(), CatalogError> {
        self.archives.lock().unwrap().insert(
            container_path.to_string(),
            ArchiveRecord {
                path: container_path.to_string(),
                dest_path: dest_path.to_string(),
            },
        );
        Ok(())
    }

    async fn forget_archive(&self, container_path: &str) -> Result<(), CatalogError> {
        self.archives.lock().unwrap().remove(container_path);
        Ok(())
    }

    async fn sanitize(&self, worker_id: &str) -> Result<(), CatalogError> {
        let archived_paths: std::collections::HashSet<String> =
            self.archives.lock().unwrap().keys().cloned().collect();
        let mut files = self.files.lock().unwrap();
        for record in files.values_mut() {
            if record.lock.as_deref() == Some(worker_id) {
                record.state = FileState::New;
                record.lock = None;
                continue;
            }
            if let FileState::Added(path) = &record.state {
                if !archived_paths.contains(path) {
                    record.state = FileState::New;
                    record.lock = None;
                }
            }
        }
        Ok(())
    }

    async fn list_archives(&self) -> Result<Vec<ArchiveRecord>, CatalogError> {
        Ok(self.archives.lock().unwrap().values().cloned().collect())
    }

    async fn get_archive(&self, container_path: &str) -> Result<Option<ArchiveRecord>, CatalogError> {
        Ok(self.archives.lock().unwrap().get(container_path).cloned())
    }

    async fn files_for_container(&self, container_path: &str) -> Result<Vec<FileRecord>, CatalogError> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.state.container_path() == Some(container_path))
            .cloned()
            .collect())
    }

    async fn reset_file_to_new(&self, pnfsid: &str) -> Result<(), CatalogError> {
        if let Some(record) = self.files.lock().unwrap().get_mut(pnfsid) {
            record.state = FileState::New;
            record.lock = None;
        }
        Ok(())
    }

    async fn mark_download_failed(&self, pnfsid: &str) -> Result<(), CatalogError> {
        if let Some(record) = self.files.lock().unwrap().get_mut(pnfsid) {
            record.state = FileState::DownloadFailed;
            record.lock = None;
        }
        Ok(())
    }

    async fn insert_failure(&self, record: FailureRecord) -> Result<(), CatalogError> {
        self.failures.lock().unwrap().push(record);
        Ok(())
    }

    async fn insert_archive_failure(&self, record: ArchiveFailureRecord) -> Result<(), CatalogError> {
        self.archive_failures.lock().unwrap().push(record);
        Ok(())
    }

    async fn list_stage_new<'a>(&'a self) -> Result<StageStream<'a>, CatalogError> {
        let matching: Vec<StageRecord> = self
            .stage
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.status == StageStatus::New)
            .cloned()
            .collect();
        Ok(Box::pin(stream::iter(matching.into_iter().map(Ok))))
    }

    async fn set_stage_status(&self, pnfsid: &str, status: StageStatus) -> Result<(), CatalogError> {
        if let Some(record) = self.stage.lock().unwrap().get_mut(pnfsid) {
            record.status = status;
        }
        Ok(())
    }
}
