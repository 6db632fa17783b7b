//! MongoDB-backed `CatalogGateway` (spec.md §4.B). No crate in the teacher
//! pack already wraps Mongo, so this is new, spec-driven surface area
//! (see DESIGN.md); cursor options (`no_cursor_timeout`, `allow_disk_use`,
//! batch size ≥512) mirror `pack-files.py`'s
//! `no_cursor_timeout=True, allow_disk_use=True, batch_size(512)`.

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use mongodb::{options::FindOptions, Client, Collection, Database};

use crate::{
    error::CatalogError,
    gateway::{CatalogGateway, FileStream, StageStream},
    types::{
        ArchiveFailureRecord, ArchiveRecord, FailureRecord, FileRecord, FileState, NewFileFilter,
        StageRecord, StageStatus,
    },
};

const MIN_BATCH_SIZE: u32 = 512;

pub struct MongoCatalog {
    db: Database,
}

impl MongoCatalog {
    pub async fn connect(uri: &str, db_name: &str) -> Result<Self, CatalogError> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(CatalogError::from)?;
        Ok(Self {
            db: client.database(db_name),
        })
    }

    fn files(&self) -> Collection<FileRecord> {
        self.db.collection("files")
    }

    fn archives(&self) -> Collection<ArchiveRecord> {
        self.db.collection("archives")
    }

    fn stage(&self) -> Collection<StageRecord> {
        self.db.collection("stage")
    }

    fn failures(&self) -> Collection<FailureRecord> {
        self.db.collection("failures")
    }

    fn archive_failures(&self) -> Collection<ArchiveFailureRecord> {
        self.db.collection("archive_failure")
    }
}

fn regex_doc(pattern: &str) -> Bson {
    Bson::RegularExpression(bson::Regex {
        pattern: pattern.to_string(),
        options: String::new(),
    })
}

fn new_file_filter_doc(filter: &NewFileFilter) -> Document {
    let mut doc = doc! { "state": "new" };
    if let Some(p) = &filter.path_pattern {
        doc.insert("path", regex_doc(&p.as_regex_str()));
    }
    if let Some(p) = &filter.group_pattern {
        doc.insert("group", regex_doc(&p.as_regex_str()));
    }
    if let Some(p) = &filter.store_pattern {
        doc.insert("store", regex_doc(&p.as_regex_str()));
    }
    if let Some(max) = filter.ctime_max {
        doc.insert("ctime", doc! { "$lt": max });
    }
    doc
}

#[async_trait]
impl CatalogGateway for MongoCatalog {
    async fn list_new_files<'a>(&'a self, filter: &NewFileFilter) -> Result<FileStream<'a>, CatalogError> {
        let options = FindOptions::builder()
            .sort(doc! { "ctime": 1 })
            .no_cursor_timeout(true)
            .allow_disk_use(true)
            .batch_size(MIN_BATCH_SIZE)
            .build();
        let cursor = self
            .files()
            .find(new_file_filter_doc(filter))
            .with_options(options)
            .await
            .map_err(CatalogError::from)?;
        let stream = cursor.map_err(CatalogError::from);
        Ok(Box::pin(stream))
    }

    async fn count_new_files(&self, filter: &NewFileFilter) -> Result<u64, CatalogError> {
        let count = self
            .files()
            .count_documents(new_file_filter_doc(filter))
            .await
            .map_err(CatalogError::from)?;
        Ok(count)
    }

    async fn distinct_parents(&self, path_pattern: &str) -> Result<Vec<String>, CatalogError> {
        let values = self
            .files()
            .distinct("parent", doc! { "parent": regex_doc(path_pattern) })
            .await
            .map_err(CatalogError::from)?;
        Ok(values
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect())
    }

    async fn claim(&self, pnfsid: &str, container_path: &str, worker_id: &str) -> Result<(), CatalogError> {
        let state = FileState::Added(container_path.to_string()).to_string();
        self.files()
            .update_one(
                doc! { "pnfsid": pnfsid },
                doc! { "$set": { "state": state, "lock": worker_id } },
            )
            .await
            .map_err(CatalogError::from)?;
        Ok(())
    }

    async fn unclaim(&self, container_path: &str) -> Result<(), CatalogError> {
        let current = FileState::Added(container_path.to_string()).to_string();
        self.files()
            .update_many(
                doc! { "state": current },
                doc! { "$set": { "state": "new" }, "$unset": { "lock": "" } },
            )
            .await
            .map_err(CatalogError::from)?;
        Ok(())
    }

    async fn promote(&self, container_path: &str) -> Result<(), CatalogError> {
        let current = FileState::Added(container_path.to_string()).to_string();
        let next = FileState::Archived(container_path.to_string()).to_string();
        self.files()
            .update_many(
                doc! { "state": current },
                doc! { "$set": { "state": next } },
            )
            .await
            .map_err(CatalogError::from)?;
        Ok(())
    }

    async fn verify(&self, pnfsid: &str, container_path: &str, archive_url: &str) -> Result<(), CatalogError> {
        let state = FileState::Verified(container_path.to_string()).to_string();
        self.files()
            .update_one(
                doc! { "pnfsid": pnfsid },
                doc! {
                    "$set": { "state": state, "archiveUrl": archive_url },
                    "$unset": { "lock": "" },
                },
            )
            .await
            .map_err(CatalogError::from)?;
        Ok(())
    }

    async fn register_archive(&self, container_path: &str, dest_path: &str) -> Result<(), CatalogError> {
        self.archives()
            .insert_one(ArchiveRecord {
                path: container_path.to_string(),
                dest_path: dest_path.to_string(),
            })
            .await
            .map_err(CatalogError::from)?;
        Ok(())
    }

    async fn forget_archive(&self, container_path: &str) -> Result<(), CatalogError> {
        self.archives()
            .delete_one(doc! { "path": container_path })
            .await
            .map_err(CatalogError::from)?;
        Ok(())
    }

    async fn sanitize(&self, worker_id: &str) -> Result<(), CatalogError> {
        self.files()
            .update_many(
                doc! { "lock": worker_id },
                doc! { "$set": { "state": "new" }, "$unset": { "lock": "" } },
            )
            .await
            .map_err(CatalogError::from)?;

        // `added:*` with no owning archive record: resolve client-side,
        // the pattern match on `state` can't be expressed as a single
        // update filter without knowing every live container path.
        let archived_paths: std::collections::HashSet<String> = self
            .list_archives()
            .await?
            .into_iter()
            .map(|a| a.path)
            .collect();
        let mut cursor = self
            .files()
            .find(doc! { "state": regex_doc("^added: ") })
            .await
            .map_err(CatalogError::from)?;
        let mut orphans = Vec::new();
        while let Some(record) = cursor.try_next().await.map_err(CatalogError::from)? {
            if let Some(path) = record.state.container_path() {
                if !archived_paths.contains(path) {
                    orphans.push(record.pnfsid);
                }
            }
        }
        for pnfsid in orphans {
            self.reset_file_to_new(&pnfsid).await?;
        }
        Ok(())
    }

    async fn list_archives(&self) -> Result<Vec<ArchiveRecord>, CatalogError> {
        let cursor = self
            .archives()
            .find(doc! {})
            .await
            .map_err(CatalogError::from)?;
        let records: Vec<ArchiveRecord> = cursor.try_collect().await.map_err(CatalogError::from)?;
        Ok(records)
    }

    async fn get_archive(&self, container_path: &str) -> Result<Option<ArchiveRecord>, CatalogError> {
        let record = self
            .archives()
            .find_one(doc! { "path": container_path })
            .await
            .map_err(CatalogError::from)?;
        Ok(record)
    }

    async fn files_for_container(&self, container_path: &str) -> Result<Vec<FileRecord>, CatalogError> {
        let added = FileState::Added(container_path.to_string()).to_string();
        let archived = FileState::Archived(container_path.to_string()).to_string();
        let cursor = self
            .files()
            .find(doc! { "state": { "$in": [added, archived] } })
            .await
            .map_err(CatalogError::from)?;
        let records: Vec<FileRecord> = cursor.try_collect().await.map_err(CatalogError::from)?;
        Ok(records)
    }

    async fn reset_file_to_new(&self, pnfsid: &str) -> Result<(), CatalogError> {
        self.files()
            .update_one(
                doc! { "pnfsid": pnfsid },
                doc! { "$set": { "state": "new" }, "$unset": { "lock": "" } },
            )
            .await
            .map_err(CatalogError::from)?;
        Ok(())
    }

    async fn mark_download_failed(&self, pnfsid: &str) -> Result<(), CatalogError> {
        self.files()
            .update_one(
                doc! { "pnfsid": pnfsid },
                doc! { "$set": { "state": "download failed" }, "$unset": { "lock": "" } },
            )
            .await
            .map_err(CatalogError::from)?;
        Ok(())
    }

    async fn insert_failure(&self, record: FailureRecord) -> Result<(), CatalogError> {
        self.failures()
            .insert_one(record)
            .await
            .map_err(CatalogError::from)?;
        Ok(())
    }

    async fn insert_archive_failure(&self, record: ArchiveFailureRecord) -> Result<(), CatalogError> {
        self.archive_failures()
            .insert_one(record)
            .await
            .map_err(CatalogError::from)?;
        Ok(())
    }

    async fn list_stage_new<'a>(&'a self) -> Result<StageStream<'a>, CatalogError> {
        let options = FindOptions::builder()
            .no_cursor_timeout(true)
            .allow_disk_use(true)
            .batch_size(MIN_BATCH_SIZE)
            .build();
        let cursor = self
            .stage()
            .find(doc! { "status": "new" })
            .with_options(options)
            .await
            .map_err(CatalogError::from)?;
        let stream = cursor.map_err(CatalogError::from);
        Ok(Box::pin(stream))
    }

    async fn set_stage_status(&self, pnfsid: &str, status: StageStatus) -> Result<(), CatalogError> {
        let status_str = match status {
            StageStatus::New => "new",
            StageStatus::Done => "done",
            StageStatus::Failure => "failure",
        };
        self.stage()
            .update_one(
                doc! { "pnfsid": pnfsid },
                doc! { "$set": { "status": status_str } },
            )
            .await
            .map_err(CatalogError::from)?;
        Ok(())
    }
}
