//! Verifier/uploader (spec.md §4.F): uploads sealed containers, compares
//! server-computed digests against a local recomputation, and promotes
//! or rolls back the files inside.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::Duration,
};

use catalog::{ArchiveFailureRecord, ArchiveRecord, CatalogGateway, FailureRecord};
use common::{
    bfid::{container_pnfsid_from_etag, Bfid},
    webdav::WebDavClient,
};
use digest_engine::Algorithm;

const PUT_RETRY_ATTEMPTS: u32 = 3;
const PUT_RETRY_SLEEP: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum VerifierError {
    #[error("catalog error: {0}")]
    Catalog(#[from] catalog::CatalogError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("webdav error: {0}")]
    WebDav(#[from] common::webdav::WebDavError),
    #[error("archive {0} is not a readable zip")]
    BadZip(PathBuf),
    #[error("digest algorithm {0} unsupported")]
    UnsupportedDigest(String),
    /// Upload permanently failed after retries: the spec requires
    /// operator intervention, i.e. a non-zero process exit (spec.md §4.F).
    #[error("upload of {0} failed after retries, operator intervention required")]
    UploadFailed(PathBuf),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct VerifyTickOutcome {
    pub promoted: usize,
    pub digest_mismatches: usize,
    pub missing_archives: usize,
    pub skipped_bad_zip: usize,
}

/// Opens `path` as a ZIP64 archive and returns its entry names, or `None`
/// if the file doesn't exist yet (not flushed by the packer) or is not a
/// valid zip (corrupt / still being written).
fn read_entry_names(path: &Path) -> Result<Option<HashSet<String>>, VerifierError> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match zip::ZipArchive::new(file) {
        Ok(archive) => Ok(Some(archive.file_names().map(str::to_string).collect())),
        Err(_) => Err(VerifierError::BadZip(path.to_path_buf())),
    }
}

/// Runs one tick over every archive record, verifying and promoting or
/// recovering each one in turn (spec.md §4.F).
pub async fn run_verify_tick(
    catalog: &dyn CatalogGateway,
    webdav: &WebDavClient,
    webdav_door: &str,
) -> Result<VerifyTickOutcome, VerifierError> {
    let mut outcome = VerifyTickOutcome::default();
    for archive in catalog.list_archives().await? {
        match verify_one(catalog, webdav, webdav_door, &archive).await {
            Ok(VerifyOneOutcome::Promoted) => outcome.promoted += 1,
            Ok(VerifyOneOutcome::DigestMismatch) => outcome.digest_mismatches += 1,
            Ok(VerifyOneOutcome::MissingArchive) => outcome.missing_archives += 1,
            Ok(VerifyOneOutcome::BadZip) => outcome.skipped_bad_zip += 1,
            Err(VerifierError::UploadFailed(path)) => {
                return Err(VerifierError::UploadFailed(path));
            },
            Err(e) => {
                tracing::error!(archive = %archive.path, error = %e, "verify tick failed for archive");
            },
        }
    }
    Ok(outcome)
}

enum VerifyOneOutcome {
    Promoted,
    DigestMismatch,
    MissingArchive,
    BadZip,
}

async fn verify_one(
    catalog: &dyn CatalogGateway,
    webdav: &WebDavClient,
    webdav_door: &str,
    archive: &ArchiveRecord,
) -> Result<VerifyOneOutcome, VerifierError> {
    let archive_path = PathBuf::from(&archive.path);
    let entries = match read_entry_names(&archive_path) {
        Ok(Some(entries)) => entries,
        Ok(None) => {
            // FileNotFound: reset every archived entry to `new` and
            // forget the archive record.
            for file in catalog.files_for_container(&archive.path).await? {
                catalog.reset_file_to_new(&file.pnfsid).await?;
            }
            catalog.forget_archive(&archive.path).await?;
            return Ok(VerifyOneOutcome::MissingArchive);
        },
        Err(VerifierError::BadZip(path)) => {
            tracing::warn!(archive = %path.display(), "archive not yet flushed or unreadable, skipping this tick");
            return Ok(VerifyOneOutcome::BadZip);
        },
        Err(e) => return Err(e),
    };

    let catalog_files = catalog.files_for_container(&archive.path).await?;
    let catalog_pnfsids: HashSet<String> = catalog_files.iter().map(|f| f.pnfsid.clone()).collect();

    for pnfsid in entries.difference(&catalog_pnfsids) {
        catalog
            .insert_failure(FailureRecord {
                archive_path: archive.path.clone(),
                pnfsid: pnfsid.clone(),
            })
            .await?;
    }
    for pnfsid in catalog_pnfsids.difference(&entries) {
        catalog.reset_file_to_new(pnfsid).await?;
    }
    let cross_checked: Vec<_> = catalog_files
        .into_iter()
        .filter(|f| entries.contains(&f.pnfsid))
        .collect();

    let basename = archive_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| archive.path.clone());
    let url = format!(
        "{}/{}/{}",
        webdav_door.trim_end_matches('/'),
        archive.dest_path.trim_matches('/'),
        basename
    );

    let head = webdav.head(&url).await?;
    let outcome = match head {
        // The object already existed remotely: either someone else's
        // upload (possibly stale/divergent) or a leftover from a
        // previous tick. A mismatch here is a genuine conflict
        // (spec.md §4.F step 3).
        Some(info) => match compare_digest(&archive_path, &info).await? {
            DigestCompare::Match(container_pnfsid) => {
                promote_cross_checked(catalog, archive, &cross_checked, &container_pnfsid).await?;
                let _ = tokio::fs::remove_file(&archive_path).await;
                VerifyOneOutcome::Promoted
            },
            DigestCompare::Mismatch | DigestCompare::NoDigest => {
                catalog
                    .insert_archive_failure(ArchiveFailureRecord {
                        pnfsid: cross_checked.first().map(|f| f.pnfsid.clone()).unwrap_or_default(),
                        location: url.clone(),
                        files: cross_checked.iter().map(|f| f.pnfsid.clone()).collect(),
                    })
                    .await?;
                for file in &cross_checked {
                    catalog.reset_file_to_new(&file.pnfsid).await?;
                }
                catalog.forget_archive(&archive.path).await?;
                let _ = tokio::fs::remove_file(&archive_path).await;
                VerifyOneOutcome::DigestMismatch
            },
        },
        // Not present remotely yet: upload it ourselves, then compare.
        // A mismatch here means our own upload came back wrong; the
        // spec only has the verifier delete the remote object and
        // retry next tick, leaving the archive record and local
        // container untouched (spec.md §4.F step 4).
        None => {
            upload_with_retry(webdav, &url, &archive_path).await?;
            let info = webdav
                .head(&url)
                .await?
                .ok_or_else(|| VerifierError::UploadFailed(archive_path.clone()))?;
            match compare_digest(&archive_path, &info).await? {
                DigestCompare::Match(container_pnfsid) => {
                    promote_cross_checked(catalog, archive, &cross_checked, &container_pnfsid).await?;
                    let _ = tokio::fs::remove_file(&archive_path).await;
                    VerifyOneOutcome::Promoted
                },
                DigestCompare::Mismatch | DigestCompare::NoDigest => {
                    webdav.delete(&url).await?;
                    VerifyOneOutcome::DigestMismatch
                },
            }
        },
    };
    Ok(outcome)
}

enum DigestCompare {
    /// Digest matched; carries the container pnfsid parsed from `ETag`.
    Match(String),
    Mismatch,
    /// Remote responded without a `Digest` header at all.
    NoDigest,
}

async fn compare_digest(archive_path: &Path, info: &common::webdav::HeadInfo) -> Result<DigestCompare, VerifierError> {
    let Some(digest) = &info.digest else {
        return Ok(DigestCompare::NoDigest);
    };
    let algorithm = Algorithm::parse(&digest.algorithm)
        .map_err(|_| VerifierError::UnsupportedDigest(digest.algorithm.clone()))?;
    let local_digest = digest_engine::digest_file(archive_path, algorithm)
        .await
        .map_err(|e| VerifierError::UnsupportedDigest(e.to_string()))?;
    if local_digest.eq_ignore_ascii_case(&digest.value) {
        let container_pnfsid = info
            .etag
            .as_deref()
            .and_then(container_pnfsid_from_etag)
            .unwrap_or_default();
        Ok(DigestCompare::Match(container_pnfsid))
    } else {
        Ok(DigestCompare::Mismatch)
    }
}

async fn promote_cross_checked(
    catalog: &dyn CatalogGateway,
    archive: &ArchiveRecord,
    cross_checked: &[catalog::FileRecord],
    container_pnfsid: &str,
) -> Result<(), VerifierError> {
    for file in cross_checked {
        let bfid = Bfid {
            hsm_type: file.hsm_type.clone(),
            hsm_name: file.hsm_name.clone(),
            store: file.store.clone(),
            group: file.group.clone(),
            pnfsid: file.pnfsid.clone(),
            container_pnfsid: container_pnfsid.to_string(),
        };
        catalog
            .verify(&file.pnfsid, &archive.path, &bfid.to_string())
            .await?;
    }
    catalog.forget_archive(&archive.path).await?;
    Ok(())
}

/// PUTs the sealed container, retrying up to `PUT_RETRY_ATTEMPTS + 1`
/// times, 10 seconds apart (spec.md §4.F, grounded on the
/// `retry_counter <= 3` / `time.sleep(10)` loop in the original
/// `verify_container.py`).
async fn upload_with_retry(webdav: &WebDavClient, url: &str, path: &Path) -> Result<(), VerifierError> {
    let mut last_err = None;
    for attempt in 0..=PUT_RETRY_ATTEMPTS {
        match webdav.put_file(url, path).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                last_err = Some(e);
                if attempt < PUT_RETRY_ATTEMPTS {
                    tokio::time::sleep(PUT_RETRY_SLEEP).await;
                }
            },
        }
    }
    tracing::error!(archive = %path.display(), error = ?last_err, "upload failed after retries");
    Err(VerifierError::UploadFailed(path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use catalog::{fake::FakeCatalog, FileRecord, FileState};
    use reqwest::Client;
    use wiremock::{
        matchers::{method, path as wpath},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    fn sample_file(pnfsid: &str, archive_path: &str) -> FileRecord {
        FileRecord {
            pnfsid: pnfsid.to_string(),
            path: format!("/data/a/{pnfsid}"),
            parent: "/data/a".into(),
            size: 10,
            ctime: 0,
            store: "store1".into(),
            group: "group1".into(),
            hsm_type: "osm".into(),
            hsm_name: "example".into(),
            replica_uri: None,
            driver_url: None,
            localpath: None,
            state: FileState::Archived(archive_path.to_string()),
            lock: None,
            archive_url: None,
        }
    }

    fn make_zip(path: &Path, entries: &[&str]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for entry in entries {
            writer.start_file(*entry, options).unwrap();
            std::io::Write::write_all(&mut writer, b"payload").unwrap();
        }
        writer.finish().unwrap();
    }

    #[tokio::test]
    async fn missing_archive_resets_files_and_forgets_record() {
        let catalog = FakeCatalog::new();
        let archive_path = "/tmp/nonexistent-archive-xyz";
        catalog.insert_file(sample_file("A1", archive_path));
        catalog
            .register_archive(archive_path, "/archives/a")
            .await
            .unwrap();

        let webdav = WebDavClient::new(Client::new(), None);
        let outcome = run_verify_tick(&catalog, &webdav, "http://unused").await.unwrap();
        assert_eq!(outcome.missing_archives, 1);
        assert_eq!(catalog.file("A1").unwrap().state, FileState::New);
        assert!(catalog.list_archives().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn promotes_on_matching_digest() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("container1");
        make_zip(&archive_path, &["A1"]);
        let digest = digest_engine::digest_file(&archive_path, Algorithm::Adler32)
            .await
            .unwrap();

        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(wpath("/archives/a/container1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Digest", format!("adler32={digest}"))
                    .insert_header("ETag", "\"A1_00001\""),
            )
            .mount(&server)
            .await;

        let catalog = FakeCatalog::new();
        let archive_path_str = archive_path.to_string_lossy().to_string();
        catalog.insert_file(sample_file("A1", &archive_path_str));
        catalog
            .register_archive(&archive_path_str, "archives/a")
            .await
            .unwrap();

        let webdav = WebDavClient::new(Client::new(), None);
        let outcome = run_verify_tick(&catalog, &webdav, &server.uri()).await.unwrap();
        assert_eq!(outcome.promoted, 1);
        assert!(matches!(catalog.file("A1").unwrap().state, FileState::Verified(_)));
    }

    #[tokio::test]
    async fn digest_mismatch_resets_and_deletes_remote() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("container1");
        make_zip(&archive_path, &["A1"]);

        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(wpath("/archives/a/container1"))
            .respond_with(
                ResponseTemplate::new(200).insert_header("Digest", "adler32=ffffffff"),
            )
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(wpath("/archives/a/container1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let catalog = FakeCatalog::new();
        let archive_path_str = archive_path.to_string_lossy().to_string();
        catalog.insert_file(sample_file("A1", &archive_path_str));
        catalog
            .register_archive(&archive_path_str, "archives/a")
            .await
            .unwrap();

        let webdav = WebDavClient::new(Client::new(), None);
        let outcome = run_verify_tick(&catalog, &webdav, &server.uri()).await.unwrap();
        assert_eq!(outcome.digest_mismatches, 1);
        assert_eq!(catalog.file("A1").unwrap().state, FileState::New);
        assert!(catalog.list_archives().await.unwrap().is_empty());
        assert_eq!(catalog.archive_failures().len(), 1);
    }
}
