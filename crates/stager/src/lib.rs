//! Stager (spec.md §4.G): services catalog stage requests by downloading
//! (and caching) the containing archive and re-pushing the single named
//! entry to the driver.

use std::{collections::HashMap, path::PathBuf};

use catalog::{CatalogGateway, StageRecord, StageStatus};
use common::webdav::WebDavClient;
use futures::TryStreamExt;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum StagerError {
    #[error("catalog error: {0}")]
    Catalog(#[from] catalog::CatalogError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("webdav error: {0}")]
    WebDav(#[from] common::webdav::WebDavError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// The macaroon was rejected; the whole tick aborts (spec.md §4.G).
    #[error("macaroon invalid (401) while resolving {0}")]
    MacaroonInvalid(String),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StageTickOutcome {
    pub done: usize,
    pub failed: usize,
    pub deferred: usize,
    pub evicted_archives: usize,
}

#[derive(Deserialize)]
struct FrontendIdResponse {
    path: String,
}

pub struct Stager {
    http: Client,
    webdav: WebDavClient,
    frontend: String,
    webdav_door: String,
    staging_dir: PathBuf,
    keep_archive_time_min: u64,
    stage_wait_min_secs: f64,
    stage_wait_max_secs: f64,
}

impl Stager {
    pub fn new(
        http: Client,
        webdav: WebDavClient,
        frontend: String,
        webdav_door: String,
        staging_dir: PathBuf,
        keep_archive_time_min: u64,
        stage_wait_min_secs: f64,
        stage_wait_max_secs: f64,
    ) -> Self {
        Self {
            http,
            webdav,
            frontend,
            webdav_door,
            staging_dir,
            keep_archive_time_min,
            stage_wait_min_secs,
            stage_wait_max_secs,
        }
    }

    /// Runs one tick: walks `stage.status=new`, grouped by resolved
    /// archive so a batch only starts once it's "ripe" (SPEC_FULL.md
    /// §4.G's wait-window, derived from `stage_wait_min`/`stage_wait_max`
    /// and each record's `requested_at`), then evicts cold cached
    /// archives.
    pub async fn run_tick(&self, catalog: &dyn CatalogGateway, now: i64) -> Result<StageTickOutcome, StagerError> {
        let mut outcome = StageTickOutcome::default();
        let mut cursor = catalog.list_stage_new().await?;
        let mut records = Vec::new();
        while let Some(record) = cursor.try_next().await? {
            records.push(record);
        }
        drop(cursor);

        let mut groups: HashMap<String, Vec<StageRecord>> = HashMap::new();
        for record in records {
            let key = record
                .locations
                .first()
                .and_then(|loc| archive_pnfsid(loc))
                .unwrap_or_default()
                .to_string();
            groups.entry(key).or_default().push(record);
        }

        for (_archive_pnfsid, batch) in groups {
            let ready = batch.iter().any(|r| {
                let age = r.requested_at().map(|t| now - t).unwrap_or(i64::MAX);
                age as f64 >= self.stage_wait_min_secs || age as f64 >= self.stage_wait_max_secs
            });
            if !ready {
                outcome.deferred += batch.len();
                continue;
            }
            for record in batch {
                match self.stage_one(&record).await {
                    Ok(true) => {
                        catalog.set_stage_status(&record.pnfsid, StageStatus::Done).await?;
                        outcome.done += 1;
                    },
                    Ok(false) => {
                        catalog.set_stage_status(&record.pnfsid, StageStatus::Failure).await?;
                        outcome.failed += 1;
                    },
                    Err(StagerError::MacaroonInvalid(path)) => {
                        tracing::error!(%path, "macaroon invalid, aborting stage tick");
                        return Err(StagerError::MacaroonInvalid(path));
                    },
                    Err(e) => {
                        tracing::error!(pnfsid = %record.pnfsid, error = %e, "stage attempt errored");
                        catalog.set_stage_status(&record.pnfsid, StageStatus::Failure).await?;
                        outcome.failed += 1;
                    },
                }
            }
        }

        outcome.evicted_archives = self.evict_cold_archives(now).await?;
        Ok(outcome)
    }

    /// Walks `record.locations` until one succeeds. Returns `Ok(true)` on
    /// success, `Ok(false)` if every location failed (spec.md §4.G).
    async fn stage_one(&self, record: &StageRecord) -> Result<bool, StagerError> {
        for location in &record.locations {
            let Some(archive_pnfsid) = archive_pnfsid(location) else {
                continue;
            };
            let cached = self.staging_dir.join(archive_pnfsid);
            if tokio::fs::metadata(&cached).await.is_err() {
                if let Err(e) = self.download_archive(archive_pnfsid, &cached).await {
                    if let StagerError::MacaroonInvalid(_) = e {
                        return Err(e);
                    }
                    tracing::warn!(archive = %archive_pnfsid, error = %e, "location unavailable, trying next");
                    continue;
                }
            }
            match self.push_entry(&cached, record).await {
                Ok(true) => {
                    touch(&cached).await;
                    return Ok(true);
                },
                Ok(false) => continue,
                Err(e) => {
                    tracing::warn!(archive = %archive_pnfsid, error = %e, "entry push failed, trying next location");
                    continue;
                },
            }
        }
        Ok(false)
    }

    async fn download_archive(&self, archive_pnfsid: &str, dest: &std::path::Path) -> Result<(), StagerError> {
        let frontend_url = format!("{}/api/v1/id/{archive_pnfsid}", self.frontend.trim_end_matches('/'));
        let response = self.http.get(&frontend_url).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(StagerError::MacaroonInvalid(archive_pnfsid.to_string()));
        }
        if !response.status().is_success() {
            return Err(StagerError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("frontend lookup for {archive_pnfsid} returned {}", response.status()),
            )));
        }
        let parsed: FrontendIdResponse = response.json().await?;
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let webdav_url = format!("{}/{}", self.webdav_door.trim_end_matches('/'), parsed.path.trim_start_matches('/'));
        self.webdav.get_to_file(&webdav_url, dest).await?;
        Ok(())
    }

    /// Opens the cached archive, reads the entry named `pnfsid` and POSTs
    /// it to the driver's `/v1/stage` endpoint. `Ok(false)` on any
    /// non-201 driver response (spec.md §4.G).
    async fn push_entry(&self, archive_path: &std::path::Path, record: &StageRecord) -> Result<bool, StagerError> {
        let archive_path = archive_path.to_path_buf();
        let pnfsid = record.pnfsid.clone();
        let bytes = tokio::task::spawn_blocking(move || read_zip_entry(&archive_path, &pnfsid))
            .await
            .expect("read_zip_entry task panicked")?;

        let url = format!("{}/v1/stage", record.driver_url.trim_end_matches('/'));
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(record.pnfsid.clone())
            .mime_str("text/plain")
            .map_err(StagerError::Http)?;
        let form = reqwest::multipart::Form::new().part("file", part);
        let response = self
            .http
            .post(&url)
            .header("file", &record.filepath)
            .multipart(form)
            .send()
            .await?;
        Ok(response.status() == StatusCode::CREATED)
    }

    /// Deletes any cached archive whose atime is older than
    /// `keep_archive_time_min` minutes (spec.md §4.G cache eviction).
    async fn evict_cold_archives(&self, now: i64) -> Result<usize, StagerError> {
        let mut evicted = 0;
        let mut entries = match tokio::fs::read_dir(&self.staging_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let keep_secs = (self.keep_archive_time_min as i64) * 60;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            let atime = metadata
                .accessed()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(now);
            if now - atime > keep_secs {
                tokio::fs::remove_file(entry.path()).await?;
                evicted += 1;
            }
        }
        Ok(evicted)
    }
}

/// Extracts `<archive-pnfsid>` from a `<scheme>:<archive-pnfsid>`
/// location string (spec.md §4.G step 1): the substring after the last
/// `:`.
fn archive_pnfsid(location: &str) -> Option<&str> {
    location.rsplit(':').next()
}

/// Bumps the cached archive's atime so the eviction pass treats it as
/// freshly used (spec.md §4.G). `atime` doesn't reliably update on read
/// on `noatime` mounts, so this is set explicitly rather than relying on
/// the read in `push_entry` alone.
async fn touch(path: &std::path::Path) {
    let path = path.to_path_buf();
    let _ = tokio::task::spawn_blocking(move || {
        let now = filetime::FileTime::now();
        filetime::set_file_atime(&path, now)
    })
    .await;
}

fn read_zip_entry(archive_path: &std::path::Path, entry_name: &str) -> Result<Vec<u8>, StagerError> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| {
        StagerError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
    })?;
    let mut entry = archive.by_name(entry_name).map_err(|e| {
        StagerError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()))
    })?;
    let mut buf = Vec::new();
    std::io::Read::read_to_end(&mut entry, &mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use catalog::fake::FakeCatalog;
    use wiremock::{
        matchers::{method, path as wpath},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    fn stage_record(pnfsid: &str, filepath: &str, locations: Vec<String>, driver_url: String) -> StageRecord {
        StageRecord {
            id: Some(bson::oid::ObjectId::new()),
            pnfsid: pnfsid.to_string(),
            filepath: filepath.to_string(),
            locations,
            driver_url,
            status: StageStatus::New,
        }
    }

    fn make_zip(path: &std::path::Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, contents) in entries {
            writer.start_file(*name, options).unwrap();
            std::io::Write::write_all(&mut writer, contents).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn archive_pnfsid_takes_substring_after_last_colon() {
        assert_eq!(archive_pnfsid("osm:ARCHIVE123"), Some("ARCHIVE123"));
        assert_eq!(archive_pnfsid("osm:sub:ARCHIVE123"), Some("ARCHIVE123"));
    }

    #[tokio::test]
    async fn second_location_is_tried_when_first_is_missing() {
        let staging_dir = tempfile::tempdir().unwrap();
        let archive_dir = tempfile::tempdir().unwrap();
        let good_archive = archive_dir.path().join("good.zip");
        make_zip(&good_archive, &[("FILE1", b"payload")]);

        let frontend = MockServer::start().await;
        Mock::given(method("GET"))
            .and(wpath("/api/v1/id/MISSING"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&frontend)
            .await;
        Mock::given(method("GET"))
            .and(wpath("/api/v1/id/GOOD"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "path": "/archives/good.zip" })))
            .mount(&frontend)
            .await;

        let webdav = MockServer::start().await;
        Mock::given(method("GET"))
            .and(wpath("/archives/good.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(std::fs::read(&good_archive).unwrap()))
            .mount(&webdav)
            .await;

        let driver = MockServer::start().await;
        Mock::given(method("POST"))
            .and(wpath("/v1/stage"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&driver)
            .await;

        let catalog = FakeCatalog::new();
        let record = stage_record(
            "FILE1",
            "/data/a/FILE1",
            vec!["osm:MISSING".into(), "osm:GOOD".into()],
            driver.uri(),
        );
        catalog.insert_stage(record.clone());

        let stager = Stager::new(
            Client::new(),
            WebDavClient::new(Client::new(), None),
            frontend.uri(),
            webdav.uri(),
            staging_dir.path().to_path_buf(),
            60,
            0.0,
            0.0,
        );
        let outcome = stager.run_tick(&catalog, 1_000_000).await.unwrap();
        assert_eq!(outcome.done, 1);
        assert_eq!(catalog.stage_record("FILE1").unwrap().status, StageStatus::Done);
    }

    #[tokio::test]
    async fn all_locations_failing_marks_failure() {
        let staging_dir = tempfile::tempdir().unwrap();
        let frontend = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&frontend)
            .await;

        let catalog = FakeCatalog::new();
        let record = stage_record("FILE1", "/data/a/FILE1", vec!["osm:MISSING".into()], "http://unused".into());
        catalog.insert_stage(record);

        let stager = Stager::new(
            Client::new(),
            WebDavClient::new(Client::new(), None),
            frontend.uri(),
            "http://unused".into(),
            staging_dir.path().to_path_buf(),
            60,
            0.0,
            0.0,
        );
        let outcome = stager.run_tick(&catalog, 1_000_000).await.unwrap();
        assert_eq!(outcome.failed, 1);
        assert_eq!(catalog.stage_record("FILE1").unwrap().status, StageStatus::Failure);
    }
}
