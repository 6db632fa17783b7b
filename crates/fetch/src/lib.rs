//! Replica fetcher (spec.md §4.C): obtains a file record's bytes either
//! by local copy or by asking the driver's `/v1/flush` endpoint, then
//! gates the result against the catalog's trusted checksum when one is
//! advertised by the WebDAV door.

use std::path::{Path, PathBuf};

use catalog::{CatalogGateway, FileRecord};
use common::webdav::WebDavClient;
use digest_engine::Algorithm;
use reqwest::{Client, StatusCode};

const MAX_FETCH_ATTEMPTS: u32 = 3;
/// A non-200 response is retried once and then fails (spec.md §4.C);
/// only transport errors (connection refused, timeout, ...) get the
/// full `MAX_FETCH_ATTEMPTS` budget.
const MAX_STATUS_ATTEMPTS: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("no access hint (localpath/replica_uri) for {0}")]
    NoStrategy(String),
    #[error("fetch of {pnfsid} failed after {attempts} attempts: {source}")]
    Failed {
        pnfsid: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
    /// Checksum mismatch persisted across all retries; caller must drop
    /// the record from its working set (spec.md §4.C).
    #[error("checksum mismatch for {0} persisted after retries, marked download failed")]
    PersistentMismatch(String),
    #[error("catalog error: {0}")]
    Catalog(#[from] catalog::CatalogError),
}

pub struct ReplicaFetcher {
    http: Client,
    webdav: WebDavClient,
    webdav_door: Option<String>,
}

impl ReplicaFetcher {
    pub fn new(http: Client, webdav: WebDavClient, webdav_door: Option<String>) -> Self {
        Self {
            http,
            webdav,
            webdav_door,
        }
    }

    /// Fetches `record`'s bytes into `dest`, gating the result against the
    /// catalog's trusted checksum when the WebDAV door advertises one.
    /// On persistent mismatch, marks the record `download failed` in the
    /// catalog and returns [`FetchError::PersistentMismatch`].
    pub async fn fetch(
        &self,
        catalog: &dyn CatalogGateway,
        record: &FileRecord,
        dest: &Path,
    ) -> Result<(), FetchError> {
        for attempt in 1..=MAX_FETCH_ATTEMPTS {
            self.fetch_once(record, dest).await?;
            match self.checksum_gate(record, dest).await {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    let _ = tokio::fs::remove_file(dest).await;
                    if attempt == MAX_FETCH_ATTEMPTS {
                        catalog.mark_download_failed(&record.pnfsid).await?;
                        return Err(FetchError::PersistentMismatch(record.pnfsid.clone()));
                    }
                },
                Err(_) => {
                    // No trusted checksum available (or the HEAD failed):
                    // the fetch itself succeeded, accept it as-is.
                    return Ok(());
                },
            }
        }
        unreachable!("loop returns or errors before exhausting attempts")
    }

    async fn fetch_once(&self, record: &FileRecord, dest: &Path) -> Result<(), FetchError> {
        if let Some(local) = &record.localpath {
            let local_path = PathBuf::from(local);
            if tokio::fs::metadata(&local_path).await.is_ok() {
                return tokio::fs::copy(&local_path, dest)
                    .await
                    .map(|_| ())
                    .map_err(|e| FetchError::Failed {
                        pnfsid: record.pnfsid.clone(),
                        attempts: 1,
                        source: e.into(),
                    });
            }
        }
        let driver_url = record
            .driver_url
            .as_deref()
            .ok_or_else(|| FetchError::NoStrategy(record.pnfsid.clone()))?;
        let replica_uri = record
            .replica_uri
            .as_deref()
            .ok_or_else(|| FetchError::NoStrategy(record.pnfsid.clone()))?;
        self.http_get_with_retry(driver_url, replica_uri, dest, &record.pnfsid)
            .await
    }

    async fn http_get_with_retry(
        &self,
        driver_url: &str,
        replica_uri: &str,
        dest: &Path,
        pnfsid: &str,
    ) -> Result<(), FetchError> {
        let url = format!("{}/v1/flush", driver_url.trim_end_matches('/'));
        let mut last_err: Option<anyhow::Error> = None;
        let mut status_attempts = 0u32;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self
                .http
                .get(&url)
                .header("file", replica_uri)
                .send()
                .await
            {
                Ok(response) if response.status() == StatusCode::OK => {
                    let bytes = response
                        .bytes()
                        .await
                        .map_err(|e| FetchError::Failed {
                            pnfsid: pnfsid.to_string(),
                            attempts: attempt,
                            source: e.into(),
                        })?;
                    tokio::fs::write(dest, &bytes).await.map_err(|e| FetchError::Failed {
                        pnfsid: pnfsid.to_string(),
                        attempts: attempt,
                        source: e.into(),
                    })?;
                    return Ok(());
                },
                Ok(response) => {
                    status_attempts += 1;
                    last_err = Some(anyhow::anyhow!("unexpected status {}", response.status()));
                    if status_attempts >= MAX_STATUS_ATTEMPTS {
                        break;
                    }
                },
                Err(e) => last_err = Some(e.into()),
            }
            if attempt >= MAX_FETCH_ATTEMPTS {
                break;
            }
        }
        Err(FetchError::Failed {
            pnfsid: pnfsid.to_string(),
            attempts: attempt,
            source: last_err.unwrap_or_else(|| anyhow::anyhow!("unknown fetch failure")),
        })
    }

    /// Returns `Ok(true)` on digest match, `Ok(false)` on mismatch, `Err`
    /// when no trusted remote checksum is available (the gate is then
    /// skipped, not treated as a failure).
    async fn checksum_gate(&self, record: &FileRecord, local_path: &Path) -> anyhow::Result<bool> {
        let webdav_door = self.webdav_door.as_ref().context_missing()?;
        let url = format!("{}/{}/", webdav_door.trim_end_matches('/'), record.path.trim_start_matches('/'));
        let head = self
            .webdav
            .head(&url)
            .await
            .map_err(|e| anyhow::anyhow!(e))?
            .ok_or_else(|| anyhow::anyhow!("no such remote object"))?;
        let digest = head.digest.ok_or_else(|| anyhow::anyhow!("no Digest header"))?;
        let algorithm = Algorithm::parse(&digest.algorithm).map_err(|e| anyhow::anyhow!(e))?;
        let local_digest = digest_engine::digest_file(local_path, algorithm)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        Ok(local_digest.eq_ignore_ascii_case(&digest.value))
    }
}

trait OptionExt<T> {
    fn context_missing(self) -> anyhow::Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn context_missing(self) -> anyhow::Result<T> {
        self.ok_or_else(|| anyhow::anyhow!("webdav_door not configured"))
    }
}

#[cfg(test)]
mod tests {
    use catalog::fake::FakeCatalog;
    use catalog::FileState;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    fn sample_record(driver_url: String, replica_uri: String) -> FileRecord {
        FileRecord {
            pnfsid: "ABC123".into(),
            path: "/data/a/file1".into(),
            parent: "/data/a".into(),
            size: 4,
            ctime: 0,
            store: "store1".into(),
            group: "group1".into(),
            hsm_type: "osm".into(),
            hsm_name: "example".into(),
            replica_uri: Some(replica_uri),
            driver_url: Some(driver_url),
            localpath: None,
            state: FileState::New,
            lock: None,
            archive_url: None,
        }
    }

    #[tokio::test]
    async fn fetches_over_http_without_checksum_gate() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/flush"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"abc".to_vec()))
            .mount(&server)
            .await;

        let fetcher = ReplicaFetcher::new(
            Client::new(),
            WebDavClient::new(Client::new(), None),
            None,
        );
        let catalog = FakeCatalog::new();
        let record = sample_record(server.uri(), "/pnfs/ABC123".into());
        let dest = tempfile::NamedTempFile::new().unwrap();
        fetcher.fetch(&catalog, &record, dest.path()).await.unwrap();
        let contents = tokio::fs::read(dest.path()).await.unwrap();
        assert_eq!(contents, b"abc");
    }

    #[tokio::test]
    async fn retries_once_then_fails_on_persistent_non_200() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/flush"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let fetcher = ReplicaFetcher::new(
            Client::new(),
            WebDavClient::new(Client::new(), None),
            None,
        );
        let catalog = FakeCatalog::new();
        let record = sample_record(server.uri(), "/pnfs/ABC123".into());
        let dest = tempfile::NamedTempFile::new().unwrap();
        let result = fetcher.fetch(&catalog, &record, dest.path()).await;
        assert!(matches!(result, Err(FetchError::Failed { attempts: 2, .. })));
    }

    #[tokio::test]
    async fn copies_local_file_when_localpath_exists() {
        let src = tempfile::NamedTempFile::new().unwrap();
        tokio::fs::write(src.path(), b"local-bytes").await.unwrap();
        let mut record = sample_record("http://unused".into(), "unused".into());
        record.localpath = Some(src.path().to_string_lossy().to_string());

        let fetcher = ReplicaFetcher::new(
            Client::new(),
            WebDavClient::new(Client::new(), None),
            None,
        );
        let catalog = FakeCatalog::new();
        let dest = tempfile::NamedTempFile::new().unwrap();
        fetcher.fetch(&catalog, &record, dest.path()).await.unwrap();
        assert_eq!(tokio::fs::read(dest.path()).await.unwrap(), b"local-bytes");
    }
}
