//! Thin WebDAV client shared by the replica fetcher, the verifier and the
//! stager (spec.md §6). One `reqwest::Client` is built once and cloned
//! around, the way the teacher workspace keeps a single long-lived HTTP
//! client instead of building one per call.

use std::path::Path;

use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION},
    Client, StatusCode,
};
use tokio::io::AsyncWriteExt;

const WANT_DIGEST: &str = "ADLER32,MD5,SHA1";

#[derive(Debug, thiserror::Error)]
pub enum WebDavError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {0} from {1}")]
    Status(StatusCode, String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// A parsed `Digest: <algo>=<value>` response header.
#[derive(Debug, Clone)]
pub struct RemoteDigest {
    pub algorithm: String,
    pub value: String,
}

impl RemoteDigest {
    pub fn parse(header: &str) -> Option<Self> {
        let (algo, value) = header.split_once('=')?;
        Some(Self {
            algorithm: algo.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

#[derive(Clone)]
pub struct WebDavClient {
    client: Client,
    macaroon: Option<String>,
}

impl WebDavClient {
    pub fn new(client: Client, macaroon: Option<String>) -> Self {
        Self { client, macaroon }
    }

    fn auth_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(macaroon) = &self.macaroon {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {macaroon}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    /// `HEAD <url>` with `Want-Digest`, returning the parsed `Digest`
    /// header and the raw `ETag` header when the object exists.
    pub async fn head(&self, url: &str) -> Result<Option<HeadInfo>, WebDavError> {
        let response = self
            .client
            .head(url)
            .headers(self.auth_headers())
            .header("Want-Digest", WANT_DIGEST)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Ok(None);
        }
        let digest = response
            .headers()
            .get("Digest")
            .and_then(|v| v.to_str().ok())
            .and_then(RemoteDigest::parse);
        let etag = response
            .headers()
            .get("ETag")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        Ok(Some(HeadInfo { digest, etag }))
    }

    /// `GET <url>`, streaming the body into `dest`.
    pub async fn get_to_file(&self, url: &str, dest: &Path) -> Result<(), WebDavError> {
        let response = self
            .client
            .get(url)
            .headers(self.auth_headers())
            .send()
            .await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(WebDavError::Status(status, url.to_string()));
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        use futures::StreamExt;
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }

    /// `PUT <url>` with the contents of `src`.
    pub async fn put_file(&self, url: &str, src: &Path) -> Result<(), WebDavError> {
        let bytes = tokio::fs::read(src).await?;
        let response = self
            .client
            .put(url)
            .headers(self.auth_headers())
            .body(bytes)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(WebDavError::Status(status, url.to_string()));
        }
        Ok(())
    }

    /// `DELETE <url>`.
    pub async fn delete(&self, url: &str) -> Result<(), WebDavError> {
        let response = self
            .client
            .delete(url)
            .headers(self.auth_headers())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            return Err(WebDavError::Status(status, url.to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HeadInfo {
    pub digest: Option<RemoteDigest>,
    pub etag: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_digest_header() {
        let d = RemoteDigest::parse("adler32=024d0127").unwrap();
        assert_eq!(d.algorithm, "adler32");
        assert_eq!(d.value, "024d0127");
    }
}
