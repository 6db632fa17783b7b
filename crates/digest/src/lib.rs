//! Streaming digest engine (spec.md §4.A): MD5, SHA-1 and Adler-32 over an
//! arbitrary file, returned in the algorithm's canonical textual form.
//!
//! Grounded on the `_md5`/`_sha1`/`_adler32` helpers in the original
//! `verify_container.py`: MD5/SHA-1 stream in 4 KiB blocks through the
//! RustCrypto `Digest` trait, Adler-32 accumulates across 256 MiB blocks
//! with the running checksum carried between reads and wraps on overflow
//! the way the Python source's explicit `if adler32_value < 0: += 2**32`
//! does (a `u32` wrapping multiply/add needs no special-casing here).

use std::path::Path;

use ::md5::Md5;
use base64::Engine;
use sha1::{Digest as _, Sha1};
use tokio::io::AsyncReadExt;

const SMALL_BLOCK: usize = 4 * 1024;
const ADLER_BLOCK: usize = 256 * 1024 * 1024;
const ADLER_MOD: u32 = 65521;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Md5,
    Sha1,
    Adler32,
}

impl Algorithm {
    /// Algorithm tags are compared case-insensitively (spec.md §9).
    pub fn parse(tag: &str) -> Result<Self, DigestError> {
        match tag.to_ascii_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" | "sha-1" => Ok(Self::Sha1),
            "adler32" => Ok(Self::Adler32),
            other => Err(DigestError::Unsupported(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    #[error("unsupported digest algorithm {0}")]
    Unsupported(String),
    #[error("io error reading {0}: {1}")]
    Io(std::path::PathBuf, std::io::Error),
}

/// Computes the canonical textual digest of `path` under `algorithm`.
pub async fn digest_file(path: &Path, algorithm: Algorithm) -> Result<String, DigestError> {
    match algorithm {
        Algorithm::Md5 => digest_md5(path).await,
        Algorithm::Sha1 => digest_sha1(path).await,
        Algorithm::Adler32 => digest_adler32(path).await,
    }
}

async fn open(path: &Path) -> Result<tokio::fs::File, DigestError> {
    tokio::fs::File::open(path)
        .await
        .map_err(|e| DigestError::Io(path.to_path_buf(), e))
}

async fn digest_md5(path: &Path) -> Result<String, DigestError> {
    let mut file = open(path).await?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; SMALL_BLOCK];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| DigestError::Io(path.to_path_buf(), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(base64::engine::general_purpose::STANDARD.encode(digest))
}

async fn digest_sha1(path: &Path) -> Result<String, DigestError> {
    let mut file = open(path).await?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; SMALL_BLOCK];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| DigestError::Io(path.to_path_buf(), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(hex_lower(&digest))
}

async fn digest_adler32(path: &Path) -> Result<String, DigestError> {
    let mut file = open(path).await?;
    let mut buf = vec![0u8; ADLER_BLOCK];
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| DigestError::Io(path.to_path_buf(), e))?;
        if n == 0 {
            break;
        }
        for &byte in &buf[..n] {
            a = a.wrapping_add(byte as u32) % ADLER_MOD;
            b = b.wrapping_add(a) % ADLER_MOD;
        }
    }
    let value = (b << 16) | a;
    Ok(format!("{value:08x}"))
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    async fn write_temp(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn parses_algorithm_tags_case_insensitively() {
        assert_eq!(Algorithm::parse("MD5").unwrap(), Algorithm::Md5);
        assert_eq!(Algorithm::parse("Sha1").unwrap(), Algorithm::Sha1);
        assert_eq!(Algorithm::parse("ADLER32").unwrap(), Algorithm::Adler32);
        assert!(Algorithm::parse("crc32").is_err());
    }

    #[tokio::test]
    async fn adler32_of_empty_file_is_00000001() {
        let f = write_temp(b"").await;
        let d = digest_file(f.path(), Algorithm::Adler32).await.unwrap();
        assert_eq!(d, "00000001");
    }

    #[tokio::test]
    async fn adler32_of_abc_is_024d0127() {
        let f = write_temp(b"abc").await;
        let d = digest_file(f.path(), Algorithm::Adler32).await.unwrap();
        assert_eq!(d, "024d0127");
    }

    #[tokio::test]
    async fn digest_round_trip_is_deterministic() {
        let f = write_temp(b"hello world, this is a test payload").await;
        for algo in [Algorithm::Md5, Algorithm::Sha1, Algorithm::Adler32] {
            let first = digest_file(f.path(), algo).await.unwrap();
            let second = digest_file(f.path(), algo).await.unwrap();
            assert_eq!(first, second);
        }
    }

    #[tokio::test]
    async fn sha1_is_lowercase_40_hex_chars() {
        let f = write_temp(b"abc").await;
        let d = digest_file(f.path(), Algorithm::Sha1).await.unwrap();
        assert_eq!(d.len(), 40);
        assert!(d.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(d, "a9993e364706816aba3e25717850c26c9cd0d89d");
    }
}
