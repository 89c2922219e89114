//! Content digests for change detection.

use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use sha1::{Digest, Sha1};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// SHA-1 of the file contents plus its Unix mtime, read in 64 KiB chunks.
pub async fn sha1_file(path: &Path) -> io::Result<(String, i64)> {
    let mut file = File::open(path).await?;
    let mtime = mtime_unix(&file.metadata().await?);

    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok((hex::encode(hasher.finalize()), mtime))
}

pub fn sha1_bytes(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn mtime_unix(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .map(|t| DateTime::<Utc>::from(t).timestamp())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashes_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let (hash, mtime) = sha1_file(&path).await.unwrap();
        // sha1("hello")
        assert_eq!(hash, "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
        assert!(mtime > 0);
        assert_eq!(sha1_bytes(b"hello"), hash);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(sha1_file(&dir.path().join("gone.txt")).await.is_err());
    }
}
