//! Content fingerprinting for photo files

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncReadExt;

use crate::error::{Result, SyncError};

/// Read buffer used while streaming a file through the digest
pub const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Compute the hex-encoded SHA-256 digest of a file.
///
/// The file is streamed in fixed-size chunks so large RAW or TIFF captures are
/// never held in memory. Any read failure is returned immediately; callers decide
/// whether to skip the file.
pub async fn hash_file(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();

    let mut file = fs::File::open(path).await.map_err(|e| {
        SyncError::hash_error(path, format!("Failed to open file: {}", e))
    })?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0; HASH_CHUNK_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer).await.map_err(|e| {
            SyncError::hash_error(path, format!("Failed to read file: {}", e))
        })?;

        if bytes_read == 0 {
            break;
        }

        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_known_digest() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("abc.jpg");
        fs::write(&path, b"abc").await.unwrap();

        let digest = hash_file(&path).await.unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_same_content_same_digest() {
        let temp_dir = TempDir::new().unwrap();
        let a = temp_dir.path().join("a.jpg");
        let b = temp_dir.path().join("nested_b.png");
        let content = vec![7u8; HASH_CHUNK_SIZE * 3 + 17];
        fs::write(&a, &content).await.unwrap();
        fs::write(&b, &content).await.unwrap();

        assert_eq!(hash_file(&a).await.unwrap(), hash_file(&b).await.unwrap());
    }

    #[tokio::test]
    async fn test_different_content_different_digest() {
        let temp_dir = TempDir::new().unwrap();
        let a = temp_dir.path().join("a.jpg");
        let b = temp_dir.path().join("b.jpg");
        fs::write(&a, b"first").await.unwrap();
        fs::write(&b, b"second").await.unwrap();

        assert_ne!(hash_file(&a).await.unwrap(), hash_file(&b).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_file_is_hash_error() {
        let temp_dir = TempDir::new().unwrap();
        let result = hash_file(temp_dir.path().join("missing.jpg")).await;

        assert!(matches!(result, Err(SyncError::Hash { .. })));
    }
}
