use std::path::Path;

use async_trait::async_trait;
use sha1::{Digest as _, Sha1};
use tokio::io::AsyncReadExt;

use crate::digest::Digest;
use crate::error::{CoreError, Result};

/// Bounded so memory use is independent of file size (spec §4.1).
const CHUNK_SIZE: usize = 64 * 1024;

/// Computes a stable content digest for a file path (component C1).
#[async_trait]
pub trait ContentHasher: Send + Sync {
    async fn hash(&self, path: &Path) -> Result<Digest>;
}

/// Streaming SHA-1 hasher. Deterministic: equal bytes yield equal digests,
/// independent of how the underlying reader chunks its output.
#[derive(Debug, Default)]
pub struct Sha1FileHasher;

#[async_trait]
impl ContentHasher for Sha1FileHasher {
    async fn hash(&self, path: &Path) -> Result<Digest> {
        let mut file = tokio::fs::File::open(path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                CoreError::FileMissing { path: path.to_path_buf() }
            } else {
                CoreError::Io(err)
            }
        })?;

        let mut hasher = Sha1::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(Digest::from_hex(hex::encode(hasher.finalize())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn hash_is_stable_across_runs() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"the quick brown fox").unwrap();
        file.flush().unwrap();

        let hasher = Sha1FileHasher;
        let first = hasher.hash(file.path()).await.unwrap();
        let second = hasher.hash(file.path()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.as_str().len(), Digest::HEX_LEN);
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let hasher = Sha1FileHasher;
        let err = hasher.hash(Path::new("/no/such/file-for-test")).await.unwrap_err();
        assert!(matches!(err, CoreError::FileMissing { .. }));
    }

    #[tokio::test]
    async fn large_file_hashes_in_bounded_chunks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let chunk = vec![b'x'; CHUNK_SIZE * 3 + 17];
        file.write_all(&chunk).unwrap();
        file.flush().unwrap();

        let hasher = Sha1FileHasher;
        let digest = hasher.hash(file.path()).await.unwrap();
        assert_eq!(digest.as_str().len(), Digest::HEX_LEN);
    }
}
