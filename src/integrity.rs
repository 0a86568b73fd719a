use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use sha2::{Sha256, Digest};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("segment {} has {actual} bytes, expected {expected}", .path.display())]
    CorruptSegment { path: PathBuf, expected: u64, actual: u64 },
    #[error("merged file has {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("sha256 mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

/// Compute SHA256 hash of a file asynchronously.
pub async fn sha256_sum(path: &Path) -> Result<String, IntegrityError> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 1024 * 8];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 { break; }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Concatenate `segments` (path, expected length) in order into `destination`.
///
/// Every segment is length-checked before anything is written, and the
/// output is assembled in a sibling temp file that is renamed into place, so
/// a failed merge never leaves partial data at `destination`.
pub async fn merge_segments(segments: &[(PathBuf, u64)], destination: &Path) -> Result<u64, IntegrityError> {
    for (path, expected) in segments {
        let actual = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if actual != *expected {
            return Err(IntegrityError::CorruptSegment {
                path: path.clone(),
                expected: *expected,
                actual,
            });
        }
    }

    if let Some(parent) = destination.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let tmp = PathBuf::from(format!("{}.vdm-merge", destination.to_string_lossy()));
    let result = write_concatenated(segments, &tmp).await;
    match result {
        Ok(written) => {
            tokio::fs::rename(&tmp, destination).await?;
            Ok(written)
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(e)
        }
    }
}

async fn write_concatenated(segments: &[(PathBuf, u64)], out: &Path) -> Result<u64, IntegrityError> {
    let mut writer = BufWriter::new(File::create(out).await?);
    let mut written = 0u64;
    for (path, _) in segments {
        let mut reader = File::open(path).await?;
        written += tokio::io::copy(&mut reader, &mut writer).await?;
    }
    writer.flush().await?;
    writer.into_inner().sync_all().await?;
    Ok(written)
}

/// Check the merged file against the expected size and, optionally, a
/// SHA-256 digest.
pub async fn verify_file(path: &Path, expected_size: u64, expected_sha256: Option<&str>) -> Result<(), IntegrityError> {
    let actual = tokio::fs::metadata(path).await?.len();
    if actual != expected_size {
        return Err(IntegrityError::SizeMismatch { expected: expected_size, actual });
    }
    if let Some(expected) = expected_sha256 {
        let actual = sha256_sum(path).await?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(IntegrityError::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn merges_in_order() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"hello ").unwrap();
        std::fs::write(&b, b"world").unwrap();
        let dest = dir.path().join("out/merged.txt");

        let n = merge_segments(&[(a, 6), (b, 5)], &dest).await.unwrap();
        assert_eq!(n, 11);
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
        verify_file(&dest, 11, None).await.unwrap();
    }

    #[tokio::test]
    async fn wrong_segment_length_writes_nothing() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"12345").unwrap();
        std::fs::write(&b, b"123").unwrap();
        let dest = dir.path().join("merged");

        let err = merge_segments(&[(a, 5), (b.clone(), 4)], &dest).await.unwrap_err();
        match err {
            IntegrityError::CorruptSegment { path, expected, actual } => {
                assert_eq!(path, b);
                assert_eq!((expected, actual), (4, 3));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn verify_detects_size_and_digest_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"abc").unwrap();

        assert!(matches!(
            verify_file(&path, 4, None).await,
            Err(IntegrityError::SizeMismatch { expected: 4, actual: 3 })
        ));

        let abc = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        verify_file(&path, 3, Some(abc)).await.unwrap();
        assert!(matches!(
            verify_file(&path, 3, Some(&"0".repeat(64))).await,
            Err(IntegrityError::ChecksumMismatch { .. })
        ));
    }
}
