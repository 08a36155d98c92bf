//! SHA-256 digests for chunk files
//!
//! Chunk files are sealed with a digest when they are written and verified
//! again right before they are loaded.

use crate::error::{CommonError, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Compute the hex SHA-256 of a file
pub fn sha256_file(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    sha256_reader(&mut file)
}

/// Compute the hex SHA-256 of any readable source
pub fn sha256_reader<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 of an in-memory buffer
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Verify a file against an expected digest
pub fn verify_sha256(path: impl AsRef<Path>, expected: &str) -> Result<()> {
    let path = path.as_ref();
    let actual = sha256_file(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(CommonError::ChecksumMismatch {
            file: path.display().to_string(),
            expected: expected.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    const HELLO_WORLD: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_sha256_reader() {
        let mut cursor = Cursor::new(b"hello world");
        assert_eq!(sha256_reader(&mut cursor).unwrap(), HELLO_WORLD);
        assert_eq!(sha256_bytes(b"hello world"), HELLO_WORLD);
    }

    #[test]
    fn test_verify_sha256() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();

        verify_sha256(file.path(), HELLO_WORLD).unwrap();

        let err = verify_sha256(file.path(), "deadbeef").unwrap_err();
        assert!(matches!(err, CommonError::ChecksumMismatch { .. }));
    }
}
