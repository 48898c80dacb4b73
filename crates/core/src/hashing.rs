//! SHA-256 digests for content fingerprints.
//!
//! A fingerprint covers the file size and its first [`FINGERPRINT_HEAD_BYTES`]
//! bytes: cheap enough to compute during discovery for large recordings, and
//! stable when a sync client rewrites the file's path or mtime.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

/// Bytes read from the start of a file for its fingerprint.
pub const FINGERPRINT_HEAD_BYTES: u64 = 1024 * 1024;

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Fingerprint a file from its size and leading bytes. Blocking.
pub fn file_fingerprint(path: &Path) -> std::io::Result<String> {
    let file = std::fs::File::open(path)?;
    let size = file.metadata()?.len();

    let mut hasher = Sha256::new();
    hasher.update(size.to_le_bytes());

    let mut head = Vec::with_capacity(FINGERPRINT_HEAD_BYTES.min(size) as usize);
    file.take(FINGERPRINT_HEAD_BYTES).read_to_end(&mut head)?;
    hasher.update(&head);

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_produces_known_hash() {
        let hash = sha256_hex(b"");
        assert_eq!(
            hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn identical_content_shares_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.mp4");
        let b = dir.path().join("b.mp4");
        std::fs::write(&a, b"same bytes").unwrap();
        std::fs::write(&b, b"same bytes").unwrap();
        assert_eq!(file_fingerprint(&a).unwrap(), file_fingerprint(&b).unwrap());
    }

    #[test]
    fn size_participates_in_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let short = dir.path().join("short.mp4");
        let long = dir.path().join("long.mp4");
        std::fs::write(&short, vec![7u8; 16]).unwrap();
        std::fs::write(&long, vec![7u8; 32]).unwrap();
        assert_ne!(
            file_fingerprint(&short).unwrap(),
            file_fingerprint(&long).unwrap()
        );
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(file_fingerprint(Path::new("/no/such/file")).is_err());
    }
}
