//! Integrity: SHA-256 content hashes for model files, compared against catalog-declared digests.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// Hash a byte slice. Returns 32-byte digest.
pub fn hash_bytes(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Lowercase hex SHA-256 of a byte slice.
pub fn sha256_hex(payload: &[u8]) -> String {
    hex::encode(hash_bytes(payload))
}

/// Lowercase hex SHA-256 of everything `reader` yields.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Lowercase hex SHA-256 of a file on disk.
pub fn hash_file(path: &Path) -> io::Result<String> {
    hash_reader(File::open(path)?)
}

/// Compare a computed hex digest with a declared one, ignoring case. An empty
/// declaration never matches.
pub fn digest_matches(actual_hex: &str, declared_hex: &str) -> bool {
    let declared = declared_hex.trim();
    !declared.is_empty() && actual_hex.eq_ignore_ascii_case(declared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const HELLO_WORLD: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn known_digest() {
        assert_eq!(sha256_hex(b"hello world"), HELLO_WORLD);
        assert_eq!(hash_reader(&b"hello world"[..]).unwrap(), HELLO_WORLD);
    }

    #[test]
    fn file_digest() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"hello world").unwrap();
        f.flush().unwrap();
        assert_eq!(hash_file(f.path()).unwrap(), HELLO_WORLD);
    }

    #[test]
    fn comparison_ignores_case_but_not_content() {
        assert!(digest_matches(HELLO_WORLD, &HELLO_WORLD.to_uppercase()));
        assert!(!digest_matches(HELLO_WORLD, &sha256_hex(b"tampered")));
        assert!(!digest_matches(HELLO_WORLD, ""));
    }
}
