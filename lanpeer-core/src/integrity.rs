//! Integrity: whole-file SHA-256 as lowercase hex, streamed so large files are not buffered.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// Incremental content hash, fed block by block while a file is streamed out.
#[derive(Default)]
pub struct ContentHasher {
    inner: Sha256,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, block: &[u8]) {
        self.inner.update(block);
    }

    /// Finish and return the digest as lowercase hex.
    pub fn finish_hex(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

/// Hash a byte slice.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finish_hex()
}

/// Hash the full content of the file at `path`.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = ContentHasher::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finish_hex())
}

/// Compare a computed digest with one received on the wire (hex case ignored).
pub fn digest_matches(computed: &str, declared: &str) -> bool {
    computed.eq_ignore_ascii_case(declared.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn known_digest() {
        assert_eq!(
            hash_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn incremental_equals_one_shot() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let mut hasher = ContentHasher::new();
        for block in data.chunks(1024) {
            hasher.update(block);
        }
        assert_eq!(hasher.finish_hex(), hash_bytes(&data));
    }

    #[test]
    fn file_digest_matches_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data = vec![7u8; 20_000];
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        assert_eq!(hash_file(file.path()).unwrap(), hash_bytes(&data));
    }

    #[test]
    fn digest_comparison_ignores_case() {
        let h = hash_bytes(b"hello");
        assert!(digest_matches(&h, &h.to_uppercase()));
        assert!(!digest_matches(&h, &hash_bytes(b"hellO")));
    }
}
