use std::fmt;

/// Content-derived identity of a file: the lowercase hex of its SHA-1.
///
/// Two paths may share a digest (copies); a single path's digest may change
/// across edits. All persistent state keys on `Digest`, never on path.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd, serde::Serialize, serde::Deserialize)]
pub struct Digest(String);

impl Digest {
    pub const HEX_LEN: usize = 40;

    /// Build a `Digest` from a raw 40-char lowercase hex string.
    ///
    /// Panics if `hex` is not exactly `HEX_LEN` lowercase hex characters —
    /// callers only ever construct this from `ContentHasher` output, which
    /// already guarantees the shape; a mismatch is a programmer error.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        let hex = hex.into();
        debug_assert_eq!(hex.len(), Self::HEX_LEN, "digest must be {} hex chars", Self::HEX_LEN);
        debug_assert!(
            hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()),
            "digest must be lowercase hex"
        );
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First two hex characters, used as the shard directory under `blobs/`.
    pub fn shard(&self) -> &str {
        &self.0[..2]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.0)
    }
}
