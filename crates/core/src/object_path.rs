//! Content-addressed object keys.

use crate::fingerprint::Fingerprint;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage key derived from an entry's base name and its fingerprint:
/// `name/size/crc32/sha1/name.zip`.
///
/// Identical `(name, fingerprint)` pairs always produce identical paths,
/// which makes the path the deduplication key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectPath(String);

impl ObjectPath {
    /// Derive the object path for an archive entry.
    ///
    /// Only the base name of `entry_name` is used; directory components are
    /// dropped.
    pub fn new(entry_name: &str, fingerprint: &Fingerprint) -> Result<Self> {
        let name = base_name(entry_name)?;
        Ok(Self(format!(
            "{name}/{}/{}/{}/{name}.zip",
            fingerprint.size(),
            fingerprint.crc32_hex(),
            fingerprint.sha1_hex(),
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the single entry stored in the object.
    pub fn entry_name(&self) -> &str {
        self.0.split_once('/').map_or(self.0.as_str(), |(name, _)| name)
    }
}

impl AsRef<str> for ObjectPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Final component of an archive entry name.
///
/// Accepts both `/` and `\` separators. Names ending in a separator, or whose
/// last component is `.` or `..`, have no usable base name.
pub fn base_name(entry_name: &str) -> Result<&str> {
    let name = entry_name.rsplit(['/', '\\']).next().unwrap_or(entry_name);
    match name {
        "" | "." | ".." => Err(Error::InvalidEntryName(entry_name.to_string())),
        name => Ok(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_entry_path() {
        let fp = Fingerprint::compute(b"");
        let path = ObjectPath::new("readme.txt", &fp).unwrap();
        assert_eq!(
            path.as_str(),
            "readme.txt/0/00000000/da39a3ee5e6b4b0d3255bfef95601890afd80709/readme.txt.zip"
        );
    }

    #[test]
    fn test_directories_are_dropped() {
        let fp = Fingerprint::compute(b"hello world");
        let nested = ObjectPath::new("roms/snes/game.sfc", &fp).unwrap();
        let flat = ObjectPath::new("game.sfc", &fp).unwrap();
        let windows = ObjectPath::new("roms\\snes\\game.sfc", &fp).unwrap();
        assert_eq!(nested, flat);
        assert_eq!(windows, flat);
        assert!(flat.as_str().starts_with("game.sfc/11/0d4a1185/"));
        assert!(flat.as_str().ends_with("/game.sfc.zip"));
        assert_eq!(nested.entry_name(), "game.sfc");
    }

    #[test]
    fn test_same_name_same_fingerprint_is_deterministic() {
        let a = ObjectPath::new("x.bin", &Fingerprint::compute(b"abc")).unwrap();
        let b = ObjectPath::new("x.bin", &Fingerprint::compute(b"abc")).unwrap();
        let c = ObjectPath::new("x.bin", &Fingerprint::compute(b"abd")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_unusable_names_rejected() {
        let fp = Fingerprint::compute(b"");
        for name in ["", "dir/", "a/..", ".", "a\\"] {
            assert!(
                matches!(ObjectPath::new(name, &fp), Err(Error::InvalidEntryName(_))),
                "{name:?} should be rejected"
            );
        }
    }
}
