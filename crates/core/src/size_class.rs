//! Size classes used to route uploaded archives to differently sized workers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// Coarse size bucket of an uploaded object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    Small,
    Medium,
    Large,
    XLarge,
}

impl SizeClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
            Self::XLarge => "xlarge",
        }
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human-readable size in whole bytes, KiB or MiB (`512B`, `3K`, `42M`).
pub fn display_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes}B")
    } else if bytes < MIB {
        format!("{}K", bytes / 1024)
    } else {
        format!("{}M", bytes / MIB)
    }
}
