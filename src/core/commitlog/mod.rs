// src/core/commitlog/mod.rs

//! The append-serialized commit log: an ordered, append-only sequence of
//! self-delimited blocks stored as numbered fragment files on the DFS.
//!
//! Naming conventions within a log directory:
//!   - `<id>` (zero-padded): a fragment file
//!   - `<id>.mark`: the fragment was closed at `<id>`
//!   - `<path>.purged`: fragment fully consumed, ready for deletion
//!   - `<path>.deleted`: tombstone left after garbage collection
//!   - `purged-directory`: the whole directory is garbage-collectable
//!   - `*.tmp`: in-progress writes, ignored by scanners

pub mod block;
pub mod reader;
pub mod writer;

pub use block::{BlockHeader, BlockKind, fletcher32};
pub use reader::{BlockStream, CommitLogReader};
pub use writer::CommitLogWriter;

use crate::core::types::FragmentId;

pub const PURGED_SUFFIX: &str = ".purged";
pub const DELETED_SUFFIX: &str = ".deleted";
pub const MARK_SUFFIX: &str = ".mark";
pub const TMP_SUFFIX: &str = ".tmp";
pub const PURGED_DIRECTORY_MARKER: &str = "purged-directory";

/// Path of fragment `id` within `log_dir`.
pub fn fragment_path(log_dir: &str, id: FragmentId) -> String {
    format!("{}/{:010}", log_dir.trim_end_matches('/'), id)
}

/// Parses a fragment file name (optionally carrying a `.purged` suffix) back
/// into its numeric id. Marker files yield `None`.
pub fn parse_fragment_id(name: &str) -> Option<FragmentId> {
    let base = name.strip_suffix(PURGED_SUFFIX).unwrap_or(name);
    if base.is_empty() || !base.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    base.parse().ok()
}

/// True for `.mark`, `.tmp`, `.deleted` and `purged-directory` entries, which
/// every scanner skips.
pub fn is_marker_file(name: &str) -> bool {
    name == PURGED_DIRECTORY_MARKER
        || name.ends_with(MARK_SUFFIX)
        || name.ends_with(TMP_SUFFIX)
        || name.ends_with(DELETED_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_names_roundtrip() {
        let path = fragment_path("/servers/rs-1/log/user", 42);
        assert_eq!(path, "/servers/rs-1/log/user/0000000042");
        assert_eq!(parse_fragment_id("0000000042"), Some(42));
        assert_eq!(parse_fragment_id("0000000042.purged"), Some(42));
        assert_eq!(parse_fragment_id("0000000042.mark"), None);
        assert_eq!(parse_fragment_id("purged-directory"), None);
    }
}
