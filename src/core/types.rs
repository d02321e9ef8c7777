// src/core/types.rs

//! Core identity types: tables, row ranges, range state and server locations.
//!
//! A `QualifiedRange` (table plus row interval) is the primary key of nearly
//! every map in the recovery pipeline, so the ordering and equality rules
//! defined here are load-bearing: ranges sort by table id first, then
//! lexicographically by end row.

use bincode::{Decode, Encode};
use crc::{CRC_64_ECMA_182, Crc};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::Display;

/// The id of the metadata table. Its ranges hold the `Location` column that
/// maps every other range to its owning server.
pub const METADATA_TABLE_ID: &str = "0/0";

/// Prefix shared by all system tables (including the metadata table).
pub const SYSTEM_TABLE_PREFIX: &str = "0/";

/// End row of the root metadata range.
pub const END_ROOT_ROW: &str = "0/0:\u{10ffff}";

/// Numeric id of a commit-log fragment, totally ordered within its directory.
pub type FragmentId = u32;

const LOCATION_HASH: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// A stable table identifier plus a monotone schema generation.
/// Two `TableId`s are equal only if both the id and the generation match.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Encode, Decode,
)]
pub struct TableId {
    pub id: String,
    pub generation: u32,
}

impl TableId {
    pub fn new(id: impl Into<String>, generation: u32) -> Self {
        Self {
            id: id.into(),
            generation,
        }
    }

    pub fn is_metadata(&self) -> bool {
        self.id == METADATA_TABLE_ID
    }

    pub fn is_system(&self) -> bool {
        self.id.starts_with(SYSTEM_TABLE_PREFIX)
    }

    pub fn is_user(&self) -> bool {
        !self.is_system()
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(g{})", self.id, self.generation)
    }
}

/// A half-open row interval `(start_row, end_row]` within one table.
/// An empty `start_row` means minus infinity; an empty `end_row` means plus
/// infinity. The root range carries the `END_ROOT_ROW` sentinel.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Encode,
    Decode,
)]
pub struct RangeSpec {
    pub start_row: String,
    pub end_row: String,
}

impl RangeSpec {
    pub fn new(start_row: impl Into<String>, end_row: impl Into<String>) -> Self {
        Self {
            start_row: start_row.into(),
            end_row: end_row.into(),
        }
    }

    /// Row containment test for the half-open interval.
    pub fn contains(&self, row: &str) -> bool {
        row > self.start_row.as_str() && (self.end_row.is_empty() || row <= self.end_row.as_str())
    }
}

impl fmt::Display for RangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{}]", self.start_row, self.end_row)
    }
}

/// The primary key for every map in the recovery pipeline.
///
/// Ordering compares the table id first and then the range end row, which
/// yields the "ordered iteration by range within a table" the receiver plan
/// relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct QualifiedRange {
    pub table: TableId,
    pub range: RangeSpec,
}

impl QualifiedRange {
    pub fn new(table: TableId, range: RangeSpec) -> Self {
        Self { table, range }
    }

    /// The root range is the metadata range ending at the root sentinel.
    pub fn is_root(&self) -> bool {
        self.table.is_metadata() && self.range.end_row == END_ROOT_ROW
    }

    pub fn range_type(&self) -> RangeType {
        if self.is_root() {
            RangeType::Root
        } else if self.table.is_metadata() {
            RangeType::Metadata
        } else if self.table.is_system() {
            RangeType::System
        } else {
            RangeType::User
        }
    }

    /// Key used by the in-flight move set: the table generation does not
    /// participate, a range move is identified by (table id, range) alone.
    pub fn move_key(&self) -> (String, RangeSpec) {
        (self.table.id.clone(), self.range.clone())
    }
}

impl Ord for QualifiedRange {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.table
            .id
            .cmp(&other.table.id)
            .then_with(|| self.range.end_row.cmp(&other.range.end_row))
            .then_with(|| self.range.start_row.cmp(&other.range.start_row))
    }
}

impl PartialOrd for QualifiedRange {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for QualifiedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.table.id, self.range)
    }
}

/// Criticality class of a range, in recovery order.
#[derive(
    Debug,
    Display,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Encode,
    Decode,
)]
#[strum(serialize_all = "lowercase")]
pub enum RangeType {
    Root,
    Metadata,
    System,
    User,
}

impl RangeType {
    pub const ALL: [RangeType; 4] = [
        RangeType::Root,
        RangeType::Metadata,
        RangeType::System,
        RangeType::User,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Commit-log subdirectory name for this class.
    pub fn log_dir_name(self) -> &'static str {
        match self {
            RangeType::Root => "root",
            RangeType::Metadata => "metadata",
            RangeType::System => "system",
            RangeType::User => "user",
        }
    }
}

/// Base lifecycle states of a range. `PHANTOM` is a bit OR-ed on top of any
/// base state while the range is staged on a recovery destination.
pub mod range_state {
    pub const STEADY: u8 = 0;
    pub const SPLIT_LOG_INSTALLED: u8 = 1;
    pub const SPLIT_SHRUNK: u8 = 2;
    pub const RELINQUISH_LOG_INSTALLED: u8 = 3;
    pub const PHANTOM: u8 = 0x80;
}

/// Persistent state of a range as recorded in the range-server metalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct RangeState {
    pub state: u8,
    pub timestamp: i64,
    pub soft_limit: u64,
    pub transfer_log: Option<String>,
    pub split_point: Option<String>,
    pub old_boundary_row: Option<String>,
}

impl RangeState {
    pub fn steady() -> Self {
        Self::default()
    }

    /// Base state with the phantom bit masked off.
    pub fn base_state(&self) -> u8 {
        self.state & !range_state::PHANTOM
    }

    pub fn is_phantom(&self) -> bool {
        self.state & range_state::PHANTOM != 0
    }

    pub fn set_phantom(&mut self) {
        self.state |= range_state::PHANTOM;
    }

    pub fn clear_phantom(&mut self) {
        self.state &= !range_state::PHANTOM;
    }

    /// True when the source range died mid-split or mid-relinquish, in which
    /// case the prepare phase must set up a second split log.
    pub fn is_split_or_relinquish(&self) -> bool {
        matches!(
            self.base_state(),
            range_state::SPLIT_LOG_INSTALLED
                | range_state::SPLIT_SHRUNK
                | range_state::RELINQUISH_LOG_INSTALLED
        )
    }
}

/// Short stable identifier of a range server (or replication slave), e.g.
/// `rs-1f2e3d4c`. Chosen once per physical server and locked in Hyperspace;
/// survives restarts.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Encode, Decode,
)]
pub struct Location(String);

impl Location {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Derives a deterministic location id from the server's host and port.
    pub fn from_host_port(host: &str, port: u16) -> Self {
        let digest = LOCATION_HASH.checksum(format!("{host}:{port}").as_bytes());
        Self(format!("rs-{:08x}", (digest & 0xffff_ffff) as u32))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One in-flight range movement decision owned by the balance plan authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct RangeMoveSpec {
    pub table: TableId,
    pub range: RangeSpec,
    pub dest_location: Location,
    pub complete: bool,
    pub error: Option<String>,
}

impl RangeMoveSpec {
    pub fn new(table: TableId, range: RangeSpec, dest_location: Location) -> Self {
        Self {
            table,
            range,
            dest_location,
            complete: false,
            error: None,
        }
    }

    pub fn move_key(&self) -> (String, RangeSpec) {
        (self.table.id.clone(), self.range.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_type_classification() {
        let root = QualifiedRange::new(
            TableId::new(METADATA_TABLE_ID, 1),
            RangeSpec::new("", END_ROOT_ROW),
        );
        assert_eq!(root.range_type(), RangeType::Root);

        let meta = QualifiedRange::new(
            TableId::new(METADATA_TABLE_ID, 1),
            RangeSpec::new(END_ROOT_ROW, ""),
        );
        assert_eq!(meta.range_type(), RangeType::Metadata);

        let sys = QualifiedRange::new(TableId::new("0/3", 1), RangeSpec::new("", ""));
        assert_eq!(sys.range_type(), RangeType::System);

        let user = QualifiedRange::new(TableId::new("u1", 1), RangeSpec::new("", "m"));
        assert_eq!(user.range_type(), RangeType::User);
    }

    #[test]
    fn range_contains_is_half_open() {
        let range = RangeSpec::new("a", "m");
        assert!(!range.contains("a"));
        assert!(range.contains("b"));
        assert!(range.contains("m"));
        assert!(!range.contains("n"));

        let unbounded = RangeSpec::new("", "");
        assert!(unbounded.contains("anything"));
    }

    #[test]
    fn location_is_deterministic() {
        let a = Location::from_host_port("host1", 38060);
        let b = Location::from_host_port("host1", 38060);
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("rs-"));
        assert_ne!(a, Location::from_host_port("host1", 38061));
    }

    #[test]
    fn phantom_bit_is_orthogonal_to_base_state() {
        let mut state = RangeState {
            state: range_state::SPLIT_LOG_INSTALLED,
            ..Default::default()
        };
        state.set_phantom();
        assert!(state.is_phantom());
        assert_eq!(state.base_state(), range_state::SPLIT_LOG_INSTALLED);
        state.clear_phantom();
        assert!(!state.is_phantom());
    }
}
