// src/core/rangeserver/table_info.rs

//! Arena-owned table and range records.
//!
//! The table map owns every range; cross-references elsewhere are dense
//! integer ids into the arena, never owning references, so there are no
//! cyclic pointer graphs between ranges, table infos and connection
//! handlers.

use crate::core::metalog::RangeEntity;
use crate::core::types::{QualifiedRange, RangeState, TableId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

pub type TableInfoId = usize;
pub type RangeId = usize;

/// One live (or phantom-staged) range record.
#[derive(Debug, Clone)]
pub struct RangeRec {
    pub spec: QualifiedRange,
    pub state: RangeState,
    pub needs_compaction: bool,
    pub load_acknowledged: bool,
    pub entity_id: u64,
    pub original_transfer_log: Option<String>,
}

impl RangeRec {
    pub fn to_entity(&self) -> RangeEntity {
        RangeEntity {
            id: self.entity_id,
            table: self.spec.table.clone(),
            range: self.spec.range.clone(),
            state: self.state.clone(),
            needs_compaction: self.needs_compaction,
            load_acknowledged: self.load_acknowledged,
            original_transfer_log: self.original_transfer_log.clone(),
        }
    }

    pub fn from_entity(entity: RangeEntity) -> Self {
        Self {
            spec: QualifiedRange::new(entity.table, entity.range),
            state: entity.state,
            needs_compaction: entity.needs_compaction,
            load_acknowledged: entity.load_acknowledged,
            entity_id: entity.id,
            original_transfer_log: entity.original_transfer_log,
        }
    }
}

#[derive(Debug)]
pub struct TableInfo {
    pub table: TableId,
    pub schema_generation: u32,
    /// end_row -> range id; lexicographic order is the range order.
    ranges: BTreeMap<String, RangeId>,
}

/// The arena: tables by dense id, ranges by dense id, lookup by table id
/// string.
#[derive(Default)]
pub struct TableInfoArena {
    by_table_id: HashMap<String, TableInfoId>,
    infos: Vec<TableInfo>,
    ranges: Vec<Option<RangeRec>>,
}

impl TableInfoArena {
    pub fn get_or_create_table(&mut self, table: &TableId) -> TableInfoId {
        if let Some(&id) = self.by_table_id.get(&table.id) {
            // Schema generations only move forward.
            if table.generation > self.infos[id].schema_generation {
                self.infos[id].schema_generation = table.generation;
            }
            return id;
        }
        let id = self.infos.len();
        self.infos.push(TableInfo {
            table: table.clone(),
            schema_generation: table.generation,
            ranges: BTreeMap::new(),
        });
        self.by_table_id.insert(table.id.clone(), id);
        id
    }

    pub fn lookup_table(&self, table_id: &str) -> Option<TableInfoId> {
        self.by_table_id.get(table_id).copied()
    }

    pub fn schema_generation(&self, table_id: &str) -> Option<u32> {
        self.lookup_table(table_id)
            .map(|id| self.infos[id].schema_generation)
    }

    pub fn add_range(&mut self, rec: RangeRec) -> RangeId {
        let table_id = self.get_or_create_table(&rec.spec.table);
        let range_id = self.ranges.len();
        self.infos[table_id]
            .ranges
            .insert(rec.spec.range.end_row.clone(), range_id);
        self.ranges.push(Some(rec));
        range_id
    }

    pub fn range_id_of(&self, spec: &QualifiedRange) -> Option<RangeId> {
        let table_id = self.lookup_table(&spec.table.id)?;
        let range_id = *self.infos[table_id].ranges.get(&spec.range.end_row)?;
        let rec = self.ranges[range_id].as_ref()?;
        (rec.spec.range == spec.range).then_some(range_id)
    }

    pub fn has_range(&self, spec: &QualifiedRange) -> bool {
        self.range_id_of(spec).is_some()
    }

    pub fn range(&self, id: RangeId) -> Option<&RangeRec> {
        self.ranges.get(id).and_then(|r| r.as_ref())
    }

    pub fn range_mut(&mut self, id: RangeId) -> Option<&mut RangeRec> {
        self.ranges.get_mut(id).and_then(|r| r.as_mut())
    }

    pub fn remove_range(&mut self, spec: &QualifiedRange) -> Option<RangeRec> {
        let table_id = self.lookup_table(&spec.table.id)?;
        let range_id = *self.infos[table_id].ranges.get(&spec.range.end_row)?;
        if self.ranges[range_id]
            .as_ref()
            .is_none_or(|rec| rec.spec.range != spec.range)
        {
            return None;
        }
        self.infos[table_id].ranges.remove(&spec.range.end_row);
        self.ranges[range_id].take()
    }

    /// All live ranges, in (table, end_row) order.
    pub fn all_ranges(&self) -> Vec<RangeId> {
        self.infos
            .iter()
            .flat_map(|info| info.ranges.values().copied())
            .collect()
    }
}

/// The live table map: many readers, writers hold the map lock only while
/// inserting or removing ranges.
#[derive(Default)]
pub struct TableInfoMap {
    arena: RwLock<TableInfoArena>,
}

impl TableInfoMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, TableInfoArena> {
        self.arena.read()
    }

    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, TableInfoArena> {
        self.arena.write()
    }

    pub fn is_live(&self, spec: &QualifiedRange) -> bool {
        self.arena.read().has_range(spec)
    }

    pub fn all_live(&self, specs: &[QualifiedRange]) -> bool {
        let arena = self.arena.read();
        specs.iter().all(|spec| arena.has_range(spec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RangeSpec;

    fn rec(table: &str, start: &str, end: &str) -> RangeRec {
        RangeRec {
            spec: QualifiedRange::new(TableId::new(table, 1), RangeSpec::new(start, end)),
            state: RangeState::steady(),
            needs_compaction: false,
            load_acknowledged: true,
            entity_id: 1,
            original_transfer_log: None,
        }
    }

    #[test]
    fn add_lookup_remove() {
        let map = TableInfoMap::new();
        {
            let mut arena = map.write();
            arena.add_range(rec("u1", "", "m"));
            arena.add_range(rec("u1", "m", ""));
        }
        let spec = QualifiedRange::new(TableId::new("u1", 1), RangeSpec::new("", "m"));
        assert!(map.is_live(&spec));

        // Same end row, different start row is a different range.
        let other = QualifiedRange::new(TableId::new("u1", 1), RangeSpec::new("a", "m"));
        assert!(!map.is_live(&other));

        map.write().remove_range(&spec);
        assert!(!map.is_live(&spec));
    }
}
