//! Catalog entry types and the in-memory table/tablet registry.
//!
//! Every persistent entry lives behind a per-entry write lock and is mutated
//! through the same discipline: clone the entry, apply the change to the
//! clone, persist the clone through the fenced sys catalog, and only then
//! publish it in memory. The lock is released before any RPC fan-out.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::clock::HybridTime;
use crate::permission::IndexPermission;
use crate::sys_catalog::{CatalogItem, SysCatalog};

pub type TableId = String;
pub type TabletId = String;
pub type TserverUuid = String;
pub type SchemaVersion = u32;
pub type LeaderTerm = u64;

/// Table schema snapshot. The controller only moves schemas around; column
/// semantics live with the tablet servers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<String>,
}

/// Per-index metadata carried on the indexed table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    /// Id of the index's own table.
    pub table_id: TableId,
    /// Id of the table being indexed.
    pub indexed_table_id: TableId,
    /// Absent on legacy entries created before permission-staged builds.
    pub permission: Option<IndexPermission>,
}

/// Lifecycle state of a table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableState {
    Running,
    Altering,
}

/// Properties persisted with a table entry that the backfill path owns.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableProperties {
    /// Read point elected for the in-flight backfill, if any.
    pub backfilling_timestamp: Option<HybridTime>,
    /// Set on an index table until its backfill completes; tablet servers
    /// keep delete markers until it clears.
    pub is_backfilling: bool,
}

/// Snapshot of the last schema version still propagating to tablet servers.
/// Consulted by tablet servers executing at the old version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullyAppliedSnapshot {
    pub schema: TableSchema,
    pub schema_version: SchemaVersion,
    pub indexes: Vec<IndexInfo>,
    pub index_info: Option<IndexInfo>,
}

/// Persistent catalog entry for a table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntry {
    pub name: String,
    pub schema: TableSchema,
    pub schema_version: SchemaVersion,
    pub indexes: Vec<IndexInfo>,
    /// Present when this table is itself an index.
    pub index_info: Option<IndexInfo>,
    pub state: TableState,
    pub state_message: String,
    pub fully_applied: Option<FullyAppliedSnapshot>,
    pub properties: TableProperties,
}

impl TableEntry {
    pub fn new(name: impl Into<String>, schema: TableSchema) -> Self {
        Self {
            name: name.into(),
            schema,
            schema_version: 0,
            indexes: Vec::new(),
            index_info: None,
            state: TableState::Running,
            state_message: String::new(),
            fully_applied: None,
            properties: TableProperties::default(),
        }
    }

    /// Copy the live schema, version and index list into the fully-applied
    /// shadow, before a transition starts propagating.
    pub fn snapshot_fully_applied(&mut self) {
        self.fully_applied = Some(FullyAppliedSnapshot {
            schema: self.schema.clone(),
            schema_version: self.schema_version,
            indexes: self.indexes.clone(),
            index_info: self.index_info.clone(),
        });
    }

    pub fn find_index(&self, index_table_id: &TableId) -> Option<&IndexInfo> {
        self.indexes.iter().find(|i| &i.table_id == index_table_id)
    }

    pub fn index_permission(&self, index_table_id: &TableId) -> Option<IndexPermission> {
        self.find_index(index_table_id).and_then(|i| i.permission)
    }
}

/// Contiguous key range hosted by one tablet. End-exclusive; empty bound =
/// unbounded.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
}

/// Persistent catalog entry for a tablet.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletEntry {
    pub partition: Partition,
    /// Per-index resume key. Empty value = backfill complete for that index;
    /// absent = not started.
    pub backfilled_until: BTreeMap<TableId, Vec<u8>>,
}

/// In-memory handle for a table: the persistent entry behind its write lock,
/// plus runtime-only state.
pub struct TableInfo {
    pub id: TableId,
    entry: RwLock<TableEntry>,
    is_backfilling: AtomicBool,
    tablets: std::sync::RwLock<Vec<Arc<TabletInfo>>>,
}

impl TableInfo {
    pub fn new(id: impl Into<TableId>, entry: TableEntry) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            entry: RwLock::new(entry),
            is_backfilling: AtomicBool::new(false),
            tablets: std::sync::RwLock::new(Vec::new()),
        })
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, TableEntry> {
        self.entry.read().await
    }

    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, TableEntry> {
        self.entry.write().await
    }

    /// Runtime-only marker for an active backfill on this (indexed) table.
    pub fn is_backfilling(&self) -> bool {
        self.is_backfilling.load(Ordering::Acquire)
    }

    /// Test-and-set: returns the previous value, so exactly one caller can
    /// observe the false→true transition.
    pub fn set_is_backfilling(&self, value: bool) -> bool {
        self.is_backfilling.swap(value, Ordering::AcqRel)
    }

    pub fn add_tablet(&self, tablet: Arc<TabletInfo>) {
        self.tablets.write().unwrap().push(tablet);
    }

    pub fn tablets(&self) -> Vec<Arc<TabletInfo>> {
        self.tablets.read().unwrap().clone()
    }
}

/// In-memory handle for a tablet.
pub struct TabletInfo {
    pub id: TabletId,
    pub table_id: TableId,
    /// Tablet server hosting the tablet's leader replica.
    pub tserver: TserverUuid,
    entry: RwLock<TabletEntry>,
}

impl TabletInfo {
    pub fn new(
        id: impl Into<TabletId>,
        table_id: impl Into<TableId>,
        tserver: impl Into<TserverUuid>,
        entry: TabletEntry,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            table_id: table_id.into(),
            tserver: tserver.into(),
            entry: RwLock::new(entry),
        })
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, TabletEntry> {
        self.entry.read().await
    }

    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, TabletEntry> {
        self.entry.write().await
    }
}

/// Minimal table registry standing in for the catalog manager's map.
#[derive(Default)]
pub struct CatalogRegistry {
    tables: std::sync::RwLock<BTreeMap<TableId, Arc<TableInfo>>>,
}

impl CatalogRegistry {
    pub fn add_table(&self, table: Arc<TableInfo>) {
        self.tables
            .write()
            .unwrap()
            .insert(table.id.clone(), table);
    }

    pub fn table(&self, id: &TableId) -> Option<Arc<TableInfo>> {
        self.tables.read().unwrap().get(id).cloned()
    }

    pub fn tables(&self) -> Vec<Arc<TableInfo>> {
        self.tables.read().unwrap().values().cloned().collect()
    }
}

/// Apply `mutate` to a copy of the table entry under its write lock, persist
/// the copy under `term`, and only then publish it in memory. A persistence
/// failure leaves the in-memory entry untouched.
pub async fn mutate_table_entry<F>(
    table: &TableInfo,
    sys_catalog: &dyn SysCatalog,
    term: LeaderTerm,
    mutate: F,
) -> anyhow::Result<()>
where
    F: FnOnce(&mut TableEntry) -> anyhow::Result<()>,
{
    let mut guard = table.write().await;
    let mut dirty = guard.clone();
    mutate(&mut dirty)?;
    sys_catalog
        .update_item(CatalogItem::table(&table.id, &dirty), term)
        .await?;
    *guard = dirty;
    Ok(())
}

/// Tablet-entry variant of [`mutate_table_entry`].
pub async fn mutate_tablet_entry<F>(
    tablet: &TabletInfo,
    sys_catalog: &dyn SysCatalog,
    term: LeaderTerm,
    mutate: F,
) -> anyhow::Result<()>
where
    F: FnOnce(&mut TabletEntry) -> anyhow::Result<()>,
{
    let mut guard = tablet.write().await;
    let mut dirty = guard.clone();
    mutate(&mut dirty)?;
    sys_catalog
        .update_item(CatalogItem::tablet(&tablet.id, &dirty), term)
        .await?;
    *guard = dirty;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with_indexes() -> TableEntry {
        let mut entry = TableEntry::new("users", TableSchema::default());
        entry.schema_version = 7;
        entry.indexes = vec![
            IndexInfo {
                table_id: "i1".to_string(),
                indexed_table_id: "users".to_string(),
                permission: Some(IndexPermission::DeleteOnly),
            },
            IndexInfo {
                table_id: "i2".to_string(),
                indexed_table_id: "users".to_string(),
                permission: None,
            },
        ];
        entry
    }

    #[test]
    fn fully_applied_snapshot_captures_pre_transition_state() {
        let mut entry = entry_with_indexes();
        entry.snapshot_fully_applied();
        entry.schema_version += 1;
        entry.indexes[0].permission = Some(IndexPermission::WriteAndDelete);

        let shadow = entry.fully_applied.as_ref().unwrap();
        assert_eq!(shadow.schema_version, 7);
        assert_eq!(
            shadow.indexes[0].permission,
            Some(IndexPermission::DeleteOnly)
        );
        assert_eq!(entry.schema_version, 8);
    }

    #[test]
    fn find_index_looks_up_by_index_table_id() {
        let entry = entry_with_indexes();
        assert!(entry.find_index(&"i1".to_string()).is_some());
        assert_eq!(
            entry.index_permission(&"i1".to_string()),
            Some(IndexPermission::DeleteOnly)
        );
        assert_eq!(entry.index_permission(&"i2".to_string()), None);
        assert!(entry.find_index(&"missing".to_string()).is_none());
    }

    #[test]
    fn is_backfilling_test_and_set_serializes_starts() {
        let table = TableInfo::new("users", entry_with_indexes());
        assert!(!table.set_is_backfilling(true));
        assert!(table.set_is_backfilling(true));
        assert!(table.is_backfilling());
        assert!(table.set_is_backfilling(false));
        assert!(!table.is_backfilling());
    }
}
