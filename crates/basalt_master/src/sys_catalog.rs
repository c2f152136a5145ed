//! Leader-fenced persistence of catalog entries.
//!
//! The sys catalog is a linearizable store of typed entries. Every write
//! carries the submitting leader's term; the store rejects writes from a term
//! older than the highest it has accepted, which fences deposed masters out
//! of the catalog.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::catalog::{LeaderTerm, TableEntry, TableId, TabletEntry, TabletId};
use crate::error::CatalogError;

/// One typed entry in a sys-catalog write.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CatalogItem {
    Table { id: TableId, entry: TableEntry },
    Tablet { id: TabletId, entry: TabletEntry },
}

impl CatalogItem {
    pub fn table(id: &TableId, entry: &TableEntry) -> Self {
        CatalogItem::Table {
            id: id.clone(),
            entry: entry.clone(),
        }
    }

    pub fn tablet(id: &TabletId, entry: &TabletEntry) -> Self {
        CatalogItem::Tablet {
            id: id.clone(),
            entry: entry.clone(),
        }
    }

    pub fn key(&self) -> String {
        match self {
            CatalogItem::Table { id, .. } => format!("table/{id}"),
            CatalogItem::Tablet { id, .. } => format!("tablet/{id}"),
        }
    }
}

/// Linearizable store of catalog entries with leader-term fencing.
#[async_trait]
pub trait SysCatalog: Send + Sync + 'static {
    async fn update_item(&self, item: CatalogItem, leader_term: LeaderTerm) -> anyhow::Result<()>;

    /// Atomic multi-item write: either every item lands or none do.
    async fn update_items(
        &self,
        items: Vec<CatalogItem>,
        leader_term: LeaderTerm,
    ) -> anyhow::Result<()>;
}

#[derive(Default, Serialize, Deserialize)]
struct JsonCatalogState {
    accepted_term: LeaderTerm,
    entries: BTreeMap<String, serde_json::Value>,
}

/// JSON-file-backed sys catalog. One file holds every entry plus the highest
/// accepted leader term; each write rewrites the file after the fence check.
pub struct JsonSysCatalog {
    path: PathBuf,
    state: tokio::sync::Mutex<JsonCatalogState>,
}

impl JsonSysCatalog {
    pub fn load_or_init(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match fs::read(&path) {
            Ok(data) => {
                serde_json::from_slice(&data).context("decode sys catalog file")?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => JsonCatalogState::default(),
            Err(err) => return Err(err).context("read sys catalog file"),
        };
        Ok(Self {
            path,
            state: tokio::sync::Mutex::new(state),
        })
    }

    pub async fn accepted_term(&self) -> LeaderTerm {
        self.state.lock().await.accepted_term
    }

    pub async fn entry_count(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    async fn write_items(
        &self,
        items: Vec<CatalogItem>,
        leader_term: LeaderTerm,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if leader_term < state.accepted_term {
            return Err(CatalogError::LeaderChanged {
                submitted: leader_term,
                accepted: state.accepted_term,
            }
            .into());
        }
        state.accepted_term = leader_term;
        for item in items {
            let key = item.key();
            let value = serde_json::to_value(&item).context("serialize catalog item")?;
            state.entries.insert(key, value);
        }
        self.persist(&state)
    }

    fn persist(&self, state: &JsonCatalogState) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("create sys catalog dir")?;
        }
        let data = serde_json::to_vec_pretty(state).context("serialize sys catalog")?;
        fs::write(&self.path, data).context("write sys catalog file")?;
        Ok(())
    }
}

#[async_trait]
impl SysCatalog for JsonSysCatalog {
    async fn update_item(&self, item: CatalogItem, leader_term: LeaderTerm) -> anyhow::Result<()> {
        self.write_items(vec![item], leader_term).await
    }

    async fn update_items(
        &self,
        items: Vec<CatalogItem>,
        leader_term: LeaderTerm,
    ) -> anyhow::Result<()> {
        self.write_items(items, leader_term).await
    }
}
