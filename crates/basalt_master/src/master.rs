//! Shared master-side wiring for the backfill controller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::backfill::JobsTracker;
use crate::catalog::{CatalogRegistry, LeaderTerm, TableInfo};
use crate::clock::HybridClock;
use crate::config::BackfillConfig;
use crate::permission::IndexPermission;
use crate::sys_catalog::SysCatalog;
use crate::tablet_rpc::TabletServerRpc;

/// Pushes a newly persisted schema to every tablet server hosting the table.
/// Implemented by the surrounding catalog manager; invoked after each
/// permission change commits, with no catalog lock held.
pub trait AlterTableBroadcast: Send + Sync + 'static {
    fn send_alter_table_request(&self, table: &Arc<TableInfo>);
}

/// Everything the backfill controller needs from the surrounding master.
pub struct MasterContext {
    pub catalog: CatalogRegistry,
    pub sys_catalog: Arc<dyn SysCatalog>,
    pub tserver_rpc: Arc<dyn TabletServerRpc>,
    pub broadcast: Arc<dyn AlterTableBroadcast>,
    pub clock: Arc<HybridClock>,
    pub jobs: JobsTracker,
    pub config: BackfillConfig,
    leader_term: AtomicU64,
}

impl MasterContext {
    pub fn new(
        sys_catalog: Arc<dyn SysCatalog>,
        tserver_rpc: Arc<dyn TabletServerRpc>,
        broadcast: Arc<dyn AlterTableBroadcast>,
        config: BackfillConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            catalog: CatalogRegistry::default(),
            sys_catalog,
            tserver_rpc,
            broadcast,
            clock: Arc::new(HybridClock::new()),
            jobs: JobsTracker::default(),
            config,
            leader_term: AtomicU64::new(0),
        })
    }

    /// Term of the current leadership; stamped on every catalog write issued
    /// on its behalf.
    pub fn leader_ready_term(&self) -> LeaderTerm {
        self.leader_term.load(Ordering::Acquire)
    }

    pub fn set_leader_ready_term(&self, term: LeaderTerm) {
        self.leader_term.store(term, Ordering::Release);
    }

    /// Leader-bootstrap pass: re-run the alter-table sweep for every table
    /// with an index left mid-backfill by a previous leader. The relaunched
    /// coordinator picks up the persisted read time and per-tablet
    /// checkpoints, so completed work is not repeated.
    pub async fn resume_pending_backfills(self: &Arc<Self>) -> anyhow::Result<usize> {
        let mut resumed = 0;
        for table in self.catalog.tables() {
            let (version, has_pending) = {
                let entry = table.read().await;
                let pending = entry
                    .indexes
                    .iter()
                    .any(|i| i.permission == Some(IndexPermission::DoBackfill));
                (entry.schema_version, pending)
            };
            if !has_pending {
                continue;
            }
            tracing::info!(table = %table.id, version, "resuming index backfill after leader change");
            crate::alter_table::launch_next_if_necessary(self, &table, version).await?;
            resumed += 1;
        }
        Ok(resumed)
    }
}
