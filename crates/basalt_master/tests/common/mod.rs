//! Shared test doubles for driving the backfill controller end to end.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use basalt_master::catalog::{
    IndexInfo, LeaderTerm, SchemaVersion, TableEntry, TableInfo, TableSchema, TableState,
    TabletEntry, TabletId, TabletInfo,
};
use basalt_master::clock::HybridTime;
use basalt_master::config::BackfillConfig;
use basalt_master::error::{CatalogError, TabletServerError, TabletServerErrorCode};
use basalt_master::master::{AlterTableBroadcast, MasterContext};
use basalt_master::permission::IndexPermission;
use basalt_master::sys_catalog::{CatalogItem, SysCatalog};
use basalt_master::tablet_rpc::{
    BackfillChunkRequest, BackfillChunkResponse, BackfillDoneRequest, BackfillDoneResponse,
    GetSafeTimeRequest, GetSafeTimeResponse, TabletServerRpc,
};

/// In-memory sys catalog with leader-term fencing, failure injection, and a
/// full history of accepted writes.
#[derive(Default)]
pub struct TestSysCatalog {
    state: Mutex<TestCatalogState>,
    fail_writes: AtomicBool,
}

#[derive(Default)]
struct TestCatalogState {
    accepted_term: LeaderTerm,
    history: Vec<CatalogItem>,
}

impl TestSysCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn write_count(&self) -> usize {
        self.state.lock().unwrap().history.len()
    }

    pub fn history(&self) -> Vec<CatalogItem> {
        self.state.lock().unwrap().history.clone()
    }

    /// Every `backfilling_timestamp` value ever persisted for `table_id`,
    /// deduplicated against the previous write of the same table.
    pub fn persisted_backfill_timestamps(&self, table_id: &str) -> Vec<HybridTime> {
        let mut out = Vec::new();
        let mut last: Option<Option<HybridTime>> = None;
        for item in self.history() {
            if let CatalogItem::Table { id, entry } = item {
                if id != table_id {
                    continue;
                }
                let ts = entry.properties.backfilling_timestamp;
                if last.as_ref() != Some(&ts) {
                    if let Some(ts) = ts {
                        out.push(ts);
                    }
                    last = Some(ts);
                }
            }
        }
        out
    }
}

#[async_trait]
impl SysCatalog for TestSysCatalog {
    async fn update_item(&self, item: CatalogItem, leader_term: LeaderTerm) -> anyhow::Result<()> {
        self.update_items(vec![item], leader_term).await
    }

    async fn update_items(
        &self,
        items: Vec<CatalogItem>,
        leader_term: LeaderTerm,
    ) -> anyhow::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("injected sys catalog write failure");
        }
        let mut state = self.state.lock().unwrap();
        if leader_term < state.accepted_term {
            return Err(CatalogError::LeaderChanged {
                submitted: leader_term,
                accepted: state.accepted_term,
            }
            .into());
        }
        state.accepted_term = leader_term;
        state.history.extend(items);
        Ok(())
    }
}

/// One recorded `BackfillChunk` request.
#[derive(Clone, Debug)]
pub struct ChunkCall {
    pub tablet_id: TabletId,
    pub start_key: Vec<u8>,
    pub read_at: HybridTime,
    pub schema_version: SchemaVersion,
}

/// Scripted tablet server standing in for the whole tablet-server fleet.
///
/// Safe times are fixed per tablet; chunk responses are consumed from a
/// per-tablet script, with "end of tablet" as the default once a script
/// runs dry.
#[derive(Default)]
pub struct MockTabletServer {
    safe_times: Mutex<HashMap<TabletId, Result<u64, TabletServerError>>>,
    chunk_scripts: Mutex<HashMap<TabletId, VecDeque<Result<Vec<u8>, TabletServerError>>>>,
    safe_time_calls: AtomicUsize,
    chunk_log: Mutex<Vec<ChunkCall>>,
    backfill_done_log: Mutex<Vec<TabletId>>,
}

impl MockTabletServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_safe_time(&self, tablet_id: &str, result: Result<u64, TabletServerError>) {
        self.safe_times
            .lock()
            .unwrap()
            .insert(tablet_id.to_string(), result);
    }

    pub fn push_chunks(&self, tablet_id: &str, script: Vec<Result<Vec<u8>, TabletServerError>>) {
        self.chunk_scripts
            .lock()
            .unwrap()
            .insert(tablet_id.to_string(), script.into());
    }

    pub fn safe_time_calls(&self) -> usize {
        self.safe_time_calls.load(Ordering::SeqCst)
    }

    pub fn chunk_calls(&self) -> Vec<ChunkCall> {
        self.chunk_log.lock().unwrap().clone()
    }

    pub fn backfill_done_tablets(&self) -> Vec<TabletId> {
        self.backfill_done_log.lock().unwrap().clone()
    }
}

#[async_trait]
impl TabletServerRpc for MockTabletServer {
    async fn get_safe_time(
        &self,
        req: GetSafeTimeRequest,
    ) -> Result<GetSafeTimeResponse, TabletServerError> {
        self.safe_time_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .safe_times
            .lock()
            .unwrap()
            .get(&req.tablet_id)
            .cloned()
            .unwrap_or_else(|| {
                Err(TabletServerError::new(
                    TabletServerErrorCode::TabletNotFound,
                    format!("no safe time scripted for {}", req.tablet_id),
                ))
            });
        scripted.map(|raw| GetSafeTimeResponse {
            safe_time: HybridTime::from_raw(raw),
            propagated_hybrid_time: req.propagated_hybrid_time,
        })
    }

    async fn backfill_chunk(
        &self,
        req: BackfillChunkRequest,
    ) -> Result<BackfillChunkResponse, TabletServerError> {
        self.chunk_log.lock().unwrap().push(ChunkCall {
            tablet_id: req.tablet_id.clone(),
            start_key: req.start_key.clone(),
            read_at: req.read_at_hybrid_time,
            schema_version: req.schema_version,
        });
        let scripted = self
            .chunk_scripts
            .lock()
            .unwrap()
            .get_mut(&req.tablet_id)
            .and_then(|script| script.pop_front())
            .unwrap_or_else(|| Ok(Vec::new()));
        scripted.map(|backfilled_until| BackfillChunkResponse {
            backfilled_until,
            propagated_hybrid_time: req.propagated_hybrid_time,
        })
    }

    async fn backfill_done(
        &self,
        req: BackfillDoneRequest,
    ) -> Result<BackfillDoneResponse, TabletServerError> {
        self.backfill_done_log.lock().unwrap().push(req.tablet_id);
        Ok(BackfillDoneResponse {
            propagated_hybrid_time: req.propagated_hybrid_time,
        })
    }
}

/// Broadcast hook that only counts invocations.
#[derive(Default)]
pub struct RecordingBroadcast {
    count: AtomicUsize,
}

impl RecordingBroadcast {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl AlterTableBroadcast for RecordingBroadcast {
    fn send_alter_table_request(&self, _table: &Arc<TableInfo>) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Harness {
    pub ctx: Arc<MasterContext>,
    pub tserver: Arc<MockTabletServer>,
    pub sys_catalog: Arc<TestSysCatalog>,
    pub broadcast: Arc<RecordingBroadcast>,
}

/// Build a master context wired to the test doubles, with fast retry knobs.
pub fn new_harness() -> Harness {
    let tserver = MockTabletServer::new();
    let sys_catalog = TestSysCatalog::new();
    let broadcast = Arc::new(RecordingBroadcast::default());
    let config = BackfillConfig {
        rpc_timeout: Duration::from_secs(2),
        rpc_max_retries: 3,
        rpc_max_delay: Duration::from_millis(5),
        wait_for_alter_table_completion: Duration::from_millis(10),
        ..BackfillConfig::default()
    };
    let ctx = MasterContext::new(
        Arc::clone(&sys_catalog) as Arc<dyn SysCatalog>,
        Arc::clone(&tserver) as Arc<dyn TabletServerRpc>,
        Arc::clone(&broadcast) as Arc<dyn AlterTableBroadcast>,
        config,
    );
    ctx.set_leader_ready_term(1);
    Harness {
        ctx,
        tserver,
        sys_catalog,
        broadcast,
    }
}

pub fn index_info(
    index_id: &str,
    indexed_id: &str,
    permission: Option<IndexPermission>,
) -> IndexInfo {
    IndexInfo {
        table_id: index_id.to_string(),
        indexed_table_id: indexed_id.to_string(),
        permission,
    }
}

/// Register an indexed table at `version` with the given indexes.
pub fn make_table(
    ctx: &Arc<MasterContext>,
    id: &str,
    name: &str,
    version: SchemaVersion,
    indexes: Vec<IndexInfo>,
) -> Arc<TableInfo> {
    let mut entry = TableEntry::new(name, TableSchema::default());
    entry.schema_version = version;
    entry.indexes = indexes;
    let table = TableInfo::new(id, entry);
    ctx.catalog.add_table(Arc::clone(&table));
    table
}

/// Register an index's own table, still marked backfilling.
pub fn make_index_table(ctx: &Arc<MasterContext>, id: &str, name: &str) -> Arc<TableInfo> {
    let mut entry = TableEntry::new(name, TableSchema::default());
    entry.index_info = Some(index_info(id, "", None));
    entry.properties.is_backfilling = true;
    entry.state = TableState::Running;
    let table = TableInfo::new(id, entry);
    ctx.catalog.add_table(Arc::clone(&table));
    table
}

pub fn add_tablet(table: &Arc<TableInfo>, id: &str, tserver: &str) -> Arc<TabletInfo> {
    add_tablet_with_entry(table, id, tserver, TabletEntry::default())
}

pub fn add_tablet_with_entry(
    table: &Arc<TableInfo>,
    id: &str,
    tserver: &str,
    entry: TabletEntry,
) -> Arc<TabletInfo> {
    let tablet = TabletInfo::new(id, table.id.clone(), tserver, entry);
    table.add_tablet(Arc::clone(&tablet));
    tablet
}

/// Run one alter-table sweep at the table's current schema version.
pub async fn sweep(ctx: &Arc<MasterContext>, table: &Arc<TableInfo>) -> anyhow::Result<()> {
    let version = table.read().await.schema_version;
    basalt_master::alter_table::launch_next_if_necessary(ctx, table, version).await
}

/// Poll `condition` until it holds, panicking after five seconds.
pub async fn wait_until<F, Fut>(what: &str, condition: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if condition().await {
            return;
        }
        if std::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
