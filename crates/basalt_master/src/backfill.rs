//! Backfill orchestration: the per-table coordinator, per-tablet drivers,
//! and the monitored job handle.
//!
//! One `BackfillTable` runs per indexed table with an index at `DoBackfill`.
//! It first elects a snapshot read point by fanning `GetSafeTime` out to
//! every tablet and max-reducing the answers, persists the choice, then fans
//! out one `BackfillTablet` driver per tablet. Each driver walks its tablet
//! chunk by chunk, persisting the resume key after every chunk. The last
//! tablet to finish promotes the index; the first failure aborts the run and
//! sends the index down the removal branch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Instant;

use anyhow::Context;

use crate::catalog::{
    mutate_table_entry, mutate_tablet_entry, IndexInfo, LeaderTerm, SchemaVersion, TableId,
    TableInfo, TableState, TabletInfo,
};
use crate::clock::HybridTime;
use crate::countdown::Countdown;
use crate::error::CatalogError;
use crate::master::MasterContext;
use crate::permission::IndexPermission;
use crate::sys_catalog::CatalogItem;
use crate::tablet_rpc::{
    BackfillChunkRequest, BackfillDoneRequest, GetSafeTimeRequest, RpcRetrier,
};

/// Lifecycle of one monitored backfill job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum JobState {
    Scheduling = 0,
    Running = 1,
    Complete = 2,
    Failed = 3,
    Aborted = 4,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed | JobState::Aborted)
    }

    fn from_u8(value: u8) -> JobState {
        match value {
            0 => JobState::Scheduling,
            1 => JobState::Running,
            2 => JobState::Complete,
            3 => JobState::Failed,
            _ => JobState::Aborted,
        }
    }
}

/// Monitored handle for one backfill run.
///
/// The coordinator owns the job; the job only holds a weak back-reference so
/// a finished coordinator can drop. Once it is gone, `description` falls back
/// to the cached index label.
pub struct BackfillJob {
    index_label: String,
    state: AtomicU8,
    table: Weak<BackfillTable>,
    done_at: OnceLock<Instant>,
}

impl BackfillJob {
    fn new(index_label: String, table: Weak<BackfillTable>) -> Self {
        Self {
            index_label,
            state: AtomicU8::new(JobState::Scheduling as u8),
            table,
            done_at: OnceLock::new(),
        }
    }

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `new_state` unless the job already reached a terminal state.
    /// The first transition into a terminal state fires `mark_done` exactly
    /// once.
    pub fn set_state(&self, new_state: JobState) {
        let old = self.state();
        if old.is_terminal() {
            return;
        }
        if self
            .state
            .compare_exchange(
                old as u8,
                new_state as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
            && new_state.is_terminal()
        {
            self.mark_done();
        }
    }

    /// CAS from any non-terminal state to `Aborted`; returns the state the
    /// job was in before the abort (or the terminal state it already held).
    pub fn abort_and_return_prev_state(&self) -> JobState {
        loop {
            let old = self.state();
            if old.is_terminal() {
                return old;
            }
            if self
                .state
                .compare_exchange(
                    old as u8,
                    JobState::Aborted as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.mark_done();
                return old;
            }
        }
    }

    fn mark_done(&self) {
        let _ = self.done_at.set(Instant::now());
    }

    pub fn completed_at(&self) -> Option<Instant> {
        self.done_at.get().copied()
    }

    pub fn description(&self) -> String {
        let state = self.state();
        if !state.is_terminal() {
            if let Some(table) = self.table.upgrade() {
                return table.description();
            }
        }
        match state {
            JobState::Failed => format!("Backfilling {} failed", self.index_label),
            JobState::Aborted => format!("Backfilling {} aborted", self.index_label),
            JobState::Complete => format!("Backfilling {} done", self.index_label),
            JobState::Scheduling | JobState::Running => {
                format!("Backfilling {}", self.index_label)
            }
        }
    }
}

/// Registry of monitored jobs, for admin rendering.
#[derive(Default)]
pub struct JobsTracker {
    jobs: Mutex<Vec<Arc<BackfillJob>>>,
}

impl JobsTracker {
    pub fn add(&self, job: Arc<BackfillJob>) {
        self.jobs.lock().unwrap().push(job);
    }

    pub fn jobs(&self) -> Vec<Arc<BackfillJob>> {
        self.jobs.lock().unwrap().clone()
    }
}

/// Coordinates one index backfill across every tablet of the indexed table.
pub struct BackfillTable {
    ctx: Arc<MasterContext>,
    indexed_table: Arc<TableInfo>,
    /// Exactly one index is built per pass.
    index_to_build: IndexInfo,
    index_label: String,
    schema_version: SchemaVersion,
    /// Fencing token stamped on every catalog write of this run.
    leader_term: LeaderTerm,
    read_time: Mutex<HybridTime>,
    timestamp_chosen: AtomicBool,
    done: AtomicBool,
    num_tablets: AtomicUsize,
    tablets_pending: Countdown,
    job: OnceLock<Arc<BackfillJob>>,
}

impl BackfillTable {
    pub async fn new(
        ctx: Arc<MasterContext>,
        indexed_table: Arc<TableInfo>,
        index_to_build: IndexInfo,
    ) -> Arc<Self> {
        let index_label = match ctx.catalog.table(&index_to_build.table_id) {
            Some(index_table) => index_table.read().await.name.clone(),
            None => index_to_build.table_id.clone(),
        };
        let (schema_version, restored_read_time) = {
            let entry = indexed_table.read().await;
            (entry.schema_version, entry.properties.backfilling_timestamp)
        };
        let leader_term = ctx.leader_ready_term();
        let read_time = restored_read_time
            .filter(|ht| ht.is_valid())
            .unwrap_or(HybridTime::INVALID);
        if read_time.is_valid() {
            tracing::info!(
                table = %indexed_table.id,
                read_time = %read_time,
                "resuming backfill with the persisted read time"
            );
        }

        Arc::new(Self {
            ctx,
            indexed_table,
            index_to_build,
            index_label,
            schema_version,
            leader_term,
            timestamp_chosen: AtomicBool::new(read_time.is_valid()),
            read_time: Mutex::new(read_time),
            done: AtomicBool::new(false),
            num_tablets: AtomicUsize::new(0),
            tablets_pending: Countdown::new(),
            job: OnceLock::new(),
        })
    }

    /// Register the monitored job and kick off either the safe-time election
    /// or, on a resume, the backfill phase directly.
    pub fn launch(self: &Arc<Self>) {
        let job = Arc::new(BackfillJob::new(
            self.index_label.clone(),
            Arc::downgrade(self),
        ));
        job.set_state(JobState::Running);
        self.ctx.jobs.add(Arc::clone(&job));
        let _ = self.job.set(job);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = if this.timestamp_chosen() {
                this.launch_backfill().await
            } else {
                this.launch_safe_time_election().await
            };
            if let Err(err) = result {
                tracing::warn!(table = %this.indexed_table.id, error = ?err, "backfill launch failed");
            }
        });
    }

    pub fn timestamp_chosen(&self) -> bool {
        self.timestamp_chosen.load(Ordering::Acquire)
    }

    pub fn done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn read_time(&self) -> HybridTime {
        *self.read_time.lock().unwrap()
    }

    pub fn index_table_id(&self) -> &TableId {
        &self.index_to_build.table_id
    }

    pub fn description(&self) -> String {
        let pending = self.tablets_pending.remaining();
        let total = self.num_tablets.load(Ordering::Acquire);
        if !self.timestamp_chosen() {
            format!(
                "Backfill {}: waiting on safe time from {pending}/{total} tablets",
                self.index_label
            )
        } else if self.done() {
            format!("Backfill {}: done", self.index_label)
        } else {
            format!(
                "Backfill {}: backfilling {pending}/{total} tablets",
                self.index_label
            )
        }
    }

    /// Fan `GetSafeTime` out to every tablet of the indexed table.
    async fn launch_safe_time_election(self: &Arc<Self>) -> anyhow::Result<()> {
        let tablets = self.indexed_table.tablets();
        self.num_tablets.store(tablets.len(), Ordering::Release);
        let empty = self.tablets_pending.arm(tablets.len());
        let min_cutoff = self.ctx.clock.now();

        if empty {
            // Nothing will ever respond; the cutoff itself is a correct read
            // point for a table with no tablets.
            self.persist_chosen_read_time(min_cutoff).await?;
            *self.read_time.lock().unwrap() = min_cutoff;
            self.timestamp_chosen.store(true, Ordering::Release);
            return self.launch_backfill().await;
        }

        tracing::info!(
            table = %self.indexed_table.id,
            tablets = tablets.len(),
            min_cutoff = %min_cutoff,
            "electing a safe read time for the backfill"
        );
        for tablet in tablets {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let result = this.get_safe_time_with_retries(&tablet, min_cutoff).await;
                if let Err(err) = this.update_safe_time(result).await {
                    tracing::warn!(tablet = %tablet.id, error = ?err, "could not reduce safe time");
                }
            });
        }
        Ok(())
    }

    async fn get_safe_time_with_retries(
        &self,
        tablet: &TabletInfo,
        min_cutoff: HybridTime,
    ) -> anyhow::Result<HybridTime> {
        let response = RpcRetrier::new(&self.ctx.config, &self.ctx.clock)
            .run("get safe time", || {
                let req = GetSafeTimeRequest {
                    dest_uuid: tablet.tserver.clone(),
                    tablet_id: tablet.id.clone(),
                    min_hybrid_time_for_backfill: min_cutoff,
                    propagated_hybrid_time: self.ctx.clock.now(),
                };
                let rpc = Arc::clone(&self.ctx.tserver_rpc);
                async move { rpc.get_safe_time(req).await }
            })
            .await
            .with_context(|| format!("GetSafeTime on tablet {}", tablet.id))?;
        if !response.safe_time.is_valid() {
            anyhow::bail!("tablet {} returned an invalid safe time", tablet.id);
        }
        Ok(response.safe_time)
    }

    /// Max-reduce one `GetSafeTime` answer. A failure aborts the election
    /// at most once; the last successful responder persists the chosen
    /// timestamp and starts the backfill phase.
    pub(crate) async fn update_safe_time(
        self: &Arc<Self>,
        result: anyhow::Result<HybridTime>,
    ) -> anyhow::Result<()> {
        let ht = match result {
            Err(err) => {
                tracing::error!(
                    table = %self.indexed_table.id,
                    error = ?err,
                    "could not compute a safe read time, aborting the backfill"
                );
                if !self.timestamp_chosen.swap(true, Ordering::AcqRel) {
                    self.alter_table_state_to_abort()
                        .await
                        .context("failed to mark backfill as failed, abandoning")?;
                }
                return Ok(());
            }
            Ok(ht) => ht,
        };

        let chosen = {
            let mut read_time = self.read_time.lock().unwrap();
            if ht > *read_time {
                *read_time = ht;
            }
            *read_time
        };

        if self.timestamp_chosen() || !self.tablets_pending.complete_one() {
            return Ok(());
        }

        // Last responder: commit the election result exactly once.
        self.persist_chosen_read_time(chosen).await?;
        self.timestamp_chosen.store(true, Ordering::Release);
        self.launch_backfill().await
    }

    async fn persist_chosen_read_time(&self, chosen: HybridTime) -> anyhow::Result<()> {
        mutate_table_entry(
            &self.indexed_table,
            self.ctx.sys_catalog.as_ref(),
            self.leader_term,
            |entry| {
                entry.properties.backfilling_timestamp = Some(chosen);
                Ok(())
            },
        )
        .await
        .context("failed to persist backfilling timestamp, abandoning")?;
        tracing::info!(
            table = %self.indexed_table.id,
            read_time = %chosen,
            "chose and persisted the backfill read time"
        );
        Ok(())
    }

    /// Fan one `BackfillTablet` driver out per tablet.
    async fn launch_backfill(self: &Arc<Self>) -> anyhow::Result<()> {
        let tablets = self.indexed_table.tablets();
        self.num_tablets.store(tablets.len(), Ordering::Release);
        let empty = self.tablets_pending.arm(tablets.len());
        tracing::info!(
            table = %self.indexed_table.id,
            tablets = tablets.len(),
            read_time = %self.read_time(),
            "launching backfill"
        );

        if empty {
            // No tablets means nothing to build; complete inline.
            self.done.store(true, Ordering::Release);
            return self.alter_table_state_to_success().await;
        }

        for tablet in tablets {
            let driver = BackfillTablet::new(Arc::clone(self), tablet).await;
            tokio::spawn(driver.run());
        }
        Ok(())
    }

    /// Completion reduction. The first error latches `done` and aborts; the
    /// last successful tablet latches `done` and promotes the index.
    pub(crate) async fn tablet_done(&self, result: anyhow::Result<()>) -> anyhow::Result<()> {
        match result {
            Err(err) => {
                tracing::error!(
                    table = %self.indexed_table.id,
                    error = ?err,
                    "failed to backfill the index"
                );
                if !self.done.swap(true, Ordering::AcqRel) {
                    self.alter_table_state_to_abort()
                        .await
                        .context("failed to mark backfill as failed")?;
                } else {
                    tracing::info!(
                        table = %self.indexed_table.id,
                        "the backfill was already aborted by another tablet"
                    );
                }
                Ok(())
            }
            Ok(()) => {
                if self.done() || !self.tablets_pending.complete_one() {
                    return Ok(());
                }
                self.done.store(true, Ordering::Release);
                tracing::info!(table = %self.indexed_table.id, "completed backfilling the index table");
                self.alter_table_state_to_success()
                    .await
                    .context("failed to complete backfill")
            }
        }
    }

    async fn alter_table_state_to_success(&self) -> anyhow::Result<()> {
        let index_table_id = self.index_to_build.table_id.clone();
        let target = HashMap::from([(
            index_table_id.clone(),
            IndexPermission::ReadWriteAndDelete,
        )]);
        crate::alter_table::update_index_permissions(&self.ctx, &self.indexed_table, &target, None)
            .await
            .context(
                "could not promote the index to ReadWriteAndDelete; the master leader may have changed",
            )?;
        self.ctx.broadcast.send_alter_table_request(&self.indexed_table);

        self.allow_compactions_to_gc_delete_markers(&index_table_id)
            .await?;

        self.indexed_table.set_is_backfilling(false);
        if let Some(job) = self.job.get() {
            job.set_state(JobState::Complete);
        }
        self.clear_checkpoint_state_in_tablets().await
    }

    async fn alter_table_state_to_abort(&self) -> anyhow::Result<()> {
        let index_table_id = self.index_to_build.table_id.clone();
        let target = HashMap::from([(
            index_table_id,
            IndexPermission::WriteAndDeleteWhileRemoving,
        )]);
        crate::alter_table::update_index_permissions(&self.ctx, &self.indexed_table, &target, None)
            .await
            .context(
                "could not move the index to WriteAndDeleteWhileRemoving; the master leader may have changed",
            )?;
        self.ctx.broadcast.send_alter_table_request(&self.indexed_table);

        self.indexed_table.set_is_backfilling(false);
        if let Some(job) = self.job.get() {
            job.set_state(JobState::Failed);
        }
        self.clear_checkpoint_state_in_tablets().await
    }

    /// Wait for the index table's own alter to finish, persist that it is no
    /// longer backfilling, then tell each of its tablets that compactions may
    /// GC delete markers.
    async fn allow_compactions_to_gc_delete_markers(
        &self,
        index_table_id: &TableId,
    ) -> anyhow::Result<()> {
        let index_table = self.ctx.catalog.table(index_table_id).ok_or_else(|| {
            // Expected if somebody issued a concurrent delete-index.
            CatalogError::TableNotFound(index_table_id.clone())
        })?;

        loop {
            let ready = index_table.read().await.state == TableState::Running;
            if ready {
                break;
            }
            tracing::debug!(
                index = %index_table_id,
                "waiting for the previous alter on the index table to complete"
            );
            tokio::time::sleep(self.ctx.config.wait_for_alter_table_completion).await;
        }

        mutate_table_entry(
            &index_table,
            self.ctx.sys_catalog.as_ref(),
            self.leader_term,
            |entry| {
                entry.properties.is_backfilling = false;
                Ok(())
            },
        )
        .await
        .with_context(|| {
            format!("could not update {index_table_id} to enable delete-marker gc")
        })?;

        for tablet in index_table.tablets() {
            let ctx = Arc::clone(&self.ctx);
            let tablet_id = tablet.id.clone();
            let tserver = tablet.tserver.clone();
            tokio::spawn(async move {
                let sent = RpcRetrier::new(&ctx.config, &ctx.clock)
                    .run("backfill done", || {
                        let req = BackfillDoneRequest {
                            dest_uuid: tserver.clone(),
                            tablet_id: tablet_id.clone(),
                            propagated_hybrid_time: ctx.clock.now(),
                        };
                        let rpc = Arc::clone(&ctx.tserver_rpc);
                        async move { rpc.backfill_done(req).await }
                    })
                    .await;
                if let Err(err) = sent {
                    tracing::warn!(tablet = %tablet_id, error = ?err, "failed to send backfill done request");
                }
            });
        }
        Ok(())
    }

    /// Erase this index's checkpoint from every tablet in one atomic write,
    /// then clear the persisted read time.
    async fn clear_checkpoint_state_in_tablets(&self) -> anyhow::Result<()> {
        let tablets = self.indexed_table.tablets();
        let index_table_id = &self.index_to_build.table_id;

        let mut staged = Vec::with_capacity(tablets.len());
        let mut items = Vec::with_capacity(tablets.len());
        for tablet in &tablets {
            let guard = tablet.write().await;
            let mut dirty = guard.clone();
            dirty.backfilled_until.remove(index_table_id);
            items.push(CatalogItem::tablet(&tablet.id, &dirty));
            staged.push((guard, dirty));
        }
        self.ctx
            .sys_catalog
            .update_items(items, self.leader_term)
            .await
            .context("could not persist that the table is done backfilling")?;
        for (mut guard, dirty) in staged {
            *guard = dirty;
        }

        mutate_table_entry(
            &self.indexed_table,
            self.ctx.sys_catalog.as_ref(),
            self.leader_term,
            |entry| {
                entry.properties.backfilling_timestamp = None;
                Ok(())
            },
        )
        .await
        .context("could not clear backfilling timestamp")?;

        tracing::debug!(table = %self.indexed_table.id, "cleared backfill checkpoints");
        Ok(())
    }
}

/// Drives the chunk-at-a-time backfill of one tablet, persisting the resume
/// key after every chunk. Chunks on one tablet are strictly sequential;
/// different tablets run in parallel.
pub struct BackfillTablet {
    table: Arc<BackfillTable>,
    tablet: Arc<TabletInfo>,
    next_row_to_backfill: Mutex<Vec<u8>>,
    done: AtomicBool,
}

impl BackfillTablet {
    pub async fn new(table: Arc<BackfillTable>, tablet: Arc<TabletInfo>) -> Arc<Self> {
        let checkpoint = {
            let entry = tablet.read().await;
            entry.backfilled_until.get(table.index_table_id()).cloned()
        };
        let (next_row, done) = match checkpoint {
            None => (Vec::new(), false),
            Some(key) if key.is_empty() => (Vec::new(), true),
            Some(key) => (key, false),
        };
        if done {
            tracing::info!(tablet = %tablet.id, "backfill already done");
        } else if next_row.is_empty() {
            tracing::info!(tablet = %tablet.id, "beginning backfill from the start of the tablet");
        } else {
            tracing::info!(tablet = %tablet.id, resume_key = ?next_row, "resuming backfill");
        }
        Arc::new(Self {
            table,
            tablet,
            next_row_to_backfill: Mutex::new(next_row),
            done: AtomicBool::new(done),
        })
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            if self.done.load(Ordering::Acquire) {
                if let Err(err) = self.table.tablet_done(Ok(())).await {
                    tracing::warn!(tablet = %self.tablet.id, error = ?err, "failed to report tablet completion");
                }
                return;
            }
            let start_key = self.next_row_to_backfill.lock().unwrap().clone();
            match self.backfill_chunk(start_key).await {
                Ok(next_key) => self.record_chunk_done(next_key).await,
                Err(err) => {
                    tracing::info!(tablet = %self.tablet.id, error = ?err, "failed to backfill the tablet");
                    if let Err(report_err) = self.table.tablet_done(Err(err)).await {
                        tracing::warn!(tablet = %self.tablet.id, error = ?report_err, "failed to report tablet failure");
                    }
                    return;
                }
            }
        }
    }

    async fn backfill_chunk(&self, start_key: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        let response = RpcRetrier::new(&self.table.ctx.config, &self.table.ctx.clock)
            .run("backfill chunk", || {
                let req = BackfillChunkRequest {
                    dest_uuid: self.tablet.tserver.clone(),
                    tablet_id: self.tablet.id.clone(),
                    read_at_hybrid_time: self.table.read_time(),
                    schema_version: self.table.schema_version,
                    start_key: start_key.clone(),
                    indexes: vec![self.table.index_to_build.clone()],
                    propagated_hybrid_time: self.table.ctx.clock.now(),
                };
                let rpc = Arc::clone(&self.table.ctx.tserver_rpc);
                async move { rpc.backfill_chunk(req).await }
            })
            .await
            .with_context(|| format!("BackfillChunk on tablet {}", self.tablet.id))?;
        Ok(response.backfilled_until)
    }

    /// Record the chunk's resume key, durably and in memory. A checkpoint
    /// persistence failure is logged and does not stop the backfill: the
    /// durable state only ever lags, so a resume repeats work but never
    /// skips it.
    async fn record_chunk_done(&self, next_key: Vec<u8>) {
        *self.next_row_to_backfill.lock().unwrap() = next_key.clone();
        let index_table_id = self.table.index_table_id().clone();
        let persisted = mutate_tablet_entry(
            &self.tablet,
            self.table.ctx.sys_catalog.as_ref(),
            self.table.leader_term,
            |entry| {
                entry
                    .backfilled_until
                    .insert(index_table_id.clone(), next_key.clone());
                Ok(())
            },
        )
        .await;
        if let Err(err) = persisted {
            tracing::warn!(
                tablet = %self.tablet.id,
                error = ?err,
                "could not persist that the tablet is done backfilling a chunk"
            );
        }

        if next_key.is_empty() {
            tracing::info!(tablet = %self.tablet.id, "done backfilling the tablet");
            self.done.store(true, Ordering::Release);
        } else {
            tracing::debug!(tablet = %self.tablet.id, until = ?next_key, "chunk complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(label: &str) -> BackfillJob {
        BackfillJob::new(label.to_string(), Weak::new())
    }

    #[test]
    fn jobs_start_scheduling_and_progress_to_terminal_states() {
        let job = job("idx_users_by_email");
        assert_eq!(job.state(), JobState::Scheduling);
        assert!(job.completed_at().is_none());

        job.set_state(JobState::Running);
        assert_eq!(job.state(), JobState::Running);

        job.set_state(JobState::Complete);
        assert_eq!(job.state(), JobState::Complete);
        assert!(job.completed_at().is_some());
    }

    #[test]
    fn terminal_states_are_sticky() {
        let job = job("idx");
        job.set_state(JobState::Running);
        job.set_state(JobState::Failed);
        job.set_state(JobState::Complete);
        assert_eq!(job.state(), JobState::Failed);
    }

    #[test]
    fn mark_done_fires_once() {
        let job = job("idx");
        job.set_state(JobState::Running);
        job.set_state(JobState::Failed);
        let first = job.completed_at().unwrap();
        job.abort_and_return_prev_state();
        assert_eq!(job.completed_at().unwrap(), first);
    }

    #[test]
    fn abort_returns_the_previous_state() {
        let job = job("idx");
        job.set_state(JobState::Running);
        assert_eq!(job.abort_and_return_prev_state(), JobState::Running);
        assert_eq!(job.state(), JobState::Aborted);
        // A second abort reports the terminal state it found.
        assert_eq!(job.abort_and_return_prev_state(), JobState::Aborted);
    }

    #[test]
    fn description_falls_back_to_the_cached_label() {
        let job = job("idx_users_by_email");
        job.set_state(JobState::Running);
        // The coordinator is gone (weak reference is dead), so even a
        // non-terminal job renders from the label.
        assert_eq!(job.description(), "Backfilling idx_users_by_email");
        job.set_state(JobState::Failed);
        assert_eq!(job.description(), "Backfilling idx_users_by_email failed");
    }
}
