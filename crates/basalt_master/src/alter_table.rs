//! Multi-stage alter-table sweep for index permission changes.
//!
//! A sweep runs whenever the indexed table is quiescent at a schema version
//! (after every alter-table RPC burst completes). Exactly one action fires
//! per sweep: batch-advance every transient index one rung, drop one fully
//! retired index, start one backfill, or clear the altering state. Every
//! permission change follows the same discipline: mutate a dirty copy under
//! the table's write lock, persist it through the fenced sys catalog, commit
//! in memory, then fan out alter-table RPCs with no lock held.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;

use crate::backfill::BackfillTable;
use crate::catalog::{
    mutate_table_entry, IndexInfo, SchemaVersion, TableId, TableInfo, TableState,
};
use crate::clock::unix_time_ms;
use crate::error::CatalogError;
use crate::master::MasterContext;
use crate::permission::{IndexPermission, SweepAction};

/// Overwrite the permissions named in `perm_mapping` and bump the schema
/// version by one, after snapshotting the live schema into the
/// fully-applied shadow. With `expected_version` set, the update is rejected
/// as a [`CatalogError::VersionMismatch`] when another actor got there first.
pub async fn update_index_permissions(
    ctx: &MasterContext,
    indexed_table: &Arc<TableInfo>,
    perm_mapping: &HashMap<TableId, IndexPermission>,
    expected_version: Option<SchemaVersion>,
) -> anyhow::Result<()> {
    maybe_slowdown_for_tests(ctx, "before permission update").await;

    mutate_table_entry(
        indexed_table,
        ctx.sys_catalog.as_ref(),
        ctx.leader_ready_term(),
        |entry| {
            if let Some(expected) = expected_version {
                if entry.schema_version != expected {
                    return Err(CatalogError::VersionMismatch {
                        table_id: indexed_table.id.clone(),
                        expected,
                        actual: entry.schema_version,
                    }
                    .into());
                }
            }
            entry.snapshot_fully_applied();
            for index in &mut entry.indexes {
                if let Some(new_perm) = perm_mapping.get(&index.table_id) {
                    index.permission = Some(*new_perm);
                }
            }
            entry.schema_version += 1;
            entry.state = TableState::Altering;
            entry.state_message = format!(
                "alter table version={} ts={}",
                entry.schema_version,
                unix_time_ms()
            );
            Ok(())
        },
    )
    .await
    .context("updating indexed table metadata on disk")?;

    tracing::info!(
        table = %indexed_table.id,
        permissions = ?perm_mapping,
        "updated index permissions"
    );

    maybe_slowdown_for_tests(ctx, "after permission update").await;
    Ok(())
}

/// Clear the fully-applied shadow and return the table to `Running`, once the
/// last transition has reached every tablet server.
pub async fn clear_altering_state(
    ctx: &MasterContext,
    indexed_table: &Arc<TableInfo>,
    expected_version: SchemaVersion,
) -> anyhow::Result<()> {
    mutate_table_entry(
        indexed_table,
        ctx.sys_catalog.as_ref(),
        ctx.leader_ready_term(),
        |entry| {
            if entry.schema_version != expected_version {
                return Err(CatalogError::VersionMismatch {
                    table_id: indexed_table.id.clone(),
                    expected: expected_version,
                    actual: entry.schema_version,
                }
                .into());
            }
            entry.fully_applied = None;
            entry.state = TableState::Running;
            entry.state_message = format!("current schema version={}", entry.schema_version);
            Ok(())
        },
    )
    .await
    .context("clearing altering state")?;

    tracing::info!(table = %indexed_table.id, version = expected_version, "alter table completed");
    Ok(())
}

/// Remove a retired index's metadata from the indexed table entry. Dropping
/// the index's own table is the catalog manager's business.
pub async fn delete_index_info(
    ctx: &MasterContext,
    indexed_table: &Arc<TableInfo>,
    index_table_id: &TableId,
) -> anyhow::Result<()> {
    mutate_table_entry(
        indexed_table,
        ctx.sys_catalog.as_ref(),
        ctx.leader_ready_term(),
        |entry| {
            entry.indexes.retain(|i| &i.table_id != index_table_id);
            Ok(())
        },
    )
    .await
    .with_context(|| format!("deleting index info for {index_table_id}"))?;

    tracing::info!(table = %indexed_table.id, index = %index_table_id, "dropped retired index metadata");
    Ok(())
}

/// Start the backfill pass for one index at `DoBackfill`.
///
/// The `IsBackfilling` test-and-set guarantees at most one coordinator per
/// indexed table; the fully-applied snapshot is persisted (without a version
/// bump) so tablet servers still at the previous version keep a coherent view
/// while chunks run.
pub async fn start_backfilling(
    ctx: &Arc<MasterContext>,
    indexed_table: &Arc<TableInfo>,
    index: IndexInfo,
) -> anyhow::Result<()> {
    if indexed_table.set_is_backfilling(true) {
        tracing::warn!(table = %indexed_table.id, "not starting backfill, one is already in progress");
        return Err(CatalogError::BackfillInProgress(indexed_table.id.clone()).into());
    }

    let prepared = mutate_table_entry(
        indexed_table,
        ctx.sys_catalog.as_ref(),
        ctx.leader_ready_term(),
        |entry| {
            entry.snapshot_fully_applied();
            Ok(())
        },
    )
    .await
    .context("updating indexed table metadata on disk, abandoning backfill");

    if let Err(err) = prepared {
        indexed_table.set_is_backfilling(false);
        return Err(err);
    }

    tracing::info!(table = %indexed_table.id, index = %index.table_id, "starting backfill");
    let backfill = BackfillTable::new(Arc::clone(ctx), Arc::clone(indexed_table), index).await;
    backfill.launch();
    Ok(())
}

/// Run one sweep over the indexed table at `current_version`.
///
/// Advancing transient indexes is batched into a single mutation so each
/// sweep makes exactly one schema-version step; backfill and delete carry
/// long-running side effects and are handled one index at a time.
pub async fn launch_next_if_necessary(
    ctx: &Arc<MasterContext>,
    indexed_table: &Arc<TableInfo>,
    current_version: SchemaVersion,
) -> anyhow::Result<()> {
    let mut to_advance: HashMap<TableId, IndexPermission> = HashMap::new();
    let mut to_backfill: Vec<IndexInfo> = Vec::new();
    let mut to_delete: Vec<IndexInfo> = Vec::new();
    {
        let entry = indexed_table.read().await;
        if entry.schema_version != current_version {
            tracing::warn!(
                table = %indexed_table.id,
                observed = entry.schema_version,
                expected = current_version,
                "somebody launched the next version before we got to it"
            );
            return Ok(());
        }
        for index in &entry.indexes {
            let Some(permission) = index.permission else {
                continue;
            };
            match permission.sweep_action() {
                SweepAction::Advance(next) => {
                    to_advance.insert(index.table_id.clone(), next);
                }
                SweepAction::Backfill => to_backfill.push(index.clone()),
                SweepAction::DropIndex => to_delete.push(index.clone()),
                SweepAction::Settled => {}
            }
        }
    }

    if !to_advance.is_empty() {
        match update_index_permissions(ctx, indexed_table, &to_advance, Some(current_version)).await
        {
            Ok(()) => ctx.broadcast.send_alter_table_request(indexed_table),
            Err(err) => tracing::warn!(
                table = %indexed_table.id,
                error = ?err,
                "could not update index permissions; the leader may have changed or another sweep won the race"
            ),
        }
        return Ok(());
    }

    if let Some(index) = to_delete.first() {
        if let Err(err) = delete_index_info(ctx, indexed_table, &index.table_id).await {
            tracing::warn!(
                table = %indexed_table.id,
                index = %index.table_id,
                error = ?err,
                "failed to delete index info"
            );
        }
        return clear_altering_state(ctx, indexed_table, current_version).await;
    }

    if let Some(index) = to_backfill.first() {
        if let Err(err) = start_backfilling(ctx, indexed_table, index.clone()).await {
            tracing::warn!(table = %indexed_table.id, error = ?err, "could not launch backfill");
        }
        return Ok(());
    }

    clear_altering_state(ctx, indexed_table, current_version).await
}

async fn maybe_slowdown_for_tests(ctx: &MasterContext, phase: &str) {
    let delay = ctx.config.test_slowdown_alter_table_rpcs;
    if delay.is_zero() {
        return;
    }
    tracing::debug!(phase, delay_ms = delay.as_millis() as u64, "slowdown injection");
    tokio::time::sleep(delay).await;
}
