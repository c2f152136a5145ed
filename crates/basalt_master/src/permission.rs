//! The index permission ladder.
//!
//! A permission gates which of {reads, writes, deletes} tablet servers apply
//! to a secondary index while a schema change propagates. A freshly created
//! index climbs `DeleteOnly → WriteAndDelete → DoBackfill →
//! ReadWriteAndDelete`; an aborted or dropped index unwinds through
//! `WriteAndDeleteWhileRemoving → DeleteOnlyWhileRemoving → IndexUnused →
//! NotUsed`.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexPermission {
    DeleteOnly,
    WriteAndDelete,
    DoBackfill,
    ReadWriteAndDelete,
    WriteAndDeleteWhileRemoving,
    DeleteOnlyWhileRemoving,
    IndexUnused,
    NotUsed,
}

/// What the alter-table sweep does with an index observed at a permission.
///
/// Encoding the ladder this way keeps the states that do not advance by a
/// plain permission bump (`DoBackfill`, `ReadWriteAndDelete`, `IndexUnused`,
/// `NotUsed`) out of `successor`'s reach entirely: the sweep routes them to
/// their specialized handlers by construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SweepAction {
    /// Bump to the given successor in the next catalog update.
    Advance(IndexPermission),
    /// The index is ready for its backfill pass.
    Backfill,
    /// The removal branch has fully drained; drop the index metadata.
    DropIndex,
    /// Steady state, nothing to do.
    Settled,
}

impl IndexPermission {
    pub fn sweep_action(self) -> SweepAction {
        use IndexPermission::*;
        match self {
            DeleteOnly => SweepAction::Advance(WriteAndDelete),
            WriteAndDelete => SweepAction::Advance(DoBackfill),
            DoBackfill => SweepAction::Backfill,
            ReadWriteAndDelete => SweepAction::Settled,
            WriteAndDeleteWhileRemoving => SweepAction::Advance(DeleteOnlyWhileRemoving),
            DeleteOnlyWhileRemoving => SweepAction::Advance(IndexUnused),
            IndexUnused => SweepAction::DropIndex,
            NotUsed => SweepAction::Settled,
        }
    }

    /// Next state on the ladder, for the permissions that advance by a plain
    /// bump.
    pub fn successor(self) -> Option<IndexPermission> {
        match self.sweep_action() {
            SweepAction::Advance(next) => Some(next),
            _ => None,
        }
    }

    /// A transient permission still needs sweeps to make progress.
    /// `IndexUnused` counts: it has an index-delete step left.
    pub fn is_transient(self) -> bool {
        !matches!(
            self,
            IndexPermission::ReadWriteAndDelete | IndexPermission::NotUsed
        )
    }
}
