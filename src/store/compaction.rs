//! Leveled compaction: merging a level into the next under snapshot
//! isolation.
//!
//! A compaction snapshots the participating `Arc<SSTable>` references under
//! the level-map lock, then reads, merges, and writes entirely outside it.
//! The commit swaps both manifests and the in-memory lists back under the
//! lock; old files are deleted last. The manifest rewrite is the
//! linearization point, so a crash at any step leaves either the inputs or
//! the output live, never a torn mixture.

use std::sync::Arc;

use itertools::Itertools;

use crate::config::Config;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::sstable::{self, SSTable, TableMeta};
use crate::store::state::LsmState;

/// Upper bound on cascade rounds per trigger; prevents a livelock if the
/// configured level ratio cannot make deeper levels absorb the data.
const MAX_CASCADE: usize = 32;

/// Returns the shallowest level over its soft limit, if any.
///
/// A level is compactable when: L0 holds at least the soft file-count
/// trigger; or the level's entry count reaches its soft entry cap; or its
/// byte size reaches its soft size cap.
pub(crate) fn find_compactable_level(state: &LsmState, config: &Config) -> Result<Option<u32>> {
    let levels = state.levels.read()?;

    for (&level, tables) in levels.iter() {
        if tables.is_empty() {
            continue;
        }

        if level == 0 && tables.len() >= config.compaction.soft_l0_sstables() {
            return Ok(Some(0));
        }

        let entries: u64 = tables.iter().map(|t| t.meta.num_entries).sum();
        if entries >= config.compaction.soft_max_entries(level) {
            return Ok(Some(level));
        }

        let size: u64 = tables.iter().map(|t| t.meta.size_bytes).sum();
        if size >= config.compaction.soft_max_size_bytes(level) {
            return Ok(Some(level));
        }
    }

    Ok(None)
}

/// Runs the trigger policy until no level is over its soft limit. A no-op
/// if another compaction is already in flight; compacting level k may push
/// level k+1 over its limit, so the check cascades.
pub(crate) fn auto_compact(state: &LsmState, config: &Config) -> Result<()> {
    let _guard = match state.start_compaction() {
        Some(guard) => guard,
        None => return Ok(()),
    };

    for _ in 0..MAX_CASCADE {
        match find_compactable_level(state, config)? {
            Some(level) => compact_level(state, config, level)?,
            None => return Ok(()),
        };
    }

    tracing::warn!("Compaction cascade exceeded {MAX_CASCADE} rounds, yielding");
    Ok(())
}

/// Merges level `source` into `source + 1`. The caller must hold the
/// compaction slot.
pub(crate) fn compact_level(
    state: &LsmState,
    _config: &Config,
    source: u32,
) -> Result<Option<TableMeta>> {
    let target = source + 1;

    // Snapshot the participants: every table at the source level plus the
    // single table at the target level, if present.
    let (source_tables, target_tables, bottommost) = {
        let levels = state.levels.read()?;
        let source_tables = levels.get(&source).cloned().unwrap_or_default();
        if source_tables.is_empty() {
            return Ok(None);
        }
        let target_tables = levels.get(&target).cloned().unwrap_or_default();
        let bottommost = levels
            .iter()
            .filter(|(_, tables)| !tables.is_empty())
            .map(|(&level, _)| level)
            .max()
            .unwrap_or(0);
        (source_tables, target_tables, bottommost)
    };

    // Tombstones may only be dropped once they reach the deepest populated
    // level; above it they must keep shadowing older versions.
    let drop_tombstones = target >= bottommost;

    let participants: Vec<Arc<SSTable>> = source_tables
        .iter()
        .chain(target_tables.iter())
        .cloned()
        .collect();

    let merged = merge_tables(&participants, drop_tombstones)?;

    let old_ids: Vec<u64> = participants.iter().map(|t| t.id()).collect();
    let old_dirnames: Vec<String> = participants
        .iter()
        .map(|t| t.meta.dirname.clone())
        .collect();

    tracing::info!(
        source,
        target,
        inputs = participants.len(),
        survivors = merged.len(),
        drop_tombstones,
        "Compacting level"
    );

    let new_meta = if merged.is_empty() {
        None
    } else {
        let sstable_id = state.manifest.next_id()?;
        let meta = sstable::write_sstable(&state.sstables_dir, sstable_id, &merged)?;
        Some(meta)
    };

    let new_table = match &new_meta {
        Some(meta) => Some(Arc::new(SSTable::open(&state.sstables_dir, meta.clone())?)),
        None => None,
    };

    // Commit: target manifest first, then source. Between the two writes
    // both generations are referenced, which is read-correct (identical
    // winning timestamps) and crash-safe. Tables flushed into L0 after the
    // snapshot are not participants and must survive the commit.
    {
        let mut levels = state.levels.write()?;
        let remaining: Vec<Arc<SSTable>> = levels
            .get(&source)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|t| !old_ids.contains(&t.id()))
            .collect();
        let remaining_metas: Vec<TableMeta> =
            remaining.iter().map(|t| t.meta.clone()).collect();

        state
            .manifest
            .replace_level(target, new_meta.clone().into_iter().collect())?;
        state.manifest.replace_level(source, remaining_metas)?;

        levels.insert(target, new_table.into_iter().collect());
        levels.insert(source, remaining);
    }

    // Old files are garbage now; failures leave orphans for the sweep at
    // the next open.
    for dirname in &old_dirnames {
        if let Err(e) = sstable::delete_sstable(&state.sstables_dir, dirname) {
            tracing::warn!(dirname, error = %e, "Failed to delete compacted sstable");
        }
    }

    tracing::info!(
        source,
        target,
        old_tables = old_ids.len(),
        new_table = new_meta.as_ref().map(|m| m.sstable_id),
        "Compaction committed"
    );

    Ok(new_meta)
}

/// Full compaction: merge every level into the deepest populated level (or
/// L1 when only L0 is populated), dropping tombstones. The caller must hold
/// the compaction slot.
pub(crate) fn full_compact(state: &LsmState, _config: &Config) -> Result<TableMeta> {
    let levels_snapshot = state.snapshot_levels()?;

    let participants: Vec<Arc<SSTable>> = levels_snapshot
        .values()
        .flatten()
        .cloned()
        .collect();
    if participants.is_empty() {
        return Err(Error::EmptyCompaction);
    }

    let deepest = levels_snapshot
        .iter()
        .filter(|(_, tables)| !tables.is_empty())
        .map(|(&level, _)| level)
        .max()
        .unwrap_or(0);
    let target = if deepest == 0 { 1 } else { deepest };

    // The result lands on the bottommost level, so tombstones go.
    let merged = merge_tables(&participants, true)?;
    if merged.is_empty() {
        return Err(Error::EmptyCompaction);
    }

    let sstable_id = state.manifest.next_id()?;
    let meta = sstable::write_sstable(&state.sstables_dir, sstable_id, &merged)?;
    let table = Arc::new(SSTable::open(&state.sstables_dir, meta.clone())?);

    let old_dirnames: Vec<String> = participants
        .iter()
        .map(|t| t.meta.dirname.clone())
        .collect();

    {
        let mut levels = state.levels.write()?;
        let participant_ids: std::collections::HashSet<u64> =
            participants.iter().map(|t| t.id()).collect();

        state.manifest.replace_level(target, vec![meta.clone()])?;
        levels.insert(target, vec![table]);

        // Drop participants everywhere else; tables flushed into L0 after
        // the snapshot survive.
        let other_levels: Vec<u32> =
            levels.keys().copied().filter(|&l| l != target).collect();
        for level in other_levels {
            let remaining: Vec<Arc<SSTable>> = levels
                .get(&level)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter(|t| !participant_ids.contains(&t.id()))
                .collect();
            let remaining_metas: Vec<TableMeta> =
                remaining.iter().map(|t| t.meta.clone()).collect();
            state.manifest.replace_level(level, remaining_metas)?;
            levels.insert(level, remaining);
        }
    }

    for dirname in &old_dirnames {
        if let Err(e) = sstable::delete_sstable(&state.sstables_dir, dirname) {
            tracing::warn!(dirname, error = %e, "Failed to delete compacted sstable");
        }
    }

    tracing::info!(
        target,
        inputs = old_dirnames.len(),
        entries = meta.num_entries,
        "Full compaction committed"
    );

    Ok(meta)
}

/// Reads every participant and merges by key: each input is sorted, so a
/// k-way merge followed by per-key coalescing (highest timestamp wins)
/// yields a sorted, deduplicated run.
fn merge_tables(tables: &[Arc<SSTable>], drop_tombstones: bool) -> Result<Vec<Entry>> {
    let mut runs: Vec<Vec<Entry>> = Vec::with_capacity(tables.len());
    for table in tables {
        runs.push(table.read_all()?);
    }

    let merged = runs
        .into_iter()
        .kmerge_by(|a, b| a.key < b.key)
        .coalesce(|current, next| {
            if current.key == next.key {
                Ok(if current.timestamp >= next.timestamp {
                    current
                } else {
                    next
                })
            } else {
                Err((current, next))
            }
        })
        .filter(|entry| !(drop_tombstones && entry.is_tombstone()))
        .collect();

    Ok(merged)
}
