//! Store statistics: the `stats()` snapshot and periodic metrics logging.

use crate::config::Config;
use crate::error::Result;
use crate::store::state::LsmState;

/// Per-level breakdown in a [`StoreStats`] snapshot.
#[derive(Debug, Clone)]
pub struct LevelStats {
    pub level: u32,
    pub num_sstables: usize,
    pub num_entries: u64,
    pub size_bytes: u64,
    pub max_entries: u64,
    pub max_size_bytes: u64,
}

/// A point-in-time snapshot of the store's shape.
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub active_memtable_size: usize,
    pub memtable_max_size: usize,
    pub immutable_memtables: usize,
    pub max_immutable_memtables: usize,
    pub num_sstables: usize,
    pub num_levels: usize,
    pub total_sstable_size_bytes: u64,
    pub wal_size_bytes: u64,
    pub rotations: u64,
    pub async_flushes: u64,
    pub compaction_running: bool,
    pub levels: Vec<LevelStats>,
}

pub(crate) fn collect(state: &LsmState, config: &Config) -> Result<StoreStats> {
    let levels = state.snapshot_levels()?;

    let mut level_stats = Vec::with_capacity(levels.len());
    let mut num_sstables = 0;
    let mut total_size = 0u64;

    for (&level, tables) in &levels {
        let size: u64 = tables.iter().map(|t| t.meta.size_bytes).sum();
        let entries: u64 = tables.iter().map(|t| t.meta.num_entries).sum();
        num_sstables += tables.len();
        total_size += size;

        level_stats.push(LevelStats {
            level,
            num_sstables: tables.len(),
            num_entries: entries,
            size_bytes: size,
            max_entries: config.compaction.max_entries(level),
            max_size_bytes: config.compaction.max_size_bytes(level),
        });
    }

    Ok(StoreStats {
        active_memtable_size: state.memtables.active_len()?,
        memtable_max_size: config.memtable_size,
        immutable_memtables: state.memtables.immutable_count()?,
        max_immutable_memtables: config.max_immutable_memtables,
        num_sstables,
        num_levels: levels.values().filter(|tables| !tables.is_empty()).count(),
        total_sstable_size_bytes: total_size,
        wal_size_bytes: state.wal.size(),
        rotations: state.memtables.rotations(),
        async_flushes: state.memtables.async_flushes(),
        compaction_running: state.compaction_in_flight(),
        levels: level_stats,
    })
}

/// Logs a metrics snapshot; run periodically by the metrics task.
pub(crate) fn log_metrics(state: &LsmState, config: &Config) -> Result<()> {
    let stats = collect(state, config)?;

    let level_counts: Vec<(u32, usize)> = stats
        .levels
        .iter()
        .map(|l| (l.level, l.num_sstables))
        .collect();

    tracing::info!(
        active_memtable_size = stats.active_memtable_size,
        immutable_memtables = stats.immutable_memtables,
        num_sstables = stats.num_sstables,
        total_sstable_size_bytes = stats.total_sstable_size_bytes,
        wal_size_bytes = stats.wal_size_bytes,
        rotations = stats.rotations,
        async_flushes = stats.async_flushes,
        compaction_running = stats.compaction_running,
        ?level_counts,
        "Store metrics"
    );

    Ok(())
}
