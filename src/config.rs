use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the store.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory path for the database
    pub dir: PathBuf,

    /// Maximum entries in the active memtable before rotation (default: 1024)
    pub memtable_size: usize,

    /// Bound on the immutable memtable queue; exceeding it forces a
    /// synchronous flush on the writing caller (default: 4)
    pub max_immutable_memtables: usize,

    /// Number of background flush tasks (default: 2)
    pub flush_workers: usize,

    /// Maximum key size in bytes (default: 1 KiB)
    pub max_key_size: usize,

    /// Maximum value size in bytes (default: 10 MiB)
    pub max_value_size: usize,

    /// Leveled compaction configuration
    pub compaction: CompactionConfig,

    /// Background worker cadence
    pub workers: WorkerConfig,
}

/// Leveled compaction limits. Level k holds at most
/// `base_level_entries * level_ratio^k` entries and
/// `base_level_size_mb * level_ratio^k` megabytes; compaction triggers at
/// `soft_limit_ratio` of those caps.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Size/entry multiplier between adjacent levels (default: 10)
    pub level_ratio: u64,

    /// L0 entry cap (default: 1000)
    pub base_level_entries: u64,

    /// L0 byte cap in megabytes (default: 1.0)
    pub base_level_size_mb: f64,

    /// L0 file-count cap (default: 4)
    pub max_l0_sstables: usize,

    /// Fraction of a hard limit that triggers compaction (default: 0.85)
    pub soft_limit_ratio: f64,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often flush tasks check the immutable queue (default: 1s)
    pub flush_interval: Duration,

    /// How often the compaction backstop re-evaluates triggers (default: 10s)
    pub compaction_interval: Duration,

    /// How often metrics are logged (default: 5s)
    pub metrics_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./cinderkv"),
            memtable_size: 1024,
            max_immutable_memtables: 4,
            flush_workers: 2,
            max_key_size: 1024,
            max_value_size: 10 * 1024 * 1024,
            compaction: CompactionConfig::default(),
            workers: WorkerConfig::default(),
        }
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            level_ratio: 10,
            base_level_entries: 1000,
            base_level_size_mb: 1.0,
            max_l0_sstables: 4,
            soft_limit_ratio: 0.85,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            compaction_interval: Duration::from_secs(10),
            metrics_interval: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the active memtable entry cap
    pub fn memtable_size(mut self, entries: usize) -> Self {
        self.memtable_size = entries;
        self
    }

    /// Set the immutable queue bound
    pub fn max_immutable_memtables(mut self, count: usize) -> Self {
        self.max_immutable_memtables = count;
        self
    }

    /// Set the number of background flush tasks
    pub fn flush_workers(mut self, workers: usize) -> Self {
        self.flush_workers = workers;
        self
    }

    /// Set the maximum key size in bytes
    pub fn max_key_size(mut self, bytes: usize) -> Self {
        self.max_key_size = bytes;
        self
    }

    /// Set the maximum value size in bytes
    pub fn max_value_size(mut self, bytes: usize) -> Self {
        self.max_value_size = bytes;
        self
    }

    /// Configure compaction limits
    pub fn compaction(mut self, config: CompactionConfig) -> Self {
        self.compaction = config;
        self
    }

    /// Configure background worker cadence
    pub fn workers(mut self, config: WorkerConfig) -> Self {
        self.workers = config;
        self
    }
}

impl CompactionConfig {
    /// Set the per-level multiplier
    pub fn level_ratio(mut self, ratio: u64) -> Self {
        self.level_ratio = ratio;
        self
    }

    /// Set the L0 entry cap
    pub fn base_level_entries(mut self, entries: u64) -> Self {
        self.base_level_entries = entries;
        self
    }

    /// Set the L0 byte cap in megabytes
    pub fn base_level_size_mb(mut self, mb: f64) -> Self {
        self.base_level_size_mb = mb;
        self
    }

    /// Set the L0 file-count cap
    pub fn max_l0_sstables(mut self, count: usize) -> Self {
        self.max_l0_sstables = count;
        self
    }

    /// Set the soft-limit trigger ratio
    pub fn soft_limit_ratio(mut self, ratio: f64) -> Self {
        self.soft_limit_ratio = ratio;
        self
    }

    /// Hard entry cap for a level.
    pub fn max_entries(&self, level: u32) -> u64 {
        self.base_level_entries
            .saturating_mul(self.level_ratio.saturating_pow(level))
    }

    /// Hard byte cap for a level.
    pub fn max_size_bytes(&self, level: u32) -> u64 {
        let base = (self.base_level_size_mb * 1024.0 * 1024.0) as u64;
        base.saturating_mul(self.level_ratio.saturating_pow(level))
    }

    /// Soft entry cap for a level.
    pub fn soft_max_entries(&self, level: u32) -> u64 {
        (self.max_entries(level) as f64 * self.soft_limit_ratio) as u64
    }

    /// Soft byte cap for a level.
    pub fn soft_max_size_bytes(&self, level: u32) -> u64 {
        (self.max_size_bytes(level) as f64 * self.soft_limit_ratio) as u64
    }

    /// Soft L0 file-count trigger. Never below one file.
    pub fn soft_l0_sstables(&self) -> usize {
        ((self.max_l0_sstables as f64 * self.soft_limit_ratio).round() as usize).max(1)
    }
}

impl WorkerConfig {
    /// Set flush task cadence
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set compaction backstop cadence
    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    /// Set metrics logging cadence
    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.dir, PathBuf::from("./cinderkv"));
        assert_eq!(config.memtable_size, 1024);
        assert_eq!(config.max_immutable_memtables, 4);
        assert_eq!(config.flush_workers, 2);
        assert_eq!(config.max_key_size, 1024);
        assert_eq!(config.max_value_size, 10 * 1024 * 1024);
    }

    #[test]
    fn test_config_builder() {
        let config = Config::new("/tmp/test")
            .memtable_size(16)
            .max_immutable_memtables(2)
            .compaction(
                CompactionConfig::default()
                    .level_ratio(2)
                    .max_l0_sstables(2),
            )
            .workers(WorkerConfig::default().flush_interval(Duration::from_millis(100)));

        assert_eq!(config.dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.memtable_size, 16);
        assert_eq!(config.max_immutable_memtables, 2);
        assert_eq!(config.compaction.level_ratio, 2);
        assert_eq!(config.compaction.max_l0_sstables, 2);
        assert_eq!(config.workers.flush_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_level_limits_grow_by_ratio() {
        let compaction = CompactionConfig::default()
            .level_ratio(10)
            .base_level_entries(1000)
            .base_level_size_mb(1.0);

        assert_eq!(compaction.max_entries(0), 1000);
        assert_eq!(compaction.max_entries(1), 10_000);
        assert_eq!(compaction.max_entries(2), 100_000);
        assert_eq!(compaction.max_size_bytes(0), 1024 * 1024);
        assert_eq!(compaction.max_size_bytes(1), 10 * 1024 * 1024);
    }

    #[test]
    fn test_soft_limits() {
        let compaction = CompactionConfig::default()
            .base_level_entries(1000)
            .soft_limit_ratio(0.85);

        assert_eq!(compaction.soft_max_entries(0), 850);
        assert_eq!(compaction.soft_l0_sstables(), 3); // round(4 * 0.85)

        let tight = CompactionConfig::default().max_l0_sstables(2);
        assert_eq!(tight.soft_l0_sstables(), 2); // round(2 * 0.85)
    }
}
