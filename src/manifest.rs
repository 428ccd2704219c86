//! Per-level manifests: the single source of truth for live SSTables.
//!
//! The `manifests/` directory holds one JSON file per level plus a small
//! global file:
//!
//! ```text
//! manifests/
//!     global.json      { next_sstable_id, levels: [0, 1, ...] }
//!     level_0.json     [TableMeta, ...]
//!     level_1.json     [TableMeta, ...]
//! ```
//!
//! Every mutation rewrites the affected file via temp-file + rename with an
//! fsync in between, so each manifest update is atomic and durable. The
//! manifest rewrite is the linearization point for installing or retiring an
//! SSTable: before it the table is invisible, after it the table is
//! canonical. Any on-disk SSTable directory not referenced here is an
//! orphan, reaped at the next open.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sstable::TableMeta;

pub const MANIFESTS_DIR: &str = "manifests";
const GLOBAL_FILE: &str = "global.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GlobalManifest {
    next_sstable_id: u64,
    levels: Vec<u32>,
}

struct Inner {
    global: GlobalManifest,
    levels: BTreeMap<u32, Vec<TableMeta>>,
}

/// All manifests for one store, serialized behind a single mutex.
pub struct ManifestSet {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp_path)?;
        serde_json::to_writer_pretty(&mut file, value)
            .map_err(|e| Error::IO(e.to_string()))?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn level_filename(level: u32) -> String {
    format!("level_{level}.json")
}

impl ManifestSet {
    /// Loads the manifests under `data_dir`, creating an empty set on first
    /// open.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join(MANIFESTS_DIR);
        std::fs::create_dir_all(&dir)?;

        let global_path = dir.join(GLOBAL_FILE);
        let global: GlobalManifest = if global_path.exists() {
            let file = File::open(&global_path)?;
            serde_json::from_reader(file)?
        } else {
            let global = GlobalManifest::default();
            write_json_atomic(&global_path, &global)?;
            global
        };

        let mut levels = BTreeMap::new();
        for &level in &global.levels {
            let path = dir.join(level_filename(level));
            if !path.exists() {
                return Err(Error::Corruption(format!(
                    "global manifest lists level {level} but {} is missing",
                    path.display()
                )));
            }
            let file = File::open(&path)?;
            let metas: Vec<TableMeta> = serde_json::from_reader(file)?;
            levels.insert(level, metas);
        }

        Ok(Self {
            dir,
            inner: Mutex::new(Inner { global, levels }),
        })
    }

    /// Reserves the next SSTable id. The increment is persisted before the
    /// id is handed out, so ids are never reused even across a crash.
    pub fn next_id(&self) -> Result<u64> {
        let mut inner = self.inner.lock()?;
        let id = inner.global.next_sstable_id;
        inner.global.next_sstable_id += 1;
        write_json_atomic(&self.dir.join(GLOBAL_FILE), &inner.global)?;
        Ok(id)
    }

    /// Appends a table to a level and durably rewrites that level's
    /// manifest.
    pub fn add(&self, level: u32, meta: TableMeta) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.levels.entry(level).or_default().push(meta);
        self.persist_level(&mut inner, level)
    }

    /// Removes the given table ids from a level.
    pub fn remove(&self, level: u32, sstable_ids: &[u64]) -> Result<()> {
        let mut inner = self.inner.lock()?;
        if let Some(metas) = inner.levels.get_mut(&level) {
            metas.retain(|meta| !sstable_ids.contains(&meta.sstable_id));
        }
        self.persist_level(&mut inner, level)
    }

    /// Replaces a level's table list wholesale.
    pub fn replace_level(&self, level: u32, metas: Vec<TableMeta>) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.levels.insert(level, metas);
        self.persist_level(&mut inner, level)
    }

    /// Returns a copy of one level's table list.
    pub fn get_level(&self, level: u32) -> Result<Vec<TableMeta>> {
        let inner = self.inner.lock()?;
        Ok(inner.levels.get(&level).cloned().unwrap_or_default())
    }

    /// Returns a copy of every level's table list.
    pub fn all_levels(&self) -> Result<BTreeMap<u32, Vec<TableMeta>>> {
        let inner = self.inner.lock()?;
        Ok(inner.levels.clone())
    }

    /// Directory names of every referenced SSTable; anything else under
    /// `sstables/` is an orphan.
    pub fn live_dirnames(&self) -> Result<HashSet<String>> {
        let inner = self.inner.lock()?;
        Ok(inner
            .levels
            .values()
            .flatten()
            .map(|meta| meta.dirname.clone())
            .collect())
    }

    fn persist_level(&self, inner: &mut Inner, level: u32) -> Result<()> {
        let metas = inner.levels.get(&level).cloned().unwrap_or_default();
        write_json_atomic(&self.dir.join(level_filename(level)), &metas)?;

        // Register newly-created levels in the global manifest.
        if !inner.global.levels.contains(&level) {
            inner.global.levels.push(level);
            inner.global.levels.sort_unstable();
            write_json_atomic(&self.dir.join(GLOBAL_FILE), &inner.global)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ManifestSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestSet").field("dir", &self.dir).finish()
    }
}
