//! Active/immutable memtable pipeline.
//!
//! One *active* memtable takes writes. When it reaches the configured entry
//! cap it is rotated: frozen, tagged with a sequence number, and pushed onto
//! a FIFO queue of immutables awaiting flush. Background flush workers claim
//! immutables from the front of the queue; a claimed memtable stays in the
//! queue (and in the read path) until its SSTable is durable and the WAL is
//! trimmed, then it is removed.
//!
//! If a rotation finds the queue at capacity, the writing caller is told to
//! flush the oldest immutable synchronously, outside the manager's locks.
//! The queue is therefore bounded by explicit backpressure, never by
//! dropping data.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::entry::Entry;
use crate::error::Result;
use crate::memtable::Memtable;

/// A frozen memtable queued for flushing, tagged with the sequence number
/// assigned at rotation. The claim flag ensures exactly one flusher per
/// memtable.
pub struct ImmutableMemtable {
    memtable: Arc<Memtable>,
    sequence: u64,
    claimed: AtomicBool,
}

impl ImmutableMemtable {
    fn new(memtable: Arc<Memtable>, sequence: u64) -> Self {
        Self {
            memtable,
            sequence,
            claimed: AtomicBool::new(false),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn get(&self, key: &[u8]) -> Option<Entry> {
        self.memtable.get(key)
    }

    pub fn len(&self) -> usize {
        self.memtable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memtable.is_empty()
    }

    pub fn entries_sorted(&self) -> Vec<Entry> {
        self.memtable.entries_sorted()
    }

    /// Claims this memtable for flushing. Returns false if another flusher
    /// got there first.
    pub fn try_claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::SeqCst)
    }

    /// Returns the claim after a failed flush so the memtable is retried.
    pub fn unclaim(&self) {
        self.claimed.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for ImmutableMemtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImmutableMemtable")
            .field("sequence", &self.sequence)
            .field("entries", &self.len())
            .finish()
    }
}

pub struct MemtableManager {
    memtable_size: usize,
    max_immutable: usize,

    active: RwLock<Arc<Memtable>>,
    immutables: RwLock<VecDeque<Arc<ImmutableMemtable>>>,

    next_sequence: AtomicU64,
    rotations: AtomicU64,
    async_flushes: AtomicU64,
}

impl MemtableManager {
    /// Creates a manager whose initial active memtable is `active`
    /// (recovery hands in the WAL-replayed table; a fresh store hands in an
    /// empty one).
    pub fn new(memtable_size: usize, max_immutable: usize, active: Memtable) -> Self {
        Self {
            memtable_size: memtable_size.max(1),
            max_immutable: max_immutable.max(1),
            active: RwLock::new(Arc::new(active)),
            immutables: RwLock::new(VecDeque::new()),
            next_sequence: AtomicU64::new(0),
            rotations: AtomicU64::new(0),
            async_flushes: AtomicU64::new(0),
        }
    }

    /// Applies a mutation to the active memtable, rotating when it fills.
    ///
    /// Returns true when the rotation left the immutable queue at capacity;
    /// the caller must then flush the oldest immutable synchronously,
    /// *after releasing every lock it holds*.
    pub fn apply(&self, entry: Entry) -> Result<bool> {
        {
            let active = self.active.read()?;
            active.apply(entry);
            if active.len() < self.memtable_size {
                return Ok(false);
            }
        }
        self.rotate()
    }

    /// Point lookup: active memtable first, then the immutable queue from
    /// newest to oldest. The first entry found wins, tombstones included.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        if let Some(entry) = self.active.read()?.get(key) {
            return Ok(Some(entry));
        }

        let immutables = self.immutables.read()?;
        for immutable in immutables.iter().rev() {
            if let Some(entry) = immutable.get(key) {
                return Ok(Some(entry));
            }
        }

        Ok(None)
    }

    /// Rotates the active memtable if non-empty and returns the rotated
    /// handle, already claimed for the caller to flush synchronously. The
    /// caller must hold the store's flush lock so the claim cannot reorder
    /// installs. The handle stays in the read path until
    /// [`remove`](Self::remove) is called.
    pub fn flush_active_sync(&self) -> Result<Option<Arc<ImmutableMemtable>>> {
        let mut active = self.active.write()?;
        if active.is_empty() {
            return Ok(None);
        }

        active.freeze();
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let immutable = Arc::new(ImmutableMemtable::new(active.clone(), sequence));
        immutable.try_claim();

        self.immutables.write()?.push_back(immutable.clone());
        *active = Arc::new(Memtable::new());
        self.rotations.fetch_add(1, Ordering::SeqCst);

        Ok(Some(immutable))
    }

    fn rotate(&self) -> Result<bool> {
        let mut active = self.active.write()?;
        if active.len() < self.memtable_size {
            // Another rotation won the race.
            return Ok(false);
        }

        active.freeze();
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let immutable = Arc::new(ImmutableMemtable::new(active.clone(), sequence));

        let mut immutables = self.immutables.write()?;
        immutables.push_back(immutable);
        *active = Arc::new(Memtable::new());
        self.rotations.fetch_add(1, Ordering::SeqCst);

        // Backpressure once the bound is reached.
        Ok(immutables.len() >= self.max_immutable)
    }

    /// Claims the oldest unclaimed immutable, FIFO order. Callers must hold
    /// the store's flush lock: claim order is install order.
    pub fn claim_oldest(&self) -> Result<Option<Arc<ImmutableMemtable>>> {
        let immutables = self.immutables.read()?;
        for immutable in immutables.iter() {
            if immutable.try_claim() {
                return Ok(Some(immutable.clone()));
            }
        }
        Ok(None)
    }

    /// Drops a flushed immutable from the queue.
    pub fn remove(&self, sequence: u64) -> Result<()> {
        let mut immutables = self.immutables.write()?;
        immutables.retain(|immutable| immutable.sequence() != sequence);
        Ok(())
    }

    pub fn active_len(&self) -> Result<usize> {
        Ok(self.active.read()?.len())
    }

    pub fn immutable_count(&self) -> Result<usize> {
        Ok(self.immutables.read()?.len())
    }

    pub fn rotations(&self) -> u64 {
        self.rotations.load(Ordering::SeqCst)
    }

    pub fn async_flushes(&self) -> u64 {
        self.async_flushes.load(Ordering::SeqCst)
    }

    pub fn note_async_flush(&self) {
        self.async_flushes.fetch_add(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for MemtableManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemtableManager")
            .field("memtable_size", &self.memtable_size)
            .field("max_immutable", &self.max_immutable)
            .field("rotations", &self.rotations())
            .finish()
    }
}
