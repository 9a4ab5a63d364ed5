//! Durable key/value store with staged change sets.
//!
//! Every index maps fixed-size keys to variable-length values kept in one
//! shared `data.dat`. Index slots live in `index_<id>.dat`, free byte ranges
//! of `data.dat` in `deleted.dat`, and a small fixed region of extra data in
//! `extra.dat`. All of it is mirrored in memory by [`BTreeIndex`] trees.
//!
//! Mutations never touch disk directly. They collect in the *current*
//! change set; [`Database::stage`] folds current into *staged*,
//! [`Database::revert`] drops current, and [`Database::commit`] writes
//! staged to disk once enough time or data has accumulated. Reads see
//! current, then staged, then disk.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::btree::{compare_prefixed_keys, BTreeIndex};
use super::journal::{FileId, Journal, UndoRange};
use super::StorageError;

/// Length stored in an index slot whose key was deleted.
pub const DELETED_VALUE: u32 = u32::MAX;

/// Size of one `deleted.dat` record: active u8, length u32, offset u64.
const FREE_RECORD_SIZE: u64 = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexDef {
    /// Index ids must stay below 128.
    pub id: u8,
    pub key_size: usize,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Minimum time between two commits reaching disk
    pub commit_gap_ms: u64,
    /// Staged bytes that force a commit regardless of the gap
    pub cache_limit: usize,
    pub extra_data_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig { commit_gap_ms: 5_000, cache_limit: 16 * 1024 * 1024, extra_data_size: 64 }
    }
}

// ─── In-memory records ───────────────────────────────────────────────

/// A committed key: where its value lives and which slot holds the record.
#[derive(Debug, Clone)]
struct IndexEntry {
    /// Length-prefixed key
    key: Vec<u8>,
    offset: u64,
    length: u32,
    slot: u64,
}

/// A free range of `data.dat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeRange {
    length: u32,
    offset: u64,
    slot: u64,
}

/// An uncommitted write (`Some`) or delete (`None`).
#[derive(Debug, Clone)]
struct Pending {
    key: Vec<u8>,
    value: Option<Vec<u8>>,
}

impl Pending {
    fn size(&self) -> usize {
        self.key.len() + self.value.as_ref().map_or(0, Vec::len)
    }
}

type Cmp<T> = fn(&T, &T) -> Ordering;

fn compare_entries(a: &IndexEntry, b: &IndexEntry) -> Ordering {
    compare_prefixed_keys(&a.key, &b.key)
}

// Best fit: smallest length first, then lowest offset.
fn compare_free(a: &FreeRange, b: &FreeRange) -> Ordering {
    a.length.cmp(&b.length).then(a.offset.cmp(&b.offset))
}

fn compare_pending(a: &Pending, b: &Pending) -> Ordering {
    compare_prefixed_keys(&a.key, &b.key)
}

fn prefixed(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 1);
    out.push(key.len() as u8);
    out.extend_from_slice(key);
    out
}

fn probe_entry(key: Vec<u8>) -> IndexEntry {
    IndexEntry { key, offset: 0, length: 0, slot: 0 }
}

// ─── Change sets ─────────────────────────────────────────────────────

#[derive(Default)]
struct ChangeSet {
    indexes: BTreeMap<u8, BTreeIndex<Pending, Cmp<Pending>>>,
    extra: Option<Vec<u8>>,
    bytes: usize,
}

impl ChangeSet {
    fn is_empty(&self) -> bool {
        self.extra.is_none() && self.indexes.values().all(|t| t.is_empty())
    }

    fn lookup(&self, index: u8, key: &[u8]) -> Option<&Option<Vec<u8>>> {
        let tree = self.indexes.get(&index)?;
        tree.lookup_by(|p| compare_prefixed_keys(&p.key, key)).map(|p| &p.value)
    }

    fn put(&mut self, index: u8, pending: Pending) {
        self.bytes += pending.size();
        let replaced = self
            .indexes
            .entry(index)
            .or_insert_with(|| BTreeIndex::new(compare_pending as Cmp<Pending>))
            .insert_sorted(pending);
        if let Some(old) = replaced {
            self.bytes = self.bytes.saturating_sub(old.size());
        }
    }

    /// Fold `newer` on top of this set.
    fn absorb(&mut self, newer: ChangeSet) {
        for (index, tree) in newer.indexes {
            for pending in tree.iter() {
                self.put(index, pending.clone());
            }
        }
        if newer.extra.is_some() {
            self.extra = newer.extra;
        }
    }
}

// ─── Files ───────────────────────────────────────────────────────────

struct DiskIndex {
    def: IndexDef,
    file: File,
    entries: BTreeIndex<IndexEntry, Cmp<IndexEntry>>,
    free_slots: Vec<u64>,
    slot_count: u64,
}

impl DiskIndex {
    fn record_size(&self) -> u64 {
        self.def.key_size as u64 + 12
    }
}

fn open_file(path: &Path) -> Result<File, StorageError> {
    Ok(OpenOptions::new().read(true).write(true).create(true).open(path)?)
}

fn read_all(file: &mut File) -> Result<Vec<u8>, StorageError> {
    let mut buf = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut buf)?;
    Ok(buf)
}

fn read_at(file: &mut File, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
    let mut buf = vec![0u8; len];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buf)?;
    Ok(buf)
}

fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn le_u64(b: &[u8]) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[..8]);
    u64::from_le_bytes(a)
}

/// One write a commit will perform.
struct PlannedWrite {
    file: FileId,
    offset: u64,
    data: Vec<u8>,
}

struct Inner {
    dir: PathBuf,
    config: DatabaseConfig,
    data: File,
    data_len: u64,
    deleted: File,
    deleted_slots: u64,
    free: BTreeIndex<FreeRange, Cmp<FreeRange>>,
    free_record_slots: Vec<u64>,
    extra_file: File,
    extra: Vec<u8>,
    indexes: BTreeMap<u8, DiskIndex>,
    current: ChangeSet,
    staged: ChangeSet,
    last_commit: Instant,
    poisoned: bool,
}

/// Durable store handle. Internally synchronized; every method takes `&self`.
pub struct Database {
    inner: Mutex<Inner>,
}

impl Database {
    /// Open or create a store in `dir`, replaying an interrupted commit first.
    pub fn open<P: AsRef<Path>>(dir: P, config: DatabaseConfig, defs: &[IndexDef]) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        if Journal::recover(&dir)? {
            tracing::warn!("💾 Recovered interrupted commit in {}", dir.display());
        }

        let mut data = open_file(&FileId::Data.path(&dir))?;
        let data_len = data.seek(SeekFrom::End(0))?;

        let mut deleted = open_file(&FileId::Deleted.path(&dir))?;
        let mut free = BTreeIndex::new(compare_free as Cmp<FreeRange>);
        let mut free_record_slots = Vec::new();
        let raw = read_all(&mut deleted)?;
        let deleted_slots = raw.len() as u64 / FREE_RECORD_SIZE;
        for (slot, rec) in raw.chunks_exact(FREE_RECORD_SIZE as usize).enumerate() {
            if rec[0] != 0 {
                free.insert_sorted(FreeRange { length: le_u32(&rec[1..5]), offset: le_u64(&rec[5..13]), slot: slot as u64 });
            } else {
                free_record_slots.push(slot as u64);
            }
        }

        let mut extra_file = open_file(&FileId::Extra.path(&dir))?;
        let mut extra = read_all(&mut extra_file)?;
        extra.resize(config.extra_data_size, 0);

        let mut indexes = BTreeMap::new();
        for def in defs {
            if def.id >= 0x80 || def.key_size == 0 || def.key_size > u8::MAX as usize {
                return Err(StorageError::Corrupt(format!("invalid index definition {:?}", def)));
            }
            let mut file = open_file(&FileId::Index(def.id).path(&dir))?;
            let raw = read_all(&mut file)?;
            let record_size = def.key_size + 12;
            if raw.len() % record_size != 0 {
                return Err(StorageError::Corrupt(format!("index {} has a partial record", def.id)));
            }
            let mut entries = BTreeIndex::new(compare_entries as Cmp<IndexEntry>);
            let mut free_slots = Vec::new();
            for (slot, rec) in raw.chunks_exact(record_size).enumerate() {
                let key = &rec[..def.key_size];
                let offset = le_u64(&rec[def.key_size..]);
                let length = le_u32(&rec[def.key_size + 8..]);
                if length == DELETED_VALUE {
                    free_slots.push(slot as u64);
                } else {
                    entries.insert_sorted(IndexEntry { key: prefixed(key), offset, length, slot: slot as u64 });
                }
            }
            let slot_count = (raw.len() / record_size) as u64;
            indexes.insert(def.id, DiskIndex { def: *def, file, entries, free_slots, slot_count });
        }

        tracing::info!(
            "💾 Opened store at {} ({} indexes, {} bytes of data)",
            dir.display(),
            indexes.len(),
            data_len
        );

        Ok(Database {
            inner: Mutex::new(Inner {
                dir,
                config,
                data,
                data_len,
                deleted,
                deleted_slots,
                free,
                free_record_slots,
                extra_file,
                extra,
                indexes,
                current: ChangeSet::default(),
                staged: ChangeSet::default(),
                last_commit: Instant::now(),
                poisoned: false,
            }),
        })
    }

    // ─── Reads ───────────────────────────────────────────────────────

    pub fn get(&self, index: u8, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let mut inner = self.inner.lock();
        inner.check(index, key)?;
        inner.value(index, key)
    }

    /// `len` bytes of a value starting at `offset`. Ranges past the end of
    /// the value are a corruption error.
    pub fn read_sub(&self, index: u8, key: &[u8], offset: usize, len: usize) -> Result<Option<Vec<u8>>, StorageError> {
        let mut inner = self.inner.lock();
        inner.check(index, key)?;
        if let Some(value) = inner.pending(index, key) {
            return match value {
                None => Ok(None),
                Some(v) => v
                    .get(offset..offset + len)
                    .map(|s| Some(s.to_vec()))
                    .ok_or_else(|| StorageError::Corrupt(format!("sub-read {}+{} past {}", offset, len, v.len()))),
            };
        }
        let Some((value_offset, length)) = inner.disk_location(index, key) else {
            return Ok(None);
        };
        if offset + len > length as usize {
            return Err(StorageError::Corrupt(format!("sub-read {}+{} past {}", offset, len, length)));
        }
        Ok(Some(read_at(&mut inner.data, value_offset + offset as u64, len)?))
    }

    pub fn value_len(&self, index: u8, key: &[u8]) -> Result<Option<usize>, StorageError> {
        let inner = self.inner.lock();
        inner.check(index, key)?;
        if let Some(value) = inner.pending(index, key) {
            return Ok(value.as_ref().map(Vec::len));
        }
        Ok(inner.disk_location(index, key).map(|(_, len)| len as usize))
    }

    pub fn exists(&self, index: u8, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.value_len(index, key)?.is_some())
    }

    /// Keys in `[min, max]` across all three layers, ascending.
    pub fn keys_in_range(&self, index: u8, min: &[u8], max: &[u8]) -> Result<Vec<Vec<u8>>, StorageError> {
        let inner = self.inner.lock();
        inner.check(index, min)?;
        inner.check(index, max)?;
        let (pmin, pmax) = (prefixed(min), prefixed(max));
        let mut keys: BTreeSet<Vec<u8>> = BTreeSet::new();
        if let Some(disk) = inner.indexes.get(&index) {
            let (lo, hi) = (probe_entry(pmin.clone()), probe_entry(pmax.clone()));
            keys.extend(disk.entries.range(&lo, &hi).map(|e| e.key[1..].to_vec()));
        }
        for set in [&inner.staged, &inner.current] {
            let Some(tree) = set.indexes.get(&index) else { continue };
            let lo = Pending { key: pmin.clone(), value: None };
            let hi = Pending { key: pmax.clone(), value: None };
            for pending in tree.range(&lo, &hi) {
                let key = pending.key[1..].to_vec();
                if pending.value.is_some() {
                    keys.insert(key);
                } else {
                    keys.remove(&key);
                }
            }
        }
        Ok(keys.into_iter().collect())
    }

    pub fn read_extra(&self, offset: usize, len: usize) -> Result<Vec<u8>, StorageError> {
        let inner = self.inner.lock();
        inner.ensure_usable()?;
        let extra = inner.extra_view();
        extra
            .get(offset..offset + len)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| StorageError::Corrupt(format!("extra read {}+{} past {}", offset, len, extra.len())))
    }

    // ─── Writes (into the current change set) ───────────────────────

    pub fn write(&self, index: u8, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        inner.check(index, key)?;
        inner.current.put(index, Pending { key: prefixed(key), value: Some(value.to_vec()) });
        Ok(())
    }

    /// Overwrite part of an existing value, growing it when the section
    /// extends past its end.
    pub fn write_sub(&self, index: u8, key: &[u8], offset: usize, data: &[u8]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        inner.check(index, key)?;
        let mut value = inner
            .value(index, key)?
            .ok_or_else(|| StorageError::NotFound(format!("index {} key {}", index, hex::encode(key))))?;
        if value.len() < offset + data.len() {
            value.resize(offset + data.len(), 0);
        }
        value[offset..offset + data.len()].copy_from_slice(data);
        inner.current.put(index, Pending { key: prefixed(key), value: Some(value) });
        Ok(())
    }

    /// Returns whether the key existed.
    pub fn delete(&self, index: u8, key: &[u8]) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock();
        inner.check(index, key)?;
        let existed = inner.exists_locked(index, key);
        if existed {
            inner.current.put(index, Pending { key: prefixed(key), value: None });
        }
        Ok(existed)
    }

    /// Move a value to a new key. Returns false when `old` does not exist.
    pub fn change_key(&self, index: u8, old: &[u8], new: &[u8]) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock();
        inner.check(index, old)?;
        inner.check(index, new)?;
        let Some(value) = inner.value(index, old)? else {
            return Ok(false);
        };
        inner.current.put(index, Pending { key: prefixed(old), value: None });
        inner.current.put(index, Pending { key: prefixed(new), value: Some(value) });
        Ok(true)
    }

    pub fn write_extra(&self, offset: usize, data: &[u8]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        inner.ensure_usable()?;
        let mut extra = inner.extra_view().to_vec();
        if offset + data.len() > extra.len() {
            return Err(StorageError::Corrupt(format!("extra write {}+{} past {}", offset, data.len(), extra.len())));
        }
        extra[offset..offset + data.len()].copy_from_slice(data);
        inner.current.bytes += data.len();
        inner.current.extra = Some(extra);
        Ok(())
    }

    // ─── Change-set lifecycle ───────────────────────────────────────

    /// Fold the current change set into the staged one.
    pub fn stage(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        inner.ensure_usable()?;
        let current = std::mem::take(&mut inner.current);
        inner.staged.absorb(current);
        Ok(())
    }

    /// Drop every change since the last [`Database::stage`].
    pub fn revert(&self) {
        let mut inner = self.inner.lock();
        inner.current = ChangeSet::default();
    }

    /// Write staged changes when the commit gap elapsed or the staged size
    /// exceeds the cache limit. Returns whether anything reached disk.
    pub fn commit(&self) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock();
        inner.ensure_usable()?;
        if inner.staged.is_empty() {
            return Ok(false);
        }
        let gap = Duration::from_millis(inner.config.commit_gap_ms);
        if inner.last_commit.elapsed() < gap && inner.staged.bytes <= inner.config.cache_limit {
            return Ok(false);
        }
        inner.write_staged()?;
        Ok(true)
    }

    /// Write staged changes now. Current changes stay pending.
    pub fn flush(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        inner.ensure_usable()?;
        if inner.staged.is_empty() {
            return Ok(());
        }
        inner.write_staged()
    }

    /// Bytes waiting in the staged change set.
    pub fn staged_bytes(&self) -> usize {
        self.inner.lock().staged.bytes
    }
}

impl Inner {
    fn ensure_usable(&self) -> Result<(), StorageError> {
        if self.poisoned {
            return Err(StorageError::Poisoned);
        }
        Ok(())
    }

    fn check(&self, index: u8, key: &[u8]) -> Result<(), StorageError> {
        self.ensure_usable()?;
        let disk = self.indexes.get(&index).ok_or(StorageError::UnknownIndex(index))?;
        if key.len() != disk.def.key_size {
            return Err(StorageError::InvalidKey { index, expected: disk.def.key_size, actual: key.len() });
        }
        Ok(())
    }

    /// Newest pending state of a key, if any layer holds one.
    fn pending(&self, index: u8, key: &[u8]) -> Option<&Option<Vec<u8>>> {
        let probe = prefixed(key);
        self.current.lookup(index, &probe).or_else(|| self.staged.lookup(index, &probe))
    }

    fn disk_location(&self, index: u8, key: &[u8]) -> Option<(u64, u32)> {
        let probe = prefixed(key);
        self.indexes
            .get(&index)?
            .entries
            .lookup_by(|e| compare_prefixed_keys(&e.key, &probe))
            .map(|e| (e.offset, e.length))
    }

    fn exists_locked(&self, index: u8, key: &[u8]) -> bool {
        match self.pending(index, key) {
            Some(value) => value.is_some(),
            None => self.disk_location(index, key).is_some(),
        }
    }

    fn value(&mut self, index: u8, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        if let Some(value) = self.pending(index, key) {
            return Ok(value.clone());
        }
        match self.disk_location(index, key) {
            Some((offset, length)) => Ok(Some(read_at(&mut self.data, offset, length as usize)?)),
            None => Ok(None),
        }
    }

    fn extra_view(&self) -> &[u8] {
        self.current
            .extra
            .as_deref()
            .or(self.staged.extra.as_deref())
            .unwrap_or(&self.extra)
    }

    // ─── Commit ─────────────────────────────────────────────────────

    fn write_staged(&mut self) -> Result<(), StorageError> {
        let result = self.try_write_staged();
        if let Err(e) = &result {
            tracing::error!("❌ Commit failed, store poisoned until reopened: {}", e);
            self.poisoned = true;
        }
        result
    }

    fn try_write_staged(&mut self) -> Result<(), StorageError> {
        let started = Instant::now();
        let staged = std::mem::take(&mut self.staged);
        let bytes = staged.bytes;

        let mut old_lengths: BTreeMap<FileId, u64> = BTreeMap::new();
        old_lengths.insert(FileId::Data, self.data_len);
        old_lengths.insert(FileId::Deleted, self.deleted_slots * FREE_RECORD_SIZE);
        for disk in self.indexes.values() {
            old_lengths.insert(FileId::Index(disk.def.id), disk.slot_count * disk.record_size());
        }

        let mut plan = Vec::new();
        for (index, tree) in &staged.indexes {
            for pending in tree.iter() {
                self.plan_pending(*index, pending, &mut plan)?;
            }
        }
        if let Some(extra) = staged.extra {
            old_lengths.insert(FileId::Extra, self.extra_file.metadata()?.len());
            plan.push(PlannedWrite { file: FileId::Extra, offset: 0, data: extra.clone() });
            self.extra = extra;
        }

        let mut journal = Journal { lengths: old_lengths.iter().map(|(f, l)| (*f, *l)).collect(), ranges: Vec::new() };
        for write in &plan {
            let old_len = old_lengths.get(&write.file).copied().unwrap_or(0);
            if write.offset < old_len {
                let end = (write.offset + write.data.len() as u64).min(old_len);
                let file = self.file_mut(write.file)?;
                let old = read_at(file, write.offset, (end - write.offset) as usize)?;
                journal.ranges.push(UndoRange { file: write.file, offset: write.offset, old });
            }
        }
        journal.write(&self.dir)?;

        for write in &plan {
            let file = self.file_mut(write.file)?;
            file.seek(SeekFrom::Start(write.offset))?;
            file.write_all(&write.data)?;
        }
        let touched: BTreeSet<FileId> = plan.iter().map(|w| w.file).collect();
        for id in touched {
            self.file_mut(id)?.sync_data()?;
        }
        Journal::clear(&self.dir)?;

        self.last_commit = Instant::now();
        tracing::debug!(
            "💾 Committed {} staged bytes in {} writes ({:?})",
            bytes,
            plan.len(),
            started.elapsed()
        );
        Ok(())
    }

    fn file_mut(&mut self, id: FileId) -> Result<&mut File, StorageError> {
        match id {
            FileId::Data => Ok(&mut self.data),
            FileId::Deleted => Ok(&mut self.deleted),
            FileId::Extra => Ok(&mut self.extra_file),
            FileId::Index(i) => self
                .indexes
                .get_mut(&i)
                .map(|d| &mut d.file)
                .ok_or(StorageError::UnknownIndex(i)),
        }
    }

    /// Turn one pending change into file writes, updating the in-memory
    /// trees as if the writes had happened.
    fn plan_pending(&mut self, index: u8, pending: &Pending, plan: &mut Vec<PlannedWrite>) -> Result<(), StorageError> {
        let disk = self.indexes.get(&index).ok_or(StorageError::UnknownIndex(index))?;
        let existing = disk.entries.lookup_by(|e| compare_prefixed_keys(&e.key, &pending.key)).cloned();

        match (&pending.value, existing) {
            (None, None) => {}
            (None, Some(entry)) => {
                self.release_range(entry.offset, entry.length, plan);
                let disk = self.disk_mut(index)?;
                disk.entries.remove(&entry);
                disk.free_slots.push(entry.slot);
                let record = index_record(&entry.key[1..], 0, DELETED_VALUE);
                let offset = entry.slot * disk.record_size();
                plan.push(PlannedWrite { file: FileId::Index(index), offset, data: record });
            }
            (Some(value), Some(entry)) if value.len() as u32 == entry.length => {
                plan.push(PlannedWrite { file: FileId::Data, offset: entry.offset, data: value.clone() });
            }
            (Some(value), existing) => {
                let length = u32::try_from(value.len())
                    .ok()
                    .filter(|l| *l != DELETED_VALUE)
                    .ok_or_else(|| StorageError::Corrupt(format!("value of {} bytes too large", value.len())))?;
                if let Some(entry) = &existing {
                    self.release_range(entry.offset, entry.length, plan);
                }
                let offset = self.allocate(length, plan);
                plan.push(PlannedWrite { file: FileId::Data, offset, data: value.clone() });

                let disk = self.disk_mut(index)?;
                let slot = match &existing {
                    Some(entry) => {
                        disk.entries.remove(entry);
                        entry.slot
                    }
                    None => disk.free_slots.pop().unwrap_or_else(|| {
                        disk.slot_count += 1;
                        disk.slot_count - 1
                    }),
                };
                disk.entries.insert_sorted(IndexEntry { key: pending.key.clone(), offset, length, slot });
                let record = index_record(&pending.key[1..], offset, length);
                plan.push(PlannedWrite { file: FileId::Index(index), offset: slot * disk.record_size(), data: record });
            }
        }
        Ok(())
    }

    fn disk_mut(&mut self, index: u8) -> Result<&mut DiskIndex, StorageError> {
        self.indexes.get_mut(&index).ok_or(StorageError::UnknownIndex(index))
    }

    fn release_range(&mut self, offset: u64, length: u32, plan: &mut Vec<PlannedWrite>) {
        if length == 0 {
            return;
        }
        let slot = self.free_record_slots.pop().unwrap_or_else(|| {
            self.deleted_slots += 1;
            self.deleted_slots - 1
        });
        self.free.insert_sorted(FreeRange { length, offset, slot });
        plan.push(PlannedWrite {
            file: FileId::Deleted,
            offset: slot * FREE_RECORD_SIZE,
            data: free_record(true, length, offset),
        });
    }

    /// Best-fit allocation from the free list, appending when nothing fits.
    fn allocate(&mut self, length: u32, plan: &mut Vec<PlannedWrite>) -> u64 {
        if length == 0 {
            return 0;
        }
        let min = FreeRange { length, offset: 0, slot: 0 };
        let max = FreeRange { length: u32::MAX, offset: u64::MAX, slot: 0 };
        let fit = self.free.range_start(&min, &max).and_then(|pos| self.free.get(&pos).copied());
        let Some(range) = fit else {
            let offset = self.data_len;
            self.data_len += length as u64;
            return offset;
        };

        self.free.remove(&range);
        let remainder = range.length - length;
        let record = if remainder > 0 {
            let rest = FreeRange { length: remainder, offset: range.offset + length as u64, slot: range.slot };
            self.free.insert_sorted(rest);
            free_record(true, rest.length, rest.offset)
        } else {
            self.free_record_slots.push(range.slot);
            free_record(false, 0, 0)
        };
        plan.push(PlannedWrite { file: FileId::Deleted, offset: range.slot * FREE_RECORD_SIZE, data: record });
        range.offset
    }
}

fn index_record(key: &[u8], offset: u64, length: u32) -> Vec<u8> {
    let mut rec = Vec::with_capacity(key.len() + 12);
    rec.extend_from_slice(key);
    rec.extend_from_slice(&offset.to_le_bytes());
    rec.extend_from_slice(&length.to_le_bytes());
    rec
}

fn free_record(active: bool, length: u32, offset: u64) -> Vec<u8> {
    let mut rec = Vec::with_capacity(FREE_RECORD_SIZE as usize);
    rec.push(active as u8);
    rec.extend_from_slice(&length.to_le_bytes());
    rec.extend_from_slice(&offset.to_le_bytes());
    rec
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDX: u8 = 1;

    fn defs() -> Vec<IndexDef> {
        vec![IndexDef { id: IDX, key_size: 4 }]
    }

    fn config() -> DatabaseConfig {
        DatabaseConfig { commit_gap_ms: 0, cache_limit: 1 << 20, extra_data_size: 8 }
    }

    fn open(dir: &Path) -> Database {
        Database::open(dir, config(), &defs()).unwrap()
    }

    #[test]
    fn test_read_overlay_order() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());
        db.write(IDX, b"key1", b"disk").unwrap();
        db.stage().unwrap();
        db.flush().unwrap();

        db.write(IDX, b"key1", b"staged").unwrap();
        db.stage().unwrap();
        assert_eq!(db.get(IDX, b"key1").unwrap(), Some(b"staged".to_vec()));

        db.write(IDX, b"key1", b"current").unwrap();
        assert_eq!(db.get(IDX, b"key1").unwrap(), Some(b"current".to_vec()));

        db.revert();
        assert_eq!(db.get(IDX, b"key1").unwrap(), Some(b"staged".to_vec()));
    }

    #[test]
    fn test_delete_masks_lower_layers() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());
        db.write(IDX, b"aaaa", b"v").unwrap();
        db.stage().unwrap();
        db.flush().unwrap();

        assert!(db.delete(IDX, b"aaaa").unwrap());
        assert!(!db.exists(IDX, b"aaaa").unwrap());
        assert!(!db.delete(IDX, b"aaaa").unwrap());
        db.revert();
        assert!(db.exists(IDX, b"aaaa").unwrap());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = open(dir.path());
            db.write(IDX, b"k001", b"hello").unwrap();
            db.write(IDX, b"k002", b"world!").unwrap();
            db.write_extra(2, &[7, 7]).unwrap();
            db.stage().unwrap();
            db.flush().unwrap();
            db.write(IDX, b"k003", b"never staged").unwrap();
        }
        let db = open(dir.path());
        assert_eq!(db.get(IDX, b"k001").unwrap(), Some(b"hello".to_vec()));
        assert_eq!(db.get(IDX, b"k002").unwrap(), Some(b"world!".to_vec()));
        assert_eq!(db.get(IDX, b"k003").unwrap(), None);
        assert_eq!(db.read_extra(0, 4).unwrap(), vec![0, 0, 7, 7]);
    }

    #[test]
    fn test_extra_commits_on_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let small = DatabaseConfig { extra_data_size: 5, ..config() };
        {
            let db = Database::open(dir.path(), small.clone(), &defs()).unwrap();
            db.write_extra(0, &[1]).unwrap();
            db.stage().unwrap();
            db.flush().unwrap();

            // The file now exists at full size; a second commit journals it.
            db.write_extra(4, &[9]).unwrap();
            db.write(IDX, b"k001", b"after").unwrap();
            db.stage().unwrap();
            db.flush().unwrap();
        }
        assert_eq!(std::fs::metadata(dir.path().join("extra.dat")).unwrap().len(), 5);
        let db = Database::open(dir.path(), small, &defs()).unwrap();
        assert_eq!(db.read_extra(0, 5).unwrap(), vec![1, 0, 0, 0, 9]);
        assert_eq!(db.get(IDX, b"k001").unwrap(), Some(b"after".to_vec()));
    }

    #[test]
    fn test_rewritten_keys_count_once() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());
        db.write(IDX, b"k001", &[0u8; 10]).unwrap();
        db.write(IDX, b"k001", &[1u8; 10]).unwrap();
        db.stage().unwrap();
        assert_eq!(db.staged_bytes(), 4 + 10);

        db.write(IDX, b"k001", &[2u8; 3]).unwrap();
        db.stage().unwrap();
        assert_eq!(db.staged_bytes(), 4 + 3);

        db.delete(IDX, b"k001").unwrap();
        db.stage().unwrap();
        assert_eq!(db.staged_bytes(), 4);
    }

    #[test]
    fn test_freed_space_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());
        db.write(IDX, b"big1", &[1u8; 100]).unwrap();
        db.stage().unwrap();
        db.flush().unwrap();
        let size_after_first = std::fs::metadata(dir.path().join("data.dat")).unwrap().len();

        db.delete(IDX, b"big1").unwrap();
        db.stage().unwrap();
        db.flush().unwrap();
        db.write(IDX, b"sml1", &[2u8; 40]).unwrap();
        db.write(IDX, b"sml2", &[3u8; 60]).unwrap();
        db.stage().unwrap();
        db.flush().unwrap();

        let size = std::fs::metadata(dir.path().join("data.dat")).unwrap().len();
        assert_eq!(size, size_after_first);
        assert_eq!(db.get(IDX, b"sml1").unwrap(), Some(vec![2u8; 40]));
        assert_eq!(db.get(IDX, b"sml2").unwrap(), Some(vec![3u8; 60]));

        drop(db);
        let db = open(dir.path());
        assert_eq!(db.get(IDX, b"sml2").unwrap(), Some(vec![3u8; 60]));
        assert!(!db.exists(IDX, b"big1").unwrap());
    }

    #[test]
    fn test_sub_reads_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());
        db.write(IDX, b"blk0", b"0123456789").unwrap();
        db.stage().unwrap();
        db.flush().unwrap();

        assert_eq!(db.read_sub(IDX, b"blk0", 2, 3).unwrap(), Some(b"234".to_vec()));
        assert!(db.read_sub(IDX, b"blk0", 8, 5).is_err());
        db.write_sub(IDX, b"blk0", 8, b"XYZ").unwrap();
        assert_eq!(db.get(IDX, b"blk0").unwrap(), Some(b"01234567XYZ".to_vec()));
        assert_eq!(db.value_len(IDX, b"blk0").unwrap(), Some(11));
        assert!(matches!(db.write_sub(IDX, b"none", 0, b"x"), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_change_key_and_range() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());
        for i in 0..10u32 {
            db.write(IDX, &i.to_be_bytes(), &[i as u8]).unwrap();
        }
        db.stage().unwrap();
        db.flush().unwrap();

        assert!(db.change_key(IDX, &3u32.to_be_bytes(), &30u32.to_be_bytes()).unwrap());
        assert!(!db.change_key(IDX, &99u32.to_be_bytes(), &100u32.to_be_bytes()).unwrap());
        db.delete(IDX, &5u32.to_be_bytes()).unwrap();

        let keys = db.keys_in_range(IDX, &2u32.to_be_bytes(), &40u32.to_be_bytes()).unwrap();
        let keys: Vec<u32> = keys.iter().map(|k| u32::from_be_bytes([k[0], k[1], k[2], k[3]])).collect();
        assert_eq!(keys, vec![2, 4, 6, 7, 8, 9, 30]);
        assert_eq!(db.get(IDX, &30u32.to_be_bytes()).unwrap(), Some(vec![3]));
    }

    #[test]
    fn test_commit_waits_for_gap() {
        let dir = tempfile::tempdir().unwrap();
        let slow = DatabaseConfig { commit_gap_ms: 3_600_000, cache_limit: 64, extra_data_size: 0 };
        let db = Database::open(dir.path(), slow, &defs()).unwrap();
        db.write(IDX, b"k000", b"small").unwrap();
        db.stage().unwrap();
        assert!(!db.commit().unwrap());

        db.write(IDX, b"k001", &[0u8; 100]).unwrap();
        db.stage().unwrap();
        assert!(db.commit().unwrap());
        assert_eq!(db.staged_bytes(), 0);
    }

    #[test]
    fn test_key_size_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());
        assert!(matches!(db.write(IDX, b"toolong", b"v"), Err(StorageError::InvalidKey { .. })));
        assert!(matches!(db.get(9, b"abcd"), Err(StorageError::UnknownIndex(9))));
    }

    #[test]
    fn test_interrupted_commit_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = open(dir.path());
            db.write(IDX, b"keep", b"original").unwrap();
            db.stage().unwrap();
            db.flush().unwrap();
        }
        // Journal of a commit that rewrote the value in place and then died.
        let data_path = dir.path().join("data.dat");
        let journal = Journal {
            lengths: vec![(FileId::Data, 8)],
            ranges: vec![UndoRange { file: FileId::Data, offset: 0, old: b"original".to_vec() }],
        };
        journal.write(dir.path()).unwrap();
        std::fs::write(&data_path, b"garbage!trailing").unwrap();

        let db = open(dir.path());
        assert_eq!(db.get(IDX, b"keep").unwrap(), Some(b"original".to_vec()));
        assert_eq!(std::fs::metadata(&data_path).unwrap().len(), 8);
    }
}
