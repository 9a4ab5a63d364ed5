//! Undo journal protecting commits against torn writes.
//!
//! Before a commit touches any file, the bytes it will overwrite and the
//! length of every file it will grow are written to `journal.dat` and
//! synced, then a trailing validity byte is appended and synced. On open,
//! a journal carrying the flag is replayed (old bytes restored, files cut
//! back) and removed; one without the flag never reached the data files
//! and is dropped.
//!
//! Layout: `[count u32] count × [file u8][old length u64]`
//! `[count u32] count × [file u8][offset u64][len u32][bytes]` `[flag u8]`.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::StorageError;

pub const JOURNAL_FILE: &str = "journal.dat";

const VALID_FLAG: u8 = 0xA5;

/// Files owned by a database directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileId {
    Data,
    Deleted,
    Extra,
    Index(u8),
}

impl FileId {
    fn tag(self) -> u8 {
        match self {
            FileId::Data => 0,
            FileId::Deleted => 1,
            FileId::Extra => 2,
            FileId::Index(id) => 0x80 | id,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(FileId::Data),
            1 => Some(FileId::Deleted),
            2 => Some(FileId::Extra),
            t if t & 0x80 != 0 => Some(FileId::Index(t & 0x7f)),
            _ => None,
        }
    }

    pub fn file_name(self) -> String {
        match self {
            FileId::Data => "data.dat".to_string(),
            FileId::Deleted => "deleted.dat".to_string(),
            FileId::Extra => "extra.dat".to_string(),
            FileId::Index(id) => format!("index_{}.dat", id),
        }
    }

    pub fn path(self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }
}

/// Old contents of one byte range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoRange {
    pub file: FileId,
    pub offset: u64,
    pub old: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Journal {
    pub lengths: Vec<(FileId, u64)>,
    pub ranges: Vec<UndoRange>,
}

impl Journal {
    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty() && self.ranges.is_empty()
    }

    fn encode_body(&self) -> Vec<u8> {
        let ranges_len: usize = self.ranges.iter().map(|r| 13 + r.old.len()).sum();
        let mut buf = Vec::with_capacity(8 + self.lengths.len() * 9 + ranges_len);
        buf.extend_from_slice(&(self.lengths.len() as u32).to_le_bytes());
        for (file, len) in &self.lengths {
            buf.push(file.tag());
            buf.extend_from_slice(&len.to_le_bytes());
        }
        buf.extend_from_slice(&(self.ranges.len() as u32).to_le_bytes());
        for range in &self.ranges {
            buf.push(range.file.tag());
            buf.extend_from_slice(&range.offset.to_le_bytes());
            buf.extend_from_slice(&(range.old.len() as u32).to_le_bytes());
            buf.extend_from_slice(&range.old);
        }
        buf
    }

    /// Parse a journal; `None` when it is truncated or lacks the flag.
    fn decode(bytes: &[u8]) -> Option<Self> {
        let (flag, body) = bytes.split_last()?;
        if *flag != VALID_FLAG {
            return None;
        }
        fn take<'a>(body: &'a [u8], pos: &mut usize, n: usize) -> Option<&'a [u8]> {
            let slice = body.get(*pos..*pos + n)?;
            *pos += n;
            Some(slice)
        }
        let u32_at = |b: &[u8]| u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        let u64_at = |b: &[u8]| {
            let mut a = [0u8; 8];
            a.copy_from_slice(b);
            u64::from_le_bytes(a)
        };
        let mut pos = 0usize;

        let mut journal = Journal::default();
        let count = u32_at(take(body, &mut pos, 4)?);
        for _ in 0..count {
            let file = FileId::from_tag(take(body, &mut pos, 1)?[0])?;
            let len = u64_at(take(body, &mut pos, 8)?);
            journal.lengths.push((file, len));
        }
        let count = u32_at(take(body, &mut pos, 4)?);
        for _ in 0..count {
            let file = FileId::from_tag(take(body, &mut pos, 1)?[0])?;
            let offset = u64_at(take(body, &mut pos, 8)?);
            let len = u32_at(take(body, &mut pos, 4)?) as usize;
            let old = take(body, &mut pos, len)?.to_vec();
            journal.ranges.push(UndoRange { file, offset, old });
        }
        if pos != body.len() {
            return None;
        }
        Some(journal)
    }

    /// Persist the journal: body, sync, flag, sync.
    pub fn write(&self, dir: &Path) -> Result<(), StorageError> {
        let mut file = File::create(dir.join(JOURNAL_FILE))?;
        file.write_all(&self.encode_body())?;
        file.sync_data()?;
        file.write_all(&[VALID_FLAG])?;
        file.sync_data()?;
        Ok(())
    }

    /// Remove the journal once a commit is fully on disk.
    pub fn clear(dir: &Path) -> Result<(), StorageError> {
        match fs::remove_file(dir.join(JOURNAL_FILE)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Undo an interrupted commit. Returns true when a journal was replayed.
    pub fn recover(dir: &Path) -> Result<bool, StorageError> {
        let bytes = match fs::read(dir.join(JOURNAL_FILE)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let Some(journal) = Journal::decode(&bytes) else {
            tracing::warn!("🗑️ Discarding incomplete journal ({} bytes)", bytes.len());
            Journal::clear(dir)?;
            return Ok(false);
        };

        tracing::warn!(
            "🔄 Replaying journal: {} ranges, {} file lengths",
            journal.ranges.len(),
            journal.lengths.len()
        );
        for range in &journal.ranges {
            let mut file = OpenOptions::new().write(true).open(range.file.path(dir))?;
            file.seek(SeekFrom::Start(range.offset))?;
            file.write_all(&range.old)?;
            file.sync_data()?;
        }
        for (id, len) in &journal.lengths {
            let file = OpenOptions::new().write(true).open(id.path(dir))?;
            file.set_len(*len)?;
            file.sync_data()?;
        }
        Journal::clear(dir)?;
        Ok(true)
    }
}
