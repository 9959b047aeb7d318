//! Write-ahead log: append-only journal of logical operations with
//! per-entry CRC, deferred recovery, auto-checkpoint triggers, and the
//! checkpoint-merge routine that folds the log into the main file.

use std::any::Any;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use tracing::warn;

use crate::crc::Crc32;
use crate::error::TqdbError;
use crate::io::FramedReader;
use crate::registry::Registry;

const WAL_MAGIC: u32 = 0x4C41_5754;
const WAL_VERSION: u16 = 1;
const WAL_HEADER_SIZE: u64 = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalOp {
    Add = 1,
    Update = 2,
    Delete = 3,
}

impl WalOp {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(WalOp::Add),
            2 => Some(WalOp::Update),
            3 => Some(WalOp::Delete),
            _ => None,
        }
    }
}

/// Outcome of [`Wal::find`]. The op tag on `Found` tells the caller whether
/// to install the cache entry as `CacheOp::Add` or `CacheOp::Update`.
pub enum WalLookup {
    Absent,
    Deleted,
    Found(Box<dyn Any + Send + Sync>, WalOp),
}

/// One deduplicated, deserialized replay record used by checkpoint-merge.
pub struct ReplayEntry {
    pub type_index: usize,
    pub id: u32,
    pub op: WalOp,
    pub payload: Option<Box<dyn Any + Send + Sync>>,
}

#[derive(Debug, Clone, Copy)]
pub struct WalStats {
    pub entries: usize,
    pub size: u64,
}

pub struct Wal {
    pub path: PathBuf,
    file: File,
    entry_count: u32,
    size: u64,
    db_crc: u32,
    pub recovery_pending: bool,
}

impl Wal {
    /// Open an existing WAL, or create a fresh one if missing or its
    /// header is unreadable/invalid.
    pub fn open(path: PathBuf, current_db_crc: u32) -> Result<Self, TqdbError> {
        if let Ok(mut file) = File::options().read(true).write(true).open(&path) {
            let mut header = [0u8; WAL_HEADER_SIZE as usize];
            if file.read_exact(&mut header).is_ok() {
                let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
                let version = u16::from_le_bytes(header[4..6].try_into().unwrap());
                if magic == WAL_MAGIC && version <= WAL_VERSION {
                    let db_crc = u32::from_le_bytes(header[8..12].try_into().unwrap());
                    let entry_count = u32::from_le_bytes(header[12..16].try_into().unwrap());
                    let size = file.metadata()?.len();
                    let recovery_pending = entry_count > 0;
                    return Ok(Self {
                        path,
                        file,
                        entry_count,
                        size,
                        db_crc,
                        recovery_pending,
                    });
                }
                warn!(path = %path.display(), "WAL header invalid, recreating");
            }
        }
        Self::create_fresh(path, current_db_crc)
    }

    fn create_fresh(path: PathBuf, db_crc: u32) -> Result<Self, TqdbError> {
        {
            let mut file = File::create(&path)?;
            write_header(&mut file, db_crc, 0)?;
            file.sync_all()?;
        }
        let file = File::options().read(true).write(true).open(&path)?;
        Ok(Self {
            path,
            file,
            entry_count: 0,
            size: WAL_HEADER_SIZE,
            db_crc,
            recovery_pending: false,
        })
    }

    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    pub fn stats(&self) -> WalStats {
        WalStats {
            entries: self.entry_count as usize,
            size: self.size,
        }
    }

    pub fn should_checkpoint(&self, max_entries: usize, max_size: usize) -> bool {
        self.entry_count as usize >= max_entries || self.size >= max_size as u64
    }

    /// Append one logical operation. `payload` is the already-serialized
    /// entity (empty/`None` for DELETE).
    pub fn append(
        &mut self,
        type_index: u8,
        id: u32,
        op: WalOp,
        payload: Option<&[u8]>,
    ) -> Result<(), TqdbError> {
        if id == 0 {
            return Err(TqdbError::InvalidArg("id must be non-zero".into()));
        }
        let data = payload.unwrap_or(&[]);
        let data_len = data.len() as u32;
        let entry_crc = entry_crc(op as u8, type_index, id, data_len, data);

        let start = self.file.seek(SeekFrom::End(0))?;
        let result: std::io::Result<()> = (|| {
            self.file.write_all(&entry_crc.to_le_bytes())?;
            self.file.write_all(&[op as u8])?;
            self.file.write_all(&[type_index])?;
            self.file.write_all(&id.to_le_bytes())?;
            self.file.write_all(&data_len.to_le_bytes())?;
            self.file.write_all(data)?;
            Ok(())
        })();

        if let Err(e) = result {
            self.file.set_len(start)?;
            return Err(TqdbError::Io(e));
        }

        self.entry_count += 1;
        self.size = self.file.metadata()?.len();
        self.file.seek(SeekFrom::Start(12))?;
        self.file.write_all(&self.entry_count.to_le_bytes())?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Read one entry at the current file position, verifying its CRC.
    /// Returns `Ok(None)` on a short read or a CRC mismatch — either one
    /// marks the effective end of a valid WAL tail.
    fn read_entry_raw(&mut self) -> Result<Option<(u8, u32, WalOp, Vec<u8>)>, TqdbError> {
        let mut hdr = [0u8; 14];
        if self.file.read_exact(&mut hdr).is_err() {
            return Ok(None);
        }
        let entry_crc_stored = u32::from_le_bytes(hdr[0..4].try_into().unwrap());
        let op_byte = hdr[4];
        let type_index = hdr[5];
        let id = u32::from_le_bytes(hdr[6..10].try_into().unwrap());
        let data_len = u32::from_le_bytes(hdr[10..14].try_into().unwrap());

        let op = match WalOp::from_u8(op_byte) {
            Some(op) => op,
            None => {
                warn!(op_byte, "unrecognized WAL op, truncating replay here");
                return Ok(None);
            }
        };

        let mut data = vec![0u8; data_len as usize];
        if self.file.read_exact(&mut data).is_err() {
            return Ok(None);
        }

        if entry_crc(op_byte, type_index, id, data_len, &data) != entry_crc_stored {
            warn!(type_index, id, "WAL entry CRC mismatch, truncating replay here");
            return Ok(None);
        }

        Ok(Some((type_index, id, op, data)))
    }

    /// Linear scan for the last entry matching `(type_index, id)`.
    pub fn find(&mut self, registry: &Registry, type_index: u8, id: u32) -> Result<WalLookup, TqdbError> {
        self.file.seek(SeekFrom::Start(WAL_HEADER_SIZE))?;
        let mut last: Option<(WalOp, Vec<u8>)> = None;
        for _ in 0..self.entry_count {
            match self.read_entry_raw()? {
                Some((e_type, e_id, op, data)) => {
                    if e_type == type_index && e_id == id {
                        last = Some((op, data));
                    }
                }
                None => break,
            }
        }
        match last {
            None => Ok(WalLookup::Absent),
            Some((WalOp::Delete, _)) => Ok(WalLookup::Deleted),
            Some((op, data)) => {
                let mut cursor = &data[..];
                let mut reader = FramedReader::new(&mut cursor);
                let boxed = registry.get(type_index as usize).read(&mut reader)?;
                Ok(WalLookup::Found(boxed, op))
            }
        }
    }

    /// Net change to `type_index`'s count implied by the WAL: +1 per
    /// distinct id whose last operation is ADD, -1 per distinct id whose
    /// last operation is DELETE, 0 for UPDATE. Does not deserialize
    /// payloads, so it tolerates entries for types with no registered
    /// trait yet.
    pub fn count_delta(&mut self, type_index: u8) -> Result<i64, TqdbError> {
        self.file.seek(SeekFrom::Start(WAL_HEADER_SIZE))?;
        let mut last_op: std::collections::HashMap<u32, WalOp> = std::collections::HashMap::new();
        for _ in 0..self.entry_count {
            match self.read_entry_raw()? {
                Some((e_type, e_id, op, _data)) => {
                    if e_type == type_index {
                        last_op.insert(e_id, op);
                    }
                }
                None => break,
            }
        }
        let mut delta = 0i64;
        for op in last_op.values() {
            match op {
                WalOp::Add => delta += 1,
                WalOp::Delete => delta -= 1,
                WalOp::Update => {}
            }
        }
        Ok(delta)
    }

    /// Read every valid entry, deserialize ADD/UPDATE payloads, and
    /// deduplicate by `(type_index, id)` keeping the last occurrence.
    /// An entry whose payload fails to deserialize is dropped entirely so
    /// it cannot shadow an earlier valid operation on the same key.
    pub fn replay_all(&mut self, registry: &Registry) -> Result<Vec<ReplayEntry>, TqdbError> {
        self.file.seek(SeekFrom::Start(WAL_HEADER_SIZE))?;
        let mut ordered = Vec::new();
        for _ in 0..self.entry_count {
            let Some((type_index, id, op, data)) = self.read_entry_raw()? else {
                break;
            };
            if type_index as usize >= registry.len() {
                warn!(type_index, "WAL entry references unregistered type, skipping");
                continue;
            }
            let payload = if op == WalOp::Delete {
                None
            } else {
                let mut cursor = &data[..];
                let mut reader = FramedReader::new(&mut cursor);
                match registry.get(type_index as usize).read(&mut reader) {
                    Ok(boxed) => Some(boxed),
                    Err(e) => {
                        warn!(type_index, id, %e, "dropping WAL entry with undeserializable payload");
                        continue;
                    }
                }
            };
            ordered.push(ReplayEntry {
                type_index: type_index as usize,
                id,
                op,
                payload,
            });
        }

        let mut position_of: std::collections::HashMap<(usize, u32), usize> = std::collections::HashMap::new();
        let mut deduped: Vec<ReplayEntry> = Vec::new();
        for entry in ordered {
            let key = (entry.type_index, entry.id);
            if let Some(&pos) = position_of.get(&key) {
                deduped[pos] = entry;
            } else {
                position_of.insert(key, deduped.len());
                deduped.push(entry);
            }
        }
        Ok(deduped)
    }

    /// Truncate back to header-only and install a fresh `db_crc` snapshot.
    pub fn reset(&mut self, new_db_crc: u32) -> Result<(), TqdbError> {
        self.file.set_len(WAL_HEADER_SIZE)?;
        self.file.seek(SeekFrom::Start(0))?;
        write_header(&mut self.file, new_db_crc, 0)?;
        self.file.sync_all()?;
        self.entry_count = 0;
        self.size = WAL_HEADER_SIZE;
        self.db_crc = new_db_crc;
        self.recovery_pending = false;
        Ok(())
    }
}

fn write_header(file: &mut File, db_crc: u32, entry_count: u32) -> Result<(), TqdbError> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&WAL_MAGIC.to_le_bytes())?;
    file.write_all(&WAL_VERSION.to_le_bytes())?;
    file.write_all(&0u16.to_le_bytes())?; // flags
    file.write_all(&db_crc.to_le_bytes())?;
    file.write_all(&entry_count.to_le_bytes())?;
    Ok(())
}

fn entry_crc(op: u8, type_index: u8, id: u32, data_len: u32, data: &[u8]) -> u32 {
    let mut crc = Crc32::new();
    crc.update(&[op]);
    crc.update(&[type_index]);
    crc.update(&id.to_le_bytes());
    crc.update(&data_len.to_le_bytes());
    crc.update(data);
    crc.finalize()
}
