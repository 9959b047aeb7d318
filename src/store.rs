//! Main-file manager: header layout, atomic swap protocol, and the single
//! streaming rewrite routine that implements every durable mutation.

use std::any::Any;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::crc::crc32_of;
use crate::error::TqdbError;
use crate::io::{FramedReader, FramedWriter};
use crate::registry::{Entity, Registry};

pub const MAGIC: u32 = 0x4244_5154;
pub const VERSION: u16 = 1;
pub const HEADER_SIZE: u64 = 16;

/// Filter/modify predicates and the single add/update/delete target,
/// describing exactly one durable mutation against exactly one registered
/// type. Any field may be left empty; `vacuum` leaves all of them empty.
pub struct MutationDescriptor<'a, T> {
    pub type_index: usize,
    pub add: Option<&'a T>,
    pub delete_id: Option<u32>,
    pub update: Option<(u32, &'a T)>,
    /// Returns `true` to keep the record, `false` to drop it.
    pub filter: Option<Box<dyn Fn(&T) -> bool + 'a>>,
    pub modify: Option<(Option<Box<dyn Fn(&T) -> bool + 'a>>, Box<dyn FnMut(&mut T) + 'a>)>,
}

impl<'a, T> MutationDescriptor<'a, T> {
    pub fn empty(type_index: usize) -> Self {
        Self {
            type_index,
            add: None,
            delete_id: None,
            update: None,
            filter: None,
            modify: None,
        }
    }
}

/// Result of a completed streaming rewrite.
#[derive(Debug, Default)]
pub struct RewriteOutcome {
    /// The id assigned to `add`'s entity, if the descriptor carried one.
    pub added_id: Option<u32>,
    /// Final on-disk count for the mutated type.
    pub final_count: u32,
    /// Number of records the `modify` mutator actually touched.
    pub modified_count: usize,
    /// Number of records dropped by `delete`/`filter`.
    pub deleted_count: usize,
}

/// An opened, header-validated main file positioned right after the
/// 16-byte header, ready for `read_counts`.
pub struct OpenMain {
    file: File,
    crc: u32,
}

impl OpenMain {
    /// The CRC recorded in the header at open time (offset 8).
    pub fn header_crc(&self) -> u32 {
        self.crc
    }

    pub fn read_counts(&mut self, registry: &Registry) -> Result<Vec<u32>, TqdbError> {
        let mut counts = Vec::with_capacity(registry.len());
        for idx in 0..registry.len() {
            let mut buf = [0u8; 4];
            self.file.read_exact(&mut buf).map_err(|e| {
                TqdbError::Corrupt(format!("truncated count section: {e}"))
            })?;
            let raw = u32::from_le_bytes(buf);
            let max_count = registry.get(idx).max_count() as u32;
            if raw > max_count {
                warn!(type_index = idx, raw, max_count, "count exceeds declared max, treating as zero");
                counts.push(0);
            } else {
                counts.push(raw);
            }
        }
        Ok(counts)
    }

    /// Skip past `count` records of `type_index`, using the trait's `skip`
    /// when available.
    pub fn skip_section(&mut self, registry: &Registry, type_index: usize, count: u32) -> Result<(), TqdbError> {
        let descriptor = registry.get(type_index);
        for _ in 0..count {
            let mut reader = FramedReader::new(&mut self.file);
            descriptor.skip(&mut reader)?;
        }
        Ok(())
    }

    /// Read the next record of `type_index` without advancing past it in
    /// any way other than consuming its bytes.
    pub fn read_one(&mut self, registry: &Registry, type_index: usize) -> Result<Box<dyn Any + Send + Sync>, TqdbError> {
        let mut reader = FramedReader::new(&mut self.file);
        registry.get(type_index).read(&mut reader)
    }
}

pub struct MainFile {
    pub main_path: PathBuf,
    pub tmp_path: PathBuf,
    pub bak_path: PathBuf,
}

impl MainFile {
    pub fn new(main_path: PathBuf, tmp_path: PathBuf, bak_path: PathBuf) -> Self {
        Self {
            main_path,
            tmp_path,
            bak_path,
        }
    }

    /// Promote a stale `.tmp`/`.bak` sibling if the main file is missing,
    /// then validate the header. Returns `Ok(None)` if no file exists at
    /// all (legal — reads against an absent database are empty).
    pub fn open_for_read(&self) -> Result<Option<OpenMain>, TqdbError> {
        let mut promoted = false;
        if !self.main_path.exists() {
            if self.tmp_path.exists() {
                info!(path = %self.tmp_path.display(), "promoting stale .tmp after crash");
                fs::rename(&self.tmp_path, &self.main_path)?;
                promoted = true;
            } else if self.bak_path.exists() {
                info!(path = %self.bak_path.display(), "promoting stale .bak after crash");
                fs::rename(&self.bak_path, &self.main_path)?;
                promoted = true;
            } else {
                return Ok(None);
            }
        }

        let mut file = File::open(&self.main_path)?;

        if !promoted && self.tmp_path.exists() {
            warn!(path = %self.tmp_path.display(), "discarding stale .tmp left behind by an interrupted rewrite");
            let _ = fs::remove_file(&self.tmp_path);
        }

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)
            .map_err(|e| TqdbError::Corrupt(format!("short header: {e}")))?;
        let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let version = u16::from_le_bytes(header[4..6].try_into().unwrap());
        if magic != MAGIC {
            return Err(TqdbError::Corrupt(format!("bad magic: {magic:#x}")));
        }
        if version > VERSION {
            return Err(TqdbError::Corrupt(format!("unsupported version: {version}")));
        }
        let crc = u32::from_le_bytes(header[8..12].try_into().unwrap());

        Ok(Some(OpenMain { file, crc }))
    }

    /// The main file's header CRC, or 0 if the file (and its `.tmp`/`.bak`
    /// siblings) don't exist at all — used as the WAL's `db_crc` snapshot
    /// at (re)initialization.
    pub fn header_crc(&self) -> Result<u32, TqdbError> {
        match self.open_for_read()? {
            Some(open) => Ok(open.header_crc()),
            None => Ok(0),
        }
    }

    /// The single durable-mutation engine. Every public CRUD/batch
    /// operation builds one [`MutationDescriptor`] targeting its type and
    /// calls this.
    pub fn rewrite<T: Entity>(
        &self,
        registry: &Registry,
        mut desc: MutationDescriptor<'_, T>,
    ) -> Result<RewriteOutcome, TqdbError> {
        let target = desc.type_index;

        let source = self.open_for_read()?;
        let tmp_file = File::create(&self.tmp_path).map_err(TqdbError::Io)?;
        let mut writer = BufWriter::new(tmp_file);

        // Step 3: header placeholder.
        writer.write_all(&[0u8; HEADER_SIZE as usize])?;

        // Steps 4-6: source counts, provisional counts.
        let mut source = source;
        let source_counts = match source.as_mut() {
            Some(open) => open.read_counts(registry)?,
            None => vec![0u32; registry.len()],
        };

        let mut provisional = source_counts.clone();
        if desc.add.is_some() {
            provisional[target] += 1;
        }
        if desc.delete_id.is_some() {
            provisional[target] = provisional[target].saturating_sub(1);
        }

        let counts_offset = HEADER_SIZE;
        {
            let mut framed = FramedWriter::new(&mut writer);
            for count in &provisional {
                framed.write_u32(*count)?;
            }
        }

        let mut actual_counts = source_counts.clone();
        let mut outcome = RewriteOutcome::default();

        for type_index in 0..registry.len() {
            let count = source_counts[type_index];
            if type_index == target {
                for _ in 0..count {
                    let raw = source.as_mut().unwrap().read_one(registry, type_index)?;
                    let mut record = *raw
                        .downcast::<T>()
                        .expect("entity type mismatch for target type");
                    let id = registry.get(target).get_id(&record);

                    if desc.delete_id == Some(id) {
                        actual_counts[target] = actual_counts[target].saturating_sub(1);
                        outcome.deleted_count += 1;
                        continue;
                    }
                    if let Some(filter) = &desc.filter {
                        if !filter(&record) {
                            actual_counts[target] = actual_counts[target].saturating_sub(1);
                            outcome.deleted_count += 1;
                            continue;
                        }
                        let mut framed = FramedWriter::new(&mut writer);
                        registry.get(target).write(&mut framed, &record as &dyn Any)?;
                        continue;
                    }
                    if let Some((update_id, replacement)) = desc.update {
                        if update_id == id {
                            let mut framed = FramedWriter::new(&mut writer);
                            registry.get(target).write(&mut framed, replacement as &dyn Any)?;
                            continue;
                        }
                    }
                    if let Some((predicate, mutator)) = &mut desc.modify {
                        let matches = predicate.as_ref().map(|p| p(&record)).unwrap_or(true);
                        if matches {
                            mutator(&mut record);
                            outcome.modified_count += 1;
                        }
                    }
                    let mut framed = FramedWriter::new(&mut writer);
                    registry.get(target).write(&mut framed, &record as &dyn Any)?;
                }

                if let Some(entity) = desc.add {
                    let id = registry.get(target).get_id(entity);
                    outcome.added_id = Some(id);
                    actual_counts[target] += 1;
                    let mut framed = FramedWriter::new(&mut writer);
                    registry.get(target).write(&mut framed, entity as &dyn Any)?;
                }
            } else {
                for _ in 0..count {
                    let raw = source.as_mut().unwrap().read_one(registry, type_index)?;
                    let mut framed = FramedWriter::new(&mut writer);
                    registry.get(type_index).write(&mut framed, raw.as_ref())?;
                }
            }
        }

        self.finalize_tmp(writer, counts_offset, &actual_counts, &provisional)?;

        outcome.final_count = actual_counts[target];
        Ok(outcome)
    }

    /// Folds deduplicated WAL replay entries across every registered type
    /// into one streaming rewrite, mirroring `rewrite` but driven by an
    /// erased replay vector instead of a single typed mutation.
    pub fn checkpoint_merge(
        &self,
        registry: &Registry,
        replay: Vec<crate::wal::ReplayEntry>,
    ) -> Result<(), TqdbError> {
        use crate::wal::WalOp;
        use std::collections::HashMap;

        let source = self.open_for_read()?;
        let tmp_file = File::create(&self.tmp_path).map_err(TqdbError::Io)?;
        let mut writer = BufWriter::new(tmp_file);
        writer.write_all(&[0u8; HEADER_SIZE as usize])?;

        let mut source = source;
        let source_counts = match source.as_mut() {
            Some(open) => open.read_counts(registry)?,
            None => vec![0u32; registry.len()],
        };

        let mut index: HashMap<(usize, u32), usize> = HashMap::new();
        for (i, entry) in replay.iter().enumerate() {
            index.insert((entry.type_index, entry.id), i);
        }
        let mut consumed = vec![false; replay.len()];

        let mut provisional = source_counts.clone();
        for entry in &replay {
            match entry.op {
                WalOp::Add => provisional[entry.type_index] += 1,
                WalOp::Delete => {
                    provisional[entry.type_index] = provisional[entry.type_index].saturating_sub(1)
                }
                WalOp::Update => {}
            }
        }

        let counts_offset = HEADER_SIZE;
        {
            let mut framed = FramedWriter::new(&mut writer);
            for count in &provisional {
                framed.write_u32(*count)?;
            }
        }

        let mut actual_counts = source_counts.clone();

        for type_index in 0..registry.len() {
            let count = source_counts[type_index];
            for _ in 0..count {
                let raw = source.as_mut().unwrap().read_one(registry, type_index)?;
                let id = registry.get(type_index).get_id(raw.as_ref());

                if let Some(&pos) = index.get(&(type_index, id)) {
                    match replay[pos].op {
                        WalOp::Delete => {
                            actual_counts[type_index] = actual_counts[type_index].saturating_sub(1);
                            consumed[pos] = true;
                            continue;
                        }
                        WalOp::Update => {
                            consumed[pos] = true;
                            if let Some(payload) = &replay[pos].payload {
                                let mut framed = FramedWriter::new(&mut writer);
                                registry.get(type_index).write(&mut framed, payload.as_ref())?;
                            }
                            continue;
                        }
                        WalOp::Add => {
                            // ids are unique; an ADD never matches an existing source record.
                        }
                    }
                }

                let mut framed = FramedWriter::new(&mut writer);
                registry.get(type_index).write(&mut framed, raw.as_ref())?;
            }

            for (pos, entry) in replay.iter().enumerate() {
                if entry.type_index == type_index && entry.op == WalOp::Add && !consumed[pos] {
                    consumed[pos] = true;
                    if let Some(payload) = &entry.payload {
                        actual_counts[type_index] += 1;
                        let mut framed = FramedWriter::new(&mut writer);
                        registry.get(type_index).write(&mut framed, payload.as_ref())?;
                    }
                }
            }
        }

        self.finalize_tmp(writer, counts_offset, &actual_counts, &provisional)?;
        Ok(())
    }

    /// Shared tail of both rewrite paths: flush, fix up counts if they
    /// diverged from the provisional values, recompute the header CRC from
    /// the final on-disk bytes, and perform the atomic swap.
    fn finalize_tmp(
        &self,
        mut writer: BufWriter<File>,
        counts_offset: u64,
        actual_counts: &[u32],
        provisional: &[u32],
    ) -> Result<(), TqdbError> {
        writer.flush()?;
        let mut file = writer.into_inner().map_err(|e| TqdbError::Io(e.into_error()))?;

        // Step 9: patch counts if any diverged from provisional.
        if actual_counts != provisional {
            debug!(?actual_counts, ?provisional, "fixing up counts after rewrite");
            file.seek(SeekFrom::Start(counts_offset))?;
            for count in actual_counts {
                file.write_all(&count.to_le_bytes())?;
            }
        }

        // Step 10, resolved per the preferred fix: recompute the CRC from
        // the final on-disk bytes rather than trusting the running seed
        // that covered the (possibly stale) provisional counts.
        file.flush()?;
        file.seek(SeekFrom::Start(HEADER_SIZE))?;
        let mut payload = Vec::new();
        file.read_to_end(&mut payload)?;
        let crc = crc32_of(&payload);

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&MAGIC.to_le_bytes())?;
        file.write_all(&VERSION.to_le_bytes())?;
        file.write_all(&0u16.to_le_bytes())?; // flags
        file.write_all(&crc.to_le_bytes())?;
        file.write_all(&0u32.to_le_bytes())?; // reserved
        file.sync_all()?;
        drop(file);

        self.atomic_swap()
    }

    /// `remove(.bak); rename(main -> .bak); rename(.tmp -> main); remove(.bak)`.
    fn atomic_swap(&self) -> Result<(), TqdbError> {
        let _ = fs::remove_file(&self.bak_path);

        if self.main_path.exists() {
            fs::rename(&self.main_path, &self.bak_path)?;
        }

        if let Err(e) = fs::rename(&self.tmp_path, &self.main_path) {
            // Undo the first rename so open-for-read still finds a main file.
            if self.bak_path.exists() {
                let _ = fs::rename(&self.bak_path, &self.main_path);
            }
            return Err(TqdbError::Io(e));
        }

        let _ = fs::remove_file(&self.bak_path);
        Ok(())
    }
}

pub fn sibling_path(db_path: &Path, extension: &str) -> PathBuf {
    let mut os = db_path.as_os_str().to_owned();
    os.push(extension);
    PathBuf::from(os)
}
