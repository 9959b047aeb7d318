//! # TQDB
//!
//! An embedded, file-backed, trait-driven record store for small-to-medium
//! typed entity collections. Applications register entity types by
//! supplying serialization and identity callbacks through a
//! [`TraitDescriptor`]; the store then provides durable
//! add/get/update/delete/iterate operations with crash-safe atomic
//! rewrites and an optional write-ahead log.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                      Tqdb handle                      │
//! │  ┌────────────┐  ┌──────────────┐  ┌─────────────┐   │
//! │  │   Cache     │  │      WAL      │  │  Main file  │   │
//! │  │ (optional)  │  │  (optional)   │  │  (on disk)  │   │
//! │  └─────┬───────┘  └──────┬───────┘  └──────┬──────┘   │
//! │        │ hit/miss        │ append          │ stream   │
//! │        └─────────►       └────────►        │ rewrite  │
//! │                                             │          │
//! │  ┌──────────────────────────────────────────┘          │
//! │  │  Checkpoint-merge (WAL → streaming rewrite)          │
//! │  └───────────────────────────────────────────────────┘ │
//! │                                                        │
//! │  ┌──────────────────────────────────────────────────┐  │
//! │  │         Type registry (name → trait, index)       │  │
//! │  └──────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`crc`] | Rolling IEEE-802.3 CRC32 used by every persistent component |
//! | [`io`] | Framed reader/writer with a running CRC and sticky error flag |
//! | [`registry`] | Fixed-capacity type registry, stable type indices |
//! | [`store`] | Main-file header, atomic swap, and the streaming rewrite engine |
//! | [`wal`] | Write-ahead log: append, recovery, checkpoint-merge |
//! | [`cache`] | Bounded LRU cache of recently touched entities |
//!
//! ## Key properties
//!
//! - **Atomic rewrites** — every durable mutation either leaves the main
//!   file untouched or fully reflects the new state; no torn writes are
//!   ever observable through a later open.
//! - **Optional write-ahead log** — single-record mutations append instead
//!   of paying for a full rewrite, with auto-checkpoint thresholds and
//!   deferred recovery (replay waits for the caller to re-register traits).
//! - **Single coarse lock** — a pluggable [`Lock`] serializes every public
//!   operation; the default is a single-threaded no-op.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use tqdb::{Tqdb, TqdbConfig, TraitDescriptor};
//!
//! #[derive(Clone)]
//! struct User { id: u32, name: String }
//!
//! let config = TqdbConfig {
//!     db_path: "/tmp/users.tqdb".into(),
//!     enable_wal: true,
//!     ..TqdbConfig::default()
//! };
//! let db = Tqdb::open(config).unwrap();
//! db.register(TraitDescriptor {
//!     name: "User",
//!     max_count: 10_000,
//!     write: |w, u: &User| { w.write_u32(u.id)?; w.write_str(&u.name) },
//!     read: |r| Ok(User { id: r.read_u32()?, name: r.read_str()? }),
//!     get_id: |u| u.id,
//!     set_id: |u, id| u.id = id,
//!     skip: None,
//! }).unwrap();
//!
//! let mut user = User { id: 0, name: "ada".into() };
//! let id = db.add(&mut user).unwrap();
//! assert_eq!(db.get::<User>(id).unwrap().name, "ada");
//! ```

#![allow(dead_code)]

pub mod cache;
pub mod crc;
pub mod error;
pub mod io;
pub mod lock;
pub mod registry;
pub mod store;
pub mod wal;

use std::any::Any;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

pub use cache::{Cache, CacheOp, CacheStats};
pub use error::TqdbError;
pub use io::{FramedReader, FramedWriter};
pub use lock::{Lock, NoopLock};
pub use registry::{Entity, ErasedTrait, Registry, TraitDescriptor};
pub use store::{sibling_path, MainFile, MutationDescriptor};
pub use wal::{Wal, WalLookup, WalOp, WalStats};

/// Default lock acquisition timeout, matching the reference implementation.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for a [`Tqdb`] handle. Only `db_path` is required; every
/// other field has the documented default.
pub struct TqdbConfig {
    /// Path to the main database file. Required.
    pub db_path: PathBuf,
    /// Temporary file used mid-rewrite. Defaults to `{db_path}.tmp`.
    pub tmp_path: Option<PathBuf>,
    /// Backup file used mid-swap. Defaults to `{db_path}.bak`.
    pub bak_path: Option<PathBuf>,
    /// Coarse lock serializing every public operation. Defaults to
    /// [`NoopLock`], appropriate for single-threaded embedders.
    pub lock: Option<Arc<dyn Lock>>,
    /// How long to wait to acquire `lock` before returning `TIMEOUT`.
    pub lock_timeout: Duration,
    /// Whether the write-ahead log is active. Also auto-activated if
    /// `wal_path` is supplied.
    pub enable_wal: bool,
    /// Path to the WAL file. Defaults to `{db_path}.wal`.
    pub wal_path: Option<PathBuf>,
    /// Auto-checkpoint once the WAL holds this many entries.
    pub wal_max_entries: usize,
    /// Auto-checkpoint once the WAL file reaches this many bytes.
    pub wal_max_size: usize,
    /// Whether the bounded LRU cache is active. Disabled by default.
    pub enable_cache: bool,
    /// Cache capacity, in entries.
    pub cache_size: usize,
}

impl Default for TqdbConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::new(),
            tmp_path: None,
            bak_path: None,
            lock: None,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            enable_wal: false,
            wal_path: None,
            wal_max_entries: 100,
            wal_max_size: 65_536,
            enable_cache: false,
            cache_size: 16,
        }
    }
}

/// One connection to a TQDB database. Wraps the registry, main-file
/// manager, optional WAL, and optional cache behind a single coarse
/// [`Lock`] plus a [`Mutex`] guarding the shared state.
///
/// Two handles pointed at the same path will corrupt each other — this is
/// a single-writer, single-process engine, matching the reference design's
/// explicit non-goal of multi-process concurrency.
pub struct Tqdb {
    lock: Arc<dyn Lock>,
    lock_timeout: Duration,
    inner: Mutex<TqdbInner>,
}

struct TqdbInner {
    registry: Registry,
    main_file: MainFile,
    wal: Option<Wal>,
    cache: Option<Cache>,
    wal_max_entries: usize,
    wal_max_size: usize,
}

/// A lock held for the duration of one public `Tqdb` call; released on
/// drop regardless of how the call returns.
struct LockGuard<'a> {
    lock: &'a dyn Lock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl Tqdb {
    /// Open (or lazily prepare to create) a database at `config.db_path`.
    /// The main file itself is created lazily on the first mutation; an
    /// absent file is not an error.
    pub fn open(config: TqdbConfig) -> Result<Self, TqdbError> {
        if config.db_path.as_os_str().is_empty() {
            return Err(TqdbError::InvalidArg("db_path must not be empty".into()));
        }

        let tmp_path = config
            .tmp_path
            .clone()
            .unwrap_or_else(|| sibling_path(&config.db_path, ".tmp"));
        let bak_path = config
            .bak_path
            .clone()
            .unwrap_or_else(|| sibling_path(&config.db_path, ".bak"));
        let main_file = MainFile::new(config.db_path.clone(), tmp_path, bak_path);

        let wal = if config.enable_wal || config.wal_path.is_some() {
            let wal_path = config
                .wal_path
                .clone()
                .unwrap_or_else(|| sibling_path(&config.db_path, ".wal"));
            let db_crc = main_file.header_crc()?;
            info!(path = %wal_path.display(), "opening write-ahead log");
            Some(Wal::open(wal_path, db_crc)?)
        } else {
            None
        };

        let cache = if config.enable_cache {
            Some(Cache::new(config.cache_size))
        } else {
            None
        };

        let lock: Arc<dyn Lock> = config.lock.clone().unwrap_or_else(|| Arc::new(NoopLock));

        Ok(Self {
            lock,
            lock_timeout: config.lock_timeout,
            inner: Mutex::new(TqdbInner {
                registry: Registry::new(),
                main_file,
                wal,
                cache,
                wal_max_entries: config.wal_max_entries,
                wal_max_size: config.wal_max_size,
            }),
        })
    }

    fn acquire_lock(&self) -> Result<LockGuard<'_>, TqdbError> {
        if self.lock.acquire(self.lock_timeout) {
            Ok(LockGuard {
                lock: self.lock.as_ref(),
            })
        } else {
            Err(TqdbError::Timeout)
        }
    }

    fn lock_inner(&self) -> Result<std::sync::MutexGuard<'_, TqdbInner>, TqdbError> {
        self.inner
            .lock()
            .map_err(|_| TqdbError::Io(std::io::Error::other("tqdb mutex poisoned")))
    }

    /// Register a new entity type. Must be called before any `add`/`get`/
    /// etc. call for `T`. Indices are assigned in registration order and
    /// never reordered, since WAL records on disk embed them.
    pub fn register<T: Entity>(&self, descriptor: TraitDescriptor<T>) -> Result<(), TqdbError> {
        let _guard = self.acquire_lock()?;
        let mut inner = self.lock_inner()?;
        inner.registry.register(descriptor)?;
        inner.check_recovery()?;
        Ok(())
    }

    /// Insert `entity`, assigning it an id in place if its current id is
    /// zero (auto-increment), or honoring a caller-supplied non-zero id
    /// otherwise.
    pub fn add<T: Entity>(&self, entity: &mut T) -> Result<u32, TqdbError> {
        let _guard = self.acquire_lock()?;
        let mut inner = self.lock_inner()?;
        inner.check_recovery()?;
        let idx = inner.resolve_index::<T>()?;

        let current_id = inner.registry.get(idx).get_id(entity);
        let id = if current_id == 0 {
            inner.registry.next_id(idx)
        } else {
            inner.registry.observe_id(idx, current_id);
            current_id
        };
        inner.registry.get(idx).set_id(entity, id);

        if inner.wal.is_some() {
            let payload = serialize_entity(&inner.registry, idx, entity)?;
            let wal = inner.wal.as_mut().unwrap();
            wal.append(idx as u8, id, WalOp::Add, Some(&payload))?;
            inner.maybe_checkpoint()?;
        } else {
            let mut desc: MutationDescriptor<T> = MutationDescriptor::empty(idx);
            desc.add = Some(&*entity);
            inner.main_file.rewrite(&inner.registry, desc)?;
        }

        if let Some(cache) = &mut inner.cache {
            cache.put(idx as u8, id, Some(Box::new(entity.clone())), CacheOp::Add);
        }
        Ok(id)
    }

    /// Fetch the entity of type `T` with identifier `id`.
    pub fn get<T: Entity>(&self, id: u32) -> Result<T, TqdbError> {
        if id == 0 {
            return Err(TqdbError::InvalidArg("id must be non-zero".into()));
        }
        let _guard = self.acquire_lock()?;
        let mut inner = self.lock_inner()?;
        inner.check_recovery()?;
        let idx = inner.resolve_index::<T>()?;

        if let Some(cache) = &mut inner.cache {
            match cache.get(idx as u8, id) {
                cache::CacheLookup::Positive(entity) => {
                    let typed = entity
                        .downcast_ref::<T>()
                        .expect("cache entry type mismatch");
                    return Ok(typed.clone());
                }
                cache::CacheLookup::Negative => return Err(TqdbError::NotFound),
                cache::CacheLookup::Miss => {}
            }
        }

        if let Some(entry_count) = inner.wal.as_ref().map(Wal::entry_count) {
            if entry_count > 0 {
                let registry = &inner.registry;
                let lookup = inner.wal.as_mut().unwrap().find(registry, idx as u8, id)?;
                match lookup {
                    WalLookup::Found(boxed, op) => {
                        let typed = boxed
                            .downcast_ref::<T>()
                            .expect("wal payload type mismatch")
                            .clone();
                        let cache_op = match op {
                            WalOp::Add => CacheOp::Add,
                            _ => CacheOp::Update,
                        };
                        if let Some(cache) = &mut inner.cache {
                            cache.put(idx as u8, id, Some(Box::new(typed.clone())), cache_op);
                        }
                        return Ok(typed);
                    }
                    WalLookup::Deleted => {
                        if let Some(cache) = &mut inner.cache {
                            cache.put(idx as u8, id, None, CacheOp::Delete);
                        }
                        return Err(TqdbError::NotFound);
                    }
                    WalLookup::Absent => {}
                }
            }
        }

        match inner.scan_main_file::<T>(idx, id)? {
            Some(record) => {
                if let Some(cache) = &mut inner.cache {
                    cache.put(idx as u8, id, Some(Box::new(record.clone())), CacheOp::Update);
                }
                Ok(record)
            }
            None => Err(TqdbError::NotFound),
        }
    }

    /// Whether an entity of type `T` with identifier `id` is present,
    /// composed across cache, WAL, and main file exactly like [`Tqdb::get`].
    pub fn exists<T: Entity>(&self, id: u32) -> Result<bool, TqdbError> {
        match self.get::<T>(id) {
            Ok(_) => Ok(true),
            Err(TqdbError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Replace the entity of type `T` with identifier `id`. A no-op if no
    /// record with that id exists in the main file or WAL (mirrors the
    /// streaming rewrite's "update target matches by id" semantics — there
    /// is no separate existence probe before the rewrite/append).
    pub fn update<T: Entity>(&self, id: u32, entity: &T) -> Result<(), TqdbError> {
        if id == 0 {
            return Err(TqdbError::InvalidArg("id must be non-zero".into()));
        }
        let _guard = self.acquire_lock()?;
        let mut inner = self.lock_inner()?;
        inner.check_recovery()?;
        let idx = inner.resolve_index::<T>()?;
        inner.registry.observe_id(idx, id);

        if inner.wal.is_some() {
            let payload = serialize_entity(&inner.registry, idx, entity)?;
            let wal = inner.wal.as_mut().unwrap();
            wal.append(idx as u8, id, WalOp::Update, Some(&payload))?;
            inner.maybe_checkpoint()?;
        } else {
            let mut desc: MutationDescriptor<T> = MutationDescriptor::empty(idx);
            desc.update = Some((id, entity));
            inner.main_file.rewrite(&inner.registry, desc)?;
        }

        if let Some(cache) = &mut inner.cache {
            cache.put(idx as u8, id, Some(Box::new(entity.clone())), CacheOp::Update);
        }
        Ok(())
    }

    /// Delete the entity of type `T` with identifier `id`.
    pub fn delete<T: Entity>(&self, id: u32) -> Result<(), TqdbError> {
        if id == 0 {
            return Err(TqdbError::InvalidArg("id must be non-zero".into()));
        }
        let _guard = self.acquire_lock()?;
        let mut inner = self.lock_inner()?;
        inner.check_recovery()?;
        let idx = inner.resolve_index::<T>()?;

        if inner.wal.is_some() {
            let wal = inner.wal.as_mut().unwrap();
            wal.append(idx as u8, id, WalOp::Delete, None)?;
            inner.maybe_checkpoint()?;
        } else {
            let mut desc: MutationDescriptor<T> = MutationDescriptor::empty(idx);
            desc.delete_id = Some(id);
            inner.main_file.rewrite(&inner.registry, desc)?;
        }

        if let Some(cache) = &mut inner.cache {
            cache.put(idx as u8, id, None, CacheOp::Delete);
        }
        Ok(())
    }

    /// Number of live entities of type `T`: the on-disk count plus the net
    /// effect of any pending WAL entries for that type.
    pub fn count<T: Entity>(&self) -> Result<usize, TqdbError> {
        let _guard = self.acquire_lock()?;
        let mut inner = self.lock_inner()?;
        inner.check_recovery()?;
        let idx = inner.resolve_index::<T>()?;

        let on_disk = match inner.main_file.open_for_read()? {
            Some(mut open) => open.read_counts(&inner.registry)?[idx] as i64,
            None => 0,
        };
        let delta = match &mut inner.wal {
            Some(wal) if wal.entry_count() > 0 => wal.count_delta(idx as u8)?,
            _ => 0,
        };
        Ok((on_disk + delta).max(0) as usize)
    }

    /// Visit every live entity of type `T` in main-file order (survivors
    /// and updates), followed by newly WAL-added entities in WAL order.
    /// `f` returns `true` to continue, `false` to stop early.
    pub fn foreach<T: Entity>(&self, mut f: impl FnMut(&T) -> bool) -> Result<(), TqdbError> {
        let _guard = self.acquire_lock()?;
        let mut inner = self.lock_inner()?;
        inner.check_recovery()?;
        let idx = inner.resolve_index::<T>()?;

        let replay: Vec<wal::ReplayEntry> = match &mut inner.wal {
            Some(wal) if wal.entry_count() > 0 => wal
                .replay_all(&inner.registry)?
                .into_iter()
                .filter(|e| e.type_index == idx)
                .collect(),
            _ => Vec::new(),
        };
        let mut pos_by_id: HashMap<u32, usize> = HashMap::new();
        for (i, entry) in replay.iter().enumerate() {
            pos_by_id.insert(entry.id, i);
        }
        let mut consumed = vec![false; replay.len()];

        if let Some(mut open) = inner.main_file.open_for_read()? {
            let counts = open.read_counts(&inner.registry)?;
            for t in 0..idx {
                open.skip_section(&inner.registry, t, counts[t])?;
            }
            for _ in 0..counts[idx] {
                let raw = open.read_one(&inner.registry, idx)?;
                let record = *raw
                    .downcast::<T>()
                    .expect("entity type mismatch for registered trait");
                let id = inner.registry.get(idx).get_id(&record);

                if let Some(&pos) = pos_by_id.get(&id) {
                    consumed[pos] = true;
                    match replay[pos].op {
                        WalOp::Delete => continue,
                        WalOp::Update => {
                            if let Some(payload) = &replay[pos].payload {
                                let typed = payload
                                    .downcast_ref::<T>()
                                    .expect("wal payload type mismatch");
                                if !f(typed) {
                                    return Ok(());
                                }
                            }
                            continue;
                        }
                        WalOp::Add => {
                            // ids are unique on disk; an ADD never matches
                            // an existing source record.
                        }
                    }
                }
                if !f(&record) {
                    return Ok(());
                }
            }
        }

        for (pos, entry) in replay.iter().enumerate() {
            if !consumed[pos] && entry.op == WalOp::Add {
                if let Some(payload) = &entry.payload {
                    let typed = payload
                        .downcast_ref::<T>()
                        .expect("wal payload type mismatch");
                    if !f(typed) {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    /// Mutate every record of type `T` matching `filter` (or every record,
    /// if `filter` is `None`) in place via one streaming rewrite. Any
    /// pending WAL entries for this database are drained first, since the
    /// rewrite reads directly from the main file and has no WAL-aware
    /// fast path of its own.
    pub fn modify_where<T: Entity>(
        &self,
        filter: Option<impl Fn(&T) -> bool>,
        modify: impl FnMut(&mut T),
    ) -> Result<(), TqdbError> {
        let _guard = self.acquire_lock()?;
        let mut inner = self.lock_inner()?;
        inner.check_recovery()?;
        inner.drain_wal_if_pending()?;
        let idx = inner.resolve_index::<T>()?;

        let filter_boxed: Option<Box<dyn Fn(&T) -> bool>> =
            filter.map(|f| Box::new(f) as Box<dyn Fn(&T) -> bool>);
        let mut desc: MutationDescriptor<T> = MutationDescriptor::empty(idx);
        desc.modify = Some((filter_boxed, Box::new(modify)));
        inner.main_file.rewrite(&inner.registry, desc)?;

        if let Some(cache) = &mut inner.cache {
            cache.invalidate_all();
        }
        Ok(())
    }

    /// Delete every record of type `T` matching `filter`. Returns the
    /// number of records removed. Drains any pending WAL first, for the
    /// same reason as [`Tqdb::modify_where`].
    pub fn delete_where<T: Entity>(&self, filter: impl Fn(&T) -> bool) -> Result<usize, TqdbError> {
        let _guard = self.acquire_lock()?;
        let mut inner = self.lock_inner()?;
        inner.check_recovery()?;
        inner.drain_wal_if_pending()?;
        let idx = inner.resolve_index::<T>()?;

        let mut desc: MutationDescriptor<T> = MutationDescriptor::empty(idx);
        desc.filter = Some(Box::new(move |e: &T| !filter(e)));
        let outcome = inner.main_file.rewrite(&inner.registry, desc)?;

        if let Some(cache) = &mut inner.cache {
            cache.invalidate_all();
        }
        Ok(outcome.deleted_count)
    }

    /// Normalize the main file: drain any pending WAL via checkpoint, or
    /// (if the WAL is empty or disabled) run one mutation-free streaming
    /// rewrite. Calling `vacuum` twice in a row with no writes in between
    /// produces byte-identical files.
    pub fn vacuum(&self) -> Result<(), TqdbError> {
        let _guard = self.acquire_lock()?;
        let mut inner = self.lock_inner()?;
        inner.check_recovery()?;
        inner.drain_wal_if_pending()?;
        inner.main_file.checkpoint_merge(&inner.registry, Vec::new())?;
        Ok(())
    }

    /// No-op, reserved: every mutation is already durable by the time its
    /// call returns (WAL append is fsynced, or the streaming rewrite's
    /// atomic swap has completed).
    pub fn flush(&self) -> Result<(), TqdbError> {
        let _guard = self.acquire_lock()?;
        let _inner = self.lock_inner()?;
        Ok(())
    }

    /// Fold the WAL into the main file via one streaming rewrite, then
    /// reset the WAL. A no-op if the WAL is disabled or already empty.
    pub fn checkpoint(&self) -> Result<(), TqdbError> {
        let _guard = self.acquire_lock()?;
        let mut inner = self.lock_inner()?;
        inner.drain_wal_if_pending()?;
        Ok(())
    }

    /// Current WAL entry count and file size, or zeros if the WAL is
    /// disabled.
    pub fn wal_stats(&self) -> Result<WalStats, TqdbError> {
        let _guard = self.acquire_lock()?;
        let inner = self.lock_inner()?;
        Ok(inner
            .wal
            .as_ref()
            .map(Wal::stats)
            .unwrap_or(WalStats { entries: 0, size: 0 }))
    }

    /// Drop every cache entry and reset hit/miss counters.
    pub fn cache_clear(&self) {
        if let Ok(_guard) = self.acquire_lock() {
            if let Ok(mut inner) = self.lock_inner() {
                if let Some(cache) = &mut inner.cache {
                    cache.clear();
                }
            }
        }
    }

    /// Current cache hit/miss counters, or zeros if the cache is disabled.
    pub fn cache_stats(&self) -> CacheStats {
        match (self.acquire_lock(), self.lock_inner()) {
            (Ok(_guard), Ok(inner)) => inner.cache.as_ref().map(Cache::stats).unwrap_or_default(),
            _ => CacheStats::default(),
        }
    }

    /// Consume the handle. Provided for parity with the documented
    /// lifecycle function and to give callers an explicit point to
    /// observe a final error; every mutation is already durable by the
    /// time its own call returned; there is no additional teardown to
    /// perform. Equivalent to letting `self` drop.
    pub fn close(self) -> Result<(), TqdbError> {
        Ok(())
    }
}

impl TqdbInner {
    fn resolve_index<T: Entity>(&self) -> Result<usize, TqdbError> {
        self.registry
            .index_of_type::<T>()
            .ok_or_else(|| TqdbError::NotRegistered(std::any::type_name::<T>().to_string()))
    }

    /// Deferred recovery: replay is postponed until traits are registered,
    /// since payload deserialization needs them. Called from every
    /// data-path entry point.
    fn check_recovery(&mut self) -> Result<(), TqdbError> {
        let pending = self
            .wal
            .as_ref()
            .map(|w| w.recovery_pending && w.entry_count() > 0)
            .unwrap_or(false);
        if pending && !self.registry.is_empty() {
            info!("running deferred WAL recovery via checkpoint");
            self.do_checkpoint()?;
        }
        Ok(())
    }

    fn maybe_checkpoint(&mut self) -> Result<(), TqdbError> {
        let should = self
            .wal
            .as_ref()
            .map(|w| w.should_checkpoint(self.wal_max_entries, self.wal_max_size))
            .unwrap_or(false);
        if should {
            self.do_checkpoint()?;
        }
        Ok(())
    }

    /// Checkpoint if the WAL holds any entries at all; used before batch
    /// rewrites (`vacuum`, `modify_where`, `delete_where`) so they always
    /// see the complete logical state rather than a stale main file with
    /// unmerged WAL entries still pending behind it.
    fn drain_wal_if_pending(&mut self) -> Result<(), TqdbError> {
        let has_entries = self.wal.as_ref().map(|w| w.entry_count() > 0).unwrap_or(false);
        if has_entries {
            self.do_checkpoint()?;
        }
        Ok(())
    }

    fn do_checkpoint(&mut self) -> Result<(), TqdbError> {
        debug!("checkpoint-merge: folding WAL into main file");
        let replay = self
            .wal
            .as_mut()
            .expect("checkpoint requires an open WAL")
            .replay_all(&self.registry)?;
        self.main_file.checkpoint_merge(&self.registry, replay)?;
        let new_crc = self.main_file.header_crc()?;
        self.wal.as_mut().unwrap().reset(new_crc)?;
        if let Some(cache) = &mut self.cache {
            cache.invalidate_all();
        }
        Ok(())
    }

    fn scan_main_file<T: Entity>(&mut self, idx: usize, id: u32) -> Result<Option<T>, TqdbError> {
        let Some(mut open) = self.main_file.open_for_read()? else {
            return Ok(None);
        };
        let counts = open.read_counts(&self.registry)?;
        for t in 0..idx {
            open.skip_section(&self.registry, t, counts[t])?;
        }
        for _ in 0..counts[idx] {
            let raw = open.read_one(&self.registry, idx)?;
            let rid = self.registry.get(idx).get_id(raw.as_ref());
            if rid == id {
                let typed = raw
                    .downcast::<T>()
                    .expect("entity type mismatch for registered trait");
                return Ok(Some(*typed));
            }
        }
        Ok(None)
    }
}

/// Serialize `entity` through the registered trait for `idx`, returning the
/// raw bytes `trait.write` produced. Used by WAL `append`, which needs the
/// payload (and its length) before it can write the entry header.
fn serialize_entity<T: Entity>(
    registry: &Registry,
    idx: usize,
    entity: &T,
) -> Result<Vec<u8>, TqdbError> {
    let mut buf = Vec::new();
    {
        let mut cursor = std::io::Cursor::new(&mut buf);
        let mut writer = FramedWriter::new(&mut cursor);
        registry.get(idx).write(&mut writer, entity as &dyn Any)?;
        writer.flush()?;
    }
    Ok(buf)
}
