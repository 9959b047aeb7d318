//! Fixed-capacity type registry.
//!
//! Each registered type gets a stable zero-based index — the only form a
//! type is referenced in on disk — and a parallel auto-increment id
//! counter. Capacity is small (default 8) so name lookup is a linear scan.

use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::TqdbError;
use crate::io::{FramedReader, FramedWriter};

/// Maximum number of distinct entity types a single handle can register.
pub const MAX_TYPES: usize = 8;

/// Marker bound for anything storable through the registry.
///
/// `Clone` is required because reads hand back owned values pulled out of
/// the cache or WAL replay buffer, both of which hold their own copy
/// independent of whatever the main-file scan produces.
pub trait Entity: Clone + Send + Sync + 'static {}
impl<T: Clone + Send + Sync + 'static> Entity for T {}

/// Caller-supplied descriptor for one entity type.
///
/// `write`/`read` drive the framed I/O primitives directly; `get_id`/
/// `set_id` give the store access to the entity's identifier without
/// knowing its layout; `skip` lets the store fast-forward past a record
/// during a rewrite without materializing it (falls back to `read` +
/// drop when absent).
pub struct TraitDescriptor<T> {
    pub name: &'static str,
    pub max_count: usize,
    pub write: fn(&mut FramedWriter, &T) -> Result<(), TqdbError>,
    pub read: fn(&mut FramedReader) -> Result<T, TqdbError>,
    pub get_id: fn(&T) -> u32,
    pub set_id: fn(&mut T, u32),
    pub skip: Option<fn(&mut FramedReader) -> Result<(), TqdbError>>,
}

/// Object-safe erasure of [`TraitDescriptor<T>`] so the registry can hold
/// heterogeneous types behind one array.
pub trait ErasedTrait: Send + Sync {
    fn name(&self) -> &'static str;
    fn max_count(&self) -> usize;
    fn write(&self, w: &mut FramedWriter, entity: &dyn Any) -> Result<(), TqdbError>;
    fn read(&self, r: &mut FramedReader) -> Result<Box<dyn Any + Send + Sync>, TqdbError>;
    fn skip(&self, r: &mut FramedReader) -> Result<(), TqdbError>;
    fn get_id(&self, entity: &dyn Any) -> u32;
    fn set_id(&self, entity: &mut dyn Any, id: u32);
}

struct TraitWrapper<T> {
    desc: TraitDescriptor<T>,
}

impl<T: Entity> ErasedTrait for TraitWrapper<T> {
    fn name(&self) -> &'static str {
        self.desc.name
    }

    fn max_count(&self) -> usize {
        self.desc.max_count
    }

    fn write(&self, w: &mut FramedWriter, entity: &dyn Any) -> Result<(), TqdbError> {
        let typed = entity
            .downcast_ref::<T>()
            .expect("entity type mismatch for registered trait");
        (self.desc.write)(w, typed)
    }

    fn read(&self, r: &mut FramedReader) -> Result<Box<dyn Any + Send + Sync>, TqdbError> {
        let entity = (self.desc.read)(r)?;
        Ok(Box::new(entity))
    }

    fn skip(&self, r: &mut FramedReader) -> Result<(), TqdbError> {
        match self.desc.skip {
            Some(skip_fn) => skip_fn(r),
            None => {
                let _ = (self.desc.read)(r)?;
                Ok(())
            }
        }
    }

    fn get_id(&self, entity: &dyn Any) -> u32 {
        let typed = entity
            .downcast_ref::<T>()
            .expect("entity type mismatch for registered trait");
        (self.desc.get_id)(typed)
    }

    fn set_id(&self, entity: &mut dyn Any, id: u32) {
        let typed = entity
            .downcast_mut::<T>()
            .expect("entity type mismatch for registered trait");
        (self.desc.set_id)(typed, id);
    }
}

/// An ordered, bounded sequence of registered traits plus their
/// auto-increment counters.
#[derive(Default)]
pub struct Registry {
    traits: Vec<Box<dyn ErasedTrait>>,
    counters: Vec<AtomicU32>,
    type_ids: Vec<TypeId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new type. Indices are never reused or reordered once
    /// assigned, since WAL records on disk embed them.
    pub fn register<T: Entity>(&mut self, descriptor: TraitDescriptor<T>) -> Result<usize, TqdbError> {
        if self.traits.len() >= MAX_TYPES {
            return Err(TqdbError::Full);
        }
        if self.traits.iter().any(|t| t.name() == descriptor.name) {
            return Err(TqdbError::Exists(descriptor.name.to_string()));
        }
        self.traits.push(Box::new(TraitWrapper { desc: descriptor }));
        self.counters.push(AtomicU32::new(1));
        self.type_ids.push(TypeId::of::<T>());
        Ok(self.traits.len() - 1)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.traits.iter().position(|t| t.name() == name)
    }

    /// Resolve a registered index by Rust type, letting the typed handle
    /// API find its own slot without a string lookup. Distinct from
    /// `index_of`, which remains the name-based lookup used by on-disk
    /// identity.
    pub fn index_of_type<T: Entity>(&self) -> Option<usize> {
        let id = TypeId::of::<T>();
        self.type_ids.iter().position(|t| *t == id)
    }

    pub fn get(&self, index: usize) -> &dyn ErasedTrait {
        self.traits[index].as_ref()
    }

    pub fn len(&self) -> usize {
        self.traits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traits.is_empty()
    }

    /// Assign the next id for `index` and advance the counter past it.
    pub fn next_id(&self, index: usize) -> u32 {
        self.counters[index].fetch_add(1, Ordering::SeqCst)
    }

    /// Ensure the counter for `index` will yield ids strictly greater than
    /// `seen_id` going forward. Used after loading a file or replaying the
    /// WAL, where ids already on disk must not be reissued.
    pub fn observe_id(&self, index: usize, seen_id: u32) {
        let counter = &self.counters[index];
        let mut current = counter.load(Ordering::SeqCst);
        while current <= seen_id {
            match counter.compare_exchange_weak(
                current,
                seen_id + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}
