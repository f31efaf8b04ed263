//! The `PageStore` capability the WAL subsystem consumes (spec §6).
//!
//! Everything in this module is the seam between the WAL and the rest of a
//! database: the buffer pool's caching policy, the file manager's page I/O,
//! and the catalog that maps table names to page files all live on the
//! other side of this trait and are out of scope for this crate.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, WalError};

/// An opaque page identifier. The WAL never interprets the integers beyond
/// serializing and reconstructing them through a [`PageStore`]; spec §3
/// defines the wire form as a count followed by that many `i32`s.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PageId(pub Vec<i32>);

impl PageId {
    pub fn ints(&self) -> &[i32] {
        &self.0
    }
}

/// An opaque page image: a fixed-size byte array as far as the WAL cares,
/// though this crate does not itself enforce a fixed size since the page
/// size is a `PageStore` concern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page(pub Vec<u8>);

impl Page {
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Reconstructs a page id from its integer vector.
pub type IdFactory = fn(&[i32]) -> PageId;
/// Reconstructs a page from its id and raw bytes.
pub type PageFactory = fn(&PageId, &[u8]) -> Page;

/// A type-tag registry, replacing the reflective class lookup the original
/// system used to recreate page and page-id objects during recovery (spec
/// §9). Each concrete page type registers a stable string tag with a pair
/// of reconstruction closures; the tag is what actually gets written to
/// disk in place of a runtime class name, so log files stay forward
/// compatible as long as tags are not renamed.
#[derive(Default)]
pub struct TypeRegistry {
    factories: HashMap<String, (IdFactory, PageFactory)>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tag: &str, id_factory: IdFactory, page_factory: PageFactory) {
        self.factories
            .insert(tag.to_string(), (id_factory, page_factory));
    }

    pub fn reconstruct_page_id(&self, tag: &str, ints: &[i32]) -> Result<PageId> {
        let (id_factory, _) = self
            .factories
            .get(tag)
            .ok_or_else(|| WalError::CorruptLog(format!("unknown page type tag {tag:?}")))?;
        Ok(id_factory(ints))
    }

    pub fn reconstruct_page(&self, tag: &str, id: &PageId, bytes: &[u8]) -> Result<Page> {
        let (_, page_factory) = self
            .factories
            .get(tag)
            .ok_or_else(|| WalError::CorruptLog(format!("unknown page type tag {tag:?}")))?;
        Ok(page_factory(id, bytes))
    }
}

/// The capability the WAL consumes to load/store pages and to reconstruct
/// page/page-id values read back from the log. Spec §5 requires a global
/// "pool mutex" on the implementor that every WAL operation touching pages
/// (abort, checkpoint, rollback, recovery) must acquire *before* the log
/// mutex, to match the acquisition order the buffer pool uses when it calls
/// back into the WAL for page-eviction logging.
pub trait PageStore {
    fn load_page(&mut self, id: &PageId) -> Result<Page>;
    fn write_page(&mut self, id: &PageId, bytes: &[u8]) -> Result<()>;
    fn discard_cached(&mut self, id: &PageId);
    fn flush_all_dirty(&mut self) -> Result<()>;

    /// The stable type tag for `id`'s concrete page type. Written into both
    /// the `pageClass` and `idClass` slots of an UPDATE record (spec §9's
    /// single-tag simplification).
    fn type_tag(&self, id: &PageId) -> &str;

    fn reconstruct_page_id(&self, tag: &str, ints: &[i32]) -> Result<PageId>;
    fn reconstruct_page(&self, tag: &str, id: &PageId, bytes: &[u8]) -> Result<Page>;

    /// The mutex LogWriter callers must acquire before the log mutex.
    ///
    /// Returned as an owned `Arc` (rather than a borrow tied to `&self`) so
    /// that callers can hold the guard across a later `&mut dyn PageStore`
    /// call without the borrow checker treating the lock and the mutation
    /// as aliasing the same borrow of `self`.
    fn pool_mutex(&self) -> Arc<Mutex<()>>;
}

const SIMPLE_TAG: &str = "simple";

fn simple_id_factory(ints: &[i32]) -> PageId {
    PageId(ints.to_vec())
}

fn simple_page_factory(_id: &PageId, bytes: &[u8]) -> Page {
    Page(bytes.to_vec())
}

fn page_file_name(id: &PageId) -> String {
    let parts: Vec<String> = id.0.iter().map(|i| i.to_string()).collect();
    format!("page-{}.bin", parts.join("_"))
}

/// A directory-backed `PageStore` used by tests, the `wal-inspect` CLI's
/// demo mode, and anywhere else a minimal, honest page store is useful.
/// Every page is one file under `root`; `load_page` caches the last read so
/// that `discard_cached` is observable independently of the backing file.
pub struct SimplePageStore {
    root: PathBuf,
    cache: HashMap<PageId, Vec<u8>>,
    dirty: HashMap<PageId, Vec<u8>>,
    pool_mutex: Arc<Mutex<()>>,
    registry: TypeRegistry,
}

impl SimplePageStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let mut registry = TypeRegistry::new();
        registry.register(SIMPLE_TAG, simple_id_factory, simple_page_factory);
        Ok(SimplePageStore {
            root,
            cache: HashMap::new(),
            dirty: HashMap::new(),
            pool_mutex: Arc::new(Mutex::new(())),
            registry,
        })
    }

    fn path_for(&self, id: &PageId) -> PathBuf {
        self.root.join(page_file_name(id))
    }

    /// Number of pages currently cached in memory (test hook).
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

impl PageStore for SimplePageStore {
    fn load_page(&mut self, id: &PageId) -> Result<Page> {
        if let Some(bytes) = self.cache.get(id) {
            return Ok(Page(bytes.clone()));
        }
        let bytes = fs::read(self.path_for(id))?;
        self.cache.insert(id.clone(), bytes.clone());
        Ok(Page(bytes))
    }

    fn write_page(&mut self, id: &PageId, bytes: &[u8]) -> Result<()> {
        fs::write(self.path_for(id), bytes)?;
        self.cache.insert(id.clone(), bytes.to_vec());
        self.dirty.remove(id);
        Ok(())
    }

    fn discard_cached(&mut self, id: &PageId) {
        self.cache.remove(id);
    }

    fn flush_all_dirty(&mut self) -> Result<()> {
        for (id, bytes) in self.dirty.drain() {
            fs::write(self.root.join(page_file_name(&id)), &bytes)?;
            self.cache.insert(id, bytes);
        }
        Ok(())
    }

    fn type_tag(&self, _id: &PageId) -> &str {
        SIMPLE_TAG
    }

    fn reconstruct_page_id(&self, tag: &str, ints: &[i32]) -> Result<PageId> {
        self.registry.reconstruct_page_id(tag, ints)
    }

    fn reconstruct_page(&self, tag: &str, id: &PageId, bytes: &[u8]) -> Result<Page> {
        self.registry.reconstruct_page(tag, id, bytes)
    }

    fn pool_mutex(&self) -> Arc<Mutex<()>> {
        self.pool_mutex.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SimplePageStore::open(dir.path()).unwrap();
        let id = PageId(vec![7]);
        store.write_page(&id, b"hello").unwrap();
        assert_eq!(store.load_page(&id).unwrap().bytes(), b"hello");
    }

    #[test]
    fn discard_cached_forces_disk_reread() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SimplePageStore::open(dir.path()).unwrap();
        let id = PageId(vec![1]);
        store.write_page(&id, b"AAAA").unwrap();
        assert_eq!(store.cached_len(), 1);
        store.discard_cached(&id);
        assert_eq!(store.cached_len(), 0);
        // The on-disk image is untouched by discard; a fresh load still sees it.
        assert_eq!(store.load_page(&id).unwrap().bytes(), b"AAAA");
    }

    #[test]
    fn type_registry_round_trips_id_and_page() {
        let dir = tempfile::tempdir().unwrap();
        let store = SimplePageStore::open(dir.path()).unwrap();
        let id = store.reconstruct_page_id(SIMPLE_TAG, &[3, 4]).unwrap();
        assert_eq!(id.ints(), &[3, 4]);
        let page = store.reconstruct_page(SIMPLE_TAG, &id, b"xyz").unwrap();
        assert_eq!(page.bytes(), b"xyz");
    }

    #[test]
    fn unknown_type_tag_is_corrupt_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = SimplePageStore::open(dir.path()).unwrap();
        let err = store.reconstruct_page_id("nope", &[1]).unwrap_err();
        assert!(matches!(err, WalError::CorruptLog(_)));
    }
}
