//! Persistent-memory object store.
//!
//! A *pool* is a single file mapped into the address space. The store hands
//! out direct pointers into the mapping and provides the primitives the file
//! system layer is built on:
//!
//!   + typed, transactional allocation of persistent objects,
//!   + durable transactions with undo logging and stage callbacks,
//!   + a root-object slot,
//!   + pool-scoped mutexes whose state is reset on every reopen.
//!
//! The pool layout:
//!
//! | offset            | size           | content                 |
//! |-------------------|----------------|-------------------------|
//! | 0                 | 4096           | [`StoreHeader`]         |
//! | `LOG_OFFSET`      | `log_size()`   | undo log                |
//! | `heap_offset()`   | rest of pool   | chunked heap            |
//!
//! Every mutation of pool memory must happen inside a [`Tx`], after
//! snapshotting the touched range with [`Tx::add_range`]. On commit the
//! mapping is flushed before the log is truncated, so a crashed transaction
//! is rolled back the next time the pool is opened.

use std::{
    collections::HashMap,
    fs::OpenOptions,
    marker::PhantomData,
    path::Path,
    ptr::NonNull,
    sync::Arc,
};

use dataview::Pod;
use memmap2::MmapMut;
use parking_lot::{Mutex, ReentrantMutex};

mod alloc;
mod tx;

pub use alloc::{TypeStats, CHUNK_HEADER_SIZE};
pub use tx::{tx_active_on_this_thread, Tx};

/// Size of the store header block.
pub const HEADER_SIZE: u64 = 4096;
/// Offset of the undo log.
pub const LOG_OFFSET: u64 = HEADER_SIZE;

/// Smallest pool a store can be created in.
pub const MIN_POOL_SIZE: u64 = 4 << 20;

/// Undo-log bytes for a pool of `len` bytes. Derived from the length so
/// that create and open agree without another header field. A snapshot
/// that cannot fit aborts the process; the original store grew its log
/// dynamically instead.
fn log_size_for(len: u64) -> u64 {
    (len / 8).clamp(1 << 20, 64 << 20)
}

const STORE_MAGIC: [u8; 8] = *b"PMSTORE1";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a pmem store, or the store header is damaged")]
    BadHeader,
    #[error("pool file is too small ({0} bytes)")]
    PoolTooSmall(u64),
    #[error("out of pool space")]
    OutOfSpace,
}

/// Typed handle to a persistent object: an offset into the pool.
///
/// The null handle is all-zeroes. Handles are plain data and may be embedded
/// in persistent records.
#[repr(transparent)]
pub struct PObj<T> {
    off: u64,
    _ty: PhantomData<fn() -> T>,
}

impl<T> Clone for PObj<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for PObj<T> {}

impl<T> PartialEq for PObj<T> {
    fn eq(&self, other: &Self) -> bool {
        self.off == other.off
    }
}
impl<T> Eq for PObj<T> {}

impl<T> std::fmt::Debug for PObj<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PObj({:#x})", self.off)
    }
}

// An 8-byte offset with no padding; any bit pattern is a valid (if possibly
// dangling) handle.
unsafe impl<T: 'static> Pod for PObj<T> {}

impl<T> PObj<T> {
    pub const NULL: Self = Self {
        off: 0,
        _ty: PhantomData,
    };

    #[must_use]
    pub const fn from_off(off: u64) -> Self {
        Self {
            off,
            _ty: PhantomData,
        }
    }

    #[must_use]
    pub const fn off(&self) -> u64 {
        self.off
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.off == 0
    }

    /// Reinterprets the handle as pointing to a different record type.
    #[must_use]
    pub const fn cast<U>(&self) -> PObj<U> {
        PObj::from_off(self.off)
    }
}

impl<T> Default for PObj<T> {
    fn default() -> Self {
        Self::NULL
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct StoreHeader {
    magic: [u8; 8],
    length: u64,
    uuid_lo: u64,
    root: u64,
    free_head: u64,
    _reserved: [u8; 4056],
}

unsafe impl Pod for StoreHeader {}

const _: () = assert!(std::mem::size_of::<StoreHeader>() as u64 == HEADER_SIZE);

/// The open pool.
pub struct Store {
    map: MmapMut,
    len: u64,
    /// Serializes transactions; reentrant so that a thread holding the
    /// transaction can observe its own depth.
    tx_lock: ReentrantMutex<()>,
    tx_state: Mutex<tx::TxLog>,
    mutexes: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
}

// The raw mapping is shared between threads; all access to object memory is
// guarded by the caller's lock protocol, and the undo log by `tx_lock`.
unsafe impl Send for Store {}
unsafe impl Sync for Store {}

impl Store {
    /// Creates a pool file of `size` bytes and initializes an empty store
    /// inside it.
    pub fn create(path: &Path, size: u64) -> Result<Self, StoreError> {
        if size < MIN_POOL_SIZE {
            return Err(StoreError::PoolTooSmall(size));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(size)?;
        let map = unsafe { MmapMut::map_mut(&file)? };

        let store = Self {
            map,
            len: size,
            tx_lock: ReentrantMutex::new(()),
            tx_state: Mutex::new(tx::TxLog::new()),
            mutexes: Mutex::new(HashMap::new()),
        };

        let header = StoreHeader {
            magic: STORE_MAGIC,
            length: size,
            uuid_lo: rand::random::<u64>() | 1,
            root: 0,
            free_head: LOG_OFFSET + log_size_for(size),
            _reserved: [0; 4056],
        };
        unsafe {
            *store.header_mut() = header;
        }
        alloc::format_heap(&store);
        store.map.flush()?;

        log::debug!("created pool {} ({size} bytes)", path.display());
        Ok(store)
    }

    /// Opens an existing pool, rolling back any transaction that did not
    /// commit before the last close.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < MIN_POOL_SIZE {
            return Err(StoreError::BadHeader);
        }
        let map = unsafe { MmapMut::map_mut(&file)? };

        let store = Self {
            map,
            len,
            tx_lock: ReentrantMutex::new(()),
            tx_state: Mutex::new(tx::TxLog::new()),
            mutexes: Mutex::new(HashMap::new()),
        };

        let header = store.header();
        if header.magic != STORE_MAGIC || header.length != len {
            return Err(StoreError::BadHeader);
        }

        tx::recover(&store);
        store.map.flush()?;

        log::debug!("opened pool {}", path.display());
        Ok(store)
    }

    fn header(&self) -> &StoreHeader {
        unsafe { &*self.base().cast::<StoreHeader>() }
    }

    /// Caller must be inside a transaction or single-threaded setup.
    unsafe fn header_mut(&self) -> *mut StoreHeader {
        self.base().cast::<StoreHeader>()
    }

    fn base(&self) -> *mut u8 {
        self.map.as_ptr().cast_mut()
    }

    /// Total pool length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Bytes reserved for the undo log.
    #[must_use]
    pub fn log_size(&self) -> u64 {
        log_size_for(self.len)
    }

    /// Offset of the first heap chunk.
    #[must_use]
    pub fn heap_offset(&self) -> u64 {
        LOG_OFFSET + self.log_size()
    }

    /// Low word of the pool identity, stable across reopen.
    #[must_use]
    pub fn uuid_lo(&self) -> u64 {
        self.header().uuid_lo
    }

    /// Raw pointer to pool offset `off`.
    ///
    /// Panics when the offset does not fit the pool; a handle pointing
    /// outside the pool means on-media corruption.
    #[must_use]
    pub fn at_off(&self, off: u64) -> *mut u8 {
        assert!(off != 0 && off < self.len, "offset {off:#x} outside pool");
        unsafe { self.base().add(off as usize) }
    }

    /// Direct pointer to a typed persistent object.
    #[must_use]
    pub fn at<T: Pod>(&self, obj: PObj<T>) -> NonNull<T> {
        assert!(
            obj.off() + std::mem::size_of::<T>() as u64 <= self.len,
            "object {obj:?} outside pool"
        );
        NonNull::new(self.at_off(obj.off()).cast::<T>()).unwrap()
    }

    /// Pool offset of a pointer previously obtained from this store.
    #[must_use]
    pub fn off_of<T>(&self, ptr: *const T) -> u64 {
        let off = (ptr as u64).wrapping_sub(self.base() as u64);
        assert!(off != 0 && off < self.len, "pointer outside pool");
        off
    }

    #[must_use]
    pub fn handle_of<T: Pod>(&self, ptr: *const T) -> PObj<T> {
        PObj::from_off(self.off_of(ptr))
    }

    /// Root object handle, if one has been set.
    #[must_use]
    pub fn root<T: Pod>(&self) -> PObj<T> {
        PObj::from_off(self.header().root)
    }

    /// Records `obj` as the pool's root object. Must be called in a
    /// transaction.
    pub fn set_root<T: Pod>(&self, tx: &Tx<'_>, obj: PObj<T>) {
        let root_ptr = unsafe { std::ptr::addr_of_mut!((*self.header_mut()).root) };
        tx.add_range(self.off_of(root_ptr), 8);
        unsafe { *root_ptr = obj.off() };
    }

    /// Starts a transaction. The returned guard aborts on drop; call
    /// [`Tx::commit`] to make the work durable.
    #[must_use]
    pub fn begin(&self) -> Tx<'_> {
        Tx::begin(self)
    }

    /// Allocates a zeroed object of `size` bytes tagged with `type_tag`.
    pub fn alloc_zeroed(&self, tx: &Tx<'_>, type_tag: u32, size: u64) -> Result<u64, StoreError> {
        let off = alloc::alloc(self, tx, type_tag, size)?;
        tx.memzero(off, alloc::usable_size(self, off));
        Ok(off)
    }

    /// Allocates an object without initializing its payload. The caller is
    /// responsible for never exposing uninitialized bytes.
    pub fn alloc_unzeroed(&self, tx: &Tx<'_>, type_tag: u32, size: u64) -> Result<u64, StoreError> {
        alloc::alloc(self, tx, type_tag, size)
    }

    /// Allocates a zeroed, typed record.
    pub fn alloc_typed<T: Pod>(&self, tx: &Tx<'_>, type_tag: u32) -> Result<PObj<T>, StoreError> {
        let off = self.alloc_zeroed(tx, type_tag, std::mem::size_of::<T>() as u64)?;
        Ok(PObj::from_off(off))
    }

    /// Returns an object's payload to the free list.
    pub fn free(&self, tx: &Tx<'_>, off: u64) {
        alloc::free(self, tx, off);
    }

    /// Usable payload size of an allocated object.
    #[must_use]
    pub fn usable_size(&self, off: u64) -> u64 {
        alloc::usable_size(self, off)
    }

    /// Counts live objects per type tag by walking the heap.
    #[must_use]
    pub fn stats(&self) -> TypeStats {
        alloc::stats(self)
    }

    /// The volatile mutex standing in for the persistent mutex slot at pool
    /// offset `off`. The registry starts empty on every open, so lock state
    /// never survives a reopen.
    #[must_use]
    pub fn pool_mutex(&self, off: u64) -> Arc<Mutex<()>> {
        Arc::clone(
            self.mutexes
                .lock()
                .entry(off)
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Takes the pool mutex at `off` for the rest of the transaction: the
    /// lock is released after durability on commit, or as the transaction
    /// unwinds on abort.
    pub fn lock_pool_mutex_handoff(&self, tx: &Tx<'_>, off: u64) {
        let mutex = self.pool_mutex(off);
        std::mem::forget(mutex.lock());

        let on_commit = Arc::clone(&mutex);
        tx.on_commit(move || unsafe { on_commit.force_unlock() });
        tx.on_abort(move || unsafe { mutex.force_unlock() });
    }

    /// Flushes the whole mapping to stable storage.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.map.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_store(size: u64) -> (tempfile::TempDir, Store) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::create(&dir.path().join("pool"), size).unwrap();
        (dir, store)
    }

    #[test]
    fn create_and_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("pool");
        let uuid;
        {
            let store = Store::create(&path, MIN_POOL_SIZE).unwrap();
            uuid = store.uuid_lo();
            assert_ne!(uuid, 0);
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.uuid_lo(), uuid);
    }

    #[test]
    fn alloc_survives_commit_but_not_abort() {
        let (_dir, store) = tmp_store(MIN_POOL_SIZE);

        let tx = store.begin();
        let off = store.alloc_zeroed(&tx, 7, 128).unwrap();
        tx.commit();
        assert_eq!(store.stats().count(7), 1);
        assert!(store.usable_size(off) >= 128);

        let tx = store.begin();
        store.alloc_zeroed(&tx, 7, 128).unwrap();
        drop(tx); // abort
        assert_eq!(store.stats().count(7), 1);
    }

    #[test]
    fn abort_restores_snapshotted_bytes() {
        let (_dir, store) = tmp_store(MIN_POOL_SIZE);

        let tx = store.begin();
        let off = store.alloc_zeroed(&tx, 1, 64).unwrap();
        tx.commit();

        let tx = store.begin();
        tx.add_range(off, 8);
        unsafe { store.at_off(off).cast::<u64>().write(0xdead_beef) };
        drop(tx);

        assert_eq!(unsafe { store.at_off(off).cast::<u64>().read() }, 0);
    }

    #[test]
    fn root_object_round_trip() {
        let (_dir, store) = tmp_store(MIN_POOL_SIZE);
        let tx = store.begin();
        let obj: PObj<u64> = store.alloc_typed(&tx, 2).unwrap();
        store.set_root(&tx, obj);
        tx.commit();
        assert_eq!(store.root::<u64>(), obj);
    }
}
