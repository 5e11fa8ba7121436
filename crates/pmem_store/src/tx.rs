//! Undo-log transactions.
//!
//! A transaction snapshots every byte range it is about to modify into the
//! persistent undo log, then mutates pool memory in place. Commit flushes
//! the mapping and truncates the log; abort copies the snapshots back in
//! reverse order. A pool that crashed mid-transaction is rolled back by
//! [`recover`] when it is next opened.
//!
//! Stage callbacks mirror the ON-COMMIT / ON-ABORT hooks of the original
//! store: ON-ABORT callbacks run while the transaction unwinds (volatile
//! state rollback, lock release), ON-COMMIT callbacks run after the log has
//! been truncated (durability point).

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;

use dataview::Pod;
use parking_lot::ReentrantMutexGuard;

use crate::{PObj, Store, LOG_OFFSET};

/// Persistent log header: number of record bytes in use.
const LOG_HEADER_SIZE: u64 = 16;

/// Per-record header: target offset + snapshot length.
const REC_HEADER_SIZE: u64 = 16;

type Callback = Box<dyn FnOnce()>;

thread_local! {
    static IN_TX: Cell<bool> = const { Cell::new(false) };
}

/// Does the calling thread currently hold an open transaction?
#[must_use]
pub fn tx_active_on_this_thread() -> bool {
    IN_TX.with(Cell::get)
}

/// Volatile transaction bookkeeping, shared through the store.
pub(crate) struct TxLog {
    active: bool,
}

impl TxLog {
    pub(crate) fn new() -> Self {
        Self { active: false }
    }
}

/// An open transaction. Dropping the transaction without calling
/// [`Tx::commit`] aborts it.
pub struct Tx<'s> {
    store: &'s Store,
    _guard: ReentrantMutexGuard<'s, ()>,
    committed: Cell<bool>,
    /// Whether any pool byte was touched; a clean commit skips the flush.
    dirty: Cell<bool>,
    on_commit: RefCell<Vec<Callback>>,
    on_abort: RefCell<Vec<Callback>>,
    // A transaction belongs to the thread that opened it.
    _not_sync: PhantomData<*mut ()>,
}

impl<'s> Tx<'s> {
    pub(crate) fn begin(store: &'s Store) -> Self {
        let guard = store.tx_lock.lock();
        {
            let mut state = store.tx_state.lock();
            assert!(!state.active, "nested transactions are not supported");
            state.active = true;
        }
        IN_TX.with(|f| f.set(true));
        debug_assert_eq!(log_used(store), 0);
        Self {
            store,
            _guard: guard,
            committed: Cell::new(false),
            dirty: Cell::new(false),
            on_commit: RefCell::new(Vec::new()),
            on_abort: RefCell::new(Vec::new()),
            _not_sync: PhantomData,
        }
    }

    /// Snapshots `[off, off + len)` into the undo log. Must be called before
    /// the range is modified.
    pub fn add_range(&self, off: u64, len: u64) {
        if len == 0 {
            return;
        }
        self.dirty.set(true);
        let store = self.store;
        assert!(off != 0 && off + len <= store.len(), "snapshot outside pool");

        let used = log_used(store);
        let rec_len = REC_HEADER_SIZE + round8(len);
        assert!(
            LOG_HEADER_SIZE + used + rec_len <= store.log_size(),
            "undo log exhausted ({len} byte snapshot)"
        );

        unsafe {
            let rec = store.at_off(LOG_OFFSET + LOG_HEADER_SIZE + used);
            rec.cast::<u64>().write_unaligned(off);
            rec.add(8).cast::<u64>().write_unaligned(len);
            std::ptr::copy_nonoverlapping(store.at_off(off), rec.add(16), len as usize);
        }
        // The record must be complete before it is published via `used`.
        set_log_used(store, used + rec_len);
    }

    /// Snapshots one whole typed record.
    pub fn add_obj<T: Pod>(&self, obj: PObj<T>) {
        self.add_range(obj.off(), std::mem::size_of::<T>() as u64);
    }

    /// Snapshots `len` bytes starting at a direct pool pointer.
    pub fn add_ptr_range<T>(&self, ptr: *const T, len: u64) {
        self.add_range(self.store.off_of(ptr), len);
    }

    /// Snapshots the record behind a direct pool pointer.
    pub fn add_ptr<T: Pod>(&self, ptr: *const T) {
        self.add_ptr_range(ptr, std::mem::size_of::<T>() as u64);
    }

    /// Snapshot-then-assign, the moral equivalent of `TX_SET_DIRECT`.
    pub fn set<T: Pod>(&self, ptr: *mut T, value: T) {
        self.add_ptr(ptr);
        unsafe { ptr.write(value) };
    }

    /// Zeroes a range without snapshotting it. Only valid for memory that is
    /// unreachable until a snapshotted pointer publishes it.
    pub fn memzero(&self, off: u64, len: u64) {
        self.dirty.set(true);
        unsafe {
            std::ptr::write_bytes(self.store.at_off(off), 0, len as usize);
        }
    }

    /// Copies caller bytes into the pool without snapshotting. File data is
    /// deliberately not undo-logged, matching the data-engine contract.
    pub fn write_bytes(&self, off: u64, bytes: &[u8]) {
        self.dirty.set(true);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.store.at_off(off), bytes.len());
        }
    }

    /// Runs `f` after the transaction becomes durable.
    pub fn on_commit(&self, f: impl FnOnce() + 'static) {
        self.on_commit.borrow_mut().push(Box::new(f));
    }

    /// Runs `f` if the transaction aborts.
    pub fn on_abort(&self, f: impl FnOnce() + 'static) {
        self.on_abort.borrow_mut().push(Box::new(f));
    }

    /// Makes the transaction durable and runs the ON-COMMIT callbacks.
    pub fn commit(self) {
        self.committed.set(true);

        let store = self.store;
        if self.dirty.get() {
            if store.map.flush().is_err() {
                // Durability can no longer be guaranteed; continuing would
                // let readers observe state that may vanish on crash.
                panic!("pool flush failed at commit");
            }
            set_log_used(store, 0);
        }
        store.tx_state.lock().active = false;
        IN_TX.with(|f| f.set(false));

        for cb in self.on_commit.take() {
            cb();
        }
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if self.committed.get() {
            return;
        }

        rollback(self.store);
        self.store.tx_state.lock().active = false;
        IN_TX.with(|f| f.set(false));

        for cb in self.on_abort.take().into_iter().rev() {
            cb();
        }
    }
}

/// Applies the undo log in reverse and truncates it.
fn rollback(store: &Store) {
    let used = log_used(store);
    if used == 0 {
        return;
    }

    let mut records = Vec::new();
    let mut pos = 0u64;
    while pos < used {
        let rec = store.at_off(LOG_OFFSET + LOG_HEADER_SIZE + pos);
        let (off, len) = unsafe {
            (
                rec.cast::<u64>().read_unaligned(),
                rec.add(8).cast::<u64>().read_unaligned(),
            )
        };
        records.push((off, len, pos + REC_HEADER_SIZE));
        pos += REC_HEADER_SIZE + round8(len);
    }

    for &(off, len, payload_pos) in records.iter().rev() {
        unsafe {
            std::ptr::copy_nonoverlapping(
                store.at_off(LOG_OFFSET + LOG_HEADER_SIZE + payload_pos),
                store.at_off(off),
                len as usize,
            );
        }
    }

    set_log_used(store, 0);
}

/// Crash recovery: a non-empty log on open belongs to a transaction that
/// never committed.
pub(crate) fn recover(store: &Store) {
    let used = log_used(store);
    if used != 0 {
        log::warn!("rolling back interrupted transaction ({used} log bytes)");
        rollback(store);
    }
}

fn log_used(store: &Store) -> u64 {
    unsafe { store.at_off(LOG_OFFSET).cast::<u64>().read() }
}

fn set_log_used(store: &Store, used: u64) {
    unsafe { store.at_off(LOG_OFFSET).cast::<u64>().write(used) };
}

fn round8(n: u64) -> u64 {
    (n + 7) & !7
}
