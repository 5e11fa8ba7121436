//! The inode↔vinode map.
//!
//! Open addressing into buckets of two slots, universal hashing with random
//! coefficients. When an insert finds its bucket full it rebuilds the map:
//! first by re-randomizing the coefficients (up to two retries), then by
//! doubling the bucket count. Registration of an inode allocated in the
//! running transaction installs an ON-ABORT callback that unregisters the
//! vinode again, so a rolled-back allocation never leaves a stale entry.

use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use pmem_store::{PObj, Tx};
use rand::Rng as _;

use crate::{
    error::{Error, Result},
    inode::{Vinode, Vref},
    layout::{Inode, INODE_VERSION},
    pool::FsCore,
};

const BUCKET_SIZE: usize = 2;
const HASH_PRIME: u64 = 32_212_254_719;

struct Slot {
    pinode: PObj<Inode>,
    vinode: Arc<Vinode>,
}

#[derive(Default)]
struct Bucket {
    slots: [Option<Slot>; BUCKET_SIZE],
}

pub(crate) struct MapInner {
    hash_a: u32,
    hash_b: u32,
    buckets: Vec<Bucket>,
    /// Number of registered vinodes.
    inodes: usize,
}

pub(crate) struct InodeMap {
    inner: RwLock<MapInner>,
}

fn rand_params() -> (u32, u32) {
    let mut rng = rand::thread_rng();
    let mut a = 0u32;
    while a == 0 {
        a = rng.gen();
    }
    (a, rng.gen())
}

impl MapInner {
    fn hash(&self, pinode: PObj<Inode>) -> usize {
        let h = (u64::from(self.hash_a) * pinode.off() + u64::from(self.hash_b)) % HASH_PRIME;
        (h % self.buckets.len() as u64) as usize
    }

    fn find(&self, pinode: PObj<Inode>) -> Option<&Arc<Vinode>> {
        let bucket = &self.buckets[self.hash(pinode)];
        bucket
            .slots
            .iter()
            .flatten()
            .find(|slot| slot.pinode == pinode)
            .map(|slot| &slot.vinode)
    }

    /// Re-places every entry into `new_sz` buckets with the current
    /// coefficients; fails when some bucket would overflow.
    fn rebuild(&mut self, new_sz: usize) -> bool {
        let mut new_buckets: Vec<Bucket> = (0..new_sz).map(|_| Bucket::default()).collect();

        for bucket in &self.buckets {
            for slot in bucket.slots.iter().flatten() {
                let h = (u64::from(self.hash_a) * slot.pinode.off() + u64::from(self.hash_b))
                    % HASH_PRIME;
                let idx = (h % new_sz as u64) as usize;
                match new_buckets[idx].slots.iter_mut().find(|s| s.is_none()) {
                    Some(empty) => {
                        *empty = Some(Slot {
                            pinode: slot.pinode,
                            vinode: Arc::clone(&slot.vinode),
                        });
                    }
                    None => return false,
                }
            }
        }

        self.buckets = new_buckets;
        true
    }

    /// Grows or re-randomizes until an insert slot exists for `pinode`.
    fn make_room(&mut self, pinode: PObj<Inode>) {
        let mut tries = 0;
        loop {
            let mut new_sz = self.buckets.len();
            if self.inodes > 2 * new_sz || tries == 2 {
                new_sz *= 2;
                tries = 0;
            } else {
                let (a, b) = rand_params();
                self.hash_a = a;
                self.hash_b = b;
                tries += 1;
            }

            if !self.rebuild(new_sz) {
                continue;
            }

            let idx = self.hash(pinode);
            if self.buckets[idx].slots.iter().any(|s| s.is_none()) {
                return;
            }
        }
    }

    fn insert(&mut self, pinode: PObj<Inode>, vinode: Arc<Vinode>) {
        let idx = self.hash(pinode);
        if self.buckets[idx].slots.iter().all(|s| s.is_some()) {
            self.make_room(pinode);
        }
        let idx = self.hash(pinode);
        let empty = self.buckets[idx]
            .slots
            .iter_mut()
            .find(|s| s.is_none())
            .unwrap();
        *empty = Some(Slot { pinode, vinode });
        self.inodes += 1;
    }

    /// Removes a registered vinode; panics when it is not present, which
    /// would mean refcounting went wrong.
    pub(crate) fn unregister(&mut self, vinode: &Arc<Vinode>) {
        let idx = self.hash(vinode.tinode);
        let slot = self.buckets[idx]
            .slots
            .iter_mut()
            .find(|s| {
                s.as_ref()
                    .is_some_and(|slot| Arc::ptr_eq(&slot.vinode, vinode))
            })
            .expect("vinode not found in inode map");
        *slot = None;
        self.inodes -= 1;
    }

    pub(crate) fn len(&self) -> usize {
        self.inodes
    }
}

impl InodeMap {
    pub(crate) fn new() -> Self {
        let (hash_a, hash_b) = rand_params();
        Self {
            inner: RwLock::new(MapInner {
                hash_a,
                hash_b,
                buckets: (0..2).map(|_| Bucket::default()).collect(),
                inodes: 0,
            }),
        }
    }

    pub(crate) fn write(&self) -> parking_lot::RwLockWriteGuard<'_, MapInner> {
        self.inner.write()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Returns a referenced vinode for `pinode`, creating one if the inode
    /// has no volatile handle yet.
    ///
    /// `parent` is recorded (with its own reference) for directories.
    /// When `new_in_tx` carries the transaction that allocated the inode,
    /// an ON-ABORT callback unregisters the fresh vinode on rollback.
    pub(crate) fn get(
        &self,
        fs: &Arc<FsCore>,
        pinode: PObj<Inode>,
        parent: Option<&Arc<Vinode>>,
        name: Option<&[u8]>,
        new_in_tx: Option<&Tx<'_>>,
    ) -> Result<Vref> {
        let inode = unsafe { fs.store.at(pinode).as_ref() };
        if inode.version != INODE_VERSION {
            log::error!(
                "unknown inode version {:#x} for inode {:#x}",
                inode.version,
                pinode.off()
            );
            return Err(Error::InvalidArgument);
        }

        {
            let inner = self.inner.read();
            if let Some(v) = inner.find(pinode) {
                return Ok(Vref::adopt(Arc::clone(v)));
            }
        }

        let mut inner = self.inner.write();

        // Someone may have registered it while the lock was dropped.
        if let Some(v) = inner.find(pinode) {
            return Ok(Vref::adopt(Arc::clone(v)));
        }

        let vinode = Arc::new(Vinode::new(Arc::downgrade(fs), pinode));
        if inode.is_dir() {
            if let Some(parent) = parent {
                vinode.set_parent(Arc::clone(parent));
            }
        }
        #[cfg(debug_assertions)]
        vinode.set_debug_path(fs, parent, name);
        #[cfg(not(debug_assertions))]
        let _ = name;

        inner.insert(pinode, Arc::clone(&vinode));

        if let Some(tx) = new_in_tx {
            let fs = Weak::upgrade(&vinode.fs).expect("pool alive inside transaction");
            let doomed = Arc::clone(&vinode);
            tx.on_abort(move || {
                doomed.mark_defunct();
                let mut inner = fs.map.write();
                inner.unregister(&doomed);
                // Parent references taken at registration are dropped with
                // the vinode itself; the persistent side rolls back with
                // the transaction.
            });
        }

        Ok(Vref::adopt(vinode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_spreads_and_is_stable() {
        let inner = MapInner {
            hash_a: 12345,
            hash_b: 678,
            buckets: (0..8).map(|_| Bucket::default()).collect(),
            inodes: 0,
        };
        let a = inner.hash(PObj::from_off(4096));
        let b = inner.hash(PObj::from_off(4096));
        assert_eq!(a, b);
        assert!(a < 8);
    }
}
