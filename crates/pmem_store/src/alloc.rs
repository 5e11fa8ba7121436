//! Chunked heap with a persistent first-fit free list.
//!
//! Every object is preceded by a 32-byte chunk header carrying the payload
//! size, a caller-chosen type tag and the free-list link. Chunks are
//! contiguous, so the whole heap can be walked for per-type statistics the
//! way the original store enumerated typed objects.
//!
//! All allocator metadata is mutated through transaction snapshots, which
//! makes allocation and free transactional: an aborted transaction leaves
//! the free list exactly as it found it.

use std::collections::HashMap;

use crate::{Store, StoreError, Tx};

/// Bytes in front of every payload.
pub const CHUNK_HEADER_SIZE: u64 = 32;

/// Payload alignment and minimum payload size.
const CHUNK_ALIGN: u64 = 64;

#[repr(C)]
struct ChunkHeader {
    /// Payload size; the next chunk starts `CHUNK_HEADER_SIZE + size`
    /// further on.
    size: u64,
    type_tag: u32,
    live: u32,
    next_free: u64,
    _pad: u64,
}

const _: () = assert!(std::mem::size_of::<ChunkHeader>() as u64 == CHUNK_HEADER_SIZE);

fn chunk(store: &Store, chunk_off: u64) -> *mut ChunkHeader {
    store.at_off(chunk_off).cast::<ChunkHeader>()
}

/// Lays the whole heap out as one free chunk. Runs during pool creation,
/// before the store is shared.
pub(crate) fn format_heap(store: &Store) {
    let heap_off = store.heap_offset();
    let heap_len = store.len() - heap_off;
    unsafe {
        chunk(store, heap_off).write(ChunkHeader {
            size: heap_len - CHUNK_HEADER_SIZE,
            type_tag: 0,
            live: 0,
            next_free: 0,
            _pad: 0,
        });
    }
}

fn free_head_ptr(store: &Store) -> *mut u64 {
    unsafe { std::ptr::addr_of_mut!((*store.header_mut()).free_head) }
}

/// First-fit allocation. Returns the payload offset.
pub(crate) fn alloc(
    store: &Store,
    tx: &Tx<'_>,
    type_tag: u32,
    size: u64,
) -> Result<u64, StoreError> {
    assert!(size > 0);
    let size = size.max(CHUNK_ALIGN).next_multiple_of(CHUNK_ALIGN);

    // `prev_link` is the location holding the offset of the chunk under
    // inspection: the header's free_head, or a free chunk's next_free.
    let mut prev_link = free_head_ptr(store);
    loop {
        let chunk_off = unsafe { prev_link.read() };
        if chunk_off == 0 {
            return Err(StoreError::OutOfSpace);
        }

        let hdr = chunk(store, chunk_off);
        let (chunk_size, next_free) = unsafe { ((*hdr).size, (*hdr).next_free) };
        debug_assert_eq!(unsafe { (*hdr).live }, 0);

        if chunk_size < size {
            prev_link = unsafe { std::ptr::addr_of_mut!((*hdr).next_free) };
            continue;
        }

        let remainder = chunk_size - size;
        let keep_whole = remainder < CHUNK_HEADER_SIZE + CHUNK_ALIGN;

        tx.add_ptr_range(prev_link, 8);
        tx.add_ptr_range(hdr.cast::<u8>(), CHUNK_HEADER_SIZE);

        if keep_whole {
            unsafe {
                prev_link.write(next_free);
                (*hdr).type_tag = type_tag;
                (*hdr).live = 1;
                (*hdr).next_free = 0;
            }
        } else {
            // Split: the tail becomes a new free chunk taking this chunk's
            // place in the list.
            let tail_off = chunk_off + CHUNK_HEADER_SIZE + size;
            let tail = chunk(store, tail_off);
            tx.add_ptr_range(tail.cast::<u8>(), CHUNK_HEADER_SIZE);
            unsafe {
                tail.write(ChunkHeader {
                    size: remainder - CHUNK_HEADER_SIZE,
                    type_tag: 0,
                    live: 0,
                    next_free,
                    _pad: 0,
                });
                prev_link.write(tail_off);
                (*hdr).size = size;
                (*hdr).type_tag = type_tag;
                (*hdr).live = 1;
                (*hdr).next_free = 0;
            }
        }

        return Ok(chunk_off + CHUNK_HEADER_SIZE);
    }
}

/// Returns a payload to the free list.
pub(crate) fn free(store: &Store, tx: &Tx<'_>, payload_off: u64) {
    let chunk_off = payload_off - CHUNK_HEADER_SIZE;
    let hdr = chunk(store, chunk_off);
    assert_eq!(unsafe { (*hdr).live }, 1, "double free at {payload_off:#x}");

    let head = free_head_ptr(store);
    tx.add_ptr_range(head, 8);
    tx.add_ptr_range(hdr.cast::<u8>(), CHUNK_HEADER_SIZE);
    unsafe {
        (*hdr).live = 0;
        (*hdr).type_tag = 0;
        (*hdr).next_free = head.read();
        head.write(chunk_off);
    }
}

pub(crate) fn usable_size(store: &Store, payload_off: u64) -> u64 {
    let hdr = chunk(store, payload_off - CHUNK_HEADER_SIZE);
    unsafe { (*hdr).size }
}

/// Live-object counts keyed by type tag.
#[derive(Debug, Default, Clone)]
pub struct TypeStats {
    counts: HashMap<u32, u64>,
}

impl TypeStats {
    #[must_use]
    pub fn count(&self, type_tag: u32) -> u64 {
        self.counts.get(&type_tag).copied().unwrap_or(0)
    }
}

pub(crate) fn stats(store: &Store) -> TypeStats {
    let mut out = TypeStats::default();
    let mut pos = store.heap_offset();
    while pos + CHUNK_HEADER_SIZE <= store.len() {
        let hdr = chunk(store, pos);
        let (size, tag, live) = unsafe { ((*hdr).size, (*hdr).type_tag, (*hdr).live) };
        if size == 0 {
            break;
        }
        if live != 0 {
            *out.counts.entry(tag).or_insert(0) += 1;
        }
        pos += CHUNK_HEADER_SIZE + size;
    }
    out
}
