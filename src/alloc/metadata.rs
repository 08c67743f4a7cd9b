// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Fixed-layout bookkeeping bump-allocated at the start of the METADATA
// block, mirroring shm_mgr.cpp's on_create/on_resume: `size_map_`,
// `page_heap_` and `chunk_cache_` are placement-new'd into the metadata
// block at byte_offset-derived addresses and rebound (not reconstructed)
// at the same offsets on resume (src/shm/detail/shm_mgr.cpp:29-99). This
// struct is that same region expressed as a single `#[repr(C)]` value:
// every field malloc/free/get_singleton touch lives in shared bytes, so a
// fresh process attaching after a crash sees exactly the state the last
// writer left behind.
//
// Never instantiate `MetadataRegion` by value — it's large and only ever
// meant to be reached through a pointer into mmap'd memory.

use crate::alloc::block_manager::{BlockManager, METADATA_BLOCK};
use crate::alloc::size_class::{SizeClassTable, MAX_PAGES};
use crate::error::{BusError, BusResult};

pub const MAX_SIZE_CLASSES: usize = 64;
pub const MAX_SPANS: usize = 8192;
pub const MAX_SINGLETONS: usize = 64;
/// Pages tracked per block by the flat page-map array below. Must match
/// the page-addressable headroom `ShmManager` reserves for each block.
pub const BLOCK_RESERVE_PAGES: usize = 16384;

const REGION_MAGIC: u32 = 0x5348_4D30; // "SHM0"

pub const SPAN_VACANT: u32 = 0;
pub const SPAN_FREE: u32 = 1;
pub const SPAN_IN_USE: u32 = 2;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SizeClassEntry {
    pub bytes: u64,
    pub pages: u64,
    pub max_chunks: u64,
}

/// One page-heap span slot. `link_next` threads whichever intrusive list
/// the span currently belongs to (the vacant-slot list, a size freelist,
/// or the large list) depending on `state` — a span is only ever on one
/// of those lists at a time.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SpanRaw {
    pub block: u8,
    _pad: [u8; 3],
    pub state: u32,
    /// -1 for a raw large allocation or a non-in-use span.
    pub size_class: i32,
    pub start_page: u64,
    pub page_count: u64,
    pub used_count: u32,
    pub link_next: i32,
}

pub const EMPTY_SPAN: SpanRaw =
    SpanRaw { block: 0, _pad: [0; 3], state: SPAN_VACANT, size_class: -1, start_page: 0, page_count: 0, used_count: 0, link_next: -1 };

impl SpanRaw {
    pub fn new(block: u8, state: u32, size_class: i32, start_page: u64, page_count: u64, used_count: u32) -> Self {
        SpanRaw { block, _pad: [0; 3], state, size_class, start_page, page_count, used_count, link_next: -1 }
    }
}

#[repr(C)]
pub struct MetadataRegion {
    magic: u32,
    size_class_count: u32,
    size_classes: [SizeClassEntry; MAX_SIZE_CLASSES],

    pub next_serial: u32,
    _pad0: u32,

    pub vacant_head: i32,
    pub large_list_head: i32,
    pub span_freelist_heads: [i32; MAX_PAGES],

    page_map: [[i32; BLOCK_RESERVE_PAGES]; 2],

    pub chunk_freelist_heads: [i64; MAX_SIZE_CLASSES],

    singletons: [u64; MAX_SINGLETONS],

    pub span_hwm: u32,
    _pad1: u32,
    pub spans: [SpanRaw; MAX_SPANS],
}

impl MetadataRegion {
    pub fn size_classes(&self) -> &[SizeClassEntry] {
        &self.size_classes[..self.size_class_count as usize]
    }

    fn page_map_slot(&self, block: u8, page: u64) -> &i32 {
        &self.page_map[block as usize][page as usize]
    }

    fn page_map_slot_mut(&mut self, block: u8, page: u64) -> &mut i32 {
        &mut self.page_map[block as usize][page as usize]
    }

    pub fn page_map_get(&self, block: u8, page: u64) -> Option<usize> {
        match *self.page_map_slot(block, page) {
            -1 => None,
            id => Some(id as usize),
        }
    }

    pub fn page_map_set(&mut self, block: u8, page: u64, id: Option<usize>) {
        *self.page_map_slot_mut(block, page) = id.map(|v| v as i32).unwrap_or(-1);
    }

    pub fn singleton_get(&self, id: u32) -> Option<u64> {
        let raw = self.singletons[id as usize % MAX_SINGLETONS];
        if raw == 0 {
            None
        } else {
            Some(raw)
        }
    }

    pub fn singleton_set(&mut self, id: u32, encoded: u64) {
        self.singletons[id as usize % MAX_SINGLETONS] = encoded;
    }
}

/// Bump-allocate the metadata region at the start of the METADATA block
/// (always offset 0, the block's first and only allocation), zero it,
/// write the size-class table and sentinel link values, and mark it
/// initialized. Equivalent to `shm_mgr::on_create`'s three placement-news.
pub fn create(block_mgr: &mut BlockManager, table: &SizeClassTable) -> BusResult<*mut MetadataRegion> {
    let size = std::mem::size_of::<MetadataRegion>() as u64;
    let addr = block_mgr
        .sbrk(METADATA_BLOCK, size)
        .map_err(|e| BusError::FatalInit(format!("metadata region bump-allocation failed: {e}")))?;
    debug_assert_eq!(addr.offset(), 0, "metadata region must be the block's first allocation");

    let ptr = block_mgr.resolve(METADATA_BLOCK, 0) as *mut MetadataRegion;
    unsafe {
        std::ptr::write_bytes(ptr as *mut u8, 0, size as usize);
        let region = &mut *ptr;

        region.magic = REGION_MAGIC;
        let classes = table.classes();
        assert!(classes.len() <= MAX_SIZE_CLASSES, "size-class table grew past MAX_SIZE_CLASSES");
        region.size_class_count = classes.len() as u32;
        for (i, c) in classes.iter().enumerate() {
            region.size_classes[i] = SizeClassEntry { bytes: c.bytes, pages: c.pages, max_chunks: c.max_chunks };
        }

        region.next_serial = crate::alloc::address::MIN_VALID_SERIAL;
        region.vacant_head = -1;
        region.large_list_head = -1;
        region.span_freelist_heads.fill(-1);
        for block in 0..2 {
            for page in 0..BLOCK_RESERVE_PAGES {
                region.page_map[block][page] = -1;
            }
        }
        region.chunk_freelist_heads.fill(-1);
        region.span_hwm = 0;
        region.spans.fill(EMPTY_SPAN);
    }
    Ok(ptr)
}

/// Rebind the metadata region at the same fixed offset (0) an already
/// populated block after a restart. Mirrors `shm_mgr::on_resume`'s
/// re-derivation of the same byte_offset, without re-initializing
/// anything it points to.
pub fn bind(block_mgr: &BlockManager, table: &SizeClassTable) -> BusResult<*mut MetadataRegion> {
    let ptr = block_mgr.resolve(METADATA_BLOCK, 0) as *mut MetadataRegion;
    let region = unsafe { &*ptr };
    if region.magic != REGION_MAGIC {
        return Err(BusError::FatalInit("metadata region magic mismatch on resume".into()));
    }
    let stored = region.size_classes();
    let fresh = table.classes();
    if stored.len() != fresh.len() || stored.iter().zip(fresh).any(|(a, b)| a.bytes != b.bytes || a.pages != b.pages) {
        return Err(BusError::FatalInit("size-class geometry changed across a resume".into()));
    }
    Ok(ptr)
}
