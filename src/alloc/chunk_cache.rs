// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Per-size-class freelist of fixed-size chunks carved from page-heap spans.
// Port of shm_mgr.cpp's chunk-pool half (`__malloc_from_chunk_pool`,
// `__free_from_chunk_pool`, `free_chunk_hash`).
//
// The freelist heads live in the metadata region (`chunk_freelist_heads`),
// and each free chunk's own first 8 bytes hold the next chunk's global
// offset — spans and chunks thread their own links through payload
// memory rather than through a side table, matching shm_mgr.cpp's
// in-segment chunk pool and SPEC_FULL.md 4.E/9's "never store native
// pointers in shared memory" note: what's stored is a block-relative byte
// offset, not a pointer.

use crate::alloc::block_manager::BlockManager;
use crate::alloc::metadata::MetadataRegion;
use crate::alloc::page_heap::{PageHeap, SpanId};
use crate::alloc::size_class::SizeClassTable;
use crate::error::{BusError, BusResult};

const NO_NEXT: i64 = -1;

pub struct ChunkCache {
    region: *mut MetadataRegion,
}

unsafe impl Send for ChunkCache {}

impl ChunkCache {
    pub fn bind(region: *mut MetadataRegion) -> Self {
        ChunkCache { region }
    }

    fn region(&self) -> &MetadataRegion {
        unsafe { &*self.region }
    }

    fn region_mut(&mut self) -> &mut MetadataRegion {
        unsafe { &mut *self.region }
    }

    fn read_next(block_mgr: &BlockManager, block: u8, global_offset: u64) -> i64 {
        let ptr = block_mgr.resolve(block, global_offset) as *const i64;
        unsafe { ptr.read_unaligned() }
    }

    fn write_next(block_mgr: &mut BlockManager, block: u8, global_offset: u64, next: i64) {
        let ptr = block_mgr.resolve(block, global_offset) as *mut i64;
        unsafe { ptr.write_unaligned(next) };
    }

    /// Returns `(span, offset_in_span)` for one chunk of `class`.
    pub fn allocate_chunk(
        &mut self,
        class: usize,
        table: &SizeClassTable,
        heap: &mut PageHeap,
        block: u8,
        block_mgr: &mut BlockManager,
    ) -> BusResult<(SpanId, u64)> {
        let head = self.region().chunk_freelist_heads[class];
        if head != NO_NEXT {
            let global_offset = head as u64;
            let next = Self::read_next(block_mgr, block, global_offset);
            self.region_mut().chunk_freelist_heads[class] = next;
            let span_id = heap.find_span(block, global_offset).expect("free chunk must belong to a registered span");
            let offset_in_span = global_offset - heap.span(span_id).base_offset();
            return Ok((span_id, offset_in_span));
        }

        let class_info = table.classes()[class];
        let span_id = heap.allocate_span(block, class_info.pages, block_mgr)?;
        heap.span_mut(span_id).size_class = class as i32;

        let chunk_bytes = class_info.bytes;
        let span_base = heap.span(span_id).base_offset();
        let span_len = heap.span(span_id).byte_len();
        let n = span_len / chunk_bytes;

        // Thread every chunk but the first onto the class freelist; hand
        // the first one out directly.
        let mut prev_head = NO_NEXT;
        for i in (1..n).rev() {
            let global_offset = span_base + i * chunk_bytes;
            Self::write_next(block_mgr, block, global_offset, prev_head);
            prev_head = global_offset as i64;
        }
        self.region_mut().chunk_freelist_heads[class] = prev_head;

        if n == 0 {
            return Err(BusError::OutOfMemory);
        }
        Ok((span_id, 0))
    }

    /// Release a chunk back to its span; returns the span to the page heap
    /// once it has no chunks left in use.
    pub fn deallocate_chunk(&mut self, class: usize, span_id: SpanId, offset_in_span: u64, heap: &mut PageHeap, block: u8, block_mgr: &mut BlockManager) {
        let span = heap.span_mut(span_id);
        span.used_count = span.used_count.saturating_sub(1);
        let now_empty = span.used_count == 0;

        if now_empty {
            // The whole span is going back to the page heap, so there's no
            // need to thread this one last chunk onto the class freelist —
            // any chunk still referenced there for this span would dangle.
            heap.span_mut(span_id).size_class = -1;
            heap.deallocate_span(span_id);
        } else {
            let global_offset = heap.span(span_id).base_offset() + offset_in_span;
            let old_head = self.region().chunk_freelist_heads[class];
            Self::write_next(block_mgr, block, global_offset, old_head);
            self.region_mut().chunk_freelist_heads[class] = global_offset as i64;
        }
    }

    pub fn mark_allocated(&mut self, heap: &mut PageHeap, span_id: SpanId) {
        heap.span_mut(span_id).used_count += 1;
    }
}
