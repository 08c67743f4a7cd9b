// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Owns all span bookkeeping: size-indexed freelists, a large-run freelist,
// and the page-map. Port of shm_mgr.cpp's page-heap half (`__malloc_from_heap`
// neighbor search, `mem_chunk` bookkeeping).
//
// Spans, freelists and the page-map live in the metadata region itself
// (see `metadata.rs`) rather than process-local collections: shm_mgr.cpp's
// `page_heap_` is placement-new'd directly into the METADATA block and
// `on_resume` rebinds the same pointer without re-initializing it
// (src/shm/detail/shm_mgr.cpp:29-99), so a process that resumes after a
// crash sees the exact span layout the last writer left behind. Freelists
// and the vacant-slot list are singly linked through each `SpanRaw`'s own
// `link_next` field rather than a separate `Vec`, for the same reason —
// see SPEC_FULL.md 4.E and DESIGN.md.

use crate::alloc::block_manager::BlockManager;
use crate::alloc::metadata::{MetadataRegion, SpanRaw, BLOCK_RESERVE_PAGES, EMPTY_SPAN, MAX_SPANS, SPAN_FREE, SPAN_IN_USE, SPAN_VACANT};
use crate::alloc::size_class::{MAX_PAGES, PAGE_SIZE};
use crate::error::{BusError, BusResult};

pub type SpanId = usize;

const MIN_HEAP_GROW_PAGES: u64 = 64;

impl SpanRaw {
    pub fn base_offset(&self) -> u64 {
        self.start_page * PAGE_SIZE
    }

    pub fn byte_len(&self) -> u64 {
        self.page_count * PAGE_SIZE
    }
}

/// A handle to the span arena, freelists and page-map inside a bound
/// `MetadataRegion`. Cheap to copy; every method re-derefs `region`.
pub struct PageHeap {
    region: *mut MetadataRegion,
}

unsafe impl Send for PageHeap {}

impl PageHeap {
    /// Bind to an already-initialized region (fresh from `metadata::create`
    /// or rebound via `metadata::bind`).
    pub fn bind(region: *mut MetadataRegion) -> Self {
        PageHeap { region }
    }

    fn region(&self) -> &MetadataRegion {
        unsafe { &*self.region }
    }

    fn region_mut(&mut self) -> &mut MetadataRegion {
        unsafe { &mut *self.region }
    }

    fn alloc_span_slot(&mut self, span: SpanRaw) -> BusResult<SpanId> {
        let r = self.region_mut();
        if r.vacant_head != -1 {
            let id = r.vacant_head as usize;
            r.vacant_head = r.spans[id].link_next;
            r.spans[id] = span;
            return Ok(id);
        }
        let id = r.span_hwm as usize;
        if id >= MAX_SPANS {
            return Err(BusError::OutOfMemory);
        }
        r.span_hwm += 1;
        r.spans[id] = span;
        Ok(id)
    }

    fn make_vacant(&mut self, id: SpanId) {
        let r = self.region_mut();
        let old_head = r.vacant_head;
        r.spans[id] = EMPTY_SPAN;
        r.spans[id].state = SPAN_VACANT;
        r.spans[id].link_next = old_head;
        r.vacant_head = id as i32;
    }

    pub fn span(&self, id: SpanId) -> &SpanRaw {
        &self.region().spans[id]
    }

    pub fn span_mut(&mut self, id: SpanId) -> &mut SpanRaw {
        &mut self.region_mut().spans[id]
    }

    pub fn find_span(&self, block: u8, offset: u64) -> Option<SpanId> {
        let page = offset / PAGE_SIZE;
        if page as usize >= BLOCK_RESERVE_PAGES {
            return None;
        }
        self.region().page_map_get(block, page)
    }

    /// Fill the page-map for every page of an in-use span.
    pub fn register_span(&mut self, id: SpanId) {
        let (block, start, count) = {
            let s = self.span(id);
            (s.block, s.start_page, s.page_count)
        };
        for p in start..start + count {
            if (p as usize) < BLOCK_RESERVE_PAGES {
                self.region_mut().page_map_set(block, p, Some(id));
            }
        }
    }

    fn register_span_endpoints(&mut self, id: SpanId) {
        let (block, start, count) = {
            let s = self.span(id);
            (s.block, s.start_page, s.page_count)
        };
        if (start as usize) < BLOCK_RESERVE_PAGES {
            self.region_mut().page_map_set(block, start, Some(id));
        }
        let last = start + count - 1;
        if (last as usize) < BLOCK_RESERVE_PAGES {
            self.region_mut().page_map_set(block, last, Some(id));
        }
    }

    fn link_free(&mut self, id: SpanId) {
        let page_count = self.span(id).page_count;
        let new_head = id as i32;
        if (page_count as usize) < MAX_PAGES {
            let idx = page_count as usize;
            let old = self.region().span_freelist_heads[idx];
            self.span_mut(id).link_next = old;
            self.region_mut().span_freelist_heads[idx] = new_head;
        } else {
            let old = self.region().large_list_head;
            self.span_mut(id).link_next = old;
            self.region_mut().large_list_head = new_head;
        }
    }

    /// Remove `id` from whichever freelist its current `page_count` says
    /// it's on, by walking that singly linked list.
    fn unlink_free(&mut self, id: SpanId) {
        let page_count = self.span(id).page_count;
        let small = (page_count as usize) < MAX_PAGES;
        let mut cur = if small { self.region().span_freelist_heads[page_count as usize] } else { self.region().large_list_head };
        let mut prev: i32 = -1;

        while cur != -1 {
            if cur as usize == id {
                let next = self.span(id).link_next;
                if prev == -1 {
                    if small {
                        self.region_mut().span_freelist_heads[page_count as usize] = next;
                    } else {
                        self.region_mut().large_list_head = next;
                    }
                } else {
                    self.span_mut(prev as usize).link_next = next;
                }
                self.span_mut(id).link_next = -1;
                return;
            }
            prev = cur;
            cur = self.span(cur as usize).link_next;
        }
    }

    /// Find and remove a free span with at least `n` pages; splits the tail
    /// back into the heap if it's larger than needed.
    fn take_free_span(&mut self, n: u64) -> Option<SpanId> {
        for pages in n as usize..MAX_PAGES {
            let head = self.region().span_freelist_heads[pages];
            if head != -1 {
                let id = head as usize;
                self.unlink_free(id);
                return self.split_if_needed(id, n).ok();
            }
        }

        // Best-fit over the large list: smallest page_count, then smallest
        // block, then smallest start_page — deterministic across runs.
        let mut cur = self.region().large_list_head;
        let mut best: Option<SpanId> = None;
        while cur != -1 {
            let id = cur as usize;
            let s = self.span(id);
            if s.page_count >= n {
                let better = match best {
                    None => true,
                    Some(bid) => {
                        let b = self.span(bid);
                        (s.page_count, s.block, s.start_page) < (b.page_count, b.block, b.start_page)
                    }
                };
                if better {
                    best = Some(id);
                }
            }
            cur = self.span(id).link_next;
        }

        best.and_then(|id| {
            self.unlink_free(id);
            self.split_if_needed(id, n).ok()
        })
    }

    fn split_if_needed(&mut self, id: SpanId, n: u64) -> BusResult<SpanId> {
        let span = *self.span(id);
        if span.page_count > n {
            let tail = SpanRaw::new(span.block, SPAN_FREE, -1, span.start_page + n, span.page_count - n, 0);
            let tail_id = self.alloc_span_slot(tail)?;
            self.register_span_endpoints(tail_id);
            self.link_free(tail_id);
            self.span_mut(id).page_count = n;
        }
        Ok(id)
    }

    /// Allocate a run of at least `n` pages on `block`, growing the backing
    /// file via `block_mgr` if no freelist has room.
    pub fn allocate_span(&mut self, block: u8, n: u64, block_mgr: &mut BlockManager) -> BusResult<SpanId> {
        if let Some(id) = self.take_free_span(n) {
            self.span_mut(id).state = SPAN_IN_USE;
            self.register_span(id);
            return Ok(id);
        }

        let grow_pages = n.max(MIN_HEAP_GROW_PAGES);
        let addr = block_mgr
            .sbrk(block, grow_pages * PAGE_SIZE)
            .map_err(|e| BusError::FatalInit(format!("page heap growth failed: {e}")))?;
        let start_page = addr.offset() / PAGE_SIZE;

        let fresh = SpanRaw::new(block, SPAN_FREE, -1, start_page, grow_pages, 0);
        let id = self.alloc_span_slot(fresh)?;
        self.register_span_endpoints(id);
        self.link_free(id);

        let id = self.take_free_span(n).ok_or(BusError::OutOfMemory)?;
        self.span_mut(id).state = SPAN_IN_USE;
        self.register_span(id);
        Ok(id)
    }

    /// Return a span to the heap, coalescing with free neighbors.
    pub fn deallocate_span(&mut self, mut id: SpanId) {
        {
            let s = self.span_mut(id);
            s.state = SPAN_FREE;
            s.size_class = -1;
            s.used_count = 0;
        }

        let (block, start_page, mut page_count) = {
            let s = self.span(id);
            (s.block, s.start_page, s.page_count)
        };

        if start_page > 0 {
            if let Some(left_id) = self.find_span(block, (start_page - 1) * PAGE_SIZE) {
                if self.span(left_id).state == SPAN_FREE {
                    let left_start = self.span(left_id).start_page;
                    let left_pages = self.span(left_id).page_count;
                    self.unlink_free(left_id);
                    self.make_vacant(id);
                    page_count += left_pages;
                    id = left_id;
                    let s = self.span_mut(id);
                    s.start_page = left_start;
                    s.page_count = page_count;
                }
            }
        }

        let right_page = self.span(id).start_page + self.span(id).page_count;
        if let Some(right_id) = self.find_span(block, right_page * PAGE_SIZE) {
            if self.span(right_id).state == SPAN_FREE {
                let right_pages = self.span(right_id).page_count;
                self.unlink_free(right_id);
                self.make_vacant(right_id);
                self.span_mut(id).page_count += right_pages;
            }
        }

        self.register_span_endpoints(id);
        self.link_free(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::block_manager::METADATA_BLOCK;
    use crate::alloc::size_class::{SizeClassTable, PAGE_SIZE};

    fn test_heap(tag: &str) -> (BlockManager, PageHeap) {
        let basename = format!("shmbus-test-pageheap-{tag}-{}", std::process::id());
        let mut bm = BlockManager::create(&basename, PAGE_SIZE, PAGE_SIZE * 4096, PAGE_SIZE, PAGE_SIZE).unwrap();
        let table = SizeClassTable::new();
        let region = crate::alloc::metadata::create(&mut bm, &table).unwrap();
        (bm, PageHeap::bind(region))
    }

    #[test]
    fn allocate_then_deallocate_returns_span_to_heap() {
        let (mut bm, mut heap) = test_heap("1");
        let span_id = heap.allocate_span(METADATA_BLOCK, 4, &mut bm).unwrap();
        assert_eq!(heap.span(span_id).page_count, 4);
        heap.deallocate_span(span_id);
        let span_id2 = heap.allocate_span(METADATA_BLOCK, 4, &mut bm).unwrap();
        // Reused the same freed region rather than growing again.
        assert_eq!(heap.span(span_id2).start_page, heap.span(span_id).start_page);
        bm.unlink();
    }

    #[test]
    fn coalesces_adjacent_free_spans() {
        let (mut bm, mut heap) = test_heap("2");
        let a = heap.allocate_span(METADATA_BLOCK, 4, &mut bm).unwrap();
        let b = heap.allocate_span(METADATA_BLOCK, 4, &mut bm).unwrap();
        assert_eq!(heap.span(b).start_page, heap.span(a).start_page + 4);
        heap.deallocate_span(a);
        heap.deallocate_span(b);
        let big = heap.allocate_span(METADATA_BLOCK, 8, &mut bm).unwrap();
        assert_eq!(heap.span(big).page_count, 8);
        bm.unlink();
    }

    #[test]
    fn span_bookkeeping_survives_a_rebind() {
        let basename = format!("shmbus-test-pageheap-resume-{}", std::process::id());
        let table = SizeClassTable::new();

        let (start_page, span_count) = {
            let mut bm = BlockManager::create(&basename, PAGE_SIZE, PAGE_SIZE * 4096, PAGE_SIZE, PAGE_SIZE).unwrap();
            let region = crate::alloc::metadata::create(&mut bm, &table).unwrap();
            let mut heap = PageHeap::bind(region);
            let a = heap.allocate_span(METADATA_BLOCK, 4, &mut bm).unwrap();
            let b = heap.allocate_span(METADATA_BLOCK, 4, &mut bm).unwrap();
            heap.deallocate_span(b);
            (heap.span(a).start_page, unsafe { (*region).span_hwm })
        };

        let bm = BlockManager::attach(&basename, PAGE_SIZE * 4096, PAGE_SIZE).unwrap();
        let region = crate::alloc::metadata::bind(&bm, &table).unwrap();
        let heap = PageHeap::bind(region);
        // The in-use span from before the rebind is still registered in
        // the page-map at the same start page.
        let found = heap.find_span(METADATA_BLOCK, start_page * PAGE_SIZE).unwrap();
        assert_eq!(heap.span(found).start_page, start_page);
        assert_eq!(unsafe { (*region).span_hwm }, span_count);
        bm.unlink();
    }
}
