//! Size-class allocator
//!
//! Small blocks are power-of-two classes (16 bytes up to
//! `LARGE_ALLOC_THRESHOLD`) carved from one arena mapped on first use; freed
//! blocks go onto a per-class list and are reused. Anything bigger, or
//! anything that no longer fits in the arena, gets its own mapping and is
//! unmapped on free.

use bridge_runtime::{HEAP_SIZE, LARGE_ALLOC_THRESHOLD};
use bridge_syscall as sys;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

const MIN_CLASS_SHIFT: u32 = 4;
const CLASS_COUNT: usize = (LARGE_ALLOC_THRESHOLD.trailing_zeros() - MIN_CLASS_SHIFT + 1) as usize;
const PAGE: usize = 4096;

struct FreeBlock {
    next: *mut FreeBlock,
}

struct Arena {
    start: usize,
    cur: usize,
    end: usize,
    free: [*mut FreeBlock; CLASS_COUNT],
}

// Raw pointers into our own mapping; access is serialized by the mutex.
unsafe impl Send for Arena {}

pub struct BridgeAllocator {
    arena: spin::Mutex<Arena>,
}

impl BridgeAllocator {
    pub const fn new() -> Self {
        BridgeAllocator {
            arena: spin::Mutex::new(Arena {
                start: 0,
                cur: 0,
                end: 0,
                free: [ptr::null_mut(); CLASS_COUNT],
            }),
        }
    }
}

fn class_of(layout: &Layout) -> Option<usize> {
    let size = layout.size().max(layout.align()).max(1 << MIN_CLASS_SHIFT);
    if size > LARGE_ALLOC_THRESHOLD {
        return None;
    }
    Some((size.next_power_of_two().trailing_zeros() - MIN_CLASS_SHIFT) as usize)
}

fn class_size(class: usize) -> usize {
    1 << (class as u32 + MIN_CLASS_SHIFT)
}

fn page_round(size: usize) -> Option<usize> {
    size.checked_add(PAGE - 1).map(|s| s & !(PAGE - 1))
}

impl Arena {
    fn contains(&self, p: *mut u8) -> bool {
        let addr = p as usize;
        self.start != 0 && addr >= self.start && addr < self.end
    }

    fn take(&mut self, class: usize) -> *mut u8 {
        let head = self.free[class];
        if !head.is_null() {
            // SAFETY: every list entry is a freed block of this class inside the arena.
            self.free[class] = unsafe { (*head).next };
            return head.cast();
        }

        if self.start == 0 {
            let base = sys::mmap(0, HEAP_SIZE, sys::PROT_RW, sys::MAP_PRIVATE_ANON);
            if base.is_null() {
                return ptr::null_mut();
            }
            self.start = base as usize;
            self.cur = self.start;
            self.end = self.start + HEAP_SIZE;
        }

        let size = class_size(class);
        let aligned = (self.cur + size - 1) & !(size - 1);
        match aligned.checked_add(size) {
            Some(next) if next <= self.end => {
                self.cur = next;
                aligned as *mut u8
            }
            _ => ptr::null_mut(),
        }
    }

    fn give_back(&mut self, p: *mut u8, class: usize) {
        let block = p.cast::<FreeBlock>();
        // SAFETY: `p` came from `take` for this class and is at least 16 bytes.
        unsafe { (*block).next = self.free[class] };
        self.free[class] = block;
    }
}

fn map_large(size: usize, align: usize) -> *mut u8 {
    if align > PAGE {
        return ptr::null_mut();
    }
    match page_round(size) {
        Some(len) => sys::mmap(0, len, sys::PROT_RW, sys::MAP_PRIVATE_ANON),
        None => ptr::null_mut(),
    }
}

unsafe impl GlobalAlloc for BridgeAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if let Some(class) = class_of(&layout) {
            let p = self.arena.lock().take(class);
            if !p.is_null() {
                return p;
            }
        }
        map_large(layout.size(), layout.align())
    }

    unsafe fn dealloc(&self, p: *mut u8, layout: Layout) {
        let mut arena = self.arena.lock();
        if arena.contains(p) {
            if let Some(class) = class_of(&layout) {
                arena.give_back(p, class);
            }
            return;
        }
        drop(arena);
        if let Some(len) = page_round(layout.size()) {
            // SAFETY: outside the arena, so `p` is a mapping from `map_large`.
            let _ = unsafe { sys::munmap(p, len) };
        }
    }
}
