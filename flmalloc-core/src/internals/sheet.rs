//! The Sheet: one kernel Region and its Book.
//!
//! A Sheet owns exactly one mapped Region. The front of the Region holds the Book header; the rest is the capacity
//! handed out to callers. Guard Sheets are the exception: a single inaccessible page, never allocated from, only
//! there to turn an overrun into a fault.

use core::ptr::NonNull;

use crate::api::{Advice, KernelProvider, Protection, Span};
use crate::internals::book::Book;
use crate::utils::PowerOf2;

pub(crate) struct Sheet {
    base: NonNull<u8>,
    region_len: usize,
    //  None for guard Sheets.
    book: Option<Book>,
    payload: *mut u8,
    used: usize,
    dead: usize,
}

impl Sheet {
    /// Creates a Sheet over a freshly mapped Region.
    ///
    /// The Region is `header_len` bytes of Book header followed by `region_len - header_len` bytes of capacity,
    /// which must be `granule << order` for some order.
    ///
    /// #   Panics
    ///
    /// If the Region or its capacity is empty; such a Sheet could never satisfy anything, which is a construction
    /// error, not a runtime condition.
    ///
    /// #   Safety
    ///
    /// -   Assumes `[base, base + region_len)` is mapped, writable, and exclusively owned by this Sheet.
    pub(crate) unsafe fn new(base: NonNull<u8>, region_len: usize, header_len: usize, granule: PowerOf2) -> Sheet {
        assert!(region_len > header_len, "Sheet over an empty Region: {} <= {}", region_len, header_len);

        let capacity = region_len - header_len;
        let payload = base.as_ptr().add(header_len);

        let book = Book::new(base.as_ptr(), granule, capacity);

        Sheet { base, region_len, book: Some(book), payload, used: 0, dead: 0 }
    }

    /// Creates a guard Sheet over an inaccessible Region.
    ///
    /// #   Safety
    ///
    /// -   Assumes `[base, base + region_len)` is mapped and exclusively owned by this Sheet.
    pub(crate) unsafe fn guard(base: NonNull<u8>, region_len: usize) -> Sheet {
        assert!(region_len > 0, "Guard Sheet over an empty Region");

        Sheet { base, region_len, book: None, payload: base.as_ptr(), used: 0, dead: 0 }
    }

    /// Returns whether this is a guard Sheet.
    pub(crate) fn is_guard(&self) -> bool { self.book.is_none() }

    /// Returns the number of live bytes handed out.
    pub(crate) fn used(&self) -> usize { self.used }

    /// Returns the number of tombstoned bytes.
    pub(crate) fn dead(&self) -> usize { self.dead }

    /// Returns the number of bytes the Sheet can hand out in total.
    pub(crate) fn capacity(&self) -> usize {
        self.book.as_ref().map(|book| book.capacity()).unwrap_or(0)
    }

    /// Returns the whole Region as a span.
    pub(crate) fn region(&self) -> Span { Span::new(self.base.as_ptr(), self.region_len) }

    /// Hands out a span of at least `size` bytes, or the empty span.
    pub(crate) fn mark(&mut self, size: usize) -> Span {
        let payload = self.payload;

        let book = match self.book.as_mut() {
            Some(book) => book,
            None => return Span::EMPTY,
        };

        match book.allocate(size) {
            Some((offset, len)) => {
                self.used += len;

                //  Safety:
                //  -   `offset + len <= capacity`, as guaranteed by the Book.
                Span::new(unsafe { payload.add(offset) }, len)
            },
            None => Span::EMPTY,
        }
    }

    /// Hands out a span of at least `size` bytes, like `mark`, with two differences: calling it on a Sheet with no
    /// capacity aborts, and exhaustion returns the failure sentinel rather than the empty span.
    ///
    /// Callers that reach for this variant want "this Sheet is exhausted" and "this Sheet is broken" kept apart.
    pub(crate) fn try_mark(&mut self, size: usize) -> Span {
        assert!(self.capacity() > 0, "try_mark on a Sheet with no capacity");

        let span = self.mark(size);

        if span.is_empty() { Span::FAILURE } else { span }
    }

    /// Hands out a span by exact fit only; no block is split on its behalf.
    pub(crate) fn mark_exact(&mut self, size: usize) -> Span {
        let payload = self.payload;

        let book = match self.book.as_mut() {
            Some(book) => book,
            None => return Span::EMPTY,
        };

        match book.allocate_exact(size) {
            Some((offset, len)) => {
                self.used += len;

                //  Safety:
                //  -   `offset + len <= capacity`, as guaranteed by the Book.
                Span::new(unsafe { payload.add(offset) }, len)
            },
            None => Span::EMPTY,
        }
    }

    /// Returns the span starting at `ptr` to the free pool. Returns its length, or None if `ptr` is not a live
    /// allocation start within this Sheet.
    pub(crate) fn try_unmark(&mut self, ptr: *mut u8) -> Option<usize> {
        let offset = self.offset_of(ptr)?;

        let len = self.book.as_mut()?.deallocate(offset)?;
        self.used -= len;

        Some(len)
    }

    /// Tombstones the span starting at `ptr`: dead bytes, never handed out again while the Sheet lives.
    pub(crate) fn try_tombstone(&mut self, ptr: *mut u8) -> Option<usize> {
        let offset = self.offset_of(ptr)?;

        let len = self.book.as_mut()?.tombstone(offset)?;
        self.used -= len;
        self.dead += len;

        Some(len)
    }

    /// Returns whether `ptr` lies within the Sheet's capacity.
    pub(crate) fn is_at(&self, ptr: *mut u8) -> bool { self.offset_of(ptr).is_some() }

    /// Returns the live span starting at `ptr`, if any.
    pub(crate) fn find(&self, ptr: *mut u8) -> Option<Span> {
        let offset = self.offset_of(ptr)?;
        let len = self.book.as_ref()?.block_len(offset)?;

        Some(Span::new(ptr, len))
    }

    /// Changes the protection of the whole Region.
    pub(crate) fn freeze<P>(&self, provider: &P, protection: Protection) -> bool
        where
            P: KernelProvider,
    {
        //  Safety:
        //  -   The Region is mapped and owned by this Sheet.
        unsafe { provider.protect(self.base, self.region_len, protection) }
    }

    /// Forwards a usage hint for the whole Region.
    pub(crate) fn advise<P>(&self, provider: &P, advice: Advice) -> bool
        where
            P: KernelProvider,
    {
        //  Safety:
        //  -   The Region is mapped and owned by this Sheet.
        unsafe { provider.advise(self.base, self.region_len, advice) }
    }

    /// Unmaps the Region; every allocation within it dies at once.
    ///
    /// #   Safety
    ///
    /// -   Assumes no pointer into the Region is used afterwards; nothing checks.
    pub(crate) unsafe fn reset<P>(&mut self, provider: &P)
        where
            P: KernelProvider,
    {
        provider.unmap(self.base, self.region_len);

        self.book = None;
        self.payload = self.base.as_ptr();
        self.region_len = 0;
        self.used = 0;
        self.dead = 0;
    }

    //  Internal; byte offset of `ptr` within the capacity, if it lies there.
    fn offset_of(&self, ptr: *mut u8) -> Option<usize> {
        let capacity = self.capacity();

        if capacity == 0 {
            return None;
        }

        let start = self.payload as usize;
        let candidate = ptr as usize;

        if candidate >= start && candidate < start + capacity {
            Some(candidate - start)
        } else {
            None
        }
    }
}
