//! The Book: free-space bookkeeping for one Region.
//!
//! A buddy scheme over blocks of `granule << order` bytes, tracked entirely in a header placed at the front of the
//! Region: one free-bitmap per order, plus one marker byte per granule recording where live allocations start, at
//! which order, and which starts have been tombstoned. The marker array doubles as the liveness index backing the
//! provenance queries.
//!
//! All offsets are relative to the start of the tracked capacity, which follows the header in the Region.

use core::ptr;

use crate::utils::PowerOf2;

//  Marker values; anything below DEAD is the order of a live allocation starting at that granule.
const FREE: u8 = 0xFF;
const DEAD: u8 = 0xFE;

/// Buddy bookkeeping for `granule << max_order` bytes of capacity.
pub(crate) struct Book {
    //  One byte per granule: FREE, DEAD, or the order of the live block starting there.
    markers: *mut u8,
    //  Free bitmaps, order 0 first, one bit per block of that order.
    bitmaps: *mut u8,
    granule: PowerOf2,
    max_order: u32,
}

impl Book {
    /// Returns the number of header bytes required to track `capacity` bytes of `granule`-sized blocks.
    ///
    /// `capacity` must be `granule << order` for some order.
    pub(crate) fn header_len(granule: PowerOf2, capacity: usize) -> usize {
        let blocks = capacity / granule;
        debug_assert!(blocks.is_power_of_two(), "{} blocks", blocks);

        let max_order = blocks.trailing_zeros();

        blocks + bitmaps_len(blocks, max_order)
    }

    /// Sets up bookkeeping in `header`, with every byte of capacity free.
    ///
    /// #   Safety
    ///
    /// -   Assumes `header` points to at least `header_len(granule, capacity)` writable bytes.
    /// -   Assumes `header` remains valid, and unaliased, for the lifetime of the Book.
    pub(crate) unsafe fn new(header: *mut u8, granule: PowerOf2, capacity: usize) -> Book {
        let blocks = capacity / granule;
        debug_assert!(blocks.is_power_of_two(), "{} blocks", blocks);

        let max_order = blocks.trailing_zeros();
        debug_assert!(max_order < DEAD as u32);

        let markers = header;
        let bitmaps = header.add(blocks);

        ptr::write_bytes(markers, FREE, blocks);
        ptr::write_bytes(bitmaps, 0, bitmaps_len(blocks, max_order));

        let mut book = Book { markers, bitmaps, granule, max_order };

        //  A single free block covering the whole capacity.
        book.set_free(max_order, 0);

        book
    }

    /// Returns the number of bytes tracked.
    pub(crate) fn capacity(&self) -> usize { self.granule * (1usize << self.max_order) }

    /// Allocates a block of at least `size` bytes, splitting larger blocks as needed.
    ///
    /// Returns the offset and actual length of the block, or None if no block fits.
    pub(crate) fn allocate(&mut self, size: usize) -> Option<(usize, usize)> {
        let target = self.order_for(size)?;

        let (mut order, mut block) = self.first_free_at_least(target)?;

        self.clear_free(order, block);

        while order > target {
            order -= 1;
            block <<= 1;

            //  The right buddy stays free; the left half keeps being split.
            self.set_free(order, block + 1);
        }

        self.write_marker(block << target, target as u8);

        Some((self.granule * (block << target), self.granule * (1usize << target)))
    }

    /// Allocates a block of exactly the order fitting `size`, without splitting anything.
    ///
    /// This is the laundering discipline: only a spot where a same-size block previously lived (or an exactly-sized
    /// fresh Region) can satisfy the request.
    pub(crate) fn allocate_exact(&mut self, size: usize) -> Option<(usize, usize)> {
        let target = self.order_for(size)?;

        let block = self.first_free(target)?;

        self.clear_free(target, block);
        self.write_marker(block << target, target as u8);

        Some((self.granule * (block << target), self.granule * (1usize << target)))
    }

    /// Frees the live block starting at `offset`, merging buddies as far as possible.
    ///
    /// Returns the length of the freed block, or None if `offset` is not a live block start.
    pub(crate) fn deallocate(&mut self, offset: usize) -> Option<usize> {
        let (index, order) = self.live_start(offset)?;

        self.write_marker(index, FREE);

        let len = self.granule * (1usize << order);

        let mut merge_order = order;
        let mut block = index >> order;

        while merge_order < self.max_order {
            let buddy = block ^ 1;

            if !self.is_free(merge_order, buddy) {
                break;
            }

            self.clear_free(merge_order, buddy);

            block >>= 1;
            merge_order += 1;
        }

        self.set_free(merge_order, block);

        Some(len)
    }

    /// Tombstones the live block starting at `offset`: dead, and never handed out again until the Book is rebuilt.
    ///
    /// Returns the length of the block, or None if `offset` is not a live block start.
    pub(crate) fn tombstone(&mut self, offset: usize) -> Option<usize> {
        let (index, order) = self.live_start(offset)?;

        self.write_marker(index, DEAD);

        Some(self.granule * (1usize << order))
    }

    /// Returns the length of the live block starting at `offset`, if any.
    pub(crate) fn block_len(&self, offset: usize) -> Option<usize> {
        let (_, order) = self.live_start(offset)?;

        Some(self.granule * (1usize << order))
    }

    /// Returns whether a live block starts at `offset`.
    pub(crate) fn is_live(&self, offset: usize) -> bool { self.live_start(offset).is_some() }

    //  Internal; smallest order whose blocks hold `size` bytes, or None if `size` exceeds the capacity.
    fn order_for(&self, size: usize) -> Option<u32> {
        if size == 0 {
            return None;
        }

        let blocks = (size + self.granule.value() - 1) / self.granule;
        let order = PowerOf2::ceil(blocks).log2();

        if order <= self.max_order { Some(order) } else { None }
    }

    //  Internal; (granule index, order) of the live block starting at `offset`.
    fn live_start(&self, offset: usize) -> Option<(usize, u32)> {
        if offset % self.granule != 0 || offset >= self.capacity() {
            return None;
        }

        let index = offset / self.granule;
        let marker = self.read_marker(index);

        if marker < DEAD { Some((index, marker as u32)) } else { None }
    }

    //
    //  Bitmap plumbing.
    //

    fn first_free_at_least(&self, target: u32) -> Option<(u32, usize)> {
        for order in target..=self.max_order {
            if let Some(block) = self.first_free(order) {
                return Some((order, block));
            }
        }

        None
    }

    fn first_free(&self, order: u32) -> Option<usize> {
        let bytes = bitmap_bytes(self.blocks_at(order));

        for byte_index in 0..bytes {
            //  Safety:
            //  -   In bounds of the bitmap of `order`, per `bitmap_bytes`.
            let byte = unsafe { *self.bitmap(order).add(byte_index) };

            if byte != 0 {
                let block = byte_index * 8 + byte.trailing_zeros() as usize;

                debug_assert!(block < self.blocks_at(order));

                return Some(block);
            }
        }

        None
    }

    fn is_free(&self, order: u32, block: usize) -> bool {
        debug_assert!(block < self.blocks_at(order));

        //  Safety:
        //  -   In bounds, as per the debug assertion.
        let byte = unsafe { *self.bitmap(order).add(block / 8) };

        byte & (1u8 << (block % 8)) != 0
    }

    fn set_free(&mut self, order: u32, block: usize) {
        debug_assert!(block < self.blocks_at(order));
        debug_assert!(!self.is_free(order, block));

        //  Safety:
        //  -   In bounds, as per the debug assertion.
        unsafe { *self.bitmap(order).add(block / 8) |= 1u8 << (block % 8) };
    }

    fn clear_free(&mut self, order: u32, block: usize) {
        debug_assert!(self.is_free(order, block));

        //  Safety:
        //  -   In bounds, as `is_free` checked.
        unsafe { *self.bitmap(order).add(block / 8) &= !(1u8 << (block % 8)) };
    }

    fn bitmap(&self, order: u32) -> *mut u8 {
        let mut offset = 0;

        for o in 0..order {
            offset += bitmap_bytes(self.blocks_at(o));
        }

        //  Safety:
        //  -   In bounds of the bitmaps area, as per `bitmaps_len`.
        unsafe { self.bitmaps.add(offset) }
    }

    fn blocks_at(&self, order: u32) -> usize { (1usize << self.max_order) >> order }

    fn read_marker(&self, index: usize) -> u8 {
        debug_assert!(index < (1usize << self.max_order));

        //  Safety:
        //  -   In bounds of the marker area, as per the debug assertion.
        unsafe { *self.markers.add(index) }
    }

    fn write_marker(&mut self, index: usize, value: u8) {
        debug_assert!(index < (1usize << self.max_order));

        //  Safety:
        //  -   In bounds of the marker area, as per the debug assertion.
        unsafe { *self.markers.add(index) = value };
    }
}

fn bitmap_bytes(blocks: usize) -> usize { (blocks + 7) / 8 }

fn bitmaps_len(blocks: usize, max_order: u32) -> usize {
    (0..=max_order).map(|o| bitmap_bytes(blocks >> o)).sum()
}

#[cfg(test)]
mod tests {

use super::*;

const GRANULE: usize = 64;
const CAPACITY: usize = 1024;

struct Fixture {
    header: [u8; 64],
}

impl Fixture {
    fn new() -> Fixture {
        let header = [0u8; 64];
        assert!(Book::header_len(granule(), CAPACITY) <= header.len());

        Fixture { header }
    }

    fn book(&mut self) -> Book {
        //  Safety:
        //  -   `header` is large enough, as asserted in `new`.
        unsafe { Book::new(self.header.as_mut_ptr(), granule(), CAPACITY) }
    }
}

fn granule() -> PowerOf2 { PowerOf2::new(GRANULE).expect("Power of 2") }

#[test]
fn book_allocate_splits() {
    let mut fixture = Fixture::new();
    let mut book = fixture.book();

    //  First fit carves the lowest offset out of the single top block.
    assert_eq!(Some((0, 64)), book.allocate(64));
    assert_eq!(Some((64, 64)), book.allocate(1));
    assert_eq!(Some((128, 128)), book.allocate(100));
    assert_eq!(Some((256, 256)), book.allocate(200));
    assert_eq!(Some((512, 512)), book.allocate(512));

    //  Capacity exhausted.
    assert_eq!(None, book.allocate(64));
}

#[test]
fn book_allocate_rounds_to_block() {
    let mut fixture = Fixture::new();
    let mut book = fixture.book();

    //  65 bytes need a 128-byte block.
    assert_eq!(Some((0, 128)), book.allocate(65));
    assert_eq!(None, book.allocate(CAPACITY));
}

#[test]
fn book_allocate_oversized() {
    let mut fixture = Fixture::new();
    let mut book = fixture.book();

    assert_eq!(None, book.allocate(CAPACITY + 1));
    assert_eq!(None, book.allocate(0));

    //  The whole capacity in one block still works.
    assert_eq!(Some((0, CAPACITY)), book.allocate(CAPACITY));
}

#[test]
fn book_deallocate_merges() {
    let mut fixture = Fixture::new();
    let mut book = fixture.book();

    let (a, _) = book.allocate(64).expect("block");
    let (b, _) = book.allocate(64).expect("block");

    assert_eq!(Some(64), book.deallocate(a));
    assert_eq!(Some(64), book.deallocate(b));

    //  Both buddies merged all the way back up: the full capacity is one block again.
    assert_eq!(Some((0, CAPACITY)), book.allocate(CAPACITY));
}

#[test]
fn book_deallocate_rejects_non_starts() {
    let mut fixture = Fixture::new();
    let mut book = fixture.book();

    let (offset, len) = book.allocate(256).expect("block");
    assert_eq!(256, len);

    //  Interior, unaligned, and out-of-range offsets are all rejected.
    assert_eq!(None, book.deallocate(offset + GRANULE));
    assert_eq!(None, book.deallocate(offset + 1));
    assert_eq!(None, book.deallocate(CAPACITY));

    //  Double-free is rejected too.
    assert_eq!(Some(256), book.deallocate(offset));
    assert_eq!(None, book.deallocate(offset));
}

#[test]
fn book_tombstone_never_reused() {
    let mut fixture = Fixture::new();
    let mut book = fixture.book();

    let (a, _) = book.allocate(512).expect("block");
    let (b, _) = book.allocate(512).expect("block");

    assert_eq!(Some(512), book.tombstone(a));

    //  The tombstoned half is dead; only live blocks can be freed, and the space is not handed out again.
    assert_eq!(None, book.deallocate(a));
    assert_eq!(Some(512), book.deallocate(b));
    assert_eq!(Some((b, 512)), book.allocate(512));
    assert_eq!(None, book.allocate(512));
}

#[test]
fn book_exact_fit_only() {
    let mut fixture = Fixture::new();
    let mut book = fixture.book();

    //  A fresh book has a single top-order block: nothing smaller fits exactly.
    assert_eq!(None, book.allocate_exact(64));
    assert_eq!(Some((0, CAPACITY)), book.allocate_exact(CAPACITY));

    assert_eq!(Some(CAPACITY), book.deallocate(0));

    //  Carve a 128-byte hole, free it, and the exact fit finds it again.
    let (offset, _) = book.allocate(128).expect("block");
    let (keeper, _) = book.allocate(128).expect("block");

    assert_eq!(Some(128), book.deallocate(offset));
    assert_eq!(Some((offset, 128)), book.allocate_exact(100));

    let _ = keeper;
}

#[test]
fn book_liveness_queries() {
    let mut fixture = Fixture::new();
    let mut book = fixture.book();

    let (offset, len) = book.allocate(200).expect("block");

    assert!(book.is_live(offset));
    assert_eq!(Some(len), book.block_len(offset));

    assert!(!book.is_live(offset + GRANULE));
    assert_eq!(None, book.block_len(offset + GRANULE));

    assert_eq!(Some(len), book.tombstone(offset));
    assert!(!book.is_live(offset));
}

}
