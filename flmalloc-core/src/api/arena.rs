//! The Arena: the allocator engine.
//!
//! An Arena owns six Bucket Chains: a dedicated cache chain for the smallest objects, and one chain per size class
//! up to Huge; gigabyte-scale requests are served out of the Huge chain, their tier only selecting the growth curve.
//! Sheet and Node bookkeeping is carved out of dedicated metadata Regions, doubled on exhaustion.
//!
//! The Arena is deliberately single-threaded: callers serialize access, whether through a coarse lock around a
//! process-wide instance or by giving each thread an Arena of its own.

use core::cmp;
use core::marker::PhantomData;
use core::ptr;
use core::ptr::NonNull;

use crate::api::{
    bulk_region_size, expected_region_size, Advice, Config, FailurePolicy, KernelProvider, MapError, Policy,
    Protection, SizeClass, Span, Stats,
};
use crate::internals::book::Book;
use crate::internals::chain::{Chain, Node, NodeIndex, NodeStore};
use crate::internals::harden;
use crate::internals::predictor::Predictor;
use crate::internals::sheet::Sheet;
use crate::utils::PowerOf2;

/// The allocator engine; see the crate documentation for the full picture.
pub struct Arena<C, P>
    where
        C: Config,
        P: KernelProvider,
{
    provider: P,
    policy: Policy,
    store: NodeStore,
    chains: [Chain; NUMBER_CHAINS],
    predictor: Predictor,
    stats: Stats,
    _marker: PhantomData<*const C>,
}

impl<C, P> Arena<C, P>
    where
        C: Config,
        P: KernelProvider,
{
    /// Creates an Arena, mapping its first metadata Region, and eagerly provisioning the sub-page chains when the
    /// configuration asks for it. The Large and Huge chains always wait for their first request.
    pub fn new(provider: P, policy: Policy) -> Result<Self, MapError> {
        let metadata = C::ARENA_PAGES * C::PAGE_SIZE.value();

        //  Safety:
        //  -   `metadata` is a page multiple.
        let base = unsafe { provider.map(ptr::null_mut(), metadata, Protection::ReadWrite) }.decode()?;

        //  Safety:
        //  -   The Region was just mapped, and is exclusively ours.
        let store = unsafe { NodeStore::new(base, metadata) };

        let mut arena = Arena {
            provider,
            policy,
            store,
            chains: [Chain::new(), Chain::new(), Chain::new(), Chain::new(), Chain::new(), Chain::new()],
            predictor: Predictor::new(),
            stats: Stats::new(),
            _marker: PhantomData,
        };

        if C::EAGER_INIT {
            for kind in &[ChainKind::Cache, ChainKind::Precise, ChainKind::Small, ChainKind::Medium] {
                let bytes = arena.default_growth(*kind);
                arena.expand(*kind, bytes)?;
            }
        }

        Ok(arena)
    }

    /// Allocates a span of at least `size` bytes.
    ///
    /// Walks the class's chain from its tail; on exhaustion, grows the chain by a curve-and-predictor sized Sheet and
    /// retries, up to `Config::MAX_RETRIES` times. Running out of retries yields [`Span::FAILURE`], never a panic;
    /// callers needing hard failure must check for the sentinel.
    pub fn push(&mut self, size: usize) -> Span {
        if size == 0 {
            return Span::EMPTY;
        }

        if let Some(limit) = C::ALLOC_LIMIT {
            if size > limit {
                self.fail("flmalloc: request exceeds the configured allocation limit");
                return Span::FAILURE;
            }
        }

        if self.policy.oom_check && size > SizeClass::MEDIUM_LIMIT && !self.oom_pre_check() {
            return Span::FAILURE;
        }

        let kind = ChainKind::of(size);

        if kind != ChainKind::Cache {
            self.predictor.record(size);
        }

        let mut attempts = 0;

        loop {
            let span = self.append_from_tail(kind, size);

            if !span.is_empty() {
                return self.admit(size, span);
            }

            if attempts >= C::MAX_RETRIES {
                if self.policy.collect_stats {
                    self.stats.record_alloc(size, 0);
                }

                return Span::FAILURE;
            }

            attempts += 1;

            let growth = self.growth_size(kind, size);

            if self.expand(kind, growth).is_err() {
                self.fail("flmalloc: kernel refused to map a fresh Region");
                return Span::FAILURE;
            }
        }
    }

    /// Allocates a span of at least `size` bytes, handing out only a spot where a same-size block previously lived.
    ///
    /// Trades locality for reduced address churn. Mutually exclusive with tombstoning, which never re-hands out
    /// anything: under a tombstoning policy this returns [`Span::FAILURE`] immediately.
    pub fn launder(&mut self, size: usize) -> Span {
        if size == 0 {
            return Span::EMPTY;
        }

        if self.policy.tombstone {
            return Span::FAILURE;
        }

        if let Some(limit) = C::ALLOC_LIMIT {
            if size > limit {
                self.fail("flmalloc: request exceeds the configured allocation limit");
                return Span::FAILURE;
            }
        }

        let kind = ChainKind::of(size);

        //  The length of the block an exact fit matches.
        let granule = kind.granule();
        let block = granule * PowerOf2::ceil(cmp::max(1, (size + granule.value() - 1) / granule)).value();

        let mut attempts = 0;

        loop {
            //  Oldest first: the point is to find where the same size was handed out before.
            let span = self.exact_from_head(kind, size);

            if !span.is_empty() {
                return self.admit(size, span);
            }

            //  A fresh Region's capacity is floored at one page, so a sub-page block can never be its top block;
            //  mapping one would be pure waste.
            if attempts >= C::MAX_RETRIES || block < C::PAGE_SIZE.value() {
                if self.policy.collect_stats {
                    self.stats.record_alloc(size, 0);
                }

                return Span::FAILURE;
            }

            attempts += 1;

            //  An exactly-sized Region, so that its top block satisfies the exact fit.
            if self.expand(kind, block).is_err() {
                self.fail("flmalloc: kernel refused to map a fresh Region");
                return Span::FAILURE;
            }
        }
    }

    /// Frees the span starting at `ptr`, honoring the deletion policy: recycled under hard-free, dead under
    /// tombstoning.
    ///
    /// Returns whether a span was freed. A pointer this Arena does not own, or one pointing at no live span, returns
    /// `false`; under `enforce_provenance`, it is first handled per the failure policy.
    pub fn pop(&mut self, ptr: *mut u8) -> bool {
        let tombstone = self.policy.tombstone;
        self.remove(ptr, tombstone)
    }

    /// Frees the span starting at `ptr` by tombstoning it, whatever the deletion policy.
    pub fn ts_pop(&mut self, ptr: *mut u8) -> bool { self.remove(ptr, true) }

    /// Makes the whole Region owning `ptr` read-only.
    pub fn freeze(&mut self, ptr: *mut u8) -> bool { self.freeze_with(ptr, Protection::Read) }

    /// Changes the protection of the whole Region owning `ptr`.
    pub fn freeze_with(&mut self, ptr: *mut u8, protection: Protection) -> bool {
        let location = match self.locate(ptr) {
            Some(location) => location,
            None => return self.miss(ptr),
        };

        self.store.get(location.index).sheet.freeze(&self.provider, protection)
    }

    /// Makes the pages covering `[ptr, ptr + len)` read-only, clipped to the owning Region.
    pub fn freeze_span(&mut self, ptr: *mut u8, len: usize) -> bool {
        let location = match self.locate(ptr) {
            Some(location) => location,
            None => return self.miss(ptr),
        };

        let region = self.store.get(location.index).sheet.region();

        let page = C::PAGE_SIZE;
        let start = cmp::max(page.round_down(ptr as usize), region.ptr as usize);
        let end = cmp::min(page.round_up(ptr as usize + len), region.ptr as usize + region.len);

        if start >= end {
            return false;
        }

        //  Safety:
        //  -   `start` is non-null: it lies within the Region.
        let address = unsafe { NonNull::new_unchecked(start as *mut u8) };

        //  Safety:
        //  -   `[start, end)` lies within a Region mapped by this provider.
        unsafe { self.provider.protect(address, end - start, Protection::Read) }
    }

    /// Returns whether a live allocation starts at `ptr`.
    pub fn present(&self, ptr: *mut u8) -> bool {
        self.locate(ptr)
            .map(|location| self.store.get(location.index).sheet.find(ptr).is_some())
            .unwrap_or(false)
    }

    /// Returns whether `ptr` lies within memory this Arena owns.
    pub fn has_provenance(&self, ptr: *mut u8) -> bool { self.locate(ptr).is_some() }

    /// Returns the live span starting at `ptr`, if any.
    pub fn span_of(&self, ptr: *mut u8) -> Option<Span> {
        let location = self.locate(ptr)?;

        self.store.get(location.index).sheet.find(ptr)
    }

    /// Returns the whole Region owning `ptr`, if any.
    pub fn region_of(&self, ptr: *mut u8) -> Option<Span> {
        let location = self.locate(ptr)?;

        Some(self.store.get(location.index).sheet.region())
    }

    /// Unmaps the whole Sheet owning `ptr`, killing every live allocation within it at once.
    ///
    /// A coarse, deliberately dangerous bulk-free primitive: nothing checks for surviving pointers into the Region.
    pub fn relinquish(&mut self, ptr: *mut u8) -> bool {
        let location = match self.locate(ptr) {
            Some(location) => location,
            None => return self.miss(ptr),
        };

        self.reclaim(location);

        true
    }

    /// Returns the sum of live bytes over every Sheet; the sum of the lengths of all live allocations.
    pub fn total_usage(&self) -> usize {
        self.fold_sheets(0, |total, sheet| total + sheet.used())
    }

    /// Returns the sum of Region lengths over every Sheet; never decreasing while chains only grow.
    pub fn total_footprint(&self) -> usize {
        self.fold_sheets(0, |total, sheet| total + sheet.region().len)
    }

    /// Returns the sum of live bytes over the chains serving `class`.
    ///
    /// The cache chain counts toward `Precise`; `Bulk` and `Giant` count toward `Huge`, which serves them.
    pub fn usage_of(&self, class: SizeClass) -> usize {
        let kinds: &[ChainKind] = match class {
            SizeClass::Precise => &[ChainKind::Cache, ChainKind::Precise],
            SizeClass::Small => &[ChainKind::Small],
            SizeClass::Medium => &[ChainKind::Medium],
            SizeClass::Large => &[ChainKind::Large],
            SizeClass::Huge | SizeClass::Bulk | SizeClass::Giant => &[ChainKind::Huge],
        };

        let mut total = 0;

        for kind in kinds {
            let mut cursor = self.chains[kind.index()].head();

            while let Some(index) = cursor {
                let node = self.store.get(index);
                total += node.sheet.used();
                cursor = node.next;
            }
        }

        total
    }

    /// Returns a copy of the counters; all zero unless `Policy::collect_stats` is set.
    pub fn stats(&self) -> Stats { self.stats }

    /// Returns the policy the Arena runs under.
    pub fn policy(&self) -> &Policy { &self.policy }

    /// Returns the provider the Arena maps through.
    pub fn provider(&self) -> &P { &self.provider }

    //
    //  Allocation internals.
    //

    //  Tail-first search: the tail Sheet is the one most likely to have room.
    fn append_from_tail(&mut self, kind: ChainKind, size: usize) -> Span {
        let mut cursor = self.chains[kind.index()].tail();

        while let Some(index) = cursor {
            let node = self.store.get_mut(index);
            let next = node.next;

            if !node.sheet.is_guard() {
                let span = node.sheet.mark(size);

                if !span.is_empty() {
                    return span;
                }
            }

            cursor = next;
        }

        Span::EMPTY
    }

    fn exact_from_head(&mut self, kind: ChainKind, size: usize) -> Span {
        let mut cursor = self.chains[kind.index()].head();

        while let Some(index) = cursor {
            let node = self.store.get_mut(index);
            let next = node.next;

            if !node.sheet.is_guard() {
                let span = node.sheet.mark_exact(size);

                if !span.is_empty() {
                    return span;
                }
            }

            cursor = next;
        }

        Span::EMPTY
    }

    //  Book-keeping shared by every successful allocation.
    fn admit(&mut self, requested: usize, span: Span) -> Span {
        if self.policy.collect_stats {
            self.stats.record_alloc(requested, span.len);
        }

        //  Safety:
        //  -   The span was just handed out by a Sheet; it is writable and unaliased.
        unsafe { harden::scrub_on_alloc(&self.policy, span.ptr, span.len) };

        span
    }

    //  How many bytes to provision when `kind`'s chain must grow to serve `size`.
    fn growth_size(&self, kind: ChainKind, size: usize) -> usize {
        match kind {
            ChainKind::Cache => C::CACHE_STEP_PAGES * C::PAGE_SIZE.value(),
            _ if size > SizeClass::HUGE_LIMIT => bulk_region_size::<C>(size),
            _ => {
                let curve = expected_region_size::<C>(SizeClass::of(size));
                let predicted = self.predictor.predict(size, C::PAGE_SIZE);

                cmp::max(cmp::max(curve, predicted.saturating_mul(C::OVERCOMMIT)), size)
            },
        }
    }

    //  What an eagerly initialized chain provisions, absent any request to size it by.
    fn default_growth(&self, kind: ChainKind) -> usize {
        match kind {
            ChainKind::Cache => C::CACHE_STEP_PAGES * C::PAGE_SIZE.value(),
            ChainKind::Precise => expected_region_size::<C>(SizeClass::Precise),
            ChainKind::Small => expected_region_size::<C>(SizeClass::Small),
            ChainKind::Medium => expected_region_size::<C>(SizeClass::Medium),
            ChainKind::Large => expected_region_size::<C>(SizeClass::Large),
            ChainKind::Huge => expected_region_size::<C>(SizeClass::Huge),
        }
    }

    //  Maps a fresh Region sized for `bytes`, wraps it in a Sheet, and links it at the chain's tail. Under the guard
    //  policy, an inaccessible page is mapped right behind the data Region and linked just before it, so that the
    //  tail keeps pointing at the Sheet with room.
    fn expand(&mut self, kind: ChainKind, bytes: usize) -> Result<(), MapError> {
        let granule = kind.granule();
        let page = C::PAGE_SIZE;

        let blocks = cmp::max(1, (bytes + granule.value() - 1) / granule);
        let capacity = cmp::max(granule * PowerOf2::ceil(blocks).value(), page.value());
        let header = page.round_up(Book::header_len(granule, capacity));
        let region_len = header + capacity;

        //  Safety:
        //  -   `region_len` is a page multiple: header is page-rounded, capacity is a power of 2 at least one page.
        let base = unsafe { self.provider.map(ptr::null_mut(), region_len, Protection::ReadWrite) }.decode()?;

        //  Safety:
        //  -   The Region was just mapped, writable, and exclusively ours.
        let sheet = unsafe { Sheet::new(base, region_len, header, granule) };

        if kind == ChainKind::Large || kind == ChainKind::Huge {
            sheet.advise(&self.provider, Advice::WillNeed);
        }

        if self.policy.guard_pages {
            //  Safety:
            //  -   `base + region_len` is a mere placement hint.
            let hint = unsafe { base.as_ptr().add(region_len) };

            //  Safety:
            //  -   One page is a page multiple.
            let mapped = unsafe { self.provider.map(hint, page.value(), Protection::None) }.decode();

            //  A chain without its guard is degraded, not broken; the data Sheet is what matters.
            if let Ok(guard_base) = mapped {
                //  Safety:
                //  -   The guard Region was just mapped, and exclusively ours.
                let guard = unsafe { Sheet::guard(guard_base, page.value()) };

                let index = self.store_node(Node { sheet: guard, next: None })?;
                self.chains[kind.index()].push_back(&mut self.store, index);
            }
        }

        let index = self.store_node(Node { sheet, next: None })?;
        self.chains[kind.index()].push_back(&mut self.store, index);

        Ok(())
    }

    //  Moves a Node into the store, doubling the metadata Region first if every slot is taken.
    fn store_node(&mut self, node: Node) -> Result<NodeIndex, MapError> {
        if self.store.is_full() {
            let bytes = match self.store.next_segment_len() {
                Some(bytes) => bytes,
                None => panic!("flmalloc: metadata segment table exhausted"),
            };

            //  Safety:
            //  -   Segment lengths are page multiples: the first is, and doubling preserves it.
            let base = unsafe { self.provider.map(ptr::null_mut(), bytes, Protection::ReadWrite) }.decode()?;

            //  Safety:
            //  -   The segment was just mapped, writable, and exclusively ours.
            unsafe { self.store.push_segment(base, bytes) };
        }

        match self.store.allocate(node) {
            Some(index) => Ok(index),
            None => panic!("flmalloc: no Node slot available right after doubling"),
        }
    }

    //
    //  Deallocation internals.
    //

    fn remove(&mut self, ptr: *mut u8, tombstone: bool) -> bool {
        if ptr.is_null() {
            return false;
        }

        let location = match self.locate(ptr) {
            Some(location) => location,
            None => return self.miss(ptr),
        };

        let policy = self.policy;

        let freed = {
            let sheet = &mut self.store.get_mut(location.index).sheet;

            if tombstone { sheet.try_tombstone(ptr) } else { sheet.try_unmark(ptr) }
        };

        let len = match freed {
            Some(len) => len,
            None => {
                //  Within a Sheet, yet no live allocation starts there: a double free, or an interior pointer.
                if self.policy.enforce_provenance {
                    self.fail("flmalloc: free of a pointer at no live allocation");
                }

                return false;
            },
        };

        //  Safety:
        //  -   The span is no longer live, and no recycling can happen before this method returns.
        unsafe { harden::scrub_on_free(&policy, ptr, len) };

        if policy.collect_stats {
            self.stats.record_dealloc(len);
        }

        self.maybe_reclaim(location);

        true
    }

    //  A drained Sheet goes back to the kernel, unless it is its chain's head: a chain never shrinks below one live
    //  Sheet. Under tombstoning, reclamation additionally waits for dead bytes to pass half the capacity.
    fn maybe_reclaim(&mut self, location: Location) {
        let (used, dead, capacity) = {
            let sheet = &self.store.get(location.index).sheet;
            (sheet.used(), sheet.dead(), sheet.capacity())
        };

        if used != 0 || self.chains[location.chain].head() == Some(location.index) {
            return;
        }

        if self.policy.tombstone && dead * 2 <= capacity {
            return;
        }

        self.reclaim(location);
    }

    fn reclaim(&mut self, location: Location) {
        self.chains[location.chain].unlink(&mut self.store, location.previous, location.index);

        //  Safety:
        //  -   The Sheet is unlinked; no chain walk can reach it anymore.
        unsafe { self.store.get_mut(location.index).sheet.reset(&self.provider) };

        //  The guard was linked just before its data Sheet; it dies with it.
        if self.policy.guard_pages {
            if let Some(guard_index) = location.previous {
                if self.store.get(guard_index).sheet.is_guard() {
                    let previous = self.find_previous(location.chain, guard_index);

                    self.chains[location.chain].unlink(&mut self.store, previous, guard_index);

                    //  Safety:
                    //  -   The guard is unlinked; no chain walk can reach it anymore.
                    unsafe { self.store.get_mut(guard_index).sheet.reset(&self.provider) };
                }
            }
        }
    }

    fn find_previous(&self, chain: usize, target: NodeIndex) -> Option<NodeIndex> {
        let mut previous = None;
        let mut cursor = self.chains[chain].head();

        while let Some(index) = cursor {
            if index == target {
                return previous;
            }

            previous = Some(index);
            cursor = self.store.get(index).next;
        }

        None
    }

    //  Fixed walk order; short-circuits on the first Sheet owning `ptr`.
    fn locate(&self, ptr: *mut u8) -> Option<Location> {
        for kind in ChainKind::ALL.iter() {
            let mut previous = None;
            let mut cursor = self.chains[kind.index()].head();

            while let Some(index) = cursor {
                let node = self.store.get(index);

                if !node.sheet.is_guard() && node.sheet.is_at(ptr) {
                    return Some(Location { chain: kind.index(), previous, index });
                }

                previous = Some(index);
                cursor = node.next;
            }
        }

        None
    }

    fn fold_sheets<F>(&self, initial: usize, mut fold: F) -> usize
        where
            F: FnMut(usize, &Sheet) -> usize,
    {
        let mut total = initial;

        for kind in ChainKind::ALL.iter() {
            let mut cursor = self.chains[kind.index()].head();

            while let Some(index) = cursor {
                let node = self.store.get(index);
                total = fold(total, &node.sheet);
                cursor = node.next;
            }
        }

        total
    }

    //
    //  Failure handling.
    //

    fn oom_pre_check(&mut self) -> bool {
        let ratio = self.provider.memory_pressure().available_ratio();

        if ratio <= self.policy.oom_error_ratio {
            self.fail("flmalloc: system memory exhausted");
            return false;
        }

        if ratio <= self.policy.oom_warn_ratio && self.policy.collect_stats {
            self.stats.record_oom_warning();
        }

        true
    }

    //  A pointer-directed operation missed every Sheet.
    fn miss(&mut self, _ptr: *mut u8) -> bool {
        if self.policy.enforce_provenance {
            self.fail("flmalloc: operation on a pointer this allocator does not own");
        }

        false
    }

    fn fail(&self, message: &str) {
        match self.policy.failure {
            FailurePolicy::Abort => panic!("{}", message),
            FailurePolicy::AbortWithDiagnostic => {
                self.provider.report(message);
                panic!("{}", message);
            },
            FailurePolicy::SilentFalse => (),
        }
    }
}

impl<C, P> Drop for Arena<C, P>
    where
        C: Config,
        P: KernelProvider,
{
    fn drop(&mut self) {
        for kind in ChainKind::ALL.iter() {
            let mut cursor = self.chains[kind.index()].head();

            while let Some(index) = cursor {
                let next = self.store.get(index).next;

                if self.store.get(index).sheet.region().len > 0 {
                    //  Safety:
                    //  -   The whole Arena is going away; nothing can reach the Sheet afterwards.
                    unsafe { self.store.get_mut(index).sheet.reset(&self.provider) };
                }

                cursor = next;
            }
        }

        for i in 0..self.store.number_segments() {
            let (base, mapped) = self.store.segment(i);

            //  Safety:
            //  -   The segment was mapped by this provider, and no Node can be reached anymore.
            unsafe { self.provider.unmap(base, mapped) };
        }
    }
}

struct Location {
    chain: usize,
    previous: Option<NodeIndex>,
    index: NodeIndex,
}

const NUMBER_CHAINS: usize = 6;

//  The cache chain serves requests up to this size, bypassing the growth curves.
const CACHE_LIMIT: usize = 64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ChainKind {
    Cache,
    Precise,
    Small,
    Medium,
    Large,
    Huge,
}

impl ChainKind {
    const ALL: [ChainKind; NUMBER_CHAINS] = [
        ChainKind::Cache,
        ChainKind::Precise,
        ChainKind::Small,
        ChainKind::Medium,
        ChainKind::Large,
        ChainKind::Huge,
    ];

    fn of(size: usize) -> ChainKind {
        if size <= CACHE_LIMIT {
            return ChainKind::Cache;
        }

        match SizeClass::of(size) {
            SizeClass::Precise => ChainKind::Precise,
            SizeClass::Small => ChainKind::Small,
            SizeClass::Medium => ChainKind::Medium,
            SizeClass::Large => ChainKind::Large,
            SizeClass::Huge | SizeClass::Bulk | SizeClass::Giant => ChainKind::Huge,
        }
    }

    fn granule(self) -> PowerOf2 {
        //  Safety:
        //  -   All values are powers of 2.
        unsafe {
            match self {
                ChainKind::Cache => PowerOf2::new_unchecked(CACHE_LIMIT),
                ChainKind::Precise => PowerOf2::new_unchecked(SizeClass::PRECISE_LIMIT),
                ChainKind::Small => PowerOf2::new_unchecked(SizeClass::SMALL_LIMIT),
                ChainKind::Medium => PowerOf2::new_unchecked(SizeClass::MEDIUM_LIMIT),
                ChainKind::Large => PowerOf2::new_unchecked(SizeClass::LARGE_LIMIT),
                ChainKind::Huge => PowerOf2::new_unchecked(SizeClass::HUGE_LIMIT),
            }
        }
    }

    fn index(self) -> usize { self as usize }
}
