//! Allocation counters.

/// Counters maintained by an Arena when `Policy::collect_stats` is set.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    /// Number of allocation requests served, including failed ones.
    pub alloc_requests: u64,
    /// Number of deallocation requests served.
    pub dealloc_requests: u64,
    /// Total bytes requested by callers.
    pub total_memory_requested: u64,
    /// Total bytes actually handed out, block rounding included.
    pub total_memory_throughput: u64,
    /// Total bytes returned, whether recycled or tombstoned.
    pub total_memory_freed: u64,
    /// Number of times the OOM warn threshold was crossed.
    pub oom_warnings: u64,
}

impl Stats {
    /// Creates zeroed counters.
    pub const fn new() -> Stats {
        Stats {
            alloc_requests: 0,
            dealloc_requests: 0,
            total_memory_requested: 0,
            total_memory_throughput: 0,
            total_memory_freed: 0,
            oom_warnings: 0,
        }
    }

    pub(crate) fn record_alloc(&mut self, requested: usize, served: usize) {
        self.alloc_requests += 1;
        self.total_memory_requested += requested as u64;
        self.total_memory_throughput += served as u64;
    }

    pub(crate) fn record_dealloc(&mut self, freed: usize) {
        self.dealloc_requests += 1;
        self.total_memory_freed += freed as u64;
    }

    pub(crate) fn record_oom_warning(&mut self) {
        self.oom_warnings += 1;
    }
}
