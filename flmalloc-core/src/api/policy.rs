//! Policy.
//!
//! The runtime-inspectable behavior toggles of an Arena, grouped in one plain struct. Frontends pass a `const`
//! Policy, so disabled branches still fold away; tests flip individual fields and observe the difference directly.

/// What to do when the allocator detects a misuse or an unrecoverable condition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailurePolicy {
    /// Abort the process.
    Abort,
    /// Report a diagnostic through the provider sink, then abort the process.
    AbortWithDiagnostic,
    /// Report nothing; the offending operation returns its failure value.
    SilentFalse,
}

/// The behavior toggles of an Arena.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Policy {
    /// Tombstone freed spans instead of recycling them; a freed span is never handed out again until its whole Sheet
    /// is reclaimed. Mutually exclusive with `launder`.
    pub tombstone: bool,
    /// Map an inaccessible page-sized Sheet behind each fresh data Sheet.
    pub guard_pages: bool,
    /// Verify that pointer-directed operations target memory this Arena actually owns, before mutating anything.
    pub enforce_provenance: bool,
    /// Zero spans on allocation.
    pub zero_on_alloc: bool,
    /// Zero spans on free.
    pub zero_on_free: bool,
    /// Overwrite spans with `POISON` on free.
    pub poison_on_free: bool,
    /// Overwrite spans with `SANITIZE` on allocation.
    pub sanitize_on_alloc: bool,
    /// Maintain the `Stats` counters.
    pub collect_stats: bool,
    /// Check system memory health before serving large requests.
    pub oom_check: bool,
    /// Available-memory ratio at or below which a warning is counted. Strictly above `oom_error_ratio`, or warnings
    /// never fire.
    pub oom_warn_ratio: f64,
    /// Available-memory ratio at or below which allocation is refused, per the failure policy.
    pub oom_error_ratio: f64,
    /// What to do on misuse or unrecoverable failure.
    pub failure: FailurePolicy,
}

impl Policy {
    /// Byte written over freed spans when `poison_on_free` is set.
    pub const POISON: u8 = 0xDD;

    /// Byte written over fresh spans when `sanitize_on_alloc` is set.
    pub const SANITIZE: u8 = 0xCD;

    /// The default policy: tombstoning on, everything costly off, failures abort.
    ///
    /// The OOM check stays off by default; its verdict depends on whatever else the machine is running.
    pub const DEFAULT: Policy = Policy {
        tombstone: true,
        guard_pages: false,
        enforce_provenance: false,
        zero_on_alloc: false,
        zero_on_free: false,
        poison_on_free: false,
        sanitize_on_alloc: false,
        collect_stats: true,
        oom_check: false,
        oom_warn_ratio: 0.2,
        oom_error_ratio: 0.1,
        failure: FailurePolicy::Abort,
    };

    /// A hardened policy: every defensive toggle on, diagnostics before aborting.
    pub const HARDENED: Policy = Policy {
        tombstone: true,
        guard_pages: true,
        enforce_provenance: true,
        zero_on_alloc: false,
        zero_on_free: false,
        poison_on_free: true,
        sanitize_on_alloc: true,
        collect_stats: true,
        oom_check: true,
        oom_warn_ratio: 0.2,
        oom_error_ratio: 0.1,
        failure: FailurePolicy::AbortWithDiagnostic,
    };
}

impl Default for Policy {
    fn default() -> Policy { Policy::DEFAULT }
}

#[cfg(test)]
mod tests {

use super::*;

#[test]
fn policy_presets() {
    let default = Policy::DEFAULT;

    assert!(default.tombstone);
    assert!(!default.guard_pages);
    assert!(!default.oom_check);
    assert_eq!(FailurePolicy::Abort, default.failure);

    let hardened = Policy::HARDENED;

    assert!(hardened.guard_pages);
    assert!(hardened.enforce_provenance);
    assert!(hardened.poison_on_free);
    assert_eq!(FailurePolicy::AbortWithDiagnostic, hardened.failure);
}

}
