//! Hardening fills.
//!
//! Span scrubbing on allocation and on free, driven by the Policy toggles. With a `const` Policy the checks fold to
//! nothing, which is what keeps them affordable on the hot path.

use core::ptr;

use crate::api::Policy;

/// Scrubs a freshly allocated span as the policy demands.
///
/// #   Safety
///
/// -   Assumes `[ptr, ptr + len)` is writable.
pub(crate) unsafe fn scrub_on_alloc(policy: &Policy, ptr: *mut u8, len: usize) {
    if policy.zero_on_alloc {
        ptr::write_bytes(ptr, 0, len);
    } else if policy.sanitize_on_alloc {
        ptr::write_bytes(ptr, Policy::SANITIZE, len);
    }
}

/// Scrubs a freed span as the policy demands.
///
/// #   Safety
///
/// -   Assumes `[ptr, ptr + len)` is writable.
pub(crate) unsafe fn scrub_on_free(policy: &Policy, ptr: *mut u8, len: usize) {
    if policy.zero_on_free {
        ptr::write_bytes(ptr, 0, len);
    } else if policy.poison_on_free {
        ptr::write_bytes(ptr, Policy::POISON, len);
    }
}

#[cfg(test)]
mod tests {

use super::*;

#[test]
fn scrub_on_alloc_variants() {
    let mut policy = Policy::DEFAULT;
    let mut buffer = [1u8; 16];

    //  Default: untouched.
    unsafe { scrub_on_alloc(&policy, buffer.as_mut_ptr(), buffer.len()) };
    assert_eq!([1u8; 16], buffer);

    policy.sanitize_on_alloc = true;

    unsafe { scrub_on_alloc(&policy, buffer.as_mut_ptr(), buffer.len()) };
    assert_eq!([Policy::SANITIZE; 16], buffer);

    //  Zeroing wins over sanitizing; calloc relies on it.
    policy.zero_on_alloc = true;

    unsafe { scrub_on_alloc(&policy, buffer.as_mut_ptr(), buffer.len()) };
    assert_eq!([0u8; 16], buffer);
}

#[test]
fn scrub_on_free_variants() {
    let mut policy = Policy::DEFAULT;
    let mut buffer = [1u8; 16];

    unsafe { scrub_on_free(&policy, buffer.as_mut_ptr(), buffer.len()) };
    assert_eq!([1u8; 16], buffer);

    policy.poison_on_free = true;

    unsafe { scrub_on_free(&policy, buffer.as_mut_ptr(), buffer.len()) };
    assert_eq!([Policy::POISON; 16], buffer);
}

}
