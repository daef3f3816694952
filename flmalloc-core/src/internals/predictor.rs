//! The Predictor: a running mean of recent request sizes.
//!
//! New Sheets are sized from this estimate, so that a bursty workload pre-allocates instead of thrashing the chain
//! with minimum-sized expansions. The ring is small and updated in O(1): the outgoing slot is subtracted as the
//! incoming one is added.

use crate::api::SizeClass;
use crate::utils::PowerOf2;

const SLOTS: usize = 32;

pub(crate) struct Predictor {
    ring: [usize; SLOTS],
    cursor: usize,
    sum: usize,
    nonzero: usize,
}

impl Predictor {
    /// Creates an empty Predictor.
    pub(crate) const fn new() -> Predictor {
        Predictor { ring: [0; SLOTS], cursor: 0, sum: 0, nonzero: 0 }
    }

    /// Records a request size.
    pub(crate) fn record(&mut self, size: usize) {
        let outgoing = self.ring[self.cursor];

        self.sum -= outgoing;
        if outgoing != 0 {
            self.nonzero -= 1;
        }

        self.ring[self.cursor] = size;
        self.sum += size;
        if size != 0 {
            self.nonzero += 1;
        }

        self.cursor = (self.cursor + 1) % SLOTS;
    }

    /// Returns a page-aligned growth estimate for `candidate`.
    ///
    /// The estimate is `max(mean, candidate)`, except when history would mislead: no history yet, a zero mean, a
    /// candidate more than 3x the mean, or a candidate in a different size class than the mean. In those cases the
    /// candidate passes through unsmoothed, so an outlier never pollutes a class's growth curve.
    pub(crate) fn predict(&self, candidate: usize, page: PowerOf2) -> usize {
        if self.nonzero == 0 {
            return page.round_up(candidate);
        }

        let mean = self.sum / self.nonzero;

        if mean == 0 || candidate > 3 * mean || SizeClass::of(candidate) != SizeClass::of(mean) {
            return page.round_up(candidate);
        }

        page.round_up(if mean > candidate { mean } else { candidate })
    }
}

#[cfg(test)]
mod tests {

use super::*;

fn page() -> PowerOf2 { PowerOf2::new(4096).expect("Power of 2") }

#[test]
fn predictor_no_history_passes_through() {
    let predictor = Predictor::new();

    assert_eq!(4096, predictor.predict(100, page()));
    assert_eq!(8192, predictor.predict(4097, page()));
}

#[test]
fn predictor_converges_on_mean() {
    let mut predictor = Predictor::new();

    for _ in 0..8 {
        predictor.record(200);
    }

    //  The mean dominates a smaller same-class candidate.
    assert_eq!(4096, predictor.predict(100, page()));

    //  A larger same-class candidate dominates the mean.
    assert_eq!(4096, predictor.predict(250, page()));
}

#[test]
fn predictor_ignores_outliers() {
    let mut predictor = Predictor::new();

    for _ in 0..8 {
        predictor.record(100);
    }

    //  3x the mean: smoothing would shrink the request's own curve.
    assert_eq!(4096, predictor.predict(301, page()));

    //  Different class than the mean.
    assert_eq!(8192, predictor.predict(5000, page()));
}

#[test]
fn predictor_ring_forgets() {
    let mut predictor = Predictor::new();

    for _ in 0..SLOTS {
        predictor.record(3000);
    }

    //  The entire ring is overwritten; the old mean is gone.
    for _ in 0..SLOTS {
        predictor.record(100);
    }

    //  3000 is now an outlier relative to the refreshed mean of 100.
    assert_eq!(4096, predictor.predict(100, page()));
    assert_eq!(4096, predictor.predict(301, page()));
}

#[test]
fn predictor_zero_records_ignored() {
    let mut predictor = Predictor::new();

    predictor.record(0);
    predictor.record(0);

    //  Zeroes never contribute to the mean.
    assert_eq!(4096, predictor.predict(100, page()));

    predictor.record(400);

    assert_eq!(4096, predictor.predict(100, page()));
}

}
