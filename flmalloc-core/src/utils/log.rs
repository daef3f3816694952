//! A natural logarithm usable without `std`.
//!
//! The growth curves only need a couple of significant digits, so a short series expansion on the mantissa is plenty;
//! `f64::ln` itself is out of reach in a `no_std` crate.

use core::f64;

/// Returns an approximation of the natural logarithm of `x`, within 0.1% for the sizes fed to the growth curves.
///
/// Non-positive and non-finite inputs yield 0.
pub(crate) fn ln(x: f64) -> f64 {
    if !(x > 0.0) || !x.is_finite() {
        return 0.0;
    }

    let bits = x.to_bits();
    let raw_exponent = ((bits >> 52) & 0x7ff) as i64;

    //  Sub-normals are orders of magnitude below any size of interest.
    if raw_exponent == 0 {
        return 0.0;
    }

    let exponent = raw_exponent - 1023;

    //  Mantissa scaled back into [1, 2).
    let mantissa = f64::from_bits((bits & 0x000f_ffff_ffff_ffff) | (1023u64 << 52));

    //  ln(m) = 2 atanh((m - 1) / (m + 1)), with z = (m - 1) / (m + 1) in [0, 1/3).
    let z = (mantissa - 1.0) / (mantissa + 1.0);
    let z2 = z * z;
    let ln_mantissa = 2.0 * z * (1.0 + z2 / 3.0 + z2 * z2 / 5.0);

    exponent as f64 * f64::consts::LN_2 + ln_mantissa
}

#[cfg(test)]
mod tests {

use super::*;

fn close(expected: f64, x: f64) {
    let actual = ln(x);
    let tolerance = if expected == 0.0 { 1e-9 } else { expected.abs() * 1e-3 };

    assert!((actual - expected).abs() <= tolerance, "ln({}) = {}, expected {}", x, actual, expected);
}

#[test]
fn ln_exact_powers() {
    close(0.0, 1.0);
    close(f64::consts::LN_2, 2.0);
    close(8.0 * f64::consts::LN_2, 256.0);
    close(12.0 * f64::consts::LN_2, 4096.0);
    close(30.0 * f64::consts::LN_2, (1u64 << 30) as f64);
}

#[test]
fn ln_class_sizes() {
    close(5.545177, 256.0);
    close(6.238325, 512.0);
    close(8.317766, 4096.0);
    close(10.397208, 32768.0);
    close(12.476649, 262144.0);
}

#[test]
fn ln_below_one() {
    close(-f64::consts::LN_2, 0.5);
    close(-2.0 * f64::consts::LN_2, 0.25);
}

#[test]
fn ln_degenerate() {
    assert_eq!(0.0, ln(0.0));
    assert_eq!(0.0, ln(-1.0));
    assert_eq!(0.0, ln(f64::NAN));
    assert_eq!(0.0, ln(f64::INFINITY));
}

}
