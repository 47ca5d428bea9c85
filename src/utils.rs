use divrem::DivCeil;

use crate::common::{DimSize, TensorShape};

/// The H×W×C cell of the NHWCB format.
pub const BRICK_GROUP_HEIGHT: u32 = 8;
pub const BRICK_GROUP_WIDTH: u32 = 8;
pub const BRICK_GROUP_CHANNELS: u32 = 16;

pub const FCAF_DEEP_CELL: TensorShape = [1, 8, 8, 32];
pub const FCAF_WIDE_CELL: TensorShape = [1, 8, 16, 16];

pub fn div_round_up(numerator: u32, denominator: u32) -> u32 {
    DivCeil::div_ceil(numerator, denominator)
}

pub fn round_up_to_multiple(value: u32, multiple: u32) -> u32 {
    div_round_up(value, multiple) * multiple
}

pub fn round_down_to_multiple(value: u32, multiple: u32) -> u32 {
    (value / multiple) * multiple
}

pub const fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Returns the number of `stripe`-sized stripes needed to cover `extent`.
///
/// A zero-sized stripe covers nothing and yields zero stripes.
pub fn num_stripes(extent: DimSize, stripe: DimSize) -> u32 {
    if stripe == 0 {
        return 0;
    }
    div_round_up(extent, stripe)
}

pub fn num_stripes_hwc(tensor: &TensorShape, stripe: &TensorShape) -> [u32; 3] {
    [
        num_stripes(tensor[1], stripe[1]),
        num_stripes(tensor[2], stripe[2]),
        num_stripes(tensor[3], stripe[3]),
    ]
}

pub fn total_size_bytes(shape: &TensorShape) -> u32 {
    shape.iter().product()
}

/// Bytes taken by `shape` once padded out to whole brick groups.
pub fn total_size_bytes_nhwcb(shape: &TensorShape) -> u32 {
    shape[0]
        * round_up_to_multiple(shape[1], BRICK_GROUP_HEIGHT)
        * round_up_to_multiple(shape[2], BRICK_GROUP_WIDTH)
        * round_up_to_multiple(shape[3], BRICK_GROUP_CHANNELS)
}

/// Whether every stripe boundary of `stripe` falls on a `cell` boundary.
pub fn is_compatible_with_cell(stripe: &TensorShape, tensor: &TensorShape, cell: &TensorShape) -> bool {
    (1..4).all(|d| stripe[d] >= tensor[d] || stripe[d] % cell[d] == 0)
}

/// Splits `f` into a mantissa in `[0.5, 1)` and an exponent such that
/// `f == mantissa * 2^exponent`.
pub fn frexp(f: f64) -> (f64, i32) {
    if f == 0.0 || !f.is_finite() {
        return (f, 0);
    }
    let bits = f.to_bits();
    let biased_exp = ((bits >> 52) & 0x7ff) as i32;
    if biased_exp == 0 {
        // Subnormal; normalize first.
        let (m, e) = frexp(f * 2f64.powi(64));
        return (m, e - 64);
    }
    let mantissa = f64::from_bits((bits & !(0x7ff << 52)) | (1022 << 52));
    (mantissa, biased_exp - 1022)
}

/// Expresses `f` as a 16-bit fixed-point multiplier and right shift, so that
/// `x * f ≈ (x * multiplier) >> shift`.
pub fn calculate_rescale_multiplier_and_shift(f: f64) -> (u16, u32) {
    let (fraction, exp) = frexp(f);
    if exp < -16 {
        return (0, 0);
    }
    let precision = 0.max(32 - exp.max(16));
    let multiplier = (fraction * 2f64.powi(precision)).round();
    let multiplier = multiplier.min(f64::from(u16::MAX)) as u16;
    let shift = (precision.max(exp) - exp) as u32;
    (multiplier, shift)
}

/// Matches `text` against a pattern supporting `*` (any run) and `?` (any one
/// character).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = backtrack {
            pi = star_pi + 1;
            ti = star_ti + 1;
            backtrack = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_identity_rescale() {
        assert_eq!(calculate_rescale_multiplier_and_shift(1.0), (32768, 15));
    }

    #[test]
    fn test_tiny_rescale_is_zero() {
        assert_eq!(calculate_rescale_multiplier_and_shift(1e-9), (0, 0));
    }

    #[test]
    fn test_nhwcb_size_pads_to_brick_groups() {
        assert_eq!(total_size_bytes_nhwcb(&[1, 1, 1, 1]), 8 * 8 * 16);
        assert_eq!(total_size_bytes_nhwcb(&[1, 9, 8, 17]), 16 * 8 * 32);
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("conv?", "conv1"));
        assert!(glob_match("mce*pool", "mce_max_pool"));
        assert!(!glob_match("mce*pool", "mce_max_pools"));
        assert!(!glob_match("conv?", "conv"));
        assert!(glob_match("", ""));
    }

    proptest! {
        #[test]
        fn test_div_round_up_is_tight(a in 0u32..100_000, b in 1u32..1_000) {
            let r = div_round_up(a, b);
            prop_assert!(r * b >= a);
            prop_assert!(r == 0 || (r - 1) * b < a);
        }

        #[test]
        fn test_frexp_reconstructs(f in 1e-30f64..1e30) {
            let (m, e) = frexp(f);
            prop_assert!((0.5..1.0).contains(&m));
            prop_assert!((m * 2f64.powi(e) - f).abs() <= f * 1e-12);
        }

        #[test]
        fn test_rescale_approximates_scale(f in 0.001f64..4.0) {
            let (mult, shift) = calculate_rescale_multiplier_and_shift(f);
            let approx = f64::from(mult) / 2f64.powi(shift as i32);
            prop_assert!((approx - f).abs() / f < 1e-3);
        }

        #[test]
        fn test_gcd_divides_both(a in 1u32..10_000, b in 1u32..10_000) {
            let g = gcd(a, b);
            prop_assert_eq!(a % g, 0);
            prop_assert_eq!(b % g, 0);
        }
    }
}
