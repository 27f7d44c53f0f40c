//! Shared ratio/cents conversions used by every pipeline stage.

#[inline]
pub fn cents_to_ratio(c: f32) -> f32 {
    (c / 1200.0).exp2() // 2^(c/1200)
}

#[inline]
pub fn ratio_to_cents(r: f32) -> f32 {
    1200.0 * r.log2()
}

/// Cents difference between two positive frequencies (or ratios).
#[inline]
pub fn cents_diff(f1: f32, f2: f32) -> f32 {
    if f1 <= 0.0 || f2 <= 0.0 {
        return f32::INFINITY;
    }
    1200.0 * ((f2 / f1) as f64).log2() as f32
}

/// Absolute log2 distance between two positive ratios, in octaves.
#[inline]
pub fn log2_distance(r1: f32, r2: f32) -> f32 {
    if r1 <= 0.0 || r2 <= 0.0 {
        return f32::INFINITY;
    }
    ((r1 / r2) as f64).log2().abs() as f32
}

/// Median of a list. Sorts in place; empty input yields 0.
pub fn median(xs: &mut [f32]) -> f32 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let m = xs.len() / 2;
    if xs.len() % 2 == 1 {
        xs[m]
    } else {
        0.5 * (xs[m - 1] + xs[m])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cents_ratio_roundtrip() {
        for c in [-1200.0_f32, -386.31, 0.0, 701.955, 1200.0] {
            let back = ratio_to_cents(cents_to_ratio(c));
            assert!((back - c).abs() < 1e-2, "c={c} back={back}");
        }
    }

    #[test]
    fn cents_diff_guards_nonpositive() {
        assert!(cents_diff(0.0, 440.0).is_infinite());
        assert!(cents_diff(440.0, -1.0).is_infinite());
        assert!((cents_diff(220.0, 440.0) - 1200.0).abs() < 1e-3);
    }

    #[test]
    fn log2_distance_symmetric() {
        let d1 = log2_distance(1.5, 1.498);
        let d2 = log2_distance(1.498, 1.5);
        assert!((d1 - d2).abs() < 1e-9);
        assert!(d1 > 0.0);
    }

    #[test]
    fn median_handles_even_and_odd() {
        assert_eq!(median(&mut []), 0.0);
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&mut [4.0, 1.0, 3.0, 2.0]), 2.5);
    }
}
