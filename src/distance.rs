//! Distance kernel for vector comparison.
//!
//! Every metric is oriented so that **lower is closer**, which lets the
//! HNSW index and result sorting treat all metrics uniformly. The kernel
//! runs on the search inner loop, so all functions are allocation-free and
//! written with chunked accumulators the compiler can auto-vectorize.

use crate::config::Metric;
use crate::error::{Result, ValidationError};

/// Computes the distance between two vectors under the given metric.
///
/// # Errors
///
/// Returns `DimensionMismatch` if the vectors differ in length.
///
/// # Example
/// ```
/// use nousdb::{distance, Metric};
///
/// let d = distance(&[1.0, 0.0], &[0.0, 1.0], Metric::Cosine).unwrap();
/// assert!((d - 1.0).abs() < 1e-6);
/// ```
#[inline]
pub fn distance(a: &[f32], b: &[f32], metric: Metric) -> Result<f32> {
    if a.len() != b.len() {
        return Err(ValidationError::dimension_mismatch(a.len(), b.len()).into());
    }
    Ok(distance_unchecked(a, b, metric))
}

/// Computes the distance without a dimension check.
///
/// Callers on the search hot path validate dimensions once at the query
/// boundary; vectors already inside the index are known to be uniform.
#[inline]
pub(crate) fn distance_unchecked(a: &[f32], b: &[f32], metric: Metric) -> f32 {
    match metric {
        Metric::Cosine => cosine(a, b),
        Metric::Euclidean => euclidean(a, b),
        Metric::Dot => -dot(a, b),
        Metric::Manhattan => manhattan(a, b),
    }
}

/// Inner product with four independent accumulators.
///
/// Splitting the accumulation chain removes the serial dependency between
/// adds, which is what lets LLVM emit packed SIMD for this loop.
#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    let mut acc = [0.0f32; 4];
    let chunks = a.len() / 4;
    for i in 0..chunks {
        let j = i * 4;
        acc[0] += a[j] * b[j];
        acc[1] += a[j + 1] * b[j + 1];
        acc[2] += a[j + 2] * b[j + 2];
        acc[3] += a[j + 3] * b[j + 3];
    }
    let mut sum = acc[0] + acc[1] + acc[2] + acc[3];
    for j in chunks * 4..a.len() {
        sum += a[j] * b[j];
    }
    sum
}

#[inline]
fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut ab = [0.0f32; 4];
    let mut aa = [0.0f32; 4];
    let mut bb = [0.0f32; 4];
    let chunks = a.len() / 4;
    for i in 0..chunks {
        let j = i * 4;
        for lane in 0..4 {
            let (x, y) = (a[j + lane], b[j + lane]);
            ab[lane] += x * y;
            aa[lane] += x * x;
            bb[lane] += y * y;
        }
    }
    let mut num = ab[0] + ab[1] + ab[2] + ab[3];
    let mut na = aa[0] + aa[1] + aa[2] + aa[3];
    let mut nb = bb[0] + bb[1] + bb[2] + bb[3];
    for j in chunks * 4..a.len() {
        num += a[j] * b[j];
        na += a[j] * a[j];
        nb += b[j] * b[j];
    }

    // Zero-magnitude vectors have no direction; treat them as maximally far.
    if na == 0.0 || nb == 0.0 {
        return 1.0;
    }
    1.0 - num / (na.sqrt() * nb.sqrt())
}

#[inline]
fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    let mut acc = [0.0f32; 4];
    let chunks = a.len() / 4;
    for i in 0..chunks {
        let j = i * 4;
        for lane in 0..4 {
            let d = a[j + lane] - b[j + lane];
            acc[lane] += d * d;
        }
    }
    let mut sum = acc[0] + acc[1] + acc[2] + acc[3];
    for j in chunks * 4..a.len() {
        let d = a[j] - b[j];
        sum += d * d;
    }
    sum.sqrt()
}

#[inline]
fn manhattan(a: &[f32], b: &[f32]) -> f32 {
    let mut acc = [0.0f32; 4];
    let chunks = a.len() / 4;
    for i in 0..chunks {
        let j = i * 4;
        for lane in 0..4 {
            acc[lane] += (a[j + lane] - b[j + lane]).abs();
        }
    }
    let mut sum = acc[0] + acc[1] + acc[2] + acc[3];
    for j in chunks * 4..a.len() {
        sum += (a[j] - b[j]).abs();
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, NousError};

    fn assert_close(a: f32, b: f32) {
        assert!((a - b).abs() < 1e-5, "expected {} ~= {}", a, b);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![0.3f32; 384];
        assert_close(distance(&v, &v, Metric::Cosine).unwrap(), 0.0);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = [1.0, 0.0, 0.0, 0.0];
        let b = [0.0, 1.0, 0.0, 0.0];
        assert_close(distance(&a, &b, Metric::Cosine).unwrap(), 1.0);
    }

    #[test]
    fn test_cosine_opposite() {
        let a = [1.0, 0.0];
        let b = [-1.0, 0.0];
        assert_close(distance(&a, &b, Metric::Cosine).unwrap(), 2.0);
    }

    #[test]
    fn test_cosine_zero_magnitude_is_one() {
        let a = [0.0, 0.0, 0.0];
        let b = [1.0, 2.0, 3.0];
        assert_close(distance(&a, &b, Metric::Cosine).unwrap(), 1.0);
        assert_close(distance(&b, &a, Metric::Cosine).unwrap(), 1.0);
        assert_close(distance(&a, &a, Metric::Cosine).unwrap(), 1.0);
    }

    #[test]
    fn test_euclidean() {
        let a = [0.0, 0.0, 0.0];
        let b = [1.0, 2.0, 2.0];
        assert_close(distance(&a, &b, Metric::Euclidean).unwrap(), 3.0);
    }

    #[test]
    fn test_dot_is_negated() {
        // Lower must mean closer, so a larger inner product gives a
        // smaller (more negative) distance.
        let q = [1.0, 1.0];
        let near = [2.0, 2.0];
        let far = [0.5, 0.5];
        let d_near = distance(&q, &near, Metric::Dot).unwrap();
        let d_far = distance(&q, &far, Metric::Dot).unwrap();
        assert!(d_near < d_far);
        assert_close(d_near, -4.0);
    }

    #[test]
    fn test_manhattan() {
        let a = [1.0, -2.0, 3.0];
        let b = [0.0, 2.0, 1.0];
        assert_close(distance(&a, &b, Metric::Manhattan).unwrap(), 7.0);
    }

    #[test]
    fn test_dimension_mismatch() {
        let a = [1.0, 2.0];
        let b = [1.0, 2.0, 3.0];
        for metric in [
            Metric::Cosine,
            Metric::Euclidean,
            Metric::Dot,
            Metric::Manhattan,
        ] {
            let err = distance(&a, &b, metric).unwrap_err();
            assert_eq!(err.code(), ErrorCode::DimensionMismatch);
            assert!(matches!(err, NousError::Validation(_)));
        }
    }

    #[test]
    fn test_remainder_lanes_are_covered() {
        // Lengths not divisible by 4 exercise the scalar tail.
        for len in [1, 3, 5, 7, 9] {
            let a: Vec<f32> = (0..len).map(|i| i as f32).collect();
            let b: Vec<f32> = (0..len).map(|i| (i as f32) * 0.5).collect();
            let expected: f32 = a.iter().zip(&b).map(|(x, y)| (x - y).abs()).sum();
            assert_close(distance(&a, &b, Metric::Manhattan).unwrap(), expected);
        }
    }
}
