use num::Float;

/// これより小さい確率は 0 として扱う (denormal 回避)
pub const PROBABILITY_EPS: f32 = 1e-16;

/// 正則化後のトピック質量がこれを下回ると over-regularization とみなす
pub const OVERREGULARIZATION_EPS: f32 = 1e-20;

/// `value` is treated as an exact zero by every numeric path.
#[inline]
pub fn is_zero<T: Float>(value: T) -> bool {
    value.abs() < eps()
}

#[inline]
fn eps<T: Float>() -> T {
    num::NumCast::from(PROBABILITY_EPS).unwrap_or_else(T::zero)
}

/// ドット積
///
/// # Arguments
/// * `a` - 左ベクトル
/// * `b` - 右ベクトル (同じ長さ)
///
/// # Returns
/// * `T` - Σ a[i] * b[i]
#[inline]
pub fn dot<T: Float>(a: &[T], b: &[T]) -> T {
    debug_assert_eq!(a.len(), b.len(), "Vectors must be of the same length to compute dot product.");
    a.iter().zip(b.iter()).fold(T::zero(), |acc, (x, y)| acc + *x * *y)
}

/// `y += alpha * x`
#[inline]
pub fn axpy<T: Float>(alpha: T, x: &[T], y: &mut [T]) {
    debug_assert_eq!(x.len(), y.len());
    for (yi, xi) in y.iter_mut().zip(x.iter()) {
        *yi = *yi + alpha * *xi;
    }
}

/// `y[i] *= x[i]`
#[inline]
pub fn hadamard_assign<T: Float>(y: &mut [T], x: &[T]) {
    debug_assert_eq!(x.len(), y.len());
    for (yi, xi) in y.iter_mut().zip(x.iter()) {
        *yi = *yi * *xi;
    }
}

/// Fold an additive correction into `values`, clip negatives, and rescale so
/// the vector sums to one. Entries below [`PROBABILITY_EPS`] become zero.
/// A vector without positive mass becomes all zeros.
#[inline]
pub fn regularize_and_normalize<T: Float>(values: &mut [T], correction: &[T]) {
    debug_assert_eq!(values.len(), correction.len());
    let mut sum = T::zero();
    for (v, r) in values.iter_mut().zip(correction.iter()) {
        let val = *v + *r;
        *v = if val > T::zero() { val } else { T::zero() };
        sum = sum + *v;
    }
    normalize_with_sum(values, sum);
}

/// Rescale a non-negative vector so that it sums to one.
#[inline]
pub fn normalize<T: Float>(values: &mut [T]) {
    let sum = values.iter().fold(T::zero(), |acc, v| acc + *v);
    normalize_with_sum(values, sum);
}

#[inline]
fn normalize_with_sum<T: Float>(values: &mut [T], sum: T) {
    let eps = eps::<T>();
    let sum_inv = if sum > T::zero() { T::one() / sum } else { T::zero() };
    for v in values.iter_mut() {
        let val = *v * sum_inv;
        *v = if val < eps { T::zero() } else { val };
    }
}

/// 64-bit FNV-1a over several byte strings, each followed by a 0xff
/// separator. Stable across builds and platforms; used to derive seeds and
/// file names.
pub fn stable_hash(parts: &[&[u8]]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for part in parts {
        for &b in part.iter().chain(std::iter::once(&0xff)) {
            h ^= b as u64;
            h = h.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_and_axpy() {
        let a = [1.0f32, 2.0, 3.0];
        let b = [4.0f32, 5.0, 6.0];
        assert_eq!(dot(&a, &b), 32.0);

        let mut y = [1.0f32, 1.0, 1.0];
        axpy(2.0, &a, &mut y);
        assert_eq!(y, [3.0, 5.0, 7.0]);

        hadamard_assign(&mut y, &b);
        assert_eq!(y, [12.0, 25.0, 42.0]);
    }

    #[test]
    fn regularize_clips_and_normalizes() {
        let mut theta = [0.5f32, 0.3, 0.2];
        let r = [0.5f32, -1.0, 0.0];
        regularize_and_normalize(&mut theta, &r);
        assert!((theta[0] - 1.0 / 1.2).abs() < 1e-6);
        assert_eq!(theta[1], 0.0);
        assert!((theta.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn zero_mass_stays_zero() {
        let mut theta = [0.0f32, 0.0];
        normalize(&mut theta);
        assert_eq!(theta, [0.0, 0.0]);

        let mut theta = [1.0f32, -3.0];
        regularize_and_normalize(&mut theta, &[-2.0, 0.0]);
        assert_eq!(theta, [0.0, 0.0]);
    }

    #[test]
    fn tiny_values_are_zeroed() {
        let mut v = [1.0f64, 1e-20];
        normalize(&mut v);
        assert_eq!(v[1], 0.0);
        assert!(is_zero(1e-17f32));
        assert!(!is_zero(1e-10f32));
    }

    #[test]
    fn stable_hash_is_fixed() {
        // 値が変わると保存済みの seed / cache ファイル名が使えなくなる
        assert_eq!(stable_hash(&[b"b0", b"d0"]), 0xd80a_ad52_62a4_1ca1);
        assert_ne!(stable_hash(&[b"ab", b"c"]), stable_hash(&[b"a", b"bc"]));
        assert_ne!(stable_hash(&[b"a"]), stable_hash(&[b"a", b""]));
    }
}
