//! Host batched inversion: LU with partial pivoting, one matrix per rayon
//! task.

use std::cmp::Ordering;
use std::ops::{Add, Div, Mul, Neg, Sub};

use num_complex::{Complex32, Complex64};
use rayon::prelude::*;

/// Scalar type for the dense LU kernels.
pub trait LuScalar:
    Copy
    + Send
    + Sync
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + std::fmt::Debug
{
    fn zero() -> Self;
    fn one() -> Self;
    fn abs_val(self) -> f64;
}

impl LuScalar for Complex64 {
    fn zero() -> Self {
        Complex64::new(0.0, 0.0)
    }
    fn one() -> Self {
        Complex64::new(1.0, 0.0)
    }
    fn abs_val(self) -> f64 {
        self.norm()
    }
}

impl LuScalar for Complex32 {
    fn zero() -> Self {
        Complex32::new(0.0, 0.0)
    }
    fn one() -> Self {
        Complex32::new(1.0, 0.0)
    }
    fn abs_val(self) -> f64 {
        self.norm() as f64
    }
}

/// Invert every `n x n` matrix of `a` into the matching slot of `ainv`.
pub fn invert_batch<T: LuScalar>(ainv: &mut [T], a: &[T], n: usize) {
    if n == 0 {
        return;
    }
    ainv.par_chunks_mut(n * n)
        .zip(a.par_chunks(n * n))
        .for_each(|(out, m)| invert_one(out, m, n));
}

/// Factor `P m = L U`, then solve `L U x = P e_c` for every column `c`.
/// Zero pivots are not trapped; they surface as non-finite entries.
fn invert_one<T: LuScalar>(out: &mut [T], m: &[T], n: usize) {
    let mut lu = m.to_vec();
    let mut perm: Vec<usize> = (0..n).collect();

    for k in 0..n {
        let p = (k..n)
            .max_by(|&i, &j| {
                lu[i * n + k]
                    .abs_val()
                    .partial_cmp(&lu[j * n + k].abs_val())
                    .unwrap_or(Ordering::Equal)
            })
            .unwrap_or(k);
        if p != k {
            for j in 0..n {
                lu.swap(k * n + j, p * n + j);
            }
            perm.swap(k, p);
        }
        let pivot = lu[k * n + k];
        for i in (k + 1)..n {
            let l = lu[i * n + k] / pivot;
            lu[i * n + k] = l;
            for j in (k + 1)..n {
                lu[i * n + j] = lu[i * n + j] - l * lu[k * n + j];
            }
        }
    }

    let mut y = vec![T::zero(); n];
    for c in 0..n {
        for i in 0..n {
            let mut s = if perm[i] == c { T::one() } else { T::zero() };
            for j in 0..i {
                s = s - lu[i * n + j] * y[j];
            }
            y[i] = s;
        }
        for i in (0..n).rev() {
            let mut s = y[i];
            for j in (i + 1)..n {
                s = s - lu[i * n + j] * y[j];
            }
            y[i] = s / lu[i * n + i];
        }
        for i in 0..n {
            out[i * n + c] = y[i];
        }
    }
}
