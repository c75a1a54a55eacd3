//! Fused elementwise transforms with a reduction.
//!
//! A reducer is applied to every complex element of its operands in one
//! pass. It may overwrite the operands flagged in `WRITES` and returns the
//! per-element contribution to the reduction.

use num_complex::Complex64;

use crate::comm::CommunicationBackend;

/// A value that can be summed across work items, blocks and ranks.
pub trait ReduceValue: Copy + Send + Sync + 'static {
    fn zero() -> Self;

    fn combine(self, other: Self) -> Self;

    /// Sum across every rank of `comm`.
    fn all_reduce(self, comm: &dyn CommunicationBackend) -> Self;
}

impl ReduceValue for () {
    fn zero() -> Self {}

    fn combine(self, _other: Self) -> Self {}

    fn all_reduce(self, _comm: &dyn CommunicationBackend) -> Self {}
}

impl ReduceValue for f64 {
    fn zero() -> Self {
        0.0
    }

    fn combine(self, other: Self) -> Self {
        self + other
    }

    fn all_reduce(self, comm: &dyn CommunicationBackend) -> Self {
        comm.all_reduce_sum(self)
    }
}

impl ReduceValue for Complex64 {
    fn zero() -> Self {
        Complex64::new(0.0, 0.0)
    }

    fn combine(self, other: Self) -> Self {
        self + other
    }

    fn all_reduce(self, comm: &dyn CommunicationBackend) -> Self {
        let mut buf = [self.re, self.im];
        comm.all_reduce_sum_vec(&mut buf);
        Complex64::new(buf[0], buf[1])
    }
}

/// Three packed real sums, typically `(Re<a,b>, Im<a,b>, |a|^2)`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Double3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Double3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// The complex number `x + iy`.
    pub fn xy(&self) -> Complex64 {
        Complex64::new(self.x, self.y)
    }
}

impl ReduceValue for Double3 {
    fn zero() -> Self {
        Self::default()
    }

    fn combine(self, other: Self) -> Self {
        Self::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }

    fn all_reduce(self, comm: &dyn CommunicationBackend) -> Self {
        let mut buf = [self.x, self.y, self.z];
        comm.all_reduce_sum_vec(&mut buf);
        Self::new(buf[0], buf[1], buf[2])
    }
}

/// Elementwise transform over `N` operands fused with a reduction.
///
/// `apply` sees one complex element of every operand, in operand order.
/// Only the slots flagged in `WRITES` are stored back.
pub trait Reducer<const N: usize>: Sync {
    type Value: ReduceValue;

    /// Which operands are written.
    const WRITES: [bool; N];

    /// Real floating-point operations per complex element.
    const FLOPS: usize;

    /// Whether operands may differ in precision.
    const MIXED_PRECISION: bool = false;

    fn apply(&self, v: &mut [Complex64; N]) -> Self::Value;
}

fn czero() -> Complex64 {
    Complex64::new(0.0, 0.0)
}

/// `x = 0`
pub struct Zero;

impl Reducer<1> for Zero {
    type Value = ();
    const WRITES: [bool; 1] = [true];
    const FLOPS: usize = 0;

    fn apply(&self, v: &mut [Complex64; 1]) {
        v[0] = czero();
    }
}

/// `dst = src`, converting precision.
pub struct Convert;

impl Reducer<2> for Convert {
    type Value = ();
    const WRITES: [bool; 2] = [true, false];
    const FLOPS: usize = 0;
    const MIXED_PRECISION: bool = true;

    fn apply(&self, v: &mut [Complex64; 2]) {
        v[0] = v[1];
    }
}

/// `|x|^2`
pub struct Norm2;

impl Reducer<1> for Norm2 {
    type Value = f64;
    const WRITES: [bool; 1] = [false];
    const FLOPS: usize = 4;

    fn apply(&self, v: &mut [Complex64; 1]) -> f64 {
        v[0].norm_sqr()
    }
}

/// `x = a x`
pub struct Ax(pub f64);

impl Reducer<1> for Ax {
    type Value = ();
    const WRITES: [bool; 1] = [true];
    const FLOPS: usize = 2;

    fn apply(&self, v: &mut [Complex64; 1]) {
        v[0] *= self.0;
    }
}

/// `y += a x`
pub struct Axpy(pub f64);

impl Reducer<2> for Axpy {
    type Value = ();
    const WRITES: [bool; 2] = [false, true];
    const FLOPS: usize = 4;

    fn apply(&self, v: &mut [Complex64; 2]) {
        v[1] += v[0] * self.0;
    }
}

/// `y += x`
pub struct Xpy;

impl Reducer<2> for Xpy {
    type Value = ();
    const WRITES: [bool; 2] = [false, true];
    const FLOPS: usize = 2;

    fn apply(&self, v: &mut [Complex64; 2]) {
        v[1] += v[0];
    }
}

/// `y -= x`
pub struct Mxpy;

impl Reducer<2> for Mxpy {
    type Value = ();
    const WRITES: [bool; 2] = [false, true];
    const FLOPS: usize = 2;

    fn apply(&self, v: &mut [Complex64; 2]) {
        v[1] -= v[0];
    }
}

/// `y = x - y`, returning `|y|^2`.
pub struct XmyNorm;

impl Reducer<2> for XmyNorm {
    type Value = f64;
    const WRITES: [bool; 2] = [false, true];
    const FLOPS: usize = 6;

    fn apply(&self, v: &mut [Complex64; 2]) -> f64 {
        v[1] = v[0] - v[1];
        v[1].norm_sqr()
    }
}

/// `<x, y>` with the first argument conjugated.
pub struct Cdot;

impl Reducer<2> for Cdot {
    type Value = Complex64;
    const WRITES: [bool; 2] = [false, false];
    const FLOPS: usize = 8;

    fn apply(&self, v: &mut [Complex64; 2]) -> Complex64 {
        v[0].conj() * v[1]
    }
}

/// `(Re<x,y>, Im<x,y>, |x|^2)`
pub struct CdotNormA;

impl Reducer<2> for CdotNormA {
    type Value = Double3;
    const WRITES: [bool; 2] = [false, false];
    const FLOPS: usize = 12;

    fn apply(&self, v: &mut [Complex64; 2]) -> Double3 {
        let d = v[0].conj() * v[1];
        Double3::new(d.re, d.im, v[0].norm_sqr())
    }
}

/// `(Re<x,y>, Im<x,y>, |y|^2)`
pub struct CdotNormB;

impl Reducer<2> for CdotNormB {
    type Value = Double3;
    const WRITES: [bool; 2] = [false, false];
    const FLOPS: usize = 12;

    fn apply(&self, v: &mut [Complex64; 2]) -> Double3 {
        let d = v[0].conj() * v[1];
        Double3::new(d.re, d.im, v[1].norm_sqr())
    }
}

/// `y += a x` with complex `a`.
pub struct Caxpy(pub Complex64);

impl Reducer<2> for Caxpy {
    type Value = ();
    const WRITES: [bool; 2] = [false, true];
    const FLOPS: usize = 8;

    fn apply(&self, v: &mut [Complex64; 2]) {
        v[1] += self.0 * v[0];
    }
}

/// `y += a x`, `x -= a z`, returning `|x|^2`. Operands `(x, y, z)`.
pub struct CaxpyXmazNormX(pub Complex64);

impl Reducer<3> for CaxpyXmazNormX {
    type Value = f64;
    const WRITES: [bool; 3] = [true, true, false];
    const FLOPS: usize = 20;

    fn apply(&self, v: &mut [Complex64; 3]) -> f64 {
        v[1] += self.0 * v[0];
        v[0] -= self.0 * v[2];
        v[0].norm_sqr()
    }
}

/// `z = x + a y + b z`. Operands `(x, y, z)`.
pub struct Cxpaypbz {
    pub a: Complex64,
    pub b: Complex64,
}

impl Reducer<3> for Cxpaypbz {
    type Value = ();
    const WRITES: [bool; 3] = [false, false, true];
    const FLOPS: usize = 18;

    fn apply(&self, v: &mut [Complex64; 3]) {
        v[2] = v[0] + self.a * v[1] + self.b * v[2];
    }
}

/// `z += a x + b y`, `y -= b w`, returning `(Re<v,y>, Im<v,y>, |y|^2)`.
/// Operands `(x, y, z, w, v)`.
pub struct CaxpbypzYmbwCdotWyNormY {
    pub a: Complex64,
    pub b: Complex64,
}

impl Reducer<5> for CaxpbypzYmbwCdotWyNormY {
    type Value = Double3;
    const WRITES: [bool; 5] = [false, true, true, false, false];
    const FLOPS: usize = 44;

    fn apply(&self, v: &mut [Complex64; 5]) -> Double3 {
        v[2] += self.a * v[0] + self.b * v[1];
        v[1] -= self.b * v[3];
        let d = v[4].conj() * v[1];
        Double3::new(d.re, d.im, v[1].norm_sqr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(re: f64, im: f64) -> Complex64 {
        Complex64::new(re, im)
    }

    #[test]
    fn cdot_conjugates_first_argument() {
        let mut v = [c(0.0, 1.0), c(1.0, 0.0)];
        assert_eq!(Cdot.apply(&mut v), c(0.0, -1.0));
    }

    #[test]
    fn caxpy_xmaz_updates_both_operands() {
        let a = c(0.5, 0.5);
        let mut v = [c(1.0, 0.0), c(2.0, 0.0), c(0.0, 2.0)];
        let n = CaxpyXmazNormX(a).apply(&mut v);
        assert_eq!(v[1], c(2.5, 0.5));
        assert_eq!(v[0], c(2.0, -1.0));
        assert_eq!(n, 5.0);
    }

    #[test]
    fn fused_bicgstab_step_matches_separate_updates() {
        let (a, b) = (c(0.25, -0.5), c(1.5, 0.125));
        let (x, y, z, w, s) = (c(1.0, 2.0), c(-0.5, 0.75), c(3.0, 0.0), c(0.0, -1.0), c(2.0, 1.0));
        let mut v = [x, y, z, w, s];
        let d = CaxpbypzYmbwCdotWyNormY { a, b }.apply(&mut v);
        let y_new = y - b * w;
        assert_eq!(v[2], z + (a * x + b * y));
        assert_eq!(v[1], y_new);
        assert_eq!(d.xy(), s.conj() * y_new);
        assert_eq!(d.z, y_new.norm_sqr());
    }

    #[test]
    fn xmy_norm_overwrites_second_operand() {
        let mut v = [c(3.0, 4.0), c(1.0, 1.0)];
        let n = XmyNorm.apply(&mut v);
        assert_eq!(v[1], c(2.0, 3.0));
        assert_eq!(n, 13.0);
    }

    #[test]
    fn double3_combines_componentwise() {
        let s = Double3::new(1.0, 2.0, 3.0).combine(Double3::new(0.5, -2.0, 1.0));
        assert_eq!(s, Double3::new(1.5, 0.0, 4.0));
    }
}
