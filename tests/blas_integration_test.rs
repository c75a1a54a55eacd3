//! Fused kernels driven through the public API, including a reducer
//! defined outside the crate.

use approx::assert_relative_eq;
use latsolve::blas::{Operand, Reducer};
use latsolve::comm::ReduceScope;
use latsolve::{
    BlasEngine, ColorSpinorField, FieldLayout, FieldParam, Location, Precision, SolverError,
};
use num_complex::Complex64;

/// `y = a x + y`, returning `|y|^2`.
struct AxpyNorm(f64);

impl Reducer<2> for AxpyNorm {
    type Value = f64;
    const WRITES: [bool; 2] = [false, true];
    const FLOPS: usize = 6;

    fn apply(&self, v: &mut [Complex64; 2]) -> f64 {
        v[1] += self.0 * v[0];
        v[1].norm_sqr()
    }
}

fn ramp(layout: FieldLayout, precision: Precision, scale: f64) -> ColorSpinorField {
    let values: Vec<Complex64> = (0..layout.length())
        .map(|i| Complex64::new(scale * (i % 7) as f64, -scale * (i % 5) as f64))
        .collect();
    ColorSpinorField::from_complex(layout, precision, Location::Device, &values)
        .expect("sized values")
}

#[test]
fn custom_reducer_matches_host_arithmetic() {
    let engine = BlasEngine::new();
    let blas = engine.blas(ReduceScope::Global);
    // 130 sites spans several blocks of work items.
    let layout = FieldLayout::new(130, 4, 3);
    let x = ramp(layout, Precision::Double, 1.0);
    let mut y = ramp(layout, Precision::Double, 0.5);

    let expect: f64 = x
        .to_complex()
        .iter()
        .zip(y.to_complex())
        .map(|(xi, yi)| (yi + 2.0 * *xi).norm_sqr())
        .sum();
    let got = blas
        .reduce(&AxpyNorm(2.0), [Operand::Read(&x), Operand::Write(&mut y)])
        .unwrap();
    assert_relative_eq!(got, expect, max_relative = 1e-13);
    assert_eq!(engine.flops(), 6 * layout.length() as u64);
    // x read once, y read and written.
    assert_eq!(engine.bytes(), 3 * x.bytes() as u64);
}

#[test]
fn half_precision_reductions_track_double() {
    let engine = BlasEngine::new();
    let blas = engine.blas(ReduceScope::Local);
    let layout = FieldLayout::new(16, 4, 3);
    let xd = ramp(layout, Precision::Double, 0.25);
    let yd = ramp(layout, Precision::Double, -1.0);
    let xh = ramp(layout, Precision::Half, 0.25);
    let yh = ramp(layout, Precision::Half, -1.0);

    let exact = blas.cdot(&xd, &yd).unwrap();
    let half = blas.cdot(&xh, &yh).unwrap();
    assert_relative_eq!(half.re, exact.re, max_relative = 1e-3);
    assert_relative_eq!(blas.norm2(&xh).unwrap(), blas.norm2(&xd).unwrap(), max_relative = 1e-3);

    // Precision conversion is the one mixed-precision kernel.
    let mut promoted =
        ColorSpinorField::new(&FieldParam::like(&xh).with_precision(Precision::Double));
    blas.copy(&mut promoted, &xh).unwrap();
    assert_eq!(promoted.to_complex(), xh.to_complex());
    assert!(matches!(blas.cdot(&xh, &yd), Err(SolverError::Config(_))));
}

#[test]
fn unsupported_layouts_are_rejected_before_launch() {
    let engine = BlasEngine::new();
    let blas = engine.blas(ReduceScope::Global);

    let two_spin = FieldLayout::new(4, 2, 3);
    let xh = ColorSpinorField::new(&FieldParam::new(two_spin, Precision::Half, Location::Device));
    assert!(matches!(
        blas.norm2(&xh),
        Err(SolverError::Unsupported {
            precision: Precision::Half,
            n_spin: 2
        })
    ));

    let x = ramp(FieldLayout::new(4, 4, 3), Precision::Double, 1.0);
    let host = x.to_location(Location::Host);
    assert!(matches!(blas.norm2(&host), Err(SolverError::Location(_))));

    let mut other = ramp(FieldLayout::new(5, 4, 3), Precision::Double, 1.0);
    assert!(matches!(blas.xpy(&x, &mut other), Err(SolverError::Shape(_))));
    assert_eq!(engine.flops(), 0);
    assert_eq!(engine.bytes(), 0);
}
