//! The linear operator the solvers invert.
//!
//! Solvers only need `out = A in`. The operator owns its own flop count,
//! which the solver drains into the engine counters after each call.

use std::sync::atomic::{AtomicU64, Ordering};

use num_complex::Complex64;

use crate::error::{Result, SolverError};
use crate::field::ColorSpinorField;

/// Action of the physical operator on a field.
pub trait DiracMatrix: Send + Sync {
    /// `out = A input`. `tmp` is scratch of the same shape.
    fn apply(
        &self,
        out: &mut ColorSpinorField,
        input: &ColorSpinorField,
        tmp: &mut ColorSpinorField,
    ) -> Result<()>;

    /// Flops since the previous call; reading resets the count.
    fn flops(&self) -> u64;
}

/// A dense `n x n` complex operator, row-major.
///
/// Applied through `Complex64` regardless of the field precision; the result
/// is rounded to the output field's precision on store.
#[derive(Debug)]
pub struct DenseOperator {
    n: usize,
    entries: Vec<Complex64>,
    flops: AtomicU64,
    applications: AtomicU64,
}

impl DenseOperator {
    pub fn new(n: usize, entries: Vec<Complex64>) -> Result<Self> {
        if entries.len() != n * n {
            return Err(SolverError::Shape(format!(
                "dense operator of order {n} needs {} entries, got {}",
                n * n,
                entries.len()
            )));
        }
        Ok(Self {
            n,
            entries,
            flops: AtomicU64::new(0),
            applications: AtomicU64::new(0),
        })
    }

    /// Build from real entries, row-major.
    pub fn from_real(n: usize, entries: &[f64]) -> Result<Self> {
        Self::new(n, entries.iter().map(|&a| Complex64::new(a, 0.0)).collect())
    }

    pub fn identity(n: usize) -> Self {
        let mut entries = vec![Complex64::new(0.0, 0.0); n * n];
        for i in 0..n {
            entries[i * n + i] = Complex64::new(1.0, 0.0);
        }
        Self {
            n,
            entries,
            flops: AtomicU64::new(0),
            applications: AtomicU64::new(0),
        }
    }

    /// `A v` on plain vectors.
    pub fn mul_vec(&self, v: &[Complex64]) -> Vec<Complex64> {
        self.entries
            .chunks(self.n)
            .map(|row| row.iter().zip(v).map(|(a, x)| a * x).sum())
            .collect()
    }

    /// Number of `apply` calls so far.
    pub fn applications(&self) -> u64 {
        self.applications.load(Ordering::Relaxed)
    }
}

impl DiracMatrix for DenseOperator {
    fn apply(
        &self,
        out: &mut ColorSpinorField,
        input: &ColorSpinorField,
        _tmp: &mut ColorSpinorField,
    ) -> Result<()> {
        if input.length() != self.n || out.length() != self.n {
            return Err(SolverError::Shape(format!(
                "operator of order {} applied to fields of length {} -> {}",
                self.n,
                input.length(),
                out.length()
            )));
        }
        let result = self.mul_vec(&input.to_complex());
        out.assign_complex(&result)?;
        self.flops
            .fetch_add(8 * (self.n * self.n) as u64, Ordering::Relaxed);
        self.applications.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flops(&self) -> u64 {
        self.flops.swap(0, Ordering::Relaxed)
    }
}
