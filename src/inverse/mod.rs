//! Batched dense matrix inversion.
//!
//! Inverts a contiguous batch of small `n x n` complex matrices, as used
//! for per-site blocks of coarse operators. The implementation is chosen
//! from the batch precision and location:
//!
//! | precision | host       | device         |
//! |-----------|------------|----------------|
//! | single    | rayon LU   | wgpu kernel    |
//! | double    | rayon LU   | not built      |
//! | half      | not built  | not built      |

mod gpu;
pub mod host;
mod shaders;

use num_complex::{Complex32, Complex64};

use crate::error::{Result, SolverError};
use crate::field::{Location, Precision};

use gpu::GpuInverter;

/// Matrix storage of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum MatrixData {
    Single(Vec<Complex32>),
    Double(Vec<Complex64>),
}

/// `batch` row-major `n x n` complex matrices stored back to back.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixBatch {
    n: usize,
    batch: usize,
    location: Location,
    data: MatrixData,
}

impl MatrixBatch {
    /// A zeroed batch.
    pub fn new(n: usize, batch: usize, precision: Precision, location: Location) -> Result<Self> {
        let len = n * n * batch;
        let data = match precision {
            Precision::Single => MatrixData::Single(vec![Complex32::new(0.0, 0.0); len]),
            Precision::Double => MatrixData::Double(vec![Complex64::new(0.0, 0.0); len]),
            Precision::Half => {
                return Err(SolverError::Config(
                    "batched inversion has no half-precision storage".into(),
                ))
            }
        };
        Ok(Self {
            n,
            batch,
            location,
            data,
        })
    }

    /// Build from `Complex64` values, rounding to `precision`.
    pub fn from_complex(
        n: usize,
        batch: usize,
        precision: Precision,
        location: Location,
        values: &[Complex64],
    ) -> Result<Self> {
        let mut out = Self::new(n, batch, precision, location)?;
        if values.len() != n * n * batch {
            return Err(SolverError::Shape(format!(
                "{batch} matrices of order {n} need {} entries, got {}",
                n * n * batch,
                values.len()
            )));
        }
        match &mut out.data {
            MatrixData::Single(d) => {
                for (dst, z) in d.iter_mut().zip(values) {
                    *dst = Complex32::new(z.re as f32, z.im as f32);
                }
            }
            MatrixData::Double(d) => d.copy_from_slice(values),
        }
        Ok(out)
    }

    pub fn to_complex(&self) -> Vec<Complex64> {
        match &self.data {
            MatrixData::Single(d) => d
                .iter()
                .map(|z| Complex64::new(z.re as f64, z.im as f64))
                .collect(),
            MatrixData::Double(d) => d.clone(),
        }
    }

    /// Matrix `index` of the batch, row-major.
    pub fn matrix(&self, index: usize) -> Option<Vec<Complex64>> {
        if index >= self.batch {
            return None;
        }
        let nn = self.n * self.n;
        let range = index * nn..(index + 1) * nn;
        Some(match &self.data {
            MatrixData::Single(d) => d[range]
                .iter()
                .map(|z| Complex64::new(z.re as f64, z.im as f64))
                .collect(),
            MatrixData::Double(d) => d[range].to_vec(),
        })
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn precision(&self) -> Precision {
        match self.data {
            MatrixData::Single(_) => Precision::Single,
            MatrixData::Double(_) => Precision::Double,
        }
    }

    pub fn data(&self) -> &MatrixData {
        &self.data
    }

    /// Flops of inverting the whole batch.
    pub fn inversion_flops(&self) -> u64 {
        8 * (self.n as u64).pow(3) * self.batch as u64
    }
}

/// Dispatches batched inversions to the host or device implementation.
pub struct BatchInverter {
    device: Option<GpuInverter>,
}

impl BatchInverter {
    /// Host implementations only; device batches are rejected.
    pub fn host() -> Self {
        Self { device: None }
    }

    /// Host implementations plus a wgpu device for device batches.
    pub fn with_device() -> Result<Self> {
        Ok(Self {
            device: Some(GpuInverter::new()?),
        })
    }

    /// Invert every matrix of `a` into `ainv` and return the flops spent.
    ///
    /// Singular matrices are not detected; their inverses come back
    /// non-finite.
    pub fn invert(&self, ainv: &mut MatrixBatch, a: &MatrixBatch) -> Result<u64> {
        if ainv.n != a.n || ainv.batch != a.batch {
            return Err(SolverError::Shape(format!(
                "output batch is {} x order {}, input is {} x order {}",
                ainv.batch, ainv.n, a.batch, a.n
            )));
        }
        if ainv.precision() != a.precision() {
            return Err(SolverError::Config(format!(
                "output precision {:?} differs from input {:?}",
                ainv.precision(),
                a.precision()
            )));
        }
        if ainv.location != a.location {
            return Err(SolverError::Location(
                "input and output batches are in different locations".into(),
            ));
        }

        let _span = tracing::debug_span!("batch_invert", n = a.n, batch = a.batch).entered();
        match (&mut ainv.data, &a.data, a.location) {
            (MatrixData::Single(out), MatrixData::Single(m), Location::Host) => {
                host::invert_batch(out, m, a.n)
            }
            (MatrixData::Double(out), MatrixData::Double(m), Location::Host) => {
                host::invert_batch(out, m, a.n)
            }
            (MatrixData::Single(out), MatrixData::Single(m), Location::Device) => {
                let device = self.device.as_ref().ok_or_else(|| {
                    SolverError::Config(
                        "device batch given to a host-only inverter; use BatchInverter::with_device"
                            .into(),
                    )
                })?;
                device.invert(out, m, a.n, a.batch)?
            }
            (MatrixData::Double(_), MatrixData::Double(_), Location::Device) => {
                return Err(SolverError::Config(
                    "batched inversion is not built for double precision on the device".into(),
                ))
            }
            _ => {
                return Err(SolverError::Config(
                    "batch storage does not match its precision".into(),
                ))
            }
        }

        let flops = a.inversion_flops();
        tracing::debug!(flops, "batched inversion done");
        Ok(flops)
    }

    /// Invert every matrix of `a` in place.
    pub fn invert_in_place(&self, a: &mut MatrixBatch) -> Result<u64> {
        let input = a.clone();
        self.invert(a, &input)
    }
}
