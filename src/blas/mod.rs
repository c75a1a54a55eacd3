//! Fused reduction/update kernels.
//!
//! `BlasEngine` owns the dispatch registry, the communicator and the shared
//! flop/byte counters. Kernels are invoked through a `Blas` handle, which
//! pairs the engine with a reduction scope; a solver builds one handle per
//! call from its parameters, so switching between local and global
//! reductions never touches shared state.

mod launch;
pub mod reducer;
pub mod registry;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use num_complex::Complex64;

pub use launch::Operand;
pub use reducer::{Double3, ReduceValue, Reducer};
pub use registry::{KernelDescriptor, KernelRegistry};

use crate::comm::{CommunicationBackend, ReduceScope, SingleProcessComm};
use crate::error::{Result, SolverError};
use crate::field::{ColorSpinorField, Location, Precision};

/// Most operands a fused kernel accepts.
pub const MAX_OPERANDS: usize = 10;

/// Shared kernel state: registry, communicator and accounting counters.
pub struct BlasEngine {
    registry: KernelRegistry,
    comm: Arc<dyn CommunicationBackend>,
    flops: AtomicU64,
    bytes: AtomicU64,
}

impl Default for BlasEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl BlasEngine {
    /// Standard registry, single-process communicator.
    pub fn new() -> Self {
        Self::with_registry(KernelRegistry::standard(), Arc::new(SingleProcessComm))
    }

    pub fn with_comm(comm: Arc<dyn CommunicationBackend>) -> Self {
        Self::with_registry(KernelRegistry::standard(), comm)
    }

    pub fn with_registry(registry: KernelRegistry, comm: Arc<dyn CommunicationBackend>) -> Self {
        Self {
            registry,
            comm,
            flops: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &KernelRegistry {
        &self.registry
    }

    pub fn comm(&self) -> &dyn CommunicationBackend {
        self.comm.as_ref()
    }

    /// Kernel handle reducing over `scope`.
    pub fn blas(&self, scope: ReduceScope) -> Blas<'_> {
        Blas {
            engine: self,
            scope,
        }
    }

    /// Real flops issued by fused kernels since the last reset.
    pub fn flops(&self) -> u64 {
        self.flops.load(Ordering::Relaxed)
    }

    /// Bytes moved by fused kernels since the last reset.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn reset_counters(&self) {
        self.flops.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
    }

    /// Add flops done outside the fused kernels (operator applications).
    pub fn add_flops(&self, flops: u64) {
        self.flops.fetch_add(flops, Ordering::Relaxed);
    }
}

/// A `BlasEngine` bound to a reduction scope.
#[derive(Clone, Copy)]
pub struct Blas<'a> {
    engine: &'a BlasEngine,
    scope: ReduceScope,
}

impl<'a> Blas<'a> {
    pub fn engine(&self) -> &'a BlasEngine {
        self.engine
    }

    pub fn scope(&self) -> ReduceScope {
        self.scope
    }

    /// Run a fused reducer over `operands` and return the reduction.
    ///
    /// Every check happens before any element is touched: arity, write
    /// flags against `R::WRITES`, equal layouts, device location, matching
    /// precisions (unless the reducer converts) and a registered kernel for
    /// each precision involved.
    pub fn reduce<R, const N: usize>(
        &self,
        reducer: &R,
        operands: [Operand<'_>; N],
    ) -> Result<R::Value>
    where
        R: Reducer<N>,
    {
        if !(1..=MAX_OPERANDS).contains(&N) {
            return Err(SolverError::Config(format!(
                "fused kernels take 1 to {MAX_OPERANDS} operands, got {N}"
            )));
        }
        for (k, (op, &writes)) in operands.iter().zip(R::WRITES.iter()).enumerate() {
            if op.is_write() != writes {
                return Err(SolverError::Config(format!(
                    "operand {k} passed as {} but the kernel {} it",
                    if op.is_write() { "write" } else { "read" },
                    if writes { "writes" } else { "only reads" }
                )));
            }
        }

        let Some(first) = operands.first().map(Operand::field) else {
            return Err(SolverError::Config("no operands".into()));
        };
        let layout = first.layout();
        let location = first.location();
        let precision = first.precision();

        for op in &operands[1..] {
            let f = op.field();
            if f.layout() != layout {
                return Err(SolverError::Shape(format!(
                    "operand layout {:?} ({} elements) differs from {:?} ({} elements)",
                    f.layout(),
                    f.length(),
                    layout,
                    first.length()
                )));
            }
            if f.location() != location {
                return Err(SolverError::Location(
                    "fused kernel operands are in mixed locations".into(),
                ));
            }
            if !R::MIXED_PRECISION && f.precision() != precision {
                return Err(SolverError::Config(format!(
                    "operands mix {:?} and {:?} precision",
                    precision,
                    f.precision()
                )));
            }
        }
        if location == Location::Host {
            return Err(SolverError::Location(
                "fused kernels are not implemented for host fields".into(),
            ));
        }

        let mut unroll: Option<usize> = None;
        let mut seen: Vec<Precision> = Vec::with_capacity(N);
        for op in &operands {
            let p = op.field().precision();
            if seen.contains(&p) {
                continue;
            }
            seen.push(p);
            let descriptor = self.engine.registry.lookup(p, &layout)?;
            match unroll {
                Some(u) if u != descriptor.unroll => {
                    return Err(SolverError::Config(format!(
                        "operand precisions need different unrolls ({u} and {})",
                        descriptor.unroll
                    )));
                }
                _ => unroll = Some(descriptor.unroll),
            }
        }
        let unroll = unroll.unwrap_or(1);

        let length = layout.length() as u64;
        let bytes: usize = operands
            .iter()
            .map(|op| op.field().bytes() * if op.is_write() { 2 } else { 1 })
            .sum();

        let value = launch::launch(reducer, operands, unroll);

        self.engine
            .flops
            .fetch_add(R::FLOPS as u64 * length, Ordering::Relaxed);
        self.engine.bytes.fetch_add(bytes as u64, Ordering::Relaxed);

        Ok(match self.scope {
            ReduceScope::Global => value.all_reduce(self.engine.comm()),
            ReduceScope::Local => value,
        })
    }

    /// `x = 0`
    pub fn zero(&self, x: &mut ColorSpinorField) -> Result<()> {
        self.reduce(&reducer::Zero, [Operand::Write(x)])
    }

    /// `dst = src`, converting between precisions.
    pub fn copy(&self, dst: &mut ColorSpinorField, src: &ColorSpinorField) -> Result<()> {
        self.reduce(&reducer::Convert, [Operand::Write(dst), Operand::Read(src)])
    }

    /// `|x|^2`
    pub fn norm2(&self, x: &ColorSpinorField) -> Result<f64> {
        self.reduce(&reducer::Norm2, [Operand::Read(x)])
    }

    /// `x = a x`
    pub fn ax(&self, a: f64, x: &mut ColorSpinorField) -> Result<()> {
        self.reduce(&reducer::Ax(a), [Operand::Write(x)])
    }

    /// `y += a x`
    pub fn axpy(&self, a: f64, x: &ColorSpinorField, y: &mut ColorSpinorField) -> Result<()> {
        self.reduce(&reducer::Axpy(a), [Operand::Read(x), Operand::Write(y)])
    }

    /// `y += x`
    pub fn xpy(&self, x: &ColorSpinorField, y: &mut ColorSpinorField) -> Result<()> {
        self.reduce(&reducer::Xpy, [Operand::Read(x), Operand::Write(y)])
    }

    /// `y -= x`
    pub fn mxpy(&self, x: &ColorSpinorField, y: &mut ColorSpinorField) -> Result<()> {
        self.reduce(&reducer::Mxpy, [Operand::Read(x), Operand::Write(y)])
    }

    /// `y = x - y`, returning `|y|^2`.
    pub fn xmy_norm(&self, x: &ColorSpinorField, y: &mut ColorSpinorField) -> Result<f64> {
        self.reduce(&reducer::XmyNorm, [Operand::Read(x), Operand::Write(y)])
    }

    /// `<x, y> = sum conj(x_i) y_i`
    pub fn cdot(&self, x: &ColorSpinorField, y: &ColorSpinorField) -> Result<Complex64> {
        self.reduce(&reducer::Cdot, [Operand::Read(x), Operand::Read(y)])
    }

    /// `(Re<x,y>, Im<x,y>, |x|^2)` in one pass.
    pub fn cdot_norm_a(&self, x: &ColorSpinorField, y: &ColorSpinorField) -> Result<Double3> {
        self.reduce(&reducer::CdotNormA, [Operand::Read(x), Operand::Read(y)])
    }

    /// `(Re<x,y>, Im<x,y>, |y|^2)` in one pass.
    pub fn cdot_norm_b(&self, x: &ColorSpinorField, y: &ColorSpinorField) -> Result<Double3> {
        self.reduce(&reducer::CdotNormB, [Operand::Read(x), Operand::Read(y)])
    }

    /// `y += a x`
    pub fn caxpy(
        &self,
        a: Complex64,
        x: &ColorSpinorField,
        y: &mut ColorSpinorField,
    ) -> Result<()> {
        self.reduce(&reducer::Caxpy(a), [Operand::Read(x), Operand::Write(y)])
    }

    /// `y += a x`, `x -= a z`, returning `|x|^2`.
    pub fn caxpy_xmaz_norm_x(
        &self,
        a: Complex64,
        x: &mut ColorSpinorField,
        y: &mut ColorSpinorField,
        z: &ColorSpinorField,
    ) -> Result<f64> {
        self.reduce(
            &reducer::CaxpyXmazNormX(a),
            [Operand::Write(x), Operand::Write(y), Operand::Read(z)],
        )
    }

    /// `z = x + a y + b z`
    pub fn cxpaypbz(
        &self,
        x: &ColorSpinorField,
        a: Complex64,
        y: &ColorSpinorField,
        b: Complex64,
        z: &mut ColorSpinorField,
    ) -> Result<()> {
        self.reduce(
            &reducer::Cxpaypbz { a, b },
            [Operand::Read(x), Operand::Read(y), Operand::Write(z)],
        )
    }

    /// `z += a x + b y`, `y -= b w`, returning `(Re<v,y>, Im<v,y>, |y|^2)`.
    #[allow(clippy::too_many_arguments)]
    pub fn caxpbypz_ymbw_cdot_wy_norm_y(
        &self,
        a: Complex64,
        x: &ColorSpinorField,
        b: Complex64,
        y: &mut ColorSpinorField,
        z: &mut ColorSpinorField,
        w: &ColorSpinorField,
        v: &ColorSpinorField,
    ) -> Result<Double3> {
        self.reduce(
            &reducer::CaxpbypzYmbwCdotWyNormY { a, b },
            [
                Operand::Read(x),
                Operand::Write(y),
                Operand::Write(z),
                Operand::Read(w),
                Operand::Read(v),
            ],
        )
    }
}
