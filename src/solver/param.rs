//! Solver parameters.
//!
//! Inputs are read once per call; the output fields (`iter`, `gflops`,
//! `secs`, `true_res` and the update counters) are written by the solver.
//! Counts and times accumulate across calls on the same record.

use crate::comm::ReduceScope;
use crate::error::{Result, SolverError};
use crate::field::Precision;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InverterType {
    /// Minimal residual.
    Mr,
    /// BiCGstab with reliable updates.
    BiCgStab,
}

/// Whether the caller's source vector must survive the solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreserveSource {
    /// The source may be overwritten; MR leaves the final residual in it.
    No,
    #[default]
    Yes,
}

/// Diagnostic level. Ordered from quiet to noisy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    Silent,
    #[default]
    Summarize,
    Verbose,
    DebugVerbose,
}

/// Whether a solve stands on its own or runs inside another solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SolverRole {
    #[default]
    Outer,
    /// Inner solve: leaves the shared counters and timers to the caller.
    Preconditioner,
}

#[derive(Debug, Clone)]
pub struct SolverParam {
    pub inv_type: InverterType,
    /// Solver used as preconditioner by an outer method, if any. Neither
    /// MR nor BiCGstab here applies one, so `validate` refuses `Some`.
    pub inv_type_precondition: Option<InverterType>,
    /// Relative residual target, `|r| <= tol |b|`.
    pub tol: f64,
    pub maxiter: usize,
    /// Reliable-update threshold.
    pub delta: f64,
    /// MR relaxation factor.
    pub omega: f64,
    /// Precision of the precise vectors and operator.
    pub precision: Precision,
    /// Precision of the iterated vectors.
    pub precision_sloppy: Precision,
    pub preserve_source: PreserveSource,
    pub role: SolverRole,
    pub reduction_scope: ReduceScope,
    pub verbosity: Verbosity,

    // Outputs
    pub iter: usize,
    pub gflops: f64,
    pub secs: f64,
    pub true_res: f64,
    pub residual_updates: usize,
    pub solution_updates: usize,
}

impl Default for SolverParam {
    fn default() -> Self {
        Self {
            inv_type: InverterType::BiCgStab,
            inv_type_precondition: None,
            tol: 1e-10,
            maxiter: 1000,
            delta: 0.1,
            omega: 1.0,
            precision: Precision::Double,
            precision_sloppy: Precision::Single,
            preserve_source: PreserveSource::Yes,
            role: SolverRole::Outer,
            reduction_scope: ReduceScope::Global,
            verbosity: Verbosity::Summarize,
            iter: 0,
            gflops: 0.0,
            secs: 0.0,
            true_res: 0.0,
            residual_updates: 0,
            solution_updates: 0,
        }
    }
}

impl SolverParam {
    pub fn new(inv_type: InverterType) -> Self {
        Self {
            inv_type,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.tol.is_finite() || self.tol < 0.0 {
            return Err(SolverError::Config(format!(
                "tolerance must be finite and non-negative, got {}",
                self.tol
            )));
        }
        if !self.delta.is_finite() || self.delta < 0.0 {
            return Err(SolverError::Config(format!(
                "reliable delta must be finite and non-negative, got {}",
                self.delta
            )));
        }
        if !self.omega.is_finite() || self.omega == 0.0 {
            return Err(SolverError::Config(format!(
                "relaxation factor must be finite and non-zero, got {}",
                self.omega
            )));
        }
        if let Some(inner) = self.inv_type_precondition {
            return Err(SolverError::Config(format!(
                "{:?} does not take a preconditioner, got {inner:?}",
                self.inv_type
            )));
        }
        Ok(())
    }

    /// Parameters for an inner solve run as a preconditioner of this one:
    /// local reductions, no accounting, no diagnostics. Outputs start at
    /// zero.
    pub fn preconditioner(&self, inv_type: InverterType) -> Self {
        Self {
            inv_type,
            inv_type_precondition: None,
            role: SolverRole::Preconditioner,
            reduction_scope: ReduceScope::Local,
            verbosity: Verbosity::Silent,
            iter: 0,
            gflops: 0.0,
            secs: 0.0,
            true_res: 0.0,
            residual_updates: 0,
            solution_updates: 0,
            ..self.clone()
        }
    }

    pub fn is_preconditioner(&self) -> bool {
        self.role == SolverRole::Preconditioner
    }

    /// Whether diagnostics at `level` should be emitted.
    pub fn verbose(&self, level: Verbosity) -> bool {
        self.verbosity >= level
    }
}
