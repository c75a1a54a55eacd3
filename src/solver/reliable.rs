//! Reliable-update bookkeeping for mixed-precision Krylov solvers.
//!
//! The iterated residual drifts away from `b - A x` when it is updated in
//! reduced precision. These trackers decide when to recompute the residual
//! in full precision (`update_r`) and when to additionally fold the sloppy
//! solution into the precise accumulator (`update_x`).

/// Per-call reliable-update state.
#[derive(Debug, Clone)]
pub struct ReliableUpdates {
    delta: f64,
    /// Residual norm at the last solution update.
    r0_norm: f64,
    /// Largest residual norm since the last solution update.
    maxrx: f64,
    /// Largest residual norm since the last residual update.
    maxrr: f64,
    residual_updates: usize,
    solution_updates: usize,
}

/// Which updates fire after an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateTrigger {
    pub update_x: bool,
    pub update_r: bool,
}

impl ReliableUpdates {
    pub fn new(delta: f64, r_norm: f64) -> Self {
        Self {
            delta,
            r0_norm: r_norm,
            maxrx: r_norm,
            maxrr: r_norm,
            residual_updates: 0,
            solution_updates: 0,
        }
    }

    /// Record the iterated residual norm and decide which updates fire.
    pub fn observe(&mut self, r_norm: f64) -> UpdateTrigger {
        self.maxrx = self.maxrx.max(r_norm);
        self.maxrr = self.maxrr.max(r_norm);
        let update_x = r_norm < self.delta * self.r0_norm && self.r0_norm <= self.maxrx;
        let update_r = (r_norm < self.delta * self.maxrr && self.r0_norm <= self.maxrr) || update_x;
        UpdateTrigger { update_x, update_r }
    }

    /// The residual was recomputed in full precision with norm `r_norm`.
    pub fn residual_updated(&mut self, r_norm: f64) {
        self.maxrr = r_norm;
        self.residual_updates += 1;
    }

    /// The solution was folded into the accumulator; call after
    /// `residual_updated` with the same norm.
    pub fn solution_updated(&mut self, r_norm: f64) {
        self.r0_norm = r_norm;
        self.maxrx = r_norm;
        self.solution_updates += 1;
    }

    pub fn residual_updates(&self) -> usize {
        self.residual_updates
    }

    pub fn solution_updates(&self) -> usize {
        self.solution_updates
    }

    pub fn r0_norm(&self) -> f64 {
        self.r0_norm
    }

    pub fn maxrx(&self) -> f64 {
        self.maxrx
    }

    pub fn maxrr(&self) -> f64 {
        self.maxrr
    }
}

/// One fired reliable update, recorded for inspection after a solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReliableEvent {
    /// Iteration (1-based) after which the update fired.
    pub iteration: usize,
    /// Squared residual norm carried by the recurrence.
    pub iterated_r2: f64,
    /// Squared norm of the recomputed `b - A x`.
    pub recomputed_r2: f64,
    /// Whether the solution was folded into the accumulator too.
    pub solution_update: bool,
}
