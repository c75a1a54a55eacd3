//! Communication backend abstraction for global reductions.
//!
//! The fused kernels reduce over the local lattice first; when the reduction
//! scope is global the partial result is summed across ranks through this
//! trait. A single-process implementation passes values through.

/// Abstraction over inter-process communication for reductions.
pub trait CommunicationBackend: Send + Sync {
    /// Sum a local scalar across all ranks.
    fn all_reduce_sum(&self, local: f64) -> f64;

    /// Element-wise sum of a vector across all ranks, in place.
    ///
    /// Complex and multi-component reduction results are packed into one
    /// vector so that a fused reduction costs a single collective.
    fn all_reduce_sum_vec(&self, local: &mut [f64]);

    /// Max of a local scalar across all ranks.
    fn all_reduce_max(&self, local: f64) -> f64;

    /// This process's rank.
    fn rank(&self) -> usize;

    /// Total number of ranks.
    fn num_ranks(&self) -> usize;
}

/// Extent of a fused reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReduceScope {
    /// Sum across every rank of the communicator.
    #[default]
    Global,
    /// Sum over the local partition only, as a domain-decomposition
    /// preconditioner does.
    Local,
}

/// No-op communication backend for single-process execution.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcessComm;

impl CommunicationBackend for SingleProcessComm {
    fn all_reduce_sum(&self, local: f64) -> f64 {
        local
    }

    fn all_reduce_sum_vec(&self, _local: &mut [f64]) {
        // Single process: vector is already complete.
    }

    fn all_reduce_max(&self, local: f64) -> f64 {
        local
    }

    fn rank(&self) -> usize {
        0
    }

    fn num_ranks(&self) -> usize {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_process_reductions_pass_through() {
        let comm = SingleProcessComm;
        assert_eq!(comm.all_reduce_sum(-1.5), -1.5);
        assert_eq!(comm.all_reduce_max(0.25), 0.25);
        // Packed (re, im, norm) triple as a fused reduction sends it.
        let mut packed = [0.5, -2.0, 4.25];
        comm.all_reduce_sum_vec(&mut packed);
        assert_eq!(packed, [0.5, -2.0, 4.25]);
    }

    #[test]
    fn single_process_is_rank_zero_of_one() {
        let comm = SingleProcessComm;
        assert_eq!((comm.rank(), comm.num_ranks()), (0, 1));
        assert_eq!(ReduceScope::default(), ReduceScope::Global);
    }
}
