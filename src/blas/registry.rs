//! Dispatch table for the fused kernels.
//!
//! Each cell maps a storage precision and a spin count to the descriptor
//! the launcher runs with. Cells that are not registered fail closed: there
//! is no generic fallback kernel.

use std::collections::HashMap;

use crate::error::{Result, SolverError};
use crate::field::{FieldLayout, Precision};

/// Launch parameters of one specialised kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelDescriptor {
    /// Complex elements processed by one work item.
    pub unroll: usize,
}

impl KernelDescriptor {
    pub const fn new(unroll: usize) -> Self {
        Self { unroll }
    }
}

/// `(precision, n_spin) -> KernelDescriptor`
#[derive(Debug, Clone, Default)]
pub struct KernelRegistry {
    cells: HashMap<(Precision, usize), KernelDescriptor>,
}

impl KernelRegistry {
    /// A registry with no cells.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in table. Four-spin fields unroll over a whole site,
    /// single-spin fields over one colour vector, two-spin fields run one
    /// element per work item. Half precision has no two-spin kernel.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        for precision in [Precision::Double, Precision::Single] {
            registry.register(precision, 4, KernelDescriptor::new(12));
            registry.register(precision, 2, KernelDescriptor::new(1));
            registry.register(precision, 1, KernelDescriptor::new(3));
        }
        registry.register(Precision::Half, 4, KernelDescriptor::new(12));
        registry.register(Precision::Half, 1, KernelDescriptor::new(3));
        registry
    }

    pub fn register(&mut self, precision: Precision, n_spin: usize, descriptor: KernelDescriptor) {
        self.cells.insert((precision, n_spin), descriptor);
    }

    pub fn contains(&self, precision: Precision, n_spin: usize) -> bool {
        self.cells.contains_key(&(precision, n_spin))
    }

    /// Find the kernel for `precision` and check it can run on `layout`.
    pub fn lookup(&self, precision: Precision, layout: &FieldLayout) -> Result<KernelDescriptor> {
        let descriptor = *self
            .cells
            .get(&(precision, layout.n_spin))
            .ok_or(SolverError::Unsupported {
                precision,
                n_spin: layout.n_spin,
            })?;

        if descriptor.unroll == 0 {
            return Err(SolverError::Config(format!(
                "kernel for {precision:?}/n_spin={} has zero unroll",
                layout.n_spin
            )));
        }
        if descriptor.unroll > 1 && layout.n_color != 3 {
            return Err(SolverError::Config(format!(
                "site unroll only supports n_color=3, got n_color={}",
                layout.n_color
            )));
        }
        if precision == Precision::Half && descriptor.unroll != layout.site_length() {
            return Err(SolverError::Config(format!(
                "half precision needs one site per work item: unroll {} but site length {}",
                descriptor.unroll,
                layout.site_length()
            )));
        }
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_cells() {
        let r = KernelRegistry::standard();
        let wilson = FieldLayout::new(8, 4, 3);
        let staggered = FieldLayout::new(8, 1, 3);
        let two_spin = FieldLayout::new(8, 2, 3);
        for p in [Precision::Half, Precision::Single, Precision::Double] {
            assert_eq!(r.lookup(p, &wilson).unwrap().unroll, 12);
            assert_eq!(r.lookup(p, &staggered).unwrap().unroll, 3);
        }
        assert_eq!(r.lookup(Precision::Double, &two_spin).unwrap().unroll, 1);
        assert_eq!(r.lookup(Precision::Single, &two_spin).unwrap().unroll, 1);
    }

    #[test]
    fn half_two_spin_is_unsupported() {
        let r = KernelRegistry::standard();
        let err = r
            .lookup(Precision::Half, &FieldLayout::new(8, 2, 3))
            .unwrap_err();
        assert!(matches!(
            err,
            SolverError::Unsupported {
                precision: Precision::Half,
                n_spin: 2
            }
        ));
    }

    #[test]
    fn unknown_spin_is_unsupported() {
        let r = KernelRegistry::standard();
        let err = r
            .lookup(Precision::Double, &FieldLayout::new(8, 3, 3))
            .unwrap_err();
        assert!(matches!(err, SolverError::Unsupported { n_spin: 3, .. }));
    }

    #[test]
    fn site_unroll_requires_three_colors() {
        let r = KernelRegistry::standard();
        let err = r
            .lookup(Precision::Double, &FieldLayout::new(8, 4, 2))
            .unwrap_err();
        assert!(matches!(err, SolverError::Config(_)));
        // Two-spin kernels do not unroll, so any colour count is fine.
        assert!(r.lookup(Precision::Double, &FieldLayout::new(8, 2, 5)).is_ok());
    }

    #[test]
    fn custom_half_cell_must_cover_a_site() {
        let mut r = KernelRegistry::empty();
        r.register(Precision::Half, 2, KernelDescriptor::new(3));
        let err = r
            .lookup(Precision::Half, &FieldLayout::new(8, 2, 3))
            .unwrap_err();
        assert!(matches!(err, SolverError::Config(_)));
        assert!(r.contains(Precision::Half, 2));
        assert!(!r.contains(Precision::Double, 2));
    }
}
