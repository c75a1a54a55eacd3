//! Block-parallel launcher for fused reducers.
//!
//! The field is cut into blocks of `BLOCK_ITEMS` work items, each work item
//! covering `unroll` consecutive complex elements. Blocks run on the rayon
//! pool. A work item accumulates its elements in order; partials are then
//! combined pairwise inside each block and across blocks in block order, so
//! the summation tree depends only on the field length and the unroll.

use num_complex::Complex64;
use rayon::prelude::*;

use super::reducer::{ReduceValue, Reducer};
use crate::field::{ColorSpinorField, FieldView, FieldViewMut};

/// Work items per block.
pub(crate) const BLOCK_ITEMS: usize = 64;

/// A fused-kernel operand with its access mode.
pub enum Operand<'a> {
    Read(&'a ColorSpinorField),
    Write(&'a mut ColorSpinorField),
}

impl<'a> Operand<'a> {
    pub fn field(&self) -> &ColorSpinorField {
        match self {
            Operand::Read(f) => f,
            Operand::Write(f) => f,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Operand::Write(_))
    }
}

enum BlockView<'a> {
    Read(FieldView<'a>),
    Write(FieldViewMut<'a>),
}

impl BlockView<'_> {
    fn load(&self, i: usize) -> Complex64 {
        match self {
            BlockView::Read(v) => v.load(i),
            BlockView::Write(v) => v.load(i),
        }
    }

    fn len(&self) -> usize {
        match self {
            BlockView::Read(v) => v.len(),
            BlockView::Write(v) => v.len(),
        }
    }
}

/// Combine partial results pairwise: `(p0+p1) + (p2+p3)` and so on.
pub(crate) fn tree_combine<V: ReduceValue>(mut parts: Vec<V>) -> V {
    while parts.len() > 1 {
        let mut next = Vec::with_capacity(parts.len().div_ceil(2));
        let mut it = parts.into_iter();
        while let Some(a) = it.next() {
            next.push(match it.next() {
                Some(b) => a.combine(b),
                None => a,
            });
        }
        parts = next;
    }
    parts.pop().unwrap_or_else(V::zero)
}

/// Run `reducer` over all operands. Operands must already be validated:
/// equal length, write flags matching `R::WRITES`, and `unroll` a multiple
/// of the site length for half-precision operands.
pub(crate) fn launch<R, const N: usize>(
    reducer: &R,
    operands: [Operand<'_>; N],
    unroll: usize,
) -> R::Value
where
    R: Reducer<N>,
{
    let block_len = BLOCK_ITEMS * unroll;

    let mut per_operand: Vec<std::vec::IntoIter<BlockView<'_>>> = operands
        .into_iter()
        .map(|op| match op {
            Operand::Read(f) => f
                .data()
                .view()
                .blocks(block_len)
                .into_iter()
                .map(BlockView::Read)
                .collect::<Vec<_>>()
                .into_iter(),
            Operand::Write(f) => f
                .data_mut()
                .view_mut()
                .blocks(block_len)
                .into_iter()
                .map(BlockView::Write)
                .collect::<Vec<_>>()
                .into_iter(),
        })
        .collect();

    let n_blocks = per_operand.first().map_or(0, |it| it.len());
    let blocks: Vec<Vec<BlockView<'_>>> = (0..n_blocks)
        .map(|_| per_operand.iter_mut().filter_map(|it| it.next()).collect())
        .collect();

    let partials: Vec<R::Value> = blocks
        .into_par_iter()
        .map(|mut views| run_block::<R, N>(reducer, &mut views, unroll))
        .collect();

    tree_combine(partials)
}

fn run_block<R, const N: usize>(reducer: &R, views: &mut [BlockView<'_>], unroll: usize) -> R::Value
where
    R: Reducer<N>,
{
    let len = views.first().map_or(0, |v| v.len());
    let zero = Complex64::new(0.0, 0.0);
    let mut group = vec![[zero; N]; unroll];
    let mut column = Vec::with_capacity(unroll);
    let mut partials = Vec::with_capacity(len.div_ceil(unroll));

    for start in (0..len).step_by(unroll) {
        let end = (start + unroll).min(len);
        let mut acc = R::Value::zero();
        for (slot, i) in group.iter_mut().zip(start..end) {
            let mut v: [Complex64; N] = std::array::from_fn(|k| views[k].load(i));
            acc = acc.combine(reducer.apply(&mut v));
            *slot = v;
        }
        for (k, view) in views.iter_mut().enumerate() {
            if let BlockView::Write(w) = view {
                column.clear();
                column.extend(group[..end - start].iter().map(|v| v[k]));
                w.store(start, &column);
            }
        }
        partials.push(acc);
    }

    tree_combine(partials)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_combine_pairs_in_order() {
        let big = 2f64.powi(53);
        // Left to right this sums to 3; pairwise the two ones survive.
        let parts = vec![big, 1.0, 1.0, -big, 3.0];
        assert_eq!(tree_combine(parts), 4.0);
    }

    #[test]
    fn tree_combine_empty_is_zero() {
        assert_eq!(tree_combine::<f64>(Vec::new()), 0.0);
    }
}
