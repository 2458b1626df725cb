//! Index arithmetic between a tensor's axes, its rfactor domain and its
//! root.
//!
//! Going from axes to root inverts each transform record: a split's input
//! is `outer * factor + inner`, a merge's inputs are `out / extent(inner)`
//! and `out % extent(inner)`. Going forward splits with `/` and `%` and
//! merges with `outer * extent(inner) + inner`.

use std::collections::HashMap;

use crate::arith;
use crate::error::FusionResult;
use crate::fusion::Fusion;
use crate::ir::{DomainTransform, ValId};

/// IterDomain -> index value.
pub(super) type IndexMap = HashMap<ValId, ValId>;

fn is_const(fusion: &Fusion, val: ValId, value: i64) -> bool {
    fusion.const_int(val) == Some(value)
}

pub(super) fn add(fusion: &mut Fusion, a: ValId, b: ValId) -> FusionResult<ValId> {
    if is_const(fusion, a, 0) {
        return Ok(b);
    }
    if is_const(fusion, b, 0) {
        return Ok(a);
    }
    arith::add(fusion, a, b)
}

pub(super) fn mul(fusion: &mut Fusion, a: ValId, b: ValId) -> FusionResult<ValId> {
    if is_const(fusion, a, 1) || is_const(fusion, b, 0) {
        return Ok(b);
    }
    if is_const(fusion, b, 1) || is_const(fusion, a, 0) {
        return Ok(a);
    }
    arith::mul(fusion, a, b)
}

fn div(fusion: &mut Fusion, a: ValId, b: ValId) -> FusionResult<ValId> {
    if is_const(fusion, b, 1) || is_const(fusion, a, 0) {
        return Ok(a);
    }
    arith::div(fusion, a, b)
}

fn rem(fusion: &mut Fusion, a: ValId, b: ValId) -> FusionResult<ValId> {
    if is_const(fusion, b, 1) {
        return Ok(fusion.new_int(0));
    }
    if is_const(fusion, a, 0) {
        return Ok(a);
    }
    arith::modulo(fusion, a, b)
}

fn inner_extent(fusion: &Fusion, id: ValId) -> FusionResult<ValId> {
    Ok(fusion.iter_domain(id)?.extent)
}

/// Extends `indices` toward the root by undoing `records` last to first.
pub(super) fn backward(
    fusion: &mut Fusion,
    records: &[DomainTransform],
    indices: &mut IndexMap,
) -> FusionResult<()> {
    for record in records.iter().rev() {
        match *record {
            DomainTransform::Split {
                input,
                outer,
                inner,
                factor,
            } => {
                let (o, i) = (indices.get(&outer).copied(), indices.get(&inner).copied());
                if o.is_none() && i.is_none() {
                    continue;
                }
                let zero = fusion.new_int(0);
                let scaled = mul(fusion, o.unwrap_or(zero), factor)?;
                let index = add(fusion, scaled, i.unwrap_or(zero))?;
                indices.insert(input, index);
            }
            DomainTransform::Merge { outer, inner, out } => {
                let Some(&index) = indices.get(&out) else {
                    continue;
                };
                let extent = inner_extent(fusion, inner)?;
                let outer_index = div(fusion, index, extent)?;
                let inner_index = rem(fusion, index, extent)?;
                indices.insert(outer, outer_index);
                indices.insert(inner, inner_index);
            }
        }
    }
    Ok(())
}

/// Extends `indices` toward the leaves by applying `records` in order.
pub(super) fn forward(
    fusion: &mut Fusion,
    records: &[DomainTransform],
    indices: &mut IndexMap,
) -> FusionResult<()> {
    for record in records {
        match *record {
            DomainTransform::Split {
                input,
                outer,
                inner,
                factor,
            } => {
                let Some(&index) = indices.get(&input) else {
                    continue;
                };
                let outer_index = div(fusion, index, factor)?;
                let inner_index = rem(fusion, index, factor)?;
                indices.insert(outer, outer_index);
                indices.insert(inner, inner_index);
            }
            DomainTransform::Merge { outer, inner, out } => {
                let (o, i) = (indices.get(&outer).copied(), indices.get(&inner).copied());
                if o.is_none() && i.is_none() {
                    continue;
                }
                let zero = fusion.new_int(0);
                let extent = inner_extent(fusion, inner)?;
                let scaled = mul(fusion, o.unwrap_or(zero), extent)?;
                let index = add(fusion, scaled, i.unwrap_or(zero))?;
                indices.insert(out, index);
            }
        }
    }
    Ok(())
}

/// Terms of `sum(root_index[k] * stride[k])` over the non-reduction root
/// axes of a tensor living in global memory. Broadcast axes contribute
/// nothing.
pub(super) fn global_terms(
    fusion: &mut Fusion,
    tv: ValId,
    root_indices: &IndexMap,
    strides: &[ValId],
) -> FusionResult<Vec<ValId>> {
    let root = fusion.tensor(tv)?.domain.root.clone();
    let root = fusion.no_reductions(&root)?;
    let mut terms = Vec::new();
    for (k, id) in root.into_iter().enumerate() {
        if fusion.iter_domain(id)?.is_broadcast() {
            continue;
        }
        let (Some(&index), Some(&stride)) = (root_indices.get(&id), strides.get(k)) else {
            continue;
        };
        if is_const(fusion, index, 0) {
            continue;
        }
        terms.push(mul(fusion, index, stride)?);
    }
    Ok(terms)
}

/// Axes of a local tensor that occupy space in its buffer: those past the
/// compute-at position that are neither reductions, broadcasts nor bound
/// to the launch geometry.
pub(super) fn allocated_axes(fusion: &Fusion, tv: ValId) -> FusionResult<Vec<ValId>> {
    let view = fusion.tensor(tv)?;
    let position = view.compute_at.as_ref().map_or(0, |ca| ca.position);
    let mut axes = Vec::new();
    for &axis in &view.domain.axes[position..] {
        let id = fusion.iter_domain(axis)?;
        if id.is_reduction() || id.is_broadcast() || id.is_thread() {
            continue;
        }
        axes.push(axis);
    }
    Ok(axes)
}

/// Number of elements of a local tensor's buffer.
pub(super) fn allocation_size(fusion: &mut Fusion, tv: ValId) -> FusionResult<ValId> {
    let mut size = fusion.new_int(1);
    for axis in allocated_axes(fusion, tv)? {
        let extent = fusion.iter_domain(axis)?.extent;
        size = mul(fusion, size, extent)?;
    }
    Ok(size)
}

/// Row-major terms over the allocated axes of a local tensor.
pub(super) fn local_terms(
    fusion: &mut Fusion,
    tv: ValId,
    axis_indices: &IndexMap,
) -> FusionResult<Vec<ValId>> {
    let axes = allocated_axes(fusion, tv)?;
    let mut terms = Vec::new();
    for (position, axis) in axes.iter().enumerate() {
        let Some(&index) = axis_indices.get(axis) else {
            continue;
        };
        if is_const(fusion, index, 0) {
            continue;
        }
        let mut term = index;
        for inner in &axes[position + 1..] {
            let extent = fusion.iter_domain(*inner)?.extent;
            term = mul(fusion, term, extent)?;
        }
        terms.push(term);
    }
    Ok(terms)
}
