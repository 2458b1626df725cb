//! Scheduling transforms on a tensor's axes.
//!
//! Split and merge append a [`DomainTransform`] record to the tensor's
//! history and create new axes whose extents are expressions over the old
//! ones (`ceilDiv(N, f)` and `a * b`), so the domain is part of the
//! expression graph. Replay, rfactor and computeAt build on these records.

mod compute_at;
mod replay;
mod rfactor;

use std::collections::HashSet;

use crate::arith;
use crate::error::{FusionError, FusionResult};
use crate::fusion::{normalize_axis, Fusion};
use crate::ir::{DataType, DomainTransform, IterType, ParallelType, ValId};

pub(crate) use replay::root_pairs;
pub use replay::ReplayOutcome;

impl Fusion {
    /// Splits axis `axis` of `tv` by a constant factor; the inner axis gets
    /// extent `factor`.
    pub fn split(&mut self, tv: ValId, axis: i64, factor: i64) -> FusionResult<()> {
        if factor <= 0 {
            return Err(FusionError::InvalidSplit(format!(
                "split factor must be positive, got {factor}"
            )));
        }
        let factor = self.new_int(factor);
        self.split_by(tv, axis, factor)
    }

    /// Splits by a held integer value.
    pub fn split_by(&mut self, tv: ValId, axis: i64, factor: ValId) -> FusionResult<()> {
        if self.dtype(factor)? != DataType::Int || !self.val(factor)?.is_scalar() {
            return Err(FusionError::InvalidSplit(format!(
                "split factor {factor} must be an integer scalar"
            )));
        }
        let index = normalize_axis(axis, self.ndims(tv)?)?;
        self.check_outside_compute_at(tv, index, "split")?;

        let id = self.tensor(tv)?.domain.axes[index];
        let (outer, inner) = self.split_iter_domain(id, factor)?;
        let domain = &mut self.tensor_mut(tv)?.domain;
        domain.axes.splice(index..=index, [outer, inner]);
        domain.history.push(DomainTransform::Split {
            input: id,
            outer,
            inner,
            factor,
        });
        Ok(())
    }

    /// Merges two adjacent axes into one of extent `outer * inner`.
    pub fn merge(&mut self, tv: ValId, outer: i64, inner: i64) -> FusionResult<()> {
        let ndims = self.ndims(tv)?;
        let outer = normalize_axis(outer, ndims)?;
        let inner = normalize_axis(inner, ndims)?;
        if inner != outer + 1 {
            return Err(FusionError::NonAdjacentMerge { outer, inner });
        }
        self.check_outside_compute_at(tv, outer, "merge")?;

        let (outer_id, inner_id) = {
            let axes = &self.tensor(tv)?.domain.axes;
            (axes[outer], axes[inner])
        };
        let outer_reduces = self.iter_domain(outer_id)?.is_reduction();
        let inner_reduces = self.iter_domain(inner_id)?.is_reduction();
        if outer_reduces != inner_reduces {
            return Err(FusionError::IncompatibleMerge {
                outer,
                inner,
                reason: "cannot merge a reduction axis with an iteration axis".into(),
            });
        }

        let merged = self.merge_iter_domains(outer_id, inner_id)?;
        let domain = &mut self.tensor_mut(tv)?.domain;
        domain.axes.splice(outer..=inner, [merged]);
        domain.history.push(DomainTransform::Merge {
            outer: outer_id,
            inner: inner_id,
            out: merged,
        });
        Ok(())
    }

    /// Moves axes according to `old_to_new` pairs. Axes not named keep
    /// their relative order in the remaining slots.
    pub fn reorder(&mut self, tv: ValId, old_to_new: &[(i64, i64)]) -> FusionResult<()> {
        let ndims = self.ndims(tv)?;
        let mut placed = vec![None; ndims];
        let mut moved = HashSet::new();
        for &(old, new) in old_to_new {
            let old = normalize_axis(old, ndims)
                .map_err(|_| FusionError::InvalidReorder(format!("axis {old} out of range")))?;
            let new = normalize_axis(new, ndims)
                .map_err(|_| FusionError::InvalidReorder(format!("axis {new} out of range")))?;
            if !moved.insert(old) {
                return Err(FusionError::InvalidReorder(format!(
                    "axis {old} is moved twice"
                )));
            }
            if placed[new].is_some() {
                return Err(FusionError::InvalidReorder(format!(
                    "two axes are moved to position {new}"
                )));
            }
            placed[new] = Some(old);
        }
        if let Some(ca) = &self.tensor(tv)?.compute_at {
            for (new, old) in placed.iter().enumerate() {
                let Some(old) = *old else { continue };
                if old != new && (old < ca.position || new < ca.position) {
                    return Err(FusionError::ComputeAtConflict(format!(
                        "cannot move axis {old} to {new} across the compute-at position {}",
                        ca.position
                    )));
                }
            }
        }

        let axes = self.tensor(tv)?.domain.axes.clone();
        let mut rest = (0..ndims).filter(|old| !moved.contains(old));
        let mut reordered = Vec::with_capacity(ndims);
        for slot in placed {
            let old = match slot {
                Some(old) => old,
                None => rest
                    .next()
                    .ok_or_else(|| FusionError::InvalidReorder("ran out of axes".into()))?,
            };
            reordered.push(axes[old]);
        }
        self.tensor_mut(tv)?.domain.axes = reordered;
        Ok(())
    }

    /// Binds axis `axis` of `tv` to a loop or hardware dimension.
    pub fn parallelize(&mut self, tv: ValId, axis: i64, parallel: ParallelType) -> FusionResult<()> {
        let id = self.axis(tv, axis)?;
        self.iter_domain_mut(id)?.parallel = parallel;
        Ok(())
    }

    fn check_outside_compute_at(&self, tv: ValId, index: usize, what: &str) -> FusionResult<()> {
        if let Some(ca) = &self.tensor(tv)?.compute_at {
            if index < ca.position {
                return Err(FusionError::ComputeAtConflict(format!(
                    "cannot {what} axis {index}: it is inside the compute-at range of {}",
                    ca.position
                )));
            }
        }
        Ok(())
    }

    /// New outer/inner axes for splitting `id` by `factor`.
    pub(crate) fn split_iter_domain(&mut self, id: ValId, factor: ValId) -> FusionResult<(ValId, ValId)> {
        let source = self.iter_domain(id)?.clone();
        if self.const_int(source.start) != Some(0) {
            return Err(FusionError::InvalidSplit(
                "only axes starting at zero can be split".into(),
            ));
        }
        let outer_extent = arith::ceil_div(self, source.extent, factor)?;
        let outer = self.new_iter_domain(
            source.start,
            outer_extent,
            source.iter_type,
            ParallelType::Serial,
            source.rfactor_product,
        )?;
        let inner = self.new_iter_domain(
            source.start,
            factor,
            source.iter_type,
            ParallelType::Serial,
            source.rfactor_product,
        )?;
        Ok((outer, inner))
    }

    /// New axis covering `outer` x `inner`.
    pub(crate) fn merge_iter_domains(&mut self, outer: ValId, inner: ValId) -> FusionResult<ValId> {
        let lhs = self.iter_domain(outer)?.clone();
        let rhs = self.iter_domain(inner)?.clone();
        if self.const_int(lhs.start) != Some(0) || self.const_int(rhs.start) != Some(0) {
            return Err(FusionError::TypeMismatch(
                "only axes starting at zero can be merged".into(),
            ));
        }
        let iter_type = match (lhs.iter_type, rhs.iter_type) {
            (IterType::Broadcast, IterType::Broadcast) => IterType::Broadcast,
            (IterType::Reduction, _) | (_, IterType::Reduction) => IterType::Reduction,
            _ => IterType::Iteration,
        };
        let extent = arith::mul(self, lhs.extent, rhs.extent)?;
        self.new_iter_domain(
            lhs.start,
            extent,
            iter_type,
            ParallelType::Serial,
            lhs.rfactor_product || rhs.rfactor_product,
        )
    }
}
