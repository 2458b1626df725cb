use std::collections::{BTreeSet, HashMap};

use crate::error::{FusionError, FusionResult};
use crate::fusion::{normalize_axis, Fusion};
use crate::ir::{ExprKind, IterType, TensorDomain, ValId};

use super::replay::replay_records;

impl Fusion {
    /// Splits the reduction producing `tv` in two stages.
    ///
    /// The returned tensor reduces over `axes` only; its other reduction
    /// axes become iteration axes marked as rfactor products, and its
    /// rfactor domain is its current axes. `tv` is then redefined as the
    /// reduction of that tensor over the remaining reduction axes.
    pub fn rfactor(&mut self, tv: ValId, axes: &[i64]) -> FusionResult<ValId> {
        let origin = self
            .origin(tv)
            .ok_or_else(|| FusionError::invalid_rfactor(tv, "tensor has no defining expression"))?;
        let expr = self.expr(origin)?.clone();
        let ExprKind::Reduction { op, init } = expr.kind else {
            return Err(FusionError::invalid_rfactor(tv, "tensor is not produced by a reduction"));
        };
        if expr.outputs.len() != 1 {
            return Err(FusionError::MultiOutput(origin));
        }
        let input = expr.inputs[0];

        let view = self.tensor(tv)?.clone();
        let domain = view.domain;
        if domain.has_rfactor() {
            return Err(FusionError::invalid_rfactor(tv, "tensor already has an rfactor domain"));
        }
        if view.compute_at.is_some() {
            return Err(FusionError::invalid_rfactor(
                tv,
                "rfactor must be applied before computeAt",
            ));
        }

        let ndims = domain.ndims();
        let mut selected = BTreeSet::new();
        for &axis in axes {
            let index = normalize_axis(axis, ndims)?;
            if !self.iter_domain(domain.axes[index])?.is_reduction() {
                return Err(FusionError::invalid_rfactor(
                    tv,
                    format!("axis {index} is not a reduction axis"),
                ));
            }
            selected.insert(index);
        }
        if selected.is_empty() {
            return Err(FusionError::invalid_rfactor(tv, "no axes selected"));
        }
        let mut remaining_reductions = 0;
        for (index, &axis) in domain.axes.iter().enumerate() {
            if self.iter_domain(axis)?.is_reduction() && !selected.contains(&index) {
                remaining_reductions += 1;
            }
        }
        if remaining_reductions == 0 {
            return Err(FusionError::invalid_rfactor(
                tv,
                "at least one reduction axis must stay with the final reduction",
            ));
        }

        // Partial reduction: same root and structure, fresh axes.
        let mut id_map = HashMap::new();
        let mut root = Vec::with_capacity(domain.root.len());
        for &id in &domain.root {
            let source = self.iter_domain(id)?.clone();
            let copy = self.new_iter_domain(
                source.start,
                source.extent,
                source.iter_type,
                source.parallel,
                false,
            )?;
            id_map.insert(id, copy);
            root.push(copy);
        }
        let records: Vec<_> = domain.all_transforms().copied().collect();
        let root_history = replay_records(self, &records, &mut id_map)?;

        let mut partial_axes = Vec::with_capacity(ndims);
        for (index, &axis) in domain.axes.iter().enumerate() {
            let mapped = *id_map.get(&axis).ok_or_else(|| {
                FusionError::invalid_rfactor(tv, format!("axis {index} cannot be replayed"))
            })?;
            if self.iter_domain(axis)?.is_reduction() {
                let id = self.iter_domain_mut(mapped)?;
                id.rfactor_product = true;
                if !selected.contains(&index) {
                    id.iter_type = IterType::Iteration;
                }
            }
            partial_axes.push(mapped);
        }
        let partial = self.new_tensor_with_domain(
            TensorDomain {
                root,
                rfactor: Some(partial_axes.clone()),
                axes: partial_axes,
                root_history,
                history: Vec::new(),
            },
            view.dtype,
        );

        // Final reduction: one fresh root axis per unselected axis.
        let mut final_root = Vec::new();
        for (index, &axis) in domain.axes.iter().enumerate() {
            if selected.contains(&index) {
                continue;
            }
            let source = self.iter_domain(axis)?.clone();
            let iter_type = if source.is_reduction() {
                IterType::Reduction
            } else {
                source.iter_type
            };
            final_root.push(self.new_iter_domain(
                source.start,
                source.extent,
                iter_type,
                source.parallel,
                false,
            )?);
        }
        self.tensor_mut(tv)?.domain = TensorDomain::from_root(final_root);

        self.register_expr(ExprKind::Reduction { op, init }, &[input], &[partial])?;
        self.register_expr(ExprKind::Reduction { op, init }, &[partial], &[tv])?;
        Ok(partial)
    }
}

