//! Loop nest construction.
//!
//! Every axis of the tensor being computed maps to a loop key: the axis
//! itself, or, inside the compute-at prefix, the key of the consumer axis it
//! is computed at. Consecutive expressions sharing a key prefix share those
//! loops. Axes bound to the launch geometry and broadcast axes open an
//! implicit scope: they provide an index but emit no loop.

use std::collections::{BTreeSet, HashMap};

use crate::error::{FusionError, FusionResult};
use crate::fusion::Fusion;
use crate::ir::{BinaryOpType, DataType, ExprId, ExprKind, ParallelType, ValId};
use crate::transform::root_pairs;

use super::index::{self, IndexMap};
use super::predicate::root_predicate;
use super::{reduction_parallelism, KernelNode, LoweredExpr, LoweredOp, ReductionPlan};

struct Scope {
    key: ValId,
    index: ValId,
    /// `Some((iter_domain, extent))` for a real loop.
    emitted: Option<(ValId, ValId)>,
    body: Vec<KernelNode>,
}

pub(super) struct Lowered {
    pub body: Vec<KernelNode>,
    pub reduction_ops: BTreeSet<(BinaryOpType, DataType)>,
    pub grid_reductions: Vec<ExprId>,
    pub hardware_indices: Vec<(ParallelType, ValId)>,
}

pub(super) struct LoopNestBuilder<'a> {
    fusion: &'a mut Fusion,
    strides: &'a HashMap<ValId, Vec<ValId>>,
    root: Vec<KernelNode>,
    scopes: Vec<Scope>,
    hardware: Vec<(ParallelType, ValId)>,
    reduction_ops: BTreeSet<(BinaryOpType, DataType)>,
    grid_reductions: Vec<ExprId>,
}

impl<'a> LoopNestBuilder<'a> {
    pub fn new(fusion: &'a mut Fusion, strides: &'a HashMap<ValId, Vec<ValId>>) -> Self {
        LoopNestBuilder {
            fusion,
            strides,
            root: Vec::new(),
            scopes: Vec::new(),
            hardware: Vec::new(),
            reduction_ops: BTreeSet::new(),
            grid_reductions: Vec::new(),
        }
    }

    pub fn finish(mut self) -> Lowered {
        self.close_to(0);
        Lowered {
            body: self.root,
            reduction_ops: self.reduction_ops,
            grid_reductions: self.grid_reductions,
            hardware_indices: self.hardware,
        }
    }

    fn body(&mut self) -> &mut Vec<KernelNode> {
        match self.scopes.last_mut() {
            Some(scope) => &mut scope.body,
            None => &mut self.root,
        }
    }

    fn body_at(&mut self, depth: usize) -> &mut Vec<KernelNode> {
        match depth.checked_sub(1).and_then(|scope| self.scopes.get_mut(scope)) {
            Some(scope) => &mut scope.body,
            None => &mut self.root,
        }
    }

    fn close_to(&mut self, depth: usize) {
        while self.scopes.len() > depth {
            let Some(scope) = self.scopes.pop() else {
                break;
            };
            let nodes = match scope.emitted {
                Some((iter_domain, extent)) => vec![KernelNode::ForLoop {
                    index: scope.index,
                    iter_domain,
                    extent,
                    body: scope.body,
                }],
                None => scope.body,
            };
            self.body().extend(nodes);
        }
    }

    fn hardware_index(&mut self, parallel: ParallelType) -> FusionResult<ValId> {
        if let Some((_, index)) = self.hardware.iter().find(|(p, _)| *p == parallel) {
            return Ok(*index);
        }
        let name = parallel
            .index_name()
            .ok_or_else(|| FusionError::lowering(format!("{parallel} has no launch index")))?;
        let index = self.fusion.new_named_scalar(name, DataType::Int);
        self.hardware.push((parallel, index));
        Ok(index)
    }

    /// Index value for iterating `axis`, and whether that needs a loop.
    fn axis_index(&mut self, axis: ValId) -> FusionResult<(ValId, bool)> {
        let id = self.fusion.iter_domain(axis)?.clone();
        if id.is_thread() {
            return Ok((self.hardware_index(id.parallel)?, false));
        }
        if id.is_broadcast() {
            return Ok((self.fusion.new_int(0), false));
        }
        Ok((self.fusion.new_symbolic(DataType::Int), true))
    }

    fn open(&mut self, key: ValId) -> FusionResult<()> {
        let (index, needs_loop) = self.axis_index(key)?;
        let emitted = if needs_loop {
            Some((key, self.fusion.iter_domain(key)?.extent))
        } else {
            None
        };
        self.scopes.push(Scope {
            key,
            index,
            emitted,
            body: Vec::new(),
        });
        Ok(())
    }

    /// Axis whose loop iterates axis `axis` of `tv`.
    fn loop_key(&self, tv: ValId, axis: usize) -> FusionResult<ValId> {
        let view = self.fusion.tensor(tv)?;
        if let Some(ca) = &view.compute_at {
            if axis < ca.position {
                let consumer_axis = ca.axis_map.get(axis).copied().ok_or_else(|| {
                    FusionError::lowering(format!("{tv} has no compute-at mapping for axis {axis}"))
                })?;
                return self.loop_key(ca.view, consumer_axis);
            }
        }
        view.domain
            .axes
            .get(axis)
            .copied()
            .ok_or_else(|| FusionError::lowering(format!("{tv} has no axis {axis}")))
    }

    fn is_global(&self, tv: ValId) -> bool {
        self.fusion.is_input(tv) || self.fusion.is_output(tv)
    }

    pub fn lower_expr(&mut self, expr_id: ExprId) -> FusionResult<()> {
        let expr = self.fusion.expr(expr_id)?.clone();
        let out = expr
            .single_output()
            .ok_or(FusionError::MultiOutput(expr_id))?;
        let view = self.fusion.tensor(out)?.clone();
        let axes = view.domain.axes.clone();
        let position = view.compute_at.as_ref().map_or(0, |ca| ca.position);

        let mut keys = Vec::with_capacity(axes.len());
        for axis in 0..axes.len() {
            keys.push(self.loop_key(out, axis)?);
        }
        let shared = self
            .scopes
            .iter()
            .zip(&keys)
            .take_while(|(scope, key)| scope.key == **key)
            .count();
        self.close_to(shared);

        let mut first_reduction = None;
        for (axis, &id) in axes.iter().enumerate() {
            if self.fusion.iter_domain(id)?.is_reduction() {
                first_reduction = Some(axis);
                break;
            }
        }
        if let Some(first) = first_reduction {
            if first < position {
                return Err(FusionError::lowering(format!(
                    "T{} reduces inside its compute-at range (axis {first} < {position})",
                    self.fusion.name(out)?
                )));
            }
        }

        // Producers computed at this tensor may already have opened some of
        // its loops; allocation and initialisation go in front of those.
        for axis in 0..=axes.len() {
            if axis == position && !self.is_global(out) {
                let size = index::allocation_size(self.fusion, out)?;
                self.body_at(position).push(KernelNode::Allocate {
                    buffer: out,
                    dtype: view.dtype,
                    size,
                });
            }
            if Some(axis) == first_reduction {
                self.emit_init(expr_id, &expr.kind, out, axis)?;
            }
            if axis < keys.len() && self.scopes.len() == axis {
                self.open(keys[axis])?;
            }
        }
        self.emit_compute(expr_id, &expr.kind, &expr.inputs, out)
    }

    /// `out = init` over every element of `out`, placed right before the
    /// loop of its first reduction axis.
    fn emit_init(
        &mut self,
        expr_id: ExprId,
        kind: &ExprKind,
        out: ValId,
        first_reduction: usize,
    ) -> FusionResult<()> {
        let ExprKind::Reduction { init, .. } = kind else {
            return Err(FusionError::lowering(format!(
                "T{} has reduction axes but is not produced by a reduction",
                self.fusion.name(out)?
            )));
        };
        let axes = self.fusion.axes(out)?.to_vec();
        let mut axis_indices = IndexMap::new();
        for (scope, &axis) in self.scopes.iter().zip(&axes[..first_reduction]) {
            axis_indices.insert(axis, scope.index);
        }
        let mut loops = Vec::new();
        for &axis in &axes[first_reduction..] {
            if self.fusion.iter_domain(axis)?.is_reduction() {
                continue;
            }
            let (index, needs_loop) = self.axis_index(axis)?;
            if needs_loop {
                loops.push((index, axis, self.fusion.iter_domain(axis)?.extent));
            }
            axis_indices.insert(axis, index);
        }

        let root_indices = self.root_indices(out, &axis_indices)?;
        let output = self.output_index(out, &axis_indices, &root_indices)?;
        let mut nodes = vec![KernelNode::Expr(LoweredExpr {
            origin: expr_id,
            op: LoweredOp::Set,
            output,
            inputs: vec![*init],
        })];
        if let Some(cond) = root_predicate(self.fusion, out, &root_indices, false)? {
            nodes = vec![KernelNode::IfThenElse {
                cond,
                then_body: nodes,
                else_body: Vec::new(),
            }];
        }
        for (index, iter_domain, extent) in loops.into_iter().rev() {
            nodes = vec![KernelNode::ForLoop {
                index,
                iter_domain,
                extent,
                body: nodes,
            }];
        }
        self.body_at(first_reduction).extend(nodes);
        Ok(())
    }

    fn emit_compute(
        &mut self,
        expr_id: ExprId,
        kind: &ExprKind,
        inputs: &[ValId],
        out: ValId,
    ) -> FusionResult<()> {
        let axes = self.fusion.axes(out)?.to_vec();
        let mut axis_indices = IndexMap::new();
        for (scope, &axis) in self.scopes.iter().zip(&axes) {
            axis_indices.insert(axis, scope.index);
        }
        let root_indices = self.root_indices(out, &axis_indices)?;
        let output = self.output_index(out, &axis_indices, &root_indices)?;

        let mut lowered_inputs = Vec::with_capacity(inputs.len());
        for &input in inputs {
            if self.fusion.is_tensor(input) {
                lowered_inputs.push(self.producer_index(input, out, &root_indices)?);
            } else {
                lowered_inputs.push(input);
            }
        }

        let op = match kind {
            ExprKind::Unary(_) | ExprKind::Binary(_) | ExprKind::Ternary(_) => {
                LoweredOp::Elementwise(kind.clone())
            }
            ExprKind::Broadcast { .. } => LoweredOp::Set,
            ExprKind::Reduction { op, .. } => {
                let dtype = self.fusion.dtype(inputs[0])?;
                self.reduction_ops.insert((*op, dtype));
                let (threads, blocks) = reduction_parallelism(self.fusion, out)?;
                let mut plan = ReductionPlan {
                    op: *op,
                    dtype,
                    threads,
                    blocks,
                    grid_slot: None,
                };
                if plan.is_grid() {
                    plan.grid_slot = Some(self.grid_reductions.len());
                    self.grid_reductions.push(expr_id);
                }
                LoweredOp::Reduce(plan)
            }
        };

        let mut node = KernelNode::Expr(LoweredExpr {
            origin: expr_id,
            op,
            output,
            inputs: lowered_inputs,
        });
        if let Some(cond) = root_predicate(self.fusion, out, &root_indices, true)? {
            node = KernelNode::IfThenElse {
                cond,
                then_body: vec![node],
                else_body: Vec::new(),
            };
        }
        self.body().push(node);
        Ok(())
    }

    fn root_indices(&mut self, tv: ValId, axis_indices: &IndexMap) -> FusionResult<IndexMap> {
        let records: Vec<_> = self
            .fusion
            .tensor(tv)?
            .domain
            .all_transforms()
            .copied()
            .collect();
        let mut indices = axis_indices.clone();
        index::backward(self.fusion, &records, &mut indices)?;
        Ok(indices)
    }

    fn output_index(
        &mut self,
        tv: ValId,
        axis_indices: &IndexMap,
        root_indices: &IndexMap,
    ) -> FusionResult<ValId> {
        let terms = if self.is_global(tv) {
            let strides = self.param_strides(tv)?;
            index::global_terms(self.fusion, tv, root_indices, &strides)?
        } else {
            index::local_terms(self.fusion, tv, axis_indices)?
        };
        self.fusion.new_tensor_index(tv, terms)
    }

    /// Element of `producer` read while computing `consumer` at the given
    /// consumer root indices.
    fn producer_index(
        &mut self,
        producer: ValId,
        consumer: ValId,
        consumer_roots: &IndexMap,
    ) -> FusionResult<ValId> {
        let mut indices = IndexMap::new();
        for (consumer_id, producer_id) in root_pairs(self.fusion, producer, consumer)? {
            if let Some(&index) = consumer_roots.get(&consumer_id) {
                indices.insert(producer_id, index);
            }
        }
        let domain = self.fusion.tensor(producer)?.domain.clone();
        let terms = if self.is_global(producer) {
            index::backward(self.fusion, &domain.root_history, &mut indices)?;
            let strides = self.param_strides(producer)?;
            index::global_terms(self.fusion, producer, &indices, &strides)?
        } else {
            index::forward(self.fusion, &domain.history, &mut indices)?;
            index::local_terms(self.fusion, producer, &indices)?
        };
        self.fusion.new_tensor_index(producer, terms)
    }

    fn param_strides(&self, tv: ValId) -> FusionResult<Vec<ValId>> {
        self.strides.get(&tv).cloned().ok_or_else(|| {
            FusionError::lowering(format!("no stride symbols for global tensor {tv}"))
        })
    }
}
