//! The fusion container.
//!
//! A [`Fusion`] owns every value and expression of one computation in two
//! arenas. Nodes refer to each other through arena indices, so a deep copy is
//! a plain `clone()` and a move is [`Fusion::take`].
//!
//! ```text
//!   vals:  [Some(T0), Some(i1), Some(iS{i1}), None, ...]   <- removed slots stay None
//!   exprs: [Some(T2 = T0 + T1), ...]
//!   origin: val -> expr producing it
//!   uses:   val -> exprs consuming it
//! ```

mod context;
mod equality;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};

use once_cell::sync::OnceCell;
use smallvec::SmallVec;

use crate::error::{FusionError, FusionResult};
use crate::ir::{
    ConstValue, DataType, Expr, ExprId, ExprKind, IterDomain, IterType, ParallelType, Scalar,
    TensorDomain, TensorIndex, TensorView, UnaryOpType, Val, ValId, ValKind,
};
use crate::traversal;

pub use context::{
    active_depth, active_fusion, with_active_fusion, with_fusion, FusionGuard, SharedFusion,
};

static REDUCTION_INPUT_WARNED: OnceCell<()> = OnceCell::new();
static NEXT_FUSION_TAG: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct NameCounters {
    tensor: u32,
    value: u32,
    expr: u32,
}

/// Ids carry the tag of the fusion that created them; a fusion only
/// resolves ids with its own tag. Clones keep the tag, so ids stay valid in
/// a copy. `take` moves the tag along with the graph.
#[derive(Debug, Clone)]
pub struct Fusion {
    tag: u32,
    vals: Vec<Option<Val>>,
    exprs: Vec<Option<Expr>>,
    val_order: Vec<ValId>,
    origin: HashMap<ValId, ExprId>,
    uses: HashMap<ValId, BTreeSet<ExprId>>,
    inputs: Vec<ValId>,
    outputs: Vec<ValId>,
    values_map: HashMap<ValId, ValId>,
    counters: NameCounters,
}

impl Default for Fusion {
    fn default() -> Self {
        Fusion {
            tag: NEXT_FUSION_TAG.fetch_add(1, Ordering::Relaxed),
            vals: Vec::new(),
            exprs: Vec::new(),
            val_order: Vec::new(),
            origin: HashMap::new(),
            uses: HashMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            values_map: HashMap::new(),
            counters: NameCounters::default(),
        }
    }
}

impl Fusion {
    pub fn new() -> Self {
        Fusion::default()
    }

    /// New fusion wrapped for use with [`FusionGuard`].
    pub fn new_shared() -> SharedFusion {
        std::rc::Rc::new(std::cell::RefCell::new(Fusion::new()))
    }

    /// Drops every node and resets the name counters. Ids handed out before
    /// the call are no longer accepted.
    pub fn clear(&mut self) {
        *self = Fusion::default();
    }

    /// Moves the whole graph out, leaving `self` empty.
    pub fn take(&mut self) -> Fusion {
        std::mem::take(self)
    }

    pub fn is_empty(&self) -> bool {
        self.val_order.is_empty() && self.exprs.iter().all(Option::is_none)
    }

    // ---------------------------------------------------------------------
    // Node access
    // ---------------------------------------------------------------------

    /// Process-unique tag stamped into every id this fusion creates.
    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn contains_val(&self, val: ValId) -> bool {
        self.val(val).is_ok()
    }

    pub fn contains_expr(&self, expr: ExprId) -> bool {
        self.expr(expr).is_ok()
    }

    pub fn val(&self, val: ValId) -> FusionResult<&Val> {
        if val.fusion_tag() != self.tag {
            return Err(FusionError::UnknownVal(val));
        }
        self.vals
            .get(val.index())
            .and_then(Option::as_ref)
            .ok_or(FusionError::UnknownVal(val))
    }

    pub(crate) fn val_mut(&mut self, val: ValId) -> FusionResult<&mut Val> {
        if val.fusion_tag() != self.tag {
            return Err(FusionError::UnknownVal(val));
        }
        self.vals
            .get_mut(val.index())
            .and_then(Option::as_mut)
            .ok_or(FusionError::UnknownVal(val))
    }

    pub fn expr(&self, expr: ExprId) -> FusionResult<&Expr> {
        if expr.fusion_tag() != self.tag {
            return Err(FusionError::UnknownExpr(expr));
        }
        self.exprs
            .get(expr.index())
            .and_then(Option::as_ref)
            .ok_or(FusionError::UnknownExpr(expr))
    }

    pub fn name(&self, val: ValId) -> FusionResult<u32> {
        Ok(self.val(val)?.name)
    }

    pub fn tensor(&self, val: ValId) -> FusionResult<&TensorView> {
        match &self.val(val)?.kind {
            ValKind::TensorView(tv) => Ok(tv),
            _ => Err(FusionError::WrongKind {
                val,
                expected: "tensor view",
            }),
        }
    }

    pub(crate) fn tensor_mut(&mut self, val: ValId) -> FusionResult<&mut TensorView> {
        match &mut self.val_mut(val)?.kind {
            ValKind::TensorView(tv) => Ok(tv),
            _ => Err(FusionError::WrongKind {
                val,
                expected: "tensor view",
            }),
        }
    }

    pub fn iter_domain(&self, val: ValId) -> FusionResult<&IterDomain> {
        match &self.val(val)?.kind {
            ValKind::IterDomain(id) => Ok(id),
            _ => Err(FusionError::WrongKind {
                val,
                expected: "iter domain",
            }),
        }
    }

    pub(crate) fn iter_domain_mut(&mut self, val: ValId) -> FusionResult<&mut IterDomain> {
        match &mut self.val_mut(val)?.kind {
            ValKind::IterDomain(id) => Ok(id),
            _ => Err(FusionError::WrongKind {
                val,
                expected: "iter domain",
            }),
        }
    }

    pub fn tensor_index(&self, val: ValId) -> FusionResult<&TensorIndex> {
        match &self.val(val)?.kind {
            ValKind::TensorIndex(ti) => Ok(ti),
            _ => Err(FusionError::WrongKind {
                val,
                expected: "tensor index",
            }),
        }
    }

    pub fn is_tensor(&self, val: ValId) -> bool {
        matches!(
            self.val(val).map(|v| &v.kind),
            Ok(ValKind::TensorView(_))
        )
    }

    /// Element type of any value; IterDomains report their extent type.
    pub fn dtype(&self, val: ValId) -> FusionResult<DataType> {
        match &self.val(val)?.kind {
            ValKind::Scalar(scalar) => Ok(scalar.dtype),
            ValKind::NamedScalar { dtype, .. } => Ok(*dtype),
            ValKind::IterDomain(_) => Ok(DataType::Int),
            ValKind::TensorView(tv) => Ok(tv.dtype),
            ValKind::TensorIndex(ti) => self.dtype(ti.view),
        }
    }

    pub fn const_value(&self, val: ValId) -> FusionResult<Option<ConstValue>> {
        Ok(self.val(val)?.const_value())
    }

    pub fn const_int(&self, val: ValId) -> Option<i64> {
        self.val(val).ok()?.const_value()?.as_int()
    }

    /// Current axes of a tensor.
    pub fn axes(&self, tv: ValId) -> FusionResult<&[ValId]> {
        Ok(&self.tensor(tv)?.domain.axes)
    }

    pub fn ndims(&self, tv: ValId) -> FusionResult<usize> {
        Ok(self.tensor(tv)?.domain.ndims())
    }

    /// Axis `axis` of `tv`, negative indices counting from the end.
    pub fn axis(&self, tv: ValId, axis: i64) -> FusionResult<ValId> {
        let domain = &self.tensor(tv)?.domain;
        let index = normalize_axis(axis, domain.ndims())?;
        Ok(domain.axes[index])
    }

    pub fn has_reduction_axis(&self, tv: ValId) -> FusionResult<bool> {
        for &axis in self.axes(tv)? {
            if self.iter_domain(axis)?.is_reduction() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Filters out reduction axes from `ids`.
    pub fn no_reductions(&self, ids: &[ValId]) -> FusionResult<Vec<ValId>> {
        let mut kept = Vec::with_capacity(ids.len());
        for &id in ids {
            if !self.iter_domain(id)?.is_reduction() {
                kept.push(id);
            }
        }
        Ok(kept)
    }

    // ---------------------------------------------------------------------
    // Registration
    // ---------------------------------------------------------------------

    pub(crate) fn register_val(&mut self, kind: ValKind) -> ValId {
        let name = match kind {
            ValKind::TensorView(_) => {
                let name = self.counters.tensor;
                self.counters.tensor += 1;
                name
            }
            _ => {
                let name = self.counters.value;
                self.counters.value += 1;
                name
            }
        };
        let id = ValId::new(self.tag, self.vals.len());
        self.vals.push(Some(Val { name, kind }));
        self.val_order.push(id);
        id
    }

    pub fn new_scalar(&mut self, dtype: DataType, value: Option<ConstValue>) -> ValId {
        self.register_val(ValKind::Scalar(Scalar { dtype, value }))
    }

    /// Symbolic (unknown until bound) scalar.
    pub fn new_symbolic(&mut self, dtype: DataType) -> ValId {
        self.new_scalar(dtype, None)
    }

    pub fn new_int(&mut self, value: i64) -> ValId {
        self.new_scalar(DataType::Int, Some(ConstValue::Int(value)))
    }

    pub fn new_float(&mut self, value: f64) -> ValId {
        self.new_scalar(DataType::Float, Some(ConstValue::Float(value)))
    }

    pub fn new_half(&mut self, value: f64) -> ValId {
        self.new_scalar(DataType::Half, Some(ConstValue::Float(value)))
    }

    pub fn new_bool(&mut self, value: bool) -> ValId {
        self.new_scalar(DataType::Bool, Some(ConstValue::Bool(value)))
    }

    pub fn new_named_scalar(&mut self, name: impl Into<String>, dtype: DataType) -> ValId {
        self.register_val(ValKind::NamedScalar {
            name: name.into(),
            dtype,
        })
    }

    pub fn new_iter_domain(
        &mut self,
        start: ValId,
        extent: ValId,
        iter_type: IterType,
        parallel: ParallelType,
        rfactor_product: bool,
    ) -> FusionResult<ValId> {
        for val in [start, extent] {
            if self.dtype(val)? != DataType::Int || !self.val(val)?.is_scalar() {
                return Err(FusionError::TypeMismatch(format!(
                    "iter domain bounds must be integer scalars, got {val}"
                )));
            }
        }
        Ok(self.register_val(ValKind::IterDomain(IterDomain {
            start,
            extent,
            iter_type,
            parallel,
            rfactor_product,
        })))
    }

    /// Tensor of rank `ndims` with symbolic extents.
    pub fn new_tensor(&mut self, ndims: usize, dtype: DataType) -> ValId {
        let zero = self.new_int(0);
        let root = (0..ndims)
            .map(|_| {
                let extent = self.new_symbolic(DataType::Int);
                self.register_val(ValKind::IterDomain(IterDomain {
                    start: zero,
                    extent,
                    iter_type: IterType::Iteration,
                    parallel: ParallelType::Serial,
                    rfactor_product: false,
                }))
            })
            .collect();
        self.new_tensor_with_domain(TensorDomain::from_root(root), dtype)
    }

    pub fn new_tensor_with_domain(&mut self, domain: TensorDomain, dtype: DataType) -> ValId {
        self.register_val(ValKind::TensorView(TensorView {
            dtype,
            domain,
            compute_at: None,
        }))
    }

    pub fn new_tensor_index(&mut self, view: ValId, indices: Vec<ValId>) -> FusionResult<ValId> {
        self.tensor(view)?;
        Ok(self.register_val(ValKind::TensorIndex(TensorIndex { view, indices })))
    }

    /// Links `inputs` and `outputs` through a new expression.
    ///
    /// An output that already has an origin is redefined: the previous
    /// origin expression is removed first.
    pub fn register_expr(
        &mut self,
        kind: ExprKind,
        inputs: &[ValId],
        outputs: &[ValId],
    ) -> FusionResult<ExprId> {
        for &val in inputs.iter().chain(outputs) {
            self.val(val)?;
        }
        if let ExprKind::Reduction { init, .. } = &kind {
            self.val(*init)?;
        }
        for &out in outputs {
            if let Some(previous) = self.origin.get(&out).copied() {
                self.remove_expr(previous)?;
            }
        }

        let id = ExprId::new(self.tag, self.exprs.len());
        let name = self.counters.expr;
        self.counters.expr += 1;
        self.exprs.push(Some(Expr {
            name,
            kind,
            inputs: SmallVec::from_slice(inputs),
            outputs: SmallVec::from_slice(outputs),
        }));
        for &input in inputs {
            self.uses.entry(input).or_default().insert(id);
        }
        for &out in outputs {
            self.origin.insert(out, id);
        }
        Ok(id)
    }

    pub fn remove_expr(&mut self, expr: ExprId) -> FusionResult<()> {
        self.expr(expr)?;
        let removed = self
            .exprs
            .get_mut(expr.index())
            .and_then(Option::take)
            .ok_or(FusionError::UnknownExpr(expr))?;
        for out in &removed.outputs {
            if self.origin.get(out) == Some(&expr) {
                self.origin.remove(out);
            }
        }
        for input in &removed.inputs {
            if let Some(uses) = self.uses.get_mut(input) {
                uses.remove(&expr);
                if uses.is_empty() {
                    self.uses.remove(input);
                }
            }
        }
        Ok(())
    }

    /// Removes a value together with its origin and every consumer.
    pub fn remove_val(&mut self, val: ValId) -> FusionResult<()> {
        self.val(val)?;
        if self.is_input(val) || self.is_output(val) {
            return Err(FusionError::RemoveBoundary(val));
        }
        if let Some(origin) = self.origin.get(&val).copied() {
            self.remove_expr(origin)?;
        }
        for expr in self.uses(val) {
            self.remove_expr(expr)?;
        }
        self.vals[val.index()] = None;
        self.val_order.retain(|v| *v != val);
        self.values_map.remove(&val);
        self.values_map.retain(|_, lowered| *lowered != val);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Inputs and outputs
    // ---------------------------------------------------------------------

    pub fn add_input(&mut self, val: ValId) -> FusionResult<()> {
        self.val(val)?;
        if self.origin.contains_key(&val) {
            return Err(FusionError::invalid_input(
                val,
                "value is produced by an expression",
            ));
        }
        if self.is_tensor(val) {
            let root = self.tensor(val)?.domain.root.clone();
            let mut has_reduction = false;
            for id in root {
                has_reduction |= self.iter_domain(id)?.is_reduction();
            }
            if has_reduction && REDUCTION_INPUT_WARNED.set(()).is_ok() {
                log::warn!(
                    "fusion input {} has a reduction axis; reduction axes on inputs are ignored",
                    self.name(val)?
                );
            }
        }
        self.inputs.push(val);
        Ok(())
    }

    pub fn add_output(&mut self, val: ValId) -> FusionResult<()> {
        self.val(val)?;
        if self.is_tensor(val) {
            let root = self.tensor(val)?.domain.root.clone();
            for id in root {
                if self.iter_domain(id)?.is_broadcast() {
                    return Err(FusionError::invalid_output(
                        val,
                        "outputs cannot carry broadcast axes",
                    ));
                }
            }
        }
        self.outputs.push(val);
        Ok(())
    }

    /// Replaces every occurrence of `old` in the input list.
    pub fn replace_input(&mut self, old: ValId, new: ValId) -> FusionResult<()> {
        self.val(new)?;
        if !self.is_input(old) {
            return Err(FusionError::invalid_input(old, "value is not an input"));
        }
        if self.origin.contains_key(&new) {
            return Err(FusionError::invalid_input(
                new,
                "value is produced by an expression",
            ));
        }
        for input in &mut self.inputs {
            if *input == old {
                *input = new;
            }
        }
        Ok(())
    }

    /// Replaces every occurrence of `old` in the output list.
    pub fn replace_output(&mut self, old: ValId, new: ValId) -> FusionResult<()> {
        self.val(new)?;
        if !self.is_output(old) {
            return Err(FusionError::invalid_output(old, "value is not an output"));
        }
        for output in &mut self.outputs {
            if *output == old {
                *output = new;
            }
        }
        Ok(())
    }

    pub fn inputs(&self) -> &[ValId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValId] {
        &self.outputs
    }

    pub fn is_input(&self, val: ValId) -> bool {
        self.inputs.contains(&val)
    }

    pub fn is_output(&self, val: ValId) -> bool {
        self.outputs.contains(&val)
    }

    // ---------------------------------------------------------------------
    // Graph queries
    // ---------------------------------------------------------------------

    pub fn origin(&self, val: ValId) -> Option<ExprId> {
        self.origin.get(&val).copied()
    }

    /// Consumers of `val` in ascending expression order.
    pub fn uses(&self, val: ValId) -> Vec<ExprId> {
        self.uses
            .get(&val)
            .map(|uses| uses.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn used(&self, val: ValId) -> bool {
        self.uses.get(&val).is_some_and(|uses| !uses.is_empty())
    }

    /// Values in registration order.
    pub fn deterministic_vals(&self) -> &[ValId] {
        &self.val_order
    }

    pub fn vals(&self) -> BTreeSet<ValId> {
        self.val_order.iter().copied().collect()
    }

    pub fn unordered_exprs(&self) -> Vec<ExprId> {
        self.exprs
            .iter()
            .enumerate()
            .filter(|(_, expr)| expr.is_some())
            .map(|(index, _)| ExprId::new(self.tag, index))
            .collect()
    }

    /// Expressions in producer-before-consumer order.
    pub fn exprs(
        &self,
        from_outputs_only: bool,
        breadth_first: bool,
        respect_compute_at: bool,
    ) -> FusionResult<Vec<ExprId>> {
        traversal::expr_sort(self, from_outputs_only, breadth_first, respect_compute_at)
    }

    /// Origin-less values `val` depends on.
    pub fn inputs_of(&self, val: ValId) -> FusionResult<Vec<ValId>> {
        traversal::inputs_to(self, &[val])
    }

    /// Fails if an output depends on a symbolic value that is not an input.
    pub fn validate_inputs(&self) -> FusionResult<()> {
        let sources = traversal::inputs_to(self, &self.outputs)?;
        for val in sources {
            let node = self.val(val)?;
            let is_constant = node.const_value().is_some();
            if !is_constant && !self.is_input(val) {
                return Err(FusionError::invalid_input(
                    val,
                    "outputs depend on a symbolic value that is not a fusion input",
                ));
            }
        }
        Ok(())
    }

    fn output_tensors_of_exprs(&self) -> FusionResult<Vec<ValId>> {
        let mut tensors = Vec::new();
        for expr in self.exprs(true, false, false)? {
            for &out in &self.expr(expr)?.outputs {
                if self.is_tensor(out) {
                    tensors.push(out);
                }
            }
        }
        Ok(tensors)
    }

    fn any_reduction_axis(&self, filter: impl Fn(&IterDomain) -> bool) -> FusionResult<bool> {
        for tv in self.output_tensors_of_exprs()? {
            for &axis in self.axes(tv)? {
                let id = self.iter_domain(axis)?;
                if id.is_reduction() && filter(id) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    pub fn has_reduction(&self) -> FusionResult<bool> {
        self.any_reduction_axis(|_| true)
    }

    pub fn has_block_reduction(&self) -> FusionResult<bool> {
        self.any_reduction_axis(|id| id.parallel.is_thread_dim())
    }

    pub fn has_grid_reduction(&self) -> FusionResult<bool> {
        self.any_reduction_axis(|id| id.parallel.is_block_dim())
    }

    pub fn has_rng(&self) -> FusionResult<bool> {
        for expr in self.exprs(true, false, false)? {
            if self.expr(expr)?.kind == ExprKind::Unary(UnaryOpType::RandLike) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ---------------------------------------------------------------------
    // Lowered value map
    // ---------------------------------------------------------------------

    /// Records that `val` prints as `lowered` in kernel source.
    pub fn set_lowered_val(&mut self, val: ValId, lowered: ValId) -> FusionResult<()> {
        self.val(val)?;
        self.val(lowered)?;
        self.values_map.insert(val, lowered);
        Ok(())
    }

    pub fn lowered_val(&self, val: ValId) -> ValId {
        self.values_map.get(&val).copied().unwrap_or(val)
    }

    pub fn values_map(&self) -> &HashMap<ValId, ValId> {
        &self.values_map
    }
}

/// Resolves a possibly negative axis against `ndims`.
pub fn normalize_axis(axis: i64, ndims: usize) -> FusionResult<usize> {
    let rank = ndims as i64;
    let resolved = if axis < 0 { axis + rank } else { axis };
    if resolved < 0 || resolved >= rank {
        return Err(FusionError::AxisOutOfRange { axis, rank: ndims });
    }
    Ok(resolved as usize)
}
