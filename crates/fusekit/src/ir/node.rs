use std::fmt;

use smallvec::SmallVec;

use super::types::{BinaryOpType, DataType, IterType, ParallelType, TernaryOpType, UnaryOpType};

/// Index of a value in its fusion's arena, stamped with the tag of that
/// fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValId {
    index: u32,
    fusion: u32,
}

/// Index of an expression in its fusion's arena, stamped with the tag of
/// that fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId {
    index: u32,
    fusion: u32,
}

impl ValId {
    pub(crate) fn new(fusion: u32, index: usize) -> Self {
        ValId {
            index: index as u32,
            fusion,
        }
    }

    pub fn index(self) -> usize {
        self.index as usize
    }

    /// Tag of the fusion that created this id.
    pub fn fusion_tag(self) -> u32 {
        self.fusion
    }
}

impl ExprId {
    pub(crate) fn new(fusion: u32, index: usize) -> Self {
        ExprId {
            index: index as u32,
            fusion,
        }
    }

    pub fn index(self) -> usize {
        self.index as usize
    }

    pub fn fusion_tag(self) -> u32 {
        self.fusion
    }
}

impl fmt::Display for ValId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%v{}", self.index)
    }
}

impl fmt::Display for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%e{}", self.index)
    }
}

/// Either half of the graph, used by the traversal engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Statement {
    Val(ValId),
    Expr(ExprId),
}

impl Statement {
    pub fn as_val(self) -> Option<ValId> {
        match self {
            Statement::Val(val) => Some(val),
            Statement::Expr(_) => None,
        }
    }

    pub fn as_expr(self) -> Option<ExprId> {
        match self {
            Statement::Expr(expr) => Some(expr),
            Statement::Val(_) => None,
        }
    }
}

impl From<ValId> for Statement {
    fn from(val: ValId) -> Self {
        Statement::Val(val)
    }
}

impl From<ExprId> for Statement {
    fn from(expr: ExprId) -> Self {
        Statement::Expr(expr)
    }
}

/// Compile-time constant held by a scalar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl ConstValue {
    pub fn as_int(self) -> Option<i64> {
        match self {
            ConstValue::Int(value) => Some(value),
            ConstValue::Bool(value) => Some(i64::from(value)),
            ConstValue::Float(_) => None,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            ConstValue::Bool(value) => f64::from(u8::from(value)),
            ConstValue::Int(value) => value as f64,
            ConstValue::Float(value) => value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scalar {
    pub dtype: DataType,
    pub value: Option<ConstValue>,
}

/// One axis of a tensor's iteration space.
#[derive(Debug, Clone, PartialEq)]
pub struct IterDomain {
    pub start: ValId,
    pub extent: ValId,
    pub iter_type: IterType,
    pub parallel: ParallelType,
    pub rfactor_product: bool,
}

impl IterDomain {
    pub fn is_reduction(&self) -> bool {
        self.iter_type == IterType::Reduction
    }

    pub fn is_broadcast(&self) -> bool {
        self.iter_type == IterType::Broadcast
    }

    pub fn is_thread(&self) -> bool {
        self.parallel.is_hardware()
    }
}

/// A recorded Split or Merge between IterDomains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainTransform {
    Split {
        input: ValId,
        outer: ValId,
        inner: ValId,
        factor: ValId,
    },
    Merge {
        outer: ValId,
        inner: ValId,
        out: ValId,
    },
}

impl DomainTransform {
    pub fn inputs(&self) -> SmallVec<[ValId; 2]> {
        match *self {
            DomainTransform::Split { input, .. } => SmallVec::from_slice(&[input]),
            DomainTransform::Merge { outer, inner, .. } => SmallVec::from_slice(&[outer, inner]),
        }
    }

    pub fn outputs(&self) -> SmallVec<[ValId; 2]> {
        match *self {
            DomainTransform::Split { outer, inner, .. } => SmallVec::from_slice(&[outer, inner]),
            DomainTransform::Merge { out, .. } => SmallVec::from_slice(&[out]),
        }
    }
}

/// Axis structure of a tensor.
///
/// `root_history` derives the rfactor domain from the root (empty without
/// rfactor); `history` derives the current axes from the rfactor domain, or
/// from the root when there is none.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TensorDomain {
    pub root: Vec<ValId>,
    pub rfactor: Option<Vec<ValId>>,
    pub axes: Vec<ValId>,
    pub root_history: Vec<DomainTransform>,
    pub history: Vec<DomainTransform>,
}

impl TensorDomain {
    pub fn from_root(root: Vec<ValId>) -> Self {
        TensorDomain {
            axes: root.clone(),
            root,
            ..TensorDomain::default()
        }
    }

    pub fn ndims(&self) -> usize {
        self.axes.len()
    }

    /// The rfactor domain when present, otherwise the root.
    pub fn maybe_rfactor(&self) -> &[ValId] {
        self.rfactor.as_deref().unwrap_or(&self.root)
    }

    pub fn has_rfactor(&self) -> bool {
        self.rfactor.is_some()
    }

    /// Records from root to current axes, in application order.
    pub fn all_transforms(&self) -> impl Iterator<Item = &DomainTransform> {
        self.root_history.iter().chain(self.history.iter())
    }

    pub fn position_of(&self, id: ValId) -> Option<usize> {
        self.axes.iter().position(|axis| *axis == id)
    }
}

/// Where a tensor is computed inside a consumer's loop nest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeAt {
    pub view: ValId,
    /// Depth in the consumer's axes.
    pub consumer_position: usize,
    /// Depth in this tensor's own axes.
    pub position: usize,
    /// For each of this tensor's leading `position` axes, the consumer axis
    /// it shares a loop with.
    pub axis_map: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TensorView {
    pub dtype: DataType,
    pub domain: TensorDomain,
    pub compute_at: Option<ComputeAt>,
}

/// Element reference produced by lowering. The offset is the sum of
/// `indices`.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorIndex {
    pub view: ValId,
    pub indices: Vec<ValId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValKind {
    Scalar(Scalar),
    NamedScalar { name: String, dtype: DataType },
    IterDomain(IterDomain),
    TensorView(TensorView),
    TensorIndex(TensorIndex),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Val {
    pub name: u32,
    pub kind: ValKind,
}

impl Val {
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            ValKind::Scalar(_) => "scalar",
            ValKind::NamedScalar { .. } => "named scalar",
            ValKind::IterDomain(_) => "iter domain",
            ValKind::TensorView(_) => "tensor view",
            ValKind::TensorIndex(_) => "tensor index",
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self.kind, ValKind::Scalar(_) | ValKind::NamedScalar { .. })
    }

    pub fn const_value(&self) -> Option<ConstValue> {
        match &self.kind {
            ValKind::Scalar(scalar) => scalar.value,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Unary(UnaryOpType),
    Binary(BinaryOpType),
    Ternary(TernaryOpType),
    Reduction { op: BinaryOpType, init: ValId },
    /// One flag per output axis; `true` marks a new broadcast axis.
    Broadcast { new_axes: Vec<bool> },
}

impl ExprKind {
    pub fn name(&self) -> &'static str {
        match self {
            ExprKind::Unary(_) => "UnaryOp",
            ExprKind::Binary(_) => "BinaryOp",
            ExprKind::Ternary(_) => "TernaryOp",
            ExprKind::Reduction { .. } => "ReductionOp",
            ExprKind::Broadcast { .. } => "BroadcastOp",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub name: u32,
    pub kind: ExprKind,
    pub inputs: SmallVec<[ValId; 3]>,
    pub outputs: SmallVec<[ValId; 1]>,
}

impl Expr {
    pub fn single_output(&self) -> Option<ValId> {
        match self.outputs.as_slice() {
            [out] => Some(*out),
            _ => None,
        }
    }
}
