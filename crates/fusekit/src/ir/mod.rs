//! Node types of the fusion graph.
//!
//! Values and expressions live in per-fusion arenas and refer to each other
//! through [`ValId`] / [`ExprId`]. Node kinds are closed enums so every
//! consumer (printer, evaluator, lowering) matches them exhaustively.

mod node;
mod types;

pub use node::{
    ComputeAt, ConstValue, DomainTransform, Expr, ExprId, ExprKind, IterDomain, Scalar,
    Statement, TensorDomain, TensorIndex, TensorView, Val, ValId, ValKind,
};
pub use types::{
    cast_func_str, BinaryOpType, DataType, IterType, ParallelType, TernaryOpType, UnaryOpType,
};
