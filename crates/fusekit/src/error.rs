use thiserror::Error;

use crate::ir::{ExprId, ValId};

/// Failure raised by construction, scheduling, evaluation or lowering.
///
/// Every variant names the offending node where one exists. These are
/// programmer errors in the calling layer; nothing inside the compiler
/// retries or recovers from them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FusionError {
    #[error("value {0} is not registered in this fusion")]
    UnknownVal(ValId),
    #[error("expression {0} is not registered in this fusion")]
    UnknownExpr(ExprId),
    #[error("value {val} is not a {expected}")]
    WrongKind { val: ValId, expected: &'static str },
    #[error("invalid fusion input {val}: {reason}")]
    InvalidInput { val: ValId, reason: String },
    #[error("invalid fusion output {val}: {reason}")]
    InvalidOutput { val: ValId, reason: String },
    #[error("cannot remove {0}: it is a fusion input or output")]
    RemoveBoundary(ValId),
    #[error("axis {axis} is out of range for a domain of rank {rank}")]
    AxisOutOfRange { axis: i64, rank: usize },
    #[error("cannot merge axes {outer} and {inner}: merged axes must be adjacent")]
    NonAdjacentMerge { outer: usize, inner: usize },
    #[error("cannot merge axes {outer} and {inner}: {reason}")]
    IncompatibleMerge {
        outer: usize,
        inner: usize,
        reason: String,
    },
    #[error("invalid split: {0}")]
    InvalidSplit(String),
    #[error("schedule conflicts with compute-at: {0}")]
    ComputeAtConflict(String),
    #[error("invalid reorder map: {0}")]
    InvalidReorder(String),
    #[error("invalid rfactor of {tv}: {reason}")]
    InvalidRFactor { tv: ValId, reason: String },
    #[error("invalid computeAt of {producer} at {consumer}: {reason}")]
    InvalidComputeAt {
        producer: ValId,
        consumer: ValId,
        reason: String,
    },
    #[error("transform replay failed: {0}")]
    ReplayMismatch(String),
    #[error("{0}")]
    NotImplemented(String),
    #[error("expression {0} must have exactly one output")]
    MultiOutput(ExprId),
    #[error("cannot bind {val}: {reason}")]
    InvalidBinding { val: ValId, reason: String },
    #[error("unsupported operator: {0}")]
    UnsupportedOp(String),
    #[error("lowering failed: {0}")]
    Lowering(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("no active fusion on this thread")]
    NoActiveFusion,
    #[error("active fusion is already borrowed")]
    ActiveFusionBorrowed,
}

impl FusionError {
    pub fn invalid_input(val: ValId, reason: impl Into<String>) -> Self {
        FusionError::InvalidInput {
            val,
            reason: reason.into(),
        }
    }

    pub fn invalid_output(val: ValId, reason: impl Into<String>) -> Self {
        FusionError::InvalidOutput {
            val,
            reason: reason.into(),
        }
    }

    pub fn invalid_rfactor(tv: ValId, reason: impl Into<String>) -> Self {
        FusionError::InvalidRFactor {
            tv,
            reason: reason.into(),
        }
    }

    pub fn invalid_compute_at(producer: ValId, consumer: ValId, reason: impl Into<String>) -> Self {
        FusionError::InvalidComputeAt {
            producer,
            consumer,
            reason: reason.into(),
        }
    }

    pub fn invalid_binding(val: ValId, reason: impl Into<String>) -> Self {
        FusionError::InvalidBinding {
            val,
            reason: reason.into(),
        }
    }

    pub fn lowering(message: impl Into<String>) -> Self {
        FusionError::Lowering(message.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        FusionError::UnsupportedOp(message.into())
    }
}

pub type FusionResult<T> = Result<T, FusionError>;
