pub mod arith;
mod env;
pub mod error;
pub mod eval;
pub mod fusion;
pub mod ir;
pub mod lower;
pub mod printer;
pub mod transform;
pub mod traversal;

pub use env::DEFAULT_KERNEL_NAME;
pub use error::{FusionError, FusionResult};
pub use eval::EvaluationContext;
pub use fusion::{Fusion, FusionGuard, SharedFusion};
pub use ir::{
    BinaryOpType, DataType, ExprId, IterType, ParallelType, TernaryOpType, UnaryOpType, ValId,
};
pub use lower::{lower, Kernel, KernelSummary, LowerConfig};
pub use printer::IrPrinter;
pub use transform::ReplayOutcome;
