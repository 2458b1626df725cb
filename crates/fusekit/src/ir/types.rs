//! Scalar types, parallel bindings and operator tags shared by the IR,
//! the printers and the lowering pass.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FusionError, FusionResult};

/// Element type carried by scalars and tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Float,
    Half,
    Int,
}

impl DataType {
    /// Spelling used in emitted kernel source.
    pub fn device_name(self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::Float => "float",
            DataType::Half => "__half",
            DataType::Int => "int64_t",
        }
    }

    /// Prefix used when printing symbolic scalars of this type.
    pub fn value_prefix(self) -> char {
        match self {
            DataType::Bool => 'b',
            DataType::Float => 'f',
            DataType::Half => 'h',
            DataType::Int => 'i',
        }
    }

    pub fn is_floating_point(self) -> bool {
        matches!(self, DataType::Float | DataType::Half)
    }

    /// Result type of mixing two operand types.
    pub fn promote(self, other: DataType) -> DataType {
        fn rank(dtype: DataType) -> u8 {
            match dtype {
                DataType::Bool => 0,
                DataType::Int => 1,
                DataType::Half => 2,
                DataType::Float => 3,
            }
        }
        if rank(self) >= rank(other) {
            self
        } else {
            other
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.device_name())
    }
}

/// Kind of an iteration axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IterType {
    Iteration,
    Reduction,
    Broadcast,
}

/// Hardware or loop binding of an axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ParallelType {
    BIDz,
    BIDy,
    BIDx,
    TIDz,
    TIDy,
    TIDx,
    Vectorize,
    Unroll,
    Serial,
}

impl ParallelType {
    pub const THREADS: [ParallelType; 3] =
        [ParallelType::TIDx, ParallelType::TIDy, ParallelType::TIDz];
    pub const BLOCKS: [ParallelType; 3] =
        [ParallelType::BIDx, ParallelType::BIDy, ParallelType::BIDz];

    pub fn is_thread_dim(self) -> bool {
        matches!(
            self,
            ParallelType::TIDx | ParallelType::TIDy | ParallelType::TIDz
        )
    }

    pub fn is_block_dim(self) -> bool {
        matches!(
            self,
            ParallelType::BIDx | ParallelType::BIDy | ParallelType::BIDz
        )
    }

    /// Axes bound to the launch geometry generate no loop.
    pub fn is_hardware(self) -> bool {
        self.is_thread_dim() || self.is_block_dim()
    }

    /// Launch-geometry index name, e.g. `threadIdx.x`.
    pub fn index_name(self) -> Option<&'static str> {
        Some(match self {
            ParallelType::BIDx => "blockIdx.x",
            ParallelType::BIDy => "blockIdx.y",
            ParallelType::BIDz => "blockIdx.z",
            ParallelType::TIDx => "threadIdx.x",
            ParallelType::TIDy => "threadIdx.y",
            ParallelType::TIDz => "threadIdx.z",
            _ => return None,
        })
    }

    /// Launch-geometry extent name, e.g. `blockDim.x`.
    pub fn dim_name(self) -> Option<&'static str> {
        Some(match self {
            ParallelType::BIDx => "gridDim.x",
            ParallelType::BIDy => "gridDim.y",
            ParallelType::BIDz => "gridDim.z",
            ParallelType::TIDx => "blockDim.x",
            ParallelType::TIDy => "blockDim.y",
            ParallelType::TIDz => "blockDim.z",
            _ => return None,
        })
    }

    /// Dimension slot 0..3 (x, y, z) for hardware bindings.
    pub fn dim_slot(self) -> Option<usize> {
        match self {
            ParallelType::BIDx | ParallelType::TIDx => Some(0),
            ParallelType::BIDy | ParallelType::TIDy => Some(1),
            ParallelType::BIDz | ParallelType::TIDz => Some(2),
            _ => None,
        }
    }
}

impl fmt::Display for ParallelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParallelType::Serial => f.write_str("S"),
            ParallelType::Unroll => f.write_str("U"),
            ParallelType::Vectorize => f.write_str("V"),
            other => f.write_str(other.index_name().unwrap_or("?")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOpType {
    Abs,
    Cast,
    Ceil,
    Cos,
    Exp,
    Floor,
    Log,
    Neg,
    RandLike,
    Reciprocal,
    Relu,
    Rsqrt,
    Set,
    Sigmoid,
    Sin,
    Sqrt,
    Tanh,
}

impl UnaryOpType {
    /// Operators printed as a prefix token rather than a call.
    pub fn inline_str(self) -> Option<&'static str> {
        match self {
            UnaryOpType::Neg => Some("-"),
            UnaryOpType::Set => Some(""),
            _ => None,
        }
    }

    pub fn func_str(self) -> Option<&'static str> {
        Some(match self {
            UnaryOpType::Abs => "fabs",
            UnaryOpType::Ceil => "ceil",
            UnaryOpType::Cos => "cos",
            UnaryOpType::Exp => "exp",
            UnaryOpType::Floor => "floor",
            UnaryOpType::Log => "log",
            UnaryOpType::RandLike => "randLike",
            UnaryOpType::Reciprocal => "reciprocal",
            UnaryOpType::Relu => "relu",
            UnaryOpType::Rsqrt => "rsqrtf",
            UnaryOpType::Sigmoid => "sigmoid",
            UnaryOpType::Sin => "sin",
            UnaryOpType::Sqrt => "sqrt",
            UnaryOpType::Tanh => "tanh",
            UnaryOpType::Neg | UnaryOpType::Set | UnaryOpType::Cast => return None,
        })
    }
}

impl fmt::Display for UnaryOpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BinaryOpType {
    Add,
    And,
    CeilDiv,
    Div,
    Eq,
    Ge,
    Gt,
    Le,
    Lt,
    Max,
    Min,
    Mod,
    Mul,
    Ne,
    Pow,
    Sub,
}

impl BinaryOpType {
    pub fn inline_str(self) -> Option<&'static str> {
        Some(match self {
            BinaryOpType::Add => "+",
            BinaryOpType::And => "&&",
            BinaryOpType::Div => "/",
            BinaryOpType::Eq => "==",
            BinaryOpType::Ge => ">=",
            BinaryOpType::Gt => ">",
            BinaryOpType::Le => "<=",
            BinaryOpType::Lt => "<",
            BinaryOpType::Mod => "%",
            BinaryOpType::Mul => "*",
            BinaryOpType::Ne => "!=",
            BinaryOpType::Sub => "-",
            BinaryOpType::CeilDiv | BinaryOpType::Max | BinaryOpType::Min | BinaryOpType::Pow => {
                return None
            }
        })
    }

    pub fn func_str(self) -> Option<&'static str> {
        match self {
            BinaryOpType::CeilDiv => Some("ceilDiv"),
            BinaryOpType::Max => Some("fmax"),
            BinaryOpType::Min => Some("fmin"),
            BinaryOpType::Pow => Some("pow"),
            _ => None,
        }
    }

    /// Comparisons and logical ops produce a boolean.
    pub fn is_logical(self) -> bool {
        matches!(
            self,
            BinaryOpType::And
                | BinaryOpType::Eq
                | BinaryOpType::Ge
                | BinaryOpType::Gt
                | BinaryOpType::Le
                | BinaryOpType::Lt
                | BinaryOpType::Ne
        )
    }

    /// Operator token used in reduction helper bodies (`a = a + b`) or the
    /// call used for non-inline operators (`a = fmax(a, b)`).
    pub fn reduction_body(self, dtype: DataType) -> FusionResult<String> {
        if let Some(token) = self.inline_str() {
            if !self.is_logical() || dtype == DataType::Bool {
                return Ok(format!("a = a {token} b;"));
            }
        } else if let Some(func) = self.func_str() {
            if self != BinaryOpType::CeilDiv {
                return Ok(format!("a = {func}(a, b);"));
            }
        }
        Err(FusionError::unsupported(format!(
            "no reduction helper for {self} on {dtype}"
        )))
    }
}

impl fmt::Display for BinaryOpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TernaryOpType {
    Clamp,
    Lerp,
    Threshold,
    Where,
}

impl TernaryOpType {
    pub fn func_str(self) -> &'static str {
        match self {
            TernaryOpType::Clamp => "clamp",
            TernaryOpType::Lerp => "lerp",
            TernaryOpType::Threshold => "threshold",
            TernaryOpType::Where => "where",
        }
    }
}

impl fmt::Display for TernaryOpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Device conversion routine for a cast between two element types.
pub fn cast_func_str(from: DataType, to: DataType) -> FusionResult<String> {
    let name = match (from, to) {
        (a, b) if a == b => String::new(),
        (DataType::Float, DataType::Half) => "__float2half".to_string(),
        (DataType::Half, DataType::Float) => "__half2float".to_string(),
        (DataType::Half, _) | (_, DataType::Half) => {
            return Err(FusionError::unsupported(format!(
                "no cast from {from} to {to}"
            )))
        }
        (_, to) => format!("({})", to.device_name()),
    };
    Ok(name)
}
