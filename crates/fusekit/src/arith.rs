//! Construction helpers: each call creates the output value, registers the
//! defining expression and returns the output.
//!
//! Operands may mix tensors and scalars. Tensor operands must agree on rank;
//! the output tensor gets fresh axes sharing the operands' extents.

use crate::error::{FusionError, FusionResult};
use crate::fusion::{normalize_axis, Fusion};
use crate::ir::{
    BinaryOpType, DataType, ExprKind, IterType, ParallelType, TensorDomain, TernaryOpType,
    UnaryOpType, ValId,
};

/// Root axes of `tv` as seen by a consumer: reductions are gone.
fn consumer_view_axes(fusion: &Fusion, tv: ValId) -> FusionResult<Vec<ValId>> {
    let domain = &fusion.tensor(tv)?.domain;
    fusion.no_reductions(domain.maybe_rfactor())
}

/// Output value of an elementwise op over `operands`.
fn new_output_like(fusion: &mut Fusion, operands: &[ValId], dtype: DataType) -> FusionResult<ValId> {
    let mut tensor_axes: Vec<Vec<ValId>> = Vec::new();
    for &operand in operands {
        if fusion.is_tensor(operand) {
            tensor_axes.push(consumer_view_axes(fusion, operand)?);
        }
    }
    let Some(first) = tensor_axes.first() else {
        return Ok(fusion.new_symbolic(dtype));
    };
    let rank = first.len();
    if tensor_axes.iter().any(|axes| axes.len() != rank) {
        return Err(FusionError::TypeMismatch(format!(
            "tensor operands of one expression must have the same rank, got {:?}",
            tensor_axes.iter().map(Vec::len).collect::<Vec<_>>()
        )));
    }

    let mut root = Vec::with_capacity(rank);
    for position in 0..rank {
        // Prefer a non-broadcast operand axis so the extent is the real one.
        let mut template = tensor_axes[0][position];
        let mut all_broadcast = true;
        for axes in &tensor_axes {
            if !fusion.iter_domain(axes[position])?.is_broadcast() {
                template = axes[position];
                all_broadcast = false;
                break;
            }
        }
        let id = fusion.iter_domain(template)?.clone();
        let iter_type = if all_broadcast {
            IterType::Broadcast
        } else {
            IterType::Iteration
        };
        root.push(fusion.new_iter_domain(id.start, id.extent, iter_type, ParallelType::Serial, false)?);
    }
    Ok(fusion.new_tensor_with_domain(TensorDomain::from_root(root), dtype))
}

fn promoted_dtype(fusion: &Fusion, operands: &[ValId]) -> FusionResult<DataType> {
    let mut dtype = fusion.dtype(operands[0])?;
    for &operand in &operands[1..] {
        dtype = dtype.promote(fusion.dtype(operand)?);
    }
    Ok(dtype)
}

pub fn unary_op(fusion: &mut Fusion, op: UnaryOpType, input: ValId) -> FusionResult<ValId> {
    let dtype = fusion.dtype(input)?;
    let out = new_output_like(fusion, &[input], dtype)?;
    fusion.register_expr(ExprKind::Unary(op), &[input], &[out])?;
    Ok(out)
}

pub fn binary_op(fusion: &mut Fusion, op: BinaryOpType, lhs: ValId, rhs: ValId) -> FusionResult<ValId> {
    let dtype = if op.is_logical() {
        DataType::Bool
    } else {
        promoted_dtype(fusion, &[lhs, rhs])?
    };
    let out = new_output_like(fusion, &[lhs, rhs], dtype)?;
    fusion.register_expr(ExprKind::Binary(op), &[lhs, rhs], &[out])?;
    Ok(out)
}

pub fn ternary_op(
    fusion: &mut Fusion,
    op: TernaryOpType,
    a: ValId,
    b: ValId,
    c: ValId,
) -> FusionResult<ValId> {
    let dtype = match op {
        // The condition does not take part in promotion.
        TernaryOpType::Where => promoted_dtype(fusion, &[b, c])?,
        _ => promoted_dtype(fusion, &[a, b, c])?,
    };
    let out = new_output_like(fusion, &[a, b, c], dtype)?;
    fusion.register_expr(ExprKind::Ternary(op), &[a, b, c], &[out])?;
    Ok(out)
}

pub fn cast(fusion: &mut Fusion, input: ValId, dtype: DataType) -> FusionResult<ValId> {
    let out = new_output_like(fusion, &[input], dtype)?;
    fusion.register_expr(ExprKind::Unary(UnaryOpType::Cast), &[input], &[out])?;
    Ok(out)
}

/// Uniform random values shaped like `tv`.
pub fn rand_like(fusion: &mut Fusion, tv: ValId) -> FusionResult<ValId> {
    if !fusion.is_tensor(tv) {
        return Err(FusionError::WrongKind {
            val: tv,
            expected: "tensor view",
        });
    }
    unary_op(fusion, UnaryOpType::RandLike, tv)
}

macro_rules! unary_helpers {
    ($($name:ident => $op:ident),* $(,)?) => {
        $(
            pub fn $name(fusion: &mut Fusion, input: ValId) -> FusionResult<ValId> {
                unary_op(fusion, UnaryOpType::$op, input)
            }
        )*
    };
}

macro_rules! binary_helpers {
    ($($name:ident => $op:ident),* $(,)?) => {
        $(
            pub fn $name(fusion: &mut Fusion, lhs: ValId, rhs: ValId) -> FusionResult<ValId> {
                binary_op(fusion, BinaryOpType::$op, lhs, rhs)
            }
        )*
    };
}

unary_helpers! {
    abs => Abs,
    ceil => Ceil,
    cos => Cos,
    exp => Exp,
    floor => Floor,
    log => Log,
    neg => Neg,
    reciprocal => Reciprocal,
    relu => Relu,
    rsqrt => Rsqrt,
    set => Set,
    sigmoid => Sigmoid,
    sin => Sin,
    sqrt => Sqrt,
    tanh => Tanh,
}

binary_helpers! {
    add => Add,
    and => And,
    ceil_div => CeilDiv,
    div => Div,
    eq => Eq,
    ge => Ge,
    gt => Gt,
    le => Le,
    lt => Lt,
    max => Max,
    min => Min,
    modulo => Mod,
    mul => Mul,
    ne => Ne,
    pow => Pow,
    sub => Sub,
}

pub fn where_(fusion: &mut Fusion, condition: ValId, a: ValId, b: ValId) -> FusionResult<ValId> {
    ternary_op(fusion, TernaryOpType::Where, condition, a, b)
}

pub fn clamp(fusion: &mut Fusion, input: ValId, min: ValId, max: ValId) -> FusionResult<ValId> {
    ternary_op(fusion, TernaryOpType::Clamp, input, min, max)
}

/// `input <= threshold ? value : input`
pub fn threshold(
    fusion: &mut Fusion,
    input: ValId,
    threshold: ValId,
    value: ValId,
) -> FusionResult<ValId> {
    ternary_op(fusion, TernaryOpType::Threshold, input, threshold, value)
}

pub fn lerp(fusion: &mut Fusion, start: ValId, end: ValId, weight: ValId) -> FusionResult<ValId> {
    ternary_op(fusion, TernaryOpType::Lerp, start, end, weight)
}

/// Reduces `input` over `axes` with `op`, starting from the constant `init`.
pub fn reduction_op(
    fusion: &mut Fusion,
    op: BinaryOpType,
    axes: &[i64],
    init: ValId,
    input: ValId,
) -> FusionResult<ValId> {
    if !fusion.is_tensor(input) {
        return Err(FusionError::WrongKind {
            val: input,
            expected: "tensor view",
        });
    }
    if fusion.const_value(init)?.is_none() {
        return Err(FusionError::TypeMismatch(
            "reduction initial value must be a constant scalar".into(),
        ));
    }
    if axes.is_empty() {
        return Err(FusionError::TypeMismatch(
            "reduction requires at least one axis".into(),
        ));
    }
    let source = consumer_view_axes(fusion, input)?;
    let mut reduced = vec![false; source.len()];
    for &axis in axes {
        reduced[normalize_axis(axis, source.len())?] = true;
    }

    let mut root = Vec::with_capacity(source.len());
    for (position, &axis) in source.iter().enumerate() {
        let id = fusion.iter_domain(axis)?.clone();
        let iter_type = match (reduced[position], id.is_broadcast()) {
            (true, true) => {
                return Err(FusionError::TypeMismatch(format!(
                    "cannot reduce broadcast axis {position}"
                )))
            }
            (true, false) => IterType::Reduction,
            (false, true) => IterType::Broadcast,
            (false, false) => IterType::Iteration,
        };
        root.push(fusion.new_iter_domain(id.start, id.extent, iter_type, ParallelType::Serial, false)?);
    }
    let dtype = fusion.dtype(input)?;
    let out = fusion.new_tensor_with_domain(TensorDomain::from_root(root), dtype);
    fusion.register_expr(ExprKind::Reduction { op, init }, &[input], &[out])?;
    Ok(out)
}

/// Sum over `axes` with a zero of the input's type.
pub fn sum(fusion: &mut Fusion, input: ValId, axes: &[i64]) -> FusionResult<ValId> {
    let init = match fusion.dtype(input)? {
        DataType::Int => fusion.new_int(0),
        DataType::Bool => fusion.new_bool(false),
        DataType::Half => fusion.new_half(0.0),
        DataType::Float => fusion.new_float(0.0),
    };
    reduction_op(fusion, BinaryOpType::Add, axes, init, input)
}

/// Inserts broadcast axes: `is_broadcast_dim[i]` marks output axis `i` as
/// new. The remaining flags map, in order, onto the input's axes.
pub fn broadcast(fusion: &mut Fusion, input: ValId, is_broadcast_dim: &[bool]) -> FusionResult<ValId> {
    let source = consumer_view_axes(fusion, input)?;
    let kept = is_broadcast_dim.iter().filter(|flag| !**flag).count();
    if kept != source.len() {
        return Err(FusionError::TypeMismatch(format!(
            "broadcast keeps {kept} axes but the input has {}",
            source.len()
        )));
    }

    let mut root = Vec::with_capacity(is_broadcast_dim.len());
    let mut source_axes = source.iter();
    for &is_new in is_broadcast_dim {
        let id = if is_new {
            let start = fusion.new_int(0);
            let extent = fusion.new_int(1);
            fusion.new_iter_domain(start, extent, IterType::Broadcast, ParallelType::Serial, false)?
        } else {
            let axis = source_axes
                .next()
                .copied()
                .ok_or_else(|| FusionError::TypeMismatch("broadcast ran out of input axes".into()))?;
            let id = fusion.iter_domain(axis)?.clone();
            fusion.new_iter_domain(id.start, id.extent, id.iter_type, ParallelType::Serial, false)?
        };
        root.push(id);
    }
    let dtype = fusion.dtype(input)?;
    let out = fusion.new_tensor_with_domain(TensorDomain::from_root(root), dtype);
    fusion.register_expr(
        ExprKind::Broadcast {
            new_axes: is_broadcast_dim.to_vec(),
        },
        &[input],
        &[out],
    )?;
    Ok(out)
}
