//! Textual rendering of the IR.
//!
//! Two modes share one printer. Math mode renders the scheduled graph:
//! tensors with their axes and compute-at, IterDomain extents written out
//! inline. Lowered mode follows the fusion's lowered-value map so symbolic
//! extents print as `T0.size[0]`, and tensors print as bare buffer names.

use std::fmt::Write as _;

use crate::error::{FusionError, FusionResult};
use crate::fusion::Fusion;
use crate::ir::{
    cast_func_str, BinaryOpType, ConstValue, DataType, DomainTransform, ExprId, ExprKind,
    IterType, UnaryOpType, ValId, ValKind,
};

#[derive(Clone, Copy)]
pub struct IrPrinter<'a> {
    fusion: &'a Fusion,
    lowered: bool,
}

impl<'a> IrPrinter<'a> {
    pub fn new(fusion: &'a Fusion) -> Self {
        IrPrinter {
            fusion,
            lowered: false,
        }
    }

    /// Printer for kernel source.
    pub fn lowered(fusion: &'a Fusion) -> Self {
        IrPrinter {
            fusion,
            lowered: true,
        }
    }

    /// Operand form of a value.
    pub fn val(&self, val: ValId) -> FusionResult<String> {
        self.render(val, self.lowered)
    }

    /// Like [`IrPrinter::val`], but computed integer and boolean scalars are
    /// replaced by their defining expression.
    pub fn inline(&self, val: ValId) -> FusionResult<String> {
        self.render(val, true)
    }

    fn render(&self, val: ValId, inline: bool) -> FusionResult<String> {
        let val = if self.lowered {
            self.fusion.lowered_val(val)
        } else {
            val
        };
        let node = self.fusion.val(val)?;
        match &node.kind {
            ValKind::Scalar(scalar) => {
                if let Some(value) = scalar.value {
                    return Ok(const_text(scalar.dtype, value));
                }
                // Kernel source has no declarations for derived scalars.
                let inlinable =
                    self.lowered || matches!(scalar.dtype, DataType::Int | DataType::Bool);
                if inline && inlinable {
                    if let Some(origin) = self.fusion.origin(val) {
                        return Ok(format!("( {} )", self.rhs(origin, true)?));
                    }
                }
                Ok(format!("{}{}", scalar.dtype.value_prefix(), node.name))
            }
            ValKind::NamedScalar { name, .. } => Ok(name.clone()),
            ValKind::IterDomain(id) => {
                let mut text = String::new();
                text.push(match id.iter_type {
                    IterType::Reduction => 'r',
                    IterType::Broadcast => 'b',
                    IterType::Iteration => 'i',
                });
                let _ = write!(text, "{}{{", id.parallel);
                if self.fusion.const_int(id.start) != Some(0) {
                    let _ = write!(text, "{} : ", self.render(id.start, true)?);
                }
                text.push_str(&self.render(id.extent, true)?);
                text.push('}');
                if id.rfactor_product {
                    text.push_str("rf");
                }
                Ok(text)
            }
            ValKind::TensorView(tv) => {
                if self.lowered {
                    return Ok(format!("T{}", node.name));
                }
                let mut text = format!("T{}", node.name);
                text.push_str(&self.axis_list(&tv.domain.axes)?);
                if let Some(ca) = &tv.compute_at {
                    let _ = write!(
                        text,
                        " compute_at( T{}, {} )",
                        self.fusion.name(ca.view)?,
                        ca.consumer_position
                    );
                }
                Ok(text)
            }
            ValKind::TensorIndex(ti) => {
                let view = self.fusion.name(ti.view)?;
                if ti.indices.is_empty() {
                    return Ok(format!("T{view}[ 0 ]"));
                }
                let indices = ti
                    .indices
                    .iter()
                    .map(|index| self.render(*index, true))
                    .collect::<FusionResult<Vec<_>>>()?;
                Ok(format!("T{view}[ {} ]", indices.join(" + ")))
            }
        }
    }

    /// `[ ax, ax ]`, or `[ 0 ]` for a scalar-shaped domain.
    pub fn axis_list(&self, axes: &[ValId]) -> FusionResult<String> {
        if axes.is_empty() {
            return Ok("[ 0 ]".to_string());
        }
        let rendered = axes
            .iter()
            .map(|axis| self.render(*axis, false))
            .collect::<FusionResult<Vec<_>>>()?;
        Ok(format!("[ {} ]", rendered.join(", ")))
    }

    /// Right-hand side of an elementwise expression.
    fn rhs(&self, expr_id: ExprId, inline: bool) -> FusionResult<String> {
        let expr = self.fusion.expr(expr_id)?;
        let operands = expr
            .inputs
            .iter()
            .map(|input| self.render(*input, inline && !self.fusion.is_tensor(*input)))
            .collect::<FusionResult<Vec<_>>>()?;
        let from = self.fusion.dtype(expr.inputs[0])?;
        let out = expr.single_output().ok_or(FusionError::MultiOutput(expr_id))?;
        let to = self.fusion.dtype(out)?;
        op_text(&expr.kind, from, to, &operands)
    }

    /// One statement line, without indentation or newline.
    pub fn expr(&self, expr_id: ExprId) -> FusionResult<String> {
        let expr = self.fusion.expr(expr_id)?;
        let out = expr.single_output().ok_or(FusionError::MultiOutput(expr_id))?;
        let lhs = self.val(out)?;
        match &expr.kind {
            ExprKind::Reduction { op, init } => Ok(format!(
                "{lhs} = reduction( {}, op = {op}, initial value = {} );",
                self.val(expr.inputs[0])?,
                self.val(*init)?
            )),
            ExprKind::Broadcast { .. } => {
                Ok(format!("{lhs} = broadcast( {} );", self.val(expr.inputs[0])?))
            }
            _ => Ok(format!("{lhs} = {};", self.rhs(expr_id, false)?)),
        }
    }

    pub fn transform(&self, record: &DomainTransform) -> FusionResult<String> {
        match *record {
            DomainTransform::Split {
                input,
                outer,
                inner,
                factor,
            } => Ok(format!(
                "Split: {} by factor {} -> {}, {}",
                self.render(input, false)?,
                self.render(factor, true)?,
                self.render(outer, false)?,
                self.render(inner, false)?
            )),
            DomainTransform::Merge { outer, inner, out } => Ok(format!(
                "Merge: {} and {} -> {}",
                self.render(outer, false)?,
                self.render(inner, false)?,
                self.render(out, false)?
            )),
        }
    }

    /// Every expression reachable from the outputs, one per line.
    pub fn math(&self) -> FusionResult<String> {
        let mut out = String::new();
        for expr in self.fusion.exprs(true, false, false)? {
            out.push_str(&self.expr(expr)?);
            out.push('\n');
        }
        Ok(out)
    }

    /// Every tensor with the Split/Merge records that shaped it.
    pub fn transforms(&self) -> FusionResult<String> {
        let mut out = String::new();
        for &val in self.fusion.deterministic_vals() {
            if !self.fusion.is_tensor(val) {
                continue;
            }
            let domain = &self.fusion.tensor(val)?.domain;
            let _ = writeln!(
                out,
                "T{} root{}",
                self.fusion.name(val)?,
                self.axis_list(&domain.root)?
            );
            if let Some(rfactor) = &domain.rfactor {
                for record in &domain.root_history {
                    let _ = writeln!(out, "  {}", self.transform(record)?);
                }
                let _ = writeln!(out, "  rfactor{}", self.axis_list(rfactor)?);
            }
            for record in &domain.history {
                let _ = writeln!(out, "  {}", self.transform(record)?);
            }
            let _ = writeln!(out, "  axes{}", self.axis_list(&domain.axes)?);
        }
        Ok(out)
    }
}

/// Literal spelling of a constant of type `dtype`.
pub fn const_text(dtype: DataType, value: ConstValue) -> String {
    match dtype {
        DataType::Int => match value {
            ConstValue::Int(v) => v.to_string(),
            other => (other.as_f64() as i64).to_string(),
        },
        DataType::Bool => match value {
            ConstValue::Bool(v) => v.to_string(),
            other => (other.as_f64() != 0.0).to_string(),
        },
        DataType::Float => format!("float({})", value.as_f64()),
        DataType::Half => format!("__float2half({})", value.as_f64()),
    }
}

/// Right-hand side of a unary, binary or ternary operator applied to
/// already rendered operands.
pub fn op_text(
    kind: &ExprKind,
    from: DataType,
    to: DataType,
    operands: &[String],
) -> FusionResult<String> {
    let arity_error = || {
        FusionError::unsupported(format!(
            "{} with {} operands",
            kind.name(),
            operands.len()
        ))
    };
    match kind {
        ExprKind::Unary(op) => {
            let [a] = operands else {
                return Err(arity_error());
            };
            if *op == UnaryOpType::Cast {
                let func = cast_func_str(from, to)?;
                return Ok(if func.is_empty() {
                    a.clone()
                } else {
                    format!("{func}({a})")
                });
            }
            match (op.inline_str(), op.func_str()) {
                (Some(token), _) => Ok(format!("{token}{a}")),
                (None, Some(func)) => Ok(format!("{func}({a})")),
                (None, None) => Err(FusionError::unsupported(format!("unary {op}"))),
            }
        }
        ExprKind::Binary(op) => {
            let [a, b] = operands else {
                return Err(arity_error());
            };
            binary_text(*op, a, b)
        }
        ExprKind::Ternary(op) => {
            let [a, b, c] = operands else {
                return Err(arity_error());
            };
            Ok(format!("{}({a}, {b}, {c})", op.func_str()))
        }
        ExprKind::Reduction { .. } | ExprKind::Broadcast { .. } => Err(FusionError::unsupported(
            format!("{} has no elementwise form", kind.name()),
        )),
    }
}

pub fn binary_text(op: BinaryOpType, a: &str, b: &str) -> FusionResult<String> {
    match (op.inline_str(), op.func_str()) {
        (Some(token), _) => Ok(format!("{a} {token} {b}")),
        (None, Some(func)) => Ok(format!("{func}({a}, {b})")),
        (None, None) => Err(FusionError::unsupported(format!("binary {op}"))),
    }
}

impl Fusion {
    /// Renders one value the way the math printer does.
    pub fn val_to_string(&self, val: ValId) -> FusionResult<String> {
        IrPrinter::new(self).val(val)
    }

    pub fn expr_to_string(&self, expr: ExprId) -> FusionResult<String> {
        IrPrinter::new(self).expr(expr)
    }

    pub fn print_math(&self) -> FusionResult<String> {
        IrPrinter::new(self).math()
    }

    pub fn print_transforms(&self) -> FusionResult<String> {
        IrPrinter::new(self).transforms()
    }

    /// `%kernel { ... }` listing of the math.
    pub fn print(&self) -> FusionResult<String> {
        Ok(format!("%kernel {{\n{}}}\n", self.print_math()?))
    }
}
