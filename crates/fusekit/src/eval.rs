//! Integer evaluation of scalar expressions.
//!
//! An [`EvaluationContext`] binds origin-less symbols to concrete values and
//! folds everything derived from them. Unknown symbols are not an error:
//! `evaluate` returns `Ok(None)` and the caller decides what that means.

use std::collections::HashMap;

use crate::error::{FusionError, FusionResult};
use crate::fusion::Fusion;
use crate::ir::{BinaryOpType, ConstValue, ExprId, ExprKind, UnaryOpType, ValId, ValKind};

pub struct EvaluationContext<'a> {
    fusion: &'a Fusion,
    bindings: HashMap<ValId, i64>,
    memo: HashMap<ValId, Option<i64>>,
}

impl<'a> EvaluationContext<'a> {
    pub fn new(fusion: &'a Fusion) -> Self {
        EvaluationContext {
            fusion,
            bindings: HashMap::new(),
            memo: HashMap::new(),
        }
    }

    pub fn fusion(&self) -> &'a Fusion {
        self.fusion
    }

    /// Binds a symbolic scalar. Constants and computed values cannot be
    /// bound; rebinding a symbol replaces its value.
    pub fn bind(&mut self, val: ValId, value: i64) -> FusionResult<()> {
        let node = self.fusion.val(val)?;
        match &node.kind {
            ValKind::Scalar(scalar) => {
                if scalar.value.is_some() {
                    return Err(FusionError::invalid_binding(val, "value is a constant"));
                }
                if scalar.dtype.is_floating_point() {
                    return Err(FusionError::invalid_binding(
                        val,
                        format!("cannot bind an integer to a {} scalar", scalar.dtype),
                    ));
                }
            }
            ValKind::NamedScalar { .. } => {}
            _ => {
                return Err(FusionError::invalid_binding(
                    val,
                    format!("cannot bind a {}", node.kind_name()),
                ))
            }
        }
        if self.fusion.origin(val).is_some() {
            return Err(FusionError::invalid_binding(
                val,
                "value is computed by an expression",
            ));
        }
        self.bindings.insert(val, value);
        self.memo.clear();
        Ok(())
    }

    pub fn is_bound(&self, val: ValId) -> bool {
        self.bindings.contains_key(&val)
    }

    /// Value of `val`, or `None` when it depends on an unbound symbol.
    pub fn evaluate(&mut self, val: ValId) -> FusionResult<Option<i64>> {
        if let Some(known) = self.memo.get(&val) {
            return Ok(*known);
        }
        let value = self.compute(val)?;
        self.memo.insert(val, value);
        Ok(value)
    }

    fn compute(&mut self, val: ValId) -> FusionResult<Option<i64>> {
        let node = self.fusion.val(val)?;
        match &node.kind {
            ValKind::Scalar(scalar) => match scalar.value {
                Some(ConstValue::Float(_)) => Err(FusionError::TypeMismatch(format!(
                    "cannot evaluate floating-point constant {val} as an integer"
                ))),
                Some(constant) => Ok(constant.as_int()),
                None => self.symbol(val),
            },
            ValKind::NamedScalar { .. } => self.symbol(val),
            _ => Err(FusionError::WrongKind {
                val,
                expected: "scalar",
            }),
        }
    }

    fn symbol(&mut self, val: ValId) -> FusionResult<Option<i64>> {
        if let Some(bound) = self.bindings.get(&val) {
            return Ok(Some(*bound));
        }
        if let Some(origin) = self.fusion.origin(val) {
            return self.evaluate_expr(origin);
        }
        let lowered = self.fusion.lowered_val(val);
        if lowered != val {
            return self.evaluate(lowered);
        }
        Ok(None)
    }

    fn evaluate_expr(&mut self, expr_id: ExprId) -> FusionResult<Option<i64>> {
        let expr = self.fusion.expr(expr_id)?;
        let kind = expr.kind.clone();
        let inputs = expr.inputs.clone();
        let mut operands = Vec::with_capacity(inputs.len());
        for input in inputs {
            match self.evaluate(input)? {
                Some(value) => operands.push(value),
                None => return Ok(None),
            }
        }
        match (kind, operands.as_slice()) {
            (ExprKind::Unary(op), &[a]) => unary(op, a).map(Some),
            (ExprKind::Binary(op), &[a, b]) => binary(op, a, b).map(Some),
            (kind, _) => Err(FusionError::unsupported(format!(
                "{} cannot be evaluated as an integer expression",
                kind.name()
            ))),
        }
    }
}

fn overflow(op: impl std::fmt::Display, operands: &[i64]) -> FusionError {
    FusionError::unsupported(format!("integer overflow evaluating {op} of {operands:?}"))
}

fn unary(op: UnaryOpType, a: i64) -> FusionResult<i64> {
    match op {
        UnaryOpType::Neg => a.checked_neg().ok_or_else(|| overflow(op, &[a])),
        UnaryOpType::Set | UnaryOpType::Cast => Ok(a),
        UnaryOpType::Abs => a.checked_abs().ok_or_else(|| overflow(op, &[a])),
        other => Err(FusionError::unsupported(format!(
            "{other} in integer evaluation"
        ))),
    }
}

fn binary(op: BinaryOpType, a: i64, b: i64) -> FusionResult<i64> {
    let nonzero = |what: &str| {
        if b == 0 {
            Err(FusionError::unsupported(format!("{what} by zero")))
        } else {
            Ok(())
        }
    };
    let checked = |value: Option<i64>| value.ok_or_else(|| overflow(op, &[a, b]));
    Ok(match op {
        BinaryOpType::Add => checked(a.checked_add(b))?,
        BinaryOpType::Sub => checked(a.checked_sub(b))?,
        BinaryOpType::Mul => checked(a.checked_mul(b))?,
        BinaryOpType::Div => {
            nonzero("division")?;
            checked(a.checked_div(b))?
        }
        BinaryOpType::Mod => {
            nonzero("modulo")?;
            checked(a.checked_rem(b))?
        }
        BinaryOpType::CeilDiv => {
            nonzero("division")?;
            let numerator = b.checked_sub(1).and_then(|bias| a.checked_add(bias));
            checked(numerator.and_then(|n| n.checked_div(b)))?
        }
        BinaryOpType::Max => a.max(b),
        BinaryOpType::Min => a.min(b),
        BinaryOpType::And => i64::from(a != 0 && b != 0),
        BinaryOpType::Eq => i64::from(a == b),
        BinaryOpType::Ne => i64::from(a != b),
        BinaryOpType::Lt => i64::from(a < b),
        BinaryOpType::Le => i64::from(a <= b),
        BinaryOpType::Gt => i64::from(a > b),
        BinaryOpType::Ge => i64::from(a >= b),
        BinaryOpType::Pow => {
            return Err(FusionError::unsupported(format!(
                "{op} in integer evaluation"
            )))
        }
    })
}

/// Convenience for a context with a few bindings.
pub fn evaluate_with(
    fusion: &Fusion,
    bindings: &[(ValId, i64)],
    val: ValId,
) -> FusionResult<Option<i64>> {
    let mut context = EvaluationContext::new(fusion);
    for &(symbol, value) in bindings {
        context.bind(symbol, value)?;
    }
    context.evaluate(val)
}
