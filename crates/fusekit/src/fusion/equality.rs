//! Structural equality, distinct from arena identity.

use crate::error::FusionResult;
use crate::ir::{ExprId, ExprKind, ValId, ValKind};

use super::Fusion;

impl Fusion {
    /// Whether two values are structurally the same.
    ///
    /// Constants compare by value, derived scalars by their defining
    /// expressions, and axes by kind, binding and bounds.
    pub fn same_val(&self, a: ValId, b: ValId) -> FusionResult<bool> {
        if a == b {
            return Ok(true);
        }
        let (lhs, rhs) = (self.val(a)?, self.val(b)?);
        match (&lhs.kind, &rhs.kind) {
            (ValKind::Scalar(x), ValKind::Scalar(y)) => {
                if x.dtype != y.dtype {
                    return Ok(false);
                }
                match (x.value, y.value) {
                    (Some(xv), Some(yv)) => Ok(xv == yv),
                    (None, None) => match (self.origin(a), self.origin(b)) {
                        (Some(ea), Some(eb)) => self.same_expr(ea, eb),
                        _ => Ok(false),
                    },
                    _ => Ok(false),
                }
            }
            (
                ValKind::NamedScalar { name: x, dtype: dx },
                ValKind::NamedScalar { name: y, dtype: dy },
            ) => Ok(x == y && dx == dy),
            (ValKind::IterDomain(x), ValKind::IterDomain(y)) => {
                if x.iter_type != y.iter_type
                    || x.parallel != y.parallel
                    || x.rfactor_product != y.rfactor_product
                {
                    return Ok(false);
                }
                Ok(self.same_val(x.start, y.start)? && self.same_val(x.extent, y.extent)?)
            }
            (ValKind::TensorView(x), ValKind::TensorView(y)) => {
                if x.dtype != y.dtype {
                    return Ok(false);
                }
                self.same_vals(&x.domain.axes, &y.domain.axes)
            }
            (ValKind::TensorIndex(x), ValKind::TensorIndex(y)) => {
                Ok(x.view == y.view && self.same_vals(&x.indices, &y.indices)?)
            }
            _ => Ok(false),
        }
    }

    fn same_vals(&self, a: &[ValId], b: &[ValId]) -> FusionResult<bool> {
        if a.len() != b.len() {
            return Ok(false);
        }
        for (&x, &y) in a.iter().zip(b) {
            if !self.same_val(x, y)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Same operator applied to structurally equal inputs.
    pub fn same_expr(&self, a: ExprId, b: ExprId) -> FusionResult<bool> {
        if a == b {
            return Ok(true);
        }
        let (lhs, rhs) = (self.expr(a)?, self.expr(b)?);
        if lhs.outputs.len() != rhs.outputs.len() {
            return Ok(false);
        }
        let kinds_match = match (&lhs.kind, &rhs.kind) {
            (
                ExprKind::Reduction { op: x, init: ix },
                ExprKind::Reduction { op: y, init: iy },
            ) => x == y && self.same_val(*ix, *iy)?,
            (x, y) => x == y,
        };
        Ok(kinds_match && self.same_vals(&lhs.inputs, &rhs.inputs)?)
    }
}
