use std::collections::{HashMap, HashSet};

use crate::error::FusionResult;
use crate::fusion::Fusion;
use crate::ir::{ExprId, Statement, ValId};

use super::{all_vals, exprs_from, inputs_to};

/// Per-statement callback of the backward walker. Statements are handled
/// after all of their consumers.
pub trait BackwardVisitor {
    fn handle(&mut self, fusion: &Fusion, stmt: Statement) -> FusionResult<()>;
}

/// Walks from the sources of `from` toward `from`, restricted to the
/// subgraph `from` depends on.
///
/// Successors are visited in the topological order computed by the forward
/// walker so that values with several consumers are expanded the same way
/// on every run.
pub fn traverse_backward_from<V: BackwardVisitor + ?Sized>(
    visitor: &mut V,
    fusion: &Fusion,
    from: &[ValId],
    traverse_all_paths: bool,
) -> FusionResult<()> {
    let vals: HashSet<ValId> = all_vals(fusion, from)?.into_iter().collect();
    let order: HashMap<ExprId, usize> = exprs_from(fusion, from)?
        .into_iter()
        .enumerate()
        .map(|(position, expr)| (expr, position))
        .collect();

    let mut sources = inputs_to(fusion, from)?;
    sources.sort();

    let next = |stmt: Statement| -> FusionResult<Vec<Statement>> {
        match stmt {
            Statement::Val(val) => {
                let mut uses: Vec<(usize, ExprId)> = fusion
                    .uses(val)
                    .into_iter()
                    .filter_map(|expr| order.get(&expr).map(|pos| (*pos, expr)))
                    .collect();
                uses.sort();
                Ok(uses.into_iter().map(|(_, expr)| Statement::Expr(expr)).collect())
            }
            Statement::Expr(expr) => Ok(fusion
                .expr(expr)?
                .outputs
                .iter()
                .filter(|out| vals.contains(out))
                .map(|out| Statement::Val(*out))
                .collect()),
        }
    };

    let mut visited: HashSet<Statement> = HashSet::new();
    let mut frames: Vec<Vec<Statement>> = vec![sources.into_iter().rev().map(Statement::Val).collect()];
    let mut all_outputs_visited = false;

    while let Some(current) = frames.last() {
        let Some(&stmt) = current.last() else {
            frames.pop();
            all_outputs_visited = true;
            continue;
        };

        if all_outputs_visited {
            if traverse_all_paths || visited.insert(stmt) {
                visitor.handle(fusion, stmt)?;
            }
            if let Some(frame) = frames.last_mut() {
                frame.pop();
            }
            all_outputs_visited = false;
            continue;
        }

        let mut successors = next(stmt)?;
        if !traverse_all_paths {
            successors.retain(|s| !visited.contains(s));
        }
        if successors.is_empty() {
            all_outputs_visited = true;
        } else {
            frames.push(successors.into_iter().rev().collect());
        }
    }
    Ok(())
}
