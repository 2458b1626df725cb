//! Topological traversal of the fusion graph.
//!
//! The forward walker starts at a set of values and follows origins back to
//! the graph sources, handling every statement only after all of its
//! producers (post-order DFS). It is iterative: an explicit stack of frames,
//! each frame holding the not-yet-handled predecessors of one statement.
//!
//! ```text
//!   frames: [ [T3] ]            start from T3
//!           [ [T3], [e1] ]      origin of T3
//!           [ [T3], [e1], [T2, T0] ]
//!   handle order: T0, T2 ..., e1, T3
//! ```

mod backward;
mod dependency;

use std::collections::HashSet;

use crate::error::{FusionError, FusionResult};
use crate::fusion::Fusion;
use crate::ir::{ExprId, Statement, ValId};

pub use backward::{traverse_backward_from, BackwardVisitor};
pub use dependency::DependencyCheck;

/// Flags for [`traverse_from`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraversalOptions {
    /// Revisit statements reachable along more than one path.
    pub traverse_all_paths: bool,
    /// Order expression inputs by their compute-at position.
    pub respect_compute_at: bool,
}

/// Per-statement callbacks of the forward walker.
pub trait IterVisitor {
    /// Called once all predecessors of `stmt` were handled. `frames` is the
    /// traversal stack; the last element of each frame lies on the current
    /// path, `stmt` being the last element of the last frame.
    fn handle(
        &mut self,
        fusion: &Fusion,
        stmt: Statement,
        frames: &[Vec<Statement>],
    ) -> FusionResult<()>;

    /// Predecessors of `stmt`.
    fn next(
        &mut self,
        fusion: &Fusion,
        stmt: Statement,
        respect_compute_at: bool,
    ) -> FusionResult<Vec<Statement>> {
        default_next(fusion, stmt, respect_compute_at)
    }
}

/// Origin of a value, or inputs of an expression.
///
/// With `respect_compute_at`, inputs computed at the expression's output
/// are stably ordered by ascending compute-at position; all others come
/// first.
pub fn default_next(
    fusion: &Fusion,
    stmt: Statement,
    respect_compute_at: bool,
) -> FusionResult<Vec<Statement>> {
    match stmt {
        Statement::Val(val) => {
            fusion.val(val)?;
            Ok(fusion.origin(val).map(Statement::Expr).into_iter().collect())
        }
        Statement::Expr(expr_id) => {
            let expr = fusion.expr(expr_id)?;
            let mut inputs: Vec<ValId> = expr.inputs.to_vec();
            if respect_compute_at {
                let out = expr.single_output().ok_or(FusionError::MultiOutput(expr_id))?;
                if fusion.is_tensor(out) {
                    let mut keyed = Vec::with_capacity(inputs.len());
                    for input in inputs {
                        keyed.push((compute_at_key(fusion, input, out)?, input));
                    }
                    keyed.sort_by_key(|(key, _)| *key);
                    inputs = keyed.into_iter().map(|(_, input)| input).collect();
                }
            }
            Ok(inputs.into_iter().map(Statement::Val).collect())
        }
    }
}

fn compute_at_key(fusion: &Fusion, input: ValId, out: ValId) -> FusionResult<i64> {
    if !fusion.is_tensor(input) {
        return Ok(-1);
    }
    Ok(match &fusion.tensor(input)?.compute_at {
        Some(ca) if ca.view == out => ca.consumer_position as i64,
        _ => -1,
    })
}

/// Walks from `from` (or, when empty, the outputs, or all unused values if
/// there are no outputs) toward the graph sources.
pub fn traverse_from<V: IterVisitor + ?Sized>(
    visitor: &mut V,
    fusion: &Fusion,
    from: &[ValId],
    options: TraversalOptions,
) -> FusionResult<()> {
    let roots = if from.is_empty() {
        traversal_roots(fusion)
    } else {
        from.to_vec()
    };

    let mut visited: HashSet<Statement> = HashSet::new();
    let mut frames: Vec<Vec<Statement>> = vec![roots.into_iter().rev().map(Statement::Val).collect()];
    let mut all_inputs_visited = false;

    while let Some(current) = frames.last() {
        let Some(&stmt) = current.last() else {
            frames.pop();
            all_inputs_visited = true;
            continue;
        };

        if all_inputs_visited {
            if options.traverse_all_paths || visited.insert(stmt) {
                visitor.handle(fusion, stmt, &frames)?;
            }
            if let Some(frame) = frames.last_mut() {
                frame.pop();
            }
            all_inputs_visited = false;
            continue;
        }

        let mut next = visitor.next(fusion, stmt, options.respect_compute_at)?;
        if !options.traverse_all_paths {
            next.retain(|s| !visited.contains(s));
        }
        if next.is_empty() {
            all_inputs_visited = true;
        } else {
            frames.push(next.into_iter().rev().collect());
        }
    }
    Ok(())
}

/// [`traverse_from`] starting at the outputs (or the unused values).
pub fn traverse<V: IterVisitor + ?Sized>(
    visitor: &mut V,
    fusion: &Fusion,
    options: TraversalOptions,
) -> FusionResult<()> {
    traverse_from(visitor, fusion, &[], options)
}

/// Outputs when present, otherwise every value without uses.
pub fn traversal_roots(fusion: &Fusion) -> Vec<ValId> {
    if !fusion.outputs().is_empty() {
        return fusion.outputs().to_vec();
    }
    leaves(fusion)
}

fn leaves(fusion: &Fusion) -> Vec<ValId> {
    fusion
        .deterministic_vals()
        .iter()
        .copied()
        .filter(|val| !fusion.used(*val))
        .collect()
}

/// Outputs not consumed by any expression reachable from the outputs.
pub fn terminating_outputs(fusion: &Fusion) -> FusionResult<Vec<ValId>> {
    let mut reachable = ExprCollector::default();
    traverse_from(
        &mut reachable,
        fusion,
        fusion.outputs(),
        TraversalOptions::default(),
    )?;
    let reachable: HashSet<ExprId> = reachable.exprs.into_iter().collect();

    let mut terminating = Vec::new();
    for &out in fusion.outputs() {
        if terminating.contains(&out) {
            continue;
        }
        if !fusion.uses(out).iter().any(|use_| reachable.contains(use_)) {
            terminating.push(out);
        }
    }
    Ok(terminating)
}

#[derive(Default)]
struct ExprCollector {
    exprs: Vec<ExprId>,
}

impl IterVisitor for ExprCollector {
    fn handle(&mut self, _: &Fusion, stmt: Statement, _: &[Vec<Statement>]) -> FusionResult<()> {
        if let Statement::Expr(expr) = stmt {
            self.exprs.push(expr);
        }
        Ok(())
    }
}

/// Topologically sorted expressions of the whole fusion.
pub fn expr_sort(
    fusion: &Fusion,
    from_outputs_only: bool,
    breadth_first: bool,
    respect_compute_at: bool,
) -> FusionResult<Vec<ExprId>> {
    if breadth_first {
        return Err(FusionError::NotImplemented(
            "breadth-first traversal is not implemented".into(),
        ));
    }
    let from = if from_outputs_only {
        terminating_outputs(fusion)?
    } else {
        leaves(fusion)
    };
    if from.is_empty() {
        return Ok(Vec::new());
    }
    let mut sorter = ExprCollector::default();
    traverse_from(
        &mut sorter,
        fusion,
        &from,
        TraversalOptions {
            traverse_all_paths: false,
            respect_compute_at,
        },
    )?;
    Ok(sorter.exprs)
}

/// Topologically sorted expressions that `from` depends on.
pub fn exprs_from(fusion: &Fusion, from: &[ValId]) -> FusionResult<Vec<ExprId>> {
    if from.is_empty() {
        return Ok(Vec::new());
    }
    let mut sorter = ExprCollector::default();
    traverse_from(&mut sorter, fusion, from, TraversalOptions::default())?;
    Ok(sorter.exprs)
}

#[derive(Default)]
struct ValCollector {
    sources_only: bool,
    vals: Vec<ValId>,
    seen: HashSet<ValId>,
}

impl IterVisitor for ValCollector {
    fn handle(&mut self, fusion: &Fusion, stmt: Statement, _: &[Vec<Statement>]) -> FusionResult<()> {
        if let Statement::Val(val) = stmt {
            if self.sources_only && fusion.origin(val).is_some() {
                return Ok(());
            }
            if self.seen.insert(val) {
                self.vals.push(val);
            }
        }
        Ok(())
    }
}

/// Origin-less values that `vals` depend on, in traversal order.
pub fn inputs_to(fusion: &Fusion, vals: &[ValId]) -> FusionResult<Vec<ValId>> {
    if vals.is_empty() {
        return Ok(Vec::new());
    }
    let mut collector = ValCollector {
        sources_only: true,
        ..ValCollector::default()
    };
    traverse_from(&mut collector, fusion, vals, TraversalOptions::default())?;
    Ok(collector.vals)
}

/// Every value `from` depends on, producers first.
pub fn all_vals(fusion: &Fusion, from: &[ValId]) -> FusionResult<Vec<ValId>> {
    if from.is_empty() {
        return Ok(Vec::new());
    }
    let mut collector = ValCollector::default();
    traverse_from(&mut collector, fusion, from, TraversalOptions::default())?;
    Ok(collector.vals)
}
