use std::collections::HashSet;

use crate::error::FusionResult;
use crate::fusion::Fusion;
use crate::ir::{Statement, ValId};

use super::{all_vals, default_next, traverse_from, IterVisitor, TraversalOptions};

/// Records the current path whenever a dependency is reached. Dependencies
/// are leaves: the walk never expands past them.
struct DependencyChains {
    dependencies: HashSet<ValId>,
    chains: Vec<Vec<ValId>>,
}

impl DependencyChains {
    fn new(dependencies: impl IntoIterator<Item = ValId>) -> Self {
        DependencyChains {
            dependencies: dependencies.into_iter().collect(),
            chains: Vec::new(),
        }
    }
}

impl IterVisitor for DependencyChains {
    fn handle(&mut self, _: &Fusion, stmt: Statement, frames: &[Vec<Statement>]) -> FusionResult<()> {
        if let Statement::Val(val) = stmt {
            if self.dependencies.contains(&val) {
                let chain: Vec<ValId> = frames
                    .iter()
                    .rev()
                    .filter_map(|frame| frame.last().and_then(|s| s.as_val()))
                    .collect();
                self.chains.push(chain);
            }
        }
        Ok(())
    }

    fn next(
        &mut self,
        fusion: &Fusion,
        stmt: Statement,
        respect_compute_at: bool,
    ) -> FusionResult<Vec<Statement>> {
        if let Statement::Val(val) = stmt {
            if self.dependencies.contains(&val) {
                return Ok(Vec::new());
            }
        }
        default_next(fusion, stmt, respect_compute_at)
    }
}

/// Dependency queries between values.
///
/// Chains are ordered from the dependency to the dependent value.
pub struct DependencyCheck;

impl DependencyCheck {
    fn chains(
        fusion: &Fusion,
        dependency: ValId,
        of: &[ValId],
        all_paths: bool,
    ) -> FusionResult<Vec<Vec<ValId>>> {
        fusion.val(dependency)?;
        for &val in of {
            fusion.val(val)?;
        }
        if of.is_empty() {
            return Ok(Vec::new());
        }
        let mut visitor = DependencyChains::new([dependency]);
        traverse_from(
            &mut visitor,
            fusion,
            of,
            TraversalOptions {
                traverse_all_paths: all_paths,
                respect_compute_at: false,
            },
        )?;
        Ok(visitor.chains)
    }

    pub fn is_dependency_of(fusion: &Fusion, dependency: ValId, of: ValId) -> FusionResult<bool> {
        Ok(!Self::chains(fusion, dependency, &[of], false)?.is_empty())
    }

    /// One chain from `dependency` to `of`, or empty if there is none.
    ///
    /// When several paths exist (diamonds) the chain returned is simply the
    /// first one the walk finds; use [`DependencyCheck::all_dependency_chains`]
    /// when every path matters.
    pub fn single_dependency_chain(
        fusion: &Fusion,
        dependency: ValId,
        of: ValId,
    ) -> FusionResult<Vec<ValId>> {
        Ok(Self::chains(fusion, dependency, &[of], false)?
            .into_iter()
            .next()
            .unwrap_or_default())
    }

    pub fn all_dependency_chains(
        fusion: &Fusion,
        dependency: ValId,
        of: ValId,
    ) -> FusionResult<Vec<Vec<ValId>>> {
        Self::chains(fusion, dependency, &[of], true)
    }

    /// Every chain from `val` to a fusion output.
    pub fn all_use_chains(fusion: &Fusion, val: ValId) -> FusionResult<Vec<Vec<ValId>>> {
        let outputs = fusion.outputs().to_vec();
        Self::chains(fusion, val, &outputs, true)
    }

    /// Values that depend on one of `dependencies` and that one of `of`
    /// depends on, producers first. Both ends are included.
    pub fn all_vals_between(
        fusion: &Fusion,
        dependencies: &[ValId],
        of: &[ValId],
    ) -> FusionResult<Vec<ValId>> {
        let sources: HashSet<ValId> = dependencies.iter().copied().collect();
        let mut between: HashSet<ValId> = HashSet::new();
        let mut ordered = Vec::new();
        for val in all_vals(fusion, of)? {
            let reached = sources.contains(&val)
                || match fusion.origin(val) {
                    Some(expr) => fusion
                        .expr(expr)?
                        .inputs
                        .iter()
                        .any(|input| between.contains(input)),
                    None => false,
                };
            if reached {
                between.insert(val);
                ordered.push(val);
            }
        }
        Ok(ordered)
    }
}
