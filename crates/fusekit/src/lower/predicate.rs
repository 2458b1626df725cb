use std::collections::HashSet;

use crate::arith;
use crate::error::FusionResult;
use crate::fusion::Fusion;
use crate::ir::ValId;

use super::index::IndexMap;

/// Guard keeping every root index of `tv` inside its extent.
///
/// A root axis needs a guard when it is not itself a serial loop axis:
/// splitting rounds the outer extent up, and launch dimensions may be
/// larger than the axis they are bound to. Returns `None` when nothing
/// needs guarding.
pub(super) fn root_predicate(
    fusion: &mut Fusion,
    tv: ValId,
    root_indices: &IndexMap,
    include_reductions: bool,
) -> FusionResult<Option<ValId>> {
    let domain = fusion.tensor(tv)?.domain.clone();
    let leaves: HashSet<ValId> = domain.axes.iter().copied().collect();

    let mut cond: Option<ValId> = None;
    for root in domain.root {
        let id = fusion.iter_domain(root)?.clone();
        if id.is_broadcast() || (id.is_reduction() && !include_reductions) {
            continue;
        }
        if leaves.contains(&root) && !id.is_thread() {
            continue;
        }
        let Some(&index) = root_indices.get(&root) else {
            continue;
        };
        let in_bounds = arith::lt(fusion, index, id.extent)?;
        cond = Some(match cond {
            Some(previous) => arith::and(fusion, previous, in_bounds)?,
            None => in_bounds,
        });
    }
    Ok(cond)
}
