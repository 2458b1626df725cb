//! Transform replay: re-executing one tensor's Split/Merge records on
//! another tensor's axes.
//!
//! The source and target are linked through the expression between them,
//! which pairs the consumer's root axes with the producer's (rfactor or
//! root) axes, reductions removed. Only the records the source's leading
//! `pos` axes depend on are replayed; the target keeps whatever of its own
//! schedule does not touch the replayed axes.

use std::collections::{HashMap, HashSet};

use crate::error::{FusionError, FusionResult};
use crate::fusion::Fusion;
use crate::ir::{DomainTransform, ExprKind, ValId};

/// Result of replaying a schedule onto a tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayOutcome {
    /// Number of the target's leading axes that now mirror the source.
    pub position: usize,
    /// For each of those axes, the source axis it mirrors.
    pub axis_map: Vec<usize>,
}

/// `(consumer root axis, producer axis)` pairs across the expression that
/// defines `consumer`.
pub(crate) fn root_pairs(
    fusion: &Fusion,
    producer: ValId,
    consumer: ValId,
) -> FusionResult<Vec<(ValId, ValId)>> {
    let origin = fusion.origin(consumer).ok_or_else(|| {
        FusionError::ReplayMismatch(format!("{consumer} has no defining expression"))
    })?;
    let expr = fusion.expr(origin)?;
    if !expr.inputs.contains(&producer) {
        return Err(FusionError::ReplayMismatch(format!(
            "{producer} is not an input of the expression defining {consumer}"
        )));
    }
    let producer_ids = fusion.no_reductions(fusion.tensor(producer)?.domain.maybe_rfactor())?;
    let consumer_root = &fusion.tensor(consumer)?.domain.root;
    let consumer_ids: Vec<ValId> = match &expr.kind {
        ExprKind::Broadcast { new_axes } => consumer_root
            .iter()
            .zip(new_axes)
            .filter(|(_, is_new)| !**is_new)
            .map(|(id, _)| *id)
            .collect(),
        _ => consumer_root.clone(),
    };
    if consumer_ids.len() != producer_ids.len() {
        return Err(FusionError::ReplayMismatch(format!(
            "consumer {consumer} maps {} root axes but producer {producer} provides {}",
            consumer_ids.len(),
            producer_ids.len()
        )));
    }
    Ok(consumer_ids.into_iter().zip(producer_ids).collect())
}

fn copy_parallel(fusion: &mut Fusion, from: ValId, to: ValId) -> FusionResult<()> {
    let parallel = fusion.iter_domain(from)?.parallel;
    fusion.iter_domain_mut(to)?.parallel = parallel;
    Ok(())
}

/// Applies `records` to the targets of `id_map`, extending the map with
/// every new axis. Records whose inputs are unmapped are skipped; a merge
/// with one mapped side forwards that side.
pub(crate) fn replay_records(
    fusion: &mut Fusion,
    records: &[DomainTransform],
    id_map: &mut HashMap<ValId, ValId>,
) -> FusionResult<Vec<DomainTransform>> {
    let mut replayed = Vec::new();
    for record in records {
        match *record {
            DomainTransform::Split {
                input,
                outer,
                inner,
                factor,
            } => {
                let Some(&target) = id_map.get(&input) else {
                    continue;
                };
                let (new_outer, new_inner) = fusion.split_iter_domain(target, factor)?;
                copy_parallel(fusion, outer, new_outer)?;
                copy_parallel(fusion, inner, new_inner)?;
                id_map.insert(outer, new_outer);
                id_map.insert(inner, new_inner);
                replayed.push(DomainTransform::Split {
                    input: target,
                    outer: new_outer,
                    inner: new_inner,
                    factor,
                });
            }
            DomainTransform::Merge { outer, inner, out } => {
                match (id_map.get(&outer).copied(), id_map.get(&inner).copied()) {
                    (Some(new_outer), Some(new_inner)) => {
                        let merged = fusion.merge_iter_domains(new_outer, new_inner)?;
                        copy_parallel(fusion, out, merged)?;
                        id_map.insert(out, merged);
                        replayed.push(DomainTransform::Merge {
                            outer: new_outer,
                            inner: new_inner,
                            out: merged,
                        });
                    }
                    (Some(only), None) | (None, Some(only)) => {
                        id_map.insert(out, only);
                    }
                    (None, None) => {}
                }
            }
        }
    }
    Ok(replayed)
}

/// Replays the part of `source_records` that produces `source_axes[..pos]`
/// onto `target`, whose base axes are reached through `id_map`.
fn replay_onto(
    fusion: &mut Fusion,
    target: ValId,
    mut id_map: HashMap<ValId, ValId>,
    source_records: &[DomainTransform],
    source_axes: &[ValId],
    pos: usize,
) -> FusionResult<ReplayOutcome> {
    let domain = fusion.tensor(target)?.domain.clone();
    let base: Vec<ValId> = domain.maybe_rfactor().to_vec();

    let mut needed: HashSet<ValId> = source_axes[..pos].iter().copied().collect();
    let mut selected = Vec::new();
    for record in source_records.iter().rev() {
        if record.outputs().iter().any(|out| needed.contains(out)) {
            needed.extend(record.inputs());
            selected.push(*record);
        }
    }
    selected.reverse();
    let replayed = replay_records(fusion, &selected, &mut id_map)?;

    let mut prefix = Vec::new();
    let mut axis_map = Vec::new();
    for (index, axis) in source_axes[..pos].iter().enumerate() {
        if let Some(&mapped) = id_map.get(axis) {
            if !prefix.contains(&mapped) {
                copy_parallel(fusion, *axis, mapped)?;
                prefix.push(mapped);
                axis_map.push(index);
            }
        }
    }
    let in_prefix: HashSet<ValId> = prefix.iter().copied().collect();

    // Leaves after the replay, then whatever of the target's own schedule
    // still applies on top of them.
    let mut live: HashSet<ValId> = base.iter().copied().collect();
    let mut candidates: Vec<ValId> = base.clone();
    for record in &replayed {
        for input in record.inputs() {
            live.remove(&input);
        }
        for out in record.outputs() {
            live.insert(out);
            candidates.push(out);
        }
    }
    let mut reapplied = Vec::new();
    for record in &domain.history {
        let inputs = record.inputs();
        let applies = inputs
            .iter()
            .all(|input| live.contains(input) && !in_prefix.contains(input));
        if !applies {
            continue;
        }
        for input in &inputs {
            live.remove(input);
        }
        for out in record.outputs() {
            live.insert(out);
            candidates.push(out);
        }
        reapplied.push(*record);
    }
    let mut seen = HashSet::new();
    let leaves: Vec<ValId> = candidates
        .into_iter()
        .filter(|id| live.contains(id) && !in_prefix.contains(id) && seen.insert(*id))
        .collect();
    let leaf_set: HashSet<ValId> = leaves.iter().copied().collect();

    let mut roots_of: HashMap<ValId, Vec<ValId>> =
        base.iter().map(|id| (*id, vec![*id])).collect();
    for record in domain.history.iter().chain(&replayed) {
        let mut roots: Vec<ValId> = Vec::new();
        for input in record.inputs() {
            for root in roots_of.get(&input).into_iter().flatten() {
                if !roots.contains(root) {
                    roots.push(*root);
                }
            }
        }
        for out in record.outputs() {
            roots_of.insert(out, roots.clone());
        }
    }
    let mut source_rank: HashMap<ValId, usize> = HashMap::new();
    for (index, axis) in source_axes.iter().enumerate() {
        if let Some(&mapped) = id_map.get(axis) {
            source_rank.entry(mapped).or_insert(index);
        }
    }

    // Keep the target's axis order; axes the replay replaced are filled in
    // where their ancestors used to sit, in source order.
    let mut placed = in_prefix.clone();
    let mut axes = prefix;
    for old in &domain.axes {
        if leaf_set.contains(old) {
            if placed.insert(*old) {
                axes.push(*old);
            }
            continue;
        }
        let old_roots = roots_of.get(old).cloned().unwrap_or_default();
        let mut derived: Vec<ValId> = leaves
            .iter()
            .copied()
            .filter(|leaf| {
                !placed.contains(leaf)
                    && roots_of
                        .get(leaf)
                        .is_some_and(|roots| roots.iter().any(|root| old_roots.contains(root)))
            })
            .collect();
        derived.sort_by_key(|leaf| source_rank.get(leaf).copied().unwrap_or(usize::MAX));
        for leaf in derived {
            placed.insert(leaf);
            axes.push(leaf);
        }
    }
    for leaf in leaves {
        if placed.insert(leaf) {
            axes.push(leaf);
        }
    }

    let position = axis_map.len();
    let target_domain = &mut fusion.tensor_mut(target)?.domain;
    target_domain.axes = axes;
    target_domain.history = replayed.into_iter().chain(reapplied).collect();
    Ok(ReplayOutcome { position, axis_map })
}

/// Resolves a position in `0..=ndims`, negative values counting from the
/// end (`-1` is `ndims`).
pub(crate) fn normalize_position(position: i64, ndims: usize) -> FusionResult<usize> {
    let rank = ndims as i64;
    let resolved = if position < 0 { position + rank + 1 } else { position };
    if resolved < 0 || resolved > rank {
        return Err(FusionError::AxisOutOfRange {
            axis: position,
            rank: ndims,
        });
    }
    Ok(resolved as usize)
}

impl Fusion {
    pub(crate) fn replay_pasc(
        &mut self,
        producer: ValId,
        consumer: ValId,
        pos: usize,
    ) -> FusionResult<ReplayOutcome> {
        let consumer_domain = self.tensor(consumer)?.domain.clone();
        if pos > consumer_domain.ndims() {
            return Err(FusionError::AxisOutOfRange {
                axis: pos as i64,
                rank: consumer_domain.ndims(),
            });
        }
        let id_map: HashMap<ValId, ValId> = root_pairs(self, producer, consumer)?.into_iter().collect();
        let records: Vec<DomainTransform> = consumer_domain.all_transforms().copied().collect();
        replay_onto(self, producer, id_map, &records, &consumer_domain.axes, pos)
    }

    pub(crate) fn replay_casp(
        &mut self,
        consumer: ValId,
        producer: ValId,
        pos: usize,
    ) -> FusionResult<ReplayOutcome> {
        if self.tensor(consumer)?.domain.has_rfactor() {
            return Err(FusionError::ReplayMismatch(format!(
                "cannot replay onto {consumer}: it has an rfactor domain"
            )));
        }
        let producer_domain = self.tensor(producer)?.domain.clone();
        if pos > producer_domain.ndims() {
            return Err(FusionError::AxisOutOfRange {
                axis: pos as i64,
                rank: producer_domain.ndims(),
            });
        }
        let id_map: HashMap<ValId, ValId> = root_pairs(self, producer, consumer)?
            .into_iter()
            .map(|(consumer_id, producer_id)| (producer_id, consumer_id))
            .collect();
        replay_onto(
            self,
            consumer,
            id_map,
            &producer_domain.history,
            &producer_domain.axes,
            pos,
        )
    }

    /// Reshapes `producer` so its leading axes mirror the first `pos` axes
    /// of `consumer`. Returns the number of mirrored producer axes.
    pub fn replay_producer_as_consumer(
        &mut self,
        producer: ValId,
        consumer: ValId,
        pos: i64,
    ) -> FusionResult<usize> {
        let pos = normalize_position(pos, self.ndims(consumer)?)?;
        Ok(self.replay_pasc(producer, consumer, pos)?.position)
    }

    /// Reshapes `consumer` so its leading axes mirror the first `pos` axes
    /// of `producer`. Returns the number of mirrored consumer axes.
    pub fn replay_consumer_as_producer(
        &mut self,
        consumer: ValId,
        producer: ValId,
        pos: i64,
    ) -> FusionResult<usize> {
        let pos = normalize_position(pos, self.ndims(producer)?)?;
        Ok(self.replay_casp(consumer, producer, pos)?.position)
    }
}
