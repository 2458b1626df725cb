use crate::error::{FusionError, FusionResult};
use crate::fusion::Fusion;
use crate::ir::{ComputeAt, ValId};
use crate::traversal::DependencyCheck;

use super::replay::normalize_position;
use super::ReplayOutcome;

impl Fusion {
    /// Computes `producer` inside the loop nest of `consumer`, sharing its
    /// first `position` axes (negative positions count from the end, `-1`
    /// sharing every axis).
    ///
    /// Every tensor on a path from `producer` to `consumer` is replayed as
    /// its consumer on that path and records where it is computed. A
    /// tensor reached again later keeps the most recent placement.
    pub fn compute_at(&mut self, producer: ValId, consumer: ValId, position: i64) -> FusionResult<()> {
        self.tensor(producer)?;
        let ndims = self.ndims(consumer)?;
        let position = normalize_position(position, ndims)?;
        if producer == consumer {
            return Err(FusionError::invalid_compute_at(
                producer,
                consumer,
                "a tensor cannot be computed at itself",
            ));
        }

        let chains = DependencyCheck::all_dependency_chains(self, producer, consumer)?;
        if chains.is_empty() {
            return Err(FusionError::invalid_compute_at(
                producer,
                consumer,
                "producer is not a dependency of consumer",
            ));
        }

        for chain in chains {
            let mut pos = position;
            for edge in chain.windows(2).rev() {
                let (p, c) = (edge[0], edge[1]);
                if !self.is_tensor(p) || !self.is_tensor(c) {
                    break;
                }
                let outcome = self.replay_pasc(p, c, pos)?;
                let producer_position = outcome.position;
                self.record_compute_at(p, c, pos, outcome)?;
                pos = producer_position;
            }
        }
        Ok(())
    }

    fn record_compute_at(
        &mut self,
        producer: ValId,
        consumer: ValId,
        consumer_position: usize,
        outcome: ReplayOutcome,
    ) -> FusionResult<()> {
        let name = self.name(producer)?;
        let tv = self.tensor_mut(producer)?;
        if let Some(previous) = &tv.compute_at {
            if outcome.position < previous.position {
                log::warn!(
                    "computeAt moves T{name} from position {} to the shallower position {}",
                    previous.position,
                    outcome.position
                );
            }
        }
        tv.compute_at = Some(ComputeAt {
            view: consumer,
            consumer_position,
            position: outcome.position,
            axis_map: outcome.axis_map,
        });
        Ok(())
    }

    /// Where `tv` is computed, if anywhere.
    pub fn compute_at_of(&self, tv: ValId) -> FusionResult<Option<&ComputeAt>> {
        Ok(self.tensor(tv)?.compute_at.as_ref())
    }
}

