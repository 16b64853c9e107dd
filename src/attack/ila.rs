//! Intermediate-level alignment refinement.
//!
//! Takes the primary attack's output as a fixed target and re-optimizes from
//! the original image, pushing the displacement of an intermediate activation
//! toward the displacement the attack produced. Decoupling the objective
//! from the final classification layer transfers better across models.
use crate::attack::loss::alignment_projection;
use crate::attack::project::BudgetProjector;
use crate::attack::update::sign;
use crate::error::AttackError;
use crate::model::{Model, Network, StageId};
use crate::AdvFloat;
use log::debug;
use ndarray::Array4;

/// A second fixed-length optimization loop over the same budget. No
/// momentum, no noise injection, and no targeted negation apply here.
#[derive(Clone, Copy, Debug)]
pub struct AlignmentRefiner {
    stage: StageId,
    epsilon: AdvFloat,
    step: AdvFloat,
    niters: usize,
}

impl AlignmentRefiner {
    pub const fn new(stage: StageId, epsilon: AdvFloat, step: AdvFloat, niters: usize) -> Self {
        Self {
            stage,
            epsilon,
            step,
            niters,
        }
    }

    /// # Errors
    /// `Shape` if the batches do not match the model input.
    pub fn refine(
        &self,
        net: &Model,
        originals: &Array4<AdvFloat>,
        attack_output: &Array4<AdvFloat>,
    ) -> Result<Array4<AdvFloat>, AttackError> {
        net.validate_input(originals)?;
        net.validate_input(attack_output)?;

        // Two immutable snapshots, captured before the loop starts.
        let (original_mid, _) = net.forward_to_stage(originals, self.stage);
        let (attack_mid, _) = net.forward_to_stage(attack_output, self.stage);

        let projector = BudgetProjector::new(self.epsilon);
        let mut working = originals.to_owned();
        for iteration in 0..self.niters {
            let (current_mid, trace) = net.forward_to_stage(&working, self.stage);
            let (loss, grad_mid) = alignment_projection(&attack_mid, &current_mid, &original_mid);
            debug!(
                "alignment iteration {}/{}: loss {}",
                iteration + 1,
                self.niters,
                loss
            );
            let gradient = net.backward_from_stage(&trace, &grad_mid);
            working = working + gradient.mapv(sign) * self.step;
            working = projector.project(&working, originals);
        }
        Ok(working)
    }
}
