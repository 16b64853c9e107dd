//! The primary optimization loop.
use crate::attack::diversity::InputDiversity;
use crate::attack::grad::GradientSource;
use crate::attack::project::BudgetProjector;
use crate::attack::update::UpdateRule;
use crate::config::Method;
use crate::error::AttackError;
use crate::model::Model;
use crate::AdvFloat;
use log::debug;
use ndarray::{Array4, ArrayView1};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;

/// Runs `niters` rounds of gradient ascent on the classification loss,
/// projecting back into the budget after every step. There is no early
/// termination; the iteration count is fixed.
#[derive(Clone, Debug)]
pub struct PrimaryAttackLoop {
    method: Method,
    source: GradientSource,
    epsilon: AdvFloat,
    niters: usize,
    targeted: bool,
    diversity: Option<InputDiversity>,
}

impl PrimaryAttackLoop {
    pub fn new(
        method: Method,
        source: GradientSource,
        epsilon: AdvFloat,
        niters: usize,
        targeted: bool,
    ) -> Self {
        let diversity = method.uses_diversity().then(InputDiversity::default);
        Self {
            method,
            source,
            epsilon,
            niters,
            targeted,
            diversity,
        }
    }

    /// # Errors
    /// `Shape` on an image/label/model mismatch, surfaced on the first
    /// iteration.
    pub fn run<R: Rng + ?Sized>(
        &self,
        net: &Model,
        rng: &mut R,
        originals: &Array4<AdvFloat>,
        labels: ArrayView1<usize>,
    ) -> Result<Array4<AdvFloat>, AttackError> {
        let projector = BudgetProjector::new(self.epsilon);
        let mut update = UpdateRule::new(&self.method, self.epsilon, self.targeted);
        let mut working = originals.to_owned();

        for iteration in 0..self.niters {
            // Noise and diversity perturb only the tensor fed forward; the
            // projected image carries across iterations.
            let mut forward_input = if self.method.injects_noise() {
                let noise = Array4::random_using(
                    working.raw_dim(),
                    Uniform::new(-self.epsilon, self.epsilon),
                    rng,
                );
                &working + &noise
            } else {
                working.clone()
            };
            if let Some(diversity) = &self.diversity {
                forward_input = diversity.apply(rng, &forward_input);
            }

            let (loss, gradient) = self.source.input_gradient(net, &forward_input, labels)?;
            debug!(
                "{} iteration {}/{}: loss {}",
                self.method.name(),
                iteration + 1,
                self.niters,
                loss
            );
            let direction = update.direction(gradient);
            working = working + direction * update.step();
            working = projector.project(&working, originals);
        }
        Ok(working)
    }
}
