//! Batch driver: iterates the dataset, runs the loops, emits images.
use crate::attack::{AlignmentRefiner, GradientSource, PrimaryAttackLoop};
use crate::config::AttackConfig;
use crate::config::Method;
use crate::dataset::LabeledDataset;
use crate::emit::ImageEmitter;
use crate::error::AttackError;
use crate::model::{Model, Network};
use log::{debug, info};
use ndarray::Array1;
use ndarray_stats::QuantileExt;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Targeted runs remap each label once through a fixed permutation of the
/// 1000-class space before the loop begins.
pub const TARGET_OFFSET: usize = 500;
pub const TARGET_CLASSES: usize = 1000;

pub fn remap_targets(labels: &Array1<usize>) -> Array1<usize> {
    labels.mapv(|label| (label + TARGET_OFFSET) % TARGET_CLASSES)
}

pub struct BatchRunner<'a> {
    config: &'a AttackConfig,
    net: &'a Model,
    method: Method,
}

impl<'a> BatchRunner<'a> {
    /// # Errors
    /// `Configuration` if the strategy name does not parse.
    pub fn new(config: &'a AttackConfig, net: &'a Model) -> Result<Self, AttackError> {
        let method = Method::parse(&config.method)?;
        Ok(Self {
            config,
            net,
            method,
        })
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Processes every batch in dataset order and returns the number of
    /// images written. Any error aborts the run; a failed batch would break
    /// the run's determinism guarantee.
    ///
    /// # Errors
    /// Propagates configuration, shape, and resource errors from the loops
    /// and boundaries.
    pub fn run(
        &self,
        dataset: &LabeledDataset,
        emitter: &ImageEmitter,
    ) -> Result<usize, AttackError> {
        // Stage identifiers resolve before the first batch so bad
        // configuration cannot waste a partial run.
        let source = GradientSource::from_method(&self.method, self.net, self.config)?;
        let refiner = if self.method.uses_alignment_refinement() {
            Some(AlignmentRefiner::new(
                self.net.resolve_stage(&self.config.ila_layer)?,
                self.config.epsilon,
                self.method.step_size(self.config.epsilon),
                self.config.ila_niters,
            ))
        } else {
            None
        };

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut written = 0;
        for (index, batch) in dataset.batches(self.config.batch_size).enumerate() {
            let batch = batch?;
            self.net.validate_input(&batch.images)?;
            let labels = if self.config.targeted {
                remap_targets(&batch.labels)
            } else {
                batch.labels.clone()
            };

            let primary = PrimaryAttackLoop::new(
                self.method.clone(),
                source,
                self.config.epsilon,
                self.config.niters,
                self.config.targeted,
            );
            let attacked = primary.run(self.net, &mut rng, &batch.images, labels.view())?;
            let finals = match &refiner {
                Some(refiner) => refiner.refine(self.net, &batch.images, &attacked)?,
                None => attacked,
            };

            let deviation = (&finals - &batch.images).mapv(f64::abs);
            debug!(
                "batch {}: max deviation {}",
                index,
                deviation.max().map_or(0., |v| *v)
            );

            emitter.emit(&finals, &batch.filenames)?;
            written += batch.filenames.len();
            info!(
                "batch {}: {} images perturbed with {}",
                index,
                batch.filenames.len(),
                self.method.name()
            );
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remap_targets_is_fixed_offset_permutation() {
        let labels = Array1::from_vec(vec![3_usize, 700, 0, 999]);
        let remapped = remap_targets(&labels);
        assert_eq!(remapped, Array1::from_vec(vec![503_usize, 200, 500, 499]));
    }

    #[test]
    fn test_remap_is_involutive() {
        let labels = Array1::from_iter(0..1000_usize);
        assert_eq!(remap_targets(&remap_targets(&labels)), labels);
    }
}
