//! Budget projection.
use crate::AdvFloat;
use ndarray::{Array4, Zip};

/// Projects a candidate image back into the intersection of the L∞ ball
/// around the original image and the valid pixel range.
#[derive(Clone, Copy, Debug)]
pub struct BudgetProjector {
    epsilon: AdvFloat,
}

impl BudgetProjector {
    pub const fn new(epsilon: AdvFloat) -> Self {
        Self { epsilon }
    }

    pub const fn epsilon(&self) -> AdvFloat {
        self.epsilon
    }

    /// Two elementwise passes: clamp to `[original - eps, original + eps]`,
    /// then to `[0, 1]`. The clamps are independent per pixel, so the
    /// result satisfies both constraints simultaneously.
    pub fn project(
        &self,
        candidate: &Array4<AdvFloat>,
        original: &Array4<AdvFloat>,
    ) -> Array4<AdvFloat> {
        let mut projected = candidate.clone();
        Zip::from(&mut projected)
            .and(original)
            .for_each(|x, &origin| {
                if *x > origin + self.epsilon {
                    *x = origin + self.epsilon;
                } else if *x < origin - self.epsilon {
                    *x = origin - self.epsilon;
                }
            });
        projected.mapv_inplace(|x| x.clamp(0., 1.));
        projected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{image_batch, perturbation_batch};
    use more_asserts::assert_le;
    use ndarray::array;
    use proptest::prelude::*;

    #[test]
    fn test_project_clamps_to_budget_then_range() {
        let original = array![[[0.5, 0.01, 0.99, 0.5]]]
            .insert_axis(ndarray::Axis(0))
            .into_owned();
        let candidate = array![[[0.9, -0.5, 1.5, 0.52]]]
            .insert_axis(ndarray::Axis(0))
            .into_owned();
        let projector = BudgetProjector::new(0.1);
        let projected = projector.project(&candidate, &original);
        // Budget clamp pulls to original +/- 0.1, range clamp to [0, 1].
        assert_eq!(
            projected,
            array![[[0.6, 0., 1., 0.52]]]
                .insert_axis(ndarray::Axis(0))
                .into_owned()
        );
    }

    proptest! {
        #[test]
        fn test_projection_invariant(
            original in image_batch(2, 1, 3, 3),
            delta in perturbation_batch(2, 1, 3, 3, 2.),
            epsilon in 0.001..0.5_f64,
        ) {
            let candidate = &original + &delta;
            let projected = BudgetProjector::new(epsilon).project(&candidate, &original);
            for (p, o) in projected.iter().zip(original.iter()) {
                assert_le!((p - o).abs(), epsilon + 1e-12);
                assert!((0. ..=1.).contains(p));
            }
        }
    }
}
