//! Per-iteration update direction.
use crate::config::Method;
use crate::AdvFloat;
use ndarray::{Array4, Axis};

/// Numerical floor for the per-sample L1 normalization. The momentum update
/// divides by the gradient's L1 norm, which can vanish on saturated inputs.
pub const L1_FLOOR: AdvFloat = 1e-12;

/// Sign with `sign(0) = 0`, unlike IEEE `signum` on signed zeros.
pub fn sign(x: AdvFloat) -> AdvFloat {
    if x > 0. {
        1.
    } else if x < 0. {
        -1.
    } else {
        0.
    }
}

/// Turns raw gradients into signed step directions, accumulating momentum
/// for the strategies that use it. One instance is owned by exactly one loop
/// invocation; the momentum state never crosses batches or loops.
#[derive(Clone, Debug)]
pub struct UpdateRule {
    step: AdvFloat,
    targeted: bool,
    use_momentum: bool,
    momentum: Option<Array4<AdvFloat>>,
}

impl UpdateRule {
    pub fn new(method: &Method, epsilon: AdvFloat, targeted: bool) -> Self {
        Self {
            step: method.step_size(epsilon),
            targeted,
            use_momentum: method.uses_momentum(),
            momentum: None,
        }
    }

    pub const fn step(&self) -> AdvFloat {
        self.step
    }

    pub fn momentum(&self) -> Option<&Array4<AdvFloat>> {
        self.momentum.as_ref()
    }

    /// The signed update direction for one iteration. Momentum accumulates
    /// the L1-normalized raw gradient; targeted runs negate after
    /// accumulation so the state is polarity-independent.
    pub fn direction(&mut self, gradient: Array4<AdvFloat>) -> Array4<AdvFloat> {
        let oriented = if self.use_momentum {
            let normalized = &gradient / &per_sample_l1(&gradient);
            let momentum = self
                .momentum
                .get_or_insert_with(|| Array4::zeros(gradient.raw_dim()));
            *momentum += &normalized;
            momentum.clone()
        } else {
            gradient
        };
        if self.targeted {
            oriented.mapv(|g| -sign(g))
        } else {
            oriented.mapv(sign)
        }
    }
}

/// Per-sample L1 norm over channel and spatial axes, floored and shaped for
/// broadcasting against the gradient.
fn per_sample_l1(gradient: &Array4<AdvFloat>) -> Array4<AdvFloat> {
    let norms = gradient
        .mapv(AdvFloat::abs)
        .sum_axis(Axis(3))
        .sum_axis(Axis(2))
        .sum_axis(Axis(1))
        .mapv(|n| n.max(L1_FLOOR));
    let batch = norms.len();
    norms.into_shape((batch, 1, 1, 1)).unwrap()
}
