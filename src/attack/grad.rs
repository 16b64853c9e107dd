//! Input-space gradient computation.
use crate::attack::loss::cross_entropy;
use crate::config::{AttackConfig, Method};
use crate::error::AttackError;
use crate::model::{Model, Network, StageId};
use crate::AdvFloat;
use log::trace;
use ndarray::{Array4, ArrayView1};

/// How the classification loss gradient is carried back to the input.
///
/// `Direct` replays the recorded forward pass exactly. `LinearBackprop`
/// replaces the local gradients of nonlinearities in stages strictly after
/// `boundary` with `lambda * identity`, reshaping the gradient landscape
/// while keeping convolution and normalization gradients exact.
#[derive(Clone, Copy, Debug)]
pub enum GradientSource {
    Direct,
    LinearBackprop { boundary: StageId, lambda: AdvFloat },
}

impl GradientSource {
    /// Resolve the source for a parsed method, failing fast on an
    /// unsupported stage identifier.
    ///
    /// # Errors
    /// `Configuration` if the boundary stage does not resolve.
    pub fn from_method(
        method: &Method,
        net: &Model,
        config: &AttackConfig,
    ) -> Result<Self, AttackError> {
        if method.uses_linear_backprop() {
            Ok(Self::LinearBackprop {
                boundary: net.resolve_stage(&config.linbp_layer)?,
                lambda: config.sgm_lambda,
            })
        } else {
            Ok(Self::Direct)
        }
    }

    /// Gradient of the mean cross-entropy loss with respect to the images.
    ///
    /// # Errors
    /// `Shape` on an image/label/model dimension mismatch.
    pub fn input_gradient(
        &self,
        net: &Model,
        images: &Array4<AdvFloat>,
        labels: ArrayView1<usize>,
    ) -> Result<(AdvFloat, Array4<AdvFloat>), AttackError> {
        net.validate_input(images)?;
        if labels.len() != images.shape()[0] {
            return Err(AttackError::shape(
                "label batch",
                images.shape()[0],
                labels.len(),
            ));
        }
        if let Some(&label) = labels.iter().find(|&&l| l >= net.num_classes()) {
            return Err(AttackError::shape(
                "label range",
                format!("< {}", net.num_classes()),
                label,
            ));
        }

        let (logits, net_trace) = net.forward_traced(images);
        let (loss, grad_logits) = cross_entropy(&logits, labels);
        let grad = match self {
            Self::Direct => net.backward(&net_trace, &grad_logits),
            Self::LinearBackprop { boundary, lambda } => {
                net.backward_linear(&net_trace, &grad_logits, *boundary, *lambda)
            }
        };
        trace!("loss {} from {} samples", loss, labels.len());
        Ok((loss, grad))
    }
}
