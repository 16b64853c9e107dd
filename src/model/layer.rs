use crate::AdvFloat;
use dyn_clone::DynClone;
use ndarray::ArrayD;
use std::fmt::{Debug, Display};

/// Tensors recorded by a traced forward pass and consumed by the matching
/// backward pass. Which fields are populated depends on the layer.
#[derive(Clone, Debug, Default)]
pub struct LayerTrace {
    /// Shape of the layer input, for shape-restoring backward passes.
    pub input_dim: Option<Vec<usize>>,
    /// Nonlinearity pass-through pattern.
    pub mask: Option<ArrayD<bool>>,
    /// Pooling selections as flat indices into the layer input.
    pub switches: Option<ArrayD<usize>>,
}

#[typetag::serde(tag = "type")]
pub trait Layer: DynClone + Display + Debug + Send + Sync {
    fn forward(&self, input: &ArrayD<AdvFloat>) -> ArrayD<AdvFloat> {
        self.forward_traced(input).0
    }

    fn forward_traced(&self, input: &ArrayD<AdvFloat>) -> (ArrayD<AdvFloat>, LayerTrace);

    /// Propagate a gradient from this layer's output to its input.
    fn backward(&self, trace: &LayerTrace, grad: &ArrayD<AdvFloat>) -> ArrayD<AdvFloat>;

    /// Backward pass under the linear-substitution policy: nonlinearities
    /// replace their local gradient with an identity map scaled by `lambda`.
    /// Everything else keeps its exact gradient.
    fn backward_linear(
        &self,
        trace: &LayerTrace,
        grad: &ArrayD<AdvFloat>,
        _lambda: AdvFloat,
    ) -> ArrayD<AdvFloat> {
        self.backward(trace, grad)
    }

    fn is_nonlinearity(&self) -> bool {
        // This should be implemented in activation layers to return true
        false
    }
}

// This implements `Clone` for the trait
dyn_clone::clone_trait_object!(Layer);
