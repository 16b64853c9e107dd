use crate::model::layer::{Layer, LayerTrace};
use crate::AdvFloat;
use ndarray::{Array, Array1, Array2, ArrayD, Ix2};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fully-connected layer on flattened activations. Weights are of the shape
/// (`features_out`, `features_in`).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Dense {
    weight: Array2<AdvFloat>,
    bias: Array1<AdvFloat>,
}

impl Dense {
    /// # Panics
    /// If `weight` and `bias` disagree on the output dimension
    pub fn new(weight: Array2<AdvFloat>, bias: Array1<AdvFloat>) -> Self {
        debug_assert_eq!(weight.nrows(), bias.len());
        Self { weight, bias }
    }

    pub fn input_dim(&self) -> usize {
        self.weight.ncols()
    }

    pub fn output_dim(&self) -> usize {
        self.weight.nrows()
    }
}

#[typetag::serde]
impl Layer for Dense {
    fn forward_traced(&self, input: &ArrayD<AdvFloat>) -> (ArrayD<AdvFloat>, LayerTrace) {
        let input2 = input.view().into_dimensionality::<Ix2>().unwrap();
        debug_assert_eq!(input2.ncols(), self.input_dim());
        let output = input2.dot(&self.weight.t()) + &self.bias;
        (output.into_dyn(), LayerTrace::default())
    }

    fn backward(&self, _trace: &LayerTrace, grad: &ArrayD<AdvFloat>) -> ArrayD<AdvFloat> {
        let grad2 = grad.view().into_dimensionality::<Ix2>().unwrap();
        grad2.dot(&self.weight).into_dyn()
    }
}

impl fmt::Display for Dense {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Dense {}", self.output_dim())
    }
}

/// Collapse all non-batch axes into one.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Flatten;

impl Flatten {
    pub const fn new() -> Self {
        Self
    }
}

#[typetag::serde]
impl Layer for Flatten {
    fn forward_traced(&self, input: &ArrayD<AdvFloat>) -> (ArrayD<AdvFloat>, LayerTrace) {
        let batch = input.shape()[0];
        let features = input.len() / batch;
        let output =
            Array::from_shape_vec((batch, features), input.iter().copied().collect()).unwrap();
        let trace = LayerTrace {
            input_dim: Some(input.shape().to_vec()),
            ..LayerTrace::default()
        };
        (output.into_dyn(), trace)
    }

    fn backward(&self, trace: &LayerTrace, grad: &ArrayD<AdvFloat>) -> ArrayD<AdvFloat> {
        let dims = trace.input_dim.as_ref().unwrap();
        Array::from_shape_vec(ndarray::IxDyn(dims), grad.iter().copied().collect()).unwrap()
    }
}

impl fmt::Display for Flatten {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Flatten")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_dense_forward_backward() {
        let dense = Dense::new(array![[1., 2.], [3., 4.], [5., 6.]], array![0.5, 0., -0.5]);
        let input = array![[1., 1.], [2., 0.]].into_dyn();
        let (output, trace) = dense.forward_traced(&input);
        assert_eq!(
            output,
            array![[3.5, 7., 10.5], [2.5, 6., 9.5]].into_dyn()
        );

        let grad = array![[1., 0., 0.], [0., 0., 1.]].into_dyn();
        let back = dense.backward(&trace, &grad);
        assert_eq!(back, array![[1., 2.], [5., 6.]].into_dyn());
    }

    #[test]
    fn test_flatten_round_trip() {
        let input = array![[[1., 2.], [3., 4.]], [[5., 6.], [7., 8.]]]
            .insert_axis(ndarray::Axis(1))
            .into_dyn();
        let (output, trace) = Flatten.forward_traced(&input);
        assert_eq!(output.shape(), &[2, 4]);
        assert_eq!(output[[0, 3]], 4.);

        let back = Flatten.backward(&trace, &output);
        assert_eq!(back, input);
    }
}
