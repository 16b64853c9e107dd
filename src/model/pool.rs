//! Spatial pooling over `N x C x H x W` batches.
use crate::model::layer::{Layer, LayerTrace};
use crate::AdvFloat;
use itertools::Itertools;
use ndarray::{Array4, ArrayD, Ix4};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Max pooling with square windows and no padding. The traced forward
/// records, per output element, the flat index of the winning input element
/// so the backward pass can scatter gradients to exactly those positions.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct MaxPool2d {
    size: usize,
    stride: usize,
}

impl MaxPool2d {
    /// # Panics
    /// If `size` or `stride` is zero
    pub fn new(size: usize, stride: usize) -> Self {
        debug_assert!(size > 0 && stride > 0);
        Self { size, stride }
    }

    pub fn output_spatial(&self, h_in: usize, w_in: usize) -> (usize, usize) {
        ((h_in - self.size) / self.stride + 1, (w_in - self.size) / self.stride + 1)
    }
}

#[typetag::serde]
impl Layer for MaxPool2d {
    fn forward_traced(&self, input: &ArrayD<AdvFloat>) -> (ArrayD<AdvFloat>, LayerTrace) {
        let input4 = input.view().into_dimensionality::<Ix4>().unwrap();
        let (batch, channels, h_in, w_in) = input4.dim();
        let (h_out, w_out) = self.output_spatial(h_in, w_in);

        let mut output = Array4::<AdvFloat>::zeros((batch, channels, h_out, w_out));
        let mut switches =
            ArrayD::<usize>::zeros(ndarray::IxDyn(&[batch, channels, h_out, w_out]));
        for (y_out, x_out) in (0..h_out).cartesian_product(0..w_out) {
            let y_0 = y_out * self.stride;
            let x_0 = x_out * self.stride;
            for n in 0..batch {
                for c in 0..channels {
                    let mut best = AdvFloat::NEG_INFINITY;
                    let mut best_idx = 0;
                    for (d_y, d_x) in (0..self.size).cartesian_product(0..self.size) {
                        let v = input4[[n, c, y_0 + d_y, x_0 + d_x]];
                        if v > best {
                            best = v;
                            best_idx = ((n * channels + c) * h_in + y_0 + d_y) * w_in + x_0 + d_x;
                        }
                    }
                    output[[n, c, y_out, x_out]] = best;
                    switches[[n, c, y_out, x_out]] = best_idx;
                }
            }
        }

        let trace = LayerTrace {
            input_dim: Some(input.shape().to_vec()),
            switches: Some(switches),
            ..LayerTrace::default()
        };
        (output.into_dyn(), trace)
    }

    fn backward(&self, trace: &LayerTrace, grad: &ArrayD<AdvFloat>) -> ArrayD<AdvFloat> {
        let dims = trace.input_dim.as_ref().unwrap();
        let switches = trace.switches.as_ref().unwrap();
        let mut grad_in = ArrayD::<AdvFloat>::zeros(ndarray::IxDyn(dims));
        {
            let flat = grad_in.as_slice_mut().unwrap();
            for (&idx, &g) in switches.iter().zip(grad.iter()) {
                flat[idx] += g;
            }
        }
        grad_in
    }
}

impl fmt::Display for MaxPool2d {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MaxPool {}/{}", self.size, self.stride)
    }
}

/// Global average pooling to a `N x C x 1 x 1` tensor.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct GlobalAvgPool;

impl GlobalAvgPool {
    pub const fn new() -> Self {
        Self
    }
}

#[typetag::serde]
impl Layer for GlobalAvgPool {
    fn forward_traced(&self, input: &ArrayD<AdvFloat>) -> (ArrayD<AdvFloat>, LayerTrace) {
        let input4 = input.view().into_dimensionality::<Ix4>().unwrap();
        let (batch, channels, h_in, w_in) = input4.dim();
        let area = (h_in * w_in) as AdvFloat;
        let mut output = Array4::<AdvFloat>::zeros((batch, channels, 1, 1));
        for n in 0..batch {
            for c in 0..channels {
                output[[n, c, 0, 0]] = input4.slice(ndarray::s![n, c, .., ..]).sum() / area;
            }
        }
        let trace = LayerTrace {
            input_dim: Some(input.shape().to_vec()),
            ..LayerTrace::default()
        };
        (output.into_dyn(), trace)
    }

    fn backward(&self, trace: &LayerTrace, grad: &ArrayD<AdvFloat>) -> ArrayD<AdvFloat> {
        let dims = trace.input_dim.as_ref().unwrap();
        let (batch, channels, h_in, w_in) = (dims[0], dims[1], dims[2], dims[3]);
        let area = (h_in * w_in) as AdvFloat;
        let grad4 = grad.view().into_dimensionality::<Ix4>().unwrap();
        let mut grad_in = Array4::<AdvFloat>::zeros((batch, channels, h_in, w_in));
        for n in 0..batch {
            for c in 0..channels {
                grad_in
                    .slice_mut(ndarray::s![n, c, .., ..])
                    .fill(grad4[[n, c, 0, 0]] / area);
            }
        }
        grad_in.into_dyn()
    }
}

impl fmt::Display for GlobalAvgPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "GlobalAvgPool")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_maxpool_forward_and_switches() {
        let input = array![[
            [1., 2., 5., 4.],
            [3., 0., 1., 2.],
            [6., 7., 0., 1.],
            [8., 2., 3., 9.],
        ]]
        .insert_axis(ndarray::Axis(0))
        .into_dyn();
        let pool = MaxPool2d::new(2, 2);
        let (output, trace) = pool.forward_traced(&input);
        assert_eq!(
            output,
            array![[[3., 5.], [8., 9.]]]
                .insert_axis(ndarray::Axis(0))
                .into_dyn()
        );

        let grad = array![[[1., 10.], [100., 1000.]]]
            .insert_axis(ndarray::Axis(0))
            .into_dyn();
        let back = pool.backward(&trace, &grad);
        let expected = array![[
            [0., 0., 10., 0.],
            [1., 0., 0., 0.],
            [0., 0., 0., 0.],
            [100., 0., 0., 1000.],
        ]]
        .insert_axis(ndarray::Axis(0))
        .into_dyn();
        assert_eq!(back, expected);
    }

    #[test]
    fn test_global_avg_pool() {
        let input = array![[[1., 2.], [3., 6.]]]
            .insert_axis(ndarray::Axis(0))
            .into_dyn();
        let pool = GlobalAvgPool::new();
        let (output, trace) = pool.forward_traced(&input);
        assert_abs_diff_eq!(output[[0, 0, 0, 0]], 3.);

        let grad = array![[[8.]]]
            .insert_axis(ndarray::Axis(0))
            .into_dyn();
        let back = pool.backward(&trace, &grad);
        assert_abs_diff_eq!(back[[0, 0, 1, 1]], 2.);
    }
}
