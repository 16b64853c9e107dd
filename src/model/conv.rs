#![allow(clippy::module_name_repetitions)]
//! 2-D convolution over `N x C x H x W` batches.
use crate::model::layer::{Layer, LayerTrace};
use crate::AdvFloat;
use itertools::Itertools;
use ndarray::{Array4, ArrayD, ArrayView4, Axis, Ix4};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Weights are of the shape: (`channels_out`, `channels_in`, `kernel_h`,
/// `kernel_w`), matching the `N x C x H x W` data layout. Padding is
/// symmetric and zero-valued.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Conv2d {
    kernel: Array4<AdvFloat>,
    bias: ndarray::Array1<AdvFloat>,
    strides: (usize, usize),
    padding: (usize, usize),
}

impl Conv2d {
    /// # Panics
    /// If improper shapes are passed in
    pub fn new(
        kernel: Array4<AdvFloat>,
        bias: ndarray::Array1<AdvFloat>,
        strides: (usize, usize),
        padding: (usize, usize),
    ) -> Self {
        debug_assert_eq!(kernel.shape()[0], bias.len());
        Self {
            kernel,
            bias,
            strides,
            padding,
        }
    }

    pub fn output_spatial(&self, h_in: usize, w_in: usize) -> (usize, usize) {
        let (_, _, k_h, k_w) = self.kernel.dim();
        let h_out = (h_in + 2 * self.padding.0 - k_h) / self.strides.0 + 1;
        let w_out = (w_in + 2 * self.padding.1 - k_w) / self.strides.1 + 1;
        (h_out, w_out)
    }

    /// # Panics
    /// If the input channel count does not match the kernel
    fn convolve(&self, input: ArrayView4<AdvFloat>) -> Array4<AdvFloat> {
        let (batch, c_in, h_in, w_in) = input.dim();
        let (c_out, kc_in, k_h, k_w) = self.kernel.dim();
        assert_eq!(c_in, kc_in);
        let (p_h, p_w) = self.padding;
        let (h_out, w_out) = self.output_spatial(h_in, w_in);

        let mut output = Array4::<AdvFloat>::zeros((batch, c_out, h_out, w_out));
        for f_out in 0..c_out {
            output
                .index_axis_mut(Axis(1), f_out)
                .fill(self.bias[f_out]);
        }

        for (y_out, x_out) in (0..h_out).cartesian_product(0..w_out) {
            let y_0 = y_out * self.strides.0;
            let x_0 = x_out * self.strides.1;

            for k_y in 0..k_h {
                if y_0 + k_y < p_h || y_0 + k_y >= h_in + p_h {
                    // Assumption that padding value is 0, so continue;
                    continue;
                }
                let y_in = y_0 + k_y - p_h;
                for k_x in 0..k_w {
                    if x_0 + k_x < p_w || x_0 + k_x >= w_in + p_w {
                        // Assumption that padding value is 0, so continue;
                        continue;
                    }
                    let x_in = x_0 + k_x - p_w;

                    for n in 0..batch {
                        for f_out in 0..c_out {
                            for f_in in 0..c_in {
                                output[[n, f_out, y_out, x_out]] += input[[n, f_in, y_in, x_in]]
                                    * self.kernel[[f_out, f_in, k_y, k_x]];
                            }
                        }
                    }
                }
            }
        }
        output
    }

    /// Transposed replay of `convolve`: scatter each output gradient back
    /// through the kernel taps that produced it.
    fn convolve_transpose(
        &self,
        input_dim: (usize, usize, usize, usize),
        grad: ArrayView4<AdvFloat>,
    ) -> Array4<AdvFloat> {
        let (batch, c_in, h_in, w_in) = input_dim;
        let (c_out, _, k_h, k_w) = self.kernel.dim();
        let (p_h, p_w) = self.padding;
        let (h_out, w_out) = self.output_spatial(h_in, w_in);
        debug_assert_eq!(grad.dim(), (batch, c_out, h_out, w_out));

        let mut grad_in = Array4::<AdvFloat>::zeros(input_dim);
        for (y_out, x_out) in (0..h_out).cartesian_product(0..w_out) {
            let y_0 = y_out * self.strides.0;
            let x_0 = x_out * self.strides.1;

            for k_y in 0..k_h {
                if y_0 + k_y < p_h || y_0 + k_y >= h_in + p_h {
                    continue;
                }
                let y_in = y_0 + k_y - p_h;
                for k_x in 0..k_w {
                    if x_0 + k_x < p_w || x_0 + k_x >= w_in + p_w {
                        continue;
                    }
                    let x_in = x_0 + k_x - p_w;

                    for n in 0..batch {
                        for f_out in 0..c_out {
                            for f_in in 0..c_in {
                                grad_in[[n, f_in, y_in, x_in]] += grad[[n, f_out, y_out, x_out]]
                                    * self.kernel[[f_out, f_in, k_y, k_x]];
                            }
                        }
                    }
                }
            }
        }
        grad_in
    }
}

#[typetag::serde]
impl Layer for Conv2d {
    fn forward_traced(&self, input: &ArrayD<AdvFloat>) -> (ArrayD<AdvFloat>, LayerTrace) {
        let input4 = input.view().into_dimensionality::<Ix4>().unwrap();
        let output = self.convolve(input4);
        let trace = LayerTrace {
            input_dim: Some(input.shape().to_vec()),
            ..LayerTrace::default()
        };
        (output.into_dyn(), trace)
    }

    fn backward(&self, trace: &LayerTrace, grad: &ArrayD<AdvFloat>) -> ArrayD<AdvFloat> {
        let dims = trace.input_dim.as_ref().unwrap();
        let input_dim = (dims[0], dims[1], dims[2], dims[3]);
        let grad4 = grad.view().into_dimensionality::<Ix4>().unwrap();
        self.convolve_transpose(input_dim, grad4).into_dyn()
    }
}

impl fmt::Display for Conv2d {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Conv {}x{}, {}",
            self.kernel.shape()[2],
            self.kernel.shape()[3],
            self.kernel.shape()[0]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array4};

    fn patterned(shape: (usize, usize, usize, usize), scale: AdvFloat) -> Array4<AdvFloat> {
        let mut counter = 0_usize;
        Array4::from_shape_fn(shape, |_| {
            counter += 1;
            ((counter * 37 % 101) as AdvFloat / 101. - 0.5) * scale
        })
    }

    #[test]
    fn test_pointwise_identity() {
        let mut kernel = Array4::zeros((2, 2, 1, 1));
        kernel[[0, 0, 0, 0]] = 1.;
        kernel[[1, 1, 0, 0]] = 1.;
        let conv = Conv2d::new(kernel, Array1::zeros(2), (1, 1), (0, 0));
        let input = patterned((1, 2, 4, 4), 1.).into_dyn();
        assert_eq!(conv.forward(&input), input);
    }

    #[test]
    fn test_output_spatial_with_stride_and_padding() {
        let conv = Conv2d::new(Array4::zeros((4, 3, 3, 3)), Array1::zeros(4), (2, 2), (1, 1));
        assert_eq!(conv.output_spatial(8, 8), (4, 4));
        let input = patterned((2, 3, 8, 8), 1.).into_dyn();
        assert_eq!(conv.forward(&input).shape(), &[2, 4, 4, 4]);
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let kernel = patterned((2, 3, 3, 3), 2.);
        let bias = Array1::from_vec(vec![0.1, -0.2]);
        let conv = Conv2d::new(kernel, bias, (2, 2), (1, 1));
        let input = patterned((1, 3, 6, 6), 1.).into_dyn();

        let (output, trace) = conv.forward_traced(&input);
        // Scalar loss: weighted sum of the outputs.
        let weights = patterned((1, 2, 3, 3), 1.).into_dyn();
        let analytic = conv.backward(&trace, &weights);

        let h = 1e-5;
        for &idx in &[[0, 0, 0, 0], [0, 1, 2, 3], [0, 2, 5, 5], [0, 0, 3, 1]] {
            let mut plus = input.clone();
            plus[idx.as_slice()] += h;
            let mut minus = input.clone();
            minus[idx.as_slice()] -= h;
            let loss_plus = (&conv.forward(&plus) * &weights).sum();
            let loss_minus = (&conv.forward(&minus) * &weights).sum();
            let numeric = (loss_plus - loss_minus) / (2. * h);
            assert_abs_diff_eq!(analytic[idx.as_slice()], numeric, epsilon = 1e-7);
        }
        assert_eq!(output.shape(), &[1, 2, 3, 3]);
    }
}
