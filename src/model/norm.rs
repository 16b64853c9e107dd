//! Channelwise affine normalization layers.
//!
//! Both layers are linear per channel, so their input gradients are a plain
//! channelwise rescaling of the output gradients.
use crate::model::layer::{Layer, LayerTrace};
use crate::AdvFloat;
use ndarray::{Array1, ArrayD, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Inference-mode batch normalization with recorded running statistics.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BatchNorm2d {
    gamma: Array1<AdvFloat>,
    beta: Array1<AdvFloat>,
    running_mean: Array1<AdvFloat>,
    running_var: Array1<AdvFloat>,
    eps: AdvFloat,
}

impl BatchNorm2d {
    /// # Panics
    /// If the parameter vectors disagree on the channel count
    pub fn new(
        gamma: Array1<AdvFloat>,
        beta: Array1<AdvFloat>,
        running_mean: Array1<AdvFloat>,
        running_var: Array1<AdvFloat>,
        eps: AdvFloat,
    ) -> Self {
        debug_assert_eq!(gamma.len(), beta.len());
        debug_assert_eq!(gamma.len(), running_mean.len());
        debug_assert_eq!(gamma.len(), running_var.len());
        Self {
            gamma,
            beta,
            running_mean,
            running_var,
            eps,
        }
    }

    pub fn identity(channels: usize) -> Self {
        Self::new(
            Array1::ones(channels),
            Array1::zeros(channels),
            Array1::zeros(channels),
            Array1::ones(channels),
            1e-5,
        )
    }

    fn scale(&self, channel: usize) -> AdvFloat {
        self.gamma[channel] / (self.running_var[channel] + self.eps).sqrt()
    }
}

#[typetag::serde]
impl Layer for BatchNorm2d {
    fn forward_traced(&self, input: &ArrayD<AdvFloat>) -> (ArrayD<AdvFloat>, LayerTrace) {
        let mut output = input.clone();
        for c in 0..self.gamma.len() {
            let scale = self.scale(c);
            let mean = self.running_mean[c];
            let shift = self.beta[c];
            output
                .index_axis_mut(Axis(1), c)
                .mapv_inplace(|v| (v - mean) * scale + shift);
        }
        (output, LayerTrace::default())
    }

    fn backward(&self, _trace: &LayerTrace, grad: &ArrayD<AdvFloat>) -> ArrayD<AdvFloat> {
        let mut out = grad.clone();
        for c in 0..self.gamma.len() {
            let scale = self.scale(c);
            out.index_axis_mut(Axis(1), c).mapv_inplace(|g| g * scale);
        }
        out
    }
}

impl fmt::Display for BatchNorm2d {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "BatchNorm {}", self.gamma.len())
    }
}

/// Fixed per-channel input standardization, applied inside the model
/// boundary so attack images stay in pixel space.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Normalize {
    mean: Array1<AdvFloat>,
    std: Array1<AdvFloat>,
}

impl Normalize {
    /// # Panics
    /// If `mean` and `std` disagree on the channel count
    pub fn new(mean: Array1<AdvFloat>, std: Array1<AdvFloat>) -> Self {
        debug_assert_eq!(mean.len(), std.len());
        debug_assert!(std.iter().all(|&s| s > 0.));
        Self { mean, std }
    }

    /// The ImageNet statistics used by the pretrained classifier zoo.
    pub fn imagenet() -> Self {
        Self::new(
            Array1::from_vec(vec![0.485, 0.456, 0.406]),
            Array1::from_vec(vec![0.229, 0.224, 0.225]),
        )
    }
}

#[typetag::serde]
impl Layer for Normalize {
    fn forward_traced(&self, input: &ArrayD<AdvFloat>) -> (ArrayD<AdvFloat>, LayerTrace) {
        let mut output = input.clone();
        for c in 0..self.mean.len() {
            let mean = self.mean[c];
            let std = self.std[c];
            output
                .index_axis_mut(Axis(1), c)
                .mapv_inplace(|v| (v - mean) / std);
        }
        (output, LayerTrace::default())
    }

    fn backward(&self, _trace: &LayerTrace, grad: &ArrayD<AdvFloat>) -> ArrayD<AdvFloat> {
        let mut out = grad.clone();
        for c in 0..self.mean.len() {
            let std = self.std[c];
            out.index_axis_mut(Axis(1), c).mapv_inplace(|g| g / std);
        }
        out
    }
}

impl fmt::Display for Normalize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Normalize {}", self.mean.len())
    }
}
