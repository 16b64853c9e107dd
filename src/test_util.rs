#![cfg(test)]
//! Shared strategies and fixture networks for unit tests.
//!
//! The fixture nets use strictly positive convolution weights and biases so
//! every pre-activation on `[0, 1]` inputs stays positive. That keeps the
//! nets locally linear around test inputs, which makes finite-difference
//! gradient checks exact to rounding error.
use crate::model::{
    BatchNorm2d, Conv2d, Dense, Flatten, GlobalAvgPool, Layer, MaxPool2d, Model, Normalize,
    PlainNet, ReLU, ResidualBlock, ResidualNet,
};
use crate::tensorshape::TensorShape;
use crate::AdvFloat;
use ndarray::{Array1, Array2, Array4};
use proptest::arbitrary::functor::ArbitraryF1;
use proptest::prelude::*;
use proptest::sample::SizeRange;

prop_compose! {
    pub fn image_batch(n: usize, c: usize, h: usize, w: usize)
        (v in Vec::lift1_with(0. .. 1., SizeRange::new((n * c * h * w)..=(n * c * h * w))))
        -> Array4<AdvFloat> {
        Array4::from_shape_vec((n, c, h, w), v).unwrap()
    }
}

prop_compose! {
    pub fn perturbation_batch(n: usize, c: usize, h: usize, w: usize, scale: AdvFloat)
        (v in Vec::lift1_with(-scale .. scale, SizeRange::new((n * c * h * w)..=(n * c * h * w))))
        -> Array4<AdvFloat> {
        Array4::from_shape_vec((n, c, h, w), v).unwrap()
    }
}

/// Deterministic image-like batch with entries in `[0.1, 0.9]`.
pub fn patterned_image_batch(shape: (usize, usize, usize, usize)) -> Array4<AdvFloat> {
    let mut counter = 0_usize;
    Array4::from_shape_fn(shape, |_| {
        counter += 1;
        (counter * 37 % 101) as AdvFloat / 101. * 0.8 + 0.1
    })
}

fn positive_kernel(shape: (usize, usize, usize, usize), salt: usize) -> Array4<AdvFloat> {
    let mut counter = salt;
    Array4::from_shape_fn(shape, |_| {
        counter += 1;
        (counter * 41 % 89) as AdvFloat / 89. * 0.5 + 0.05
    })
}

fn mixed_weight(shape: (usize, usize), salt: usize) -> Array2<AdvFloat> {
    let mut counter = salt;
    Array2::from_shape_fn(shape, |_| {
        counter += 1;
        (counter * 53 % 97) as AdvFloat / 97. - 0.5
    })
}

fn conv(c_out: usize, c_in: usize, k: usize, stride: usize, padding: usize, salt: usize) -> Conv2d {
    Conv2d::new(
        positive_kernel((c_out, c_in, k, k), salt),
        Array1::from_elem(c_out, 0.05),
        (stride, stride),
        (padding, padding),
    )
}

fn scale_only_normalize() -> Normalize {
    Normalize::new(Array1::zeros(3), Array1::from_elem(3, 0.5))
}

/// Sequential fixture: 8x8 RGB in, 3 classes out. Layer index 2 is the
/// first ReLU, a convenient truncation stage.
pub fn tiny_plain_net() -> PlainNet {
    let layers: Vec<Box<dyn Layer>> = vec![
        Box::new(scale_only_normalize()),
        Box::new(conv(4, 3, 3, 1, 1, 1)),
        Box::new(ReLU::new()),
        Box::new(MaxPool2d::new(2, 2)),
        Box::new(conv(4, 4, 3, 1, 1, 2)),
        Box::new(ReLU::new()),
        Box::new(GlobalAvgPool::new()),
        Box::new(Flatten::new()),
        Box::new(Dense::new(mixed_weight((3, 4), 3), Array1::zeros(3))),
    ];
    PlainNet::new(
        TensorShape::new(vec![None, Some(3), Some(8), Some(8)]),
        3,
        layers,
    )
}

pub fn tiny_plain_model() -> Model {
    Model::Plain(tiny_plain_net())
}

fn basic_block(channels: usize, salt: usize) -> ResidualBlock {
    ResidualBlock::new(
        vec![
            Box::new(conv(channels, channels, 3, 1, 1, salt)),
            Box::new(BatchNorm2d::identity(channels)),
            Box::new(ReLU::new()),
            Box::new(conv(channels, channels, 3, 1, 1, salt + 1)),
            Box::new(BatchNorm2d::identity(channels)),
        ],
        None,
    )
}

fn downsample_block(c_out: usize, c_in: usize, salt: usize) -> ResidualBlock {
    ResidualBlock::new(
        vec![
            Box::new(conv(c_out, c_in, 3, 2, 1, salt)),
            Box::new(BatchNorm2d::identity(c_out)),
            Box::new(ReLU::new()),
            Box::new(conv(c_out, c_out, 3, 1, 1, salt + 1)),
            Box::new(BatchNorm2d::identity(c_out)),
        ],
        Some(vec![
            Box::new(conv(c_out, c_in, 1, 2, 0, salt + 2)),
            Box::new(BatchNorm2d::identity(c_out)),
        ]),
    )
}

/// Residual fixture: 8x8 RGB in, two stages of two blocks, 3 classes out.
pub fn tiny_residual_net() -> ResidualNet {
    let stem: Vec<Box<dyn Layer>> = vec![
        Box::new(scale_only_normalize()),
        Box::new(conv(4, 3, 3, 1, 1, 10)),
        Box::new(BatchNorm2d::identity(4)),
        Box::new(ReLU::new()),
    ];
    let stages = vec![
        vec![basic_block(4, 20), basic_block(4, 30)],
        vec![downsample_block(6, 4, 40), basic_block(6, 50)],
    ];
    let head: Vec<Box<dyn Layer>> = vec![
        Box::new(GlobalAvgPool::new()),
        Box::new(Flatten::new()),
        Box::new(Dense::new(mixed_weight((3, 6), 60), Array1::zeros(3))),
    ];
    ResidualNet::new(
        TensorShape::new(vec![None, Some(3), Some(8), Some(8)]),
        3,
        stem,
        stages,
        head,
    )
}

pub fn tiny_residual_model() -> Model {
    Model::Residual(tiny_residual_net())
}
