//! Input-diversity transform: a random, shape-preserving resize-and-pad
//! applied only to the tensor fed into the forward pass, never to the image
//! that accumulates the update.
use crate::AdvFloat;
use itertools::Itertools;
use ndarray::{s, Array4};
use rand::Rng;

pub const DEFAULT_PAD_BUDGET: usize = 32;

/// With probability 1/2 the batch passes through unchanged; otherwise it is
/// nearest-neighbor resized to a random smaller-or-equal canvas, zero-padded
/// at a random offset, and resized back to the model input size.
#[derive(Clone, Copy, Debug)]
pub struct InputDiversity {
    pad_budget: usize,
}

impl Default for InputDiversity {
    fn default() -> Self {
        Self::new(DEFAULT_PAD_BUDGET)
    }
}

impl InputDiversity {
    /// # Panics
    /// If `pad_budget` is zero
    pub fn new(pad_budget: usize) -> Self {
        debug_assert!(pad_budget > 0);
        Self { pad_budget }
    }

    /// # Panics
    /// If the batch is not spatially square
    pub fn apply<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        images: &Array4<AdvFloat>,
    ) -> Array4<AdvFloat> {
        if rng.gen_range(0..2) == 0 {
            return images.clone();
        }
        let (batch, channels, height, width) = images.dim();
        assert_eq!(height, width);
        let canvas = height + self.pad_budget;
        let resized_to = rng.gen_range(height..canvas);
        let resized = resize_nearest(images, resized_to, resized_to);

        let remainder = canvas - resized_to;
        let top = rng.gen_range(0..=remainder);
        let left = rng.gen_range(0..=remainder);
        let mut padded = Array4::<AdvFloat>::zeros((batch, channels, canvas, canvas));
        padded
            .slice_mut(s![
                ..,
                ..,
                top..top + resized_to,
                left..left + resized_to
            ])
            .assign(&resized);

        resize_nearest(&padded, height, width)
    }
}

fn resize_nearest(input: &Array4<AdvFloat>, out_h: usize, out_w: usize) -> Array4<AdvFloat> {
    let (batch, channels, h_in, w_in) = input.dim();
    let mut output = Array4::<AdvFloat>::zeros((batch, channels, out_h, out_w));
    for (y, x) in (0..out_h).cartesian_product(0..out_w) {
        let y_src = y * h_in / out_h;
        let x_src = x * w_in / out_w;
        for n in 0..batch {
            for c in 0..channels {
                output[[n, c, y, x]] = input[[n, c, y_src, x_src]];
            }
        }
    }
    output
}
