//! Plain sequential architecture family (VGG-style stacks). Stages are
//! addressed by their flat layer index.
use crate::error::AttackError;
use crate::model::{
    forward_chain, BackwardMode, Layer, LayerTrace, NetTrace, Network, StageId,
};
use crate::tensorshape::TensorShape;
use crate::AdvFloat;
use ndarray::{Array2, Array4, ArrayD, Ix2, Ix4};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlainNet {
    input_shape: TensorShape,
    num_classes: usize,
    layers: Vec<Box<dyn Layer>>,
}

#[derive(Debug)]
pub struct PlainTrace {
    /// Traces for the traversed prefix of layers.
    layers: Vec<LayerTrace>,
}

impl PlainNet {
    pub fn new(
        input_shape: TensorShape,
        num_classes: usize,
        layers: Vec<Box<dyn Layer>>,
    ) -> Self {
        Self {
            input_shape,
            num_classes,
            layers,
        }
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    fn expect_trace<'a>(&self, trace: &'a NetTrace) -> &'a PlainTrace {
        match trace {
            NetTrace::Plain(t) => t,
            NetTrace::Residual(_) => panic!("trace does not belong to a sequential architecture"),
        }
    }

    fn traced_prefix(&self, images: &Array4<AdvFloat>, upto: usize) -> (ArrayD<AdvFloat>, PlainTrace) {
        let mut x = images.clone().into_dyn();
        let mut traces = Vec::with_capacity(upto + 1);
        for layer in &self.layers[..=upto] {
            let (out, trace) = layer.forward_traced(&x);
            x = out;
            traces.push(trace);
        }
        (x, PlainTrace { layers: traces })
    }

    /// Reverse walk over the recorded prefix. Layers strictly after
    /// `boundary` replay nonlinearities as `lambda * identity`.
    fn backprop(
        &self,
        trace: &PlainTrace,
        grad: ArrayD<AdvFloat>,
        boundary: Option<usize>,
        lambda: AdvFloat,
    ) -> Array4<AdvFloat> {
        let mut g = grad;
        for i in (0..trace.layers.len()).rev() {
            let mode = match boundary {
                Some(b) if i > b => BackwardMode::Linear { lambda },
                _ => BackwardMode::Exact,
            };
            g = match mode {
                BackwardMode::Linear { lambda } if self.layers[i].is_nonlinearity() => {
                    self.layers[i].backward_linear(&trace.layers[i], &g, lambda)
                }
                _ => self.layers[i].backward(&trace.layers[i], &g),
            };
        }
        g.into_dimensionality::<Ix4>().unwrap()
    }
}

impl Network for PlainNet {
    fn input_shape(&self) -> TensorShape {
        self.input_shape.clone()
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn resolve_stage(&self, ident: &str) -> Result<StageId, AttackError> {
        let index: usize = ident.parse().map_err(|_| {
            AttackError::configuration(format!(
                "stage identifier '{}' is not a layer index",
                ident
            ))
        })?;
        if index >= self.layers.len() {
            return Err(AttackError::configuration(format!(
                "stage identifier '{}' addresses layer {} of {}",
                ident,
                index,
                self.layers.len()
            )));
        }
        Ok(StageId::Index(index))
    }

    fn validate_input(&self, images: &Array4<AdvFloat>) -> Result<(), AttackError> {
        let shape = images.shape();
        if self.input_shape.matches(shape) {
            Ok(())
        } else {
            Err(AttackError::shape(
                "model input",
                &self.input_shape,
                format!("{:?}", shape),
            ))
        }
    }

    fn forward(&self, images: &Array4<AdvFloat>) -> Array2<AdvFloat> {
        forward_chain(&self.layers, &images.clone().into_dyn())
            .into_dimensionality::<Ix2>()
            .unwrap()
    }

    fn forward_traced(&self, images: &Array4<AdvFloat>) -> (Array2<AdvFloat>, NetTrace) {
        let (logits, trace) = self.traced_prefix(images, self.layers.len() - 1);
        (
            logits.into_dimensionality::<Ix2>().unwrap(),
            NetTrace::Plain(trace),
        )
    }

    fn backward(&self, trace: &NetTrace, grad_logits: &Array2<AdvFloat>) -> Array4<AdvFloat> {
        let trace = self.expect_trace(trace);
        self.backprop(trace, grad_logits.clone().into_dyn(), None, 0.)
    }

    fn backward_linear(
        &self,
        trace: &NetTrace,
        grad_logits: &Array2<AdvFloat>,
        boundary: StageId,
        lambda: AdvFloat,
    ) -> Array4<AdvFloat> {
        let trace = self.expect_trace(trace);
        let StageId::Index(index) = boundary else {
            panic!("stage identifier does not address a sequential architecture")
        };
        self.backprop(trace, grad_logits.clone().into_dyn(), Some(index), lambda)
    }

    fn forward_to_stage(
        &self,
        images: &Array4<AdvFloat>,
        stage: StageId,
    ) -> (ArrayD<AdvFloat>, NetTrace) {
        let StageId::Index(index) = stage else {
            panic!("stage identifier does not address a sequential architecture")
        };
        let (activation, trace) = self.traced_prefix(images, index);
        (activation, NetTrace::Plain(trace))
    }

    fn backward_from_stage(&self, trace: &NetTrace, grad: &ArrayD<AdvFloat>) -> Array4<AdvFloat> {
        let trace = self.expect_trace(trace);
        self.backprop(trace, grad.clone(), None, 0.)
    }
}

impl fmt::Display for PlainNet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "PlainNet {} => {} layers => {}",
            self.input_shape,
            self.layers.len(),
            self.num_classes
        )
    }
}
