use crate::model::layer::{Layer, LayerTrace};
use crate::AdvFloat;
use ndarray::{ArrayD, Zip};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result};

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ReLU;

impl ReLU {
    pub const fn new() -> Self {
        Self
    }
}

impl Display for ReLU {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "ReLU")
    }
}

#[typetag::serde]
impl Layer for ReLU {
    fn forward(&self, input: &ArrayD<AdvFloat>) -> ArrayD<AdvFloat> {
        input.mapv(|x| if x.lt(&0.) { 0. } else { x })
    }

    fn forward_traced(&self, input: &ArrayD<AdvFloat>) -> (ArrayD<AdvFloat>, LayerTrace) {
        let output = self.forward(input);
        let trace = LayerTrace {
            mask: Some(input.mapv(|x| x >= 0.)),
            ..LayerTrace::default()
        };
        (output, trace)
    }

    fn backward(&self, trace: &LayerTrace, grad: &ArrayD<AdvFloat>) -> ArrayD<AdvFloat> {
        let mask = trace.mask.as_ref().unwrap();
        let mut out = grad.clone();
        Zip::from(&mut out)
            .and(mask)
            .for_each(|g, &m| *g = if m { *g } else { 0. });
        out
    }

    fn backward_linear(
        &self,
        _trace: &LayerTrace,
        grad: &ArrayD<AdvFloat>,
        lambda: AdvFloat,
    ) -> ArrayD<AdvFloat> {
        grad * lambda
    }

    fn is_nonlinearity(&self) -> bool {
        true
    }
}
