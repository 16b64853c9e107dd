//! Residual architecture family: a stem, stages of residual blocks, and a
//! pooled classification head. Stages are addressed as `"s_b"` where `s` is
//! the one-based stage index and `b` the zero-based block index.
use crate::model::{
    backward_chain, forward_chain, forward_chain_traced, BackwardMode, Layer, LayerTrace,
    NetTrace, Network, StageId,
};
use crate::error::AttackError;
use crate::tensorshape::TensorShape;
use crate::AdvFloat;
use ndarray::{Array2, Array4, ArrayD, Ix2, Ix4};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One residual unit: `out = relu(body(x) + skip(x))`, where `skip` is the
/// identity or a projection (`downsample`) path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResidualBlock {
    body: Vec<Box<dyn Layer>>,
    downsample: Option<Vec<Box<dyn Layer>>>,
}

#[derive(Debug)]
pub struct BlockTrace {
    body: Vec<LayerTrace>,
    downsample: Option<Vec<LayerTrace>>,
    join_mask: ArrayD<bool>,
}

impl ResidualBlock {
    pub fn new(body: Vec<Box<dyn Layer>>, downsample: Option<Vec<Box<dyn Layer>>>) -> Self {
        Self { body, downsample }
    }

    fn forward(&self, input: &ArrayD<AdvFloat>) -> ArrayD<AdvFloat> {
        let h = forward_chain(&self.body, input);
        let s = self
            .downsample
            .as_ref()
            .map_or_else(|| input.clone(), |ds| forward_chain(ds, input));
        (&h + &s).mapv(|v| if v.lt(&0.) { 0. } else { v })
    }

    fn forward_traced(&self, input: &ArrayD<AdvFloat>) -> (ArrayD<AdvFloat>, BlockTrace) {
        let (h, body_traces) = forward_chain_traced(&self.body, input);
        let (s, ds_traces) = match &self.downsample {
            Some(ds) => {
                let (s, traces) = forward_chain_traced(ds, input);
                (s, Some(traces))
            }
            None => (input.clone(), None),
        };
        let sum = &h + &s;
        let join_mask = sum.mapv(|v| v >= 0.);
        let output = sum.mapv(|v| if v.lt(&0.) { 0. } else { v });
        (
            output,
            BlockTrace {
                body: body_traces,
                downsample: ds_traces,
                join_mask,
            },
        )
    }

    /// Propagate `grad` through the join nonlinearity and both paths.
    fn backward(
        &self,
        trace: &BlockTrace,
        grad: &ArrayD<AdvFloat>,
        mode: BackwardMode,
    ) -> ArrayD<AdvFloat> {
        let joined = match mode {
            BackwardMode::Exact => {
                let mut g = grad.clone();
                ndarray::Zip::from(&mut g)
                    .and(&trace.join_mask)
                    .for_each(|g, &m| *g = if m { *g } else { 0. });
                g
            }
            BackwardMode::Linear { lambda } => grad * lambda,
        };
        let body_grad = backward_chain(&self.body, &trace.body, joined.clone(), mode);
        let skip_grad = match (&self.downsample, &trace.downsample) {
            (Some(ds), Some(traces)) => backward_chain(ds, traces, joined, mode),
            _ => joined,
        };
        body_grad + skip_grad
    }
}

impl fmt::Display for ResidualBlock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ResidualBlock[{} layers{}]",
            self.body.len(),
            if self.downsample.is_some() {
                ", downsample"
            } else {
                ""
            }
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResidualNet {
    input_shape: TensorShape,
    num_classes: usize,
    stem: Vec<Box<dyn Layer>>,
    stages: Vec<Vec<ResidualBlock>>,
    head: Vec<Box<dyn Layer>>,
}

#[derive(Debug)]
pub struct ResidualTrace {
    stem: Vec<LayerTrace>,
    /// Traces for the traversed prefix of blocks; shorter than the full
    /// stage list after a truncated forward.
    stages: Vec<Vec<BlockTrace>>,
    /// Empty after a truncated forward.
    head: Vec<LayerTrace>,
}

impl ResidualNet {
    pub fn new(
        input_shape: TensorShape,
        num_classes: usize,
        stem: Vec<Box<dyn Layer>>,
        stages: Vec<Vec<ResidualBlock>>,
        head: Vec<Box<dyn Layer>>,
    ) -> Self {
        Self {
            input_shape,
            num_classes,
            stem,
            stages,
            head,
        }
    }

    fn expect_trace<'a>(&self, trace: &'a NetTrace) -> &'a ResidualTrace {
        match trace {
            NetTrace::Residual(t) => t,
            NetTrace::Plain(_) => panic!("trace does not belong to a residual architecture"),
        }
    }

    /// Shared reverse walk. `boundary` of `None` replays every stage
    /// exactly; otherwise blocks strictly after the boundary use the linear
    /// policy with `lambda`.
    fn backprop(
        &self,
        trace: &ResidualTrace,
        grad: ArrayD<AdvFloat>,
        boundary: Option<(usize, usize)>,
        lambda: AdvFloat,
    ) -> Array4<AdvFloat> {
        let mut g = backward_chain(&self.head, &trace.head, grad, BackwardMode::Exact);
        for s_idx in (0..trace.stages.len()).rev() {
            let blocks = &self.stages[s_idx];
            let recorded = &trace.stages[s_idx];
            for b_idx in (0..recorded.len()).rev() {
                let mode = match boundary {
                    Some((stage, block)) if (s_idx, b_idx) > (stage, block) => {
                        BackwardMode::Linear { lambda }
                    }
                    _ => BackwardMode::Exact,
                };
                g = blocks[b_idx].backward(&recorded[b_idx], &g, mode);
            }
        }
        g = backward_chain(&self.stem, &trace.stem, g, BackwardMode::Exact);
        g.into_dimensionality::<Ix4>().unwrap()
    }
}

impl Network for ResidualNet {
    fn input_shape(&self) -> TensorShape {
        self.input_shape.clone()
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn resolve_stage(&self, ident: &str) -> Result<StageId, AttackError> {
        let (stage, block) = ident.split_once('_').ok_or_else(|| {
            AttackError::configuration(format!(
                "stage identifier '{}' is not of the form 'stage_block'",
                ident
            ))
        })?;
        let stage: usize = stage.parse().map_err(|_| {
            AttackError::configuration(format!("invalid stage index in '{}'", ident))
        })?;
        let block: usize = block.parse().map_err(|_| {
            AttackError::configuration(format!("invalid block index in '{}'", ident))
        })?;
        if stage == 0 || stage > self.stages.len() {
            return Err(AttackError::configuration(format!(
                "stage identifier '{}' addresses stage {} of {}",
                ident,
                stage,
                self.stages.len()
            )));
        }
        if block >= self.stages[stage - 1].len() {
            return Err(AttackError::configuration(format!(
                "stage identifier '{}' addresses block {} of {}",
                ident,
                block,
                self.stages[stage - 1].len()
            )));
        }
        Ok(StageId::Block {
            stage: stage - 1,
            block,
        })
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
        let mut x = forward_chain(&self.stem, &images.clone().into_dyn());
        for blocks in &self.stages {
            for block in blocks {
                x = block.forward(&x);
            }
        }
        forward_chain(&self.head, &x)
            .into_dimensionality::<Ix2>()
            .unwrap()
    }

    fn forward_traced(&self, images: &Array4<AdvFloat>) -> (Array2<AdvFloat>, NetTrace) {
        let (mut x, stem_traces) = forward_chain_traced(&self.stem, &images.clone().into_dyn());
        let mut stage_traces = Vec::with_capacity(self.stages.len());
        for blocks in &self.stages {
            let mut block_traces = Vec::with_capacity(blocks.len());
            for block in blocks {
                let (out, trace) = block.forward_traced(&x);
                x = out;
                block_traces.push(trace);
            }
            stage_traces.push(block_traces);
        }
        let (logits, head_traces) = forward_chain_traced(&self.head, &x);
        (
            logits.into_dimensionality::<Ix2>().unwrap(),
            NetTrace::Residual(ResidualTrace {
                stem: stem_traces,
                stages: stage_traces,
                head: head_traces,
            }),
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
        let StageId::Block { stage, block } = boundary else {
            panic!("stage identifier does not address a residual architecture")
        };
        self.backprop(
            trace,
            grad_logits.clone().into_dyn(),
            Some((stage, block)),
            lambda,
        )
    }

    fn forward_to_stage(
        &self,
        images: &Array4<AdvFloat>,
        stage: StageId,
    ) -> (ArrayD<AdvFloat>, NetTrace) {
        let StageId::Block { stage, block } = stage else {
            panic!("stage identifier does not address a residual architecture")
        };
        let (mut x, stem_traces) = forward_chain_traced(&self.stem, &images.clone().into_dyn());
        let mut stage_traces = Vec::with_capacity(stage + 1);
        for (s_idx, blocks) in self.stages.iter().enumerate() {
            let mut block_traces = Vec::with_capacity(blocks.len());
            for (b_idx, blk) in blocks.iter().enumerate() {
                let (out, trace) = blk.forward_traced(&x);
                x = out;
                block_traces.push(trace);
                if s_idx == stage && b_idx == block {
                    stage_traces.push(block_traces);
                    return (
                        x,
                        NetTrace::Residual(ResidualTrace {
                            stem: stem_traces,
                            stages: stage_traces,
                            head: vec![],
                        }),
                    );
                }
            }
            stage_traces.push(block_traces);
        }
        panic!("stage identifier out of range; resolve_stage must be used first")
    }

    fn backward_from_stage(&self, trace: &NetTrace, grad: &ArrayD<AdvFloat>) -> Array4<AdvFloat> {
        let trace = self.expect_trace(trace);
        debug_assert!(trace.head.is_empty());
        self.backprop(trace, grad.clone(), None, 0.)
    }
}

impl fmt::Display for ResidualNet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let blocks: usize = self.stages.iter().map(Vec::len).sum();
        write!(
            f,
            "ResidualNet {} => {} stages / {} blocks => {}",
            self.input_shape,
            self.stages.len(),
            blocks,
            self.num_classes
        )
    }
}
