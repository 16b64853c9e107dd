//! Model boundary: layer primitives, the two supported architecture
//! families, and the capability surface the attack loops consume.
pub mod conv;
pub mod dense;
pub mod layer;
pub mod norm;
pub mod plain;
pub mod pool;
pub mod relu;
pub mod residual;

pub use conv::Conv2d;
pub use dense::{Dense, Flatten};
pub use layer::{Layer, LayerTrace};
pub use norm::{BatchNorm2d, Normalize};
pub use plain::{PlainNet, PlainTrace};
pub use pool::{GlobalAvgPool, MaxPool2d};
pub use relu::ReLU;
pub use residual::{ResidualBlock, ResidualNet, ResidualTrace};

use crate::config::ArchitectureKind;
use crate::error::AttackError;
use crate::tensorshape::TensorShape;
use crate::AdvFloat;
use enum_dispatch::enum_dispatch;
use ndarray::{Array2, Array4, ArrayD};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Address of a network stage, resolved from its textual form by the
/// architecture that owns it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum StageId {
    /// Residual stage/block pair, zero-based.
    Block { stage: usize, block: usize },
    /// Flat layer index in a sequential topology.
    Index(usize),
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Block { stage, block } => write!(f, "{}_{}", stage + 1, block),
            Self::Index(idx) => write!(f, "{}", idx),
        }
    }
}

/// Gradient replay policy for one backward step.
#[derive(Clone, Copy, Debug)]
pub enum BackwardMode {
    Exact,
    /// Nonlinearities pass gradients through as `lambda * identity`.
    Linear { lambda: AdvFloat },
}

/// Per-batch record of a forward pass, consumed exactly once by a backward
/// pass over the same architecture.
#[derive(Debug)]
pub enum NetTrace {
    Residual(ResidualTrace),
    Plain(PlainTrace),
}

#[enum_dispatch]
pub trait Network {
    fn input_shape(&self) -> TensorShape;

    fn num_classes(&self) -> usize;

    /// Resolve a textual stage identifier against this architecture.
    ///
    /// # Errors
    /// `Configuration` if the identifier does not parse or is out of range.
    fn resolve_stage(&self, ident: &str) -> Result<StageId, AttackError>;

    /// # Errors
    /// `Shape` if the batch does not match the model input shape.
    fn validate_input(&self, images: &Array4<AdvFloat>) -> Result<(), AttackError>;

    fn forward(&self, images: &Array4<AdvFloat>) -> Array2<AdvFloat>;

    fn forward_traced(&self, images: &Array4<AdvFloat>) -> (Array2<AdvFloat>, NetTrace);

    fn backward(&self, trace: &NetTrace, grad_logits: &Array2<AdvFloat>) -> Array4<AdvFloat>;

    /// Backward pass where nonlinearities in stages strictly after
    /// `boundary` are replayed as `lambda * identity`.
    fn backward_linear(
        &self,
        trace: &NetTrace,
        grad_logits: &Array2<AdvFloat>,
        boundary: StageId,
        lambda: AdvFloat,
    ) -> Array4<AdvFloat>;

    /// Truncated forward pass, returning the activation after `stage`.
    fn forward_to_stage(
        &self,
        images: &Array4<AdvFloat>,
        stage: StageId,
    ) -> (ArrayD<AdvFloat>, NetTrace);

    /// Exact backward pass from a truncated forward's activation gradient.
    fn backward_from_stage(&self, trace: &NetTrace, grad: &ArrayD<AdvFloat>) -> Array4<AdvFloat>;
}

#[enum_dispatch(Network)]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Model {
    Residual(ResidualNet),
    Plain(PlainNet),
}

/// Load a serialized model and check it against the configured selector.
///
/// # Errors
/// `Resource` if the file cannot be read, `Configuration` if it does not
/// parse or its architecture does not match `kind`.
pub fn load_model(kind: ArchitectureKind, path: &Path) -> Result<Model, AttackError> {
    let file = File::open(path).map_err(|e| AttackError::resource(path, e))?;
    let model: Model = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
        AttackError::configuration(format!("invalid model file {}: {}", path.display(), e))
    })?;
    let matches = matches!(
        (kind, &model),
        (ArchitectureKind::Residual, Model::Residual(_)) | (ArchitectureKind::Plain, Model::Plain(_))
    );
    if matches {
        Ok(model)
    } else {
        Err(AttackError::configuration(format!(
            "model file {} does not contain a {:?} architecture",
            path.display(),
            kind
        )))
    }
}

pub(crate) fn forward_chain(layers: &[Box<dyn Layer>], input: &ArrayD<AdvFloat>) -> ArrayD<AdvFloat> {
    let mut x = input.clone();
    for l in layers {
        x = l.forward(&x);
    }
    x
}

pub(crate) fn forward_chain_traced(
    layers: &[Box<dyn Layer>],
    input: &ArrayD<AdvFloat>,
) -> (ArrayD<AdvFloat>, Vec<LayerTrace>) {
    let mut x = input.clone();
    let mut traces = Vec::with_capacity(layers.len());
    for l in layers {
        let (out, trace) = l.forward_traced(&x);
        x = out;
        traces.push(trace);
    }
    (x, traces)
}

/// Replay gradients through `layers[..traces.len()]` in reverse. The traces
/// must be the (possibly truncated) prefix recorded by a traced forward.
pub(crate) fn backward_chain(
    layers: &[Box<dyn Layer>],
    traces: &[LayerTrace],
    grad: ArrayD<AdvFloat>,
    mode: BackwardMode,
) -> ArrayD<AdvFloat> {
    debug_assert!(traces.len() <= layers.len());
    let mut g = grad;
    for i in (0..traces.len()).rev() {
        g = match mode {
            BackwardMode::Linear { lambda } if layers[i].is_nonlinearity() => {
                layers[i].backward_linear(&traces[i], &g, lambda)
            }
            _ => layers[i].backward(&traces[i], &g),
        };
    }
    g
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::tiny_plain_net;
    use std::io::Write;

    #[test]
    fn test_stage_id_ordering() {
        let early = StageId::Block { stage: 1, block: 2 };
        let late = StageId::Block { stage: 2, block: 0 };
        assert!(early < late);
        assert!(StageId::Block { stage: 2, block: 0 } < StageId::Block { stage: 2, block: 1 });
        assert_eq!(format!("{}", late), "3_0");
    }

    #[test]
    fn test_model_json_round_trip() {
        let model = Model::Plain(tiny_plain_net());
        let text = serde_json::to_string(&model).unwrap();
        let restored: Model = serde_json::from_str(&text).unwrap();

        let images = crate::test_util::patterned_image_batch((2, 3, 8, 8));
        assert_eq!(model.forward(&images), restored.forward(&images));
    }

    #[test]
    fn test_load_model_checks_selector() {
        let dir = std::env::temp_dir().join(format!("advex-load-model-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("plain.json");
        let mut file = File::create(&path).unwrap();
        file.write_all(
            serde_json::to_string(&Model::Plain(tiny_plain_net()))
                .unwrap()
                .as_bytes(),
        )
        .unwrap();

        assert!(load_model(ArchitectureKind::Plain, &path).is_ok());
        assert!(matches!(
            load_model(ArchitectureKind::Residual, &path),
            Err(AttackError::Configuration { .. })
        ));
        std::fs::remove_dir_all(&dir).ok();
    }
}
