//! Run configuration.
//!
//! A single `AttackConfig` is constructed at process entry (usually from a
//! JSON file) and passed by reference into the batch driver and loops; there
//! is no mutable global state.
use crate::error::AttackError;
use crate::AdvFloat;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Per-iteration step applied by every iterative strategy.
pub const ITERATIVE_STEP: AdvFloat = 1. / 255.;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttackConfig {
    #[serde(default = "defaults::epsilon")]
    pub epsilon: AdvFloat,
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,
    #[serde(default = "defaults::method")]
    pub method: String,
    #[serde(default = "defaults::niters")]
    pub niters: usize,
    #[serde(default = "defaults::ila_niters")]
    pub ila_niters: usize,
    #[serde(default = "defaults::linbp_layer")]
    pub linbp_layer: String,
    #[serde(default = "defaults::ila_layer")]
    pub ila_layer: String,
    #[serde(default = "defaults::sgm_lambda")]
    pub sgm_lambda: AdvFloat,
    #[serde(default = "defaults::model")]
    pub model: String,
    pub model_path: PathBuf,
    pub data_dir: PathBuf,
    pub index_path: PathBuf,
    pub save_dir: PathBuf,
    #[serde(default)]
    pub targeted: bool,
    #[serde(default)]
    pub seed: u64,
}

mod defaults {
    use crate::AdvFloat;

    pub fn epsilon() -> AdvFloat {
        1.6 / 255.
    }
    pub fn batch_size() -> usize {
        200
    }
    pub fn method() -> String {
        "linbp_ifgsm".to_owned()
    }
    pub fn niters() -> usize {
        300
    }
    pub fn ila_niters() -> usize {
        100
    }
    pub fn linbp_layer() -> String {
        "3_1".to_owned()
    }
    pub fn ila_layer() -> String {
        "2_3".to_owned()
    }
    pub fn sgm_lambda() -> AdvFloat {
        1.0
    }
    pub fn model() -> String {
        "residual".to_owned()
    }
}

impl AttackConfig {
    /// # Errors
    /// `Resource` if the file cannot be read, `Configuration` if it does not
    /// parse or fails validation.
    pub fn from_file(path: &Path) -> Result<Self, AttackError> {
        let file = File::open(path).map_err(|e| AttackError::resource(path, e))?;
        let config: Self = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            AttackError::configuration(format!("invalid config file {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// `Configuration` on out-of-range numeric fields or an unknown strategy
    /// or model name.
    pub fn validate(&self) -> Result<(), AttackError> {
        if !(self.epsilon > 0. && self.epsilon <= 1.) {
            return Err(AttackError::configuration(format!(
                "epsilon must be in (0, 1], got {}",
                self.epsilon
            )));
        }
        if self.batch_size == 0 {
            return Err(AttackError::configuration("batch_size must be nonzero"));
        }
        if !(self.sgm_lambda >= 0.) {
            return Err(AttackError::configuration(format!(
                "sgm_lambda must be nonnegative, got {}",
                self.sgm_lambda
            )));
        }
        Method::parse(&self.method)?;
        self.arch()?;
        Ok(())
    }

    pub fn arch(&self) -> Result<ArchitectureKind, AttackError> {
        match self.model.as_str() {
            "residual" => Ok(ArchitectureKind::Residual),
            "plain" => Ok(ArchitectureKind::Plain),
            other => Err(AttackError::configuration(format!(
                "unsupported model selector '{}'",
                other
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchitectureKind {
    Residual,
    Plain,
}

/// Base perturbation strategy, before the `linbp`/`ila` markers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BaseStrategy {
    /// Single large sign step.
    Fgsm,
    /// Iterative sign steps.
    IFgsm,
    /// Iterative with fresh uniform noise before each gradient.
    Pgd,
    /// Iterative with momentum accumulation.
    MiFgsm,
    /// Momentum plus the input-diversity transform.
    Mdi2Fgsm,
}

/// A parsed strategy name, e.g. `"ifgsm"`, `"linbp_mdi2fgsm"`, `"ila_fgsm"`.
///
/// The name is a `_`-separated sequence of optional `linbp` and `ila` markers
/// followed by exactly one base strategy.
#[derive(Clone, Debug)]
pub struct Method {
    name: String,
    base: BaseStrategy,
    linbp: bool,
    ila: bool,
}

impl Method {
    /// # Errors
    /// `Configuration` on an unknown token, a missing base strategy, or
    /// tokens after the base.
    pub fn parse(name: &str) -> Result<Self, AttackError> {
        let mut linbp = false;
        let mut ila = false;
        let mut base = None;
        for token in name.split('_') {
            if base.is_some() {
                return Err(AttackError::configuration(format!(
                    "unknown strategy name '{}': trailing token '{}'",
                    name, token
                )));
            }
            match token {
                "linbp" => linbp = true,
                "ila" => ila = true,
                "fgsm" => base = Some(BaseStrategy::Fgsm),
                "ifgsm" => base = Some(BaseStrategy::IFgsm),
                "pgd" => base = Some(BaseStrategy::Pgd),
                "mifgsm" => base = Some(BaseStrategy::MiFgsm),
                "mdi2fgsm" => base = Some(BaseStrategy::Mdi2Fgsm),
                other => {
                    return Err(AttackError::configuration(format!(
                        "unknown strategy name '{}': token '{}'",
                        name, other
                    )))
                }
            }
        }
        let base = base.ok_or_else(|| {
            AttackError::configuration(format!("strategy name '{}' has no base strategy", name))
        })?;
        Ok(Self {
            name: name.to_owned(),
            base,
            linbp,
            ila,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn base(&self) -> BaseStrategy {
        self.base
    }

    pub const fn uses_linear_backprop(&self) -> bool {
        self.linbp
    }

    pub const fn uses_alignment_refinement(&self) -> bool {
        self.ila
    }

    pub fn uses_momentum(&self) -> bool {
        matches!(self.base, BaseStrategy::MiFgsm | BaseStrategy::Mdi2Fgsm)
    }

    pub fn uses_diversity(&self) -> bool {
        self.base == BaseStrategy::Mdi2Fgsm
    }

    pub fn injects_noise(&self) -> bool {
        self.base == BaseStrategy::Pgd
    }

    pub fn single_step(&self) -> bool {
        self.base == BaseStrategy::Fgsm
    }

    /// Single-step strategies take one large step to the budget boundary;
    /// iterative strategies take many small fixed steps.
    pub fn step_size(&self, epsilon: AdvFloat) -> AdvFloat {
        if self.single_step() {
            2. * epsilon
        } else {
            ITERATIVE_STEP
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_bases() {
        for (name, momentum, diversity, noise) in [
            ("fgsm", false, false, false),
            ("ifgsm", false, false, false),
            ("pgd", false, false, true),
            ("mifgsm", true, false, false),
            ("mdi2fgsm", true, true, false),
        ] {
            let m = Method::parse(name).unwrap();
            assert_eq!(m.uses_momentum(), momentum, "{}", name);
            assert_eq!(m.uses_diversity(), diversity, "{}", name);
            assert_eq!(m.injects_noise(), noise, "{}", name);
            assert!(!m.uses_linear_backprop());
            assert!(!m.uses_alignment_refinement());
        }
    }

    #[test]
    fn test_parse_markers() {
        let m = Method::parse("linbp_mdi2fgsm").unwrap();
        assert!(m.uses_linear_backprop());
        assert!(m.uses_momentum());
        assert!(m.uses_diversity());

        let m = Method::parse("ila_fgsm").unwrap();
        assert!(m.uses_alignment_refinement());
        assert!(m.single_step());

        let m = Method::parse("linbp_ila_ifgsm").unwrap();
        assert!(m.uses_linear_backprop());
        assert!(m.uses_alignment_refinement());
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert!(Method::parse("").is_err());
        assert!(Method::parse("ffgsm").is_err());
        assert!(Method::parse("linbp").is_err());
        assert!(Method::parse("ifgsm_extra").is_err());
        assert!(Method::parse("ifgsm_fgsm").is_err());
    }

    #[test]
    fn test_step_size_rule() {
        let epsilon = 1.6 / 255.;
        assert_eq!(
            Method::parse("fgsm").unwrap().step_size(epsilon),
            2. * epsilon
        );
        assert_eq!(
            Method::parse("linbp_fgsm").unwrap().step_size(epsilon),
            2. * epsilon
        );
        assert_eq!(
            Method::parse("ifgsm").unwrap().step_size(epsilon),
            ITERATIVE_STEP
        );
        assert_eq!(
            Method::parse("mifgsm").unwrap().step_size(epsilon),
            ITERATIVE_STEP
        );
        assert_eq!(
            Method::parse("ila_fgsm").unwrap().step_size(epsilon),
            2. * epsilon
        );
    }

    #[test]
    fn test_config_validation() {
        let config = AttackConfig {
            epsilon: 1.6 / 255.,
            batch_size: 4,
            method: "ifgsm".to_owned(),
            niters: 10,
            ila_niters: 5,
            linbp_layer: "3_1".to_owned(),
            ila_layer: "2_3".to_owned(),
            sgm_lambda: 1.0,
            model: "residual".to_owned(),
            model_path: "model.json".into(),
            data_dir: "data".into(),
            index_path: "data/index.json".into(),
            save_dir: "out".into(),
            targeted: false,
            seed: 0,
        };
        assert!(config.validate().is_ok());

        let mut bad = config.clone();
        bad.epsilon = 0.;
        assert!(bad.validate().is_err());

        let mut bad = config.clone();
        bad.method = "gradfree".to_owned();
        assert!(bad.validate().is_err());

        let mut bad = config;
        bad.model = "transformer".to_owned();
        assert!(bad.validate().is_err());
    }
}
