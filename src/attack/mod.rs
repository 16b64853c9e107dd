//! The perturbation core: gradient sources, the per-iteration update rule,
//! budget projection, and the two optimization loops.
pub mod diversity;
pub mod grad;
pub mod ila;
pub mod loss;
pub mod primary;
pub mod project;
pub mod update;

pub use diversity::InputDiversity;
pub use grad::GradientSource;
pub use ila::AlignmentRefiner;
pub use primary::PrimaryAttackLoop;
pub use project::BudgetProjector;
pub use update::UpdateRule;
