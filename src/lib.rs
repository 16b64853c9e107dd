#![allow(clippy::must_use_candidate)]

pub mod attack;
pub mod config;
pub mod dataset;
pub mod emit;
pub mod error;
pub mod model;
pub mod runner;
pub mod tensorshape;
pub mod test_util;

pub use crate::config::{AttackConfig, Method};
pub use crate::error::AttackError;

pub type AdvFloat = f64;
