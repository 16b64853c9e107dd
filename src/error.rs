//! Run-level error taxonomy.
//!
//! Configuration and shape errors are detected at run start or first use and
//! abort the run; there is no retry or partial-batch recovery.
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum AttackError {
    /// Unknown strategy name, unsupported stage identifier, or unsupported
    /// model selector.
    Configuration { message: String },
    /// Dimension mismatch between images, labels, and the model.
    Shape {
        context: &'static str,
        expected: String,
        actual: String,
    },
    /// A filesystem path could not be read or written.
    Resource { path: PathBuf, source: io::Error },
}

impl AttackError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn shape(
        context: &'static str,
        expected: impl fmt::Display,
        actual: impl fmt::Display,
    ) -> Self {
        Self::Shape {
            context,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub fn resource(path: &Path, source: io::Error) -> Self {
        Self::Resource {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl fmt::Display for AttackError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Configuration { message } => write!(f, "configuration error: {}", message),
            Self::Shape {
                context,
                expected,
                actual,
            } => write!(
                f,
                "shape mismatch in {}: expected {}, got {}",
                context, expected, actual
            ),
            Self::Resource { path, source } => {
                write!(f, "resource error at {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for AttackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Resource { source, .. } => Some(source),
            _ => None,
        }
    }
}
