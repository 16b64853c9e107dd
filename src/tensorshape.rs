use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Index;

/// Tensor shape with possibly-unknown dimensions (`None` is a wildcard,
/// conventionally the batch dimension).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorShape {
    dims: Vec<Option<usize>>,
}

impl TensorShape {
    pub fn new(dims: Vec<Option<usize>>) -> Self {
        Self { dims }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn is_fully_defined(&self) -> bool {
        self.dims.iter().all(|x| x.is_some())
    }

    pub fn is_compatible_with(&self, other: &Self) -> bool {
        if self.dims == vec![None] {
            return true;
        }
        if self.dims.len() != other.dims.len() {
            return false;
        }
        self.dims
            .iter()
            .zip(other.dims.iter())
            .all(|(x, y)| match (x, y) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            })
    }

    /// Whether a concrete shape satisfies this shape's defined dimensions.
    pub fn matches(&self, concrete: &[usize]) -> bool {
        self.dims.len() == concrete.len()
            && self
                .dims
                .iter()
                .zip(concrete.iter())
                .all(|(dim, &c)| dim.map_or(true, |d| d == c))
    }
}

impl Index<usize> for TensorShape {
    type Output = Option<usize>;

    fn index(&self, idx: usize) -> &Option<usize> {
        &self.dims[idx]
    }
}

impl From<Vec<usize>> for TensorShape {
    fn from(v: Vec<usize>) -> Self {
        Self {
            dims: v.into_iter().map(Some).collect(),
        }
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let dims: Vec<String> = self
            .dims
            .iter()
            .map(|d| d.map_or_else(|| "?".to_owned(), |x| x.to_string()))
            .collect();
        write!(f, "({})", dims.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_with_wildcard_batch() {
        let shape = TensorShape::new(vec![None, Some(3), Some(8), Some(8)]);
        assert!(shape.matches(&[5, 3, 8, 8]));
        assert!(shape.matches(&[1, 3, 8, 8]));
        assert!(!shape.matches(&[5, 1, 8, 8]));
        assert!(!shape.matches(&[5, 3, 8]));
    }

    #[test]
    fn test_compatibility() {
        let a = TensorShape::new(vec![None, Some(3)]);
        let b = TensorShape::from(vec![7, 3]);
        assert!(a.is_compatible_with(&b));
        assert!(!a.is_fully_defined());
        assert!(b.is_fully_defined());
    }
}
