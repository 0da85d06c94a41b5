use serde::{Deserialize, Serialize};

use crate::error::TreeError;

pub const CHILD_COUNT: usize = 4;
pub const GRANDCHILD_COUNT: usize = 8;
pub const DT_LEN: usize = CHILD_COUNT + GRANDCHILD_COUNT;

/// The 12 positive step magnitudes: 4 children followed by 8 grandchildren.
///
/// Time direction is never stored here; each spore keeps its own sign.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DtVector {
    values: [f64; DT_LEN],
}

impl DtVector {
    pub fn new(children: [f64; CHILD_COUNT], grandchildren: [f64; GRANDCHILD_COUNT]) -> Result<Self, TreeError> {
        let mut values = [0.0; DT_LEN];
        values[..CHILD_COUNT].copy_from_slice(&children);
        values[CHILD_COUNT..].copy_from_slice(&grandchildren);
        Self::from_slice(&values)
    }

    /// Accepts exactly 12 entries, each finite and strictly positive.
    pub fn from_slice(values: &[f64]) -> Result<Self, TreeError> {
        if values.len() != DT_LEN {
            return Err(TreeError::WrongLength {
                expected: DT_LEN,
                got: values.len(),
            });
        }
        let mut out = [0.0; DT_LEN];
        for (index, (&value, slot)) in values.iter().zip(out.iter_mut()).enumerate() {
            if !(value.is_finite() && value > 0.0) {
                return Err(TreeError::InvalidMagnitude { index, value });
            }
            *slot = value;
        }
        Ok(Self { values: out })
    }

    pub fn uniform(child: f64, grandchild: f64) -> Self {
        let mut values = [grandchild; DT_LEN];
        values[..CHILD_COUNT].fill(child);
        Self { values }
    }

    pub fn children(&self) -> &[f64] {
        &self.values[..CHILD_COUNT]
    }

    pub fn grandchildren(&self) -> &[f64] {
        &self.values[CHILD_COUNT..]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.values.to_vec()
    }

    /// Same elementwise test as `numpy.allclose`: |a - b| <= atol + rtol * |b|.
    pub fn allclose(&self, other: &DtVector, rtol: f64, atol: f64) -> bool {
        self.values
            .iter()
            .zip(other.values.iter())
            .all(|(a, b)| (a - b).abs() <= atol + rtol * b.abs())
    }

    /// Copy with every entry clamped into `[lo, hi]`.
    pub fn clamped(&self, (lo, hi): (f64, f64)) -> Self {
        let mut values = self.values;
        for v in values.iter_mut() {
            *v = v.clamp(lo, hi);
        }
        Self { values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_children_and_grandchildren() {
        let dt = DtVector::uniform(0.1, 0.01);
        assert_eq!(dt.children().len(), CHILD_COUNT);
        assert_eq!(dt.grandchildren().len(), GRANDCHILD_COUNT);
        assert_eq!(dt.as_slice()[3], 0.1);
        assert_eq!(dt.as_slice()[4], 0.01);
    }

    #[test]
    fn rejects_non_positive_and_wrong_length() {
        let mut values = vec![0.1; DT_LEN];
        values[7] = -0.01;
        assert_eq!(
            DtVector::from_slice(&values),
            Err(TreeError::InvalidMagnitude {
                index: 7,
                value: -0.01
            })
        );
        assert_eq!(
            DtVector::from_slice(&[0.1; 11]),
            Err(TreeError::WrongLength {
                expected: DT_LEN,
                got: 11
            })
        );
    }

    #[test]
    fn allclose_uses_relative_and_absolute_tolerance() {
        let a = DtVector::uniform(0.1, 0.01);
        let b = DtVector::uniform(0.1 + 1e-10, 0.01);
        let c = DtVector::uniform(0.11, 0.01);
        assert!(a.allclose(&b, 1e-5, 1e-8));
        assert!(!a.allclose(&c, 1e-5, 1e-8));
    }

    #[test]
    fn clamped_respects_bounds() {
        let dt = DtVector::uniform(0.5, 0.0001).clamped((0.001, 0.2));
        assert!(dt.children().iter().all(|&v| v == 0.2));
        assert!(dt.grandchildren().iter().all(|&v| v == 0.001));
    }
}
