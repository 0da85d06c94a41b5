use serde::{Deserialize, Serialize};

use crate::traits::State;

/// Time direction of a branch. Fixed at construction, never renegotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn sign(self) -> f64 {
        match self {
            Direction::Forward => 1.0,
            Direction::Backward => -1.0,
        }
    }

    pub fn of(signed_dt: f64) -> Self {
        if signed_dt < 0.0 {
            Direction::Backward
        } else {
            Direction::Forward
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
        }
    }

    /// Signed step for a positive magnitude.
    pub fn apply(self, magnitude: f64) -> f64 {
        self.sign() * magnitude
    }
}

/// A child or grandchild node of the tree.
///
/// `index` is the child index (0..4) for children and the creation-order
/// `global_idx` (0..8) for grandchildren. Only `position` and the magnitude of
/// `dt` change when the tree is updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spore {
    pub id: String,
    pub name: String,
    pub position: State,
    pub control: f64,
    /// Signed step; the sign is the branch's time direction.
    pub dt: f64,
    pub index: usize,
    /// Child that spawned this spore; `None` for children of the root.
    pub parent_idx: Option<usize>,
    /// 0 (forward) or 1 (backward) among a parent's two grandchildren.
    pub local_idx: Option<usize>,
}

impl Spore {
    pub fn direction(&self) -> Direction {
        Direction::of(self.dt)
    }

    pub fn magnitude(&self) -> f64 {
        self.dt.abs()
    }

    pub fn is_grandchild(&self) -> bool {
        self.parent_idx.is_some()
    }

    /// True for two grandchildren of the same child.
    pub fn is_sibling_of(&self, other: &Spore) -> bool {
        self.parent_idx.is_some() && self.parent_idx == other.parent_idx
    }
}
