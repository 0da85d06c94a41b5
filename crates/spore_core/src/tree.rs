//! The two-level spore tree: root → 4 children → 8 grandchildren.
//!
//! Children cover every combination of control extreme and time direction, in the
//! fixed order `[forw_max, back_max, forw_min, back_min]`. Each child spawns one
//! forward and one backward grandchild with the negated control.
//!
//! Grandchild `global_idx` is creation order (`parent * 2 + local`) and never
//! changes, so dt-vector slots stay attached to the same branch for the lifetime
//! of the tree. `sort_and_pair` records the angular order separately and checks
//! that every index-adjacent pair `(0,1), (2,3), (4,5), (6,7)` joins two
//! different parents.

use anyhow::Result;
use tracing::{debug, trace};

use crate::config::TreeConfig;
use crate::dt_vector::{DtVector, CHILD_COUNT, GRANDCHILD_COUNT};
use crate::error::TreeError;
use crate::spore::{Direction, Spore};
use crate::traits::{State, StateTransition};

pub const PAIR_COUNT: usize = GRANDCHILD_COUNT / 2;

const CHILD_NAMES: [&str; CHILD_COUNT] = ["forw_max", "back_max", "forw_min", "back_min"];
const CHILD_DIRECTIONS: [Direction; CHILD_COUNT] = [
    Direction::Forward,
    Direction::Backward,
    Direction::Forward,
    Direction::Backward,
];
const GRANDCHILD_DIRECTIONS: [Direction; 2] = [Direction::Forward, Direction::Backward];

/// Relative/absolute tolerances under which `update` treats a dt-vector as unchanged.
const UNCHANGED_RTOL: f64 = 1e-12;
const UNCHANGED_ATOL: f64 = 1e-15;

pub struct SporeTree<S: StateTransition> {
    transition: S,
    config: TreeConfig,
    root: State,
    children: Vec<Spore>,
    grandchildren: Vec<Spore>,
    /// Global indices in angular order, once `sort_and_pair` succeeded.
    sorted: Option<Vec<usize>>,
    candidate_map: Vec<Vec<usize>>,
    last_dt: DtVector,
}

impl<S: StateTransition> SporeTree<S> {
    /// Builds children and grandchildren for an explicit dt-vector.
    pub fn build(transition: S, config: TreeConfig, dt: &DtVector) -> Result<Self> {
        config.validate()?;
        let mut tree = Self {
            transition,
            config,
            root: config.root(),
            children: Vec::with_capacity(CHILD_COUNT),
            grandchildren: Vec::with_capacity(GRANDCHILD_COUNT),
            sorted: None,
            candidate_map: Vec::new(),
            last_dt: *dt,
        };
        tree.create_children(dt.children());
        tree.create_grandchildren(dt.grandchildren());
        tree.candidate_map = build_candidate_map(&tree.grandchildren);
        debug!(
            children = tree.children.len(),
            grandchildren = tree.grandchildren.len(),
            "spore tree built"
        );
        Ok(tree)
    }

    /// Children at `dt_base`, grandchildren at `|parent dt| * dt_grandchildren_factor`.
    pub fn auto(transition: S, config: TreeConfig) -> Result<Self> {
        let dt = config.default_dt_vector();
        Self::build(transition, config, &dt)
    }

    fn create_children(&mut self, magnitudes: &[f64]) {
        let (u_min, u_max) = self.transition.control_bounds();
        let controls = [u_max, u_max, u_min, u_min];
        self.children.clear();
        for (i, &magnitude) in magnitudes.iter().enumerate().take(CHILD_COUNT) {
            let dt = CHILD_DIRECTIONS[i].apply(magnitude);
            self.children.push(Spore {
                id: format!("child_{i}"),
                name: CHILD_NAMES[i].to_string(),
                position: self.transition.step(&self.root, controls[i], dt),
                control: controls[i],
                dt,
                index: i,
                parent_idx: None,
                local_idx: None,
            });
        }
    }

    fn create_grandchildren(&mut self, magnitudes: &[f64]) {
        self.grandchildren.clear();
        for parent in &self.children {
            let control = -parent.control;
            for (local, direction) in GRANDCHILD_DIRECTIONS.iter().enumerate() {
                let global = parent.index * 2 + local;
                let dt = direction.apply(magnitudes[global]);
                self.grandchildren.push(Spore {
                    id: format!("grandchild_{}_{}", parent.index, local),
                    name: format!("gc_{}_{}_{}", parent.index, local, direction.label()),
                    position: self.transition.step(&parent.position, control, dt),
                    control,
                    dt,
                    index: global,
                    parent_idx: Some(parent.index),
                    local_idx: Some(local),
                });
            }
        }
    }

    /// Recomputes every position for new magnitudes, keeping signs, identities and the sort.
    ///
    /// Returns `false` without touching anything when `dt` matches the last applied
    /// vector within floating tolerance.
    pub fn update(&mut self, dt: &DtVector) -> bool {
        if self.last_dt.allclose(dt, UNCHANGED_RTOL, UNCHANGED_ATOL) {
            trace!("dt-vector unchanged, skipping recompute");
            return false;
        }

        for (child, &magnitude) in self.children.iter_mut().zip(dt.children()) {
            child.dt = child.direction().apply(magnitude);
            child.position = self.transition.step(&self.root, child.control, child.dt);
        }
        for gc in self.grandchildren.iter_mut() {
            let parent = gc.parent_idx.unwrap_or_default();
            gc.dt = gc.direction().apply(dt.grandchildren()[gc.index]);
            gc.position = self
                .transition
                .step(&self.children[parent].position, gc.control, gc.dt);
        }
        self.last_dt = *dt;
        true
    }

    /// Sorts grandchildren by bearing from the root and fixes the pair layout.
    ///
    /// Bearings are sorted in descending order, rotated so the first parent-0
    /// grandchild leads, and rotated right by one more if slot 1 is also from
    /// parent 0. A same-parent pair afterwards is an error, never repaired.
    pub fn sort_and_pair(&mut self) -> Result<&[usize], TreeError> {
        let bearings: Vec<f64> = self
            .grandchildren
            .iter()
            .map(|gc| bearing(&self.root, &gc.position))
            .collect();
        let parents: Vec<usize> = self
            .grandchildren
            .iter()
            .map(|gc| gc.parent_idx.unwrap_or_default())
            .collect();

        let order = pair_order(&bearings, &parents);
        check_pairing(&order, &self.grandchildren)?;

        for (slot, &g) in order.iter().enumerate() {
            trace!(
                slot,
                name = %self.grandchildren[g].name,
                bearing_deg = bearings[g].to_degrees(),
                "sorted grandchild"
            );
        }
        debug!(?order, "grandchildren sorted and paired");

        Ok(self.sorted.insert(order).as_slice())
    }

    pub fn root(&self) -> &State {
        &self.root
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// Gives the transition back, dropping the tree.
    pub fn into_transition(self) -> S {
        self.transition
    }

    pub fn transition(&self) -> &S {
        &self.transition
    }

    pub fn children(&self) -> &[Spore] {
        &self.children
    }

    /// Grandchildren in creation (`global_idx`) order.
    pub fn grandchildren(&self) -> &[Spore] {
        &self.grandchildren
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted.is_some()
    }

    pub fn sorted_order(&self) -> Option<&[usize]> {
        self.sorted.as_deref()
    }

    pub fn sorted_grandchildren(&self) -> Result<Vec<&Spore>, TreeError> {
        let order = self.require_sorted("reading sorted grandchildren")?;
        Ok(order.iter().map(|&g| &self.grandchildren[g]).collect())
    }

    /// Global-index pairs at sorted slots `(0,1), (2,3), (4,5), (6,7)`.
    pub fn sorted_pairs(&self) -> Result<[(usize, usize); PAIR_COUNT], TreeError> {
        let order = self.require_sorted("pairing")?;
        let mut pairs = [(0, 0); PAIR_COUNT];
        for (k, pair) in pairs.iter_mut().enumerate() {
            *pair = (order[2 * k], order[2 * k + 1]);
        }
        Ok(pairs)
    }

    pub fn mean_points(&self) -> Result<[State; PAIR_COUNT], TreeError> {
        let pairs = self.sorted_pairs()?;
        Ok(pairs.map(|(a, b)| (self.grandchildren[a].position + self.grandchildren[b].position) * 0.5))
    }

    pub fn sorted_pair_distances(&self) -> Result<[f64; PAIR_COUNT], TreeError> {
        let pairs = self.sorted_pairs()?;
        Ok(pairs.map(|(a, b)| (self.grandchildren[a].position - self.grandchildren[b].position).norm()))
    }

    pub fn candidate_map(&self) -> &[Vec<usize>] {
        &self.candidate_map
    }

    /// Allowed partners of `global_idx`: every grandchild with another parent.
    pub fn candidates(&self, global_idx: usize) -> &[usize] {
        self.candidate_map
            .get(global_idx)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Magnitudes last applied by `build` or `update`.
    pub fn dt_vector(&self) -> DtVector {
        self.last_dt
    }

    /// Restores the configured default dt-vector and forgets the sort.
    pub fn reset(&mut self) {
        let dt = self.config.default_dt_vector();
        self.create_children(dt.children());
        self.create_grandchildren(dt.grandchildren());
        self.candidate_map = build_candidate_map(&self.grandchildren);
        self.sorted = None;
        self.last_dt = dt;
        debug!("spore tree reset to default dt-vector");
    }

    fn require_sorted(&self, operation: &'static str) -> Result<&[usize], TreeError> {
        self.sorted
            .as_deref()
            .ok_or(TreeError::NotSorted { operation })
    }
}

/// Bearing of `point` seen from `origin`, in `(-π, π]`.
pub fn bearing(origin: &State, point: &State) -> f64 {
    let d = point - origin;
    d[1].atan2(d[0])
}

/// Slot order for items with the given bearings and parent ids.
///
/// Stable descending sort by bearing, then the parent-0 rotation. Ties keep
/// their input order.
pub fn pair_order(bearings: &[f64], parents: &[usize]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..bearings.len()).collect();
    order.sort_by(|&a, &b| bearings[b].total_cmp(&bearings[a]));

    let offset = order
        .iter()
        .position(|&g| parents[g] == 0)
        .unwrap_or(0);
    order.rotate_left(offset);

    if order.len() >= 2 && parents[order[1]] == 0 {
        order.rotate_right(1);
    }
    order
}

/// Checks the four slot pairs of `order` for distinct parents.
pub fn check_pairing(order: &[usize], grandchildren: &[Spore]) -> Result<(), TreeError> {
    for pair in 0..PAIR_COUNT {
        let (first_slot, second_slot) = (2 * pair, 2 * pair + 1);
        if second_slot >= order.len() {
            return Err(TreeError::InsufficientGrandchildren {
                pair,
                first_slot,
                second_slot,
                available: order.len(),
            });
        }
        let a = &grandchildren[order[first_slot]];
        let b = &grandchildren[order[second_slot]];
        if a.is_sibling_of(b) {
            return Err(TreeError::SameParentPair {
                pair,
                first_slot,
                second_slot,
                first_name: a.name.clone(),
                second_name: b.name.clone(),
                parent: a.parent_idx.unwrap_or_default(),
                second_parent: b.parent_idx.unwrap_or_default(),
            });
        }
    }
    Ok(())
}

/// For every grandchild, the sorted global indices of grandchildren with another parent.
pub fn build_candidate_map(grandchildren: &[Spore]) -> Vec<Vec<usize>> {
    grandchildren
        .iter()
        .map(|gc| {
            let mut candidates: Vec<usize> = grandchildren
                .iter()
                .filter(|other| other.parent_idx != gc.parent_idx)
                .map(|other| other.index)
                .collect();
            candidates.sort_unstable();
            candidates
        })
        .collect()
}
