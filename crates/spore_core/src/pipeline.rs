//! End-to-end searches: approaching pairs → per-pair optimization → chronology
//! → disjoint pairs, and from there to an area-maximizing dt-vector.
//!
//! Expected dead ends (nothing approaching, no meeting found, constraints left
//! violated) come back as reports with `success == false` and a message. Only
//! bad configuration and tree invariant violations are errors.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::area::TreeAreaEvaluator;
use crate::area_opt::{AreaOptimizationResult, AreaOptimizer};
use crate::chronology::{
    extract_pairs, optimal_dt_from_pairs, pair_details, pair_statistics, Chronology, DtFromPairs, MeetingTables,
    PairDetail, PairExtraction, PairStatistics,
};
use crate::config::{AreaSettings, PairSearchSettings, TreeConfig};
use crate::convergence::{
    approaching_grandchild_pairs, approaching_parent_pairs, grandchild_to_foreign_parent_rate, pairwise_closing_rate,
    ApproachingPair, ApproachingParent,
};
use crate::dt_vector::{DtVector, CHILD_COUNT, DT_LEN};
use crate::minimize::{nelder_mead, BoxBounds, MinimizeSettings};
use crate::pair_optimizer::{PairOptimization, PairOptimizer, ParentOptimization};
use crate::traits::{DtObjective, StateTransition};
use crate::tree::SporeTree;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairSearchReport {
    /// At least one disjoint pair was extracted.
    pub success: bool,
    pub message: String,
    pub approaching_pairs: Vec<ApproachingPair>,
    pub approaching_parents: Vec<ApproachingParent>,
    pub pair_results: Vec<PairOptimization>,
    pub parent_results: Vec<ParentOptimization>,
    pub tables: MeetingTables,
    pub chronology: Chronology,
    pub extraction: PairExtraction,
    /// dt-vector with the extracted meeting steps written in.
    pub dt_from_pairs: DtFromPairs,
    pub details: Vec<PairDetail>,
    pub statistics: PairStatistics,
}

impl PairSearchReport {
    /// Extracted pairs as `(gc_i, gc_j)` global indices.
    pub fn index_pairs(&self) -> Vec<(usize, usize)> {
        self.extraction.pairs.iter().map(|p| (p.gc_i, p.gc_j)).collect()
    }
}

/// Runs the pair search on a built tree.
///
/// Sibling pairs are never searched: approaching pairs are filtered through the
/// tree's candidate map before optimization.
pub fn find_optimal_pairs<S: StateTransition>(
    tree: &SporeTree<S>,
    settings: &PairSearchSettings,
) -> Result<PairSearchReport> {
    settings.validate()?;
    let transition = tree.transition();
    let grandchildren = tree.grandchildren();
    let children = tree.children();

    let gc_rates = pairwise_closing_rate(transition, grandchildren);
    let parent_rates = grandchild_to_foreign_parent_rate(transition, grandchildren, children);
    let approaching_pairs: Vec<ApproachingPair> = approaching_grandchild_pairs(&gc_rates, settings.approach_threshold)
        .into_iter()
        .filter(|p| tree.candidates(p.gc_i).contains(&p.gc_j))
        .collect();
    let approaching_parents = approaching_parent_pairs(&parent_rates, settings.approach_threshold);

    let optimizer = PairOptimizer::new(tree, settings)?;
    let pair_results = approaching_pairs
        .iter()
        .map(|p| optimizer.optimize(p.gc_i, p.gc_j))
        .collect::<Result<Vec<_>>>()?;
    let parent_results = approaching_parents
        .iter()
        .map(|p| optimizer.optimize_parent(p.gc, p.parent))
        .collect::<Result<Vec<_>>>()?;

    let tables = MeetingTables::from_results(grandchildren.len(), children.len(), &pair_results, &parent_results);
    let chronology = Chronology::build(&tables, &gc_rates, &parent_rates, grandchildren, settings.order);
    let extraction = extract_pairs(&chronology, settings.ultra_close);
    let dt_from_pairs = optimal_dt_from_pairs(&extraction.pairs, grandchildren, &tree.dt_vector())?;
    let details = pair_details(&extraction.pairs, grandchildren, children);
    let statistics = pair_statistics(&details);

    let success = !extraction.pairs.is_empty();
    let message = if approaching_pairs.is_empty() {
        "No approaching grandchild pairs.".to_string()
    } else if chronology.grandchild_meeting_count() == 0 {
        format!(
            "None of {} approaching pairs reached a feasible meeting.",
            approaching_pairs.len()
        )
    } else {
        format!(
            "Extracted {} pairs, {} grandchildren unmatched.",
            extraction.pairs.len(),
            extraction.unmatched.len()
        )
    };
    if success {
        info!(pairs = extraction.pairs.len(), "pair search finished");
    } else {
        warn!(%message, "pair search found no pairs");
    }

    Ok(PairSearchReport {
        success,
        message,
        approaching_pairs,
        approaching_parents,
        pair_results,
        parent_results,
        tables,
        chronology,
        extraction,
        dt_from_pairs,
        details,
        statistics,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtSearchReport {
    /// Area optimization converged and satisfied every pair constraint.
    pub success: bool,
    pub message: String,
    pub initial_dt: DtVector,
    pub pair_search: PairSearchReport,
    pub area: Option<AreaOptimizationResult>,
}

impl DtSearchReport {
    pub fn optimal_dt(&self) -> Option<DtVector> {
        self.area.as_ref().map(|a| a.optimal_dt)
    }
}

/// Default tree → sort → pair search → pair steps applied → constrained area maximization.
///
/// The angular sort of the default tree is kept for the whole area search, so
/// the quadrilateral corners never change identity.
pub fn find_optimal_dt_vector<S: StateTransition>(
    transition: S,
    config: TreeConfig,
    pair_settings: &PairSearchSettings,
    area_settings: &AreaSettings,
) -> Result<DtSearchReport> {
    area_settings.validate()?;
    let mut tree = SporeTree::auto(transition, config)?;
    tree.sort_and_pair()?;
    let initial_dt = tree.dt_vector();

    let pair_search = find_optimal_pairs(&tree, pair_settings)?;
    if !pair_search.success {
        let message = format!("Pair search failed: {}", pair_search.message);
        return Ok(DtSearchReport {
            success: false,
            message,
            initial_dt,
            pair_search,
            area: None,
        });
    }

    let pair_dt = pair_search.dt_from_pairs.dt;
    tree.update(&pair_dt);
    let mut evaluator = TreeAreaEvaluator::from_tree(tree, area_settings.objective)?;
    let mut optimizer = AreaOptimizer::new(&mut evaluator, pair_search.index_pairs(), *area_settings)?;
    let area = optimizer.optimize(&pair_dt)?;

    Ok(DtSearchReport {
        success: area.success,
        message: area.message.clone(),
        initial_dt,
        pair_search,
        area: Some(area),
    })
}

/// Which dt-vector entries the outer optimizer may move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DtMask {
    All,
    /// Children stay at their starting magnitudes.
    GrandchildrenOnly,
}

impl DtMask {
    fn free_indices(self) -> std::ops::Range<usize> {
        match self {
            DtMask::All => 0..DT_LEN,
            DtMask::GrandchildrenOnly => CHILD_COUNT..DT_LEN,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectiveReport {
    pub dt: DtVector,
    pub initial_value: f64,
    pub value: f64,
    pub evaluations: usize,
    pub converged: bool,
    pub message: String,
}

/// Nelder-Mead over the free entries of the dt-vector, clipped to `bounds`.
pub fn minimize_objective<O: DtObjective + ?Sized>(
    objective: &mut O,
    x0: &DtVector,
    bounds: (f64, f64),
    mask: DtMask,
    settings: &MinimizeSettings,
) -> Result<ObjectiveReport> {
    let start = x0.clamped(bounds);
    let free = mask.free_indices();
    let box_bounds = BoxBounds::uniform(free.len(), bounds.0, bounds.1)?;
    let initial_value = objective.evaluate(&start);

    let base = start.to_vec();
    let assemble = |y: &[f64]| -> Vec<f64> {
        let mut full = base.clone();
        full[free.clone()].copy_from_slice(y);
        full
    };
    let report = nelder_mead(
        |y: &[f64]| {
            DtVector::from_slice(&assemble(y)).map_or(f64::NAN, |dt| objective.evaluate(&dt))
        },
        &base[free.clone()],
        Some(&box_bounds),
        settings,
    )?;

    let dt = DtVector::from_slice(&assemble(&report.x))?;
    info!(
        initial_value,
        value = report.value,
        evaluations = report.evaluations,
        ?mask,
        "dt-vector objective minimized"
    );
    Ok(ObjectiveReport {
        dt,
        initial_value,
        value: report.value,
        evaluations: report.evaluations,
        converged: report.converged,
        message: report.message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::TreeAreaEvaluator;
    use crate::config::AreaObjective;
    use crate::pendulum::Pendulum;
    use crate::soft_assignment::{
        DynamicLossConfig, DynamicLossObjective, SinkhornConfig, SoftPairingObjective, UniversalLossConfig,
    };

    /// Squared distance to a fixed magnitude per entry.
    struct Target([f64; DT_LEN]);

    impl DtObjective for Target {
        fn evaluate(&mut self, dt: &DtVector) -> f64 {
            dt.as_slice().iter().zip(&self.0).map(|(a, b)| (a - b).powi(2)).sum()
        }
    }

    #[test]
    fn grandchildren_mask_keeps_children_fixed() {
        let mut target = Target([0.05; DT_LEN]);
        let x0 = DtVector::uniform(0.1, 0.01);
        let settings = MinimizeSettings {
            max_iterations: 4000,
            ..MinimizeSettings::default()
        };
        let report = minimize_objective(&mut target, &x0, (0.001, 0.2), DtMask::GrandchildrenOnly, &settings)
            .expect("minimize");
        assert_eq!(report.dt.children(), x0.children());
        assert!(report.value < report.initial_value);
        assert!(report.dt.grandchildren().iter().all(|&v| (v - 0.05).abs() < 1e-3));
    }

    #[test]
    fn all_mask_respects_bounds() {
        let mut target = Target([0.5; DT_LEN]);
        let x0 = DtVector::uniform(0.1, 0.01);
        let report =
            minimize_objective(&mut target, &x0, (0.001, 0.2), DtMask::All, &MinimizeSettings::default()).expect("minimize");
        assert!(report.dt.as_slice().iter().all(|&v| (0.001..=0.2).contains(&v)));
        assert!(report.value < report.initial_value);
    }

    #[test]
    fn soft_loss_drives_the_outer_search() {
        let pendulum = Pendulum::default();
        let config = TreeConfig::default();
        let dt = config.default_dt_vector();
        let mut evaluator = TreeAreaEvaluator::new(&pendulum, config, AreaObjective::Quadrilateral);
        evaluator.build(&dt).expect("build");
        let mut objective =
            SoftPairingObjective::new(evaluator, UniversalLossConfig::default(), SinkhornConfig::default(), true)
                .expect("objective");
        let bounds = objective.dt_bounds();
        let settings = MinimizeSettings {
            max_iterations: 60,
            ..MinimizeSettings::default()
        };
        let report =
            minimize_objective(&mut objective, &dt, bounds, DtMask::GrandchildrenOnly, &settings).expect("minimize");
        assert!(report.value <= report.initial_value);
        assert_eq!(report.dt.children(), dt.children());
    }

    #[test]
    fn dynamic_loss_drives_grandchildren_only_search() {
        let config = TreeConfig::default();
        let dt = config.default_dt_vector();
        let mut evaluator = TreeAreaEvaluator::new(Pendulum::default(), config, AreaObjective::Quadrilateral);
        evaluator.build(&dt).expect("build");
        let mut objective = DynamicLossObjective::new(evaluator, DynamicLossConfig::default()).expect("objective");
        let bounds = objective.dt_bounds();
        let settings = MinimizeSettings {
            max_iterations: 80,
            ..MinimizeSettings::default()
        };
        let report =
            minimize_objective(&mut objective, &dt, bounds, DtMask::GrandchildrenOnly, &settings).expect("minimize");
        assert!(report.value <= report.initial_value);
        assert_eq!(report.dt.children(), dt.children());
        assert!(report.dt.grandchildren().iter().all(|&v| bounds.0 <= v && v <= bounds.1));
    }

    #[test]
    fn pair_search_returns_disjoint_foreign_pairs() {
        let pendulum = Pendulum::default();
        let mut tree = SporeTree::auto(&pendulum, TreeConfig::default()).expect("tree");
        tree.sort_and_pair().expect("sorted");
        let report = find_optimal_pairs(&tree, &PairSearchSettings::default()).expect("pair search");

        assert!(!report.approaching_pairs.is_empty());
        for p in &report.approaching_pairs {
            assert!(!tree.grandchildren()[p.gc_i].is_sibling_of(&tree.grandchildren()[p.gc_j]));
        }
        let mut seen = [false; 8];
        for (i, j) in report.index_pairs() {
            assert!(!seen[i] && !seen[j]);
            seen[i] = true;
            seen[j] = true;
        }
        assert_eq!(report.success, !report.extraction.pairs.is_empty());
        assert_eq!(report.statistics.same_parent_pairs, 0);
        for (g, gc) in tree.grandchildren().iter().enumerate() {
            let written = report.dt_from_pairs.dt.grandchildren()[g];
            if report.dt_from_pairs.pair_mapping[g].is_none() {
                assert_eq!(written, gc.magnitude());
            }
        }
    }

    #[test]
    fn invalid_settings_are_errors() {
        let pendulum = Pendulum::default();
        let tree = SporeTree::auto(&pendulum, TreeConfig::default()).expect("tree");
        let settings = PairSearchSettings {
            min_dt: -1.0,
            ..PairSearchSettings::default()
        };
        assert!(find_optimal_pairs(&tree, &settings).is_err());
    }
}
