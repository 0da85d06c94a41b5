//! Meeting chronology and greedy pair extraction.
//!
//! Successful pair searches are collected into `MeetingTables`, turned into a
//! per-grandchild list of `Meeting`s ordered by time or quality, and matched
//! one-to-one by `extract_pairs`.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ChronologyOrder;
use crate::dt_vector::{DtVector, CHILD_COUNT, DT_LEN};
use crate::error::TreeError;
use crate::pair_optimizer::{PairOptimization, ParentOptimization};
use crate::spore::{Direction, Spore};

const QUALITY_EPS: f64 = 1e-8;

/// Optimized distances and signed times, NaN where no meeting was found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeetingTables {
    /// Symmetric `n × n` grandchild distances.
    pub gc_distance: DMatrix<f64>,
    /// `[i, j]`: step of `i` when meeting `j`.
    pub gc_time_self: DMatrix<f64>,
    /// `[i, j]`: step of `j` when meeting `i`.
    pub gc_time_partner: DMatrix<f64>,
    /// `n × n_children` grandchild-to-parent distances.
    pub parent_distance: DMatrix<f64>,
    pub parent_time: DMatrix<f64>,
}

impl MeetingTables {
    pub fn new(n_grandchildren: usize, n_children: usize) -> Self {
        let square = DMatrix::from_element(n_grandchildren, n_grandchildren, f64::NAN);
        let rect = DMatrix::from_element(n_grandchildren, n_children, f64::NAN);
        Self {
            gc_distance: square.clone(),
            gc_time_self: square.clone(),
            gc_time_partner: square,
            parent_distance: rect.clone(),
            parent_time: rect,
        }
    }

    /// Fills only successful searches.
    pub fn from_results(
        n_grandchildren: usize,
        n_children: usize,
        pairs: &[PairOptimization],
        parents: &[ParentOptimization],
    ) -> Self {
        let mut tables = Self::new(n_grandchildren, n_children);
        for r in pairs.iter().filter(|r| r.success) {
            let (i, j) = (r.gc_i, r.gc_j);
            tables.gc_distance[(i, j)] = r.min_distance;
            tables.gc_distance[(j, i)] = r.min_distance;
            tables.gc_time_self[(i, j)] = r.optimal_dt_i;
            tables.gc_time_partner[(i, j)] = r.optimal_dt_j;
            tables.gc_time_self[(j, i)] = r.optimal_dt_j;
            tables.gc_time_partner[(j, i)] = r.optimal_dt_i;
        }
        for r in parents.iter().filter(|r| r.success) {
            tables.parent_distance[(r.gc, r.parent)] = r.min_distance;
            tables.parent_time[(r.gc, r.parent)] = r.optimal_dt;
        }
        tables
    }

    pub fn filled_grandchild_cells(&self) -> usize {
        self.gc_distance.iter().filter(|d| !d.is_nan()).count() / 2
    }

    pub fn filled_parent_cells(&self) -> usize {
        self.parent_distance.iter().filter(|d| !d.is_nan()).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Partner {
    Grandchild(usize),
    /// A foreign child, fixed in place.
    Parent(usize),
}

/// Side with the longer travel time, which reaches the meeting last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Waiter {
    Own,
    Partner,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Meeting {
    pub partner: Partner,
    pub distance: f64,
    /// Signed step of the grandchild owning this chronology.
    pub time_self: f64,
    /// Signed step of a grandchild partner; `None` for parents.
    pub time_partner: Option<f64>,
    /// `max(|time_self|, |time_partner|)`, or `|time_self|` for parents.
    pub meeting_time: f64,
    pub who_waits: Option<Waiter>,
    /// `1 / (distance + 1e-8)`.
    pub quality: f64,
    pub closing_rate: f64,
}

impl Meeting {
    pub fn is_grandchild(&self) -> bool {
        matches!(self.partner, Partner::Grandchild(_))
    }
}

/// Per-grandchild meetings, indexed by global index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chronology {
    pub order: ChronologyOrder,
    pub meetings: Vec<Vec<Meeting>>,
}

impl Chronology {
    /// Assembles each grandchild's meetings with other grandchildren and foreign parents.
    ///
    /// `gc_rates` and `parent_rates` are the closing-rate matrices the meetings were
    /// searched from. Sorting is stable, so equal keys keep grandchild meetings (by
    /// index) ahead of parent meetings.
    pub fn build(
        tables: &MeetingTables,
        gc_rates: &DMatrix<f64>,
        parent_rates: &DMatrix<f64>,
        grandchildren: &[Spore],
        order: ChronologyOrder,
    ) -> Self {
        let n = grandchildren.len();
        let n_parents = tables.parent_distance.ncols();
        let mut meetings = Vec::with_capacity(n);

        for (g, gc) in grandchildren.iter().enumerate() {
            let mut list = Vec::new();
            for other in (0..n).filter(|&o| o != g) {
                let distance = tables.gc_distance[(g, other)];
                if distance.is_nan() {
                    continue;
                }
                let t_self = tables.gc_time_self[(g, other)];
                let t_partner = tables.gc_time_partner[(g, other)];
                list.push(Meeting {
                    partner: Partner::Grandchild(other),
                    distance,
                    time_self: t_self,
                    time_partner: Some(t_partner),
                    meeting_time: t_self.abs().max(t_partner.abs()),
                    who_waits: Some(if t_self.abs() > t_partner.abs() {
                        Waiter::Own
                    } else {
                        Waiter::Partner
                    }),
                    quality: 1.0 / (distance + QUALITY_EPS),
                    closing_rate: gc_rates[(g, other)],
                });
            }
            for p in 0..n_parents {
                if gc.parent_idx == Some(p) {
                    continue;
                }
                let distance = tables.parent_distance[(g, p)];
                if distance.is_nan() {
                    continue;
                }
                let t_self = tables.parent_time[(g, p)];
                list.push(Meeting {
                    partner: Partner::Parent(p),
                    distance,
                    time_self: t_self,
                    time_partner: None,
                    meeting_time: t_self.abs(),
                    who_waits: None,
                    quality: 1.0 / (distance + QUALITY_EPS),
                    closing_rate: parent_rates[(g, p)],
                });
            }

            match order {
                ChronologyOrder::ByTime => list.sort_by(|a, b| a.meeting_time.total_cmp(&b.meeting_time)),
                ChronologyOrder::ByQuality => list.sort_by(|a, b| b.quality.total_cmp(&a.quality)),
            }
            meetings.push(list);
        }

        let chronology = Self { order, meetings };
        debug!(
            grandchild_meetings = chronology.grandchild_meeting_count(),
            parent_meetings = chronology.parent_meeting_count(),
            "chronology built"
        );
        chronology
    }

    /// Unique grandchild-grandchild meetings (each appears in two lists).
    pub fn grandchild_meeting_count(&self) -> usize {
        self.meetings
            .iter()
            .map(|list| list.iter().filter(|m| m.is_grandchild()).count())
            .sum::<usize>()
            / 2
    }

    pub fn parent_meeting_count(&self) -> usize {
        self.meetings
            .iter()
            .map(|list| list.iter().filter(|m| !m.is_grandchild()).count())
            .sum()
    }

    pub fn grandchildren_with_meetings(&self) -> usize {
        self.meetings.iter().filter(|list| !list.is_empty()).count()
    }

    /// First entry of each non-empty chronology.
    pub fn first_meetings(&self) -> Vec<(usize, Meeting)> {
        self.meetings
            .iter()
            .enumerate()
            .filter_map(|(g, list)| list.first().map(|m| (g, *m)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.meetings.iter().all(Vec::is_empty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchedPair {
    pub gc_i: usize,
    pub gc_j: usize,
    /// Taken from `gc_i`'s chronology.
    pub meeting: Meeting,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairExtraction {
    pub pairs: Vec<MatchedPair>,
    pub unmatched: Vec<usize>,
}

/// Greedy one-to-one matching over the chronology.
///
/// Grandchildren are visited in index order and skipped once used. Scanning a
/// chronology, a free grandchild partner closer than `ultra_close` is taken at
/// once; a foreign parent closer than `ultra_close` ends the scan with the best
/// free grandchild seen before it. An exhausted scan commits to the best free
/// grandchild seen overall, if any.
pub fn extract_pairs(chronology: &Chronology, ultra_close: f64) -> PairExtraction {
    let n = chronology.meetings.len();
    let mut used = vec![false; n];
    let mut pairs = Vec::new();

    for g in 0..n {
        if used[g] {
            continue;
        }
        let mut best: Option<&Meeting> = None;
        let mut selected: Option<&Meeting> = None;

        for meeting in &chronology.meetings[g] {
            match meeting.partner {
                Partner::Grandchild(partner) => {
                    if partner >= n || partner == g || used[partner] {
                        continue;
                    }
                    if best.map_or(true, |b| meeting.distance < b.distance) {
                        best = Some(meeting);
                    }
                    if meeting.distance < ultra_close {
                        selected = Some(meeting);
                        break;
                    }
                }
                Partner::Parent(_) => {
                    if meeting.distance < ultra_close {
                        selected = best;
                        break;
                    }
                }
            }
        }

        if let Some(meeting) = selected.or(best) {
            if let Partner::Grandchild(partner) = meeting.partner {
                used[g] = true;
                used[partner] = true;
                pairs.push(MatchedPair {
                    gc_i: g,
                    gc_j: partner,
                    meeting: *meeting,
                });
            }
        }
    }

    let unmatched: Vec<usize> = (0..n).filter(|&g| !used[g]).collect();
    info!(pairs = pairs.len(), unmatched = unmatched.len(), "pairs extracted");
    PairExtraction { pairs, unmatched }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PairSlot {
    pub pair_idx: usize,
    pub partner: usize,
    pub optimal_dt: f64,
    pub original_dt: f64,
    pub meeting_distance: f64,
    pub meeting_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DtFromPairs {
    pub dt: DtVector,
    /// Indexed by grandchild; `None` for unpaired ones.
    pub pair_mapping: Vec<Option<PairSlot>>,
    pub unpaired: Vec<usize>,
}

/// Writes each pair's meeting steps into the grandchild part of `current`.
///
/// Children magnitudes and unpaired grandchildren keep their current values.
pub fn optimal_dt_from_pairs(
    pairs: &[MatchedPair],
    grandchildren: &[Spore],
    current: &DtVector,
) -> Result<DtFromPairs, TreeError> {
    let mut values = current.to_vec();
    let mut pair_mapping: Vec<Option<PairSlot>> = vec![None; grandchildren.len()];

    for (pair_idx, pair) in pairs.iter().enumerate() {
        let time_j = pair.meeting.time_partner.unwrap_or(f64::NAN);
        for (own, partner, dt) in [
            (pair.gc_i, pair.gc_j, pair.meeting.time_self),
            (pair.gc_j, pair.gc_i, time_j),
        ] {
            let gc = &grandchildren[own];
            if Direction::of(dt) != gc.direction() || dt == 0.0 {
                return Err(TreeError::DirectionFlip {
                    name: gc.name.clone(),
                    expected_sign: gc.direction().sign() as i8,
                    proposed: dt,
                });
            }
            let slot = CHILD_COUNT + own;
            if slot < DT_LEN {
                values[slot] = dt.abs();
            }
            pair_mapping[own] = Some(PairSlot {
                pair_idx,
                partner,
                optimal_dt: dt,
                original_dt: gc.dt,
                meeting_distance: pair.meeting.distance,
                meeting_time: pair.meeting.meeting_time,
            });
        }
    }

    let unpaired = pair_mapping
        .iter()
        .enumerate()
        .filter_map(|(g, slot)| slot.is_none().then_some(g))
        .collect();
    Ok(DtFromPairs {
        dt: DtVector::from_slice(&values)?,
        pair_mapping,
        unpaired,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PairDetail {
    pub pair_idx: usize,
    pub gc_i: usize,
    pub gc_j: usize,
    pub direction_i: Direction,
    pub direction_j: Direction,
    pub parent_i: Option<usize>,
    pub parent_j: Option<usize>,
    pub meeting_time: f64,
    pub distance: f64,
    pub time_i: f64,
    pub time_j: Option<f64>,
    pub who_waits: Option<Waiter>,
    pub same_parent: bool,
    /// Distance relative to the closest pair of children.
    pub distance_ratio: f64,
    /// Distance under a tenth of the closest children distance.
    pub passes_distance_check: bool,
}

pub fn pair_details(pairs: &[MatchedPair], grandchildren: &[Spore], children: &[Spore]) -> Vec<PairDetail> {
    let mut min_parent_distance = f64::INFINITY;
    for (a, ca) in children.iter().enumerate() {
        for cb in &children[a + 1..] {
            min_parent_distance = min_parent_distance.min((ca.position - cb.position).norm());
        }
    }
    let threshold = min_parent_distance / 10.0;

    pairs
        .iter()
        .enumerate()
        .map(|(pair_idx, pair)| {
            let gi = &grandchildren[pair.gc_i];
            let gj = &grandchildren[pair.gc_j];
            PairDetail {
                pair_idx,
                gc_i: pair.gc_i,
                gc_j: pair.gc_j,
                direction_i: gi.direction(),
                direction_j: gj.direction(),
                parent_i: gi.parent_idx,
                parent_j: gj.parent_idx,
                meeting_time: pair.meeting.meeting_time,
                distance: pair.meeting.distance,
                time_i: pair.meeting.time_self,
                time_j: pair.meeting.time_partner,
                who_waits: pair.meeting.who_waits,
                same_parent: gi.is_sibling_of(gj),
                distance_ratio: pair.meeting.distance / min_parent_distance,
                passes_distance_check: pair.meeting.distance < threshold,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PairStatistics {
    pub total_pairs: usize,
    pub same_parent_pairs: usize,
    pub different_parent_pairs: usize,
    pub forward_forward_pairs: usize,
    pub backward_backward_pairs: usize,
    pub forward_backward_pairs: usize,
    pub mean_meeting_time: f64,
    pub min_meeting_time: f64,
    pub max_meeting_time: f64,
    pub mean_distance: f64,
    pub min_distance: f64,
    pub max_distance: f64,
}

pub fn pair_statistics(details: &[PairDetail]) -> PairStatistics {
    if details.is_empty() {
        return PairStatistics::default();
    }
    let mut stats = PairStatistics {
        total_pairs: details.len(),
        min_meeting_time: f64::INFINITY,
        min_distance: f64::INFINITY,
        ..PairStatistics::default()
    };
    for d in details {
        if d.same_parent {
            stats.same_parent_pairs += 1;
        } else {
            stats.different_parent_pairs += 1;
        }
        match (d.direction_i, d.direction_j) {
            (Direction::Forward, Direction::Forward) => stats.forward_forward_pairs += 1,
            (Direction::Backward, Direction::Backward) => stats.backward_backward_pairs += 1,
            _ => stats.forward_backward_pairs += 1,
        }
        stats.mean_meeting_time += d.meeting_time;
        stats.mean_distance += d.distance;
        stats.min_meeting_time = stats.min_meeting_time.min(d.meeting_time);
        stats.max_meeting_time = stats.max_meeting_time.max(d.meeting_time);
        stats.min_distance = stats.min_distance.min(d.distance);
        stats.max_distance = stats.max_distance.max(d.distance);
    }
    let count = details.len() as f64;
    stats.mean_meeting_time /= count;
    stats.mean_distance /= count;
    stats
}
