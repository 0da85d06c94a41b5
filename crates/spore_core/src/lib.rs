pub mod area;
pub mod area_opt;
pub mod chronology;
pub mod config;
pub mod convergence;
pub mod dt_vector;
pub mod error;
pub mod minimize;
pub mod pair_optimizer;
pub mod pendulum;
pub mod pipeline;
pub mod soft_assignment;
pub mod solvers;
pub mod spore;
/// The `spore_core` crate grows two-level trees of controlled pendulum trajectories
/// and searches step sizes that make branches from different parents meet.
///
/// Key components:
/// - **Traits**: `StateTransition` (the controlled dynamics), `DtObjective` (losses over the dt-vector).
/// - **Tree**: `SporeTree` with fixed child/grandchild layout, angular sort and sibling-free pairing.
/// - **Pair search**: closing rates, per-pair step optimization, meeting chronology and greedy matching.
/// - **dt-vector optimization**: constrained area maximization, a Sinkhorn soft-pairing loss
///   and a softmin meeting-dynamics loss.
pub mod traits;
pub mod tree;

pub use config::{AreaObjective, AreaSettings, ChronologyOrder, PairSearchSettings, PendulumParams, TreeConfig};
pub use dt_vector::DtVector;
pub use error::TreeError;
pub use pendulum::{LinearizedPendulum, Pendulum};
pub use pipeline::{find_optimal_dt_vector, find_optimal_pairs, minimize_objective, DtMask};
pub use soft_assignment::{DynamicLossConfig, DynamicLossObjective, SoftPairingObjective};
pub use traits::{DtObjective, State, StateTransition};
pub use tree::SporeTree;
