use thiserror::Error;

/// Internal-consistency failures of the spore tree.
///
/// These signal a bug in the sort/pair logic or a caller breaking the tree's
/// lifecycle, not a data problem, and are never corrected silently.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TreeError {
    #[error(
        "pair {pair} joins grandchildren from the same parent {parent}: \
         slot {first_slot} = {first_name} (parent {parent}), \
         slot {second_slot} = {second_name} (parent {second_parent})"
    )]
    SameParentPair {
        pair: usize,
        first_slot: usize,
        second_slot: usize,
        first_name: String,
        second_name: String,
        parent: usize,
        second_parent: usize,
    },

    #[error("pair {pair} needs slots {first_slot} and {second_slot}, but only {available} grandchildren exist")]
    InsufficientGrandchildren {
        pair: usize,
        first_slot: usize,
        second_slot: usize,
        available: usize,
    },

    #[error("dt-vector needs {expected} entries, got {got}")]
    WrongLength { expected: usize, got: usize },

    #[error("dt magnitude at index {index} must be positive and finite, got {value}")]
    InvalidMagnitude { index: usize, value: f64 },

    #[error("{name} would flip its time direction: fixed sign {expected_sign:+}, proposed dt {proposed}")]
    DirectionFlip {
        name: String,
        expected_sign: i8,
        proposed: f64,
    },

    #[error("grandchildren must be sorted with sort_and_pair before {operation}")]
    NotSorted { operation: &'static str },

    #[error("tree topology is frozen; rebuilding after the first dt-vector is not allowed")]
    TopologyFrozen,
}

#[cfg(test)]
mod tests {
    use super::TreeError;

    #[test]
    fn same_parent_message_carries_full_context() {
        let err = TreeError::SameParentPair {
            pair: 2,
            first_slot: 4,
            second_slot: 5,
            first_name: "gc_1_0_forward".to_string(),
            second_name: "gc_1_1_backward".to_string(),
            parent: 1,
            second_parent: 1,
        };
        let message = err.to_string();
        assert!(message.contains("pair 2"));
        assert!(message.contains("slot 4 = gc_1_0_forward"));
        assert!(message.contains("slot 5 = gc_1_1_backward"));
    }

    #[test]
    fn direction_flip_shows_sign() {
        let err = TreeError::DirectionFlip {
            name: "gc_0_1_backward".to_string(),
            expected_sign: -1,
            proposed: 0.02,
        };
        assert!(err.to_string().contains("fixed sign -1"));
    }
}
