//! Node selection strategies.

use rand::seq::SliceRandom;

use crate::storage::NodeRow;

/// Orders idle nodes by preference.
///
/// The allocator tries candidates in the returned order and stops once it
/// holds `n` of them, so a strategy should return every idle node rather
/// than just the first `n`: the tail is used when another worker wins a
/// node first.
pub trait SelectionStrategy: Send + Sync {
    fn select(&self, idle: &[NodeRow], n: usize) -> Vec<NodeRow>;
}

/// Uniformly random order.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSelection;

impl SelectionStrategy for RandomSelection {
    fn select(&self, idle: &[NodeRow], _n: usize) -> Vec<NodeRow> {
        let mut candidates = idle.to_vec();
        candidates.shuffle(&mut rand::rng());
        candidates
    }
}

/// Registry order (by name).
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderedSelection;

impl SelectionStrategy for OrderedSelection {
    fn select(&self, idle: &[NodeRow], _n: usize) -> Vec<NodeRow> {
        idle.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeRow {
        NodeRow {
            name: name.to_string(),
            status: "idle".to_string(),
            reserved_by: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn random_selection_keeps_every_candidate() {
        let idle = vec![node("a"), node("b"), node("c")];
        let mut names: Vec<_> = RandomSelection
            .select(&idle, 2)
            .into_iter()
            .map(|n| n.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
