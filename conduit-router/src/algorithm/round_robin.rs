use conduit_types::NodeId;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::LoadBalanceAlgorithm;

/// Cycles through children in order, skipping inactive ones
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalanceAlgorithm for RoundRobin {
    fn next(
        &self,
        children: &[NodeId],
        is_active: &mut dyn FnMut(NodeId) -> bool,
    ) -> Option<NodeId> {
        if children.is_empty() {
            return None;
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..children.len() {
            let child = children[start.wrapping_add(offset) % children.len()];
            if is_active(child) {
                if offset > 0 {
                    // the next caller starts after the child we skipped to
                    self.cursor.fetch_add(offset, Ordering::Relaxed);
                }
                return Some(child);
            }
        }
        None
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: u64) -> Vec<NodeId> {
        (0..n).map(NodeId).collect()
    }

    #[test]
    fn test_round_robin_visits_each_child_once() {
        let algorithm = RoundRobin::new();
        let children = ids(3);

        let picks: Vec<_> = (0..6)
            .map(|_| algorithm.next(&children, &mut |_| true).unwrap())
            .collect();
        assert_eq!(
            picks,
            vec![NodeId(0), NodeId(1), NodeId(2), NodeId(0), NodeId(1), NodeId(2)]
        );
    }

    #[test]
    fn test_round_robin_skips_inactive() {
        let algorithm = RoundRobin::new();
        let children = ids(3);
        let mut active = |id: NodeId| id != NodeId(1);

        let picks: Vec<_> = (0..4)
            .map(|_| algorithm.next(&children, &mut active).unwrap())
            .collect();
        assert_eq!(picks, vec![NodeId(0), NodeId(2), NodeId(0), NodeId(2)]);
    }

    #[test]
    fn test_round_robin_none_active() {
        let algorithm = RoundRobin::new();
        assert_eq!(algorithm.next(&ids(2), &mut |_| false), None);
        assert_eq!(algorithm.next(&[], &mut |_| true), None);
    }
}
