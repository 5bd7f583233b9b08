use conduit_types::NodeId;
use parking_lot::Mutex;

use super::LoadBalanceAlgorithm;

/// Smooth weighted round robin.
///
/// Each round every active child gains its weight, the richest child is
/// picked and pays back the round's total. Over a full cycle each child is
/// picked in proportion to its weight, without bursts. A weight of 0 removes
/// the child from rotation.
#[derive(Debug)]
pub struct WeightedRoundRobin {
    weights: Vec<u32>,
    current: Mutex<Vec<i64>>,
}

impl WeightedRoundRobin {
    pub fn new(weights: Vec<u32>) -> Self {
        Self {
            weights,
            current: Mutex::new(Vec::new()),
        }
    }

    fn weight(&self, index: usize) -> i64 {
        i64::from(self.weights.get(index).copied().unwrap_or(1))
    }
}

impl LoadBalanceAlgorithm for WeightedRoundRobin {
    fn next(
        &self,
        children: &[NodeId],
        is_active: &mut dyn FnMut(NodeId) -> bool,
    ) -> Option<NodeId> {
        let mut current = self.current.lock();
        current.resize(children.len(), 0);

        let mut total = 0i64;
        let mut best: Option<usize> = None;
        for (index, child) in children.iter().enumerate() {
            let weight = self.weight(index);
            if weight == 0 || !is_active(*child) {
                continue;
            }
            current[index] += weight;
            total += weight;
            if best.map_or(true, |b| current[index] > current[b]) {
                best = Some(index);
            }
        }

        let best = best?;
        current[best] -= total;
        Some(children[best])
    }

    fn name(&self) -> &'static str {
        "weighted_round_robin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_distribution() {
        let algorithm = WeightedRoundRobin::new(vec![3, 1]);
        let children = vec![NodeId(10), NodeId(11)];

        let picks: Vec<_> = (0..8)
            .map(|_| algorithm.next(&children, &mut |_| true).unwrap())
            .collect();
        assert_eq!(picks.iter().filter(|id| **id == NodeId(10)).count(), 6);
        assert_eq!(picks.iter().filter(|id| **id == NodeId(11)).count(), 2);
        assert_eq!(&picks[..4], &[NodeId(10), NodeId(10), NodeId(11), NodeId(10)]);
    }

    #[test]
    fn test_zero_weight_and_inactive_are_skipped() {
        let algorithm = WeightedRoundRobin::new(vec![0, 2, 1]);
        let children = vec![NodeId(0), NodeId(1), NodeId(2)];

        for _ in 0..5 {
            let pick = algorithm.next(&children, &mut |id| id != NodeId(1));
            assert_eq!(pick, Some(NodeId(2)));
        }
        assert_eq!(algorithm.next(&children, &mut |_| false), None);
    }
}
