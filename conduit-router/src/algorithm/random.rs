use conduit_types::NodeId;
use rand::seq::SliceRandom;

use super::LoadBalanceAlgorithm;

/// Uniform choice among the active children
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSelection;

impl LoadBalanceAlgorithm for RandomSelection {
    fn next(
        &self,
        children: &[NodeId],
        is_active: &mut dyn FnMut(NodeId) -> bool,
    ) -> Option<NodeId> {
        let active: Vec<NodeId> = children.iter().copied().filter(|c| is_active(*c)).collect();
        active.choose(&mut rand::thread_rng()).copied()
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_only_picks_active() {
        let children = vec![NodeId(0), NodeId(1), NodeId(2)];
        for _ in 0..50 {
            let pick = RandomSelection.next(&children, &mut |id| id != NodeId(1));
            assert!(matches!(pick, Some(NodeId(0)) | Some(NodeId(2))));
        }
        assert_eq!(RandomSelection.next(&children, &mut |_| false), None);
    }
}
