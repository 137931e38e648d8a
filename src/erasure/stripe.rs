//! Fragment placement across backends
//!
//! A stripe is the k+m fragments derived from one file. Fragments are mapped
//! onto the placement's backends round-robin, wrapping when there are more
//! fragments than backends.

use std::collections::HashMap;

use crate::backend::BackendId;
use crate::error::{Error, Result};

/// Plans which backend holds which fragment of a stripe
#[derive(Debug, Clone)]
pub struct StripePlanner {
    /// Number of data fragments (K)
    data_fragments: usize,

    /// Total fragments (K + M)
    total_fragments: usize,
}

impl StripePlanner {
    /// Create a new stripe planner
    pub fn new(data_fragments: usize, total_fragments: usize) -> Self {
        StripePlanner {
            data_fragments,
            total_fragments,
        }
    }

    /// Get the number of data fragments
    pub fn data_fragments(&self) -> usize {
        self.data_fragments
    }

    /// Get the total number of fragments
    pub fn total_fragments(&self) -> usize {
        self.total_fragments
    }

    /// Round-robin assignment of every fragment index over the placement
    ///
    /// Entry `i` of the result is the backend for fragment `i`.
    pub fn assign_round_robin(&self, placement: &[BackendId]) -> Result<Vec<BackendId>> {
        if placement.is_empty() {
            return Err(Error::InvalidConfig(
                "cannot place fragments on an empty backend list".to_string(),
            ));
        }

        Ok((0..self.total_fragments)
            .map(|i| placement[i % placement.len()].clone())
            .collect())
    }

    /// Calculate where fragments should move when a backend rejects them
    ///
    /// # Arguments
    /// * `assignments` - Current (fragment index, backend) pairs
    /// * `failed` - Backend that can no longer hold fragments
    /// * `available` - Candidate backends, in preference order
    ///
    /// # Returns
    /// Map of fragment index -> new backend for fragments that must move.
    /// Empty when no other backend is available.
    pub fn plan_relocation(
        &self,
        assignments: &[(usize, BackendId)],
        failed: &BackendId,
        available: &[BackendId],
    ) -> HashMap<usize, BackendId> {
        let mut relocations = HashMap::new();

        let affected: Vec<usize> = assignments
            .iter()
            .filter(|(_, backend)| backend == failed)
            .map(|(index, _)| *index)
            .collect();

        let remaining: Vec<&BackendId> = available.iter().filter(|id| *id != failed).collect();

        if remaining.is_empty() {
            return relocations;
        }

        for (i, index) in affected.iter().enumerate() {
            relocations.insert(*index, remaining[i % remaining.len()].clone());
        }

        relocations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<BackendId> {
        names.iter().map(|n| BackendId::from(*n)).collect()
    }

    #[test]
    fn test_round_robin_wraps() {
        let planner = StripePlanner::new(4, 6);
        let placement = ids(&["s3", "gcs", "azure"]);

        let assigned = planner.assign_round_robin(&placement).unwrap();

        // With 3 backends and 6 fragments: s3, gcs, azure, s3, gcs, azure
        assert_eq!(
            assigned,
            ids(&["s3", "gcs", "azure", "s3", "gcs", "azure"])
        );
    }

    #[test]
    fn test_round_robin_more_backends_than_fragments() {
        let planner = StripePlanner::new(1, 2);
        let placement = ids(&["a", "b", "c"]);

        let assigned = planner.assign_round_robin(&placement).unwrap();
        assert_eq!(assigned, ids(&["a", "b"]));
    }

    #[test]
    fn test_round_robin_empty_placement() {
        let planner = StripePlanner::new(2, 3);
        assert!(planner.assign_round_robin(&[]).is_err());
    }

    #[test]
    fn test_plan_relocation() {
        let planner = StripePlanner::new(2, 3);
        let assignments: Vec<(usize, BackendId)> = ids(&["a", "b", "a"])
            .into_iter()
            .enumerate()
            .collect();

        let plan = planner.plan_relocation(&assignments, &BackendId::from("a"), &ids(&["a", "b", "c"]));

        assert_eq!(plan.len(), 2);
        assert_eq!(plan[&0], BackendId::from("b"));
        assert_eq!(plan[&2], BackendId::from("c"));
        assert!(!plan.contains_key(&1));
    }

    #[test]
    fn test_plan_relocation_nowhere_to_go() {
        let planner = StripePlanner::new(2, 3);
        let assignments = vec![(0, BackendId::from("a"))];

        let plan = planner.plan_relocation(&assignments, &BackendId::from("a"), &ids(&["a"]));
        assert!(plan.is_empty());
    }

    #[test]
    fn test_accessors() {
        let planner = StripePlanner::new(3, 5);
        assert_eq!(planner.data_fragments(), 3);
        assert_eq!(planner.total_fragments(), 5);
    }
}
