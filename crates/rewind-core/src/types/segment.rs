//! Visibility segments produced by ancestry resolution.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{BranchId, Turn, TurnId};

/// A `(branch, max turn index)` pair bounding which turns are readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisibilitySegment {
    pub branch_id: BranchId,
    /// Inclusive upper bound; `-1` means nothing on this branch is visible.
    pub max_turn_index: i64,
}

impl VisibilitySegment {
    pub fn new(branch_id: BranchId, max_turn_index: i64) -> Self {
        Self {
            branch_id,
            max_turn_index,
        }
    }

    /// Whether `(branch_id, index)` falls inside this segment.
    pub fn covers(&self, branch_id: BranchId, index: i64) -> bool {
        self.branch_id == branch_id && index <= self.max_turn_index
    }
}

/// A committed turn inside the resolved segments, with its shadowing rank.
///
/// Lower rank wins: earlier segments first, then higher index within a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisibleTurn {
    pub turn_id: TurnId,
    pub branch_id: BranchId,
    pub index: i64,
    pub rank: u32,
}

/// Resolved visibility for one read: the segment chain and the committed
/// turns it admits, ordered by rank.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VisibleTurns {
    segments: Vec<VisibilitySegment>,
    turns: Vec<VisibleTurn>,
    ranks: HashMap<TurnId, u32>,
}

impl VisibleTurns {
    /// Rank `committed` turns against `segments`.
    ///
    /// Turns that are not committed or fall outside every segment are dropped.
    pub fn new(segments: Vec<VisibilitySegment>, committed: &[Turn]) -> Self {
        let mut turns: Vec<(usize, VisibleTurn)> = committed
            .iter()
            .filter(|t| t.is_committed())
            .filter_map(|t| {
                segments
                    .iter()
                    .position(|s| s.covers(t.branch_id, t.index))
                    .map(|pos| {
                        (
                            pos,
                            VisibleTurn {
                                turn_id: t.id,
                                branch_id: t.branch_id,
                                index: t.index,
                                rank: 0,
                            },
                        )
                    })
            })
            .collect();

        turns.sort_by(|(pa, a), (pb, b)| pa.cmp(pb).then(b.index.cmp(&a.index)));

        let turns: Vec<VisibleTurn> = turns
            .into_iter()
            .enumerate()
            .map(|(rank, (_, mut t))| {
                t.rank = rank as u32;
                t
            })
            .collect();
        let ranks = turns.iter().map(|t| (t.turn_id, t.rank)).collect();

        Self {
            segments,
            turns,
            ranks,
        }
    }

    pub fn segments(&self) -> &[VisibilitySegment] {
        &self.segments
    }

    /// Visible committed turns, best rank first.
    pub fn turns(&self) -> &[VisibleTurn] {
        &self.turns
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Shadowing rank of a turn, `None` if it is not visible.
    pub fn rank_of(&self, turn_id: TurnId) -> Option<u32> {
        self.ranks.get(&turn_id).copied()
    }

    pub fn contains(&self, turn_id: TurnId) -> bool {
        self.ranks.contains_key(&turn_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TurnStatus;
    use chrono::Utc;

    fn turn(id: i64, branch: i64, index: i64, status: TurnStatus) -> Turn {
        Turn {
            id: TurnId(id),
            branch_id: BranchId(branch),
            index,
            status,
            created_at: Utc::now(),
            ended_at: None,
            message: None,
            metadata: Default::default(),
        }
    }

    #[test]
    fn test_ranks_follow_segment_order_then_index() {
        let segments = vec![
            VisibilitySegment::new(BranchId(2), 1),
            VisibilitySegment::new(BranchId(1), 0),
        ];
        let committed = vec![
            turn(1, 1, 0, TurnStatus::Committed),
            turn(2, 1, 1, TurnStatus::Committed),
            turn(3, 2, 0, TurnStatus::Committed),
            turn(4, 2, 1, TurnStatus::Committed),
        ];

        let visible = VisibleTurns::new(segments, &committed);

        assert_eq!(visible.len(), 3);
        assert_eq!(visible.rank_of(TurnId(4)), Some(0));
        assert_eq!(visible.rank_of(TurnId(3)), Some(1));
        assert_eq!(visible.rank_of(TurnId(1)), Some(2));
        // Parent turn past the fork point.
        assert!(!visible.contains(TurnId(2)));
    }

    #[test]
    fn test_drops_uncommitted_turns() {
        let segments = vec![VisibilitySegment::new(BranchId(1), 5)];
        let committed = vec![
            turn(1, 1, 0, TurnStatus::Reverted),
            turn(2, 1, 1, TurnStatus::Staged),
        ];
        let visible = VisibleTurns::new(segments, &committed);
        assert!(visible.is_empty());
    }
}
