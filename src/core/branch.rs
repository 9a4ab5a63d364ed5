//! Branch bookkeeping: the tree of competing chains the validator tracks.
//!
//! A branch is a run of consecutive blocks stored under one id. Every
//! branch except the root forks off a block of its parent branch. A block
//! is addressed by `(branch, index)`; its height is the branch's start
//! height plus the index.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::core::params::MAX_BRANCH_CACHE;

pub type BranchId = u8;

/// Location of a stored block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockLocation {
    pub branch: BranchId,
    pub index: u32,
}

impl BlockLocation {
    pub fn new(branch: BranchId, index: u32) -> Self {
        BlockLocation { branch, index }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub num_blocks: u32,
    pub start_height: u32,
    /// Meaningless for a branch starting at height 0
    pub parent_branch: BranchId,
    /// Index in the parent branch of the block this branch builds on
    pub parent_block_index: u32,
    /// Time of the first block of the current retarget period
    pub last_retarget_time: u32,
    /// Highest index whose block passed complete validation
    pub last_validation: Option<u32>,
    /// Cumulative work up to the tip; persisted separately
    #[serde(skip)]
    pub work: BigUint,
}

impl Branch {
    pub fn root(genesis_time: u32) -> Self {
        Branch {
            num_blocks: 0,
            start_height: 0,
            parent_branch: 0,
            parent_block_index: 0,
            last_retarget_time: genesis_time,
            last_validation: None,
            work: BigUint::default(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.start_height == 0
    }

    pub fn height_of(&self, index: u32) -> u32 {
        self.start_height + index
    }

    /// Height the next block appended to this branch would get.
    pub fn next_height(&self) -> u32 {
        self.start_height + self.num_blocks
    }

    pub fn tip_index(&self) -> Option<u32> {
        self.num_blocks.checked_sub(1)
    }

    pub fn tip_height(&self) -> Option<u32> {
        self.tip_index().map(|i| self.height_of(i))
    }

    pub fn is_validated(&self, index: u32) -> bool {
        self.last_validation.map_or(false, |v| index <= v)
    }
}

/// Fixed set of branch slots.
pub type Branches = [Option<Branch>; MAX_BRANCH_CACHE];

/// One hop of a chain path: blocks `0..=end_index` of `branch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainSegment {
    pub branch: BranchId,
    pub end_index: u32,
}

/// Segments leading from the root to `location`, root first.
pub fn chain_path(branches: &Branches, location: BlockLocation) -> Vec<ChainSegment> {
    let mut path = vec![ChainSegment { branch: location.branch, end_index: location.index }];
    let mut current = location.branch;
    while let Some(branch) = branches[current as usize].as_ref() {
        if branch.is_root() || path.len() > MAX_BRANCH_CACHE {
            break;
        }
        path.push(ChainSegment { branch: branch.parent_branch, end_index: branch.parent_block_index });
        current = branch.parent_branch;
    }
    path.reverse();
    path
}

/// The highest block two chain paths share, with its height.
pub fn common_point(branches: &Branches, a: &[ChainSegment], b: &[ChainSegment]) -> Option<(BlockLocation, u32)> {
    let shared = a.iter().zip(b).take_while(|(x, y)| x.branch == y.branch).count();
    let k = shared.checked_sub(1)?;
    let branch = a[k].branch;
    let index = a[k].end_index.min(b[k].end_index);
    let height = branches[branch as usize].as_ref()?.height_of(index);
    Some((BlockLocation::new(branch, index), height))
}

/// The block immediately before `location`, crossing into the parent branch.
pub fn previous_location(branches: &Branches, location: BlockLocation) -> Option<BlockLocation> {
    if location.index > 0 {
        return Some(BlockLocation::new(location.branch, location.index - 1));
    }
    let branch = branches[location.branch as usize].as_ref()?;
    if branch.is_root() {
        return None;
    }
    Some(BlockLocation::new(branch.parent_branch, branch.parent_block_index))
}

/// The ancestor of `location` (inclusive) at `height`.
pub fn ancestor_at_height(branches: &Branches, location: BlockLocation, height: u32) -> Option<BlockLocation> {
    for segment in chain_path(branches, location).iter().rev() {
        let branch = branches[segment.branch as usize].as_ref()?;
        if height >= branch.start_height && height <= branch.height_of(segment.end_index) {
            return Some(BlockLocation::new(segment.branch, height - branch.start_height));
        }
    }
    None
}

/// Ids of branches forking directly off `parent`.
pub fn dependents(branches: &Branches, parent: BranchId) -> Vec<BranchId> {
    branches
        .iter()
        .enumerate()
        .filter_map(|(id, b)| {
            let b = b.as_ref()?;
            (!b.is_root() && b.parent_branch == parent && id as BranchId != parent).then_some(id as BranchId)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch(num_blocks: u32, start_height: u32, parent_branch: BranchId, parent_block_index: u32) -> Branch {
        Branch { num_blocks, start_height, parent_branch, parent_block_index, ..Branch::root(0) }
    }

    /// 0: heights 0..=9; 1 forks at 0:5 (heights 6..=8); 2 forks at 1:1 (heights 8..=9)
    fn tree() -> Branches {
        [Some(branch(10, 0, 0, 0)), Some(branch(3, 6, 0, 5)), Some(branch(2, 8, 1, 1)), None, None]
    }

    #[test]
    fn test_chain_path() {
        let b = tree();
        let path = chain_path(&b, BlockLocation::new(2, 1));
        assert_eq!(
            path,
            vec![
                ChainSegment { branch: 0, end_index: 5 },
                ChainSegment { branch: 1, end_index: 1 },
                ChainSegment { branch: 2, end_index: 1 },
            ]
        );
    }

    #[test]
    fn test_common_point() {
        let b = tree();
        let main = chain_path(&b, BlockLocation::new(0, 9));
        let side = chain_path(&b, BlockLocation::new(2, 1));
        assert_eq!(common_point(&b, &main, &side), Some((BlockLocation::new(0, 5), 5)));

        let sibling = chain_path(&b, BlockLocation::new(1, 2));
        assert_eq!(common_point(&b, &side, &sibling), Some((BlockLocation::new(1, 1), 7)));
    }

    #[test]
    fn test_previous_and_ancestor() {
        let b = tree();
        assert_eq!(previous_location(&b, BlockLocation::new(1, 0)), Some(BlockLocation::new(0, 5)));
        assert_eq!(previous_location(&b, BlockLocation::new(0, 0)), None);
        assert_eq!(ancestor_at_height(&b, BlockLocation::new(2, 1), 7), Some(BlockLocation::new(1, 1)));
        assert_eq!(ancestor_at_height(&b, BlockLocation::new(2, 1), 3), Some(BlockLocation::new(0, 3)));
        assert_eq!(ancestor_at_height(&b, BlockLocation::new(2, 1), 10), None);
    }

    #[test]
    fn test_dependents() {
        let b = tree();
        assert_eq!(dependents(&b, 0), vec![1]);
        assert_eq!(dependents(&b, 1), vec![2]);
        assert!(dependents(&b, 2).is_empty());
    }
}
