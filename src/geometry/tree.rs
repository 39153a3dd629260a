//! Arena-backed octree of logical block locations.
//!
//! Nodes are addressed by index into a flat arena; children are stored inline
//! so downward traversals never chase pointers. The tree is quadtree in 2D and
//! binary in 1D, which falls out of the `dim` argument: unused axes simply
//! never set their octant bit. A virtual level-0 root owns the root grid,
//! whose real blocks live at the mesh's root level.

use super::{BoundaryConds, BoundaryTag, Face, LogicalLocation};
use serde::{Deserialize, Serialize};

/// Marks an absent child or a failed lookup.
pub const NONE: usize = usize::MAX;

/// One node of the block tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TreeNode {
    pub loc: LogicalLocation,
    /// Global id assigned during leaf enumeration; -1 for interior nodes.
    pub gid: i64,
    /// Child arena indices, laid out as `(k*2 + j)*2 + i`.
    children: [usize; 8],
    leaf: bool,
}

impl TreeNode {
    fn new(loc: LogicalLocation) -> Self {
        Self {
            loc,
            gid: -1,
            children: [NONE; 8],
            leaf: true,
        }
    }
}

const fn slot(i: i64, j: i64, k: i64) -> usize {
    ((k * 2 + j) * 2 + i) as usize
}

/// The logical refinement hierarchy of the whole mesh.
///
/// Collapsed subtrees leave tombstone nodes in the arena; they are
/// unreachable and reclaimed when the tree is rebuilt from a restart.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockTree {
    nodes: Vec<TreeNode>,
}

impl Default for BlockTree {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockTree {
    /// Creates a tree holding only the virtual root.
    pub fn new() -> Self {
        Self {
            nodes: vec![TreeNode::new(LogicalLocation::default())],
        }
    }

    pub fn root(&self) -> usize {
        0
    }

    pub fn loc(&self, node: usize) -> LogicalLocation {
        self.nodes[node].loc
    }

    pub fn gid(&self, node: usize) -> i64 {
        self.nodes[node].gid
    }

    pub fn is_leaf(&self, node: usize) -> bool {
        self.nodes[node].leaf
    }

    /// Descends one level into octant `(i, j, k)` of an interior node.
    pub fn get_leaf(&self, node: usize, i: i64, j: i64, k: i64) -> usize {
        self.nodes[node].children[slot(i, j, k)]
    }

    /// Builds the root grid: every node down to `root_level` whose subtree
    /// covers at least one of the `nrbx` root blocks. Axes with a single root
    /// block never branch, which pads the logical cube with absent children.
    pub fn create_root(&mut self, nrbx: [i64; 3], root_level: i32) {
        self.grow_root(0, nrbx, root_level);
    }

    fn grow_root(&mut self, node: usize, nrbx: [i64; 3], root_level: i32) {
        let loc = self.nodes[node].loc;
        if loc.level == root_level {
            return;
        }
        let shift = root_level - loc.level - 1;
        for k in 0..2_i64 {
            if (loc.lx3 * 2 + k) << shift >= nrbx[2] {
                continue;
            }
            for j in 0..2_i64 {
                if (loc.lx2 * 2 + j) << shift >= nrbx[1] {
                    continue;
                }
                for i in 0..2_i64 {
                    if (loc.lx1 * 2 + i) << shift >= nrbx[0] {
                        continue;
                    }
                    let child = self.push_child(node, i, j, k);
                    self.grow_root(child, nrbx, root_level);
                }
            }
        }
    }

    fn push_child(&mut self, node: usize, i: i64, j: i64, k: i64) -> usize {
        let loc = self.nodes[node].loc.child(i, j, k);
        let child = self.nodes.len();
        self.nodes.push(TreeNode::new(loc));
        self.nodes[node].leaf = false;
        self.nodes[node].children[slot(i, j, k)] = child;
        child
    }

    /// Splits a leaf into its complete set of `2^dim` children.
    pub fn split(&mut self, node: usize, dim: usize) {
        debug_assert!(self.nodes[node].leaf);
        let kmax = (dim == 3) as i64;
        let jmax = (dim >= 2) as i64;
        for k in 0..=kmax {
            for j in 0..=jmax {
                for i in 0..2_i64 {
                    self.push_child(node, i, j, k);
                }
            }
        }
    }

    /// Descends towards `loc`, splitting interior leaves on the way so that
    /// the target exists as a leaf. Sibling groups are always created whole.
    pub fn add_leaf(&mut self, loc: LogicalLocation, dim: usize) {
        let mut node = 0;
        while self.nodes[node].loc.level < loc.level {
            if self.nodes[node].leaf {
                self.split(node, dim);
            }
            let sh = loc.level - self.nodes[node].loc.level - 1;
            let i = (loc.lx1 >> sh) & 1;
            let j = (loc.lx2 >> sh) & 1;
            let k = (loc.lx3 >> sh) & 1;
            node = self.nodes[node].children[slot(i, j, k)];
            debug_assert!(node != NONE, "leaf target outside the root grid");
        }
    }

    /// Recreates a known leaf without ever splitting sibling groups: only the
    /// nodes on the descent path are created. Used when rebuilding the tree
    /// from a restart file, where every leaf is added explicitly.
    pub fn add_without_refine(&mut self, loc: LogicalLocation) {
        let mut node = 0;
        while self.nodes[node].loc.level < loc.level {
            let sh = loc.level - self.nodes[node].loc.level - 1;
            let i = (loc.lx1 >> sh) & 1;
            let j = (loc.lx2 >> sh) & 1;
            let k = (loc.lx3 >> sh) & 1;
            let child = self.nodes[node].children[slot(i, j, k)];
            node = if child == NONE {
                self.push_child(node, i, j, k)
            } else {
                child
            };
        }
    }

    /// Finds the node at exactly `loc`, if it exists.
    pub fn find_node(&self, loc: LogicalLocation) -> Option<usize> {
        let mut node = 0;
        while self.nodes[node].loc.level < loc.level {
            if self.nodes[node].leaf {
                return None;
            }
            let sh = loc.level - self.nodes[node].loc.level - 1;
            let i = (loc.lx1 >> sh) & 1;
            let j = (loc.lx2 >> sh) & 1;
            let k = (loc.lx3 >> sh) & 1;
            let child = self.nodes[node].children[slot(i, j, k)];
            if child == NONE {
                return None;
            }
            node = child;
        }
        (self.nodes[node].loc == loc).then_some(node)
    }

    /// Removes the children of the node at `loc`, turning it back into a
    /// leaf. Fails if any child has been refined further.
    pub fn collapse(&mut self, loc: LogicalLocation) -> bool {
        let Some(node) = self.find_node(loc) else {
            return false;
        };
        if self.nodes[node].leaf {
            return false;
        }
        for child in self.nodes[node].children {
            if child != NONE && !self.nodes[child].leaf {
                return false;
            }
        }
        self.nodes[node].children = [NONE; 8];
        self.nodes[node].leaf = true;
        self.nodes[node].gid = -1;
        true
    }

    /// Number of leaves reachable from the root.
    pub fn count_leaves(&self) -> usize {
        self.count_under(0)
    }

    fn count_under(&self, node: usize) -> usize {
        if self.nodes[node].leaf {
            return 1;
        }
        self.nodes[node]
            .children
            .iter()
            .filter(|&&c| c != NONE)
            .map(|&c| self.count_under(c))
            .sum()
    }

    /// Highest refinement level of any leaf under `node`.
    pub fn max_level_under(&self, node: usize) -> i32 {
        if self.nodes[node].leaf {
            return self.nodes[node].loc.level;
        }
        self.nodes[node]
            .children
            .iter()
            .filter(|&&c| c != NONE)
            .map(|&c| self.max_level_under(c))
            .max()
            .unwrap_or(self.nodes[node].loc.level)
    }

    /// Emits all leaves in Morton order (octants traversed x1-fastest) and
    /// assigns each leaf its global id in that order.
    pub fn enumerate_leaves(&mut self) -> Vec<LogicalLocation> {
        let mut list = Vec::with_capacity(self.count_leaves());
        self.enumerate_under(0, &mut list);
        list
    }

    fn enumerate_under(&mut self, node: usize, list: &mut Vec<LogicalLocation>) {
        if self.nodes[node].leaf {
            self.nodes[node].gid = list.len() as i64;
            list.push(self.nodes[node].loc);
            return;
        }
        for child in self.nodes[node].children {
            if child != NONE {
                self.enumerate_under(child, list);
            }
        }
    }

    /// Looks up the neighbor of `loc` in direction `(ox1, ox2, ox3)`.
    ///
    /// Returns `None` across a non-connecting domain face. Periodic faces
    /// wrap modulo the level-local extent; polar x2 faces map the azimuthal
    /// index halfway around the domain. The returned node is a leaf at an
    /// equal or coarser level, or an interior node whose children are the
    /// finer neighbors.
    pub fn find_neighbor(
        &self,
        loc: LogicalLocation,
        ox1: i64,
        ox2: i64,
        ox3: i64,
        bcs: &BoundaryConds,
        nrbx: [i64; 3],
        root_level: i32,
    ) -> Option<usize> {
        let ll = loc.level;
        let d = ll - root_level;
        let w1 = nrbx[0] << d;
        let w2 = nrbx[1] << d;
        let w3 = nrbx[2] << d;

        let mut lx1 = loc.lx1 + ox1;
        let mut lx2 = loc.lx2 + ox2;
        let mut lx3 = loc.lx3 + ox3;

        if lx1 < 0 {
            match bcs[Face::INNER_X1] {
                BoundaryTag::Periodic => lx1 = w1 - 1,
                _ => return None,
            }
        }
        if lx1 >= w1 {
            match bcs[Face::OUTER_X1] {
                BoundaryTag::Periodic => lx1 = 0,
                _ => return None,
            }
        }
        if lx2 < 0 {
            match bcs[Face::INNER_X2] {
                BoundaryTag::Periodic => lx2 = w2 - 1,
                BoundaryTag::Polar => {
                    lx2 = 0;
                    lx3 = (lx3 + w3 / 2).rem_euclid(w3);
                }
                _ => return None,
            }
        }
        if lx2 >= w2 {
            match bcs[Face::OUTER_X2] {
                BoundaryTag::Periodic => lx2 = 0,
                BoundaryTag::Polar => {
                    lx2 = w2 - 1;
                    lx3 = (lx3 + w3 / 2).rem_euclid(w3);
                }
                _ => return None,
            }
        }
        if lx3 < 0 {
            match bcs[Face::INNER_X3] {
                BoundaryTag::Periodic => lx3 = w3 - 1,
                _ => return None,
            }
        }
        if lx3 >= w3 {
            match bcs[Face::OUTER_X3] {
                BoundaryTag::Periodic => lx3 = 0,
                _ => return None,
            }
        }

        let mut node = 0;
        for step in 0..ll {
            if self.nodes[node].leaf {
                // Coarser neighbor found partway down.
                return Some(node);
            }
            let sh = ll - step - 1;
            let i = (lx1 >> sh) & 1;
            let j = (lx2 >> sh) & 1;
            let k = (lx3 >> sh) & 1;
            let child = self.nodes[node].children[slot(i, j, k)];
            if child == NONE {
                return None;
            }
            node = child;
        }
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BoundaryTag;

    fn periodic() -> BoundaryConds {
        BoundaryConds::uniform(BoundaryTag::Periodic)
    }

    #[test]
    fn root_grid_counts() {
        // 4 x 4 x 1 root blocks at root level 2.
        let mut tree = BlockTree::new();
        tree.create_root([4, 4, 1], 2);
        assert_eq!(tree.count_leaves(), 16);

        // Non-square grid pads the unused region with absent nodes.
        let mut tree = BlockTree::new();
        tree.create_root([4, 2, 1], 2);
        assert_eq!(tree.count_leaves(), 8);
    }

    #[test]
    fn enumeration_is_morton_ordered() {
        let mut tree = BlockTree::new();
        tree.create_root([2, 2, 1], 1);
        let leaves = tree.enumerate_leaves();
        let coords: Vec<(i64, i64)> = leaves.iter().map(|l| (l.lx1, l.lx2)).collect();
        assert_eq!(coords, [(0, 0), (1, 0), (0, 1), (1, 1)]);
        for (gid, loc) in leaves.iter().enumerate() {
            let node = tree.find_node(*loc).unwrap();
            assert_eq!(tree.gid(node), gid as i64);
        }
    }

    #[test]
    fn add_leaf_splits_whole_sibling_groups() {
        let mut tree = BlockTree::new();
        tree.create_root([4, 4, 1], 2);
        tree.add_leaf(LogicalLocation::new(3, 2, 2, 0), 2);
        // One root leaf replaced by four children.
        assert_eq!(tree.count_leaves(), 19);
    }

    #[test]
    fn neighbor_wraps_on_periodic_faces() {
        let mut tree = BlockTree::new();
        tree.create_root([4, 4, 1], 2);
        let loc = LogicalLocation::new(2, 0, 1, 0);

        let n = tree
            .find_neighbor(loc, -1, 0, 0, &periodic(), [4, 4, 1], 2)
            .unwrap();
        assert_eq!(tree.loc(n), LogicalLocation::new(2, 3, 1, 0));

        let outflow = BoundaryConds::uniform(BoundaryTag::Outflow);
        assert!(tree
            .find_neighbor(loc, -1, 0, 0, &outflow, [4, 4, 1], 2)
            .is_none());
    }

    #[test]
    fn neighbor_across_refinement_levels() {
        let mut tree = BlockTree::new();
        tree.create_root([2, 2, 1], 1);
        tree.add_leaf(LogicalLocation::new(2, 0, 0, 0), 2);
        tree.enumerate_leaves();

        // Coarse block looking at the refined block sees the interior node.
        let coarse = LogicalLocation::new(1, 1, 0, 0);
        let n = tree
            .find_neighbor(coarse, -1, 0, 0, &periodic(), [2, 2, 1], 1)
            .unwrap();
        assert!(!tree.is_leaf(n));

        // A fine leaf looking outward sees the coarse leaf.
        let fine = LogicalLocation::new(2, 1, 0, 0);
        let n = tree
            .find_neighbor(fine, 1, 0, 0, &periodic(), [2, 2, 1], 1)
            .unwrap();
        assert!(tree.is_leaf(n));
        assert_eq!(tree.loc(n), coarse);
    }

    #[test]
    fn collapse_requires_leaf_children() {
        let mut tree = BlockTree::new();
        tree.create_root([2, 2, 1], 1);
        tree.add_leaf(LogicalLocation::new(3, 0, 0, 0), 2);
        // Parent of the level-3 group collapses, but its own parent cannot.
        assert!(!tree.collapse(LogicalLocation::new(1, 0, 0, 0)));
        assert!(tree.collapse(LogicalLocation::new(2, 0, 0, 0)));
        assert!(tree.collapse(LogicalLocation::new(1, 0, 0, 0)));
        assert_eq!(tree.count_leaves(), 4);
    }
}
