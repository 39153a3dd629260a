//! Geometric primitives shared by the mesh: logical block addresses in the
//! refinement hierarchy, physical region extents, and the six-face boundary
//! tagging of a rectangular domain.

mod tree;

pub use tree::{BlockTree, TreeNode, NONE};

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Names a block's position in the refinement tree.
///
/// `lx1`, `lx2`, `lx3` index the block within its level, each in
/// `[0, nrbx_d << (level - root_level))`. The virtual root of the tree sits at
/// level 0; physical root-grid blocks live at the mesh's root level.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct LogicalLocation {
    pub level: i32,
    pub lx1: i64,
    pub lx2: i64,
    pub lx3: i64,
}

impl LogicalLocation {
    pub fn new(level: i32, lx1: i64, lx2: i64, lx3: i64) -> Self {
        Self {
            level,
            lx1,
            lx2,
            lx3,
        }
    }

    /// Location of the parent block, one level coarser.
    pub fn parent(&self) -> Self {
        Self {
            level: self.level - 1,
            lx1: self.lx1 >> 1,
            lx2: self.lx2 >> 1,
            lx3: self.lx3 >> 1,
        }
    }

    /// Location of the child block in octant `(i, j, k)`, one level finer.
    pub fn child(&self, i: i64, j: i64, k: i64) -> Self {
        Self {
            level: self.level + 1,
            lx1: self.lx1 * 2 + i,
            lx2: self.lx2 * 2 + j,
            lx3: self.lx3 * 2 + k,
        }
    }

    /// Octant of this block within its parent, per axis.
    pub fn octant(&self) -> (i64, i64, i64) {
        (self.lx1 & 1, self.lx2 & 1, self.lx3 & 1)
    }

    /// Orders locations by refinement depth, finest first. Within a level the
    /// enumeration order of the tree already follows the space-filling curve,
    /// so ties are left unbroken.
    pub fn cmp_deeper_first(a: &Self, b: &Self) -> Ordering {
        b.level.cmp(&a.level)
    }
}

/// Physical extents, cell counts, and stretch ratios of a rectangular region.
/// Used both for the whole mesh and for a single block.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegionSize {
    pub x1min: f64,
    pub x2min: f64,
    pub x3min: f64,
    pub x1max: f64,
    pub x2max: f64,
    pub x3max: f64,
    pub x1rat: f64,
    pub x2rat: f64,
    pub x3rat: f64,
    pub nx1: usize,
    pub nx2: usize,
    pub nx3: usize,
}

impl RegionSize {
    /// Spatial dimensionality implied by the cell counts.
    pub fn dim(&self) -> usize {
        1 + (self.nx2 > 1) as usize + (self.nx3 > 1) as usize
    }

    /// Total number of cells in the region.
    pub fn cell_count(&self) -> u64 {
        self.nx1 as u64 * self.nx2 as u64 * self.nx3 as u64
    }
}

impl Default for RegionSize {
    fn default() -> Self {
        Self {
            x1min: 0.0,
            x2min: 0.0,
            x3min: 0.0,
            x1max: 1.0,
            x2max: 1.0,
            x3max: 1.0,
            x1rat: 1.0,
            x2rat: 1.0,
            x3rat: 1.0,
            nx1: 1,
            nx2: 1,
            nx3: 1,
        }
    }
}

/// One of the six faces of a block or of the mesh domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Face {
    /// Axis normal to the face (0, 1, or 2).
    pub axis: usize,
    /// False for the inner (low-coordinate) face, true for the outer.
    pub upper: bool,
}

impl Face {
    pub const INNER_X1: Face = Face::inner(0);
    pub const OUTER_X1: Face = Face::outer(0);
    pub const INNER_X2: Face = Face::inner(1);
    pub const OUTER_X2: Face = Face::outer(1);
    pub const INNER_X3: Face = Face::inner(2);
    pub const OUTER_X3: Face = Face::outer(2);

    pub const fn inner(axis: usize) -> Self {
        Self { axis, upper: false }
    }

    pub const fn outer(axis: usize) -> Self {
        Self { axis, upper: true }
    }

    /// Linear index in the conventional face order
    /// (inner x1, outer x1, inner x2, outer x2, inner x3, outer x3).
    pub const fn index(self) -> usize {
        self.axis * 2 + self.upper as usize
    }

    pub const fn opposite(self) -> Self {
        Self {
            axis: self.axis,
            upper: !self.upper,
        }
    }

    /// Iterates over all six faces in index order.
    pub fn enumerate() -> impl Iterator<Item = Face> {
        (0..3).flat_map(|axis| [Face::inner(axis), Face::outer(axis)])
    }
}

/// Kind of condition applied on a domain face, or the marker that the face is
/// interior and shared with another block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundaryTag {
    Internal,
    Reflecting,
    Outflow,
    User,
    Periodic,
    Polar,
}

impl BoundaryTag {
    /// Integer code used in input files and the restart format.
    pub fn code(self) -> i32 {
        match self {
            BoundaryTag::Internal => -1,
            BoundaryTag::Reflecting => 1,
            BoundaryTag::Outflow => 2,
            BoundaryTag::User => 3,
            BoundaryTag::Periodic => 4,
            BoundaryTag::Polar => 5,
        }
    }

    /// Parses an integer tag. Code 0 (unspecified) is accepted as outflow.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(BoundaryTag::Internal),
            0 | 2 => Some(BoundaryTag::Outflow),
            1 => Some(BoundaryTag::Reflecting),
            3 => Some(BoundaryTag::User),
            4 => Some(BoundaryTag::Periodic),
            5 => Some(BoundaryTag::Polar),
            _ => None,
        }
    }
}

/// Boundary tags for the six faces of a region, indexed by [`Face`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundaryConds([BoundaryTag; 6]);

impl BoundaryConds {
    pub fn uniform(tag: BoundaryTag) -> Self {
        Self([tag; 6])
    }

    pub fn from_tags(tags: [BoundaryTag; 6]) -> Self {
        Self(tags)
    }

    /// Integer codes in face-index order, as stored in restart files.
    pub fn codes(&self) -> [i32; 6] {
        let mut out = [0; 6];
        for (slot, tag) in out.iter_mut().zip(self.0.iter()) {
            *slot = tag.code();
        }
        out
    }

    pub fn from_codes(codes: [i32; 6]) -> Option<Self> {
        let mut tags = [BoundaryTag::Outflow; 6];
        for (slot, code) in tags.iter_mut().zip(codes.iter()) {
            *slot = BoundaryTag::from_code(*code)?;
        }
        Some(Self(tags))
    }
}

impl std::ops::Index<Face> for BoundaryConds {
    type Output = BoundaryTag;

    fn index(&self, face: Face) -> &BoundaryTag {
        &self.0[face.index()]
    }
}

impl std::ops::IndexMut<Face> for BoundaryConds {
    fn index_mut(&mut self, face: Face) -> &mut BoundaryTag {
        &mut self.0[face.index()]
    }
}

impl Default for BoundaryConds {
    fn default() -> Self {
        Self::uniform(BoundaryTag::Outflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_child_round_trip() {
        let loc = LogicalLocation::new(3, 5, 2, 7);
        let (i, j, k) = loc.octant();
        assert_eq!(loc.parent().child(i, j, k), loc);
    }

    #[test]
    fn face_indices_cover_range() {
        let indices: Vec<usize> = Face::enumerate().map(Face::index).collect();
        assert_eq!(indices, [0, 1, 2, 3, 4, 5]);
        assert_eq!(Face::INNER_X2.opposite(), Face::OUTER_X2);
    }

    #[test]
    fn boundary_codes_round_trip() {
        let mut bcs = BoundaryConds::uniform(BoundaryTag::Periodic);
        bcs[Face::INNER_X1] = BoundaryTag::Internal;
        bcs[Face::OUTER_X3] = BoundaryTag::Reflecting;
        assert_eq!(BoundaryConds::from_codes(bcs.codes()), Some(bcs));
    }
}
