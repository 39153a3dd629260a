//! Neighbor descriptors and the canonical boundary-buffer numbering.
//!
//! Every exchange slot of a block is identified by a buffer id drawn from a
//! table built once per mesh from `(dim, multilevel, face_only)`. The table
//! enumeration and the id advancement in the discovery sweep below follow the
//! same canonical order, so the id a sender computes for its peer's slot
//! (`targetid`) always names the slot the peer armed for that direction.

use crate::geometry::{BlockTree, Face};
use crate::mesh::block::MeshBlock;

/// Classifies a neighbor by how it touches this block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NeighborKind {
    Face,
    Edge,
    Corner,
}

/// One entry of a block's neighbor table.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NeighborBlock {
    pub rank: usize,
    pub level: i32,
    pub gid: usize,
    pub lid: usize,
    pub ox1: i32,
    pub ox2: i32,
    pub ox3: i32,
    pub kind: NeighborKind,
    /// Receive slot on this block for data arriving from the neighbor.
    pub bufid: usize,
    /// Slot in the neighbor's numbering where our sends land.
    pub targetid: usize,
    /// Child indices of a finer neighbor along the tangential axes.
    pub fi1: i32,
    pub fi2: i32,
    /// Face index for fast dispatch when `kind == Face`.
    pub fid: Option<Face>,
    /// Edge index (0..12) when `kind == Edge`.
    pub eid: Option<u8>,
}

impl NeighborBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rank: usize,
        level: i32,
        gid: usize,
        lid: usize,
        ox1: i32,
        ox2: i32,
        ox3: i32,
        kind: NeighborKind,
        bufid: usize,
        targetid: usize,
        fi1: i32,
        fi2: i32,
    ) -> Self {
        let fid = (kind == NeighborKind::Face).then(|| match (ox1, ox2, ox3) {
            (-1, _, _) => Face::INNER_X1,
            (1, _, _) => Face::OUTER_X1,
            (_, -1, _) => Face::INNER_X2,
            (_, 1, _) => Face::OUTER_X2,
            (_, _, -1) => Face::INNER_X3,
            _ => Face::OUTER_X3,
        });
        let eid = (kind == NeighborKind::Edge).then(|| {
            if ox3 == 0 {
                (((ox1 + 1) >> 1) | ((ox2 + 1) & 2)) as u8
            } else if ox2 == 0 {
                4 + (((ox1 + 1) >> 1) | ((ox3 + 1) & 2)) as u8
            } else {
                8 + (((ox2 + 1) >> 1) | ((ox3 + 1) & 2)) as u8
            }
        });
        Self {
            rank,
            level,
            gid,
            lid,
            ox1,
            ox2,
            ox3,
            kind,
            bufid,
            targetid,
            fi1,
            fi2,
            fid,
            eid,
        }
    }
}

/// Canonical numbering of the boundary-buffer slots of a block. Opposite
/// directions match by construction: the slot for `(ox, fi)` on one side is
/// found from `(-ox, fi)` on the other.
#[derive(Clone, Debug)]
pub struct BufferTable {
    entries: Vec<(i32, i32, i32, i32, i32)>,
    nf1: usize,
    nf2: usize,
}

impl BufferTable {
    pub fn new(dim: usize, multilevel: bool, face_only: bool) -> Self {
        let nf1 = if multilevel && dim >= 2 { 2 } else { 1 };
        let nf2 = if multilevel && dim == 3 { 2 } else { 1 };
        let mut entries = Vec::new();

        // Faces reserve nf1*nf2 slots per direction.
        for n in [-1, 1] {
            for f2 in 0..nf2 as i32 {
                for f1 in 0..nf1 as i32 {
                    entries.push((n, 0, 0, f1, f2));
                }
            }
        }
        if dim >= 2 {
            for n in [-1, 1] {
                for f2 in 0..nf2 as i32 {
                    for f1 in 0..nf1 as i32 {
                        entries.push((0, n, 0, f1, f2));
                    }
                }
            }
        }
        if dim == 3 {
            for n in [-1, 1] {
                for f2 in 0..nf2 as i32 {
                    for f1 in 0..nf1 as i32 {
                        entries.push((0, 0, n, f1, f2));
                    }
                }
            }
        }

        if !face_only {
            for m in [-1, 1] {
                for n in [-1, 1] {
                    for f1 in 0..nf2 as i32 {
                        entries.push((n, m, 0, f1, 0));
                    }
                }
            }
            if dim == 3 {
                for m in [-1, 1] {
                    for n in [-1, 1] {
                        for f1 in 0..nf1 as i32 {
                            entries.push((n, 0, m, f1, 0));
                        }
                    }
                }
                for m in [-1, 1] {
                    for n in [-1, 1] {
                        for f1 in 0..nf1 as i32 {
                            entries.push((0, n, m, f1, 0));
                        }
                    }
                }
                for l in [-1, 1] {
                    for m in [-1, 1] {
                        for n in [-1, 1] {
                            entries.push((n, m, l, 0, 0));
                        }
                    }
                }
            }
        }

        Self { entries, nf1, nf2 }
    }

    /// Number of buffer slots (the `maxneighbor` bound of a block).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Slots reserved per face direction.
    pub fn face_width(&self) -> usize {
        self.nf1 * self.nf2
    }

    pub fn nf1(&self) -> usize {
        self.nf1
    }

    pub fn nf2(&self) -> usize {
        self.nf2
    }

    /// Canonical id of the slot for direction `(ox1, ox2, ox3)` and finer
    /// child `(fi1, fi2)`.
    pub fn find(&self, ox1: i32, ox2: i32, ox3: i32, fi1: i32, fi2: i32) -> usize {
        self.entries
            .iter()
            .position(|&e| e == (ox1, ox2, ox3, fi1, fi2))
            .expect("direction outside the canonical buffer table")
    }
}

/// Searches the tree for every face, edge, and corner neighbor of `block`
/// and rebuilds its neighbor table and 3x3x3 level map.
#[allow(clippy::too_many_arguments)]
pub fn search_and_set_neighbors(
    block: &mut MeshBlock,
    tree: &BlockTree,
    table: &BufferTable,
    ranklist: &[usize],
    nslist: &[usize],
    nrbx: [i64; 3],
    root_level: i32,
    face_only: bool,
) {
    let loc = block.loc;
    let bcs = block.block_bcs;
    let myfx1 = (loc.lx1 & 1) as i32;
    let myfx2 = (loc.lx2 & 1) as i32;
    let myfx3 = (loc.lx3 & 1) as i32;
    let myox1 = myfx1 * 2 - 1;
    let myox2 = if block.block_size.nx2 > 1 {
        myfx2 * 2 - 1
    } else {
        0
    };
    let myox3 = if block.block_size.nx3 > 1 {
        myfx3 * 2 - 1
    } else {
        0
    };

    let nf1 = table.nf1() as i32;
    let nf2 = table.nf2() as i32;
    let face_width = table.face_width();

    block.neighbors.clear();
    block.nblevel = [[[-1; 3]; 3]; 3];
    block.nblevel[1][1][1] = loc.level;

    let mut bufid = 0usize;

    let push = |block: &mut MeshBlock,
                leaf: usize,
                ox: (i32, i32, i32),
                kind: NeighborKind,
                bufid: usize,
                tbid: usize,
                fi: (i32, i32)| {
        let gid = tree.gid(leaf) as usize;
        let rank = ranklist[gid];
        block.neighbors.push(NeighborBlock::new(
            rank,
            tree.loc(leaf).level,
            gid,
            gid - nslist[rank],
            ox.0,
            ox.1,
            ox.2,
            kind,
            bufid,
            tbid,
            fi.0,
            fi.1,
        ));
    };

    // x1 faces
    for n in [-1i32, 1] {
        let Some(nb) = tree.find_neighbor(loc, n as i64, 0, 0, &bcs, nrbx, root_level) else {
            bufid += face_width;
            continue;
        };
        if !tree.is_leaf(nb) {
            let fface = if n < 0 { 1 } else { 0 };
            block.nblevel[1][1][(n + 1) as usize] = tree.loc(nb).level + 1;
            for f2 in 0..nf2 as i64 {
                for f1 in 0..nf1 as i64 {
                    let leaf = tree.get_leaf(nb, fface, f1, f2);
                    let tbid = table.find(-n, 0, 0, 0, 0);
                    push(
                        block,
                        leaf,
                        (n, 0, 0),
                        NeighborKind::Face,
                        bufid,
                        tbid,
                        (f1 as i32, f2 as i32),
                    );
                    bufid += 1;
                }
            }
        } else {
            let nlevel = tree.loc(nb).level;
            block.nblevel[1][1][(n + 1) as usize] = nlevel;
            let tbid = if nlevel == loc.level {
                table.find(-n, 0, 0, 0, 0)
            } else {
                table.find(-n, 0, 0, myfx2, myfx3)
            };
            push(block, nb, (n, 0, 0), NeighborKind::Face, bufid, tbid, (0, 0));
            bufid += face_width;
        }
    }

    if block.block_size.nx2 == 1 {
        block.arm_receives();
        return;
    }

    // x2 faces
    for n in [-1i32, 1] {
        let Some(nb) = tree.find_neighbor(loc, 0, n as i64, 0, &bcs, nrbx, root_level) else {
            bufid += face_width;
            continue;
        };
        if !tree.is_leaf(nb) {
            let fface = if n < 0 { 1 } else { 0 };
            block.nblevel[1][(n + 1) as usize][1] = tree.loc(nb).level + 1;
            for f2 in 0..nf2 as i64 {
                for f1 in 0..nf1 as i64 {
                    let leaf = tree.get_leaf(nb, f1, fface, f2);
                    let tbid = table.find(0, -n, 0, 0, 0);
                    push(
                        block,
                        leaf,
                        (0, n, 0),
                        NeighborKind::Face,
                        bufid,
                        tbid,
                        (f1 as i32, f2 as i32),
                    );
                    bufid += 1;
                }
            }
        } else {
            let nlevel = tree.loc(nb).level;
            block.nblevel[1][(n + 1) as usize][1] = nlevel;
            let tbid = if nlevel == loc.level {
                table.find(0, -n, 0, 0, 0)
            } else {
                table.find(0, -n, 0, myfx1, myfx3)
            };
            push(block, nb, (0, n, 0), NeighborKind::Face, bufid, tbid, (0, 0));
            bufid += face_width;
        }
    }

    // x3 faces
    if block.block_size.nx3 > 1 {
        for n in [-1i32, 1] {
            let Some(nb) = tree.find_neighbor(loc, 0, 0, n as i64, &bcs, nrbx, root_level) else {
                bufid += face_width;
                continue;
            };
            if !tree.is_leaf(nb) {
                let fface = if n < 0 { 1 } else { 0 };
                block.nblevel[(n + 1) as usize][1][1] = tree.loc(nb).level + 1;
                for f2 in 0..nf2 as i64 {
                    for f1 in 0..nf1 as i64 {
                        let leaf = tree.get_leaf(nb, f1, f2, fface);
                        let tbid = table.find(0, 0, -n, 0, 0);
                        push(
                            block,
                            leaf,
                            (0, 0, n),
                            NeighborKind::Face,
                            bufid,
                            tbid,
                            (f1 as i32, f2 as i32),
                        );
                        bufid += 1;
                    }
                }
            } else {
                let nlevel = tree.loc(nb).level;
                block.nblevel[(n + 1) as usize][1][1] = nlevel;
                let tbid = if nlevel == loc.level {
                    table.find(0, 0, -n, 0, 0)
                } else {
                    table.find(0, 0, -n, myfx1, myfx2)
                };
                push(block, nb, (0, 0, n), NeighborKind::Face, bufid, tbid, (0, 0));
                bufid += face_width;
            }
        }
    }

    if face_only {
        block.arm_receives();
        return;
    }

    // x1x2 edges
    for m in [-1i32, 1] {
        for n in [-1i32, 1] {
            let Some(nb) = tree.find_neighbor(loc, n as i64, m as i64, 0, &bcs, nrbx, root_level)
            else {
                bufid += nf2 as usize;
                continue;
            };
            if !tree.is_leaf(nb) {
                let ff1 = if n < 0 { 1 } else { 0 };
                let ff2 = if m < 0 { 1 } else { 0 };
                block.nblevel[1][(m + 1) as usize][(n + 1) as usize] = tree.loc(nb).level + 1;
                for f1 in 0..nf2 as i64 {
                    let leaf = tree.get_leaf(nb, ff1, ff2, f1);
                    let tbid = table.find(-n, -m, 0, 0, 0);
                    push(
                        block,
                        leaf,
                        (n, m, 0),
                        NeighborKind::Edge,
                        bufid,
                        tbid,
                        (f1 as i32, 0),
                    );
                    bufid += 1;
                }
            } else {
                let nlevel = tree.loc(nb).level;
                block.nblevel[1][(m + 1) as usize][(n + 1) as usize] = nlevel;
                let tbid = if nlevel == loc.level {
                    table.find(-n, -m, 0, 0, 0)
                } else {
                    table.find(-n, -m, 0, myfx3, 0)
                };
                // A coarser diagonal neighbor is packed only by the sibling
                // that actually touches it; everyone else skips the slot.
                if nlevel >= loc.level || (myox1 == n && myox2 == m) {
                    push(block, nb, (n, m, 0), NeighborKind::Edge, bufid, tbid, (0, 0));
                }
                bufid += nf2 as usize;
            }
        }
    }

    if block.block_size.nx3 == 1 {
        block.arm_receives();
        return;
    }

    // x1x3 edges
    for m in [-1i32, 1] {
        for n in [-1i32, 1] {
            let Some(nb) = tree.find_neighbor(loc, n as i64, 0, m as i64, &bcs, nrbx, root_level)
            else {
                bufid += nf1 as usize;
                continue;
            };
            if !tree.is_leaf(nb) {
                let ff1 = if n < 0 { 1 } else { 0 };
                let ff2 = if m < 0 { 1 } else { 0 };
                block.nblevel[(m + 1) as usize][1][(n + 1) as usize] = tree.loc(nb).level + 1;
                for f1 in 0..nf1 as i64 {
                    let leaf = tree.get_leaf(nb, ff1, f1, ff2);
                    let tbid = table.find(-n, 0, -m, 0, 0);
                    push(
                        block,
                        leaf,
                        (n, 0, m),
                        NeighborKind::Edge,
                        bufid,
                        tbid,
                        (f1 as i32, 0),
                    );
                    bufid += 1;
                }
            } else {
                let nlevel = tree.loc(nb).level;
                block.nblevel[(m + 1) as usize][1][(n + 1) as usize] = nlevel;
                let tbid = if nlevel == loc.level {
                    table.find(-n, 0, -m, 0, 0)
                } else {
                    table.find(-n, 0, -m, myfx2, 0)
                };
                if nlevel >= loc.level || (myox1 == n && myox3 == m) {
                    push(block, nb, (n, 0, m), NeighborKind::Edge, bufid, tbid, (0, 0));
                }
                bufid += nf1 as usize;
            }
        }
    }

    // x2x3 edges
    for m in [-1i32, 1] {
        for n in [-1i32, 1] {
            let Some(nb) = tree.find_neighbor(loc, 0, n as i64, m as i64, &bcs, nrbx, root_level)
            else {
                bufid += nf1 as usize;
                continue;
            };
            if !tree.is_leaf(nb) {
                let ff1 = if n < 0 { 1 } else { 0 };
                let ff2 = if m < 0 { 1 } else { 0 };
                block.nblevel[(m + 1) as usize][(n + 1) as usize][1] = tree.loc(nb).level + 1;
                for f1 in 0..nf1 as i64 {
                    let leaf = tree.get_leaf(nb, f1, ff1, ff2);
                    let tbid = table.find(0, -n, -m, 0, 0);
                    push(
                        block,
                        leaf,
                        (0, n, m),
                        NeighborKind::Edge,
                        bufid,
                        tbid,
                        (f1 as i32, 0),
                    );
                    bufid += 1;
                }
            } else {
                let nlevel = tree.loc(nb).level;
                block.nblevel[(m + 1) as usize][(n + 1) as usize][1] = nlevel;
                let tbid = if nlevel == loc.level {
                    table.find(0, -n, -m, 0, 0)
                } else {
                    table.find(0, -n, -m, myfx1, 0)
                };
                if nlevel >= loc.level || (myox2 == n && myox3 == m) {
                    push(block, nb, (0, n, m), NeighborKind::Edge, bufid, tbid, (0, 0));
                }
                bufid += nf1 as usize;
            }
        }
    }

    // corners
    for l in [-1i32, 1] {
        for m in [-1i32, 1] {
            for n in [-1i32, 1] {
                let Some(mut nb) =
                    tree.find_neighbor(loc, n as i64, m as i64, l as i64, &bcs, nrbx, root_level)
                else {
                    bufid += 1;
                    continue;
                };
                if !tree.is_leaf(nb) {
                    let ff1 = if n < 0 { 1 } else { 0 };
                    let ff2 = if m < 0 { 1 } else { 0 };
                    let ff3 = if l < 0 { 1 } else { 0 };
                    nb = tree.get_leaf(nb, ff1, ff2, ff3);
                }
                let nlevel = tree.loc(nb).level;
                block.nblevel[(l + 1) as usize][(m + 1) as usize][(n + 1) as usize] = nlevel;
                if nlevel >= loc.level || (myox1 == n && myox2 == m && myox3 == l) {
                    let tbid = table.find(-n, -m, -l, 0, 0);
                    push(
                        block,
                        nb,
                        (n, m, l),
                        NeighborKind::Corner,
                        bufid,
                        tbid,
                        (0, 0),
                    );
                }
                bufid += 1;
            }
        }
    }

    block.arm_receives();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_sizes_match_known_configurations() {
        // 3D multilevel with edges and corners: the classic 56-slot table.
        assert_eq!(BufferTable::new(3, true, false).len(), 56);
        // 3D single-level with edges and corners (field-carrying uniform run).
        assert_eq!(BufferTable::new(3, false, false).len(), 26);
        // Face-only exchanges.
        assert_eq!(BufferTable::new(3, false, true).len(), 6);
        assert_eq!(BufferTable::new(1, false, true).len(), 2);
        // 2D multilevel: 8 face slots plus the four diagonal corners.
        assert_eq!(BufferTable::new(2, true, false).len(), 12);
    }

    #[test]
    fn opposite_directions_pair_up() {
        let table = BufferTable::new(3, true, false);
        for (ox1, ox2, ox3) in [(1, 0, 0), (0, -1, 0), (1, 1, 0), (-1, 1, -1)] {
            let a = table.find(ox1, ox2, ox3, 0, 0);
            let b = table.find(-ox1, -ox2, -ox3, 0, 0);
            assert_ne!(a, b);
            // Both ids stay within the table bound.
            assert!(a < table.len() && b < table.len());
        }
    }
}
