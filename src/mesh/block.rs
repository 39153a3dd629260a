//! The unit of data ownership: one rectangular sub-grid of the mesh.

use crate::geometry::{BoundaryConds, LogicalLocation, RegionSize};
use crate::mesh::neighbors::NeighborBlock;
use crate::physics::BlockPhysics;
use crate::task::TaskState;
use crate::NGHOST;

/// One leaf of the block tree, owned by exactly one rank. Carries the cell
/// index windows, the neighbor table, per-step task bookkeeping, and the
/// opaque physics modules.
pub struct MeshBlock {
    pub gid: usize,
    /// Index within this rank's block list (`gid - nbstart`).
    pub lid: usize,
    pub loc: LogicalLocation,
    pub block_size: RegionSize,
    pub block_bcs: BoundaryConds,
    pub cost: f64,

    /// Interior cell window, ghost-inclusive array indexing.
    pub is: usize,
    pub ie: usize,
    pub js: usize,
    pub je: usize,
    pub ks: usize,
    pub ke: usize,

    /// Coarsened window used for multilevel prolongation; zeroed when the
    /// mesh is single-level.
    pub cis: usize,
    pub cie: usize,
    pub cjs: usize,
    pub cje: usize,
    pub cks: usize,
    pub cke: usize,
    pub cnghost: usize,

    pub neighbors: Vec<NeighborBlock>,
    /// Level of the neighbor in direction `(i-1, j-1, k-1)`, indexed
    /// `[k][j][i]`; -1 where no neighbor exists. Center is this block.
    pub nblevel: [[[i32; 3]; 3]; 3],
    /// Which of this block's receive slots have been consumed this exchange.
    pub recv_done: Vec<bool>,

    /// Timestep proposed by the last per-block CFL evaluation.
    pub new_block_dt: f64,
    pub tasks: TaskState,

    /// Refinement request for the next cycle: -1 derefine, 0 keep, +1 refine.
    pub refine_flag: i32,
    /// Hint describing which neighbors forced the flag; carried through the
    /// refinement gathers for diagnostics.
    pub neighbor_rflag: i32,

    pub physics: Box<dyn BlockPhysics>,
}

impl MeshBlock {
    pub fn new(
        gid: usize,
        lid: usize,
        loc: LogicalLocation,
        block_size: RegionSize,
        block_bcs: BoundaryConds,
        multilevel: bool,
        physics: Box<dyn BlockPhysics>,
    ) -> Self {
        let is = NGHOST;
        let ie = is + block_size.nx1 - 1;
        let (js, je) = if block_size.nx2 > 1 {
            (NGHOST, NGHOST + block_size.nx2 - 1)
        } else {
            (0, 0)
        };
        let (ks, ke) = if block_size.nx3 > 1 {
            (NGHOST, NGHOST + block_size.nx3 - 1)
        } else {
            (0, 0)
        };

        let mut block = Self {
            gid,
            lid,
            loc,
            block_size,
            block_bcs,
            cost: 1.0,
            is,
            ie,
            js,
            je,
            ks,
            ke,
            cis: 0,
            cie: 0,
            cjs: 0,
            cje: 0,
            cks: 0,
            cke: 0,
            cnghost: 0,
            neighbors: Vec::new(),
            nblevel: [[[-1; 3]; 3]; 3],
            recv_done: Vec::new(),
            new_block_dt: f64::MAX * 0.4,
            tasks: TaskState::default(),
            refine_flag: 0,
            neighbor_rflag: 0,
            physics,
        };

        if multilevel {
            block.cnghost = (NGHOST + 1) / 2 + 1;
            block.cis = block.cnghost;
            block.cie = block.cis + block_size.nx1 / 2 - 1;
            if block_size.nx2 > 1 {
                block.cjs = block.cnghost;
                block.cje = block.cjs + block_size.nx2 / 2 - 1;
            }
            if block_size.nx3 > 1 {
                block.cks = block.cnghost;
                block.cke = block.cks + block_size.nx3 / 2 - 1;
            }
        }

        block
    }

    /// Size in bytes of this block's record in a restart file: extents,
    /// boundary tags, then the physics payload.
    pub fn restart_len(&self) -> usize {
        crate::mesh::checkpoint::REGION_SIZE_LEN + 6 * 4 + self.physics.payload_len()
    }

    /// Arms every receive slot for a fresh boundary exchange.
    pub fn arm_receives(&mut self) {
        self.recv_done.clear();
        self.recv_done.resize(self.neighbors.len(), false);
    }

    /// Clears exchange bookkeeping once a step or initialization completes.
    pub fn clear_receives(&mut self) {
        self.recv_done.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::AdvectionState;

    fn block_size(nx: [usize; 3]) -> RegionSize {
        RegionSize {
            nx1: nx[0],
            nx2: nx[1],
            nx3: nx[2],
            ..RegionSize::default()
        }
    }

    #[test]
    fn index_windows_follow_dimensionality() {
        let size = block_size([8, 8, 1]);
        let physics = Box::new(AdvectionState::new(&size, 1, [1.0, 0.0, 0.0], false));
        let block = MeshBlock::new(
            0,
            0,
            LogicalLocation::default(),
            size,
            BoundaryConds::default(),
            true,
            physics,
        );
        assert_eq!((block.is, block.ie), (NGHOST, NGHOST + 7));
        assert_eq!((block.js, block.je), (NGHOST, NGHOST + 7));
        assert_eq!((block.ks, block.ke), (0, 0));
        // Coarse window spans half the interior with the narrow ghost rim.
        assert_eq!(block.cnghost, (NGHOST + 1) / 2 + 1);
        assert_eq!((block.cis, block.cie), (block.cnghost, block.cnghost + 3));
        assert_eq!((block.cks, block.cke), (0, 0));
    }
}
