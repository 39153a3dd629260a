//! The refinement cycle: collect per-block refine/derefine requests, mutate
//! the tree, repartition, and rebuild the local block list.
//!
//! Refinement always wins over derefinement: flagged leaves are split first,
//! and a derefinement candidate is accepted only if its complete sibling
//! group is flagged, none of the siblings was refined this cycle, and the
//! collapse would not create a two-level jump across any face. Rejected
//! candidates simply stay refined; nothing is reported.

use super::{BuildMode, Mesh, ResFlag};
use crate::comm::Communicator;
use crate::geometry::LogicalLocation;
use crate::mesh::balance::balance_load;
use crate::mesh::block::MeshBlock;
use crate::mesh::Mailbox;
use crate::physics::{BlockPhysics, PhysicsFactory};
use log::info;
use std::collections::HashMap;

fn octant_index(loc: &LogicalLocation) -> u8 {
    (((loc.lx3 & 1) << 2) | ((loc.lx2 & 1) << 1) | (loc.lx1 & 1)) as u8
}

fn wait_payload(mailbox: &mut Mailbox, comm: &dyn Communicator, gid: usize, sub: u8) -> Vec<u8> {
    loop {
        if let Some(bytes) = mailbox.take_payload(gid, sub) {
            return bytes;
        }
        mailbox.pump_blocking(comm);
    }
}

fn payload_of(physics: &dyn BlockPhysics) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(physics.payload_len());
    physics
        .write_payload(&mut bytes)
        .expect("serializing block payload to memory");
    bytes
}

impl Mesh {
    /// Octant offsets of a complete sibling group for this dimensionality,
    /// x1 fastest (the enumeration order of the tree).
    fn sibling_offsets(&self) -> Vec<(i64, i64, i64)> {
        let dim = self.dim();
        let jmax = (dim >= 2) as i64;
        let kmax = (dim == 3) as i64;
        let mut offsets = Vec::new();
        for k in 0..=kmax {
            for j in 0..=jmax {
                for i in 0..2 {
                    offsets.push((i, j, k));
                }
            }
        }
        offsets
    }

    /// Runs one refinement cycle from the blocks' `refine_flag`s. Returns
    /// true when the tree changed.
    pub fn refine_mesh(&mut self, factory: &dyn PhysicsFactory) -> bool {
        let ctx = self.context();
        let dim = self.dim();
        let minbl = 1usize << dim;
        let cfg = bincode::config::standard();

        // Collect and share the per-rank flag counts.
        let mut lref: Vec<(LogicalLocation, i32)> = Vec::new();
        let mut lderef: Vec<LogicalLocation> = Vec::new();
        for block in &self.blocks {
            if block.refine_flag == 1 && block.loc.level < self.max_level {
                lref.push((block.loc, block.neighbor_rflag));
            }
            if block.refine_flag == -1 {
                lderef.push(block.loc);
            }
        }
        let counts = self
            .comm()
            .all_gather(bincode::encode_to_vec(&(lref.len() as u64, lderef.len() as u64), cfg).unwrap());
        let mut tnref = 0usize;
        let mut tnderef = 0usize;
        for bytes in &counts {
            let ((nref, nderef), _): ((u64, u64), _) =
                bincode::decode_from_slice(bytes, cfg).unwrap();
            tnref += nref as usize;
            tnderef += nderef as usize;
        }

        if ctx.is_coordinator() {
            info!("{tnref} blocks need to be refined, and {tnderef} blocks can be derefined");
        }
        if tnref == 0 && tnderef <= minbl {
            return false;
        }

        // Share the flagged locations (and refine hints) in rank order,
        // which is global Morton order.
        let encode_locs = |locs: &Vec<(LogicalLocation, i32)>| {
            bincode::encode_to_vec(locs, cfg).expect("encoding refinement locations")
        };
        let gathered = self.comm().all_gather(encode_locs(&lref));
        let mut all_ref: Vec<(LogicalLocation, i32)> = Vec::with_capacity(tnref);
        for bytes in gathered {
            let (mut locs, _): (Vec<(LogicalLocation, i32)>, _) =
                bincode::decode_from_slice(&bytes, cfg).unwrap();
            all_ref.append(&mut locs);
        }
        let gathered = self
            .comm()
            .all_gather(bincode::encode_to_vec(&lderef, cfg).unwrap());
        let mut all_deref: Vec<LogicalLocation> = Vec::with_capacity(tnderef);
        for bytes in gathered {
            let (mut locs, _): (Vec<LogicalLocation>, _) =
                bincode::decode_from_slice(&bytes, cfg).unwrap();
            all_deref.append(&mut locs);
        }

        // Filter derefinement candidates down to complete sibling groups.
        let offsets = self.sibling_offsets();
        let mut clderef: Vec<LogicalLocation> = Vec::new();
        if tnderef > minbl {
            for n in 0..all_deref.len() {
                let base = all_deref[n];
                if octant_index(&base) != 0 {
                    continue;
                }
                // Siblings are contiguous in the gathered Morton order.
                let complete = offsets.iter().skip(1).enumerate().all(|(s, &(i, j, k))| {
                    all_deref.get(n + 1 + s).is_some_and(|c| {
                        c.level == base.level
                            && c.lx1 == base.lx1 + i
                            && c.lx2 == base.lx2 + j
                            && c.lx3 == base.lx3 + k
                    })
                });
                if complete && base.level > self.root_level {
                    clderef.push(base.parent());
                }
            }
            // Deepest collapses first.
            clderef.sort_by(LogicalLocation::cmp_deeper_first);
        }

        if ctx.is_coordinator() {
            for (n, (loc, hint)) in all_ref.iter().enumerate() {
                info!(
                    "refine {n}: location {} {} {} {} (hint {hint})",
                    loc.lx1, loc.lx2, loc.lx3, loc.level
                );
            }
            for (n, loc) in clderef.iter().enumerate() {
                info!(
                    "derefine {n}: location {} {} {} {}",
                    loc.lx1, loc.lx2, loc.lx3, loc.level
                );
            }
        }

        // Step 1: refinement. Split every flagged leaf.
        let mut changed = false;
        for (loc, _) in &all_ref {
            if let Some(node) = self.tree.find_node(*loc) {
                if self.tree.is_leaf(node) {
                    self.tree.split(node, dim);
                    changed = true;
                }
            }
        }

        // Step 2: derefinement. A candidate whose collapse would leave a
        // neighbor two levels finer is deferred to a later cycle.
        for parent in &clderef {
            let jump = self.neighborhood_exceeds(parent, parent.level + 1);
            if !jump && self.tree.collapse(*parent) {
                changed = true;
            }
        }

        if !changed {
            return false;
        }

        // Step 3: costs. Await the cost gather, then carry costs onto the
        // new tree: children split the parent evenly, parents take the sum.
        let my_costs: Vec<f64> = self.blocks.iter().map(|b| b.cost).collect();
        let gathered = self
            .comm()
            .all_gather(bincode::encode_to_vec(&my_costs, cfg).unwrap());
        let mut old_costs: Vec<f64> = Vec::with_capacity(self.nbtotal);
        for bytes in gathered {
            let (mut costs, _): (Vec<f64>, _) = bincode::decode_from_slice(&bytes, cfg).unwrap();
            old_costs.append(&mut costs);
        }
        debug_assert_eq!(old_costs.len(), self.nbtotal);

        let old_loclist = std::mem::take(&mut self.loclist);
        let old_ranklist = std::mem::take(&mut self.ranklist);
        let old_cost_of: HashMap<LogicalLocation, (usize, f64)> = old_loclist
            .iter()
            .enumerate()
            .map(|(gid, loc)| (*loc, (gid, old_costs[gid])))
            .collect();

        let new_loclist = self.tree.enumerate_leaves();
        let nbtotal = new_loclist.len();
        let mut new_costs = Vec::with_capacity(nbtotal);
        for loc in &new_loclist {
            if let Some(&(_, cost)) = old_cost_of.get(loc) {
                new_costs.push(cost);
            } else if let Some(&(_, cost)) = old_cost_of.get(&loc.parent()) {
                new_costs.push(cost / minbl as f64);
            } else {
                let sum: f64 = offsets
                    .iter()
                    .map(|&(i, j, k)| {
                        old_cost_of
                            .get(&loc.child(i, j, k))
                            .map(|&(_, c)| c)
                            .unwrap_or(0.0)
                    })
                    .sum();
                new_costs.push(sum);
            }
        }

        let partition = balance_load(&new_costs, &ctx, self.adaptive);
        let new_gid_of: HashMap<LogicalLocation, usize> = new_loclist
            .iter()
            .enumerate()
            .map(|(gid, loc)| (*loc, gid))
            .collect();

        // Step 4: move block data to its new owners.
        let mut old_blocks: HashMap<LogicalLocation, MeshBlock> = self
            .blocks
            .drain(..)
            .map(|block| (block.loc, block))
            .collect();

        for (loc, block) in &old_blocks {
            if let Some(&gid) = new_gid_of.get(loc) {
                let owner = partition.ranklist[gid];
                if owner != ctx.rank {
                    let bytes = payload_of(block.physics.as_ref());
                    self.mailbox
                        .route_payload(self.comm.as_ref(), owner, gid, 0, bytes);
                }
            } else if new_gid_of.contains_key(&loc.child(0, 0, 0)) {
                // Refined: every child owner needs the parent data.
                for &(i, j, k) in &offsets {
                    let gid = new_gid_of[&loc.child(i, j, k)];
                    let owner = partition.ranklist[gid];
                    if owner != ctx.rank {
                        let bytes = payload_of(block.physics.as_ref());
                        self.mailbox
                            .route_payload(self.comm.as_ref(), owner, gid, 0, bytes);
                    }
                }
            } else {
                // Derefined: the parent owner restricts this octant.
                let gid = new_gid_of[&loc.parent()];
                let owner = partition.ranklist[gid];
                if owner != ctx.rank {
                    let bytes = payload_of(block.physics.as_ref());
                    self.mailbox
                        .route_payload(self.comm.as_ref(), owner, gid, octant_index(loc), bytes);
                }
            }
        }

        // Install the new global lists before building blocks, so extents
        // and neighbor search see the new layout.
        self.loclist = new_loclist;
        self.costlist = new_costs;
        self.ranklist = partition.ranklist;
        self.nslist = partition.nslist;
        self.nblist = partition.nblist;
        self.nbtotal = nbtotal;
        self.nbstart = self.nslist[ctx.rank];
        self.nbend = if ctx.rank + 1 == ctx.nranks {
            nbtotal.saturating_sub(1)
        } else {
            self.nslist[ctx.rank + 1].saturating_sub(1)
        };
        self.current_level = self
            .loclist
            .iter()
            .map(|l| l.level)
            .max()
            .unwrap_or(self.root_level);

        let mut new_blocks = Vec::with_capacity(self.nblist[ctx.rank]);
        for gid in self.nbstart..self.nbstart + self.nblist[ctx.rank] {
            let loc = self.loclist[gid];
            let (size, bcs) = self.block_extents(&loc);
            let lid = gid - self.nbstart;

            let physics = if let Some(&(old_gid, _)) = old_cost_of.get(&loc) {
                if old_ranklist[old_gid] == ctx.rank {
                    // Stayed on this rank: move the state over.
                    old_blocks
                        .remove(&loc)
                        .expect("surviving local block missing")
                        .physics
                } else {
                    let mut physics = factory.create(&size);
                    let bytes =
                        wait_payload(&mut self.mailbox, self.comm.as_ref(), gid, 0);
                    physics
                        .read_payload(&mut bytes.as_slice())
                        .expect("deserializing migrated block payload");
                    physics
                }
            } else if let Some(&(old_gid, _)) = old_cost_of.get(&loc.parent()) {
                // Newly refined child: prolongate from the parent.
                let mut physics = factory.create(&size);
                let octant = loc.octant();
                if old_ranklist[old_gid] == ctx.rank {
                    let parent = &old_blocks[&loc.parent()];
                    physics.prolongate_from(parent.physics.as_ref(), octant);
                } else {
                    let mut parent = factory.create(&size);
                    let bytes =
                        wait_payload(&mut self.mailbox, self.comm.as_ref(), gid, 0);
                    parent
                        .read_payload(&mut bytes.as_slice())
                        .expect("deserializing migrated parent payload");
                    physics.prolongate_from(parent.as_ref(), octant);
                }
                physics
            } else {
                // Newly derefined parent: restrict every child octant.
                let mut physics = factory.create(&size);
                for &(i, j, k) in &offsets {
                    let child_loc = loc.child(i, j, k);
                    let (old_gid, _) = old_cost_of[&child_loc];
                    if old_ranklist[old_gid] == ctx.rank {
                        let child = &old_blocks[&child_loc];
                        physics.restrict_child(child.physics.as_ref(), (i, j, k));
                    } else {
                        let sub = octant_index(&child_loc);
                        let mut child = factory.create(&size);
                        let bytes =
                            wait_payload(&mut self.mailbox, self.comm.as_ref(), gid, sub);
                        child
                            .read_payload(&mut bytes.as_slice())
                            .expect("deserializing migrated child payload");
                        physics.restrict_child(child.as_ref(), (i, j, k));
                    }
                }
                physics
            };

            let mut block = MeshBlock::new(gid, lid, loc, size, bcs, self.multilevel, physics);
            block.cost = self.costlist[gid];
            new_blocks.push(block);
        }
        self.blocks = new_blocks;

        self.reset_neighbors();
        self.initialize(ResFlag::Refined, factory);
        true
    }

    /// True if any leaf adjacent to `loc` (at its level) is finer than
    /// `max_level`, i.e. collapsing `loc` would create a two-level jump.
    fn neighborhood_exceeds(&self, loc: &LogicalLocation, max_level: i32) -> bool {
        for ox3 in -1i64..=1 {
            for ox2 in -1i64..=1 {
                for ox1 in -1i64..=1 {
                    if ox1 == 0 && ox2 == 0 && ox3 == 0 {
                        continue;
                    }
                    let Some(node) = self.tree.find_neighbor(
                        *loc,
                        ox1,
                        ox2,
                        ox3,
                        &self.mesh_bcs,
                        self.nrbx,
                        self.root_level,
                    ) else {
                        continue;
                    };
                    if self.tree.max_level_under(node) > max_level {
                        return true;
                    }
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalComm;
    use crate::config::Config;
    use crate::mesh::BuildMode;
    use crate::physics::AdvectionFactory;

    fn adaptive_config() -> Config {
        Config::from_str(
            r#"
            [time]
            tlim = 1.0
            cfl_number = 0.3

            [mesh]
            nx1 = 32
            nx2 = 32
            nx3 = 1
            x1min = 0.0
            x1max = 1.0
            x2min = 0.0
            x2max = 1.0
            x3min = 0.0
            x3max = 1.0
            ix1_bc = 4
            ox1_bc = 4
            ix2_bc = 4
            ox2_bc = 4
            refinement = "adaptive"
            maxlevel = 3

            [meshblock]
            nx1 = 8
            nx2 = 8
            "#,
        )
        .unwrap()
    }

    fn build() -> (Config, AdvectionFactory, Mesh) {
        let cfg = adaptive_config();
        let factory = AdvectionFactory::default();
        let mut mesh = Mesh::from_config(&cfg, Box::new(LocalComm), &factory, BuildMode::Full)
            .expect("mesh construction");
        mesh.initialize(crate::mesh::ResFlag::Cold, &factory);
        (cfg, factory, mesh)
    }

    #[test]
    fn refinement_splits_flagged_blocks() {
        let (_, factory, mut mesh) = build();
        assert_eq!(mesh.nbtotal, 16);

        mesh.blocks[0].refine_flag = 1;
        assert!(mesh.refine_mesh(&factory));
        assert_eq!(mesh.nbtotal, 19);
        assert_eq!(mesh.current_level, mesh.root_level + 1);

        // Neighbor levels across the new interface differ by exactly one.
        for block in &mesh.blocks {
            for nb in &block.neighbors {
                assert!((nb.level - block.loc.level).abs() <= 1);
            }
        }
    }

    #[test]
    fn incomplete_sibling_groups_are_rejected() {
        let (_, factory, mut mesh) = build();
        mesh.blocks[0].refine_flag = 1;
        mesh.blocks[5].refine_flag = 1;
        mesh.refine_mesh(&factory);
        let nbtotal = mesh.nbtotal;
        let loclist = mesh.loclist.clone();

        // One of four siblings asks to derefine: nothing may change.
        let fine_lid = mesh
            .blocks
            .iter()
            .position(|b| b.loc.level == mesh.root_level + 1)
            .unwrap();
        mesh.blocks[fine_lid].refine_flag = -1;
        assert!(!mesh.refine_mesh(&factory));
        assert_eq!(mesh.nbtotal, nbtotal);
        assert_eq!(mesh.loclist, loclist);
    }

    #[test]
    fn complete_sibling_groups_collapse() {
        let (_, factory, mut mesh) = build();
        mesh.blocks[0].refine_flag = 1;
        mesh.blocks[5].refine_flag = 1;
        mesh.refine_mesh(&factory);
        assert_eq!(mesh.nbtotal, 22);

        // Flag both refined groups completely; both collapse back.
        for block in &mut mesh.blocks {
            if block.loc.level > mesh.root_level {
                block.refine_flag = -1;
            }
        }
        assert!(mesh.refine_mesh(&factory));
        assert_eq!(mesh.nbtotal, 16);
        assert_eq!(mesh.current_level, mesh.root_level);
    }

    #[test]
    fn conserved_totals_survive_a_cycle() {
        let (_, factory, mut mesh) = build();
        let mut before = vec![0.0];
        for block in &mesh.blocks {
            block.physics.accumulate_totals(&mut before);
        }

        mesh.blocks[3].refine_flag = 1;
        mesh.refine_mesh(&factory);

        let mut after = vec![0.0];
        for block in &mesh.blocks {
            block.physics.accumulate_totals(&mut after);
        }
        assert!((before[0] - after[0]).abs() < 1e-10);
    }
}
