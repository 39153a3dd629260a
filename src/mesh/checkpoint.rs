//! Restart codec: the binary layout that lets a run be reconstructed.
//!
//! The file starts with a rank-shared header (block count, root level, mesh
//! extents, boundary tags, time state), then one record per block in global
//! Morton order `{gid, location, cost, payload offset}`, then the per-block
//! payloads at their recorded offsets. All scalars are host-native; the
//! format is not meant to migrate across endianness.

use super::{BuildMode, Mesh, MeshError, ResFlag};
use crate::comm::{Communicator, RankContext};
use crate::config::Config;
use crate::geometry::{BlockTree, BoundaryConds, LogicalLocation, RegionSize};
use crate::mesh::balance::balance_load;
use crate::mesh::block::MeshBlock;
use crate::mesh::neighbors::BufferTable;
use crate::mesh::{Mailbox, MeshGenerators};
use crate::physics::PhysicsFactory;
use log::warn;
use std::io::{Read, Seek, SeekFrom, Write};

/// Encoded length of a [`RegionSize`]: nine reals and three cell counts.
pub const REGION_SIZE_LEN: usize = 9 * 8 + 3 * 4;
/// Encoded length of one block record: gid, location, cost, offset.
pub const RECORD_LEN: usize = 4 + (3 * 8 + 4) + 8 + 8;
/// Encoded length of the file header.
pub const HEADER_LEN: usize = 4 + 4 + REGION_SIZE_LEN + 6 * 4 + 8 + 8 + 4;

fn short_read(what: &str) -> MeshError {
    MeshError::CorruptedRestart(format!("short read at {what}"))
}

fn write_i32(w: &mut dyn Write, v: i32) -> std::io::Result<()> {
    w.write_all(&v.to_ne_bytes())
}

fn write_i64(w: &mut dyn Write, v: i64) -> std::io::Result<()> {
    w.write_all(&v.to_ne_bytes())
}

fn write_u64(w: &mut dyn Write, v: u64) -> std::io::Result<()> {
    w.write_all(&v.to_ne_bytes())
}

fn write_f64(w: &mut dyn Write, v: f64) -> std::io::Result<()> {
    w.write_all(&v.to_ne_bytes())
}

fn read_i32(r: &mut dyn Read) -> std::io::Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_ne_bytes(buf))
}

fn read_i64(r: &mut dyn Read) -> std::io::Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_ne_bytes(buf))
}

fn read_u64(r: &mut dyn Read) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}

fn read_f64(r: &mut dyn Read) -> std::io::Result<f64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_ne_bytes(buf))
}

fn write_region(w: &mut dyn Write, size: &RegionSize) -> std::io::Result<()> {
    for v in [
        size.x1min, size.x2min, size.x3min, size.x1max, size.x2max, size.x3max, size.x1rat,
        size.x2rat, size.x3rat,
    ] {
        write_f64(w, v)?;
    }
    for n in [size.nx1, size.nx2, size.nx3] {
        write_i32(w, n as i32)?;
    }
    Ok(())
}

fn read_region(r: &mut dyn Read) -> std::io::Result<RegionSize> {
    let mut reals = [0.0; 9];
    for v in &mut reals {
        *v = read_f64(r)?;
    }
    let nx1 = read_i32(r)? as usize;
    let nx2 = read_i32(r)? as usize;
    let nx3 = read_i32(r)? as usize;
    Ok(RegionSize {
        x1min: reals[0],
        x2min: reals[1],
        x3min: reals[2],
        x1max: reals[3],
        x2max: reals[4],
        x3max: reals[5],
        x1rat: reals[6],
        x2rat: reals[7],
        x3rat: reals[8],
        nx1,
        nx2,
        nx3,
    })
}

fn write_bcs(w: &mut dyn Write, bcs: &BoundaryConds) -> std::io::Result<()> {
    for code in bcs.codes() {
        write_i32(w, code)?;
    }
    Ok(())
}

fn read_bcs(r: &mut dyn Read) -> Result<BoundaryConds, MeshError> {
    let mut codes = [0i32; 6];
    for code in &mut codes {
        *code = read_i32(r).map_err(|_| short_read("boundary tags"))?;
    }
    BoundaryConds::from_codes(codes)
        .ok_or_else(|| MeshError::CorruptedRestart(format!("unknown boundary tags {codes:?}")))
}

fn write_location(w: &mut dyn Write, loc: &LogicalLocation) -> std::io::Result<()> {
    write_i64(w, loc.lx1)?;
    write_i64(w, loc.lx2)?;
    write_i64(w, loc.lx3)?;
    write_i32(w, loc.level)
}

fn read_location(r: &mut dyn Read) -> std::io::Result<LogicalLocation> {
    let lx1 = read_i64(r)?;
    let lx2 = read_i64(r)?;
    let lx3 = read_i64(r)?;
    let level = read_i32(r)?;
    Ok(LogicalLocation {
        level,
        lx1,
        lx2,
        lx3,
    })
}

impl Mesh {
    /// Byte offset of each block's payload within a restart file.
    fn payload_offsets(&self) -> Vec<u64> {
        // Blocks are homogeneous, so every payload has the same length.
        let record = self
            .blocks
            .first()
            .map(MeshBlock::restart_len)
            .unwrap_or(0) as u64;
        let base = (HEADER_LEN + self.nbtotal * RECORD_LEN) as u64;
        (0..self.nbtotal as u64)
            .map(|gid| base + gid * record)
            .collect()
    }

    /// Writes the restart header, the block records, and this rank's block
    /// payloads at their offsets.
    pub fn write_restart<W: Write + Seek>(&self, file: &mut W) -> Result<(), MeshError> {
        let offsets = self.payload_offsets();

        if self.context().is_coordinator() {
            file.seek(SeekFrom::Start(0))?;
            write_i32(file, self.nbtotal as i32)?;
            write_i32(file, self.root_level)?;
            write_region(file, &self.mesh_size)?;
            write_bcs(file, &self.mesh_bcs)?;
            write_f64(file, self.time)?;
            write_f64(file, self.dt)?;
            write_i32(file, self.ncycle as i32)?;

            for gid in 0..self.nbtotal {
                write_i32(file, gid as i32)?;
                write_location(file, &self.loclist[gid])?;
                write_f64(file, self.costlist[gid])?;
                write_u64(file, offsets[gid])?;
            }
        }

        for block in &self.blocks {
            file.seek(SeekFrom::Start(offsets[block.gid]))?;
            write_region(file, &block.block_size)?;
            write_bcs(file, &block.block_bcs)?;
            block.physics.write_payload(file)?;
        }
        file.flush()?;
        Ok(())
    }

    /// Rebuilds a mesh from a restart file. The tree is recreated leaf by
    /// leaf without refinement, verified against the recorded block count,
    /// repartitioned, and this rank's payloads are read back.
    pub fn from_restart<R: Read + Seek>(
        cfg: &Config,
        file: &mut R,
        comm: Box<dyn Communicator>,
        factory: &dyn PhysicsFactory,
        mode: BuildMode,
    ) -> Result<Self, MeshError> {
        let ctx = match mode {
            BuildMode::Full => comm.context(),
            BuildMode::LayoutOnly { nranks } => RankContext {
                rank: comm.rank(),
                nranks,
            },
        };

        if cfg.mesh.num_threads < 1 {
            return Err(MeshError::Config(format!(
                "number of threads must be >= 1, but num_threads={}",
                cfg.mesh.num_threads
            )));
        }

        file.seek(SeekFrom::Start(0))?;
        let nbtotal = read_i32(file).map_err(|_| short_read("nbtotal"))? as usize;
        let root_level = read_i32(file).map_err(|_| short_read("root_level"))?;
        let mesh_size = read_region(file).map_err(|_| short_read("mesh size"))?;
        let mesh_bcs = read_bcs(file)?;
        let time = read_f64(file).map_err(|_| short_read("time"))?;
        let dt = read_f64(file).map_err(|_| short_read("dt"))?;
        let ncycle = read_i32(file).map_err(|_| short_read("ncycle"))? as i64;

        let max_level = cfg.mesh.maxlevel + root_level - 1;
        let dim = mesh_size.dim();

        if cfg.time.cfl_number > 1.0 && dim == 1 {
            return Err(MeshError::Config(
                "the CFL number must be smaller than 1.0 in 1D simulations".into(),
            ));
        }
        if cfg.time.cfl_number > 0.5 && dim > 1 {
            return Err(MeshError::Config(
                "the CFL number must be smaller than 0.5 in 2D/3D simulations".into(),
            ));
        }

        let bnx1 = cfg.meshblock.nx1.unwrap_or(mesh_size.nx1);
        let bnx2 = cfg.meshblock.nx2.unwrap_or(mesh_size.nx2);
        let bnx3 = cfg.meshblock.nx3.unwrap_or(mesh_size.nx3);
        let nrbx = [
            (mesh_size.nx1 / bnx1) as i64,
            (mesh_size.nx2 / bnx2) as i64,
            (mesh_size.nx3 / bnx3) as i64,
        ];

        let mut loclist = Vec::with_capacity(nbtotal);
        let mut costlist = Vec::with_capacity(nbtotal);
        let mut offsets = Vec::with_capacity(nbtotal);
        let mut multilevel = false;
        let mut current_level = root_level;
        for _ in 0..nbtotal {
            let _gid = read_i32(file).map_err(|_| short_read("block id"))?;
            let loc = read_location(file).map_err(|_| short_read("block location"))?;
            if loc.level != root_level {
                multilevel = true;
            }
            if loc.level > current_level {
                current_level = loc.level;
            }
            let cost = read_f64(file).map_err(|_| short_read("block cost"))?;
            let offset = read_u64(file).map_err(|_| short_read("block offset"))?;
            loclist.push(loc);
            costlist.push(cost);
            offsets.push(offset);
        }

        let adaptive = cfg.adaptive();
        let multilevel = multilevel || adaptive;
        let face_only = !(factory.has_field() || factory.has_viscosity() || multilevel);
        let buffer_table = BufferTable::new(dim, multilevel, face_only);

        let mut tree = BlockTree::new();
        for loc in &loclist {
            tree.add_without_refine(*loc);
        }
        let rebuilt = tree.enumerate_leaves();
        if rebuilt.len() != nbtotal {
            return Err(MeshError::CorruptedRestart(format!(
                "tree reconstruction failed: block totals do not match ({nbtotal} != {})",
                rebuilt.len()
            )));
        }

        if nbtotal < ctx.nranks {
            match mode {
                BuildMode::Full => {
                    return Err(MeshError::Capacity {
                        nbtotal,
                        nranks: ctx.nranks,
                    })
                }
                BuildMode::LayoutOnly { .. } => warn!(
                    "too few blocks: nbtotal ({nbtotal}) < nranks ({nranks})",
                    nranks = ctx.nranks
                ),
            }
        }

        let partition = balance_load(&costlist, &ctx, adaptive);
        let nbstart = partition.nslist[ctx.rank];
        let nbend = if ctx.rank + 1 == ctx.nranks {
            nbtotal.saturating_sub(1)
        } else {
            partition.nslist[ctx.rank + 1].saturating_sub(1)
        };

        let mut mesh = Self {
            mesh_size,
            mesh_bcs,
            nrbx,
            root_level,
            current_level,
            max_level,
            multilevel,
            adaptive,
            face_only,
            start_time: cfg.time.start_time,
            tlim: cfg.time.tlim,
            cfl_number: cfg.time.cfl_number,
            time,
            dt,
            ncycle,
            nlim: cfg.time.nlim,
            num_threads: cfg.mesh.num_threads,
            tree,
            nbtotal,
            loclist,
            costlist,
            ranklist: partition.ranklist,
            nslist: partition.nslist,
            nblist: partition.nblist,
            nbstart,
            nbend,
            buffer_table,
            generators: MeshGenerators::default(),
            blocks: Vec::new(),
            mailbox: Mailbox::default(),
            comm,
        };

        if let BuildMode::LayoutOnly { .. } = mode {
            if ctx.is_coordinator() {
                mesh.mesh_test(dim)?;
            }
            return Ok(mesh);
        }

        for gid in mesh.nbstart..mesh.nbstart + mesh.nblist[ctx.rank] {
            file.seek(SeekFrom::Start(offsets[gid]))?;
            let block_size = read_region(file).map_err(|_| short_read("block size"))?;
            let block_bcs = read_bcs(file)?;
            let mut physics = factory.create(&block_size);
            physics
                .read_payload(file)
                .map_err(|_| short_read("block payload"))?;
            let mut block = MeshBlock::new(
                gid,
                gid - mesh.nbstart,
                mesh.loclist[gid],
                block_size,
                block_bcs,
                mesh.multilevel,
                physics,
            );
            block.cost = mesh.costlist[gid];
            mesh.blocks.push(block);
        }
        mesh.reset_neighbors();

        Ok(mesh)
    }
}

/// Convenience wrapper: write a restart file to disk.
pub fn save_restart(mesh: &Mesh, path: &std::path::Path) -> Result<(), MeshError> {
    let mut file = std::fs::File::create(path)?;
    mesh.write_restart(&mut file)
}

/// Convenience wrapper: reconstruct a mesh from a restart file on disk.
pub fn load_restart(
    cfg: &Config,
    path: &std::path::Path,
    comm: Box<dyn Communicator>,
    factory: &dyn PhysicsFactory,
) -> Result<Mesh, MeshError> {
    let mut file = std::fs::File::open(path)?;
    Mesh::from_restart(cfg, &mut file, comm, factory, BuildMode::Full)
}

impl Mesh {
    /// Runs post-restart initialization (ghost exchange without problem
    /// generation).
    pub fn initialize_from_restart(&mut self, factory: &dyn PhysicsFactory) {
        self.initialize(ResFlag::Restart, factory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalComm;
    use crate::physics::AdvectionFactory;
    use std::io::Cursor;

    fn refined_config() -> Config {
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

            [meshblock]
            nx1 = 8
            nx2 = 8

            [[refinement]]
            x1min = 0.25
            x1max = 0.75
            x2min = 0.25
            x2max = 0.75
            level = 1
            "#,
        )
        .unwrap()
    }

    #[test]
    fn round_trip_preserves_layout_and_payloads() {
        let cfg = refined_config();
        let factory = AdvectionFactory::default();
        let mut mesh = Mesh::from_config(&cfg, Box::new(LocalComm), &factory, BuildMode::Full)
            .expect("mesh construction");
        mesh.initialize(ResFlag::Cold, &factory);

        // 16 root blocks minus the 4 refined ones plus their 16 children.
        assert_eq!(mesh.nbtotal, 28);
        for block in &mesh.blocks {
            for plane in &block.nblevel {
                for row in plane {
                    for &level in row {
                        if level >= 0 {
                            assert!((level - block.loc.level).abs() <= 1);
                        }
                    }
                }
            }
        }

        let mut file = Cursor::new(Vec::new());
        mesh.write_restart(&mut file).expect("restart write");
        let bytes = file.get_ref().clone();

        let rebuilt = Mesh::from_restart(
            &cfg,
            &mut Cursor::new(bytes.clone()),
            Box::new(LocalComm),
            &factory,
            BuildMode::Full,
        )
        .expect("restart read");

        assert_eq!(rebuilt.nbtotal, mesh.nbtotal);
        assert_eq!(rebuilt.loclist, mesh.loclist);
        assert_eq!(rebuilt.costlist, mesh.costlist);
        assert_eq!(rebuilt.ranklist, mesh.ranklist);
        assert_eq!(rebuilt.root_level, mesh.root_level);
        assert_eq!(rebuilt.time, mesh.time);
        assert_eq!(rebuilt.dt, mesh.dt);

        for (a, b) in mesh.blocks.iter().zip(rebuilt.blocks.iter()) {
            assert_eq!(a.block_size, b.block_size);
            assert_eq!(a.block_bcs, b.block_bcs);
            // Neighbor symmetry survives reconstruction.
            assert_eq!(a.neighbors, b.neighbors);
        }

        // Writing the rebuilt mesh reproduces the file byte for byte.
        let mut again = Cursor::new(Vec::new());
        rebuilt.write_restart(&mut again).expect("restart rewrite");
        assert_eq!(again.get_ref(), &bytes);
    }

    #[test]
    fn truncated_files_are_rejected() {
        let cfg = refined_config();
        let factory = AdvectionFactory::default();
        let mesh = Mesh::from_config(&cfg, Box::new(LocalComm), &factory, BuildMode::Full)
            .expect("mesh construction");

        let mut file = Cursor::new(Vec::new());
        mesh.write_restart(&mut file).expect("restart write");
        let bytes = file.get_ref().clone();

        for cut in [3, HEADER_LEN - 1, HEADER_LEN + RECORD_LEN / 2, bytes.len() - 8] {
            let result = Mesh::from_restart(
                &cfg,
                &mut Cursor::new(bytes[..cut].to_vec()),
                Box::new(LocalComm),
                &factory,
                BuildMode::Full,
            );
            match result {
                Err(MeshError::CorruptedRestart(_)) | Err(MeshError::Io(_)) => {}
                other => panic!("expected corruption error, got {:?}", other.map(|_| ())),
            }
        }
    }
}
