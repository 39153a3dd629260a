//! The process-wide mesh: owner of the block tree, the global block metadata
//! lists, the blocks local to this rank, and the time/step state.
//!
//! Construction either yields a fully valid mesh or an error; once built, the
//! global lists (`loclist`, `costlist`, `ranklist`, `nslist`, `nblist`) are
//! only rewritten by the refinement cycle. Boundary data between local blocks
//! moves through a mailbox keyed by `(destination gid, target buffer id)`;
//! off-rank data takes the same key through the communicator.

pub mod balance;
pub mod block;
pub mod checkpoint;
pub mod neighbors;
pub mod refine;

pub use block::MeshBlock;

use crate::comm::{frame, Communicator, RankContext, TAG_P2P};
use crate::config::Config;
use crate::geometry::{BlockTree, BoundaryConds, BoundaryTag, Face, LogicalLocation, RegionSize};
use crate::physics::PhysicsFactory;
use crate::task::{
    receive_boundary_buffers, send_boundary_buffers, StepContext, TaskList, TaskListStatus,
};
use balance::balance_load;
use log::{info, warn};
use neighbors::{search_and_set_neighbors, BufferTable};
use std::collections::{HashMap, VecDeque};
use std::io::Write as _;
use thiserror::Error;

/// Construction and runtime failures of the mesh core.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("invalid mesh configuration: {0}")]
    Config(String),
    #[error("too few blocks: nbtotal ({nbtotal}) < nranks ({nranks})")]
    Capacity { nbtotal: usize, nranks: usize },
    #[error("the restart file is broken: {0}")]
    CorruptedRestart(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn config_err<T>(msg: impl Into<String>) -> Result<T, MeshError> {
    Err(MeshError::Config(msg.into()))
}

/// Why ghost zones are being (re)initialized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResFlag {
    /// Cold start: run the problem generator first.
    Cold,
    /// Restarted from a checkpoint: state is already loaded.
    Restart,
    /// The refinement cycle rebuilt the block list.
    Refined,
}

/// Maps a fractional position `r` in `[0, 1]` along one axis of the root
/// domain to a physical coordinate. Monotonically increasing in `r`.
pub type MeshGenerator = fn(f64, &RegionSize) -> f64;

fn stretched(r: f64, min: f64, max: f64, rat: f64, nx: usize) -> f64 {
    let lw;
    let rw;
    if rat == 1.0 {
        rw = r;
        lw = 1.0 - r;
    } else {
        let ratn = rat.powi(nx as i32);
        let rnx = rat.powf(r * nx as f64);
        lw = (rnx - ratn) / (1.0 - ratn);
        rw = 1.0 - lw;
    }
    min * lw + max * rw
}

pub fn default_generator_x1(r: f64, size: &RegionSize) -> f64 {
    stretched(r, size.x1min, size.x1max, size.x1rat, size.nx1)
}

pub fn default_generator_x2(r: f64, size: &RegionSize) -> f64 {
    stretched(r, size.x2min, size.x2max, size.x2rat, size.nx2)
}

pub fn default_generator_x3(r: f64, size: &RegionSize) -> f64 {
    stretched(r, size.x3min, size.x3max, size.x3rat, size.nx3)
}

/// The coordinate mappings used to place block edges within the root domain.
#[derive(Clone, Copy)]
pub struct MeshGenerators {
    pub x1: MeshGenerator,
    pub x2: MeshGenerator,
    pub x3: MeshGenerator,
}

impl Default for MeshGenerators {
    fn default() -> Self {
        Self {
            x1: default_generator_x1,
            x2: default_generator_x2,
            x3: default_generator_x3,
        }
    }
}

/// How far construction should go.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildMode {
    /// Build the local blocks and stand ready to run.
    Full,
    /// Stop after partitioning and log the layout; `nranks` overrides the
    /// communicator size so partitions can be inspected without MPI.
    LayoutOnly { nranks: usize },
}

/// Point-to-point traffic between ranks.
#[derive(bincode::Encode, bincode::Decode)]
enum P2pMsg {
    Boundary {
        gid: u64,
        bufid: u32,
        data: Vec<f64>,
    },
    Payload {
        gid: u64,
        sub: u8,
        bytes: Vec<u8>,
    },
}

/// Routes boundary buffers and migrated block payloads to their owners.
/// Every slot has exactly one writer and one reader per exchange; slots
/// queue in arrival order so a peer that is already one exchange ahead
/// cannot clobber data the receiver has not consumed yet.
#[derive(Default)]
pub struct Mailbox {
    boundary: HashMap<(usize, usize), VecDeque<Vec<f64>>>,
    payloads: HashMap<(usize, u8), Vec<u8>>,
}

impl Mailbox {
    /// Delivers one boundary buffer, locally or through the communicator.
    pub fn route(
        &mut self,
        comm: &dyn Communicator,
        rank: usize,
        gid: usize,
        bufid: usize,
        data: Vec<f64>,
    ) {
        if rank == comm.rank() {
            self.boundary.entry((gid, bufid)).or_default().push_back(data);
        } else {
            let msg = P2pMsg::Boundary {
                gid: gid as u64,
                bufid: bufid as u32,
                data,
            };
            let bytes = bincode::encode_to_vec(&msg, bincode::config::standard())
                .expect("encoding boundary message");
            comm.send(rank, frame(TAG_P2P, bytes));
        }
    }

    /// Delivers a serialized block payload to its new owner. `sub`
    /// disambiguates the up-to-2^dim pieces feeding a derefined parent.
    pub fn route_payload(
        &mut self,
        comm: &dyn Communicator,
        rank: usize,
        gid: usize,
        sub: u8,
        bytes: Vec<u8>,
    ) {
        if rank == comm.rank() {
            self.payloads.insert((gid, sub), bytes);
        } else {
            let msg = P2pMsg::Payload {
                gid: gid as u64,
                sub,
                bytes,
            };
            let bytes = bincode::encode_to_vec(&msg, bincode::config::standard())
                .expect("encoding payload message");
            comm.send(rank, frame(TAG_P2P, bytes));
        }
    }

    pub fn take(&mut self, gid: usize, bufid: usize) -> Option<Vec<f64>> {
        self.boundary.get_mut(&(gid, bufid)).and_then(VecDeque::pop_front)
    }

    pub fn take_payload(&mut self, gid: usize, sub: u8) -> Option<Vec<u8>> {
        self.payloads.remove(&(gid, sub))
    }

    fn deliver(&mut self, bytes: Vec<u8>) {
        let (msg, _): (P2pMsg, _) = bincode::decode_from_slice(&bytes, bincode::config::standard())
            .expect("decoding point-to-point message");
        match msg {
            P2pMsg::Boundary { gid, bufid, data } => {
                self.boundary
                    .entry((gid as usize, bufid as usize))
                    .or_default()
                    .push_back(data);
            }
            P2pMsg::Payload { gid, sub, bytes } => {
                self.payloads.insert((gid as usize, sub), bytes);
            }
        }
    }

    /// Drains everything currently queued on the communicator.
    pub fn pump(&mut self, comm: &dyn Communicator) {
        while let Some(bytes) = comm.try_recv_tagged(TAG_P2P) {
            self.deliver(bytes);
        }
    }

    /// Blocks for one more point-to-point message.
    pub fn pump_blocking(&mut self, comm: &dyn Communicator) {
        let bytes = comm.recv_tagged(TAG_P2P);
        self.deliver(bytes);
    }

    pub fn clear(&mut self) {
        self.boundary.clear();
        self.payloads.clear();
    }
}

/// The process-wide mesh state.
pub struct Mesh {
    pub mesh_size: RegionSize,
    pub mesh_bcs: BoundaryConds,
    pub nrbx: [i64; 3],
    pub root_level: i32,
    pub current_level: i32,
    pub max_level: i32,
    pub multilevel: bool,
    pub adaptive: bool,
    pub face_only: bool,

    pub start_time: f64,
    pub tlim: f64,
    pub cfl_number: f64,
    pub time: f64,
    pub dt: f64,
    pub ncycle: i64,
    pub nlim: i64,
    pub num_threads: usize,

    pub tree: BlockTree,
    pub nbtotal: usize,
    pub loclist: Vec<LogicalLocation>,
    pub costlist: Vec<f64>,
    pub ranklist: Vec<usize>,
    pub nslist: Vec<usize>,
    pub nblist: Vec<usize>,
    pub nbstart: usize,
    pub nbend: usize,

    pub buffer_table: BufferTable,
    pub generators: MeshGenerators,
    pub blocks: Vec<MeshBlock>,

    pub(crate) mailbox: Mailbox,
    comm: Box<dyn Communicator>,
}

impl Mesh {
    /// Builds a fresh mesh from the input configuration.
    pub fn from_config(
        cfg: &Config,
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
            return config_err(format!(
                "number of threads must be >= 1, but num_threads={}",
                cfg.mesh.num_threads
            ));
        }
        if cfg.mesh.nx1 < 4 {
            return config_err(format!("nx1 must be >= 4, but nx1={}", cfg.mesh.nx1));
        }
        if cfg.mesh.nx2 < 1 || cfg.mesh.nx3 < 1 {
            return config_err("nx2 and nx3 must be >= 1");
        }
        if cfg.mesh.nx2 == 1 && cfg.mesh.nx3 > 1 {
            return config_err(format!(
                "nx2=1, nx3={}: 2D problems in the x1-x3 plane are not supported",
                cfg.mesh.nx3
            ));
        }

        let dim = 1 + (cfg.mesh.nx2 > 1) as usize + (cfg.mesh.nx3 > 1) as usize;

        if cfg.time.cfl_number > 1.0 && dim == 1 {
            return config_err("the CFL number must be smaller than 1.0 in 1D simulations");
        }
        if cfg.time.cfl_number > 0.5 && dim > 1 {
            return config_err("the CFL number must be smaller than 0.5 in 2D/3D simulations");
        }

        let mesh_size = RegionSize {
            x1min: cfg.mesh.x1min,
            x2min: cfg.mesh.x2min,
            x3min: cfg.mesh.x3min,
            x1max: cfg.mesh.x1max,
            x2max: cfg.mesh.x2max,
            x3max: cfg.mesh.x3max,
            x1rat: cfg.mesh.x1rat,
            x2rat: cfg.mesh.x2rat,
            x3rat: cfg.mesh.x3rat,
            nx1: cfg.mesh.nx1,
            nx2: cfg.mesh.nx2,
            nx3: cfg.mesh.nx3,
        };

        for (axis, (min, max)) in [
            (mesh_size.x1min, mesh_size.x1max),
            (mesh_size.x2min, mesh_size.x2max),
            (mesh_size.x3min, mesh_size.x3max),
        ]
        .into_iter()
        .enumerate()
        {
            if max <= min {
                return config_err(format!(
                    "x{d}max must be larger than x{d}min: {min} >= {max}",
                    d = axis + 1
                ));
            }
        }
        for (axis, rat) in [mesh_size.x1rat, mesh_size.x2rat, mesh_size.x3rat]
            .into_iter()
            .enumerate()
        {
            if (rat - 1.0).abs() > 0.1 {
                return config_err(format!(
                    "cell size ratio must satisfy 0.9 <= x{}rat <= 1.1, got {rat}",
                    axis + 1
                ));
            }
        }

        let mesh_bcs = parse_mesh_bcs(cfg)?;

        // Block cell counts default to the whole mesh per axis.
        let bnx1 = cfg.meshblock.nx1.unwrap_or(mesh_size.nx1);
        let bnx2 = if dim >= 2 {
            cfg.meshblock.nx2.unwrap_or(mesh_size.nx2)
        } else {
            mesh_size.nx2
        };
        let bnx3 = if dim == 3 {
            cfg.meshblock.nx3.unwrap_or(mesh_size.nx3)
        } else {
            mesh_size.nx3
        };

        if mesh_size.nx1 % bnx1 != 0 || mesh_size.nx2 % bnx2 != 0 || mesh_size.nx3 % bnx3 != 0 {
            return config_err("the mesh must be evenly divisible by the meshblock");
        }
        if bnx1 < 4 || (bnx2 < 4 && dim >= 2) || (bnx3 < 4 && dim == 3) {
            return config_err("the meshblock must be at least 4 cells on every active axis");
        }

        let nrbx = [
            (mesh_size.nx1 / bnx1) as i64,
            (mesh_size.nx2 / bnx2) as i64,
            (mesh_size.nx3 / bnx3) as i64,
        ];
        let nbmax = nrbx.iter().copied().max().unwrap();
        let mut root_level = 0;
        while (1i64 << root_level) < nbmax {
            root_level += 1;
        }

        if ctx.is_coordinator() {
            info!("root grid = {} x {} x {}", nrbx[0], nrbx[1], nrbx[2]);
        }

        let mut tree = BlockTree::new();
        tree.create_root(nrbx, root_level);

        let adaptive = cfg.adaptive();
        let mut multilevel = adaptive;
        let mut current_level = root_level;
        let max_level = if adaptive {
            let max_level = cfg.mesh.maxlevel + root_level - 1;
            if max_level > 63 {
                return config_err(format!(
                    "the maximum refinement level must be smaller than {}",
                    63 - root_level + 1
                ));
            }
            max_level
        } else {
            63
        };

        let generators = MeshGenerators::default();

        for region in &cfg.refinements {
            let ref_size = RegionSize {
                x1min: region.x1min,
                x1max: region.x1max,
                x2min: region.x2min.unwrap_or(mesh_size.x2min),
                x2max: region.x2max.unwrap_or(mesh_size.x2max),
                x3min: region.x3min.unwrap_or(mesh_size.x3min),
                x3max: region.x3max.unwrap_or(mesh_size.x3max),
                ..mesh_size
            };
            if dim >= 2 && (region.x2min.is_none() != region.x2max.is_none()) {
                return config_err("refinement region x2 extents must be given together");
            }
            let ref_lev = region.level;
            let lrlev = ref_lev + root_level;
            if lrlev > current_level {
                current_level = lrlev;
            }
            if lrlev != root_level {
                multilevel = true;
            }
            if ref_lev < 1 {
                return config_err("refinement level must be larger than 0 (root level = 0)");
            }
            if lrlev > max_level {
                return config_err(
                    "refinement level exceeds the maximum level \
                     (specify maxlevel in [mesh] if adaptive)",
                );
            }
            if ref_size.x1min > ref_size.x1max
                || ref_size.x2min > ref_size.x2max
                || ref_size.x3min > ref_size.x3max
            {
                return config_err("invalid refinement region");
            }
            if ref_size.x1min < mesh_size.x1min
                || ref_size.x1max > mesh_size.x1max
                || ref_size.x2min < mesh_size.x2min
                || ref_size.x2max > mesh_size.x2max
                || ref_size.x3min < mesh_size.x3min
                || ref_size.x3max > mesh_size.x3max
            {
                return config_err("refinement region must be smaller than the whole mesh");
            }

            // Find the logical index range covering the region at ref_lev,
            // snapped so every added block has a complete sibling set.
            let logical_range = |gen: MeshGenerator, nrbx_d: i64, lo: f64, hi: f64| {
                let lxmax = nrbx_d * (1i64 << ref_lev);
                let mut lmin = 0;
                while lmin < lxmax {
                    if gen((lmin + 1) as f64 / lxmax as f64, &mesh_size) > lo {
                        break;
                    }
                    lmin += 1;
                }
                let mut lmax = lmin;
                while lmax < lxmax {
                    if gen((lmax + 1) as f64 / lxmax as f64, &mesh_size) >= hi {
                        break;
                    }
                    lmax += 1;
                }
                if lmin % 2 == 1 {
                    lmin -= 1;
                }
                if lmax % 2 == 0 {
                    lmax += 1;
                }
                (lmin, lmax)
            };

            let (lx1min, lx1max) =
                logical_range(generators.x1, nrbx[0], ref_size.x1min, ref_size.x1max);
            let (lx2min, lx2max) = if dim >= 2 {
                logical_range(generators.x2, nrbx[1], ref_size.x2min, ref_size.x2max)
            } else {
                (0, 0)
            };
            let (lx3min, lx3max) = if dim == 3 {
                logical_range(generators.x3, nrbx[2], ref_size.x3min, ref_size.x3max)
            } else {
                (0, 0)
            };

            if ctx.is_coordinator() {
                info!(
                    "refinement: logical level = {lrlev}, lx1 = {lx1min}..{lx1max}, \
                     lx2 = {lx2min}..{lx2max}, lx3 = {lx3min}..{lx3max}"
                );
            }

            let mut k = lx3min;
            loop {
                let mut j = lx2min;
                loop {
                    let mut i = lx1min;
                    while i < lx1max {
                        tree.add_leaf(LogicalLocation::new(lrlev, i, j, k), dim);
                        i += 2;
                    }
                    j += 2;
                    if dim < 2 || j >= lx2max {
                        break;
                    }
                }
                k += 2;
                if dim < 3 || k >= lx3max {
                    break;
                }
            }
        }

        if multilevel
            && (bnx1 % 2 == 1 || (bnx2 % 2 == 1 && bnx2 > 1) || (bnx3 % 2 == 1 && bnx3 > 1))
        {
            return config_err(
                "the meshblock size must be divisible by 2 to use static or adaptive refinement",
            );
        }

        let face_only = !(factory.has_field() || factory.has_viscosity() || multilevel);
        let buffer_table = BufferTable::new(dim, multilevel, face_only);

        let loclist = tree.enumerate_leaves();
        let nbtotal = loclist.len();

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

        let costlist = vec![1.0; nbtotal];
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
            time: cfg.time.start_time,
            dt: f64::MAX * 0.4,
            ncycle: 0,
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
            generators,
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

        mesh.build_local_blocks(factory);
        Ok(mesh)
    }

    pub fn context(&self) -> RankContext {
        self.comm.context()
    }

    pub fn dim(&self) -> usize {
        self.mesh_size.dim()
    }

    /// Cell counts of a single block, identical for every block.
    pub fn block_cells(&self) -> [usize; 3] {
        [
            self.mesh_size.nx1 / self.nrbx[0] as usize,
            self.mesh_size.nx2 / self.nrbx[1] as usize,
            self.mesh_size.nx3 / self.nrbx[2] as usize,
        ]
    }

    /// Number of blocks owned by this rank.
    pub fn nblocal(&self) -> usize {
        self.nblist[self.comm.rank()]
    }

    /// Physical extents and face tags of the block at `loc`. Domain-edge
    /// faces inherit the mesh boundary; interior faces are internal.
    pub fn block_extents(&self, loc: &LogicalLocation) -> (RegionSize, BoundaryConds) {
        let cells = self.block_cells();
        let mut size = RegionSize {
            nx1: cells[0],
            nx2: cells[1],
            nx3: cells[2],
            ..self.mesh_size
        };
        let mut bcs = self.mesh_bcs;

        let shift = loc.level - self.root_level;
        let gens = [self.generators.x1, self.generators.x2, self.generators.x3];
        let lxs = [loc.lx1, loc.lx2, loc.lx3];
        let dim = self.dim();

        for axis in 0..3 {
            if axis >= dim {
                // Unused axis: the block spans the whole mesh.
                continue;
            }
            let (inner, outer) = (Face::inner(axis), Face::outer(axis));
            let nrbx_l = self.nrbx[axis] << shift;
            let lx = lxs[axis];

            if lx == 0 {
                set_axis_min(&mut size, axis, mesh_min(&self.mesh_size, axis));
                bcs[inner] = self.mesh_bcs[inner];
            } else {
                let rx = lx as f64 / nrbx_l as f64;
                set_axis_min(&mut size, axis, (gens[axis])(rx, &self.mesh_size));
                bcs[inner] = BoundaryTag::Internal;
            }

            if lx == nrbx_l - 1 {
                set_axis_max(&mut size, axis, mesh_max(&self.mesh_size, axis));
                bcs[outer] = self.mesh_bcs[outer];
            } else {
                let rx = (lx + 1) as f64 / nrbx_l as f64;
                set_axis_max(&mut size, axis, (gens[axis])(rx, &self.mesh_size));
                bcs[outer] = BoundaryTag::Internal;
            }
        }

        (size, bcs)
    }

    /// Creates the blocks this rank owns and wires their neighbor tables.
    pub(crate) fn build_local_blocks(&mut self, factory: &dyn PhysicsFactory) {
        self.blocks.clear();
        let rank = self.comm.rank();
        for gid in self.nbstart..self.nbstart + self.nblist[rank] {
            let loc = self.loclist[gid];
            let (size, bcs) = self.block_extents(&loc);
            let physics = factory.create(&size);
            let mut block = MeshBlock::new(
                gid,
                gid - self.nbstart,
                loc,
                size,
                bcs,
                self.multilevel,
                physics,
            );
            block.cost = self.costlist[gid];
            search_and_set_neighbors(
                &mut block,
                &self.tree,
                &self.buffer_table,
                &self.ranklist,
                &self.nslist,
                self.nrbx,
                self.root_level,
                self.face_only,
            );
            self.blocks.push(block);
        }
    }

    /// Recomputes every local block's neighbor table against the current
    /// tree and partition.
    pub(crate) fn reset_neighbors(&mut self) {
        for block in &mut self.blocks {
            search_and_set_neighbors(
                block,
                &self.tree,
                &self.buffer_table,
                &self.ranklist,
                &self.nslist,
                self.nrbx,
                self.root_level,
                self.face_only,
            );
        }
    }

    /// Prepares all blocks for the main loop or after a refinement cycle:
    /// problem generation on cold starts, one full ghost exchange, physical
    /// boundaries, primitive recovery, and the initial timestep.
    pub fn initialize(&mut self, res: ResFlag, factory: &dyn PhysicsFactory) {
        if res == ResFlag::Cold {
            for block in &mut self.blocks {
                let size = block.block_size;
                factory.problem_init(block.physics.as_mut(), &size);
            }
        }

        for block in &mut self.blocks {
            block.arm_receives();
        }

        let (blocks, mailbox, comm) = (&mut self.blocks, &mut self.mailbox, self.comm.as_ref());
        let mut ctx = StepContext {
            mailbox,
            comm,
            time: self.time,
            dt: self.dt,
        };
        for block in blocks.iter() {
            send_boundary_buffers(block, &mut ctx);
        }

        // Receive with wait: sweep until every local block consumed all of
        // its slots, blocking on the network only when something is missing.
        loop {
            let mut missing = false;
            for block in blocks.iter_mut() {
                if !receive_boundary_buffers(block, &mut ctx) {
                    missing = true;
                }
            }
            if !missing {
                break;
            }
            assert!(
                comm.size() > 1,
                "boundary exchange stalled with no peers to wait on"
            );
            ctx.mailbox.pump_blocking(comm);
        }

        for block in blocks.iter_mut() {
            block.clear_receives();
            block.physics.conserved_to_primitive();
            let bcs = block.block_bcs;
            block.physics.apply_physical_boundaries(&bcs);
        }

        if res != ResFlag::Restart {
            for block in self.blocks.iter_mut() {
                block.new_block_dt = block.physics.min_dt();
            }
            self.new_time_step();
        }
    }

    /// Drives every local block through the task list until all complete.
    pub fn update_one_step(&mut self, tlist: &TaskList) {
        for block in &mut self.blocks {
            block.tasks.reset(tlist.ntasks());
            block.arm_receives();
        }

        let (blocks, mailbox, comm) = (&mut self.blocks, &mut self.mailbox, self.comm.as_ref());
        let mut ctx = StepContext {
            mailbox,
            comm,
            time: self.time,
            dt: self.dt,
        };

        let mut done = vec![false; blocks.len()];
        let mut remaining = blocks.len();
        while remaining > 0 {
            let before: usize = blocks.iter().map(|b| b.tasks.num_tasks_todo).sum();
            for (i, block) in blocks.iter_mut().enumerate() {
                if done[i] {
                    continue;
                }
                ctx.pump();
                if tlist.do_one_task(block, &mut ctx) == TaskListStatus::Complete {
                    done[i] = true;
                    remaining -= 1;
                }
            }
            let after: usize = blocks.iter().map(|b| b.tasks.num_tasks_todo).sum();
            if remaining > 0 && after == before {
                // Every runnable task is waiting on a buffer; it can only be
                // in flight from another rank.
                assert!(
                    comm.size() > 1,
                    "task engine stalled with no peers to wait on"
                );
                ctx.mailbox.pump_blocking(comm);
            }
        }

        for block in blocks.iter_mut() {
            block.clear_receives();
        }
    }

    /// Advances the global clock after a completed step.
    pub fn advance_cycle(&mut self) {
        self.time += self.dt;
        self.ncycle += 1;
    }

    /// Min-reduces the per-block CFL proposals into the next global `dt`,
    /// clamped against doubling and the end of the run.
    pub fn new_time_step(&mut self) {
        let mut min_dt = f64::MAX * 0.4;
        for block in &self.blocks {
            min_dt = min_dt.min(block.new_block_dt);
        }
        let min_dt = self.comm.all_reduce_min_f64(min_dt);
        self.dt = (min_dt * self.cfl_number).min(2.0 * self.dt);
        if self.time < self.tlim && self.tlim - self.time < self.dt {
            self.dt = self.tlim - self.time;
        }
    }

    /// Total cell count over all blocks, for performance accounting.
    pub fn total_cells(&self) -> u64 {
        let cells = self.block_cells();
        self.nbtotal as u64 * cells[0] as u64 * cells[1] as u64 * cells[2] as u64
    }

    /// Sums the volume-weighted conserved variables over every rank and logs
    /// the totals on the coordinator.
    pub fn test_conservation(&self) {
        let ncons = self
            .blocks
            .first()
            .map(|b| b.physics.num_conserved())
            .unwrap_or(0);
        let mut totals = vec![0.0; ncons];
        for block in &self.blocks {
            block.physics.accumulate_totals(&mut totals);
        }
        let totals = self.comm.all_reduce_sum_f64(&totals);
        if self.context().is_coordinator() {
            info!("total conservative: {totals:?}");
        }
    }

    /// Finds the local block with the given global id.
    pub fn find_block(&mut self, gid: usize) -> Option<&mut MeshBlock> {
        self.blocks.iter_mut().find(|b| b.gid == gid)
    }

    /// Logs the mesh structure and dumps plot-friendly block outlines to
    /// `meshtest.dat` in 2D and 3D.
    pub fn mesh_test(&self, dim: usize) -> Result<(), MeshError> {
        info!("logical level of the physical root grid = {}", self.root_level);
        info!("logical level of maximum refinement = {}", self.current_level);

        let mut file = if dim >= 2 {
            Some(std::fs::File::create("meshtest.dat")?)
        } else {
            None
        };

        let mut mincost = f64::MAX;
        let mut maxcost = 0.0f64;
        let mut totalcost = 0.0;
        let mut per_level = HashMap::new();
        for level in self.root_level..=self.current_level {
            for gid in 0..self.nbtotal {
                let loc = self.loclist[gid];
                if loc.level != level {
                    continue;
                }
                info!(
                    "block {gid}, lx1 = {}, lx2 = {}, lx3 = {}, logical level = {}, \
                     physical level = {}, cost = {}, rank = {}",
                    loc.lx1,
                    loc.lx2,
                    loc.lx3,
                    loc.level,
                    loc.level - self.root_level,
                    self.costlist[gid],
                    self.ranklist[gid]
                );
                mincost = mincost.min(self.costlist[gid]);
                maxcost = maxcost.max(self.costlist[gid]);
                totalcost += self.costlist[gid];
                *per_level.entry(level).or_insert(0usize) += 1;

                if let Some(file) = &mut file {
                    let dx = 1.0 / (1i64 << level) as f64;
                    let (x, y) = (loc.lx1 as f64 * dx, loc.lx2 as f64 * dx);
                    writeln!(file, "#block {gid} at {} {} {} {}", loc.lx1, loc.lx2, loc.lx3, level)?;
                    for (px, py) in [
                        (x, y),
                        (x + dx, y),
                        (x + dx, y + dx),
                        (x, y + dx),
                        (x, y),
                    ] {
                        writeln!(file, "{px:.6} {py:.6} {} {}", level, self.ranklist[gid])?;
                    }
                    writeln!(file)?;
                }
            }
        }

        for level in self.root_level..=self.current_level {
            if let Some(count) = per_level.get(&level) {
                info!(
                    "level {} (logical level {level}): {count} blocks",
                    level - self.root_level
                );
            }
        }
        info!("total: {} blocks", self.nbtotal);
        info!(
            "load balance: min cost = {mincost}, max cost = {maxcost}, avg cost = {}",
            totalcost / self.nbtotal as f64
        );
        for rank in 0..self.nslist.len() {
            let cost: f64 = (self.nslist[rank]..self.nslist[rank] + self.nblist[rank])
                .map(|gid| self.costlist[gid])
                .sum();
            info!("rank {rank}: {} blocks, cost = {cost}", self.nblist[rank]);
        }
        Ok(())
    }

    pub(crate) fn comm(&self) -> &dyn Communicator {
        self.comm.as_ref()
    }
}

fn parse_mesh_bcs(cfg: &Config) -> Result<BoundaryConds, MeshError> {
    let codes = [
        cfg.mesh.ix1_bc,
        cfg.mesh.ox1_bc,
        cfg.mesh.ix2_bc,
        cfg.mesh.ox2_bc,
        cfg.mesh.ix3_bc,
        cfg.mesh.ox3_bc,
    ];
    let mut tags = [BoundaryTag::Outflow; 6];
    for (slot, code) in tags.iter_mut().zip(codes) {
        *slot = BoundaryTag::from_code(code)
            .ok_or_else(|| MeshError::Config(format!("unknown boundary tag {code}")))?;
    }
    Ok(BoundaryConds::from_tags(tags))
}

fn mesh_min(size: &RegionSize, axis: usize) -> f64 {
    [size.x1min, size.x2min, size.x3min][axis]
}

fn mesh_max(size: &RegionSize, axis: usize) -> f64 {
    [size.x1max, size.x2max, size.x3max][axis]
}

fn set_axis_min(size: &mut RegionSize, axis: usize, value: f64) {
    match axis {
        0 => size.x1min = value,
        1 => size.x2min = value,
        _ => size.x3min = value,
    }
}

fn set_axis_max(size: &mut RegionSize, axis: usize, value: f64) {
    match axis {
        0 => size.x1max = value,
        1 => size.x2max = value,
        _ => size.x3max = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalComm;
    use crate::physics::AdvectionFactory;

    fn uniform_3d(with_field: bool) -> (Config, AdvectionFactory, Mesh) {
        let cfg = Config::from_str(
            r#"
            [time]
            tlim = 1.0
            cfl_number = 0.3

            [mesh]
            nx1 = 16
            nx2 = 16
            nx3 = 16
            x1min = -0.5
            x1max = 0.5
            x2min = -0.5
            x2max = 0.5
            x3min = -0.5
            x3max = 0.5
            ix1_bc = 4
            ox1_bc = 4
            ix2_bc = 4
            ox2_bc = 4
            ix3_bc = 4
            ox3_bc = 4

            [meshblock]
            nx1 = 8
            nx2 = 8
            nx3 = 8
            "#,
        )
        .unwrap();
        let factory = AdvectionFactory {
            with_field,
            velocity: [1.0, 0.5, 0.25],
            ..AdvectionFactory::default()
        };
        let mesh = Mesh::from_config(&cfg, Box::new(LocalComm), &factory, BuildMode::Full)
            .expect("mesh construction");
        (cfg, factory, mesh)
    }

    #[test]
    fn uniform_grid_layout() {
        let (_, _, mesh) = uniform_3d(false);
        assert_eq!(mesh.nbtotal, 8);
        assert_eq!(mesh.root_level, 1);
        assert!(!mesh.multilevel);
        assert!(mesh.face_only);
        assert_eq!(mesh.total_cells(), 16 * 16 * 16);
        // Face-only periodic: exactly six face neighbors per block.
        for block in &mesh.blocks {
            assert_eq!(block.neighbors.len(), 6);
        }
    }

    #[test]
    fn field_blocks_see_edges_and_corners() {
        let (_, _, mesh) = uniform_3d(true);
        assert!(!mesh.face_only);
        for block in &mesh.blocks {
            let faces = block
                .neighbors
                .iter()
                .filter(|n| n.kind == neighbors::NeighborKind::Face)
                .count();
            let edges = block
                .neighbors
                .iter()
                .filter(|n| n.kind == neighbors::NeighborKind::Edge)
                .count();
            let corners = block
                .neighbors
                .iter()
                .filter(|n| n.kind == neighbors::NeighborKind::Corner)
                .count();
            assert_eq!((faces, edges, corners), (6, 12, 8));
        }
    }

    #[test]
    fn neighbor_symmetry_and_buffer_density() {
        let (_, _, mesh) = uniform_3d(true);
        for block in &mesh.blocks {
            // Buffer ids form a contiguous prefix of the table.
            let mut bufids: Vec<usize> = block.neighbors.iter().map(|n| n.bufid).collect();
            bufids.sort_unstable();
            assert_eq!(bufids, (0..block.neighbors.len()).collect::<Vec<_>>());

            // If A sees B along d, B sees A along -d.
            for nb in &block.neighbors {
                let peer = &mesh.blocks[nb.lid];
                assert_eq!(peer.gid, nb.gid);
                let back = peer
                    .neighbors
                    .iter()
                    .find(|p| p.gid == block.gid && (p.ox1, p.ox2, p.ox3) == (-nb.ox1, -nb.ox2, -nb.ox3));
                assert!(back.is_some(), "missing reverse neighbor entry");
                // The slot our sends land in is the slot the peer armed.
                assert_eq!(back.unwrap().bufid, nb.targetid);
            }
        }
    }

    #[test]
    fn one_dimensional_grid_and_cfl_rules() {
        let base = r#"
            [time]
            tlim = 1.0
            cfl_number = CFL

            [mesh]
            nx1 = 64
            x1min = 0.0
            x1max = 1.0
            x2min = -0.5
            x2max = 0.5
            x3min = -0.5
            x3max = 0.5

            [meshblock]
            nx1 = 16
            "#;
        let factory = AdvectionFactory::default();

        let cfg = Config::from_str(&base.replace("CFL", "0.8")).unwrap();
        let mesh = Mesh::from_config(&cfg, Box::new(LocalComm), &factory, BuildMode::Full)
            .expect("1D mesh construction");
        assert_eq!(mesh.dim(), 1);
        assert_eq!(mesh.nbtotal, 4);
        // Interior blocks have two face neighbors, domain-edge blocks one.
        assert_eq!(mesh.blocks[0].neighbors.len(), 1);
        assert_eq!(mesh.blocks[1].neighbors.len(), 2);

        let cfg = Config::from_str(&base.replace("CFL", "1.1")).unwrap();
        let err = Mesh::from_config(&cfg, Box::new(LocalComm), &factory, BuildMode::Full);
        assert!(matches!(err, Err(MeshError::Config(_))));
    }

    #[test]
    fn timestep_clamps_against_doubling_and_tlim() {
        let (_, factory, mut mesh) = uniform_3d(false);
        mesh.initialize(ResFlag::Cold, &factory);
        let dt0 = mesh.dt;
        assert!(dt0 > 0.0 && dt0 < 1.0);

        // A sudden loosening of the CFL bound may at most double dt.
        for block in &mut mesh.blocks {
            block.new_block_dt = 1e6;
        }
        mesh.new_time_step();
        assert!(mesh.dt <= 2.0 * dt0 + 1e-15);

        // Approaching the end of the run, dt shrinks to land on tlim.
        mesh.time = mesh.tlim - 0.5 * mesh.dt;
        mesh.new_time_step();
        assert!(mesh.time + mesh.dt <= mesh.tlim + 1e-15);
    }

    #[test]
    fn one_step_conserves_on_a_periodic_domain() {
        let (_, factory, mut mesh) = uniform_3d(false);
        mesh.initialize(ResFlag::Cold, &factory);

        let mut before = vec![0.0];
        for block in &mesh.blocks {
            block.physics.accumulate_totals(&mut before);
        }

        let tlist = TaskList::fluid_step();
        mesh.update_one_step(&tlist);
        mesh.advance_cycle();
        mesh.new_time_step();

        assert_eq!(mesh.ncycle, 1);
        assert!(mesh.time > 0.0);
        for block in &mesh.blocks {
            assert!(block.tasks.is_complete());
        }

        let mut after = vec![0.0];
        for block in &mesh.blocks {
            block.physics.accumulate_totals(&mut after);
        }
        // Upwind advection on a periodic domain moves mass, never makes it.
        assert!((before[0] - after[0]).abs() < 1e-12 * before[0].abs().max(1.0));
    }

    #[test]
    fn layout_test_mode_skips_block_creation() {
        let cfg = Config::from_str(
            r#"
            [time]
            tlim = 1.0
            cfl_number = 0.3

            [mesh]
            nx1 = 64
            x1min = 0.0
            x1max = 1.0
            x2min = -0.5
            x2max = 0.5
            x3min = -0.5
            x3max = 0.5

            [meshblock]
            nx1 = 16
            "#,
        )
        .unwrap();
        let factory = AdvectionFactory::default();
        let mesh = Mesh::from_config(
            &cfg,
            Box::new(LocalComm),
            &factory,
            BuildMode::LayoutOnly { nranks: 3 },
        )
        .expect("layout test");
        assert!(mesh.blocks.is_empty());
        assert_eq!(mesh.nblist.iter().sum::<usize>(), 4);
        assert_eq!(mesh.nblist, [1, 1, 2]);
    }
}
