//! The per-step task list and its per-block bookkeeping.
//!
//! A task list is a flat sequence of small state-machine steps, each guarded
//! by a dependency mask over the ids of earlier tasks. Each block carries a
//! 256-bit done set (four 64-bit words), the index of its first unfinished
//! task, and a countdown; re-entry after a suspension is just a rescan from
//! `first_task`. A task that cannot make progress (typically: an incoming
//! boundary buffer has not arrived) returns [`TaskOutcome::NotReady`] and is
//! retried on a later round.

use crate::comm::Communicator;
use crate::mesh::block::MeshBlock;
use crate::mesh::Mailbox;
use crate::physics::ExchangeInfo;
use bitvec::prelude::*;

/// Done-set of one block: four 64-bit words.
pub type TaskFlags = BitArr!(for 256, in u64);

/// Per-block task progress, reset at the top of every step.
#[derive(Clone, Debug, Default)]
pub struct TaskState {
    pub first_task: usize,
    pub num_tasks_todo: usize,
    pub finished: TaskFlags,
}

impl TaskState {
    pub fn reset(&mut self, ntasks: usize) {
        self.first_task = 0;
        self.num_tasks_todo = ntasks;
        self.finished = TaskFlags::ZERO;
    }

    pub fn is_complete(&self) -> bool {
        self.num_tasks_todo == 0
    }
}

/// Result of attempting one task body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Ran to completion; yield control back to the engine.
    Success,
    /// Ran to completion; keep scanning this block's list in the same call.
    Next,
    /// Could not run yet (awaiting a boundary buffer); retry later.
    NotReady,
}

/// Progress of a whole block through its task list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskListStatus {
    Running,
    Complete,
}

/// Mesh-level state handed to every task body: the boundary mailbox, the
/// communicator for off-rank traffic, and the step's time window.
pub struct StepContext<'a> {
    pub mailbox: &'a mut Mailbox,
    pub comm: &'a dyn Communicator,
    pub time: f64,
    pub dt: f64,
}

impl StepContext<'_> {
    /// Drains any point-to-point traffic that has arrived into the mailbox.
    pub fn pump(&mut self) {
        self.mailbox.pump(self.comm);
    }
}

type TaskFn = Box<dyn Fn(&mut MeshBlock, &mut StepContext) -> TaskOutcome>;

pub struct Task {
    pub name: &'static str,
    /// Bit position in the done set.
    pub id: usize,
    pub deps: TaskFlags,
    func: TaskFn,
}

/// An ordered collection of interdependent tasks, shared by all blocks.
#[derive(Default)]
pub struct TaskList {
    tasks: Vec<Task>,
}

impl TaskList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ntasks(&self) -> usize {
        self.tasks.len()
    }

    /// Appends a task depending on the given earlier task ids; returns the
    /// new task's id.
    pub fn add(
        &mut self,
        name: &'static str,
        deps: &[usize],
        func: impl Fn(&mut MeshBlock, &mut StepContext) -> TaskOutcome + 'static,
    ) -> usize {
        let id = self.tasks.len();
        assert!(id < 256, "task list exceeds the 256-bit done set");
        let mut mask = TaskFlags::ZERO;
        for &dep in deps {
            assert!(dep < id, "tasks may only depend on earlier tasks");
            mask.set(dep, true);
        }
        self.tasks.push(Task {
            name,
            id,
            deps: mask,
            func: Box::new(func),
        });
        id
    }

    /// Runs at most one ready task of `block`. Mirrors the cooperative
    /// re-entry contract: scan from `first_task`, skip finished tasks and
    /// tasks with unmet dependencies, stop after the first success.
    pub fn do_one_task(&self, block: &mut MeshBlock, ctx: &mut StepContext) -> TaskListStatus {
        if block.tasks.num_tasks_todo == 0 {
            return TaskListStatus::Complete;
        }

        let mut i = block.tasks.first_task;
        while i < self.tasks.len() {
            let task = &self.tasks[i];
            let ready = !block.tasks.finished[task.id]
                && task.deps.iter_ones().all(|dep| block.tasks.finished[dep]);
            if ready {
                let outcome = (task.func)(block, ctx);
                if outcome != TaskOutcome::NotReady {
                    block.tasks.finished.set(task.id, true);
                    block.tasks.num_tasks_todo -= 1;
                    while block.tasks.first_task < self.tasks.len()
                        && block.tasks.finished[self.tasks[block.tasks.first_task].id]
                    {
                        block.tasks.first_task += 1;
                    }
                    if block.tasks.num_tasks_todo == 0 {
                        return TaskListStatus::Complete;
                    }
                    if outcome == TaskOutcome::Success {
                        return TaskListStatus::Running;
                    }
                }
            }
            i += 1;
        }
        TaskListStatus::Running
    }

    /// The standard single-stage fluid step: exchange boundaries, fill
    /// physical ghosts, advance, and propose the next timestep.
    pub fn fluid_step() -> Self {
        let mut list = Self::new();
        let send = list.add("send_boundaries", &[], |block, ctx| {
            send_boundary_buffers(block, ctx);
            TaskOutcome::Success
        });
        let recv = list.add("recv_boundaries", &[send], |block, ctx| {
            if receive_boundary_buffers(block, ctx) {
                TaskOutcome::Next
            } else {
                TaskOutcome::NotReady
            }
        });
        let phys = list.add("physical_boundaries", &[recv], |block, _| {
            let bcs = block.block_bcs;
            block.physics.apply_physical_boundaries(&bcs);
            TaskOutcome::Next
        });
        let advance = list.add("advance", &[phys], |block, ctx| {
            block.physics.advance(ctx.dt);
            TaskOutcome::Next
        });
        let prim = list.add("primitives", &[advance], |block, _| {
            block.physics.conserved_to_primitive();
            TaskOutcome::Next
        });
        list.add("new_block_dt", &[prim], |block, _| {
            block.new_block_dt = block.physics.min_dt();
            TaskOutcome::Success
        });
        list
    }
}

/// Exchange geometry for data flowing from `block` toward neighbor `nb`.
pub fn exchange_for_send(
    block: &MeshBlock,
    nb: &crate::mesh::neighbors::NeighborBlock,
) -> ExchangeInfo {
    let delta = nb.level - block.loc.level;
    let (fi1, fi2) = if delta < 0 {
        // Receiver is coarser: our octant within it picks the half-extents.
        let octant = [
            (block.loc.lx1 & 1) as i32,
            (block.loc.lx2 & 1) as i32,
            (block.loc.lx3 & 1) as i32,
        ];
        let mut tangential = (0..3).filter(|&a| [nb.ox1, nb.ox2, nb.ox3][a] == 0);
        let fi1 = tangential.next().map(|a| octant[a]).unwrap_or(0);
        let fi2 = tangential.next().map(|a| octant[a]).unwrap_or(0);
        (fi1, fi2)
    } else {
        (nb.fi1, nb.fi2)
    };
    ExchangeInfo {
        ox1: nb.ox1,
        ox2: nb.ox2,
        ox3: nb.ox3,
        level_delta: delta,
        fi1,
        fi2,
    }
}

/// Exchange geometry for data arriving at `block` from neighbor `nb`.
pub fn exchange_for_recv(
    block: &MeshBlock,
    nb: &crate::mesh::neighbors::NeighborBlock,
) -> ExchangeInfo {
    ExchangeInfo {
        ox1: nb.ox1,
        ox2: nb.ox2,
        ox3: nb.ox3,
        level_delta: nb.level - block.loc.level,
        fi1: nb.fi1,
        fi2: nb.fi2,
    }
}

/// Packs and routes one buffer per neighbor: locally into the mailbox,
/// remotely through the communicator.
pub fn send_boundary_buffers(block: &MeshBlock, ctx: &mut StepContext) {
    for nb in &block.neighbors {
        let info = exchange_for_send(block, nb);
        let data = block.physics.pack_boundary(&info);
        ctx.mailbox
            .route(ctx.comm, nb.rank, nb.gid, nb.targetid, data);
    }
}

/// Unpacks every buffer that has arrived; true once all slots are consumed.
pub fn receive_boundary_buffers(block: &mut MeshBlock, ctx: &mut StepContext) -> bool {
    ctx.pump();
    let mut all = true;
    for slot in 0..block.neighbors.len() {
        if block.recv_done[slot] {
            continue;
        }
        let nb = block.neighbors[slot];
        match ctx.mailbox.take(block.gid, nb.bufid) {
            Some(data) => {
                let info = exchange_for_recv(block, &nb);
                block.physics.unpack_boundary(&info, &data);
                block.recv_done[slot] = true;
            }
            None => all = false,
        }
    }
    all
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_masks_reject_forward_edges() {
        let mut list = TaskList::new();
        let a = list.add("a", &[], |_, _| TaskOutcome::Success);
        let b = list.add("b", &[a], |_, _| TaskOutcome::Success);
        assert_eq!(list.ntasks(), 2);
        assert!(list.tasks[b].deps[a]);
    }
}
