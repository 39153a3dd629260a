//! Interface for a group of ranks that exchange messages over some transport.
//!
//! The mesh never talks to MPI directly: everything goes through
//! [`Communicator`], whose primitive operations are a nonblocking send and a
//! blocking (or polling) receive of byte buffers. Collectives are built on
//! top as binomial trees, so any transport that implements the primitives
//! gets the reductions and gathers for free. [`LocalComm`] is the degenerate
//! single-rank case; [`channel_cluster`] builds an in-process group over
//! channels for exercising multi-rank paths in tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Frame tag for collective traffic.
pub const TAG_COLLECTIVE: u8 = 1;
/// Frame tag for point-to-point mesh traffic (boundary buffers, migrations).
pub const TAG_P2P: u8 = 2;

/// Prepends the frame tag to a payload.
pub fn frame(tag: u8, mut payload: Vec<u8>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 1);
    buf.push(tag);
    buf.append(&mut payload);
    buf
}

/// Identifies this process within the communicator group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RankContext {
    pub rank: usize,
    pub nranks: usize,
}

impl RankContext {
    pub fn serial() -> Self {
        Self { rank: 0, nranks: 1 }
    }

    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }
}

fn ceil_log2(p: usize) -> usize {
    debug_assert!(p >= 1);
    (usize::BITS - (p - 1).leading_zeros()) as usize
}

/// A group of processes that can exchange messages. The transport can in
/// principle be MPI, TCP, or in-process channels; the mesh only requires that
/// sends return immediately and that every sent message is eventually
/// received exactly once by its destination rank.
pub trait Communicator {
    /// Rank of this process within the group.
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// Sends a message to a peer without blocking.
    fn send(&self, rank: usize, message: Vec<u8>);

    /// Receives a message from any peer, blocking until one is available.
    fn recv(&self) -> Vec<u8>;

    /// Receives a message if one is already available.
    fn try_recv(&self) -> Option<Vec<u8>>;

    /// Requeues a received message that is not yet wanted.
    fn requeue_recv(&self, message: Vec<u8>);

    fn context(&self) -> RankContext {
        RankContext {
            rank: self.rank(),
            nranks: self.size(),
        }
    }

    /// Blocks until a frame with the wanted tag arrives; anything else is
    /// requeued in arrival order.
    fn recv_tagged(&self, want: u8) -> Vec<u8> {
        loop {
            let msg = self.recv();
            if msg.first() == Some(&want) {
                return msg[1..].to_vec();
            }
            self.requeue_recv(msg);
        }
    }

    /// Polls for a frame with the wanted tag, scanning everything currently
    /// queued at most once.
    fn try_recv_tagged(&self, want: u8) -> Option<Vec<u8>> {
        let mut skipped = Vec::new();
        let mut found = None;
        while let Some(msg) = self.try_recv() {
            if msg.first() == Some(&want) {
                found = Some(msg[1..].to_vec());
                break;
            }
            skipped.push(msg);
        }
        for msg in skipped {
            self.requeue_recv(msg);
        }
        found
    }

    /// Binomial-tree broadcast from rank 0. The buffer must be `Some` on the
    /// root and `None` elsewhere.
    fn broadcast(&self, value: Option<Vec<u8>>) -> Vec<u8> {
        let r = self.rank();
        let p = self.size();
        if p == 1 {
            return value.expect("broadcast root must supply a value");
        }

        let value = match value {
            Some(value) => value,
            None => self.recv_tagged(TAG_COLLECTIVE),
        };
        for level in (0..ceil_log2(p)).rev() {
            let one = 1 << level;
            let two = 1 << (level + 1);
            if r % two == 0 && r + one < p {
                self.send(r + one, frame(TAG_COLLECTIVE, value.clone()));
            }
        }
        value
    }

    /// Binomial-tree reduction over a commutative operator. Every rank
    /// returns `None` except rank 0.
    fn reduce(&self, f: &dyn Fn(Vec<u8>, Vec<u8>) -> Vec<u8>, mut value: Vec<u8>) -> Option<Vec<u8>> {
        let r = self.rank();
        let p = self.size();
        if p == 1 {
            return Some(value);
        }

        for level in 0..ceil_log2(p) {
            let one = 1 << level;
            let two = 1 << (level + 1);
            if r % two == 0 {
                if r + one < p {
                    value = f(value, self.recv_tagged(TAG_COLLECTIVE));
                }
            } else {
                self.send(r - one, frame(TAG_COLLECTIVE, value));
                return None;
            }
        }
        Some(value)
    }

    /// All-reduce: reduce to rank 0, then broadcast the result.
    fn all_reduce(&self, f: &dyn Fn(Vec<u8>, Vec<u8>) -> Vec<u8>, value: Vec<u8>) -> Vec<u8> {
        match self.reduce(f, value) {
            Some(value) => self.broadcast(Some(value)),
            None => self.broadcast(None),
        }
    }

    /// Gathers one byte buffer per rank, returned in rank order everywhere.
    fn all_gather(&self, value: Vec<u8>) -> Vec<Vec<u8>> {
        let cfg = bincode::config::standard();
        let mine: Vec<(u32, Vec<u8>)> = vec![(self.rank() as u32, value)];
        let mine = bincode::encode_to_vec(&mine, cfg).expect("encoding gather entry");

        let merge = |a: Vec<u8>, b: Vec<u8>| -> Vec<u8> {
            let (mut xs, _): (Vec<(u32, Vec<u8>)>, _) =
                bincode::decode_from_slice(&a, cfg).expect("decoding gather entries");
            let (ys, _): (Vec<(u32, Vec<u8>)>, _) =
                bincode::decode_from_slice(&b, cfg).expect("decoding gather entries");
            xs.extend(ys);
            bincode::encode_to_vec(&xs, cfg).expect("encoding gather entries")
        };

        let merged = self.all_reduce(&merge, mine);
        let (mut entries, _): (Vec<(u32, Vec<u8>)>, _) =
            bincode::decode_from_slice(&merged, cfg).expect("decoding gathered entries");
        entries.sort_by_key(|(rank, _)| *rank);
        entries.into_iter().map(|(_, bytes)| bytes).collect()
    }

    /// All-reduce minimum of a scalar.
    fn all_reduce_min_f64(&self, value: f64) -> f64 {
        let bytes = self.all_reduce(
            &|a, b| {
                let x = f64::from_le_bytes(a.try_into().unwrap());
                let y = f64::from_le_bytes(b.try_into().unwrap());
                x.min(y).to_le_bytes().to_vec()
            },
            value.to_le_bytes().to_vec(),
        );
        f64::from_le_bytes(bytes.try_into().unwrap())
    }

    /// Elementwise all-reduce sum of a fixed-length vector.
    fn all_reduce_sum_f64(&self, values: &[f64]) -> Vec<f64> {
        let encode = |v: &[f64]| -> Vec<u8> { v.iter().flat_map(|x| x.to_le_bytes()).collect() };
        let decode = |b: &[u8]| -> Vec<f64> {
            b.chunks_exact(8)
                .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
                .collect()
        };
        let bytes = self.all_reduce(
            &|a, b| {
                let x = decode(&a);
                let y = decode(&b);
                encode(&x.iter().zip(&y).map(|(p, q)| p + q).collect::<Vec<_>>())
            },
            encode(values),
        );
        decode(&bytes)
    }
}

/// The single-rank communicator. Send and receive are unreachable because a
/// lone rank has no peers; collectives short-circuit.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalComm;

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn send(&self, _rank: usize, _message: Vec<u8>) {
        unreachable!("a single-rank communicator has no peers to send to")
    }

    fn recv(&self) -> Vec<u8> {
        unreachable!("a single-rank communicator has no peers to receive from")
    }

    fn try_recv(&self) -> Option<Vec<u8>> {
        None
    }

    fn requeue_recv(&self, _message: Vec<u8>) {
        unreachable!("a single-rank communicator never receives")
    }
}

/// In-process communicator backed by channels; one per rank.
pub struct ChannelComm {
    rank: usize,
    peers: Vec<crossbeam_channel::Sender<Vec<u8>>>,
    inbox: crossbeam_channel::Receiver<Vec<u8>>,
    requeued: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

/// Builds an n-rank in-process communicator group.
pub fn channel_cluster(nranks: usize) -> Vec<ChannelComm> {
    let channels: Vec<_> = (0..nranks)
        .map(|_| crossbeam_channel::unbounded())
        .collect();
    let senders: Vec<_> = channels.iter().map(|(tx, _)| tx.clone()).collect();
    channels
        .into_iter()
        .enumerate()
        .map(|(rank, (_, rx))| ChannelComm {
            rank,
            peers: senders.clone(),
            inbox: rx,
            requeued: Arc::new(Mutex::new(VecDeque::new())),
        })
        .collect()
}

impl Communicator for ChannelComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, rank: usize, message: Vec<u8>) {
        self.peers[rank]
            .send(message)
            .expect("peer rank hung up its inbox");
    }

    fn recv(&self) -> Vec<u8> {
        if let Some(msg) = self.requeued.lock().unwrap().pop_front() {
            return msg;
        }
        self.inbox.recv().expect("all peer ranks hung up")
    }

    fn try_recv(&self) -> Option<Vec<u8>> {
        if let Some(msg) = self.requeued.lock().unwrap().pop_front() {
            return Some(msg);
        }
        self.inbox.try_recv().ok()
    }

    fn requeue_recv(&self, message: Vec<u8>) {
        self.requeued.lock().unwrap().push_back(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_collectives_short_circuit() {
        let comm = LocalComm;
        assert_eq!(comm.all_reduce_min_f64(0.25), 0.25);
        assert_eq!(comm.all_reduce_sum_f64(&[1.0, 2.0]), vec![1.0, 2.0]);
        assert_eq!(comm.all_gather(vec![7]), vec![vec![7]]);
    }

    #[test]
    fn channel_cluster_reduces_and_gathers() {
        let comms = channel_cluster(4);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || {
                    let min = comm.all_reduce_min_f64(comm.rank() as f64 + 1.0);
                    let sum = comm.all_reduce_sum_f64(&[1.0, comm.rank() as f64]);
                    let gathered = comm.all_gather(vec![comm.rank() as u8]);
                    (min, sum, gathered)
                })
            })
            .collect();

        for handle in handles {
            let (min, sum, gathered) = handle.join().unwrap();
            assert_eq!(min, 1.0);
            assert_eq!(sum, vec![4.0, 6.0]);
            assert_eq!(gathered, vec![vec![0], vec![1], vec![2], vec![3]]);
        }
    }
}
